//! Declarative setup of queues, exchanges and bindings.
//!
//! ## Examples of queue/exchange setups
//!
//! ```
//! use carrot_cake_pool::provisioning::{
//!     Binding, ExchangeOptions, ExchangeType, HeadersMatch, QueueOptions, QueueSpec,
//! };
//!
//! // a durable queue that publishers will publish to directly,
//! // no bindings or exchanges required.
//! let direct = QueueSpec::new("refunds", "");
//!
//! // a priority queue bound to a topic exchange
//! let topic = QueueSpec::new("payments", "payments.events")
//!     .exchange_options(ExchangeOptions {
//!         kind: ExchangeType::Topic,
//!         ..ExchangeOptions::default()
//!     })
//!     .queue_options(QueueOptions {
//!         max_priority: Some(10),
//!         ..QueueOptions::default()
//!     })
//!     .binding(Binding::routing_key("payment.*"));
//!
//! // a queue bound to a header exchange when all the headers match
//! let headers = QueueSpec::new("eur.fr", "payments.headers")
//!     .exchange_options(ExchangeOptions {
//!         kind: ExchangeType::Headers,
//!         ..ExchangeOptions::default()
//!     })
//!     .binding(Binding::Headers {
//!         matching: HeadersMatch::All,
//!         headers: vec![
//!             ("currency".to_owned(), "EUR".to_owned()),
//!             ("country".to_owned(), "FR".to_owned()),
//!         ],
//!     });
//! # drop((direct, topic, headers));
//! ```

mod provisioner;
mod queue_spec;

pub use provisioner::provision;
pub use queue_spec::{
    is_default_exchange, Binding, ExchangeOptions, ExchangeType, HeadersMatch, QueueOptions,
    QueueSpec, DEFAULT_EXCHANGE,
};
