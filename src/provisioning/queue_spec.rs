use amq_protocol_types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::ExchangeKind;
use serde::Deserialize;
use std::collections::BTreeMap;

/// The name RabbitMq uses for its pre-declared default exchange.
///
/// Every queue is implicitly bound to it using the queue name as routing key:
/// it cannot be declared and queues cannot be explicitly bound to it.
pub const DEFAULT_EXCHANGE: &str = "";

/// Returns `true` if `exchange_name` refers to the broker's default exchange.
pub fn is_default_exchange(exchange_name: &str) -> bool {
    exchange_name == DEFAULT_EXCHANGE || exchange_name == "amq.default"
}

/// The declaration of a queue, the exchange it is bound to and how.
///
/// A list of `QueueSpec`s is provisioned once, when the pool starts, before the pool is handed
/// out for general traffic - see [`provision`](super::provision).
///
/// # Example
///
/// ```rust
/// use carrot_cake_pool::provisioning::{Binding, ExchangeOptions, ExchangeType, QueueSpec};
///
/// let spec = QueueSpec::new("payments.settled", "payments")
///     .exchange_options(ExchangeOptions {
///         kind: ExchangeType::Topic,
///         ..ExchangeOptions::default()
///     })
///     .binding(Binding::routing_key("payment.settled.*"));
/// # drop(spec);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueSpec {
    /// The name of the queue.
    pub queue_name: String,
    /// The exchange the queue is bound to.
    ///
    /// Leave it empty to rely on the default exchange: no exchange will be declared and no
    /// binding will be created.
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub queue_options: QueueOptions,
    #[serde(default)]
    pub exchange_options: ExchangeOptions,
    /// How the queue is bound to the exchange.
    ///
    /// If left unspecified, the queue name is used as routing key.
    #[serde(default)]
    pub binding: Option<Binding>,
}

impl QueueSpec {
    /// A durable queue bound to a durable direct exchange, using the queue name as routing key.
    pub fn new(queue_name: impl Into<String>, exchange_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            exchange_name: exchange_name.into(),
            queue_options: QueueOptions::default(),
            exchange_options: ExchangeOptions::default(),
            binding: None,
        }
    }

    #[must_use]
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    #[must_use]
    pub fn exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange_options = options;
        self
    }

    #[must_use]
    pub fn binding(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// The binding that will be created, `None` if the queue sits on the default exchange.
    pub fn effective_binding(&self) -> Option<Binding> {
        if is_default_exchange(&self.exchange_name) {
            return None;
        }
        Some(
            self.binding
                .clone()
                .unwrap_or_else(|| Binding::routing_key(self.queue_name.clone())),
        )
    }
}

/// Options used when declaring a queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Enable [priority queue](https://www.rabbitmq.com/priority.html) support, up to this priority.
    ///
    /// Warning: This value is immutable, changing it requires rolling a new queue.
    pub max_priority: Option<u8>,
    /// Name of the [dead letter exchange](https://www.rabbitmq.com/dlx.html) for rejected messages.
    pub dead_letter_exchange: Option<String>,
    /// How long a message can sit in the queue before being discarded, in milliseconds.
    pub message_ttl_milliseconds: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_priority: None,
            dead_letter_exchange: None,
            message_ttl_milliseconds: None,
        }
    }
}

impl QueueOptions {
    /// The `x-` arguments passed along with the queue declaration.
    pub fn arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(priority) = self.max_priority {
            arguments.insert(
                "x-max-priority".into(),
                AMQPValue::ShortShortUInt(priority),
            );
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
        }
        if let Some(ttl) = self.message_ttl_milliseconds {
            arguments.insert(
                "x-message-ttl".into(),
                AMQPValue::LongLongInt(i64::from(ttl)),
            );
        }
        arguments
    }
}

/// The kind of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

/// Options used when declaring an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            kind: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

/// How a queue is bound to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Binding {
    /// Route messages whose routing key matches.
    RoutingKey { routing_key: String },
    /// Route messages using a [header exchange](https://www.rabbitmq.com/tutorials/amqp-concepts.html#exchange-headers).
    ///
    /// The header values are registered as `(Key, Value)` pairs.
    Headers {
        #[serde(default)]
        matching: HeadersMatch,
        headers: Vec<(String, String)>,
    },
}

/// Whether all or any of the headers of a [`Binding::Headers`] must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadersMatch {
    #[default]
    All,
    Any,
}

impl Binding {
    pub fn routing_key(routing_key: impl Into<String>) -> Self {
        Self::RoutingKey {
            routing_key: routing_key.into(),
        }
    }

    /// The routing key of the binding - empty for header bindings.
    pub fn key(&self) -> &str {
        match self {
            Self::RoutingKey { routing_key } => routing_key,
            Self::Headers { .. } => "",
        }
    }

    /// The arguments passed along with the binding.
    pub fn arguments(&self) -> FieldTable {
        match self {
            Self::RoutingKey { .. } => FieldTable::default(),
            Self::Headers { matching, headers } => {
                let match_type = match matching {
                    HeadersMatch::All => LongString::from("all"),
                    HeadersMatch::Any => LongString::from("any"),
                };
                let mut args: BTreeMap<ShortString, AMQPValue> = headers
                    .iter()
                    .cloned()
                    .map(|(key, value)| (key.into(), LongString::from(value).into()))
                    .collect();
                args.insert("x-match".into(), match_type.into());
                args.into()
            }
        }
    }
}
