//! Supervised connection pools handing out leasable channels.
//!
//! Each pool keeps a fixed number of connections open. Each connection is owned by a
//! _worker_, which opens a fixed number of channels on it and leases them out one holder at a
//! time.
//!
//! This module provides three key guarantees:
//! - A channel is leased to a single holder at a time.
//! - A leased channel is always returned, exactly once, whether its holder checks it in,
//!   completes, fails, panics or is cancelled.
//! - Broken channels are replaced in place, broken connections are replaced by restarting
//!   their worker from scratch.
//!
//! ```rust,no_run
//! use carrot_cake_pool::amqp::{configuration::BrokerSettings, AmqpTransport, ConnectionFactory};
//! use carrot_cake_pool::pool::{ChannelPool, LeaseError};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = BrokerSettings::default();
//!     let transport = AmqpTransport::new(ConnectionFactory::new_from_config(&settings)?);
//!
//!     // 2 connections, 8 channels each.
//!     let pool = ChannelPool::builder(transport)
//!         .workers(2)
//!         .channels_per_worker(8)
//!         .start()
//!         .await?;
//!
//!     // lease a channel, it is returned when `channel` goes out of scope.
//!     match pool.checkout().await {
//!         Ok(_channel) => { /* use the channel */ }
//!         Err(LeaseError::OutOfChannels) => { /* back off and retry */ }
//!         Err(e) => return Err(e.into()),
//!     }
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

mod channel_pool;
mod configuration;
mod error;
mod lease;
mod registry;
mod router;
mod supervisor;
mod worker;

pub use channel_pool::{ChannelPool, ChannelPoolBuilder};
pub use configuration::PoolSettings;
pub use error::{LeaseError, PoolError};
pub use lease::{ChannelId, ChannelLease, LeaseCheckin, LeaseState, LeaseToken};
pub use registry::{PoolId, PoolRegistry};
pub use worker::WorkerId;
