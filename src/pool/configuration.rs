//! Configuration types holding the parameters required to start a pool.
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

use super::channel_pool::{
    ChannelPoolBuilder, DEFAULT_CHANNELS_PER_WORKER, DEFAULT_RESTART_DELAY, DEFAULT_WORKER_COUNT,
};
use super::{ChannelPool, PoolId};
use crate::amqp::configuration::BrokerSettings;
use crate::amqp::{AmqpTransport, ConnectionFactory};
use crate::provisioning::QueueSpec;

#[derive(Debug, Deserialize, Clone)]
/// Configuration to start a [`ChannelPool`] against a RabbitMq broker.
///
/// Every field but `connection` can be omitted to fall back to its default value.
pub struct PoolSettings {
    /// The name of the pool. A random name is used if left unspecified.
    #[serde(default)]
    pub name: Option<String>,
    /// How to connect to the broker.
    #[serde(default)]
    pub connection: BrokerSettings,
    /// How many connections the pool keeps open.
    #[serde(
        default = "default_worker_count",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub worker_count: usize,
    /// How many channels are opened on each connection.
    #[serde(
        default = "default_channels_per_worker",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub channels_per_worker: usize,
    /// How many checkouts, beyond `worker_count`, can be routed concurrently.
    #[serde(default)]
    pub max_overflow: usize,
    /// How long to wait before trying again when a worker fails to restart, in milliseconds.
    #[serde(default = "default_restart_delay_milliseconds")]
    pub restart_delay_milliseconds: u64,
    /// Queues provisioned when the pool starts, in order.
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_channels_per_worker() -> usize {
    DEFAULT_CHANNELS_PER_WORKER
}

fn default_restart_delay_milliseconds() -> u64 {
    DEFAULT_RESTART_DELAY.as_millis() as u64
}

impl PoolSettings {
    pub fn restart_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.restart_delay_milliseconds)
    }

    /// Start building a [`ChannelPool`] talking to RabbitMq with these settings.
    ///
    /// Fails if the connection settings are invalid (e.g. a malformed TLS certificate).
    pub fn builder(&self) -> Result<ChannelPoolBuilder<AmqpTransport>, anyhow::Error> {
        let factory = ConnectionFactory::new_from_config(&self.connection)?;
        Ok(self.configure(ChannelPool::builder(AmqpTransport::new(factory))))
    }

    /// Apply these settings, except the connection ones, to a builder.
    pub fn configure<T>(&self, builder: ChannelPoolBuilder<T>) -> ChannelPoolBuilder<T>
    where
        T: crate::transport::Transport,
    {
        let builder = match &self.name {
            Some(name) => builder.name(PoolId::from(name.as_str())),
            None => builder,
        };
        builder
            .workers(self.worker_count)
            .channels_per_worker(self.channels_per_worker)
            .max_overflow(self.max_overflow)
            .restart_delay(self.restart_delay())
            .queues(self.queues.iter().cloned())
    }
}
