//! `carrot-cake-pool` keeps a supervised pool of RabbitMQ connections, built on top of
//! [`lapin`], and leases out the channels multiplexed on them.
//!
//! [`ChannelPool`](crate::pool::ChannelPool) and [`PoolRegistry`](crate::pool::PoolRegistry)
//! are the best starting points to learn more about what `carrot-cake-pool` provides and how
//! to leverage it.
//!
//! Queues (and the exchanges they are bound to) can be provisioned when a pool starts, see
//! the [`provisioning`] module.

pub mod amqp;
pub mod pool;
pub mod provisioning;
pub mod transport;
