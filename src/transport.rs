//! The seam between the pool and the client library that speaks to the broker.
use std::fmt;
use std::sync::Arc;

use crate::provisioning::{Binding, ExchangeOptions, QueueOptions};

/// `Transport` defines an interface for types that are capable of creating
/// all the transport primitives used to communicate with the broker - connections and channels -
/// and of running the declarations needed to provision queues.
///
/// The pool never speaks the wire protocol itself: every broker interaction goes through this
/// trait. [`AmqpTransport`](crate::amqp::AmqpTransport) implements it on top of `lapin`.
///
/// # Failure signals
///
/// [`Transport::connect`] and [`Transport::open_channel`] receive a [`CloseNotifier`].
/// Implementations must raise it when the broker closes the connection (or the channel) on its
/// own - e.g. a channel-level exception or a dropped socket.
/// Raising it more than once, or after a close requested by the pool itself, is harmless.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// A live connection to the broker.
    type Connection: Send + Sync + 'static;

    /// A channel multiplexed on a [`Self::Connection`].
    type Channel: Send + Sync + 'static;

    /// Establish a new connection.
    ///
    /// `on_lost` must be raised if the connection is lost after it has been established.
    async fn connect(&self, on_lost: CloseNotifier) -> Result<Self::Connection, anyhow::Error>;

    /// Close a connection. Errors are swallowed: the connection is being discarded anyway.
    async fn close_connection(&self, connection: &Self::Connection);

    /// Open a new channel on `connection`.
    ///
    /// `on_close` must be raised if the broker closes the channel.
    async fn open_channel(
        &self,
        connection: &Self::Connection,
        on_close: CloseNotifier,
    ) -> Result<Self::Channel, anyhow::Error>;

    /// Close a channel. Errors are swallowed.
    async fn close_channel(&self, channel: &Self::Channel);

    /// Declare an exchange, if it does not exist already.
    async fn declare_exchange(
        &self,
        channel: &Self::Channel,
        exchange_name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), anyhow::Error>;

    /// Declare a queue, if it does not exist already.
    async fn declare_queue(
        &self,
        channel: &Self::Channel,
        queue_name: &str,
        options: &QueueOptions,
    ) -> Result<(), anyhow::Error>;

    /// Bind `queue_name` to `exchange_name`.
    async fn bind_queue(
        &self,
        channel: &Self::Channel,
        queue_name: &str,
        exchange_name: &str,
        binding: &Binding,
    ) -> Result<(), anyhow::Error>;
}

/// A callback a [`Transport`] raises when the broker closes a connection or a channel.
#[derive(Clone)]
pub struct CloseNotifier(Arc<dyn Fn() + Send + Sync>);

impl CloseNotifier {
    pub(crate) fn new<F>(notify: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(notify))
    }

    /// Report that the connection (or channel) has been closed.
    pub fn notify(&self) {
        (self.0)()
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseNotifier").finish_non_exhaustive()
    }
}

/// assert it's object safe
type _CHECK = Box<dyn Transport<Connection = (), Channel = ()>>;
