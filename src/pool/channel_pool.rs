use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::router::{RoutingPool, WorkerRouter};
use super::supervisor::PoolSupervisor;
use super::{ChannelLease, LeaseError, LeaseState, PoolError, PoolId};
use crate::provisioning::{provision, QueueOptions, QueueSpec};
use crate::transport::Transport;

pub(crate) const DEFAULT_WORKER_COUNT: usize = 1;
pub(crate) const DEFAULT_CHANNELS_PER_WORKER: usize = 10;
pub(crate) const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// A pool of supervised broker connections, each one multiplexing a fixed set of channels
/// that callers lease one at a time.
///
/// # Leasing
///
/// [`ChannelPool::with_channel`] is the recommended way to use a channel: it leases one,
/// hands it to your logic and makes sure it is returned whatever happens.
/// [`ChannelPool::checkout`] gives you a [`ChannelLease`] you are responsible for.
///
/// Leasing never waits for a channel to be returned: if the selected connection has no idle
/// channel you get [`LeaseError::OutOfChannels`] straight away.
///
/// # Fault tolerance
///
/// - A channel closed by the broker is replaced, the other channels are untouched.
/// - A lost connection takes down its worker: the worker is restarted with a new connection
///   and a full set of idle channels. In the meantime, checkouts routed to it fail with
///   [`LeaseError::ConnectionUnavailable`].
///
/// # How do I build a `ChannelPool`?
///
/// `ChannelPool` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`ChannelPool::builder`] (or [`PoolSettings::builder`](super::PoolSettings::builder)
/// if you are loading configuration from a file).
pub struct ChannelPool<T: Transport> {
    id: PoolId,
    transport: Arc<T>,
    supervisor: PoolSupervisor<T>,
    router: RoutingPool<T>,
}

impl<T: Transport> ChannelPool<T> {
    /// Start building a [`ChannelPool`] on top of a [`Transport`].
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use carrot_cake_pool::amqp::{configuration::BrokerSettings, AmqpTransport, ConnectionFactory};
    /// use carrot_cake_pool::pool::ChannelPool;
    /// use carrot_cake_pool::provisioning::QueueSpec;
    ///
    /// async fn example() -> anyhow::Result<()> {
    ///     let factory = ConnectionFactory::new_from_config(&BrokerSettings::default())?;
    ///     let pool = ChannelPool::builder(AmqpTransport::new(factory))
    ///         .name("payments")
    ///         .workers(2)
    ///         .channels_per_worker(16)
    ///         .queue(QueueSpec::new("payments.settled", "payments"))
    ///         .start()
    ///         .await?;
    ///
    ///     let channel = pool.checkout().await?;
    ///     # drop(channel);
    ///     Ok(())
    /// }
    /// ```
    pub fn builder(transport: T) -> ChannelPoolBuilder<T> {
        ChannelPoolBuilder::new(transport)
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The number of connection workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.supervisor.slots().len()
    }

    /// Lease a channel from one of the connection workers.
    ///
    /// The channel goes back to the pool when the returned [`ChannelLease`] is dropped.
    pub async fn checkout(&self) -> Result<ChannelLease<T>, LeaseError> {
        let slot = self.router.get().await?;
        let worker = slot.worker().ok_or(LeaseError::ConnectionUnavailable)?;
        worker.checkout().await
    }

    /// Lease a channel, run `body` with it and return `body`'s output.
    ///
    /// `body` gets `Err` if no channel could be leased: nothing needs to be returned in that case.
    /// Otherwise the channel is returned to the pool once `body` is done, whether it completes,
    /// fails, panics or its task is cancelled.
    ///
    /// `body` must not keep the lease around once it is done: the channel is handed out to
    /// other callers as soon as `body` returns.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use carrot_cake_pool::amqp::AmqpTransport;
    /// # use carrot_cake_pool::pool::ChannelPool;
    /// # async fn example(pool: ChannelPool<AmqpTransport>) -> anyhow::Result<()> {
    /// pool.with_channel(|channel| async move {
    ///     let channel = channel?;
    ///     channel
    ///         .basic_publish("", "refunds", Default::default(), b"{}", Default::default())
    ///         .await?;
    ///     Ok::<_, anyhow::Error>(())
    /// })
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_channel<F, Fut, R>(&self, body: F) -> R
    where
        F: FnOnce(Result<ChannelLease<T>, LeaseError>) -> Fut,
        Fut: Future<Output = R>,
    {
        match self.checkout().await {
            Err(e) => body(Err(e)).await,
            Ok(lease) => {
                let checkin = lease.checkin_handle();
                let output = body(Ok(lease)).await;
                checkin.checkin();
                output
            }
        }
    }

    /// The connection of one of the workers, for operations that are not channel-bound.
    pub async fn raw_connection(&self) -> Result<Arc<T::Connection>, LeaseError> {
        let slot = self.router.get().await?;
        let worker = slot.worker().ok_or(LeaseError::ConnectionUnavailable)?;
        worker.raw_connection().await
    }

    /// A snapshot of the leases of the worker running in slot `worker`.
    ///
    /// Fails with [`LeaseError::ConnectionUnavailable`] if `worker` is out of range or the
    /// worker is restarting.
    pub async fn describe_state(&self, worker: usize) -> Result<LeaseState, LeaseError> {
        let worker = self
            .supervisor
            .slots()
            .get(worker)
            .and_then(|slot| slot.worker())
            .ok_or(LeaseError::ConnectionUnavailable)?;
        worker.describe_state().await
    }

    /// Wait until a worker is running in slot `worker` and return a snapshot of its leases.
    pub async fn wait_for_worker(&self, worker: usize) -> Result<LeaseState, LeaseError> {
        let slot = self
            .supervisor
            .slots()
            .get(worker)
            .ok_or(LeaseError::ConnectionUnavailable)?;
        let worker = slot.ready().await.ok_or(LeaseError::ConnectionUnavailable)?;
        worker.describe_state().await
    }

    /// Declare `queue_name`, bind it to `exchange_name` (declared as a durable direct exchange)
    /// using the queue name as routing key.
    ///
    /// No exchange is declared nor binding created if `exchange_name` is the default exchange.
    pub async fn create_queue_with_binding(
        &self,
        queue_name: &str,
        exchange_name: &str,
        options: QueueOptions,
    ) -> Result<(), PoolError> {
        let spec = QueueSpec::new(queue_name, exchange_name).queue_options(options);
        self.provision(std::slice::from_ref(&spec)).await
    }

    /// See [`provision`].
    pub async fn provision(&self, specs: &[QueueSpec]) -> Result<(), PoolError> {
        provision(self, specs).await
    }

    /// Stop all workers, closing their channels and connections.
    ///
    /// Checkouts fail with [`LeaseError::ConnectionUnavailable`] afterwards.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        info!(pool = %self.id, "pool shut down");
    }
}

/// A builder for [`ChannelPool`].
///
/// Use [`ChannelPool::builder`] as entrypoint.
pub struct ChannelPoolBuilder<T: Transport> {
    id: PoolId,
    transport: T,
    worker_count: usize,
    channels_per_worker: usize,
    max_overflow: usize,
    restart_delay: Duration,
    queues: Vec<QueueSpec>,
}

impl<T: Transport> ChannelPoolBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            id: PoolId::random(),
            transport,
            worker_count: DEFAULT_WORKER_COUNT,
            channels_per_worker: DEFAULT_CHANNELS_PER_WORKER,
            max_overflow: 0,
            restart_delay: DEFAULT_RESTART_DELAY,
            queues: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> &PoolId {
        &self.id
    }

    /// The name of the pool. A random one is used if left unspecified.
    #[must_use]
    pub fn name(mut self, id: impl Into<PoolId>) -> Self {
        self.id = id.into();
        self
    }

    /// How many connections the pool keeps open.
    /// Defaults to 1.
    #[must_use]
    pub fn workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// How many channels are opened on each connection.
    /// Defaults to 10.
    #[must_use]
    pub fn channels_per_worker(mut self, channels_per_worker: usize) -> Self {
        self.channels_per_worker = channels_per_worker;
        self
    }

    /// How many checkouts, beyond the number of workers, can be routed concurrently.
    /// Defaults to 0.
    #[must_use]
    pub fn max_overflow(mut self, max_overflow: usize) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    /// How long to wait before trying again when a worker fails to restart.
    /// Defaults to 1 second.
    #[must_use]
    pub fn restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    /// Provision a queue when the pool starts.
    #[must_use]
    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    /// Provision multiple queues when the pool starts, see [`ChannelPoolBuilder::queue`].
    #[must_use]
    pub fn queues<I>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = QueueSpec>,
    {
        self.queues.extend(specs);
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfiguration(
                "a pool needs at least one worker".into(),
            ));
        }
        if self.channels_per_worker == 0 {
            return Err(PoolError::InvalidConfiguration(
                "a worker needs at least one channel".into(),
            ));
        }
        if self.queues.iter().any(|spec| spec.queue_name.is_empty()) {
            return Err(PoolError::InvalidConfiguration(
                "queue names cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Connect the workers and provision the queues.
    ///
    /// The pool is returned only once every worker is connected and every queue has been
    /// provisioned: if anything fails, the workers that were started are shut down.
    #[tracing::instrument(name = "channel_pool_start", skip_all, fields(pool = %self.id))]
    pub async fn start(self) -> Result<ChannelPool<T>, PoolError> {
        self.validate()?;

        let transport = Arc::new(self.transport);
        let supervisor = PoolSupervisor::start(
            &self.id,
            Arc::clone(&transport),
            self.worker_count,
            self.channels_per_worker,
            self.restart_delay,
        )
        .await?;
        let router = match WorkerRouter::new(supervisor.slots().to_vec())
            .into_pool(self.worker_count + self.max_overflow)
        {
            Ok(router) => router,
            Err(e) => {
                supervisor.shutdown().await;
                return Err(e);
            }
        };

        let pool = ChannelPool {
            id: self.id,
            transport,
            supervisor,
            router,
        };
        if let Err(e) = pool.provision(&self.queues).await {
            pool.shutdown().await;
            return Err(e);
        }

        info!(
            pool = %pool.id,
            workers = self.worker_count,
            channels_per_worker = self.channels_per_worker,
            "pool started"
        );
        Ok(pool)
    }
}
