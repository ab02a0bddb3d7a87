use anyhow::bail;
use async_trait::async_trait;
use carrot_cake_pool::pool::{ChannelPool, ChannelPoolBuilder, LeaseState};
use carrot_cake_pool::provisioning::{Binding, ExchangeOptions, QueueOptions};
use carrot_cake_pool::transport::{CloseNotifier, Transport};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An in-memory broker, implementing [`Transport`].
///
/// Clones share the same state: keep one around to inspect what the pool did and to inject
/// failures.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicUsize>,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    rejected_queues: HashSet<String>,
    connections: Vec<Arc<ConnectionState>>,
    channels: Vec<Arc<ChannelState>>,
    exchanges: BTreeSet<String>,
    queues: BTreeSet<String>,
    bindings: BTreeSet<(String, String, String)>,
    /// Every queue declaration, in order.
    declarations: Vec<String>,
}

struct ConnectionState {
    open: AtomicBool,
    on_lost: CloseNotifier,
}

struct ChannelState {
    id: usize,
    open: AtomicBool,
    on_close: CloseNotifier,
    connection: Arc<ConnectionState>,
}

impl ConnectionState {
    fn sever(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.on_lost.notify();
        }
    }
}

pub struct FakeConnection {
    state: Arc<ConnectionState>,
}

impl FakeConnection {
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}

pub struct FakeChannel {
    state: Arc<ChannelState>,
}

impl FakeChannel {
    /// Unique across the broker: a replacement channel never reuses an id.
    pub fn id(&self) -> usize {
        self.state.id
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Simulate a channel-level exception: the broker closes the channel.
    pub fn close_from_broker(&self) {
        self.state.open.store(false, Ordering::SeqCst);
        self.state.on_close.notify();
    }

    /// Drop the connection this channel was opened on.
    pub fn sever_connection(&self) {
        self.state.connection.sever();
    }

    pub fn publish(&self) -> Result<(), anyhow::Error> {
        if !self.is_open() || !self.state.connection.open.load(Ordering::SeqCst) {
            bail!("channel {} is closed", self.id());
        }
        Ok(())
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make new connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connections = refuse;
    }

    /// Make declarations of `queue_name` fail.
    pub fn reject_queue(&self, queue_name: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_queues
            .insert(queue_name.to_owned());
    }

    /// Drop every open connection, as if the broker went away.
    pub fn sever_connections(&self) {
        let connections: Vec<_> = self.state.lock().unwrap().connections.clone();
        for connection in connections {
            connection.sever();
        }
    }

    pub fn open_connections(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn open_channels(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .channels
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn queues(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().queues.clone()
    }

    pub fn exchanges(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().exchanges.clone()
    }

    /// `(queue, exchange, routing key)` triples.
    pub fn bindings(&self) -> BTreeSet<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn declarations(&self) -> Vec<String> {
        self.state.lock().unwrap().declarations.clone()
    }

    fn next_id(&self) -> usize {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeBroker {
    type Connection = FakeConnection;
    type Channel = FakeChannel;

    async fn connect(&self, on_lost: CloseNotifier) -> Result<FakeConnection, anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connections {
            bail!("connection refused");
        }
        let connection = Arc::new(ConnectionState {
            open: AtomicBool::new(true),
            on_lost,
        });
        state.connections.push(Arc::clone(&connection));
        Ok(FakeConnection { state: connection })
    }

    async fn close_connection(&self, connection: &FakeConnection) {
        connection.state.open.store(false, Ordering::SeqCst);
    }

    async fn open_channel(
        &self,
        connection: &FakeConnection,
        on_close: CloseNotifier,
    ) -> Result<FakeChannel, anyhow::Error> {
        if !connection.is_open() {
            bail!("connection is closed");
        }
        let channel = Arc::new(ChannelState {
            id: self.next_id(),
            open: AtomicBool::new(true),
            on_close,
            connection: Arc::clone(&connection.state),
        });
        self.state
            .lock()
            .unwrap()
            .channels
            .push(Arc::clone(&channel));
        Ok(FakeChannel { state: channel })
    }

    async fn close_channel(&self, channel: &FakeChannel) {
        channel.state.open.store(false, Ordering::SeqCst);
    }

    async fn declare_exchange(
        &self,
        channel: &FakeChannel,
        exchange_name: &str,
        _options: &ExchangeOptions,
    ) -> Result<(), anyhow::Error> {
        channel.publish()?;
        self.state
            .lock()
            .unwrap()
            .exchanges
            .insert(exchange_name.to_owned());
        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &FakeChannel,
        queue_name: &str,
        _options: &QueueOptions,
    ) -> Result<(), anyhow::Error> {
        channel.publish()?;
        let mut state = self.state.lock().unwrap();
        if state.rejected_queues.contains(queue_name) {
            bail!("PRECONDITION_FAILED - inequivalent arg for queue '{queue_name}'");
        }
        state.declarations.push(queue_name.to_owned());
        state.queues.insert(queue_name.to_owned());
        Ok(())
    }

    async fn bind_queue(
        &self,
        channel: &FakeChannel,
        queue_name: &str,
        exchange_name: &str,
        binding: &Binding,
    ) -> Result<(), anyhow::Error> {
        channel.publish()?;
        self.state.lock().unwrap().bindings.insert((
            queue_name.to_owned(),
            exchange_name.to_owned(),
            binding.key().to_owned(),
        ));
        Ok(())
    }
}

pub fn pool_builder(broker: &FakeBroker) -> ChannelPoolBuilder<FakeBroker> {
    ChannelPool::builder(broker.clone()).restart_delay(Duration::from_millis(10))
}

pub async fn start_pool(
    broker: &FakeBroker,
    workers: usize,
    channels_per_worker: usize,
) -> ChannelPool<FakeBroker> {
    pool_builder(broker)
        .workers(workers)
        .channels_per_worker(channels_per_worker)
        .start()
        .await
        .unwrap()
}

/// Poll `worker` until `condition` holds, giving up after a couple of seconds.
///
/// Lease returns are asynchronous: they are applied once the worker gets to them.
pub async fn eventually<F>(pool: &ChannelPool<FakeBroker>, worker: usize, condition: F) -> LeaseState
where
    F: Fn(&LeaseState) -> bool,
{
    let mut last = None;
    for _ in 0..200 {
        if let Ok(state) = pool.describe_state(worker).await {
            if condition(&state) {
                return state;
            }
            last = Some(state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker {worker} never reached the expected state, last seen: {last:?}");
}
