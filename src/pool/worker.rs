//! The actor owning one broker connection and the channels multiplexed on it.
use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::lease::{ChannelId, ChannelLease, LeaseState, LeaseTable, LeaseToken, Reclaim};
use super::LeaseError;
use crate::transport::{CloseNotifier, Transport};

/// Identifies a connection worker: the supervised slot it runs in and how many times the slot
/// has (re)started a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerId {
    pub slot: usize,
    pub incarnation: u64,
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}.{}", self.slot, self.incarnation)
    }
}

/// Everything a connection worker reacts to.
///
/// Requests from callers, lease returns and failure signals all go through the same mailbox
/// and are applied one at a time, in arrival order.
pub(crate) enum Command<T: Transport> {
    Checkout(oneshot::Sender<Result<ChannelLease<T>, LeaseError>>),
    /// Explicit checkin by the holder.
    Checkin(LeaseToken),
    /// The holder let go of its lease, returning, failing or being torn down.
    HolderDown { token: LeaseToken, panicking: bool },
    /// The broker closed a channel.
    ChannelClosed(ChannelId),
    /// The connection to the broker is gone.
    ConnectionLost,
    DescribeState(oneshot::Sender<LeaseState>),
    RawConnection(oneshot::Sender<Arc<T::Connection>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Checkin,
    HolderDown,
}

/// A handle to send requests to a running [`ConnectionWorker`].
///
/// Every request fails with [`LeaseError::ConnectionUnavailable`] once the worker has stopped.
pub(crate) struct WorkerHandle<T: Transport> {
    id: WorkerId,
    mailbox: mpsc::UnboundedSender<Command<T>>,
}

impl<T: Transport> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<T: Transport> WorkerHandle<T> {
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Lease an idle channel. Never waits for a channel to become available.
    pub(crate) async fn checkout(&self) -> Result<ChannelLease<T>, LeaseError> {
        self.request(Command::Checkout).await?
    }

    pub(crate) async fn describe_state(&self) -> Result<LeaseState, LeaseError> {
        self.request(Command::DescribeState).await
    }

    pub(crate) async fn raw_connection(&self) -> Result<Arc<T::Connection>, LeaseError> {
        self.request(Command::RawConnection).await
    }

    /// Ask the worker to close its channels and its connection.
    pub(crate) fn shutdown(&self) {
        let _ = self.mailbox.send(Command::Shutdown);
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command<T>,
    ) -> Result<R, LeaseError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(command(reply))
            .map_err(|_| LeaseError::ConnectionUnavailable)?;
        response.await.map_err(|_| LeaseError::ConnectionUnavailable)
    }
}

/// Owns a broker connection and the fixed set of channels opened on it.
///
/// The worker runs as its own task and is the only place where lease state changes.
/// It stops when asked to shut down (`Ok`) or when the connection is lost (`Err`): a worker
/// never reconnects, its supervisor starts a brand new one instead.
pub(crate) struct ConnectionWorker<T: Transport> {
    id: WorkerId,
    transport: Arc<T>,
    connection: Arc<T::Connection>,
    leases: LeaseTable<T::Channel>,
    mailbox: mpsc::UnboundedReceiver<Command<T>>,
    sender: mpsc::UnboundedSender<Command<T>>,
}

impl<T: Transport> ConnectionWorker<T> {
    /// Connect to the broker, open `n_channels` idle channels and start serving requests.
    pub(crate) async fn start(
        id: WorkerId,
        transport: Arc<T>,
        n_channels: usize,
    ) -> Result<(WorkerHandle<T>, JoinHandle<Result<(), anyhow::Error>>), anyhow::Error> {
        let (sender, mailbox) = mpsc::unbounded_channel();

        let connection = transport
            .connect(connection_lost_notifier(&sender))
            .await
            .context("Failed to connect to the broker")?;

        let mut leases = LeaseTable::default();
        for _ in 0..n_channels {
            let channel_id = ChannelId::new();
            let opened = transport
                .open_channel(&connection, channel_closed_notifier(&sender, channel_id))
                .await;
            match opened {
                Ok(channel) => leases.insert(channel_id, channel),
                Err(e) => {
                    for channel in leases.drain() {
                        transport.close_channel(&channel).await;
                    }
                    transport.close_connection(&connection).await;
                    return Err(e.context("Failed to open a channel"));
                }
            }
        }

        let handle = WorkerHandle {
            id,
            mailbox: sender.clone(),
        };
        let worker = Self {
            id,
            transport,
            connection: Arc::new(connection),
            leases,
            mailbox,
            sender,
        };
        info!(worker = %id, n_channels, "connection worker started");
        Ok((handle, tokio::spawn(worker.run())))
    }

    #[tracing::instrument(name = "connection_worker", skip_all, fields(worker = %self.id))]
    async fn run(mut self) -> Result<(), anyhow::Error> {
        while let Some(command) = self.mailbox.recv().await {
            match command {
                Command::Checkout(reply) => self.checkout(reply),
                Command::Checkin(token) => self.reclaim(token, Signal::Checkin),
                Command::HolderDown { token, panicking } => {
                    if panicking {
                        warn!(channel = %token.channel, "lease holder panicked");
                    }
                    self.reclaim(token, Signal::HolderDown)
                }
                Command::ChannelClosed(channel_id) => {
                    if let Err(e) = self.replace_channel(channel_id).await {
                        self.close().await;
                        return Err(e);
                    }
                }
                Command::DescribeState(reply) => {
                    let _ = reply.send(self.leases.state(self.id));
                }
                Command::RawConnection(reply) => {
                    let _ = reply.send(Arc::clone(&self.connection));
                }
                Command::ConnectionLost => {
                    self.leases.drain();
                    anyhow::bail!("The connection to the broker was lost");
                }
                Command::Shutdown => {
                    self.close().await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn checkout(&mut self, reply: oneshot::Sender<Result<ChannelLease<T>, LeaseError>>) {
        let outcome = match self.leases.checkout() {
            Some(grant) => {
                debug!(channel = %grant.token.channel, "channel leased");
                Ok(ChannelLease::new(grant, self.sender.clone()))
            }
            None => {
                debug!("no idle channel left");
                Err(LeaseError::OutOfChannels)
            }
        };
        // If the caller stopped waiting, the lease is dropped right here and
        // its holder-down signal brings it back.
        let _ = reply.send(outcome);
    }

    fn reclaim(&mut self, token: LeaseToken, signal: Signal) {
        match self.leases.reclaim(token) {
            Reclaim::Reclaimed { held_for } => debug!(
                channel = %token.channel,
                ?signal,
                held_for_ms = held_for.as_millis() as u64,
                "channel reclaimed"
            ),
            Reclaim::AlreadyIdle | Reclaim::Stale => {
                trace!(channel = %token.channel, ?signal, "lease already reclaimed")
            }
        }
    }

    async fn replace_channel(&mut self, channel_id: ChannelId) -> Result<(), anyhow::Error> {
        let Some(discarded) = self.leases.discard(channel_id) else {
            return Ok(());
        };
        warn!(
            channel = %channel_id,
            was_leased = discarded.was_leased,
            "channel closed by the broker, replacing it"
        );
        drop(discarded.channel);

        let replacement = ChannelId::new();
        let channel = self
            .transport
            .open_channel(
                &self.connection,
                channel_closed_notifier(&self.sender, replacement),
            )
            .await
            .context("Failed to open a replacement channel")?;
        self.leases.insert(replacement, channel);
        debug!(channel = %replacement, "replacement channel opened");
        Ok(())
    }

    async fn close(&mut self) {
        for channel in self.leases.drain() {
            self.transport.close_channel(&channel).await;
        }
        self.transport.close_connection(&self.connection).await;
        info!("connection worker stopped");
    }
}

fn connection_lost_notifier<T: Transport>(
    mailbox: &mpsc::UnboundedSender<Command<T>>,
) -> CloseNotifier {
    let mailbox = mailbox.clone();
    CloseNotifier::new(move || {
        let _ = mailbox.send(Command::ConnectionLost);
    })
}

fn channel_closed_notifier<T: Transport>(
    mailbox: &mpsc::UnboundedSender<Command<T>>,
    channel_id: ChannelId,
) -> CloseNotifier {
    let mailbox = mailbox.clone();
    CloseNotifier::new(move || {
        let _ = mailbox.send(Command::ChannelClosed(channel_id));
    })
}
