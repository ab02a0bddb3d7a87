//! Keeps a fixed number of connection workers alive.
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::worker::{ConnectionWorker, WorkerHandle, WorkerId};
use super::{PoolError, PoolId};
use crate::transport::Transport;

/// One supervised position in a pool.
///
/// It always refers to the worker currently running in the slot, or to nothing while the
/// worker is being (re)started.
pub(crate) struct WorkerSlot<T: Transport> {
    index: usize,
    current: watch::Receiver<Option<WorkerHandle<T>>>,
}

impl<T: Transport> WorkerSlot<T> {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// The running worker, `None` during a restart.
    pub(crate) fn worker(&self) -> Option<WorkerHandle<T>> {
        self.current.borrow().clone()
    }

    pub(crate) fn is_available(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Wait for a worker to be running in the slot.
    ///
    /// Returns `None` if the slot is no longer supervised.
    pub(crate) async fn ready(&self) -> Option<WorkerHandle<T>> {
        let mut current = self.current.clone();
        loop {
            let worker = current.borrow_and_update().clone();
            if worker.is_some() {
                return worker;
            }
            current.changed().await.ok()?;
        }
    }
}

/// Starts one [`ConnectionWorker`] per slot and starts a new one whenever it dies.
///
/// A restarted worker opens a new connection and new channels: leases held on the previous
/// worker are simply lost.
pub(crate) struct PoolSupervisor<T: Transport> {
    slots: Vec<Arc<WorkerSlot<T>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> PoolSupervisor<T> {
    /// Start `n_workers` workers.
    ///
    /// Fails if any of them cannot connect: nothing is left running in that case.
    pub(crate) async fn start(
        pool: &PoolId,
        transport: Arc<T>,
        n_workers: usize,
        n_channels: usize,
        restart_delay: Duration,
    ) -> Result<Self, PoolError> {
        let (shutdown, shutdown_signal) = watch::channel(false);
        let mut slots = Vec::with_capacity(n_workers);
        let mut tasks = Vec::with_capacity(n_workers);
        let mut first_starts = Vec::with_capacity(n_workers);

        for index in 0..n_workers {
            let (publish, current) = watch::channel(None);
            let (started, first_start) = oneshot::channel();
            let supervision = Supervision {
                pool: pool.clone(),
                index,
                transport: Arc::clone(&transport),
                n_channels,
                restart_delay,
                publish,
                shutdown: shutdown_signal.clone(),
            };
            tasks.push(tokio::spawn(supervision.run(started)));
            slots.push(Arc::new(WorkerSlot { index, current }));
            first_starts.push(first_start);
        }

        let supervisor = Self {
            slots,
            shutdown,
            tasks: Mutex::new(tasks),
        };
        for outcome in join_all(first_starts).await {
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!("The worker supervisor stopped before starting a worker"),
            };
            supervisor.shutdown().await;
            return Err(PoolError::Connect(error));
        }
        Ok(supervisor)
    }

    pub(crate) fn slots(&self) -> &[Arc<WorkerSlot<T>>] {
        &self.slots
    }

    /// Stop supervising and shut every worker down.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker supervisor panicked");
            }
        }
    }
}

struct Supervision<T: Transport> {
    pool: PoolId,
    index: usize,
    transport: Arc<T>,
    n_channels: usize,
    restart_delay: Duration,
    publish: watch::Sender<Option<WorkerHandle<T>>>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> Supervision<T> {
    /// Reports the outcome of the first start on `started`: if it fails, supervision ends there.
    /// Afterwards a dead worker is restarted right away, failed restarts are retried every
    /// `restart_delay`.
    #[tracing::instrument(name = "worker_supervisor", skip_all, fields(pool = %self.pool, slot = self.index))]
    async fn run(mut self, started: oneshot::Sender<Result<(), anyhow::Error>>) {
        let mut started = Some(started);
        let mut incarnation = 0;
        loop {
            incarnation += 1;
            let id = WorkerId {
                slot: self.index,
                incarnation,
            };

            let start = ConnectionWorker::start(id, Arc::clone(&self.transport), self.n_channels);
            let outcome = tokio::select! {
                outcome = start => outcome,
                _ = self.shutdown.changed() => return,
            };
            let (worker, mut task) = match outcome {
                Ok(running) => running,
                Err(e) => {
                    if let Some(started) = started.take() {
                        let _ = started.send(Err(e));
                        return;
                    }
                    error!(worker = %id, error = ?e, "failed to restart connection worker");
                    tokio::select! {
                        _ = tokio::time::sleep(self.restart_delay) => continue,
                        _ = self.shutdown.changed() => return,
                    }
                }
            };
            if let Some(started) = started.take() {
                let _ = started.send(Ok(()));
            }
            self.publish.send_replace(Some(worker.clone()));

            let exit = tokio::select! {
                exit = &mut task => exit,
                _ = self.shutdown.changed() => {
                    self.publish.send_replace(None);
                    worker.shutdown();
                    if let Err(e) = (&mut task).await {
                        error!(worker = %id, error = %e, "connection worker panicked while stopping");
                    }
                    return;
                }
            };
            self.publish.send_replace(None);
            match exit {
                Ok(Ok(())) => {
                    info!(worker = %id, "connection worker exited");
                    return;
                }
                Ok(Err(e)) => {
                    warn!(worker = %id, error = ?e, "connection worker terminated, restarting it")
                }
                Err(e) => error!(worker = %id, error = %e, "connection worker panicked, restarting it"),
            }
        }
    }
}
