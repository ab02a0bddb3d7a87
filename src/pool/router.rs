//! Implements [`Manager`] to pick the connection worker serving a checkout.
use deadpool::managed::{self, Manager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::supervisor::WorkerSlot;
use super::{LeaseError, PoolError};
use crate::transport::Transport;

/// The fixed-size pool checkouts go through to get hold of a worker slot.
///
/// A slot is held only for the duration of the checkout request, not for the duration of
/// the lease.
pub(crate) type RoutingPool<T> = deadpool::managed::Pool<WorkerRouter<T>>;

/// `WorkerRouter` implements [`Manager`] over the slots of a pool.
///
/// Pool objects are re-pointed to the next slot, in round-robin order, every time they are
/// handed out, preferring slots with a running worker. If every slot is restarting, recycling
/// fails and the checkout is routed to a restarting slot.
pub(crate) struct WorkerRouter<T: Transport> {
    slots: Vec<Arc<WorkerSlot<T>>>,
    next: AtomicUsize,
}

impl<T: Transport> WorkerRouter<T> {
    pub(crate) fn new(slots: Vec<Arc<WorkerSlot<T>>>) -> Self {
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// Convert into a [`RoutingPool`] handing out at most `max_size` slots concurrently.
    pub(crate) fn into_pool(self, max_size: usize) -> Result<RoutingPool<T>, PoolError> {
        RoutingPool::builder(self)
            .max_size(max_size)
            .build()
            .map_err(|e| PoolError::InvalidConfiguration(format!("{e:?}")))
    }

    fn next_slot(&self) -> Arc<WorkerSlot<T>> {
        let n_slots = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let slot = (0..n_slots)
            .map(|offset| &self.slots[(start + offset) % n_slots])
            .find(|slot| slot.is_available())
            .unwrap_or(&self.slots[start % n_slots]);
        Arc::clone(slot)
    }
}

#[async_trait::async_trait]
impl<T: Transport> Manager for WorkerRouter<T> {
    type Type = Arc<WorkerSlot<T>>;
    type Error = LeaseError;

    async fn create(&self) -> Result<Arc<WorkerSlot<T>>, LeaseError> {
        if self.slots.is_empty() {
            return Err(LeaseError::ConnectionUnavailable);
        }
        Ok(self.next_slot())
    }

    async fn recycle(&self, slot: &mut Arc<WorkerSlot<T>>) -> managed::RecycleResult<LeaseError> {
        *slot = self.next_slot();
        if slot.is_available() {
            Ok(())
        } else {
            Err(managed::RecycleError::Message(format!(
                "Worker slot {} is restarting",
                slot.index()
            )))
        }
    }
}
