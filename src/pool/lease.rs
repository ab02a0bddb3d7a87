//! Lease bookkeeping for the channels of a single connection.
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::worker::{Command, WorkerId};
use crate::transport::Transport;

/// Identifies a channel opened by a connection worker.
///
/// Identifiers are never reused: a channel replaced after a failure gets a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies one grant of a channel to a holder.
///
/// Signals carrying a token are only acted upon while the channel is still leased under the
/// same grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    pub channel: ChannelId,
    grant: u64,
}

/// A snapshot of the leases held by a connection worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LeaseState {
    pub worker: WorkerId,
    /// Channels ready to be leased.
    pub idle: usize,
    /// Channels currently held by a caller.
    pub leased: usize,
    /// How many leases have been reclaimed since the worker started.
    pub reclaimed: u64,
    /// How many channels were closed by the broker and replaced since the worker started.
    pub failed: u64,
}

/// The outcome of a reclamation request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reclaim {
    /// The lease was held under the token's grant and it is now idle.
    Reclaimed { held_for: Duration },
    /// The lease is idle already.
    AlreadyIdle,
    /// The lease has been granted again, or its channel has been discarded.
    Stale,
}

/// A channel removed from the table.
pub(crate) struct Discarded<C> {
    pub(crate) channel: Arc<C>,
    pub(crate) was_leased: bool,
}

/// A channel handed out by [`LeaseTable::checkout`].
pub(crate) struct Grant<C> {
    pub(crate) token: LeaseToken,
    pub(crate) channel: Arc<C>,
}

struct HolderMonitor {
    grant: u64,
    since: Instant,
}

struct Lease<C> {
    id: ChannelId,
    channel: Arc<C>,
    holder: Option<HolderMonitor>,
}

/// The state machine behind a connection worker: every channel is either idle or leased to
/// exactly one holder.
///
/// Not synchronised: it is owned by the worker actor, which applies operations one at a time.
pub(crate) struct LeaseTable<C> {
    leases: Vec<Lease<C>>,
    next_grant: u64,
    reclaimed: u64,
    failed: u64,
}

impl<C> Default for LeaseTable<C> {
    fn default() -> Self {
        Self {
            leases: Vec::new(),
            next_grant: 0,
            reclaimed: 0,
            failed: 0,
        }
    }
}

impl<C> LeaseTable<C> {
    /// Add an idle channel.
    pub(crate) fn insert(&mut self, id: ChannelId, channel: C) {
        self.leases.push(Lease {
            id,
            channel: Arc::new(channel),
            holder: None,
        });
    }

    /// Lease the first idle channel, if any.
    pub(crate) fn checkout(&mut self) -> Option<Grant<C>> {
        let grant = self.next_grant;
        let lease = self.leases.iter_mut().find(|l| l.holder.is_none())?;
        self.next_grant += 1;
        lease.holder = Some(HolderMonitor {
            grant,
            since: Instant::now(),
        });
        Some(Grant {
            token: LeaseToken {
                channel: lease.id,
                grant,
            },
            channel: Arc::clone(&lease.channel),
        })
    }

    /// Mark the lease behind `token` as idle.
    ///
    /// Idempotent: reclaiming an idle lease, a lease granted again since `token` was issued or a
    /// discarded channel does nothing.
    pub(crate) fn reclaim(&mut self, token: LeaseToken) -> Reclaim {
        let Some(lease) = self.leases.iter_mut().find(|l| l.id == token.channel) else {
            return Reclaim::Stale;
        };
        match &lease.holder {
            None => Reclaim::AlreadyIdle,
            Some(monitor) if monitor.grant != token.grant => Reclaim::Stale,
            Some(monitor) => {
                let held_for = monitor.since.elapsed();
                lease.holder = None;
                self.reclaimed += 1;
                Reclaim::Reclaimed { held_for }
            }
        }
    }

    /// Remove a channel, e.g. because the broker closed it.
    ///
    /// A leased channel counts as reclaimed: its holder's token becomes stale.
    pub(crate) fn discard(&mut self, id: ChannelId) -> Option<Discarded<C>> {
        let position = self.leases.iter().position(|l| l.id == id)?;
        let lease = self.leases.remove(position);
        let was_leased = lease.holder.is_some();
        if was_leased {
            self.reclaimed += 1;
        }
        self.failed += 1;
        Some(Discarded {
            channel: lease.channel,
            was_leased,
        })
    }

    /// Remove every channel, leased or not.
    pub(crate) fn drain(&mut self) -> Vec<Arc<C>> {
        self.leases.drain(..).map(|l| l.channel).collect()
    }

    pub(crate) fn state(&self, worker: WorkerId) -> LeaseState {
        let leased = self.leases.iter().filter(|l| l.holder.is_some()).count();
        LeaseState {
            worker,
            idle: self.leases.len() - leased,
            leased,
            reclaimed: self.reclaimed,
            failed: self.failed,
        }
    }
}

/// A channel leased from a [`ChannelPool`](super::ChannelPool).
///
/// `ChannelLease` derefs to the underlying channel.
/// The lease is returned to its connection worker when `ChannelLease` is dropped, whatever the
/// reason: the holder is done with it, the holder returned early with an error, the holder
/// panicked or the task owning it was aborted.
///
/// You can also hand it back explicitly with [`ChannelLease::checkin`].
pub struct ChannelLease<T: Transport> {
    token: LeaseToken,
    channel: Arc<T::Channel>,
    worker: UnboundedSender<Command<T>>,
}

impl<T: Transport> ChannelLease<T> {
    pub(crate) fn new(grant: Grant<T::Channel>, worker: UnboundedSender<Command<T>>) -> Self {
        Self {
            token: grant.token,
            channel: grant.channel,
            worker,
        }
    }

    /// The identifier of the leased channel.
    pub fn id(&self) -> ChannelId {
        self.token.channel
    }

    pub fn token(&self) -> LeaseToken {
        self.token
    }

    /// A handle to check the lease in without giving up the `ChannelLease` itself.
    pub fn checkin_handle(&self) -> LeaseCheckin<T> {
        LeaseCheckin {
            token: self.token,
            worker: self.worker.clone(),
        }
    }

    /// Return the channel to its connection worker.
    pub fn checkin(self) {
        self.checkin_handle().checkin();
    }
}

impl<T: Transport> Deref for ChannelLease<T> {
    type Target = T::Channel;

    fn deref(&self) -> &T::Channel {
        &self.channel
    }
}

impl<T: Transport> Drop for ChannelLease<T> {
    fn drop(&mut self) {
        // The worker might be gone already (connection lost, pool shut down):
        // the lease died with it.
        let _ = self.worker.send(Command::HolderDown {
            token: self.token,
            panicking: std::thread::panicking(),
        });
    }
}

impl<T: Transport> fmt::Debug for ChannelLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Checks a lease back in. Checking in more than once is a no-op.
pub struct LeaseCheckin<T: Transport> {
    token: LeaseToken,
    worker: UnboundedSender<Command<T>>,
}

impl<T: Transport> LeaseCheckin<T> {
    pub fn checkin(&self) {
        let _ = self.worker.send(Command::Checkin(self.token));
    }
}

impl<T: Transport> Clone for LeaseCheckin<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            worker: self.worker.clone(),
        }
    }
}
