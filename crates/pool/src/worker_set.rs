//! Concurrent registry of workers split into idle and busy.
//!
//! Every known worker id is in exactly one of idle, busy or absent. Idle
//! workers wait in a FIFO queue; acquiring one moves it to busy and hands out
//! a [`Lease`]. Removal can happen in either state and always wins: a lease
//! whose worker was removed can no longer return it to idle. A lease that is
//! dropped without being released gives its worker back by itself.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::address::WorkerId;
use crate::handle::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Busy,
}

struct Slot {
    handle: Arc<dyn WorkerHandle>,
    state: SlotState,
    /// Ticket of the most recent idle entry. It stays attached while the
    /// worker is busy, so it also identifies the outstanding lease.
    ticket: u64,
}

#[derive(Default)]
struct Slots {
    members: HashMap<WorkerId, Slot>,
    /// FIFO of idle tickets. Entries of removed workers are skipped lazily.
    queue: VecDeque<(WorkerId, u64)>,
    /// Busy workers taken out by `drain` whose lease is still out.
    draining: HashMap<WorkerId, u64>,
    idle: usize,
    next_ticket: u64,
    closed: bool,
}

impl Slots {
    fn push_idle(&mut self, id: &WorkerId) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        if let Some(slot) = self.members.get_mut(id) {
            slot.state = SlotState::Idle;
            slot.ticket = ticket;
            self.queue.push_back((id.clone(), ticket));
            self.idle += 1;
        }
    }

    fn pop_idle(&mut self, set: &Weak<Shared>) -> Option<Lease> {
        while let Some((id, ticket)) = self.queue.pop_front() {
            let Some(slot) = self.members.get_mut(&id) else {
                continue;
            };
            if slot.state == SlotState::Idle && slot.ticket == ticket {
                slot.state = SlotState::Busy;
                self.idle -= 1;
                return Some(Lease {
                    handle: Arc::clone(&slot.handle),
                    ticket,
                    set: Weak::clone(set),
                });
            }
        }
        None
    }

    fn holds(&self, id: &WorkerId, ticket: u64) -> bool {
        self.members
            .get(id)
            .is_some_and(|slot| slot.state == SlotState::Busy && slot.ticket == ticket)
    }

    fn remove(&mut self, id: &WorkerId) -> Option<Removed> {
        let slot = self.members.remove(id)?;
        let was_busy = slot.state == SlotState::Busy;
        if !was_busy {
            self.idle -= 1;
        }
        if self.idle == 0 {
            // Whatever is left in the queue belongs to removed workers.
            self.queue.clear();
        }
        Some(Removed {
            handle: slot.handle,
            was_busy,
        })
    }
}

/// State shared between the set and its outstanding leases.
#[derive(Default)]
struct Shared {
    slots: Mutex<Slots>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the acquisition `(id, ticket)`. Returns `true` if the worker went
    /// back to idle.
    fn give_back(&self, id: &WorkerId, ticket: u64) -> bool {
        let (returned, settled) = {
            let mut slots = self.lock();
            if slots.holds(id, ticket) {
                slots.push_idle(id);
                (true, false)
            } else if slots.draining.get(id) == Some(&ticket) {
                slots.draining.remove(id);
                (false, true)
            } else {
                (false, false)
            }
        };
        if returned || settled {
            self.changed.notify_waiters();
        }
        returned
    }
}

/// Exclusive right to use one busy worker, returned by [`WorkerSet::acquire`].
///
/// Dropping the lease has the same effect as [`WorkerSet::release`].
pub struct Lease {
    handle: Arc<dyn WorkerHandle>,
    ticket: u64,
    set: Weak<Shared>,
}

impl Lease {
    pub fn id(&self) -> &WorkerId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<dyn WorkerHandle> {
        &self.handle
    }

    /// First call ends the acquisition; later calls do nothing.
    fn give_back(&mut self) -> bool {
        match std::mem::take(&mut self.set).upgrade() {
            Some(shared) => shared.give_back(self.handle.id(), self.ticket),
            None => false,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.give_back() {
            debug!(worker = %self.id(), "dropped lease returned worker to idle");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("worker", self.id())
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// A worker taken out of the set by [`WorkerSet::remove`] or [`WorkerSet::drain`].
pub struct Removed {
    pub handle: Arc<dyn WorkerHandle>,
    /// The worker was bound to an in-flight task when it was removed.
    pub was_busy: bool,
}

/// Idle queue plus busy index, guarded by one short-held lock.
#[derive(Default)]
pub struct WorkerSet {
    shared: Arc<Shared>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.shared.lock()
    }

    /// Register a worker as idle.
    ///
    /// Returns `false` without error when the id is already known, the set is
    /// closed, the worker does not answer, or the peer does not accept tasks.
    pub async fn add(&self, handle: Arc<dyn WorkerHandle>) -> bool {
        let id = handle.id().clone();
        if self.contains(&id) {
            debug!(worker = %id, "worker already registered");
            return false;
        }
        if !handle.is_reachable().await {
            warn!(worker = %id, "worker is not reachable, discarding");
            return false;
        }
        if !handle.is_worker().await {
            warn!(worker = %id, "peer does not accept tasks, discarding");
            return false;
        }

        {
            let mut slots = self.lock();
            if slots.closed {
                warn!(worker = %id, "worker set is closed, discarding");
                return false;
            }
            if slots.members.contains_key(&id) {
                return false;
            }
            slots.members.insert(
                id.clone(),
                Slot {
                    handle,
                    state: SlotState::Idle,
                    ticket: 0,
                },
            );
            slots.push_idle(&id);
        }
        self.shared.changed.notify_waiters();
        info!(worker = %id, "worker registered");
        true
    }

    /// Take the longest-idle worker, waiting while every worker is busy.
    ///
    /// Returns `None` once the set is closed or holds no worker at all, since
    /// nothing could ever be released to wake the caller.
    pub async fn acquire(&self) -> Option<Lease> {
        let set = Arc::downgrade(&self.shared);
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            // Register before looking so a release between the check and
            // the await is not missed.
            changed.as_mut().enable();

            {
                let mut slots = self.lock();
                if slots.closed || slots.members.is_empty() {
                    return None;
                }
                if let Some(lease) = slots.pop_idle(&set) {
                    debug!(worker = %lease.id(), "worker acquired");
                    return Some(lease);
                }
            }

            changed.await;
        }
    }

    /// Return a busy worker to idle. Never blocks.
    ///
    /// Returns `false` when the worker was removed while the lease was out;
    /// the worker then stays absent.
    pub fn release(&self, mut lease: Lease) -> bool {
        let released = lease.give_back();
        if released {
            debug!(worker = %lease.id(), "worker released");
        } else {
            debug!(worker = %lease.id(), "released worker is no longer registered");
        }
        released
    }

    /// Whether `lease` still binds its worker, i.e. the worker is registered
    /// and busy under this very acquisition.
    pub fn holds(&self, lease: &Lease) -> bool {
        self.lock().holds(lease.id(), lease.ticket)
    }

    /// Remove a worker whether idle or busy.
    pub fn remove(&self, id: &WorkerId) -> Option<Removed> {
        let removed = self.lock().remove(id);
        if removed.is_some() {
            self.shared.changed.notify_waiters();
        }
        removed
    }

    /// Remove every worker and close the set. Closed sets reject `add` and
    /// make `acquire` return `None`.
    ///
    /// Busy workers stay tracked until their lease ends; see [`Self::settled`].
    pub fn drain(&self) -> Vec<Removed> {
        let removed = {
            let mut slots = self.lock();
            slots.closed = true;
            let busy: Vec<(WorkerId, u64)> = slots
                .members
                .iter()
                .filter(|(_, slot)| slot.state == SlotState::Busy)
                .map(|(id, slot)| (id.clone(), slot.ticket))
                .collect();
            slots.draining.extend(busy);
            let ids: Vec<WorkerId> = slots.members.keys().cloned().collect();
            ids.iter()
                .filter_map(|id| slots.remove(id))
                .collect::<Vec<_>>()
        };
        self.shared.changed.notify_waiters();
        removed
    }

    /// Wait until a worker taken out by [`Self::drain`] while busy has been
    /// released, or its lease dropped. Returns at once for any other id.
    pub async fn settled(&self, id: &WorkerId) {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if !self.lock().draining.contains_key(id) {
                return;
            }
            changed.await;
        }
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.lock().members.contains_key(id)
    }

    pub fn is_busy(&self, id: &WorkerId) -> bool {
        self.lock()
            .members
            .get(id)
            .is_some_and(|slot| slot.state == SlotState::Busy)
    }

    /// Number of known workers (idle + busy).
    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_len(&self) -> usize {
        self.lock().idle
    }

    pub fn busy_len(&self) -> usize {
        let slots = self.lock();
        slots.members.len() - slots.idle
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Known worker ids, sorted.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.lock().members.keys().cloned().collect();
        ids.sort();
        ids
    }
}
