//! The limbo entry queue
//!
//! Holds synchronous transactions between their journal write and their
//! confirmation. Entries are ordered by insertion; WAL completions hand out
//! LSNs in the same order, so the queue is also ordered by LSN once the tail
//! settles. All the bookkeeping of acks, confirms and rollbacks lives here;
//! ownership policy and the split-brain filter live one level up.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::signature;
use crate::vclock::Vclock;

/// State of a single queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// In the queue, journal write still in flight, no LSN yet.
    Volatile,
    /// LSN assigned, collecting acks.
    Submitted,
    /// Committed; off the queue.
    Commit,
    /// Rolled back; off the queue.
    Rollback,
}

/// Completion hook of a detached transaction (one whose owner is not
/// blocked in `wait_complete`). Receives the terminal state and, for a
/// rollback, the signature code.
pub type OnLimboComplete = Box<dyn FnOnce(EntryState, i64) + Send + 'static>;

/// A completion hook collected during a state transition, to be run after
/// the limbo lock is released. Hooks may reenter the limbo, so they must
/// never run under it.
pub type DeferredComplete = (OnLimboComplete, EntryState, i64);

/// Run a batch of deferred hooks.
pub fn run_deferred(hooks: Vec<DeferredComplete>) {
    for (hook, state, sig) in hooks {
        hook(state, sig);
    }
}

struct SlotInner {
    lsn: i64,
    state: EntryState,
    /// Failure code for a rolled back entry.
    signature: i64,
    on_complete: Option<OnLimboComplete>,
}

/// Shared handle of one limbo entry. The transaction keeps one end, the
/// queue the other.
pub struct LimboSlot {
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

impl LimboSlot {
    fn new() -> Arc<LimboSlot> {
        Arc::new(LimboSlot {
            inner: Mutex::new(SlotInner {
                lsn: -1,
                state: EntryState::Volatile,
                signature: signature::UNKNOWN,
                on_complete: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn lsn(&self) -> i64 {
        self.inner.lock().unwrap().lsn
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().unwrap().state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state(), EntryState::Commit | EntryState::Rollback)
    }

    /// Rollback signature; valid once the state is `Rollback`.
    pub fn signature(&self) -> i64 {
        self.inner.lock().unwrap().signature
    }

    /// Park a completion hook to run at the terminal transition. If the
    /// entry already terminated the hook runs immediately.
    pub fn set_on_complete(&self, hook: OnLimboComplete) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            EntryState::Commit | EntryState::Rollback => {
                let state = inner.state;
                let sig = inner.signature;
                drop(inner);
                hook(state, sig);
            }
            _ => inner.on_complete = Some(hook),
        }
    }

    fn assign_lsn(&self, lsn: i64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, EntryState::Volatile);
        debug_assert!(lsn > 0);
        inner.lsn = lsn;
        inner.state = EntryState::Submitted;
        self.cond.notify_all();
    }

    /// Move the slot to its terminal state, wake waiters, and hand back the
    /// completion hook for the caller to run outside the queue lock.
    fn terminate(&self, state: EntryState, sig: i64) -> Option<DeferredComplete> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(matches!(state, EntryState::Commit | EntryState::Rollback));
        inner.state = state;
        inner.signature = sig;
        self.cond.notify_all();
        inner.on_complete.take().map(|hook| (hook, state, sig))
    }

    /// Block until the entry terminates, polling the given predicate for
    /// cancellation between waits. Returns the terminal state, or `None`
    /// when cancelled first.
    pub fn wait_terminal(&self, is_cancelled: impl Fn() -> bool) -> Option<(EntryState, i64)> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.state {
                EntryState::Commit | EntryState::Rollback => {
                    return Some((inner.state, inner.signature));
                }
                _ => {}
            }
            if is_cancelled() {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            inner = guard;
        }
    }
}

struct QueueEntry {
    slot: Arc<LimboSlot>,
    origin_id: u32,
    approx_len: u64,
    /// Whether this entry needs its own quorum. Entries that merely wait
    /// behind pending synchronous ones confirm together with them.
    wait_ack: bool,
    #[allow(dead_code)]
    inserted_at: Instant,
}

/// The queue proper. Protected by the limbo's state mutex; no locking of
/// its own besides the per-entry slots.
pub struct LimboQueue {
    /// Peer whose transactions the queue currently holds. 0 means unowned.
    pub owner_id: u32,
    entries: VecDeque<QueueEntry>,
    /// Byte budget for queued entries.
    pub max_size: u64,
    /// Current approximate size of the queue in bytes.
    pub size: u64,
    /// Maximal LSN that gathered a quorum and whose CONFIRM is durable.
    pub confirmed_lsn: i64,
    /// Maximal LSN that gathered a quorum; its CONFIRM may still be in
    /// flight. Never behind `confirmed_lsn`.
    pub volatile_confirmed_lsn: i64,
    /// Component per peer: how far that peer is known to have persisted the
    /// owner's stream. The owner's own component is its local WAL progress.
    pub ack_vclock: Vclock,
    /// Biggest known confirmed LSN per previous owner. Never decreases.
    pub confirmed_vclock: Vclock,
}

impl LimboQueue {
    pub fn new(max_size: u64) -> Self {
        Self {
            owner_id: 0,
            entries: VecDeque::new(),
            max_size,
            size: 0,
            confirmed_lsn: 0,
            volatile_confirmed_lsn: 0,
            ack_vclock: Vclock::new(),
            confirmed_vclock: Vclock::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn would_block(&self) -> bool {
        self.size >= self.max_size
    }

    /// Append a new volatile entry. Size accounting is the caller's gate;
    /// this only records the entry.
    pub fn append(&mut self, origin_id: u32, approx_len: u64, wait_ack: bool) -> Arc<LimboSlot> {
        let slot = LimboSlot::new();
        self.entries.push_back(QueueEntry {
            slot: Arc::clone(&slot),
            origin_id,
            approx_len,
            wait_ack,
            inserted_at: Instant::now(),
        });
        self.size += approx_len;
        slot
    }

    /// Drop a specific entry (its journal write failed before an LSN was
    /// assigned) and mark it rolled back.
    #[must_use]
    pub fn abort(&mut self, slot: &Arc<LimboSlot>, sig: i64) -> Vec<DeferredComplete> {
        let mut hooks = Vec::new();
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.slot, slot))
        {
            let entry = self.entries.remove(pos).unwrap();
            self.size -= entry.approx_len;
            hooks.extend(entry.slot.terminate(EntryState::Rollback, sig));
        }
        hooks
    }

    /// Record the LSN the journal assigned to an entry and advance the
    /// origin's ack component (the local write is an implicit self-ack).
    pub fn assign_lsn(&mut self, slot: &Arc<LimboSlot>, lsn: i64) {
        slot.assign_lsn(lsn);
        let origin = self
            .entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.slot, slot))
            .map(|e| e.origin_id)
            .unwrap_or(self.owner_id);
        if lsn > self.ack_vclock.get(origin) {
            self.ack_vclock.follow(origin, lsn);
        }
    }

    /// Record an ack. Returns whether anything new might be confirmable.
    pub fn ack(&mut self, peer_id: u32, lsn: i64) -> bool {
        if lsn <= self.ack_vclock.get(peer_id) {
            return false;
        }
        self.ack_vclock.follow(peer_id, lsn);
        true
    }

    /// Advance `volatile_confirmed_lsn` over every leading entry that has a
    /// quorum of acks. Entries not waiting for acks neither move nor hold
    /// the border. Returns whether it moved.
    pub fn bump_volatile_confirm(&mut self, quorum: usize) -> bool {
        let mut new_lsn = self.volatile_confirmed_lsn;
        for entry in &self.entries {
            let (state, lsn) = {
                let inner = entry.slot.inner.lock().unwrap();
                (inner.state, inner.lsn)
            };
            if state != EntryState::Submitted || lsn < 0 {
                break;
            }
            if !entry.wait_ack || lsn <= new_lsn {
                continue;
            }
            let acks = self.ack_vclock.iter().filter(|&(_, l)| l >= lsn).count();
            if acks < quorum {
                break;
            }
            new_lsn = lsn;
        }
        if new_lsn > self.volatile_confirmed_lsn {
            self.volatile_confirmed_lsn = new_lsn;
            true
        } else {
            false
        }
    }

    /// Commit every leading entry with an assigned LSN not above `lsn`,
    /// plus the entries right behind the border that wait for no acks of
    /// their own. A border at or below `confirmed_lsn` is a no-op.
    #[must_use]
    pub fn apply_confirm(&mut self, lsn: i64) -> Vec<DeferredComplete> {
        let mut hooks = Vec::new();
        if lsn <= self.confirmed_lsn {
            return hooks;
        }
        self.confirmed_lsn = lsn;
        if self.volatile_confirmed_lsn < lsn {
            self.volatile_confirmed_lsn = lsn;
        }
        while let Some(entry) = self.entries.front() {
            let entry_lsn = entry.slot.lsn();
            if entry_lsn < 0 {
                break;
            }
            if entry_lsn > lsn && entry.wait_ack {
                break;
            }
            let entry = self.entries.pop_front().unwrap();
            self.size -= entry.approx_len;
            hooks.extend(entry.slot.terminate(EntryState::Commit, entry_lsn));
        }
        hooks
    }

    /// Commit the leading entries already covered by the confirmed border,
    /// and the no-ack entries right behind it (everything synchronous before
    /// them has resolved). Catches entries whose LSN arrived after the
    /// CONFIRM that covers them.
    #[must_use]
    pub fn reap_confirmed_front(&mut self) -> Vec<DeferredComplete> {
        let mut hooks = Vec::new();
        while let Some(entry) = self.entries.front() {
            let lsn = entry.slot.lsn();
            if lsn < 0 {
                break;
            }
            if lsn > self.confirmed_lsn && entry.wait_ack {
                break;
            }
            let entry = self.entries.pop_front().unwrap();
            self.size -= entry.approx_len;
            hooks.extend(entry.slot.terminate(EntryState::Commit, lsn));
        }
        hooks
    }

    /// Roll back every entry with `LSN >= lsn`, plus every entry whose LSN
    /// is still unassigned (those are necessarily later), in reverse queue
    /// order.
    #[must_use]
    pub fn apply_rollback(&mut self, lsn: i64, sig: i64) -> Vec<DeferredComplete> {
        let mut hooks = Vec::new();
        while let Some(entry) = self.entries.back() {
            let entry_lsn = entry.slot.lsn();
            if entry_lsn >= 0 && entry_lsn < lsn {
                break;
            }
            let entry = self.entries.pop_back().unwrap();
            self.size -= entry.approx_len;
            hooks.extend(entry.slot.terminate(EntryState::Rollback, sig));
        }
        hooks
    }

    /// Hand the queue to a new owner: confirm up to `border_lsn`, roll the
    /// rest back, remember the old owner's confirmed border, and restart the
    /// confirmed counters on the new owner's timeline.
    #[must_use]
    pub fn transfer_ownership(&mut self, new_owner_id: u32, border_lsn: i64) -> Vec<DeferredComplete> {
        let mut hooks = self.apply_confirm(border_lsn);
        hooks.extend(self.apply_rollback(border_lsn + 1, signature::SYNC_ROLLBACK));
        debug_assert!(self.entries.is_empty());
        if self.owner_id != 0 && self.confirmed_lsn > self.confirmed_vclock.get(self.owner_id) {
            self.confirmed_vclock.follow(self.owner_id, self.confirmed_lsn);
        }
        self.owner_id = new_owner_id;
        self.confirmed_lsn = self.confirmed_vclock.get(new_owner_id);
        self.volatile_confirmed_lsn = self.confirmed_lsn;
        self.ack_vclock = Vclock::new();
        hooks
    }

    /// LSN range `[first, last]` of the entries that have one.
    pub fn lsn_range(&self) -> Option<(i64, i64)> {
        let mut first = None;
        let mut last = None;
        for entry in &self.entries {
            let lsn = entry.slot.lsn();
            if lsn < 0 {
                break;
            }
            if first.is_none() {
                first = Some(lsn);
            }
            last = Some(lsn);
        }
        first.zip(last)
    }

    /// Whether some entry is still waiting for its journal write.
    pub fn has_unassigned_lsns(&self) -> bool {
        self.entries.iter().any(|e| e.slot.lsn() < 0)
    }

    /// The last entry in the queue, if any.
    pub fn last_entry(&self) -> Option<Arc<LimboSlot>> {
        self.entries.back().map(|e| Arc::clone(&e.slot))
    }

    /// The last entry that needs a quorum of its own, if any.
    pub fn last_sync_entry(&self) -> Option<Arc<LimboSlot>> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.wait_ack)
            .map(|e| Arc::clone(&e.slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assign_confirm() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let slot = queue.append(1, 100, true);
        assert_eq!(slot.state(), EntryState::Volatile);
        assert_eq!(slot.lsn(), -1);
        assert_eq!(queue.size, 100);

        queue.assign_lsn(&slot, 5);
        assert_eq!(slot.state(), EntryState::Submitted);
        assert_eq!(queue.ack_vclock.get(1), 5);

        run_deferred(queue.apply_confirm(5));
        assert_eq!(slot.state(), EntryState::Commit);
        assert!(queue.is_empty());
        assert_eq!(queue.size, 0);
        assert_eq!(queue.confirmed_lsn, 5);
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let slot = queue.append(1, 10, true);
        queue.assign_lsn(&slot, 3);
        run_deferred(queue.apply_confirm(3));
        let confirmed = queue.confirmed_lsn;
        run_deferred(queue.apply_confirm(3));
        run_deferred(queue.apply_confirm(2));
        assert_eq!(queue.confirmed_lsn, confirmed);
    }

    #[test]
    fn test_quorum_counting() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let slot = queue.append(1, 10, true);
        queue.assign_lsn(&slot, 1);

        // Self-ack alone is not a quorum of 2.
        assert!(!queue.bump_volatile_confirm(2));
        assert!(queue.ack(2, 1));
        assert!(queue.bump_volatile_confirm(2));
        assert_eq!(queue.volatile_confirmed_lsn, 1);
        // The entry is still queued until the CONFIRM is applied.
        assert_eq!(slot.state(), EntryState::Submitted);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        assert!(queue.ack(2, 5));
        assert!(!queue.ack(2, 5));
        assert!(!queue.ack(2, 3));
    }

    #[test]
    fn test_reversed_rollback_order() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let slots: Vec<_> = (1..=3).map(|_| queue.append(1, 10, true)).collect();
        for (i, slot) in slots.iter().enumerate() {
            queue.assign_lsn(slot, (i + 1) as i64);
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, slot) in slots.iter().enumerate() {
            let order = Arc::clone(&order);
            slot.set_on_complete(Box::new(move |state, _| {
                assert_eq!(state, EntryState::Rollback);
                order.lock().unwrap().push(i);
            }));
        }

        run_deferred(queue.apply_rollback(1, signature::SYNC_ROLLBACK));
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rollback_takes_unassigned_tail() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let assigned = queue.append(1, 10, true);
        queue.assign_lsn(&assigned, 1);
        let volatile = queue.append(1, 10, true);

        run_deferred(queue.apply_rollback(2, signature::SYNC_ROLLBACK));
        assert_eq!(volatile.state(), EntryState::Rollback);
        assert_eq!(assigned.state(), EntryState::Submitted);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_transfer_ownership_splits_queue() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let kept = queue.append(1, 10, true);
        queue.assign_lsn(&kept, 7);
        let dropped = queue.append(1, 10, true);
        queue.assign_lsn(&dropped, 8);

        run_deferred(queue.transfer_ownership(2, 7));
        assert_eq!(kept.state(), EntryState::Commit);
        assert_eq!(dropped.state(), EntryState::Rollback);
        assert_eq!(dropped.signature(), signature::SYNC_ROLLBACK);
        assert_eq!(queue.owner_id, 2);
        // The old owner's border is remembered.
        assert_eq!(queue.confirmed_vclock.get(1), 7);
        // The counters restart on the new owner's timeline.
        assert_eq!(queue.confirmed_lsn, 0);
    }

    #[test]
    fn test_lsn_range() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        assert_eq!(queue.lsn_range(), None);
        let a = queue.append(1, 10, true);
        queue.assign_lsn(&a, 4);
        let b = queue.append(1, 10, true);
        queue.assign_lsn(&b, 6);
        queue.append(1, 10, true);
        assert_eq!(queue.lsn_range(), Some((4, 6)));
        assert!(queue.has_unassigned_lsns());
    }

    #[test]
    fn test_wait_terminal_cancellation() {
        let queue_slot = LimboSlot::new();
        let cancelled = std::sync::atomic::AtomicBool::new(true);
        let result =
            queue_slot.wait_terminal(|| cancelled.load(std::sync::atomic::Ordering::Relaxed));
        assert!(result.is_none());
    }

    #[test]
    fn test_hook_on_already_terminated_slot_runs_at_once() {
        let mut queue = LimboQueue::new(u64::MAX);
        queue.owner_id = 1;
        let slot = queue.append(1, 10, true);
        queue.assign_lsn(&slot, 1);
        run_deferred(queue.apply_confirm(1));

        let ran = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran);
        slot.set_on_complete(Box::new(move |state, _| {
            assert_eq!(state, EntryState::Commit);
            *ran_clone.lock().unwrap() = true;
        }));
        assert!(*ran.lock().unwrap());
    }
}
