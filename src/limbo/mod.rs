//! The synchronous-replication limbo
//!
//! Transactions touching synchronous data sit here between their journal
//! write and their quorum. The limbo enforces the single-owner rule: only
//! the owner emits CONFIRM/ROLLBACK, everyone else applies them verbatim.
//! Ownership moves via PROMOTE/DEMOTE records filtered against split-brain.
//!
//! A dedicated worker turns advances of `volatile_confirmed_lsn` into
//! durable CONFIRM records, so acks never block on the journal.

pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::Config;
use crate::error::{signature, Error, Result};
use crate::journal::Journal;
use crate::row::{SynchroKind, SynchroRequest};
use crate::vclock::Vclock;

pub use queue::{EntryState, LimboQueue, LimboSlot, OnLimboComplete};

/// What role the limbo plays right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimboState {
    /// No owner; asynchronous operation.
    Inactive,
    /// This node owns the queue and may confirm.
    Leader,
    /// Some other node owns the queue; apply-only.
    Replica,
}

/// Outcome of waiting for a limbo entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Committed.
    Success,
    /// The waiter was cancelled; the entry stays queued and resolves on its
    /// own later.
    FailDetach,
    /// Rolled back; the signature tells why.
    FailComplete(i64),
}

struct LimboInner {
    queue: LimboQueue,
    state: LimboState,
    /// Greatest PROMOTE/DEMOTE term applied.
    term: u64,
    /// Latest term seen per origin, for filtering stragglers.
    promote_term_map: Vclock,
    /// Savepoint of `volatile_confirmed_lsn` across a PROMOTE/DEMOTE write.
    svp_confirmed_lsn: i64,
    /// A rollback or an ownership transition is being journaled; new
    /// submissions must fail instead of landing after it.
    is_in_rollback: bool,
    is_transition_in_progress: bool,
    /// On until the first PROMOTE; a frozen limbo refuses sync submissions.
    frozen_until_promotion: bool,
    /// Split-brain filtering; off during bootstrap/recovery.
    do_validate: bool,
    configured_quorum: usize,
    registered_count: usize,
    /// Raft inputs, pushed in by the node wiring.
    raft_enabled: bool,
    raft_is_leader: bool,
    raft_volatile_term: u64,
    in_recovery: bool,
    saw_promote: bool,
    shutdown: bool,
}

impl LimboInner {
    fn effective_quorum(&self) -> usize {
        self.configured_quorum.min(self.registered_count.max(1))
    }

    /// Recompute the limbo role from ownership, recovery and raft inputs.
    fn update_state(&mut self, self_id: u32) {
        self.state = if self.queue.owner_id == 0 {
            LimboState::Inactive
        } else if self.queue.owner_id != self_id {
            LimboState::Replica
        } else if self.in_recovery || !self.saw_promote || self.is_transition_in_progress {
            LimboState::Replica
        } else if !self.raft_enabled {
            // Raft-less synchronous replication: owning the queue is enough.
            LimboState::Leader
        } else if !self.raft_is_leader {
            LimboState::Replica
        } else if self.raft_volatile_term == self.term {
            LimboState::Leader
        } else {
            LimboState::Replica
        };
    }
}

struct LimboShared {
    self_id: u32,
    journal: Arc<Journal>,
    /// Serializes synchro request processing end-to-end, journal write
    /// included. The inner mutex is never held across a journal write.
    promote_latch: Mutex<()>,
    inner: Mutex<LimboInner>,
    /// Broadcast on every queue/state change; the worker and flush/wait
    /// helpers sleep on it.
    cond: Condvar,
}

/// The limbo: queue + ownership state + the CONFIRM worker.
pub struct Limbo {
    shared: Arc<LimboShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Limbo {
    pub fn new(config: &Config, journal: Arc<Journal>) -> Limbo {
        let shared = Arc::new(LimboShared {
            self_id: config.peer_id,
            journal,
            promote_latch: Mutex::new(()),
            inner: Mutex::new(LimboInner {
                queue: LimboQueue::new(i64::MAX as u64),
                state: LimboState::Inactive,
                term: 0,
                promote_term_map: Vclock::new(),
                svp_confirmed_lsn: -1,
                is_in_rollback: false,
                is_transition_in_progress: false,
                frozen_until_promotion: true,
                do_validate: false,
                configured_quorum: config.sync_quorum.max(1),
                registered_count: 1,
                raft_enabled: false,
                raft_is_leader: false,
                raft_volatile_term: 0,
                in_recovery: true,
                saw_promote: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("limbo-worker".to_string())
            .spawn(move || confirm_worker_loop(worker_shared))
            .expect("failed to spawn the limbo worker");
        Limbo {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn state(&self) -> LimboState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn owner_id(&self) -> u32 {
        self.shared.inner.lock().unwrap().queue.owner_id
    }

    pub fn term(&self) -> u64 {
        self.shared.inner.lock().unwrap().term
    }

    pub fn confirmed_lsn(&self) -> i64 {
        self.shared.inner.lock().unwrap().queue.confirmed_lsn
    }

    pub fn volatile_confirmed_lsn(&self) -> i64 {
        self.shared.inner.lock().unwrap().queue.volatile_confirmed_lsn
    }

    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().unwrap().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().queue.len()
    }

    pub fn is_owned_by_self(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.queue.owner_id == self.shared.self_id
    }

    /// Node-side wiring: the number of registered peers, for bootstrap
    /// quorum truncation.
    pub fn set_registered_count(&self, count: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.registered_count = count.max(1);
        let quorum = inner.effective_quorum();
        if inner.state == LimboState::Leader && inner.queue.bump_volatile_confirm(quorum) {
            self.shared.cond.notify_all();
        }
    }

    /// Cap the queued bytes; submitters yield once it is exceeded.
    pub fn set_max_size(&self, size: u64) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.queue.max_size = size;
        self.shared.cond.notify_all();
    }

    pub fn set_quorum(&self, quorum: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.configured_quorum = quorum.max(1);
        let quorum = inner.effective_quorum();
        if inner.state == LimboState::Leader && inner.queue.bump_volatile_confirm(quorum) {
            self.shared.cond.notify_all();
        }
    }

    /// Node-side wiring: raft observations feeding the role computation.
    pub fn set_raft_status(&self, enabled: bool, is_leader: bool, volatile_term: u64) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.raft_enabled = enabled;
        inner.raft_is_leader = is_leader;
        inner.raft_volatile_term = volatile_term;
        inner.update_state(self.shared.self_id);
        self.shared.cond.notify_all();
    }

    /// Start split-brain filtering of incoming synchro requests.
    pub fn filter_enable(&self) {
        self.shared.inner.lock().unwrap().do_validate = true;
    }

    pub fn filter_disable(&self) {
        self.shared.inner.lock().unwrap().do_validate = false;
    }

    /// Recovery is over; roles may be recomputed.
    pub fn finish_recovery(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.in_recovery = false;
        inner.update_state(self.shared.self_id);
        self.shared.cond.notify_all();
    }

    /// Append a transaction to the queue. Yields while the queue is over
    /// its byte budget. Fails with `SyncRollback` while a rollback or an
    /// ownership transition is in flight, when the limbo is frozen, or when
    /// this node may not issue synchronous transactions.
    pub fn submit(&self, origin_id: u32, approx_len: u64, wait_ack: bool) -> Result<Arc<LimboSlot>> {
        let origin_id = if origin_id == 0 {
            self.shared.self_id
        } else {
            origin_id
        };
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if inner.is_in_rollback {
                return Err(Error::SyncRollback);
            }
            if origin_id == self.shared.self_id {
                if inner.frozen_until_promotion {
                    return Err(Error::SyncRollback);
                }
                if inner.state != LimboState::Leader {
                    return Err(Error::SyncRollback);
                }
            } else if inner.queue.owner_id != origin_id {
                return Err(Error::SplitBrain(format!(
                    "got a transaction from {} while the queue belongs to {}",
                    origin_id, inner.queue.owner_id
                )));
            }
            if !inner.queue.would_block() {
                break;
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            inner = guard;
        }
        let slot = inner.queue.append(origin_id, approx_len, wait_ack);
        Ok(slot)
    }

    /// Drop an entry whose journal write failed before an LSN was assigned.
    pub fn abort(&self, slot: &Arc<LimboSlot>, sig: i64) {
        let hooks = {
            let mut inner = self.shared.inner.lock().unwrap();
            let hooks = inner.queue.abort(slot, sig);
            self.shared.cond.notify_all();
            hooks
        };
        queue::run_deferred(hooks);
    }

    /// Journal completion: stamp the LSN and count the local write as the
    /// origin's ack. May already complete a quorum of one, or finish an
    /// entry whose predecessors all resolved meanwhile.
    pub fn assign_lsn(&self, slot: &Arc<LimboSlot>, lsn: i64) {
        let hooks = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.queue.assign_lsn(slot, lsn);
            if inner.state == LimboState::Leader {
                let quorum = inner.effective_quorum();
                inner.queue.bump_volatile_confirm(quorum);
            }
            let hooks = if inner.is_in_rollback {
                Vec::new()
            } else {
                inner.queue.reap_confirmed_front()
            };
            self.shared.cond.notify_all();
            hooks
        };
        queue::run_deferred(hooks);
    }

    /// A peer reported persistence of the owner's stream up to `lsn`.
    /// Only effective on the owner.
    pub fn ack(&self, peer_id: u32, lsn: i64) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state != LimboState::Leader {
            return;
        }
        if inner.queue.ack(peer_id, lsn) {
            let quorum = inner.effective_quorum();
            inner.queue.bump_volatile_confirm(quorum);
            self.shared.cond.notify_all();
        }
    }

    /// Block until the entry commits or rolls back. Cancellation detaches
    /// the waiter; the entry stays queued and resolves on its own.
    pub fn wait_complete(
        &self,
        slot: &Arc<LimboSlot>,
        is_cancelled: impl Fn() -> bool,
    ) -> WaitResult {
        match slot.wait_terminal(is_cancelled) {
            None => WaitResult::FailDetach,
            Some((EntryState::Commit, _)) => WaitResult::Success,
            Some((_, sig)) => WaitResult::FailComplete(sig),
        }
    }

    /// Wait until every entry present at the call has an LSN. After this the
    /// queue has no unfinished business with the journal. Fails with
    /// `Cancelled` when the caller's cancellation predicate fires first.
    pub fn flush(&self, is_cancelled: impl Fn() -> bool) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        while inner.queue.has_unassigned_lsns() {
            if is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            inner = guard;
        }
        Ok(())
    }

    /// The last entry currently queued, if any.
    pub fn last_entry(&self) -> Option<Arc<LimboSlot>> {
        self.shared.inner.lock().unwrap().queue.last_entry()
    }

    /// The last entry that needs a quorum of its own, if any.
    pub fn last_sync_entry(&self) -> Option<Arc<LimboSlot>> {
        self.shared.inner.lock().unwrap().queue.last_sync_entry()
    }

    /// The LSN border a PROMOTE/DEMOTE issued here must carry: the last
    /// queued entry's LSN, or the confirmed border when the queue is empty.
    /// Call after `flush`, so every queued entry has its LSN.
    pub fn promote_border(&self) -> i64 {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .queue
            .lsn_range()
            .map(|(_, last)| last)
            .unwrap_or(inner.queue.confirmed_lsn)
            .max(inner.queue.confirmed_lsn)
    }

    /// Wait until every synchronous transaction known now is resolved.
    /// Fails with `SyncRollback` if the tail rolled back, `Cancelled` on
    /// cancellation.
    pub fn wait_confirm(&self, is_cancelled: impl Fn() -> bool) -> Result<()> {
        let last = match self.last_sync_entry() {
            None => return Ok(()),
            Some(slot) => slot,
        };
        match self.wait_complete(&last, is_cancelled) {
            WaitResult::Success => Ok(()),
            WaitResult::FailDetach => Err(Error::Cancelled),
            WaitResult::FailComplete(_) => Err(Error::SyncRollback),
        }
    }

    /// Wait until the queue is empty, no matter how its entries end.
    pub fn wait_empty(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.shared.inner.lock().unwrap();
        while !inner.queue.is_empty() {
            if std::time::Instant::now() >= deadline {
                return Err(Error::Transaction(
                    "timed out waiting for the limbo to empty".to_string(),
                ));
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            inner = guard;
        }
        Ok(())
    }

    /// Process an inbound synchro request: validate, journal, apply.
    pub fn process(&self, req: &SynchroRequest) -> Result<()> {
        let _latch = self.shared.promote_latch.lock().unwrap();
        self.req_prepare(req)?;
        let row = req.clone().into_row();
        match self.shared.journal.write_row(row) {
            Ok(_) => {
                self.req_commit(req);
                Ok(())
            }
            Err(e) => {
                self.req_rollback(req);
                Err(e)
            }
        }
    }

    /// Apply a synchro request replayed from the journal; no new write.
    pub fn process_recovered(&self, req: &SynchroRequest) -> Result<()> {
        let _latch = self.shared.promote_latch.lock().unwrap();
        self.req_prepare(req)?;
        self.req_commit(req);
        Ok(())
    }

    /// Write a PROMOTE transferring ownership to this node.
    pub fn write_promote(&self, lsn: i64, term: u64) -> Result<()> {
        let req = SynchroRequest::promote(self.shared.self_id, self.owner_id(), lsn, term);
        self.process(&req)
    }

    /// Write a DEMOTE clearing ownership.
    pub fn write_demote(&self, lsn: i64, term: u64) -> Result<()> {
        let req = SynchroRequest::demote(self.shared.self_id, self.owner_id(), lsn, term);
        self.process(&req)
    }

    /// Snapshot the limbo into a checkpoint-form PROMOTE. This is the only
    /// serialization that carries `confirmed_vclock`.
    pub fn checkpoint(&self) -> SynchroRequest {
        let inner = self.shared.inner.lock().unwrap();
        SynchroRequest {
            kind: SynchroKind::Promote,
            origin_id: 0,
            peer_id: inner.queue.owner_id,
            lsn: inner.queue.confirmed_lsn,
            term: inner.term,
            confirmed_vclock: Some(inner.queue.confirmed_vclock.clone()),
        }
    }

    /// Restore limbo state from a checkpoint-form PROMOTE.
    pub fn restore(&self, req: &SynchroRequest) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.queue.owner_id = req.peer_id;
        inner.queue.confirmed_lsn = req.lsn;
        inner.queue.volatile_confirmed_lsn = req.lsn;
        if let Some(vclock) = &req.confirmed_vclock {
            inner.queue.confirmed_vclock = vclock.clone();
        }
        if req.term > 0 {
            inner.term = req.term;
            if req.peer_id != 0 && req.term > inner.promote_term_map.get(req.peer_id) as u64 {
                inner.promote_term_map.follow(req.peer_id, req.term as i64);
            }
        }
        inner.update_state(self.shared.self_id);
    }

    /// Latest PROMOTE term seen from the given origin.
    pub fn replica_term(&self, origin_id: u32) -> u64 {
        self.shared.inner.lock().unwrap().promote_term_map.get(origin_id) as u64
    }

    fn req_prepare(&self, req: &SynchroRequest) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        self.filter_generic(&inner, req)?;

        // Guard against new transactions appearing during the journal write:
        // a txn without an LSN in the queue at apply time could not be told
        // confirmed from rolled back.
        assert!(!inner.is_in_rollback);
        inner.is_in_rollback = true;

        if inner.do_validate {
            // The filters need every queued LSN to be known.
            drop(inner);
            self.flush(|| false)?;
            inner = self.shared.inner.lock().unwrap();
            let verdict = match req.kind {
                SynchroKind::Confirm | SynchroKind::Rollback => {
                    self.filter_confirm_rollback(&inner, req)
                }
                SynchroKind::Promote | SynchroKind::Demote => {
                    self.filter_promote_demote(&inner, req)
                }
            };
            if let Err(e) = verdict {
                inner.is_in_rollback = false;
                return Err(e);
            }
        }

        match req.kind {
            SynchroKind::Confirm | SynchroKind::Rollback => {
                inner.is_in_rollback = false;
            }
            SynchroKind::Promote | SynchroKind::Demote => {
                debug_assert_eq!(inner.svp_confirmed_lsn, -1);
                debug_assert!(!inner.is_transition_in_progress);
                inner.is_transition_in_progress = true;
                inner.svp_confirmed_lsn = inner.queue.volatile_confirmed_lsn;
                inner.queue.volatile_confirmed_lsn = req.lsn;
                inner.update_state(self.shared.self_id);
            }
        }
        Ok(())
    }

    fn req_rollback(&self, req: &SynchroRequest) {
        let mut inner = self.shared.inner.lock().unwrap();
        if req.kind.is_promote_like() {
            debug_assert!(inner.is_in_rollback);
            debug_assert!(inner.svp_confirmed_lsn >= 0);
            inner.queue.volatile_confirmed_lsn = inner.svp_confirmed_lsn;
            inner.svp_confirmed_lsn = -1;
            inner.is_transition_in_progress = false;
            inner.is_in_rollback = false;
            inner.update_state(self.shared.self_id);
        }
        self.shared.cond.notify_all();
    }

    fn req_commit(&self, req: &SynchroRequest) {
        let hooks = {
            let mut inner = self.shared.inner.lock().unwrap();
            if req.kind.is_promote_like() {
                debug_assert!(inner.is_in_rollback);
                inner.svp_confirmed_lsn = -1;
                inner.is_in_rollback = false;
                inner.is_transition_in_progress = false;
            }

            if req.origin_id != 0 && req.term > inner.promote_term_map.get(req.origin_id) as u64 {
                inner.promote_term_map.follow(req.origin_id, req.term as i64);
                if req.term > inner.term {
                    inner.term = req.term;
                }
            }
            if let Some(vclock) = &req.confirmed_vclock {
                inner.queue.confirmed_vclock.merge(vclock);
            }

            let hooks = match req.kind {
                SynchroKind::Confirm => inner.queue.apply_confirm(req.lsn),
                SynchroKind::Rollback => {
                    inner.queue.apply_rollback(req.lsn, signature::SYNC_ROLLBACK)
                }
                SynchroKind::Promote => {
                    if !inner.in_recovery {
                        inner.saw_promote = true;
                    }
                    inner.frozen_until_promotion = false;
                    let hooks = inner.queue.transfer_ownership(req.origin_id, req.lsn);
                    inner.update_state(self.shared.self_id);
                    hooks
                }
                SynchroKind::Demote => {
                    let hooks = inner.queue.transfer_ownership(0, req.lsn);
                    inner.update_state(self.shared.self_id);
                    hooks
                }
            };
            self.shared.cond.notify_all();
            hooks
        };
        queue::run_deferred(hooks);
    }

    fn filter_generic(&self, inner: &LimboInner, req: &SynchroRequest) -> Result<()> {
        if !inner.do_validate {
            return Ok(());
        }
        if req.peer_id == 0 && req.kind != SynchroKind::Promote {
            return Err(Error::Protocol(format!(
                "rejecting {:?} from origin {}: zero replica id",
                req.kind, req.origin_id
            )));
        }
        if req.peer_id != inner.queue.owner_id {
            // The sender missed an ownership migration and is out of date.
            return Err(Error::SplitBrain(
                "got a request from a foreign synchro queue owner".to_string(),
            ));
        }
        Ok(())
    }

    fn filter_confirm_rollback(&self, _inner: &LimboInner, req: &SynchroRequest) -> Result<()> {
        if req.lsn == 0 {
            return Err(Error::Protocol(format!(
                "rejecting {:?} from origin {}: zero lsn",
                req.kind, req.origin_id
            )));
        }
        Ok(())
    }

    fn filter_promote_demote(&self, inner: &LimboInner, req: &SynchroRequest) -> Result<()> {
        if req.term == 0 {
            return Err(Error::Protocol(format!(
                "rejecting {:?} from origin {}: zero term",
                req.kind, req.origin_id
            )));
        }
        // A term already seen comes from a node living in a subdomain which
        // missed the elections; its data is no longer consistent.
        if inner.term >= req.term {
            return Err(Error::SplitBrain(format!(
                "got a {:?} with an obsolete term {} (max seen is {})",
                req.kind, req.term, inner.term
            )));
        }
        if inner.queue.confirmed_lsn > req.lsn {
            return Err(Error::SplitBrain(format!(
                "got a request with lsn {} from an already processed range (confirmed is {})",
                req.lsn, inner.queue.confirmed_lsn
            )));
        }
        if inner.queue.confirmed_lsn == req.lsn {
            return Ok(());
        }
        if inner.queue.is_empty() {
            return Err(Error::SplitBrain(format!(
                "got a request mentioning future lsn {} with an empty queue",
                req.lsn
            )));
        }
        match inner.queue.lsn_range() {
            Some((first, last)) if req.lsn >= first && req.lsn <= last => Ok(()),
            _ => Err(Error::SplitBrain(format!(
                "got a request lsn {} out of the queue range",
                req.lsn
            ))),
        }
    }

    pub fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Limbo {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The worker: whenever the volatile confirmed border runs ahead of the
/// durable one on a leader, write one CONFIRM and apply it.
fn confirm_worker_loop(shared: Arc<LimboShared>) {
    loop {
        let lsn = {
            let mut inner = shared.inner.lock().unwrap();
            loop {
                if inner.shutdown {
                    return;
                }
                if inner.state == LimboState::Leader
                    && !inner.is_in_rollback
                    && inner.queue.volatile_confirmed_lsn > inner.queue.confirmed_lsn
                {
                    break inner.queue.volatile_confirmed_lsn;
                }
                let (guard, _) = shared
                    .cond
                    .wait_timeout(inner, Duration::from_millis(50))
                    .unwrap();
                inner = guard;
            }
        };

        // Hold the promote latch, not the state mutex, across the write: the
        // journal completion path needs the state mutex, and a concurrent
        // PROMOTE must not interleave with a CONFIRM write.
        let latch = shared.promote_latch.lock().unwrap();
        let still_valid = {
            let inner = shared.inner.lock().unwrap();
            inner.state == LimboState::Leader
                && !inner.is_in_rollback
                && lsn > inner.queue.confirmed_lsn
        };
        if still_valid {
            let owner = {
                let inner = shared.inner.lock().unwrap();
                inner.queue.owner_id
            };
            let req = SynchroRequest::confirm(owner, lsn);
            match shared.journal.write_row(req.into_row()) {
                Ok(_) => {
                    let hooks = {
                        let mut inner = shared.inner.lock().unwrap();
                        let hooks = inner.queue.apply_confirm(lsn);
                        shared.cond.notify_all();
                        hooks
                    };
                    queue::run_deferred(hooks);
                    log::debug!("confirmed synchronous transactions up to lsn {}", lsn);
                }
                Err(e) => {
                    log::error!("failed to write CONFIRM({}): {}", lsn, e);
                    drop(latch);
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
            }
        }
        drop(latch);
    }
}

/// A cancellation flag shared between a waiting task and whoever may cancel
/// it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_limbo(sync_quorum: usize) -> (Limbo, Arc<Journal>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = Config {
            peer_id: 1,
            data_dir: dir.path().to_path_buf(),
            sync_quorum,
            ..Default::default()
        };
        let journal =
            Arc::new(Journal::open(&config, Vclock::new(), Vclock::new()).unwrap());
        let limbo = Limbo::new(&config, Arc::clone(&journal));
        limbo.finish_recovery();
        (limbo, journal, dir)
    }

    /// Promote self-ownership the way the node wiring does after elections.
    fn promote_self(limbo: &Limbo, term: u64) {
        limbo
            .process(&SynchroRequest::promote(1, limbo.owner_id(), limbo.confirmed_lsn(), term))
            .unwrap();
    }

    #[test]
    fn test_submit_requires_promotion() {
        let (limbo, _journal, _dir) = test_limbo(1);
        assert!(matches!(limbo.submit(0, 10, true), Err(Error::SyncRollback)));

        promote_self(&limbo, 1);
        assert_eq!(limbo.state(), LimboState::Leader);
        assert!(limbo.submit(0, 10, true).is_ok());
    }

    #[test]
    fn test_quorum_of_one_confirms_on_local_write() {
        let (limbo, _journal, _dir) = test_limbo(1);
        promote_self(&limbo, 1);

        let slot = limbo.submit(0, 10, true).unwrap();
        limbo.assign_lsn(&slot, 1);
        let result = limbo.wait_complete(&slot, || false);
        assert_eq!(result, WaitResult::Success);
        assert_eq!(limbo.confirmed_lsn(), 1);
    }

    #[test]
    fn test_quorum_of_two_needs_peer_ack() {
        let (limbo, _journal, _dir) = test_limbo(2);
        limbo.set_registered_count(3);
        promote_self(&limbo, 1);

        let slot = limbo.submit(0, 10, true).unwrap();
        limbo.assign_lsn(&slot, 1);
        assert_eq!(limbo.volatile_confirmed_lsn(), 0);
        assert!(!slot.is_complete());

        limbo.ack(2, 1);
        let result = limbo.wait_complete(&slot, || false);
        assert_eq!(result, WaitResult::Success);
        assert_eq!(limbo.confirmed_lsn(), 1);
    }

    #[test]
    fn test_bootstrap_quorum_truncation() {
        let (limbo, _journal, _dir) = test_limbo(3);
        // Only one peer registered so far: the effective quorum is 1.
        limbo.set_registered_count(1);
        promote_self(&limbo, 1);

        let slot = limbo.submit(0, 10, true).unwrap();
        limbo.assign_lsn(&slot, 1);
        assert_eq!(limbo.wait_complete(&slot, || false), WaitResult::Success);
    }

    #[test]
    fn test_promote_split_brain_rejections() {
        let (limbo, _journal, _dir) = test_limbo(1);
        limbo.filter_enable();
        promote_self(&limbo, 5);
        assert_eq!(limbo.term(), 5);
        assert_eq!(limbo.owner_id(), 1);

        // Same term again: rejected even with a matching lsn.
        let stale = SynchroRequest::promote(2, 1, limbo.confirmed_lsn(), 5);
        assert!(matches!(limbo.process(&stale), Err(Error::SplitBrain(_))));
        assert_eq!(limbo.owner_id(), 1);
        assert_eq!(limbo.term(), 5);

        // Newer term: accepted, ownership moves.
        let fresh = SynchroRequest::promote(2, 1, limbo.confirmed_lsn(), 6);
        limbo.process(&fresh).unwrap();
        assert_eq!(limbo.owner_id(), 2);
        assert_eq!(limbo.term(), 6);
        assert_eq!(limbo.state(), LimboState::Replica);
    }

    #[test]
    fn test_promote_from_processed_range_rejected() {
        let (limbo, _journal, _dir) = test_limbo(1);
        limbo.filter_enable();
        promote_self(&limbo, 1);

        let slot = limbo.submit(0, 10, true).unwrap();
        limbo.assign_lsn(&slot, 1);
        assert_eq!(limbo.wait_complete(&slot, || false), WaitResult::Success);
        assert_eq!(limbo.confirmed_lsn(), 1);

        let past = SynchroRequest::promote(2, 1, 0, 9);
        assert!(matches!(limbo.process(&past), Err(Error::SplitBrain(_))));
    }

    #[test]
    fn test_confirm_from_foreign_owner_rejected() {
        let (limbo, _journal, _dir) = test_limbo(1);
        limbo.filter_enable();
        promote_self(&limbo, 1);

        let foreign = SynchroRequest::confirm(2, 1);
        assert!(matches!(limbo.process(&foreign), Err(Error::SplitBrain(_))));
    }

    #[test]
    fn test_demote_confirms_pending_entry() {
        let (limbo, _journal, _dir) = test_limbo(2);
        limbo.set_registered_count(3);
        promote_self(&limbo, 1);

        let slot = limbo.submit(0, 10, true).unwrap();
        limbo.assign_lsn(&slot, 7);
        assert!(!slot.is_complete());

        // DEMOTE with the border at the pending lsn: the entry commits and
        // the queue empties, ownership cleared.
        limbo
            .process(&SynchroRequest::demote(1, 1, 7, 2))
            .unwrap();
        assert_eq!(slot.state(), EntryState::Commit);
        assert!(limbo.is_empty());
        assert_eq!(limbo.owner_id(), 0);
        assert_eq!(limbo.term(), 2);
        assert_eq!(limbo.state(), LimboState::Inactive);
    }

    #[test]
    fn test_submission_during_transition_fails() {
        let (limbo, _journal, _dir) = test_limbo(1);
        promote_self(&limbo, 1);
        {
            let mut inner = limbo.shared.inner.lock().unwrap();
            inner.is_in_rollback = true;
        }
        assert!(matches!(limbo.submit(0, 10, true), Err(Error::SyncRollback)));
        {
            let mut inner = limbo.shared.inner.lock().unwrap();
            inner.is_in_rollback = false;
        }
    }

    #[test]
    fn test_wait_confirm_empty_queue() {
        let (limbo, _journal, _dir) = test_limbo(1);
        assert!(limbo.wait_confirm(|| false).is_ok());
    }

    #[test]
    fn test_checkpoint_snapshot_carries_confirmed_vclock() {
        let (limbo, _journal, _dir) = test_limbo(1);
        promote_self(&limbo, 3);
        let slot = limbo.submit(0, 10, true).unwrap();
        limbo.assign_lsn(&slot, 1);
        assert_eq!(limbo.wait_complete(&slot, || false), WaitResult::Success);

        let snapshot = limbo.checkpoint();
        assert_eq!(snapshot.peer_id, 1);
        assert_eq!(snapshot.lsn, 1);
        assert_eq!(snapshot.term, 3);
        assert!(snapshot.confirmed_vclock.is_some());
    }

    #[test]
    fn test_restore_from_checkpoint() {
        let (limbo, _journal, _dir) = test_limbo(1);
        let mut confirmed = Vclock::new();
        confirmed.follow(2, 15);
        let snapshot = SynchroRequest {
            kind: SynchroKind::Promote,
            origin_id: 0,
            peer_id: 2,
            lsn: 15,
            term: 4,
            confirmed_vclock: Some(confirmed),
        };
        limbo.restore(&snapshot);
        assert_eq!(limbo.owner_id(), 2);
        assert_eq!(limbo.confirmed_lsn(), 15);
        assert_eq!(limbo.term(), 4);
        assert_eq!(limbo.state(), LimboState::Replica);
    }
}
