//! Transaction state machine
//!
//! A transaction stages statements with their rollback triggers, then at
//! commit assembles one journal entry, parks itself in the limbo when any
//! row touches synchronous data, and finishes by firing its triggers:
//! commit triggers in reverse registration order (so earlier triggers see
//! later triggers' effects), rollback triggers in statement order.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::IsolationLevel;
use crate::error::{error_from_signature, signature, Error, Result};
use crate::journal::{Journal, JournalEntry};
use crate::limbo::{CancelToken, EntryState, Limbo, LimboSlot, WaitResult};
use crate::row::{GroupId, Row, RowFlags, RowKind};

/// Maximal depth of nested sub-statements.
pub const SUB_STMT_MAX: usize = 3;

/// Definition of the target space of a statement; the subset of space
/// metadata the write path consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceDef {
    pub id: u32,
    pub name: String,
    /// Writes need a quorum of acks before commit.
    pub is_sync: bool,
    /// Replication group of the space's rows.
    pub group: GroupId,
    /// Temporary spaces produce no journal rows.
    pub is_temporary: bool,
}

impl SpaceDef {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            is_sync: false,
            group: GroupId::Default,
            is_temporary: false,
        }
    }

    pub fn sync(id: u32, name: &str) -> Self {
        Self {
            is_sync: true,
            ..Self::new(id, name)
        }
    }

    pub fn local(id: u32, name: &str) -> Self {
        Self {
            group: GroupId::Local,
            ..Self::new(id, name)
        }
    }
}

/// Payload of a DML row; opaque to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DmlBody {
    space_id: u32,
    old_tuple: Option<Vec<u8>>,
    new_tuple: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    /// Sent to a read view by a conflict; aborts on the next write.
    InReadView,
    Aborted,
    Prepared,
    Committed,
}

/// A transaction trigger. Runs exactly once; a decided transaction cannot
/// be failed by its triggers, so they return nothing.
pub type TxnTrigger = Box<dyn FnOnce(&Txn) + Send + 'static>;

/// A fallible check run at prepare time - the engine's conflict-detection
/// seam. A failure aborts the commit before anything reaches the journal.
pub type PrepareHook = Box<dyn FnOnce(&Txn) -> Result<()> + Send + 'static>;

/// One staged statement.
pub struct Stmt {
    pub space: Option<SpaceDef>,
    pub kind: RowKind,
    row: Option<Row>,
    on_commit: Vec<TxnTrigger>,
    on_rollback: Vec<TxnTrigger>,
}

/// A savepoint handle; valid for the transaction that created it.
#[derive(Debug, Clone)]
pub struct Savepoint {
    stmt_count: usize,
    name: Option<String>,
}

pub struct Txn {
    pub id: u64,
    /// Prepare sequence number; 0 until prepared, then strictly less than
    /// any later prepare.
    pub psn: i64,
    status: TxnStatus,
    isolation: IsolationLevel,
    stmts: Vec<Stmt>,
    savepoints: Vec<Savepoint>,
    wait_sync: bool,
    wait_ack: bool,
    force_async: bool,
    can_yield: bool,
    on_commit: Vec<TxnTrigger>,
    on_rollback: Vec<TxnTrigger>,
    on_wal_write: Vec<TxnTrigger>,
    prepare_hooks: Vec<PrepareHook>,
    /// Commit LSN once decided, or a negative failure code.
    signature: i64,
    limbo_slot: Option<Arc<LimboSlot>>,
    deadline: Option<Instant>,
    fk_deferred_count: u64,
    in_sub_stmt: usize,
    cancel: CancelToken,
}

impl Txn {
    pub(crate) fn new(id: u64, isolation: IsolationLevel, timeout: Option<Duration>) -> Txn {
        Txn {
            id,
            psn: 0,
            status: TxnStatus::InProgress,
            isolation,
            stmts: Vec::new(),
            savepoints: Vec::new(),
            wait_sync: false,
            wait_ack: false,
            force_async: false,
            can_yield: true,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
            on_wal_write: Vec::new(),
            prepare_hooks: Vec::new(),
            signature: signature::UNKNOWN,
            limbo_slot: None,
            deadline: timeout.map(|t| Instant::now() + t),
            fk_deferred_count: 0,
            in_sub_stmt: 0,
            cancel: CancelToken::new(),
        }
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn signature(&self) -> i64 {
        self.signature
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn statements(&self) -> &[Stmt] {
        &self.stmts
    }

    /// Token to cancel this transaction's blocking waits from elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn check_can_continue(&self) -> Result<()> {
        match self.status {
            TxnStatus::Aborted => Err(Error::Transaction(
                "Transaction has been aborted".to_string(),
            )),
            TxnStatus::Committed | TxnStatus::Prepared => Err(Error::ActiveTransaction),
            _ => Ok(()),
        }
    }

    fn check_deadline(&mut self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.status = TxnStatus::Aborted;
                return Err(Error::Transaction(
                    "Transaction has been aborted by timeout".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Set the isolation level. Only allowed before the first statement.
    pub fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        if !self.stmts.is_empty() {
            return Err(Error::ActiveTransaction);
        }
        self.isolation = level;
        Ok(())
    }

    /// Install a rollback deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Allow or forbid yields. Returns the previous value.
    pub fn set_can_yield(&mut self, can_yield: bool) -> bool {
        std::mem::replace(&mut self.can_yield, can_yield)
    }

    /// Bypass the limbo even when synchronous transactions are pending.
    pub fn set_force_async(&mut self) {
        self.force_async = true;
    }

    /// An implicit suspension point in the owner's task. A transaction that
    /// may not yield is aborted here.
    pub fn yield_point(&mut self) -> Result<()> {
        if self.status == TxnStatus::InProgress && !self.can_yield {
            self.status = TxnStatus::Aborted;
            return Err(Error::Transaction(
                "Transaction has been aborted by a fiber yield".to_string(),
            ));
        }
        Ok(())
    }

    /// Send the transaction to a read view; the next write aborts it.
    pub fn enter_read_view(&mut self) {
        if self.status == TxnStatus::InProgress {
            self.status = TxnStatus::InReadView;
        }
    }

    pub fn add_deferred_fk(&mut self) {
        self.fk_deferred_count += 1;
    }

    pub fn resolve_deferred_fk(&mut self) {
        debug_assert!(self.fk_deferred_count > 0);
        self.fk_deferred_count -= 1;
    }

    /// Stage one statement. Returns its index, usable to attach triggers.
    pub fn add_statement(
        &mut self,
        kind: RowKind,
        space: SpaceDef,
        old_tuple: Option<Vec<u8>>,
        new_tuple: Option<Vec<u8>>,
    ) -> Result<usize> {
        debug_assert!(kind.is_dml() || kind == RowKind::Nop);
        if self.status == TxnStatus::InReadView {
            self.status = TxnStatus::Aborted;
            return Err(Error::Transaction(
                "Transaction has been aborted by conflict".to_string(),
            ));
        }
        self.check_can_continue()?;
        self.check_deadline()?;

        let row = if space.is_temporary {
            None
        } else {
            let body = DmlBody {
                space_id: space.id,
                old_tuple: old_tuple.clone(),
                new_tuple: new_tuple.clone(),
            };
            let body = bincode::serialize(&body)
                .map_err(|e| Error::Protocol(format!("cannot encode statement: {}", e)))?;
            Some(Row::dml(kind, space.group, body))
        };
        self.stmts.push(Stmt {
            space: Some(space),
            kind,
            row,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        });
        Ok(self.stmts.len() - 1)
    }

    /// Stage a barrier row carrying no data.
    pub fn add_nop(&mut self) -> Result<usize> {
        self.check_can_continue()?;
        self.check_deadline()?;
        self.stmts.push(Stmt {
            space: None,
            kind: RowKind::Nop,
            row: Some(Row::nop()),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        });
        Ok(self.stmts.len() - 1)
    }

    /// Attach a rollback trigger to a staged statement.
    pub fn on_stmt_rollback(&mut self, stmt_idx: usize, trigger: TxnTrigger) {
        self.stmts[stmt_idx].on_rollback.push(trigger);
    }

    /// Attach a commit trigger to a staged statement; it joins the
    /// transaction's commit triggers at assembly.
    pub fn on_stmt_commit(&mut self, stmt_idx: usize, trigger: TxnTrigger) {
        self.stmts[stmt_idx].on_commit.push(trigger);
    }

    pub fn on_commit(&mut self, trigger: TxnTrigger) {
        self.on_commit.push(trigger);
    }

    pub fn on_rollback(&mut self, trigger: TxnTrigger) {
        self.on_rollback.push(trigger);
    }

    pub fn on_wal_write(&mut self, trigger: TxnTrigger) {
        self.on_wal_write.push(trigger);
    }

    /// Install an engine conflict check, run at prepare.
    pub fn on_prepare(&mut self, hook: PrepareHook) {
        self.prepare_hooks.push(hook);
    }

    /// Enter a nested statement scope.
    pub fn begin_sub_stmt(&mut self) -> Result<()> {
        if self.in_sub_stmt >= SUB_STMT_MAX {
            return Err(Error::SubStmtMax);
        }
        self.in_sub_stmt += 1;
        Ok(())
    }

    pub fn end_sub_stmt(&mut self) {
        debug_assert!(self.in_sub_stmt > 0);
        self.in_sub_stmt -= 1;
    }

    /// Require that nothing was staged yet; some contexts only allow
    /// single-statement transactions.
    pub fn check_single_statement(&self, context: &str) -> Result<()> {
        if !self.stmts.is_empty() {
            return Err(Error::MultistatementTransaction(context.to_string()));
        }
        Ok(())
    }

    /// Create a savepoint. A named savepoint replaces an earlier one with
    /// the same name.
    pub fn savepoint(&mut self, name: Option<&str>) -> Savepoint {
        if let Some(name) = name {
            self.savepoints
                .retain(|sv| sv.name.as_deref() != Some(name));
        }
        let sv = Savepoint {
            stmt_count: self.stmts.len(),
            name: name.map(str::to_string),
        };
        self.savepoints.push(sv.clone());
        sv
    }

    pub fn savepoint_by_name(&self, name: &str) -> Option<Savepoint> {
        self.savepoints
            .iter()
            .rev()
            .find(|sv| sv.name.as_deref() == Some(name))
            .cloned()
    }

    /// Roll back to a savepoint: statements staged after it are undone in
    /// reverse order, their rollback triggers fired. The transaction stays
    /// open.
    pub fn rollback_to_savepoint(&mut self, sv: &Savepoint) -> Result<()> {
        self.check_can_continue()?;
        if sv.stmt_count > self.stmts.len() {
            return Err(Error::Transaction(
                "Can not rollback to savepoint: the savepoint does not exist".to_string(),
            ));
        }
        let mut undone = self.stmts.split_off(sv.stmt_count);
        let mut triggers = Vec::new();
        for stmt in undone.iter_mut().rev() {
            triggers.append(&mut stmt.on_rollback);
        }
        drop(undone);
        for trigger in triggers {
            trigger(self);
        }
        let kept = self.stmts.len();
        self.savepoints.retain(|s| s.stmt_count <= kept);
        Ok(())
    }

    /// Prepare: verify constraints, stamp the psn, run the engine conflict
    /// checks, fix the status.
    fn prepare(&mut self, psn_counter: &AtomicI64) -> Result<()> {
        self.check_can_continue()?;
        self.check_deadline()?;
        if self.fk_deferred_count != 0 {
            return Err(Error::FkConstraint);
        }
        debug_assert_eq!(self.psn, 0);
        self.psn = psn_counter.fetch_add(1, Ordering::SeqCst);
        let hooks = std::mem::take(&mut self.prepare_hooks);
        for hook in hooks {
            if let Err(e) = hook(self) {
                self.psn = 0;
                return Err(e);
            }
        }
        // Past the point of no return: yields can't abort anymore.
        self.can_yield = true;
        self.status = TxnStatus::Prepared;
        Ok(())
    }

    /// Assemble the journal entry: one row per statement that has one, a
    /// trailing NOP when the last row is local but the transaction is not,
    /// and the sync flags per the limbo state.
    fn build_journal_entry(&mut self, limbo_is_empty: bool) -> JournalEntry {
        let mut rows = Vec::new();
        let mut is_sync = false;
        let mut is_fully_nop = true;
        let mut n_local = 0usize;

        let stmts = std::mem::take(&mut self.stmts);
        let mut kept = Vec::with_capacity(stmts.len());
        for mut stmt in stmts {
            self.on_commit.append(&mut stmt.on_commit);
            if let Some(row) = stmt.row.take() {
                if row.kind != RowKind::Nop {
                    is_fully_nop = false;
                    is_sync |= stmt
                        .space
                        .as_ref()
                        .map(|s| s.is_sync)
                        .unwrap_or(false);
                }
                if row.group == GroupId::Local {
                    n_local += 1;
                }
                rows.push(row);
            }
            kept.push(stmt);
        }
        self.stmts = kept;

        // A local row may not terminate a replicated transaction: the
        // replication stream needs a global row carrying `is_commit`.
        if n_local > 0
            && n_local != rows.len()
            && rows.last().map(|r| r.group == GroupId::Local).unwrap_or(false)
        {
            rows.push(Row::nop());
        }

        let mut flags = RowFlags::default();
        if !self.force_async && !is_fully_nop {
            if is_sync {
                flags.wait_sync = true;
                flags.wait_ack = true;
            } else if !limbo_is_empty {
                // Pending sync transactions act as a barrier even for
                // asynchronous ones behind them.
                flags.wait_sync = true;
            }
        }
        self.wait_sync = flags.wait_sync;
        self.wait_ack = flags.wait_ack;
        JournalEntry::with_flags(rows, flags)
    }

    fn has_rows(&self) -> bool {
        self.stmts.iter().any(|s| s.row.is_some())
    }

    /// Finish a decided, successful transaction: fire wal-write leftovers
    /// and commit triggers, in reverse registration order.
    fn complete_success(&mut self) {
        debug_assert!(self.signature >= 0);
        self.status = TxnStatus::Committed;
        let triggers = std::mem::take(&mut self.on_commit);
        for trigger in triggers.into_iter().rev() {
            trigger(self);
        }
        self.on_rollback.clear();
    }

    /// Finish a failed transaction: per-statement rollback triggers in
    /// statement order (each statement's rollback sees the schema restored
    /// by earlier-statement rollbacks), then the transaction's rollback
    /// triggers in registration order.
    fn complete_fail(&mut self) {
        debug_assert!(self.signature < 0);
        self.status = TxnStatus::Aborted;
        let mut stmt_triggers = Vec::new();
        for stmt in self.stmts.iter_mut() {
            stmt_triggers.append(&mut stmt.on_rollback);
        }
        for trigger in stmt_triggers {
            trigger(self);
        }
        let triggers = std::mem::take(&mut self.on_rollback);
        for trigger in triggers {
            trigger(self);
        }
        self.on_commit.clear();
    }

    fn run_wal_write_triggers(&mut self) {
        debug_assert!(self.signature >= 0);
        let triggers = std::mem::take(&mut self.on_wal_write);
        for trigger in triggers {
            trigger(self);
        }
    }

    /// User-requested rollback.
    pub(crate) fn rollback_impl(mut self) {
        debug_assert_eq!(self.signature, signature::UNKNOWN);
        self.signature = signature::ROLLBACK;
        self.complete_fail();
    }

    fn fail_with(mut self, sig: i64) -> Error {
        self.signature = sig;
        self.complete_fail();
        error_from_signature(sig)
    }

    /// Blocking commit. Returns once the transaction is durably committed
    /// (and confirmed, for synchronous ones) or rolled back.
    pub(crate) fn commit_impl(
        mut self,
        journal: &Journal,
        limbo: &Limbo,
        self_id: u32,
        psn_counter: &AtomicI64,
    ) -> Result<()> {
        if self.in_sub_stmt > 0 {
            self.rollback_impl();
            return Err(Error::CommitInSubStmt);
        }
        if let Err(e) = self.prepare(psn_counter) {
            self.signature = signature::ROLLBACK;
            self.complete_fail();
            return Err(e);
        }
        if !self.has_rows() {
            // No journal I/O for an empty transaction.
            self.signature = 0;
            self.complete_success();
            return Ok(());
        }

        let entry = self.build_journal_entry(limbo.is_empty());
        if entry.flags.wait_sync {
            match limbo.submit(0, entry.approx_len, entry.flags.wait_ack) {
                Ok(slot) => self.limbo_slot = Some(slot),
                Err(e) => {
                    self.signature = signature::SYNC_ROLLBACK;
                    self.complete_fail();
                    return Err(e);
                }
            }
        }

        let done = journal.submit_and_wait(entry);
        if done.signature < 0 {
            if let Some(slot) = self.limbo_slot.take() {
                limbo.abort(&slot, done.signature);
            }
            return Err(self.fail_with(done.signature));
        }

        self.signature = done.signature;
        self.run_wal_write_triggers();

        if let Some(slot) = self.limbo_slot.take() {
            let lsn = done.last_lsn();
            limbo.assign_lsn(&slot, lsn);
            if self.wait_ack {
                limbo.ack(self_id, lsn);
            }
            let cancel = self.cancel.clone();
            match limbo.wait_complete(&slot, || cancel.is_cancelled()) {
                WaitResult::Success => {}
                WaitResult::FailComplete(sig) => {
                    return Err(self.fail_with(sig));
                }
                WaitResult::FailDetach => {
                    // The entry stays in the limbo and resolves on its own;
                    // the transaction finishes whenever it does.
                    slot.set_on_complete(Box::new(move |state, sig| {
                        let mut txn = self;
                        if state == EntryState::Commit {
                            txn.complete_success();
                        } else {
                            txn.signature = sig;
                            txn.complete_fail();
                        }
                    }));
                    return Err(Error::Cancelled);
                }
            }
        }
        self.complete_success();
        Ok(())
    }

    /// Fire-and-forget commit: submit to the journal and return. The
    /// outcome is delivered through the transaction's triggers.
    pub(crate) fn commit_try_async_impl(
        mut self,
        journal: &Arc<Journal>,
        limbo: &Arc<Limbo>,
        self_id: u32,
        psn_counter: &AtomicI64,
    ) -> Result<()> {
        if self.in_sub_stmt > 0 {
            self.rollback_impl();
            return Err(Error::CommitInSubStmt);
        }
        if let Err(e) = self.prepare(psn_counter) {
            self.signature = signature::ROLLBACK;
            self.complete_fail();
            return Err(e);
        }
        if !self.has_rows() {
            self.signature = 0;
            self.complete_success();
            return Ok(());
        }

        let entry = self.build_journal_entry(limbo.is_empty());
        let slot = if entry.flags.wait_sync {
            match limbo.submit(0, entry.approx_len, entry.flags.wait_ack) {
                Ok(slot) => {
                    self.limbo_slot = Some(Arc::clone(&slot));
                    Some(slot)
                }
                Err(e) => {
                    self.signature = signature::SYNC_ROLLBACK;
                    self.complete_fail();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let limbo = Arc::clone(limbo);
        let wait_ack = self.wait_ack;
        journal.submit(
            entry,
            Box::new(move |done| {
                let mut txn = self;
                if done.signature < 0 {
                    if let Some(slot) = txn.limbo_slot.take() {
                        limbo.abort(&slot, done.signature);
                    }
                    txn.signature = done.signature;
                    txn.complete_fail();
                    return;
                }
                txn.signature = done.signature;
                txn.run_wal_write_triggers();
                match slot {
                    None => txn.complete_success(),
                    Some(slot) => {
                        let lsn = done.last_lsn();
                        limbo.assign_lsn(&slot, lsn);
                        if wait_ack {
                            limbo.ack(self_id, lsn);
                        }
                        txn.limbo_slot.take();
                        slot.set_on_complete(Box::new(move |state, sig| {
                            let mut txn = txn;
                            if state == EntryState::Commit {
                                txn.complete_success();
                            } else {
                                txn.signature = sig;
                                txn.complete_fail();
                            }
                        }));
                    }
                }
            }),
        );
        Ok(())
    }
}
