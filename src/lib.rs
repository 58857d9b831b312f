//! minisync - a minimal synchronously-replicated transaction log core
//!
//! The replicated write path of a database node: transactions are staged,
//! journaled with assigned LSNs, optionally held in a quorum limbo, and
//! finished by triggers - with raft-style elections deciding which node may
//! issue synchronous writes. Storage engines, the network codec and the
//! replication transport are collaborators, reached through row payloads,
//! the raft outbox and the ack entry points.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod journal;
pub mod limbo;
pub mod raft;
pub mod row;
pub mod txn;
pub mod vclock;

pub use config::{Config, ElectionMode, IsolationLevel, LogMode};
pub use error::{Error, Result};

use checkpoint::CheckpointMarker;
use journal::recovery::JournalRecovery;
use journal::Journal;
use limbo::{CancelToken, Limbo};
use raft::{RaftMessage, RaftNode, RaftState};
use row::{RaftRecord, Row, RowKind, SynchroRequest};
use txn::Txn;
use vclock::Vclock;

/// One replication-core instance: exactly one journal, one limbo and one
/// raft state machine per process, wired together.
pub struct Node {
    config: Config,
    raft: Arc<RaftNode>,
    limbo: Arc<Limbo>,
    journal: Arc<Journal>,
    next_txn_id: AtomicU64,
    next_psn: AtomicI64,
    checkpoint_stop: CancelToken,
    checkpoint_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Boot a node: replay the journal, restore limbo and raft state, then
    /// bring the subsystems up.
    pub fn new(config: Config) -> Result<Node> {
        std::fs::create_dir_all(&config.data_dir)?;

        // Replay pass. Synchro and raft rows feed the core's own state;
        // data rows are the storage engine's business and only move the
        // vclock here.
        let mut raft_record: Option<RaftRecord> = None;
        let mut synchro_log: Vec<SynchroRequest> = Vec::new();
        let recovery = JournalRecovery::new(config.data_dir.clone(), config.force_recovery);
        let recovered = recovery.replay(|row: &Row| {
            match row.kind {
                RowKind::Raft => raft_record = Some(row.raft_state()?),
                kind if kind.is_synchro() => synchro_log.push(row.synchro_request()?),
                _ => {}
            }
            Ok(())
        })?;

        let checkpoint_vclock = recovered
            .marker
            .as_ref()
            .map(|m| m.vclock.clone())
            .unwrap_or_default();
        let journal = Arc::new(Journal::open(
            &config,
            recovered.vclock.clone(),
            checkpoint_vclock,
        )?);
        let limbo = Arc::new(Limbo::new(&config, Arc::clone(&journal)));
        let raft = Arc::new(RaftNode::new(&config, Arc::clone(&journal)));

        // Restore the core state in log order: the checkpoint snapshot,
        // then everything journaled after it.
        if let Some(marker) = &recovered.marker {
            if let Some(snapshot) = &marker.limbo {
                limbo.restore(snapshot);
            }
            if raft_record.is_none() {
                raft_record = marker.raft;
            }
        }
        for req in &synchro_log {
            limbo.process_recovered(req)?;
        }
        if let Some(record) = &raft_record {
            raft.process_recovery(record);
        }
        limbo.finish_recovery();
        limbo.filter_enable();

        // Raft decides who owns the limbo. The gate is off in the raft-less
        // election modes so a manual PROMOTE can grant leadership.
        let raft_gates_limbo = matches!(
            config.election_mode,
            ElectionMode::Candidate | ElectionMode::Voter
        );
        {
            let limbo = Arc::clone(&limbo);
            let self_id = config.peer_id;
            raft.on_update(Box::new(move |status| {
                let is_leader = status.state == RaftState::Leader && status.leader == self_id;
                limbo.set_raft_status(
                    raft_gates_limbo && status.is_enabled,
                    is_leader,
                    status.volatile_term,
                );
                if is_leader && limbo.term() < status.volatile_term {
                    // Freshly elected: take the queue over. Everything this
                    // node holds of the old timeline is confirmed up to the
                    // border; re-emission to peers restarts right after it.
                    if limbo.flush(|| false).is_ok() {
                        let lsn = limbo.promote_border();
                        if let Err(e) = limbo.write_promote(lsn, status.volatile_term) {
                            log::error!("failed to promote after election: {}", e);
                        }
                    }
                }
            }));
        }
        if config.election_mode != ElectionMode::Off {
            raft.cfg_enable(true);
        }

        let node = Node {
            raft,
            limbo,
            journal,
            next_txn_id: AtomicU64::new(1),
            next_psn: AtomicI64::new(1),
            checkpoint_stop: CancelToken::new(),
            checkpoint_worker: Mutex::new(None),
            config,
        };
        node.start_checkpoint_worker();
        info!(
            "node {} is up, vclock {}",
            node.config.peer_id,
            node.journal.vclock()
        );
        Ok(node)
    }

    fn start_checkpoint_worker(&self) {
        let interval = match self.config.checkpoint_interval {
            Some(seconds) if seconds > 0.0 => Duration::from_secs_f64(seconds),
            _ => return,
        };
        let journal = Arc::clone(&self.journal);
        let limbo = Arc::clone(&self.limbo);
        let raft = Arc::clone(&self.raft);
        let dir = self.config.data_dir.clone();
        let stop = self.checkpoint_stop.clone();
        let worker = std::thread::Builder::new()
            .name("checkpoint".to_string())
            .spawn(move || {
                checkpoint::checkpoint_interval_loop(journal, limbo, raft, dir, interval, stop)
            })
            .expect("failed to spawn the checkpoint worker");
        *self.checkpoint_worker.lock().unwrap() = Some(worker);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn limbo(&self) -> &Arc<Limbo> {
        &self.limbo
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn vclock(&self) -> Vclock {
        self.journal.vclock()
    }

    /// Tell the core how many peers are registered; affects both election
    /// and bootstrap-time limbo quorums.
    pub fn set_registered_count(&self, count: usize) {
        self.limbo.set_registered_count(count);
        self.raft.set_registered_count(count);
    }

    /// Open a transaction.
    pub fn begin(&self) -> Txn {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let isolation = match self.config.txn_isolation {
            IsolationLevel::Default => IsolationLevel::BestEffort,
            level => level,
        };
        let timeout = self.config.txn_timeout.map(Duration::from_secs_f64);
        Txn::new(id, isolation, timeout)
    }

    /// Commit and wait for the outcome, quorum included.
    pub fn commit(&self, txn: Txn) -> Result<()> {
        txn.commit_impl(
            &self.journal,
            &self.limbo,
            self.config.peer_id,
            &self.next_psn,
        )
    }

    /// Submit the commit and return immediately; the outcome is delivered
    /// through the transaction's triggers.
    pub fn commit_try_async(&self, txn: Txn) -> Result<()> {
        txn.commit_try_async_impl(
            &self.journal,
            &self.limbo,
            self.config.peer_id,
            &self.next_psn,
        )
    }

    /// Roll a transaction back on user request.
    pub fn rollback(&self, txn: Txn) {
        txn.rollback_impl();
    }

    /// Deliver a peer's ack of the owner's stream.
    pub fn ack(&self, peer_id: u32, lsn: i64) {
        self.limbo.ack(peer_id, lsn);
    }

    /// Apply an inbound CONFIRM/ROLLBACK/PROMOTE/DEMOTE.
    pub fn process_synchro(&self, req: &SynchroRequest) -> Result<()> {
        self.limbo.process(req)
    }

    /// Apply an inbound raft message.
    pub fn process_raft_msg(&self, msg: &RaftMessage, source: u32) -> Result<()> {
        self.raft.process_msg(msg, source)
    }

    pub fn process_raft_heartbeat(&self, source: u32) {
        self.raft.process_heartbeat(source);
    }

    /// Manually claim limbo ownership: confirm everything this node has of
    /// the current owner's stream and take over in a fresh term.
    pub fn promote_self(&self) -> Result<()> {
        self.limbo.flush(|| false)?;
        let lsn = self.limbo.promote_border();
        let term = self.limbo.term() + 1;
        self.limbo.write_promote(lsn, term)
    }

    /// Step down: confirm what this node has and clear ownership.
    pub fn demote_self(&self) -> Result<()> {
        if !self.limbo.is_owned_by_self() {
            return Ok(());
        }
        self.limbo.flush(|| false)?;
        let lsn = self.limbo.promote_border();
        let term = self.limbo.term() + 1;
        self.limbo.write_demote(lsn, term)
    }

    /// Run the checkpoint barrier now.
    pub fn checkpoint(&self, cancel: &CancelToken) -> Result<CheckpointMarker> {
        checkpoint::checkpoint_build(
            &self.journal,
            &self.limbo,
            &self.raft,
            &self.config.data_dir,
            cancel,
        )
    }

    /// Orderly teardown: stop the periodic checkpointing, then the raft,
    /// limbo and journal workers, in that order.
    pub fn shutdown(&self) {
        self.checkpoint_stop.cancel();
        if let Some(worker) = self.checkpoint_worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        self.raft.shutdown();
        self.limbo.shutdown();
        self.journal.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
