//! Raft-style leader election
//!
//! Only the election half of Raft: it decides who may issue synchronous
//! writes by feeding the limbo's ownership, it does not replicate a log.
//! Log positions are whole vclocks here, so a vote requires component-wise
//! dominance of the candidate's vclock, not a single-number comparison.
//!
//! Persistent state is `(term, vote)` only, written through the journal.
//! Volatile mirrors exist so decisions made while a write is still in flight
//! (like refusing a second vote in the same term) hold immediately. While
//! anything is unflushed the node stays a follower.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ElectionMode};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::row::RaftRecord;
use crate::vclock::{Vclock, VclockCmp};

/// Maximal random deviation of the election timeout, as a fraction of the
/// configured value.
const RANDOM_ELECTION_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Can't write. Monitors an existing leader or an ongoing election.
    Follower,
    /// Voted for self, waiting for the election outcome.
    Candidate,
    /// Election won; synchronous writes allowed.
    Leader,
}

/// A raft state message as sent between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftMessage {
    pub term: u64,
    /// Peer the sender voted for in `term`; 0 when it hasn't voted.
    pub vote: u32,
    pub state: RaftState,
    /// Candidates attach their vclock so voters can check dominance.
    pub vclock: Option<Vclock>,
}

/// Visible raft attributes, delivered to update subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    pub state: RaftState,
    pub term: u64,
    pub volatile_term: u64,
    pub leader: u32,
    pub is_enabled: bool,
}

pub type OnRaftUpdate = Box<dyn Fn(RaftStatus) + Send + 'static>;

struct RaftCore {
    self_id: u32,
    /// Instance ID of the leader of the current term; 0 when unknown.
    leader: u32,
    state: RaftState,
    volatile_term: u64,
    volatile_vote: u32,
    is_enabled: bool,
    is_candidate: bool,
    is_cfg_candidate: bool,
    is_write_in_progress: bool,
    is_broadcast_scheduled: bool,
    /// Persisted state, what other nodes are told.
    term: u64,
    vote: u32,
    votes_received: BTreeSet<u32>,
    election_timeout: Duration,
    configured_quorum: usize,
    registered_count: usize,
    /// Single state-machine timer; expiry always means "start a new
    /// election round".
    timer_deadline: Option<Instant>,
    shutdown: bool,
}

impl RaftCore {
    fn is_fully_on_disk(&self) -> bool {
        self.volatile_term == self.term && self.volatile_vote == self.vote
    }

    /// Election quorum may be truncated to the number of registered peers
    /// during bootstrap; synchronous replication quorum never is.
    fn election_quorum(&self) -> usize {
        self.configured_quorum.min(self.registered_count).max(1)
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            state: self.state,
            term: self.term,
            volatile_term: self.volatile_term,
            leader: self.leader,
            is_enabled: self.is_enabled,
        }
    }
}

struct RaftShared {
    core: Mutex<RaftCore>,
    cond: Condvar,
    journal: Arc<Journal>,
    outboxes: Mutex<Vec<Sender<RaftMessage>>>,
    on_update: Mutex<Vec<OnRaftUpdate>>,
}

/// The raft node: the state machine plus its worker thread handling
/// persistence, broadcasts and the election timer.
pub struct RaftNode {
    shared: Arc<RaftShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RaftNode {
    pub fn new(config: &Config, journal: Arc<Journal>) -> RaftNode {
        let shared = Arc::new(RaftShared {
            core: Mutex::new(RaftCore {
                self_id: config.peer_id,
                leader: 0,
                state: RaftState::Follower,
                volatile_term: 1,
                volatile_vote: 0,
                is_enabled: false,
                is_candidate: false,
                is_cfg_candidate: matches!(config.election_mode, ElectionMode::Candidate),
                is_write_in_progress: false,
                is_broadcast_scheduled: false,
                term: 1,
                vote: 0,
                votes_received: BTreeSet::new(),
                election_timeout: Duration::from_secs_f64(config.election_timeout),
                configured_quorum: config.sync_quorum.max(1),
                registered_count: 1,
                timer_deadline: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            journal,
            outboxes: Mutex::new(Vec::new()),
            on_update: Mutex::new(Vec::new()),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("raft-worker".to_string())
            .spawn(move || raft_worker_loop(worker_shared))
            .expect("failed to spawn the raft worker");
        // Not enabled here: recovery must restore (term, vote) first. The
        // node wiring calls `cfg_enable` once the journal is replayed.
        RaftNode {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn state(&self) -> RaftState {
        self.shared.core.lock().unwrap().state
    }

    pub fn term(&self) -> u64 {
        self.shared.core.lock().unwrap().term
    }

    pub fn volatile_term(&self) -> u64 {
        self.shared.core.lock().unwrap().volatile_term
    }

    pub fn leader(&self) -> u32 {
        self.shared.core.lock().unwrap().leader
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.core.lock().unwrap().is_enabled
    }

    pub fn status(&self) -> RaftStatus {
        self.shared.core.lock().unwrap().status()
    }

    /// Whether rows from `source` may be applied: everything when raft is
    /// off, only the leader's otherwise.
    pub fn is_source_allowed(&self, source: u32) -> bool {
        let core = self.shared.core.lock().unwrap();
        !core.is_enabled || core.leader == source
    }

    /// Subscribe to outbound state broadcasts.
    pub fn subscribe(&self) -> Receiver<RaftMessage> {
        let (tx, rx) = mpsc::channel();
        self.shared.outboxes.lock().unwrap().push(tx);
        rx
    }

    /// Register a hook invoked on every visible state change.
    pub fn on_update(&self, hook: OnRaftUpdate) {
        self.shared.on_update.lock().unwrap().push(hook);
    }

    pub fn set_registered_count(&self, count: usize) {
        let mut core = self.shared.core.lock().unwrap();
        core.registered_count = count.max(1);
        // The quorum may have shrunk below the collected vote count.
        if core.state == RaftState::Candidate
            && core.votes_received.len() >= core.election_quorum()
        {
            become_leader(&mut core);
            self.shared.cond.notify_all();
        }
    }

    /// Apply a `(term, vote)` row replayed from the journal. Nothing is
    /// written back; roles are never persisted.
    pub fn process_recovery(&self, record: &RaftRecord) {
        let mut core = self.shared.core.lock().unwrap();
        debug_assert!(!core.is_enabled);
        if record.term != 0 {
            core.term = record.term;
            core.volatile_term = record.term;
        }
        if record.vote != 0 {
            core.vote = record.vote;
            core.volatile_vote = record.vote;
        }
    }

    /// Process a raft status message from the network.
    pub fn process_msg(&self, msg: &RaftMessage, source: u32) -> Result<()> {
        if source == 0 {
            return Err(Error::Protocol("raft message from a zero source".to_string()));
        }
        if msg.term == 0 {
            return Err(Error::Protocol("raft term can't be zero".to_string()));
        }
        if msg.state == RaftState::Candidate && (msg.vote != source || msg.vclock.is_none()) {
            return Err(Error::Protocol(
                "a candidate should always vote for self and provide its vclock".to_string(),
            ));
        }
        let mut core = self.shared.core.lock().unwrap();
        if source == core.self_id {
            return Ok(());
        }
        // Outdated request.
        if msg.term < core.volatile_term {
            log::info!(
                "RAFT: message from {} ignored due to outdated term {} < {}",
                source,
                msg.term,
                core.volatile_term
            );
            return Ok(());
        }
        if msg.term > core.volatile_term {
            schedule_new_term(&mut core, msg.term);
        }

        if msg.vote != 0 {
            match core.state {
                RaftState::Follower | RaftState::Leader => {
                    self.handle_vote_request(&mut core, msg);
                }
                RaftState::Candidate => {
                    // Votes for a competing candidate are not ours to count.
                    if msg.vote == core.self_id {
                        debug_assert_eq!(core.volatile_vote, core.self_id);
                        core.votes_received.insert(source);
                        let quorum = core.election_quorum();
                        if core.votes_received.len() >= quorum {
                            become_leader(&mut core);
                        } else {
                            log::info!(
                                "RAFT: accepted vote for self, vote count is {}/{}",
                                core.votes_received.len(),
                                quorum
                            );
                        }
                    }
                }
            }
        }

        if msg.state != RaftState::Leader {
            if source == core.leader {
                log::info!("RAFT: the node {} has resigned from the leader role", source);
                core.leader = 0;
                if core.is_candidate {
                    schedule_new_election(&mut core);
                }
            }
            self.shared.cond.notify_all();
            return Ok(());
        }
        if source == core.leader {
            return Ok(());
        }
        if core.leader != 0 {
            // A conflicting leader inside one term. Nothing good to do.
            log::warn!(
                "RAFT: conflicting leader detected in one term - known is {}, received {}",
                core.leader,
                source
            );
            return Ok(());
        }
        follow_leader(&mut core, source);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn handle_vote_request(&self, core: &mut RaftCore, msg: &RaftMessage) {
        if !core.is_enabled {
            log::info!("RAFT: vote request is skipped - raft is disabled");
            return;
        }
        if core.leader != 0 {
            log::info!(
                "RAFT: vote request is skipped - the leader is already known - {}",
                core.leader
            );
            return;
        }
        if msg.vote == core.self_id {
            // A vote response arriving after this node already left the
            // candidate state. Valid, nothing to do.
            return;
        }
        if msg.state != RaftState::Candidate {
            // A notification about a vote for a third node, not a request.
            return;
        }
        if core.volatile_vote != 0 {
            log::info!("RAFT: vote request is skipped - already voted in this term");
            return;
        }
        let vclock = msg.vclock.as_ref().expect("validated above");
        let local = self.shared.journal.vclock();
        // The candidate's log must cover ours in every replicated
        // component; the sum says nothing when the clocks diverged.
        match vclock.compare_ignore_local(&local) {
            VclockCmp::Equal | VclockCmp::Greater => {}
            VclockCmp::Less | VclockCmp::Incomparable => {
                log::info!("RAFT: vote request is skipped - the vclock is not acceptable");
                return;
            }
        }
        schedule_new_vote(core, msg.vote);
        self.shared.cond.notify_all();
    }

    /// Process a heartbeat from a peer; watches leader health.
    pub fn process_heartbeat(&self, source: u32) {
        if source == 0 {
            return;
        }
        let mut core = self.shared.core.lock().unwrap();
        if !core.is_candidate {
            return;
        }
        if core.state == RaftState::Leader {
            return;
        }
        if core.leader != source {
            return;
        }
        if core.is_write_in_progress {
            return;
        }
        // The leader is alive; push the death timer forward.
        core.timer_deadline = Some(Instant::now() + core.election_timeout);
        self.shared.cond.notify_all();
    }

    /// Enable or disable the state machine.
    pub fn cfg_enable(&self, enable: bool) {
        let mut core = self.shared.core.lock().unwrap();
        if core.is_enabled == enable {
            return;
        }
        if enable {
            log::info!("RAFT: start state machine");
            core.is_enabled = true;
            core.is_candidate = core.is_cfg_candidate;
            if core.is_candidate {
                // Don't start an election right away: a restart should not
                // disturb a live leader; give it time to say hello.
                core.timer_deadline = Some(Instant::now() + core.election_timeout);
            }
        } else {
            log::info!("RAFT: stop state machine");
            core.is_enabled = false;
            core.is_candidate = false;
            if core.state == RaftState::Leader {
                core.leader = 0;
            }
            core.state = RaftState::Follower;
            core.timer_deadline = None;
            schedule_broadcast(&mut core);
        }
        self.shared.cond.notify_all();
    }

    /// Configure whether this node may promote itself.
    pub fn cfg_candidate(&self, is_candidate: bool) {
        let mut core = self.shared.core.lock().unwrap();
        let was = core.is_candidate;
        core.is_cfg_candidate = is_candidate;
        core.is_candidate = is_candidate && core.is_enabled;
        if core.is_candidate == was {
            return;
        }
        if core.is_candidate {
            core.timer_deadline = Some(Instant::now() + core.election_timeout);
        } else {
            if core.state != RaftState::Leader {
                core.timer_deadline = None;
            }
            if core.state != RaftState::Follower {
                if core.state == RaftState::Leader {
                    core.leader = 0;
                }
                core.state = RaftState::Follower;
                schedule_broadcast(&mut core);
            }
        }
        self.shared.cond.notify_all();
    }

    pub fn cfg_election_timeout(&self, timeout: Duration) {
        let mut core = self.shared.core.lock().unwrap();
        core.election_timeout = timeout;
        if core.timer_deadline.is_some() {
            // Recompute the remaining deadline under the new base.
            core.timer_deadline = Some(Instant::now() + timeout);
        }
        self.shared.cond.notify_all();
    }

    pub fn cfg_election_quorum(&self, quorum: usize) {
        let mut core = self.shared.core.lock().unwrap();
        core.configured_quorum = quorum.max(1);
        if core.state == RaftState::Candidate
            && core.votes_received.len() >= core.election_quorum()
        {
            become_leader(&mut core);
            self.shared.cond.notify_all();
        }
    }

    /// Bump the term. Once persisted, starts a new election if this node is
    /// a candidate and no leader appears.
    pub fn new_term(&self) {
        let mut core = self.shared.core.lock().unwrap();
        if core.is_enabled {
            let next = core.volatile_term + 1;
            schedule_new_term(&mut core, next);
            self.shared.cond.notify_all();
        }
    }

    /// Complete state for the network: persisted term/vote plus the role,
    /// with the vclock attached when campaigning.
    pub fn serialize_for_network(&self) -> RaftMessage {
        let core = self.shared.core.lock().unwrap();
        let vclock = if core.state == RaftState::Candidate {
            Some(self.shared.journal.vclock())
        } else {
            None
        };
        RaftMessage {
            term: core.term,
            vote: core.vote,
            state: core.state,
            vclock,
        }
    }

    /// Persistent state for checkpoints: term and vote only.
    pub fn serialize_for_disk(&self) -> RaftRecord {
        let core = self.shared.core.lock().unwrap();
        RaftRecord {
            term: core.term,
            vote: core.vote,
        }
    }

    pub fn shutdown(&self) {
        {
            let mut core = self.shared.core.lock().unwrap();
            core.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bump the volatile term and schedule its flush. A new term resets the
/// whole volatile election state.
fn schedule_new_term(core: &mut RaftCore, new_term: u64) {
    log::info!("RAFT: bump term to {}, follow", new_term);
    debug_assert!(new_term > core.volatile_term);
    core.volatile_term = new_term;
    core.volatile_vote = 0;
    core.leader = 0;
    core.state = RaftState::Follower;
    pause_and_dump(core);
    schedule_broadcast(core);
}

/// Record a volatile vote and schedule its flush.
fn schedule_new_vote(core: &mut RaftCore, new_vote: u32) {
    log::info!("RAFT: vote for {} in term {}", new_vote, core.volatile_term);
    debug_assert_eq!(core.volatile_vote, 0);
    debug_assert_eq!(core.leader, 0);
    debug_assert_eq!(core.state, RaftState::Follower);
    core.volatile_vote = new_vote;
    pause_and_dump(core);
}

/// Bump the term and vote for self. Everyone is a follower until the vote
/// hits the disk.
fn schedule_new_election(core: &mut RaftCore) {
    log::info!("RAFT: begin new election round");
    debug_assert!(core.is_candidate);
    let next = core.volatile_term + 1;
    schedule_new_term(core, next);
    schedule_new_vote(core, core.self_id);
}

/// Stop the timer and hand the unflushed state to the worker.
fn pause_and_dump(core: &mut RaftCore) {
    debug_assert_eq!(core.state, RaftState::Follower);
    core.timer_deadline = None;
    core.is_write_in_progress = true;
}

fn become_leader(core: &mut RaftCore) {
    debug_assert_ne!(core.state, RaftState::Leader);
    debug_assert!(core.is_candidate);
    log::info!(
        "RAFT: enter leader state with quorum {}",
        core.election_quorum()
    );
    core.state = RaftState::Leader;
    core.leader = core.self_id;
    core.timer_deadline = None;
    schedule_broadcast(core);
}

fn follow_leader(core: &mut RaftCore, leader: u32) {
    log::info!("RAFT: leader is {}, follow", leader);
    debug_assert_ne!(core.state, RaftState::Leader);
    core.state = RaftState::Follower;
    core.leader = leader;
    if !core.is_write_in_progress && core.is_candidate {
        core.timer_deadline = Some(Instant::now() + core.election_timeout);
    }
    schedule_broadcast(core);
}

fn become_candidate(core: &mut RaftCore) {
    log::info!("RAFT: enter candidate state with 1 self vote");
    debug_assert_eq!(core.state, RaftState::Follower);
    debug_assert_eq!(core.leader, 0);
    debug_assert_eq!(core.vote, core.self_id);
    debug_assert!(!core.is_write_in_progress);
    core.state = RaftState::Candidate;
    core.votes_received.clear();
    core.votes_received.insert(core.self_id);
    wait_election_end(core);
    schedule_broadcast(core);
}

/// Arm the election timer with the randomized shift on top of the base.
fn wait_election_end(core: &mut RaftCore) {
    let base = core.election_timeout;
    let shift = base.mul_f64(rand::thread_rng().gen_range(0.0..=RANDOM_ELECTION_FACTOR));
    core.timer_deadline = Some(Instant::now() + base + shift);
}

fn schedule_broadcast(core: &mut RaftCore) {
    core.is_broadcast_scheduled = true;
}

/// The worker: flushes `(term, vote)` to the journal, runs the election
/// timer, and delivers broadcasts. Mirrors exist precisely so the state
/// machine keeps deciding while a flush is in flight.
fn raft_worker_loop(shared: Arc<RaftShared>) {
    loop {
        enum Work {
            Persist(RaftRecord),
            Broadcast(RaftMessage, RaftStatus),
            TimerFired,
            Shutdown,
        }

        let work = {
            let mut core = shared.core.lock().unwrap();
            loop {
                if core.shutdown {
                    break Work::Shutdown;
                }
                if core.is_write_in_progress && !core.is_fully_on_disk() {
                    break Work::Persist(RaftRecord {
                        term: core.volatile_term,
                        vote: core.volatile_vote,
                    });
                }
                if core.is_write_in_progress {
                    // Everything volatile reached the disk; settle the state
                    // machine.
                    core.is_write_in_progress = false;
                    finish_flush(&mut core);
                    continue;
                }
                if core.is_broadcast_scheduled {
                    core.is_broadcast_scheduled = false;
                    let vclock = if core.state == RaftState::Candidate {
                        Some(shared.journal.vclock())
                    } else {
                        None
                    };
                    let msg = RaftMessage {
                        term: core.term,
                        vote: core.vote,
                        state: core.state,
                        vclock,
                    };
                    break Work::Broadcast(msg, core.status());
                }
                if let Some(deadline) = core.timer_deadline {
                    let now = Instant::now();
                    if now >= deadline {
                        core.timer_deadline = None;
                        break Work::TimerFired;
                    }
                    let (guard, _) = shared.cond.wait_timeout(core, deadline - now).unwrap();
                    core = guard;
                } else {
                    let (guard, _) = shared
                        .cond
                        .wait_timeout(core, Duration::from_millis(100))
                        .unwrap();
                    core = guard;
                }
            }
        };

        match work {
            Work::Shutdown => return,
            Work::Persist(record) => {
                match shared.journal.write_row(record.into_row()) {
                    Ok(_) => {
                        let mut core = shared.core.lock().unwrap();
                        debug_assert!(record.term >= core.term);
                        core.term = record.term;
                        core.vote = record.vote;
                        log::info!(
                            "RAFT: persisted state {{term: {}, vote: {}}}",
                            record.term,
                            record.vote
                        );
                        schedule_broadcast(&mut core);
                    }
                    Err(e) => {
                        log::error!("RAFT: failed to persist state: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            Work::Broadcast(msg, status) => {
                let mut outboxes = shared.outboxes.lock().unwrap();
                outboxes.retain(|tx| tx.send(msg.clone()).is_ok());
                drop(outboxes);
                let hooks = shared.on_update.lock().unwrap();
                for hook in hooks.iter() {
                    hook(status);
                }
            }
            Work::TimerFired => {
                let mut core = shared.core.lock().unwrap();
                if core.is_enabled && core.is_candidate && core.is_fully_on_disk() {
                    schedule_new_election(&mut core);
                }
            }
        }
    }
}

/// The state machine settles after a flush: decide what to wait for next.
fn finish_flush(core: &mut RaftCore) {
    debug_assert_eq!(core.state, RaftState::Follower);
    if !core.is_candidate {
        // A pure voter has nothing to wait for.
    } else if core.leader != 0 {
        // There is a known leader; wait for its death.
        core.timer_deadline = Some(Instant::now() + core.election_timeout);
    } else if core.vote == core.self_id {
        if core.election_quorum() == 1 {
            become_leader(core);
        } else {
            become_candidate(core);
        }
    } else if core.vote != 0 {
        // Voted for somebody else; see if they make it.
        wait_election_end(core);
    } else {
        // No leader, no votes: campaign.
        schedule_new_vote(core, core.self_id);
    }
}
