//! Node configuration
//!
//! The recognized configuration subset of the replication core. Anything the
//! core does not consume (listen addresses, storage engine tuning) lives with
//! the embedder.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the journal flushes data to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogMode {
    /// Bypass disk entirely. LSNs are still assigned.
    None,
    /// Buffered writes, no fsync on the commit path.
    Write,
    /// Every batch is fsynced before completion is reported.
    Fsync,
}

/// Role of this node in leader elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionMode {
    /// Elections are disabled, the node ignores election messages.
    Off,
    /// The node votes but never starts an election for itself.
    Voter,
    /// The node votes and may promote itself.
    Candidate,
    /// Like `Voter`, but the node may be promoted by an explicit call.
    Manual,
}

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Resolves to the configured default at `begin`.
    Default,
    ReadCommitted,
    ReadConfirmed,
    BestEffort,
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this peer in the replicaset. Must be non-zero.
    pub peer_id: u32,
    /// Directory for journal segments and checkpoint markers
    pub data_dir: PathBuf,
    /// Journal flush discipline
    pub log_mode: LogMode,
    /// Soft cap on a single journal segment, in bytes
    pub log_max_size: u64,
    /// Cap on the in-memory journal submission queue, in bytes
    pub journal_queue_max_size: u64,
    /// How many peers (including self) must ack a synchronous row
    pub sync_quorum: usize,
    /// How long `commit` waits for the quorum, in seconds
    pub sync_timeout: f64,
    /// Election behavior of this node
    pub election_mode: ElectionMode,
    /// Base election timeout in seconds; the actual wait adds up to 10% jitter
    pub election_timeout: f64,
    /// Default isolation level assigned at `begin`
    pub txn_isolation: IsolationLevel,
    /// Default transaction timeout in seconds; `None` means infinity
    pub txn_timeout: Option<f64>,
    /// How many checkpoints to keep before collecting old segments
    pub checkpoint_count: u32,
    /// Seconds between automatic checkpoints; `None` disables them
    pub checkpoint_interval: Option<f64>,
    /// Keep going past a torn segment tail during recovery
    pub force_recovery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: 1,
            data_dir: PathBuf::from("./data"),
            log_mode: LogMode::Write,
            log_max_size: 256 * 1024 * 1024,
            journal_queue_max_size: 16 * 1024 * 1024,
            sync_quorum: 1,
            sync_timeout: 30.0,
            election_mode: ElectionMode::Off,
            election_timeout: 5.0,
            txn_isolation: IsolationLevel::BestEffort,
            txn_timeout: None,
            checkpoint_count: 2,
            checkpoint_interval: None,
            force_recovery: false,
        }
    }
}

impl Config {
    /// Config for a single node with synchronous flushes, useful in tests
    /// that must observe durability.
    pub fn durable(peer_id: u32, data_dir: PathBuf) -> Self {
        Self {
            peer_id,
            data_dir,
            log_mode: LogMode::Fsync,
            ..Default::default()
        }
    }

    /// Config for a member of a replicaset running elections.
    pub fn candidate(peer_id: u32, data_dir: PathBuf, sync_quorum: usize) -> Self {
        Self {
            peer_id,
            data_dir,
            sync_quorum,
            election_mode: ElectionMode::Candidate,
            ..Default::default()
        }
    }
}
