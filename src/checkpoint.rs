//! Checkpoint barrier
//!
//! A checkpoint is a consistent snapshot of the journal vclock, the limbo
//! and the raft state, taken at the instant every synchronous transaction
//! known at barrier start has resolved. The snapshot lands in a small JSON
//! marker file next to the segments; recovery starts from the newest one.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::limbo::{CancelToken, Limbo};
use crate::raft::{RaftMessage, RaftNode};
use crate::row::{RaftRecord, SynchroRequest};
use crate::vclock::Vclock;

const MARKER_FILE: &str = "journal.checkpoint";

/// The persisted checkpoint snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// Journal vclock at the barrier.
    pub vclock: Vclock,
    /// Limbo snapshot in its checkpoint PROMOTE form; this is the only
    /// place `confirmed_vclock` is serialized.
    pub limbo: Option<SynchroRequest>,
    /// Raft persistent state.
    pub raft: Option<RaftRecord>,
    /// Raft state as the cluster would see it.
    pub raft_remote: Option<RaftMessage>,
    /// Unix millis of the barrier.
    pub timestamp: u64,
}

impl CheckpointMarker {
    pub fn read(dir: &Path) -> Result<Option<CheckpointMarker>> {
        let path = dir.join(MARKER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&text) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                log::warn!("failed to parse checkpoint marker {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MARKER_FILE);
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        // Write-then-rename so a crash never leaves a half marker.
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), text)?;
        tmp.persist(&path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// Run the checkpoint barrier and persist the marker.
///
/// The sequence: drive every prepared transaction into the journal, drain
/// the journal onto a fresh segment, then wait for the last synchronous
/// transaction known at barrier start to resolve. A rollback of that tail
/// fails the barrier with `SyncRollback`; cancellation is honored at every
/// wait.
pub fn checkpoint_build(
    journal: &Journal,
    limbo: &Limbo,
    raft: &RaftNode,
    dir: &Path,
    cancel: &CancelToken,
) -> Result<CheckpointMarker> {
    // All prepared txns follow the same path: limbo volatile queue, journal
    // queue, journal write. Flushing in that order walks behind the last
    // prepared txn without missing it.
    limbo.flush(|| cancel.is_cancelled())?;
    let vclock = journal.checkpoint_begin()?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // Persisted is not committed for sync txns; wait out their quorums so
    // the checkpoint holds no data that may yet roll back.
    limbo.wait_confirm(|| cancel.is_cancelled())?;

    let marker = CheckpointMarker {
        vclock: vclock.clone(),
        limbo: Some(limbo.checkpoint()),
        raft: Some(raft.serialize_for_disk()),
        raft_remote: Some(raft.serialize_for_network()),
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    };
    marker.write(dir)?;
    journal.checkpoint_commit(&vclock);
    log::info!("checkpoint complete at {}", marker.vclock);
    Ok(marker)
}

/// Periodic checkpoint driver, spawned by the node when
/// `checkpoint_interval` is configured.
pub(crate) fn checkpoint_interval_loop(
    journal: std::sync::Arc<Journal>,
    limbo: std::sync::Arc<Limbo>,
    raft: std::sync::Arc<RaftNode>,
    dir: std::path::PathBuf,
    interval: Duration,
    stop: CancelToken,
) {
    while !stop.is_cancelled() {
        let deadline = std::time::Instant::now() + interval;
        while std::time::Instant::now() < deadline {
            if stop.is_cancelled() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        if let Err(e) = checkpoint_build(&journal, &limbo, &raft, &dir, &stop) {
            if matches!(e, Error::Cancelled) {
                return;
            }
            log::error!("periodic checkpoint failed: {}", e);
        }
    }
}
