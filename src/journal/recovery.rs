//! Journal recovery and replay
//!
//! On startup the data directory is scanned for the newest checkpoint marker
//! and the segment files. Segments are replayed in order; rows at or below
//! the checkpoint vclock are skipped. A torn segment tail is either refused
//! or renamed to `<name>.corrupted` with its complete prefix kept, depending
//! on the force-recovery flag.

use std::path::PathBuf;

use crate::checkpoint::CheckpointMarker;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::vclock::Vclock;

use super::segment::{parse_segment_name, segment_path, SegmentReader};

/// Outcome of a journal replay.
pub struct RecoveredLog {
    /// Vclock after the last applied row.
    pub vclock: Vclock,
    /// The newest checkpoint marker, if any.
    pub marker: Option<CheckpointMarker>,
}

pub struct JournalRecovery {
    dir: PathBuf,
    force_recovery: bool,
}

impl JournalRecovery {
    pub fn new(dir: PathBuf, force_recovery: bool) -> Self {
        Self { dir, force_recovery }
    }

    /// Replay every row newer than the checkpoint, in log order, through
    /// `apply`. Returns the final vclock and the marker that seeded it.
    pub fn replay(&self, mut apply: impl FnMut(&Row) -> Result<()>) -> Result<RecoveredLog> {
        let marker = CheckpointMarker::read(&self.dir)?;
        let mut vclock = marker
            .as_ref()
            .map(|m| m.vclock.clone())
            .unwrap_or_default();

        if !self.dir.exists() {
            return Ok(RecoveredLog { vclock, marker });
        }

        let mut sums = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            if let Some(sum) = parse_segment_name(&dir_entry.file_name().to_string_lossy()) {
                sums.push(sum);
            }
        }
        sums.sort_unstable();

        log::info!("starting recovery from {} segment(s)", sums.len());
        let last_idx = sums.len().saturating_sub(1);
        for (i, &sum) in sums.iter().enumerate() {
            let path = segment_path(&self.dir, sum);
            let contents = SegmentReader::open(&path)?.read_all()?;

            if contents.torn {
                if !self.force_recovery {
                    return Err(Error::Recovery(format!(
                        "segment {:?} has a torn tail; refusing to load it \
                         (enable force recovery to keep its complete prefix)",
                        path
                    )));
                }
                let corrupted = path.with_extension("xlog.corrupted");
                log::warn!(
                    "segment {:?} has a torn tail, keeping its complete prefix \
                     and renaming it to {:?}",
                    path,
                    corrupted
                );
                std::fs::rename(&path, &corrupted)?;
            } else if !contents.sealed && i != last_idx {
                // A gap in the middle of the log cannot be skipped safely.
                return Err(Error::Recovery(format!(
                    "segment {:?} is not sealed but is not the last one",
                    path
                )));
            }

            for batch in &contents.batches {
                for row in batch {
                    // Local-group rows live on the zero component.
                    if row.lsn <= vclock.get(row.peer_id) {
                        continue;
                    }
                    apply(row)?;
                    vclock.follow(row.peer_id, row.lsn);
                }
            }
        }

        log::info!("recovery complete, vclock is {}", vclock);
        Ok(RecoveredLog { vclock, marker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::journal::{Journal, JournalEntry};
    use crate::row::{GroupId, RowKind};
    use tempfile::tempdir;

    fn write_some_rows(dir: &std::path::Path, count: u8) {
        let config = Config {
            peer_id: 1,
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let journal = Journal::open(&config, Vclock::new(), Vclock::new()).unwrap();
        for i in 0..count {
            journal.submit_and_wait(JournalEntry::new(vec![Row::dml(
                RowKind::Insert,
                GroupId::Default,
                vec![i],
            )]));
        }
        journal.shutdown();
    }

    #[test]
    fn test_replay_recovers_rows_in_order() {
        let dir = tempdir().unwrap();
        write_some_rows(dir.path(), 5);

        let mut seen = Vec::new();
        let recovered = JournalRecovery::new(dir.path().to_path_buf(), false)
            .replay(|row| {
                seen.push(row.lsn);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(recovered.vclock.get(1), 5);
        assert!(recovered.marker.is_none());
    }

    #[test]
    fn test_replay_empty_directory() {
        let dir = tempdir().unwrap();
        let recovered = JournalRecovery::new(dir.path().to_path_buf(), false)
            .replay(|_| Ok(()))
            .unwrap();
        assert!(recovered.vclock.is_empty());
    }

    #[test]
    fn test_torn_tail_refused_without_force() {
        let dir = tempdir().unwrap();
        write_some_rows(dir.path(), 3);

        // Damage the tail of the only segment.
        let seg = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.to_string_lossy().ends_with(".xlog"))
            .unwrap();
        let len = std::fs::metadata(&seg).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&seg).unwrap();
        file.set_len(len - 6).unwrap();
        drop(file);

        let result = JournalRecovery::new(dir.path().to_path_buf(), false).replay(|_| Ok(()));
        assert!(matches!(result, Err(Error::Recovery(_))));
    }

    #[test]
    fn test_torn_tail_kept_with_force() {
        let dir = tempdir().unwrap();
        write_some_rows(dir.path(), 3);

        let seg = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.to_string_lossy().ends_with(".xlog"))
            .unwrap();
        let len = std::fs::metadata(&seg).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&seg).unwrap();
        file.set_len(len - 6).unwrap();
        drop(file);

        let mut seen = Vec::new();
        let recovered = JournalRecovery::new(dir.path().to_path_buf(), true)
            .replay(|row| {
                seen.push(row.lsn);
                Ok(())
            })
            .unwrap();
        // The damaged frame is lost, the prefix survives.
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(recovered.vclock.get(1), 2);
        assert!(!seg.exists());
        assert!(seg.with_extension("xlog.corrupted").exists());
    }
}
