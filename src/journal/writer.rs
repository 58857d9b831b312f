//! Journal writer worker
//!
//! A single thread owns the active segment and the authoritative vclock.
//! It drains everything currently enqueued, writes each entry as one frame,
//! and completes entries in submission order. A failed write flips the
//! journal into rollback mode until the queue drains.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::LogMode;
use crate::error::signature;
use crate::row::{GroupId, Row, LSN_UNASSIGNED};
use crate::vclock::Vclock;

use super::segment::{
    encode_batch, parse_segment_name, segment_path, SegmentHeader, SegmentWriter, SEGMENT_VERSION,
};
use super::{JournalEntry, JournalShared, WriterMessage};

const ENOSPC: i32 = 28;

struct WalState {
    current: Option<SegmentWriter>,
    vclock: Vclock,
}

pub(super) fn writer_loop(
    shared: Arc<JournalShared>,
    receiver: Receiver<WriterMessage>,
    recovered: Vclock,
) {
    let mut wal = WalState {
        current: None,
        vclock: recovered,
    };
    let mut in_rollback = false;
    // Failed entries parked until the queue drains; completed in reverse
    // submission order so a rollback of entry i signals everything after it
    // first.
    let mut rollback: Vec<(JournalEntry, super::OnDone)> = Vec::new();
    let mut rollback_flushes: Vec<std::sync::mpsc::SyncSender<()>> = Vec::new();

    loop {
        let first = match receiver.recv() {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let mut batch = vec![first];
        loop {
            match receiver.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        while shared.writes_held() {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let mut shutdown = false;
        for msg in batch {
            match msg {
                WriterMessage::Write { mut entry, on_done } => {
                    if in_rollback {
                        entry.signature = signature::CASCADE;
                        rollback.push((entry, on_done));
                        continue;
                    }
                    match write_entry(&shared, &mut wal, &mut entry) {
                        Ok(max_lsn) => {
                            shared.publish_vclock(&wal.vclock);
                            shared.notify_watchers(true, false);
                            shared.finish(entry, max_lsn, on_done);
                        }
                        Err(e) => {
                            log::error!("journal write failed: {}", e);
                            in_rollback = true;
                            shared.set_in_rollback(true);
                            entry.signature = signature::IO_ERR;
                            rollback.push((entry, on_done));
                        }
                    }
                }
                WriterMessage::Flush(responder) => {
                    if in_rollback {
                        rollback_flushes.push(responder);
                    } else {
                        let _ = responder.send(());
                    }
                }
                WriterMessage::Rotate(responder) => {
                    let _ = responder.send(rotate(&shared, &mut wal));
                }
                WriterMessage::Shutdown => {
                    shutdown = true;
                }
            }
        }

        if in_rollback {
            let held: u64 = rollback.iter().map(|(e, _)| e.approx_len).sum();
            if shared.queue_size() == held {
                // Nothing else is in flight; unwind the whole tail in
                // reverse order and leave rollback mode.
                for (entry, on_done) in rollback.drain(..).rev() {
                    let sig = entry.signature;
                    shared.finish(entry, sig, on_done);
                }
                for responder in rollback_flushes.drain(..) {
                    let _ = responder.send(());
                }
                in_rollback = false;
                shared.set_in_rollback(false);
                log::info!("journal left rollback mode");
            }
        }

        if shutdown {
            break;
        }
    }

    // Fail whatever is still parked or queued; nobody may be left waiting.
    for (entry, on_done) in rollback.drain(..).rev() {
        let sig = entry.signature;
        shared.finish(entry, sig, on_done);
    }
    for responder in rollback_flushes.drain(..) {
        let _ = responder.send(());
    }
    while let Ok(msg) = receiver.try_recv() {
        match msg {
            WriterMessage::Write { entry, on_done } => {
                shared.finish(entry, signature::IO_ERR, on_done);
            }
            WriterMessage::Flush(responder) => {
                let _ = responder.send(());
            }
            WriterMessage::Rotate(responder) => {
                let _ = responder.send(Ok(()));
            }
            WriterMessage::Shutdown => {}
        }
    }

    if let Some(segment) = wal.current.as_mut() {
        if let Err(e) = segment.seal() {
            log::error!("failed to seal {:?} on shutdown: {}", segment.path(), e);
        }
    }
    log::info!("journal writer shutting down");
}

fn write_entry(
    shared: &Arc<JournalShared>,
    wal: &mut WalState,
    entry: &mut JournalEntry,
) -> std::io::Result<i64> {
    shared.take_injected_error()?;
    let max_lsn = assign_lsns(&mut wal.vclock, shared.peer_id, entry);
    if shared.mode == LogMode::None {
        return Ok(max_lsn);
    }

    rotate_if_needed(shared, wal)?;
    let segment = wal.current.as_mut().expect("segment opened above");
    let frame = encode_batch(&entry.rows)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    preallocate(shared, segment, frame.len() as u64)?;
    segment.append_frame(&frame)?;
    shared
        .checkpoint_wal_size
        .fetch_add(frame.len() as u64, Ordering::Relaxed);
    Ok(max_lsn)
}

/// Assign LSNs, the TSN and timestamps to a batch and return its maximal LSN.
///
/// Rows with no LSN are this node's own: they get this peer's identity and
/// the next value of its stream - except local-group rows, which keep peer
/// zero and ride the never-replicated zero component. Rows arriving with an
/// origin LSN advance that origin's component instead. The batch TSN is the
/// LSN of the first global row, or of the first row when the batch is fully
/// local.
fn assign_lsns(vclock: &mut Vclock, self_id: u32, entry: &mut JournalEntry) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut tsn = 0i64;
    let mut max_lsn = 0i64;
    let n = entry.rows.len();
    for row in entry.rows.iter_mut() {
        row.tm = now;
        if row.lsn == LSN_UNASSIGNED {
            if row.group != GroupId::Local {
                row.peer_id = self_id;
            }
            row.lsn = vclock.inc(row.peer_id);
            if row.group != GroupId::Local && tsn == 0 {
                tsn = row.lsn;
            }
        } else {
            vclock.follow(row.peer_id, row.lsn);
            if tsn == 0 {
                tsn = row.lsn;
            }
        }
        max_lsn = max_lsn.max(row.lsn);
    }
    let tsn = if tsn == 0 { entry.rows[0].lsn } else { tsn };
    for row in entry.rows.iter_mut() {
        row.tsn = tsn;
    }
    let last = &mut entry.rows[n - 1];
    last.flags = entry.flags;
    last.flags.is_commit = true;
    max_lsn
}

fn open_segment(shared: &Arc<JournalShared>, vclock: &Vclock) -> std::io::Result<SegmentWriter> {
    let header = SegmentHeader {
        version: SEGMENT_VERSION,
        peer_id: shared.peer_id,
        run_id: shared.run_id,
        prev_checkpoint: shared.checkpoint_vclock(),
        start_sum: vclock.sum(),
    };
    let path = segment_path(&shared.dir, header.start_sum);
    // A leftover segment with the same start sum holds nothing beyond the
    // recovered vclock (its rows, if any, were already replayed), so it can
    // only be an empty tail from a previous run.
    if path.exists() {
        log::warn!("replacing leftover journal segment {:?}", path);
        std::fs::remove_file(&path)?;
    }
    log::info!("opening new journal segment {:?}", path);
    SegmentWriter::create(path, &header, shared.mode)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Open a new segment first, seal the old one second, so a reader following
/// segment EOFs never observes a gap.
fn rotate(shared: &Arc<JournalShared>, wal: &mut WalState) -> std::io::Result<()> {
    if shared.mode == LogMode::None {
        return Ok(());
    }
    let fresh = open_segment(shared, &wal.vclock)?;
    if let Some(mut old) = wal.current.replace(fresh) {
        old.seal()?;
    }
    shared.notify_watchers(false, true);
    Ok(())
}

fn rotate_if_needed(shared: &Arc<JournalShared>, wal: &mut WalState) -> std::io::Result<()> {
    match wal.current.as_ref() {
        None => {
            wal.current = Some(open_segment(shared, &wal.vclock)?);
            Ok(())
        }
        Some(segment) if segment.len() >= shared.log_max_size => rotate(shared, wal),
        Some(_) => Ok(()),
    }
}

/// Reserve space for the next frame. On ENOSPC, delete the oldest segment
/// not needed for recovery (strictly older than the checkpoint vclock) and
/// retry; give up when nothing is left to delete.
fn preallocate(
    shared: &Arc<JournalShared>,
    segment: &mut SegmentWriter,
    len: u64,
) -> std::io::Result<()> {
    loop {
        match segment.preallocate(len) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(ENOSPC) => {
                let gc_sum = shared.checkpoint_vclock().sum();
                if !collect_one_garbage_segment(&shared.dir, gc_sum, segment.path())? {
                    log::error!("out of disk space and no collectable segments");
                    return Err(e);
                }
                log::warn!("ran out of disk space, deleted an old journal segment");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sorted start sums of all segments in the directory.
fn list_segments(dir: &Path) -> std::io::Result<Vec<i64>> {
    let mut sums = Vec::new();
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if let Some(sum) = parse_segment_name(&dir_entry.file_name().to_string_lossy()) {
            sums.push(sum);
        }
    }
    sums.sort_unstable();
    Ok(sums)
}

/// Delete the single oldest segment that is wholly covered by the checkpoint,
/// i.e. whose successor starts at or before the checkpoint sum. Returns
/// whether anything was deleted.
fn collect_one_garbage_segment(
    dir: &Path,
    checkpoint_sum: i64,
    current: &Path,
) -> std::io::Result<bool> {
    let sums = list_segments(dir)?;
    for window in sums.windows(2) {
        let (start, next_start) = (window[0], window[1]);
        if next_start > checkpoint_sum {
            break;
        }
        let path = segment_path(dir, start);
        if path == current {
            continue;
        }
        std::fs::remove_file(&path)?;
        log::info!("collected journal segment {:?}", path);
        return Ok(true);
    }
    Ok(false)
}

/// Delete every segment wholly covered by the checkpoint at `checkpoint_sum`.
pub(super) fn collect_garbage(dir: &PathBuf, checkpoint_sum: i64) -> std::io::Result<()> {
    loop {
        let sums = list_segments(dir)?;
        let mut deleted = false;
        for window in sums.windows(2) {
            let (start, next_start) = (window[0], window[1]);
            if next_start > checkpoint_sum {
                break;
            }
            let path = segment_path(dir, start);
            std::fs::remove_file(&path)?;
            log::info!("collected journal segment {:?}", path);
            deleted = true;
            break;
        }
        if !deleted {
            return Ok(());
        }
    }
}
