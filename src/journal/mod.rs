//! Append-only journal with a bounded submission queue
//!
//! One writer worker per journal drains a channel of entries, assigns LSNs,
//! and persists batches into rotating segments. Entries complete strictly in
//! submission order. On a write failure the writer enters rollback mode: the
//! failed entry reports `IO_ERR` and everything behind it in the stream,
//! including new submissions, reports `CASCADE` until the queue drains.

pub mod recovery;
pub mod segment;
mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

use crate::config::{Config, LogMode};
use crate::error::{error_from_signature, signature, Error, Result};
use crate::row::{Row, RowFlags};
use crate::vclock::Vclock;

/// Completion callback of a journal entry. The writer invokes it exactly
/// once, with the entry handed back to the submitter, LSNs stamped and
/// `signature` set.
pub type OnDone = Box<dyn FnOnce(JournalEntry) + Send + 'static>;

/// A write request: one transaction's worth of rows.
#[derive(Debug)]
pub struct JournalEntry {
    pub rows: Vec<Row>,
    /// Flags copied onto the last row of the batch at write time.
    pub flags: RowFlags,
    /// Approximate encoded size, used for queue accounting.
    pub approx_len: u64,
    /// `signature::UNKNOWN` until completion; then the maximal LSN of the
    /// batch, or a negative failure code.
    pub signature: i64,
}

impl JournalEntry {
    pub fn new(rows: Vec<Row>) -> Self {
        let approx_len = rows.iter().map(|r| r.approx_len()).sum();
        Self {
            rows,
            flags: RowFlags::default(),
            approx_len,
            signature: signature::UNKNOWN,
        }
    }

    pub fn with_flags(rows: Vec<Row>, flags: RowFlags) -> Self {
        let mut entry = Self::new(rows);
        entry.flags = flags;
        entry
    }

    /// Maximal LSN of the batch. Valid after a successful write.
    pub fn max_lsn(&self) -> i64 {
        self.rows.iter().map(|r| r.lsn).max().unwrap_or(0)
    }

    /// LSN of the last row, which is the synchro waiting point of the txn.
    pub fn last_lsn(&self) -> i64 {
        self.rows.last().map(|r| r.lsn).unwrap_or(0)
    }
}

pub(crate) enum WriterMessage {
    Write { entry: JournalEntry, on_done: OnDone },
    /// Reply once every entry submitted before this marker is done.
    Flush(SyncSender<()>),
    /// Close the current segment and open a fresh one.
    Rotate(SyncSender<std::io::Result<()>>),
    Shutdown,
}

#[derive(Default)]
struct QueueState {
    size: u64,
    in_rollback: bool,
}

/// Journal events a watcher can subscribe to. Pending notifications are
/// coalesced: a second write before the watcher wakes enriches the pending
/// event instead of queueing another one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalEvents {
    pub write: bool,
    pub rotate: bool,
}

impl JournalEvents {
    fn is_empty(&self) -> bool {
        !self.write && !self.rotate
    }
}

struct WatcherShared {
    pending: Mutex<JournalEvents>,
    cond: Condvar,
}

/// Subscription handle for journal events.
pub struct JournalWatcher {
    shared: Arc<WatcherShared>,
}

impl JournalWatcher {
    /// Wait up to `timeout` for a pending event and drain it.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JournalEvents> {
        let mut pending = self.shared.pending.lock().unwrap();
        if pending.is_empty() {
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout_while(pending, timeout, |p| p.is_empty())
                .unwrap();
            pending = guard;
        }
        if pending.is_empty() {
            return None;
        }
        let events = *pending;
        *pending = JournalEvents::default();
        Some(events)
    }
}

pub(crate) struct JournalShared {
    pub peer_id: u32,
    pub mode: LogMode,
    pub dir: PathBuf,
    pub run_id: u64,
    pub log_max_size: u64,
    queue_max_size: u64,
    queue: Mutex<QueueState>,
    queue_cond: Condvar,
    vclock: Mutex<Vclock>,
    checkpoint_vclock: Mutex<Vclock>,
    watchers: Mutex<Vec<Arc<WatcherShared>>>,
    /// Bytes written to the current checkpoint generation, fed to the
    /// automatic-checkpoint decision of the embedder.
    pub checkpoint_wal_size: AtomicU64,
    /// Error injection: the next N writes fail with an I/O error.
    inject_write_errors: AtomicU32,
    /// Error injection: the writer stalls while set.
    write_hold: AtomicBool,
}

impl JournalShared {
    pub(crate) fn publish_vclock(&self, vclock: &Vclock) {
        self.vclock.lock().unwrap().merge(vclock);
    }

    pub(crate) fn checkpoint_vclock(&self) -> Vclock {
        self.checkpoint_vclock.lock().unwrap().clone()
    }

    pub(crate) fn set_in_rollback(&self, value: bool) {
        let mut queue = self.queue.lock().unwrap();
        queue.in_rollback = value;
        self.queue_cond.notify_all();
    }

    pub(crate) fn queue_size(&self) -> u64 {
        self.queue.lock().unwrap().size
    }

    pub(crate) fn writes_held(&self) -> bool {
        self.write_hold.load(Ordering::Acquire)
    }

    /// Consume one injected failure, if armed.
    pub(crate) fn take_injected_error(&self) -> std::io::Result<()> {
        let mut left = self.inject_write_errors.load(Ordering::Acquire);
        while left > 0 {
            match self.inject_write_errors.compare_exchange_weak(
                left,
                left - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected write error",
                    ))
                }
                Err(current) => left = current,
            }
        }
        Ok(())
    }

    fn complete_entry(&self, approx_len: u64) {
        let mut queue = self.queue.lock().unwrap();
        debug_assert!(queue.size >= approx_len);
        queue.size -= approx_len;
        self.queue_cond.notify_all();
    }

    pub(crate) fn notify_watchers(&self, write: bool, rotate: bool) {
        let watchers = self.watchers.lock().unwrap();
        for watcher in watchers.iter() {
            let mut pending = watcher.pending.lock().unwrap();
            pending.write |= write;
            pending.rotate |= rotate;
            watcher.cond.notify_all();
        }
    }

    /// Finish one entry: return its queue budget and hand it back to the
    /// submitter.
    pub(crate) fn finish(&self, mut entry: JournalEntry, sig: i64, on_done: OnDone) {
        entry.signature = sig;
        self.complete_entry(entry.approx_len);
        on_done(entry);
    }
}

/// The journal: submission front-end plus the writer worker thread.
pub struct Journal {
    sender: Sender<WriterMessage>,
    shared: Arc<JournalShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Open a journal continuing from the given recovered vclock. The first
    /// segment is created lazily on the first write.
    pub fn open(config: &Config, recovered: Vclock, checkpoint: Vclock) -> Result<Journal> {
        std::fs::create_dir_all(&config.data_dir)?;
        let shared = Arc::new(JournalShared {
            peer_id: config.peer_id,
            mode: config.log_mode,
            dir: config.data_dir.clone(),
            run_id: rand::thread_rng().gen(),
            log_max_size: config.log_max_size,
            queue_max_size: config.journal_queue_max_size,
            queue: Mutex::new(QueueState::default()),
            queue_cond: Condvar::new(),
            vclock: Mutex::new(recovered.clone()),
            checkpoint_vclock: Mutex::new(checkpoint),
            watchers: Mutex::new(Vec::new()),
            checkpoint_wal_size: AtomicU64::new(0),
            inject_write_errors: AtomicU32::new(0),
            write_hold: AtomicBool::new(false),
        });
        // An unbounded channel; backpressure is byte-based, not
        // message-based.
        let (sender, receiver): (Sender<WriterMessage>, Receiver<WriterMessage>) =
            mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || writer::writer_loop(worker_shared, receiver, recovered))
            .map_err(Error::Io)?;
        Ok(Journal {
            sender,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue an entry. Blocks only while the submission queue is over its
    /// byte budget. Completion, success or failure, is always delivered via
    /// `on_done`.
    pub fn submit(&self, entry: JournalEntry, on_done: OnDone) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.in_rollback {
                drop(queue);
                self.shared.finish_submission_failure(entry, signature::CASCADE, on_done);
                return;
            }
            while queue.size >= self.shared.queue_max_size && !queue.in_rollback {
                queue = self.shared.queue_cond.wait(queue).unwrap();
            }
            if queue.in_rollback {
                drop(queue);
                self.shared.finish_submission_failure(entry, signature::CASCADE, on_done);
                return;
            }
            queue.size += entry.approx_len;
        }
        if let Err(e) = self.sender.send(WriterMessage::Write { entry, on_done }) {
            // The worker is gone; fail the entry in place.
            if let WriterMessage::Write { entry, on_done } = e.0 {
                self.shared.finish(entry, signature::IO_ERR, on_done);
            }
        }
    }

    /// Enqueue and wait for completion.
    pub fn submit_and_wait(&self, entry: JournalEntry) -> JournalEntry {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(
            entry,
            Box::new(move |done| {
                let _ = tx.send(done);
            }),
        );
        rx.recv().expect("journal always completes entries")
    }

    /// Synchronously write a single row (synchro and raft records take this
    /// path) and return its LSN.
    pub fn write_row(&self, row: Row) -> Result<i64> {
        let done = self.submit_and_wait(JournalEntry::new(vec![row]));
        if done.signature < 0 {
            return Err(error_from_signature(done.signature));
        }
        Ok(done.rows[0].lsn)
    }

    /// Wait until every entry submitted so far is either written or failed.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::sync_channel(1);
        if self.sender.send(WriterMessage::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Wait for the queue to drain and return the writer's current vclock.
    pub fn sync(&self) -> Vclock {
        self.flush();
        self.vclock()
    }

    pub fn vclock(&self) -> Vclock {
        self.shared.vclock.lock().unwrap().clone()
    }

    /// Whether a submission right now would block on the byte budget.
    pub fn would_block(&self) -> bool {
        self.shared.queue.lock().unwrap().size >= self.shared.queue_max_size
    }

    /// Subscribe to coalesced Write/Rotate notifications.
    pub fn register_watcher(&self) -> JournalWatcher {
        let shared = Arc::new(WatcherShared {
            pending: Mutex::new(JournalEvents::default()),
            cond: Condvar::new(),
        });
        self.shared.watchers.lock().unwrap().push(Arc::clone(&shared));
        JournalWatcher { shared }
    }

    /// Start a checkpoint: rotate onto a fresh segment, drain the queue and
    /// return the vclock at the boundary.
    pub fn checkpoint_begin(&self) -> Result<Vclock> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WriterMessage::Rotate(tx))
            .map_err(|_| Error::WalIo)?;
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::WalIo),
        }
        Ok(self.sync())
    }

    /// Commit a checkpoint at `vclock`: segments wholly older than it become
    /// garbage and are collected.
    pub fn checkpoint_commit(&self, vclock: &Vclock) {
        *self.shared.checkpoint_vclock.lock().unwrap() = vclock.clone();
        self.shared.checkpoint_wal_size.store(0, Ordering::Relaxed);
        if let Err(e) = writer::collect_garbage(&self.shared.dir, vclock.sum()) {
            log::warn!("segment garbage collection failed: {}", e);
        }
    }

    /// Bytes appended since the last committed checkpoint.
    pub fn checkpoint_wal_size(&self) -> u64 {
        self.shared.checkpoint_wal_size.load(Ordering::Relaxed)
    }

    /// Fault-injection hook: the next `count` writes fail with an I/O
    /// error, exercising the cascading-rollback path.
    pub fn fail_next_writes(&self, count: u32) {
        self.shared.inject_write_errors.store(count, Ordering::Release);
    }

    /// Fault-injection hook: stall the writer so several submissions pile
    /// up into one batch.
    pub fn hold_writes(&self, hold: bool) {
        self.shared.write_hold.store(hold, Ordering::Release);
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(WriterMessage::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl JournalShared {
    /// Fail an entry that never made it into the queue accounting.
    fn finish_submission_failure(&self, mut entry: JournalEntry, sig: i64, on_done: OnDone) {
        entry.signature = sig;
        on_done(entry);
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
    }
}
