//! End-to-end tests of synchronous commits, quorums and ownership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use minisync::error::signature;
use minisync::journal::segment::{parse_segment_name, SegmentReader};
use minisync::row::{RowKind, SynchroRequest};
use minisync::txn::SpaceDef;
use minisync::{Config, Error, Node};
use tempfile::tempdir;

fn sync_node(dir: &std::path::Path, sync_quorum: usize) -> Node {
    let config = Config {
        peer_id: 1,
        data_dir: dir.to_path_buf(),
        sync_quorum,
        ..Default::default()
    };
    Node::new(config).unwrap()
}

fn bank() -> SpaceDef {
    SpaceDef::sync(600, "bank")
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Collect every row from every segment, in log order.
fn read_log_rows(dir: &std::path::Path) -> Vec<minisync::row::Row> {
    let mut sums: Vec<i64> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| parse_segment_name(&e.unwrap().file_name().to_string_lossy()))
        .collect();
    sums.sort_unstable();
    let mut rows = Vec::new();
    for sum in sums {
        let path = dir.join(format!("{:020}.xlog", sum));
        let contents = SegmentReader::open(&path).unwrap().read_all().unwrap();
        for batch in contents.batches {
            rows.extend(batch);
        }
    }
    rows
}

#[test]
fn test_sync_commit_with_self_quorum() {
    let dir = tempdir().unwrap();
    let node = sync_node(dir.path(), 1);
    node.promote_self().unwrap();

    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
        .unwrap();
    node.commit(txn).unwrap();
    assert!(node.limbo().is_empty());
    assert!(node.limbo().confirmed_lsn() > 0);
}

#[test]
fn test_sync_commit_waits_for_peer_ack() {
    let dir = tempdir().unwrap();
    let node = Arc::new(sync_node(dir.path(), 2));
    node.set_registered_count(3);
    node.promote_self().unwrap();
    let confirmed_before = node.limbo().confirmed_lsn();

    let committed = Arc::new(AtomicBool::new(false));
    let committer = Arc::clone(&node);
    let committed_flag = Arc::clone(&committed);
    let handle = std::thread::spawn(move || {
        let mut txn = committer.begin();
        txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
            .unwrap();
        let result = committer.commit(txn);
        committed_flag.store(true, Ordering::Release);
        result
    });

    // The transaction reaches the journal but not the quorum.
    wait_for("journal write", || node.vclock().get(1) >= 2);
    std::thread::sleep(Duration::from_millis(100));
    assert!(!committed.load(Ordering::Acquire));
    assert_eq!(node.limbo().volatile_confirmed_lsn(), confirmed_before);

    // The second ack completes the quorum of two.
    let lsn = node.vclock().get(1);
    node.ack(2, lsn);
    handle.join().unwrap().unwrap();
    assert_eq!(node.limbo().confirmed_lsn(), lsn);

    // Exactly one CONFIRM for the transaction's lsn reached the log.
    node.journal().flush();
    let confirms: Vec<_> = read_log_rows(dir.path())
        .into_iter()
        .filter(|r| r.kind == RowKind::Confirm)
        .map(|r| r.synchro_request().unwrap())
        .filter(|req| req.lsn == lsn)
        .collect();
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].peer_id, 1);
}

#[test]
fn test_async_txn_waits_behind_pending_sync() {
    let dir = tempdir().unwrap();
    let node = Arc::new(sync_node(dir.path(), 2));
    node.set_registered_count(2);
    node.promote_self().unwrap();

    // A sync transaction parks in the limbo.
    let sync_committer = Arc::clone(&node);
    let sync_handle = std::thread::spawn(move || {
        let mut txn = sync_committer.begin();
        txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
            .unwrap();
        sync_committer.commit(txn)
    });
    wait_for("sync txn parked", || !node.limbo().is_empty());

    // An async transaction behind it must wait too.
    let async_done = Arc::new(AtomicBool::new(false));
    let async_committer = Arc::clone(&node);
    let async_flag = Arc::clone(&async_done);
    let async_handle = std::thread::spawn(move || {
        let mut txn = async_committer.begin();
        txn.add_statement(RowKind::Insert, SpaceDef::new(1, "plain"), None, Some(vec![2]))
            .unwrap();
        let result = async_committer.commit(txn);
        async_flag.store(true, Ordering::Release);
        result
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!async_done.load(Ordering::Acquire));

    let lsn = node.vclock().get(1);
    node.ack(2, lsn);
    sync_handle.join().unwrap().unwrap();
    async_handle.join().unwrap().unwrap();
}

#[test]
fn test_force_async_bypasses_pending_sync() {
    let dir = tempdir().unwrap();
    let node = Arc::new(sync_node(dir.path(), 2));
    node.set_registered_count(2);
    node.promote_self().unwrap();

    let sync_committer = Arc::clone(&node);
    let sync_handle = std::thread::spawn(move || {
        let mut txn = sync_committer.begin();
        txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
            .unwrap();
        sync_committer.commit(txn)
    });
    wait_for("sync txn parked", || !node.limbo().is_empty());

    // Force-async skips the limbo entirely and commits at once.
    let mut txn = node.begin();
    txn.set_force_async();
    txn.add_statement(RowKind::Insert, SpaceDef::new(1, "plain"), None, Some(vec![2]))
        .unwrap();
    node.commit(txn).unwrap();

    let lsn = node.vclock().get(1);
    node.ack(2, lsn);
    sync_handle.join().unwrap().unwrap();
}

#[test]
fn test_cancelled_waiter_detaches_and_entry_resolves_later() {
    let dir = tempdir().unwrap();
    let node = Arc::new(sync_node(dir.path(), 2));
    node.set_registered_count(2);
    node.promote_self().unwrap();

    let committed = Arc::new(Mutex::new(None));
    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
        .unwrap();
    let cancel = txn.cancel_token();
    let committed_obs = Arc::clone(&committed);
    txn.on_commit(Box::new(move |t| {
        *committed_obs.lock().unwrap() = Some(t.signature());
    }));

    let committer = Arc::clone(&node);
    let handle = std::thread::spawn(move || committer.commit(txn));
    wait_for("sync txn parked", || !node.limbo().is_empty());

    cancel.cancel();
    match handle.join().unwrap() {
        Err(Error::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.err()),
    }
    // The entry stays queued and resolves once the quorum arrives.
    assert!(!node.limbo().is_empty());
    let lsn = node.vclock().get(1);
    node.ack(2, lsn);
    wait_for("detached resolution", || node.limbo().is_empty());
    wait_for("detached commit triggers", || {
        committed.lock().unwrap().is_some()
    });
    assert!(committed.lock().unwrap().unwrap() > 0);
}

#[test]
fn test_promote_with_stale_term_is_split_brain() {
    let dir = tempdir().unwrap();
    let node = sync_node(dir.path(), 1);
    node.promote_self().unwrap();
    let term = node.limbo().term();
    let owner = node.limbo().owner_id();
    assert_eq!(owner, 1);

    // Same term from another node: split brain, state unchanged.
    let stale = SynchroRequest::promote(2, 1, node.limbo().confirmed_lsn(), term);
    match node.process_synchro(&stale) {
        Err(Error::SplitBrain(_)) => {}
        other => panic!("expected split brain, got {:?}", other.err()),
    }
    assert_eq!(node.limbo().owner_id(), 1);
    assert_eq!(node.limbo().term(), term);

    // A greater term moves ownership.
    let fresh = SynchroRequest::promote(2, 1, node.limbo().confirmed_lsn(), term + 1);
    node.process_synchro(&fresh).unwrap();
    assert_eq!(node.limbo().owner_id(), 2);
    assert_eq!(node.limbo().term(), term + 1);
}

#[test]
fn test_demote_confirms_pending_entries() {
    let dir = tempdir().unwrap();
    let node = Arc::new(sync_node(dir.path(), 2));
    node.set_registered_count(2);
    node.promote_self().unwrap();

    let committer = Arc::clone(&node);
    let handle = std::thread::spawn(move || {
        let mut txn = committer.begin();
        txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
            .unwrap();
        committer.commit(txn)
    });
    wait_for("sync txn parked", || !node.limbo().is_empty());

    // Stepping down with the border at the pending lsn confirms it.
    node.demote_self().unwrap();
    handle.join().unwrap().unwrap();
    assert!(node.limbo().is_empty());
    assert_eq!(node.limbo().owner_id(), 0);
}

#[test]
fn test_submission_after_owner_loss_fails() {
    let dir = tempdir().unwrap();
    let node = sync_node(dir.path(), 1);
    node.promote_self().unwrap();
    let term = node.limbo().term();

    // Another node takes over.
    node.process_synchro(&SynchroRequest::promote(
        2,
        1,
        node.limbo().confirmed_lsn(),
        term + 1,
    ))
    .unwrap();

    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, bank(), None, Some(vec![1]))
        .unwrap();
    match node.commit(txn) {
        Err(Error::SyncRollback) => {}
        other => panic!("expected sync rollback, got {:?}", other.err()),
    }
}

#[test]
fn test_sync_rollback_cascades_to_later_entries() {
    let dir = tempdir().unwrap();
    let node = Arc::new(sync_node(dir.path(), 2));
    node.set_registered_count(2);
    node.promote_self().unwrap();
    let term = node.limbo().term();
    let border = node.limbo().confirmed_lsn();

    // Two sync transactions pile up without a quorum.
    let outcomes: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..2u8 {
        let committer = Arc::clone(&node);
        let outcomes = Arc::clone(&outcomes);
        handles.push(std::thread::spawn(move || {
            let mut txn = committer.begin();
            txn.add_statement(RowKind::Insert, bank(), None, Some(vec![i]))
                .unwrap();
            let outcomes_inner = Arc::clone(&outcomes);
            txn.on_rollback(Box::new(move |t| {
                outcomes_inner.lock().unwrap().push(t.signature());
            }));
            committer.commit(txn)
        }));
        wait_for("txn parked", || node.limbo().len() >= i as usize + 1);
    }

    // A PROMOTE from elsewhere with the border before both entries rolls
    // them back.
    node.process_synchro(&SynchroRequest::promote(2, 1, border, term + 1))
        .unwrap();
    for handle in handles {
        match handle.join().unwrap() {
            Err(Error::SyncRollback) => {}
            other => panic!("expected sync rollback, got {:?}", other.err()),
        }
    }
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|&s| s == signature::SYNC_ROLLBACK));
}
