//! End-to-end tests of the asynchronous commit path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use minisync::row::RowKind;
use minisync::txn::SpaceDef;
use minisync::{Config, Error, Node};
use tempfile::tempdir;

fn test_node(dir: &std::path::Path) -> Node {
    let config = Config {
        peer_id: 1,
        data_dir: dir.to_path_buf(),
        ..Default::default()
    };
    Node::new(config).unwrap()
}

fn items() -> SpaceDef {
    SpaceDef::new(512, "items")
}

#[test]
fn test_async_commit_succeeds() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, items(), None, Some(vec![1, 2, 3]))
        .unwrap();
    node.commit(txn).unwrap();

    // The row was rewritten onto this peer's stream.
    assert_eq!(node.vclock().get(1), 1);
}

#[test]
fn test_empty_txn_commits_without_journal_io() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    let txn = node.begin();
    node.commit(txn).unwrap();
    assert!(node.vclock().is_empty());
}

#[test]
fn test_commit_triggers_run_in_reverse_registration_order() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, items(), None, Some(vec![1]))
        .unwrap();
    for i in 0..3 {
        let order = Arc::clone(&order);
        txn.on_commit(Box::new(move |_| order.lock().unwrap().push(i)));
    }
    node.commit(txn).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
}

#[test]
fn test_user_rollback_fires_triggers_in_statement_order() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut txn = node.begin();
    for i in 0..3 {
        let idx = txn
            .add_statement(RowKind::Insert, items(), None, Some(vec![i]))
            .unwrap();
        let order = Arc::clone(&order);
        txn.on_stmt_rollback(idx, Box::new(move |_| order.lock().unwrap().push(i)));
    }
    let order_txn = Arc::clone(&order);
    txn.on_rollback(Box::new(move |_| order_txn.lock().unwrap().push(99)));
    node.rollback(txn);

    // Statement triggers in statement order, then the transaction's own
    // rollback trigger.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 99]);
}

#[test]
fn test_try_async_completions_preserve_submission_order() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    let signatures = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10u8 {
        let mut txn = node.begin();
        txn.add_statement(RowKind::Insert, items(), None, Some(vec![i]))
            .unwrap();
        let signatures = Arc::clone(&signatures);
        txn.on_commit(Box::new(move |t| {
            signatures.lock().unwrap().push(t.signature());
        }));
        node.commit_try_async(txn).unwrap();
    }
    node.journal().flush();

    let signatures = signatures.lock().unwrap();
    assert_eq!(signatures.len(), 10);
    for window in signatures.windows(2) {
        assert!(window[0] < window[1], "signatures went backwards");
    }
}

#[test]
fn test_cascading_rollback_signals_in_reverse_order() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    // Stall the writer so all three transactions pile up, then make the
    // first write fail.
    node.journal().hold_writes(true);
    node.journal().fail_next_writes(1);

    let outcomes: Arc<Mutex<Vec<(u8, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=3u8 {
        let mut txn = node.begin();
        txn.add_statement(RowKind::Insert, items(), None, Some(vec![i]))
            .unwrap();
        let outcomes = Arc::clone(&outcomes);
        txn.on_rollback(Box::new(move |t| {
            outcomes.lock().unwrap().push((i, t.signature()));
        }));
        node.commit_try_async(txn).unwrap();
    }
    node.journal().hold_writes(false);
    node.journal().flush();

    let outcomes = outcomes.lock().unwrap();
    // The whole tail is rolled back, newest first.
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].0, 3);
    assert_eq!(outcomes[1].0, 2);
    assert_eq!(outcomes[2].0, 1);
    // The failed write reports the I/O error, the rest cascade.
    assert_eq!(outcomes[2].1, minisync::error::signature::IO_ERR);
    assert_eq!(outcomes[0].1, minisync::error::signature::CASCADE);
    assert_eq!(outcomes[1].1, minisync::error::signature::CASCADE);
}

#[test]
fn test_blocking_commit_reports_io_error() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path());

    node.journal().fail_next_writes(1);
    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, items(), None, Some(vec![1]))
        .unwrap();
    match node.commit(txn) {
        Err(Error::WalIo) => {}
        other => panic!("expected a WAL I/O error, got {:?}", other.err()),
    }

    // The journal leaves rollback mode once drained; later commits work.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut txn = node.begin();
        txn.add_statement(RowKind::Insert, items(), None, Some(vec![2]))
            .unwrap();
        match node.commit(txn) {
            Ok(()) => break,
            Err(Error::CascadeRollback) if std::time::Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

#[test]
fn test_submission_blocks_on_queue_budget() {
    let dir = tempdir().unwrap();
    let config = Config {
        peer_id: 1,
        data_dir: dir.path().to_path_buf(),
        journal_queue_max_size: 64,
        ..Default::default()
    };
    let node = Arc::new(Node::new(config).unwrap());

    node.journal().hold_writes(true);
    // First submission fills the budget.
    let mut txn = node.begin();
    txn.add_statement(RowKind::Insert, items(), None, Some(vec![0; 128]))
        .unwrap();
    node.commit_try_async(txn).unwrap();
    assert!(node.journal().would_block());

    // Second submission must wait for the drain.
    let blocked_node = Arc::clone(&node);
    let handle = std::thread::spawn(move || {
        let mut txn = blocked_node.begin();
        txn.add_statement(RowKind::Insert, items(), None, Some(vec![1]))
            .unwrap();
        blocked_node.commit_try_async(txn).unwrap();
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished());

    node.journal().hold_writes(false);
    handle.join().unwrap();
    node.journal().flush();
    assert_eq!(node.vclock().get(1), 2);
}

#[test]
fn test_txn_rows_stay_ordered_across_segment_rotation() {
    let dir = tempdir().unwrap();
    let config = Config {
        peer_id: 1,
        data_dir: dir.path().to_path_buf(),
        log_max_size: 256,
        ..Default::default()
    };
    let node = Node::new(config).unwrap();

    for i in 0..6u8 {
        let mut txn = node.begin();
        txn.add_statement(RowKind::Insert, items(), None, Some(vec![i; 100]))
            .unwrap();
        txn.add_statement(RowKind::Insert, items(), None, Some(vec![i; 100]))
            .unwrap();
        node.commit(txn).unwrap();
    }
    assert_eq!(node.vclock().get(1), 12);

    let segments: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(".xlog"))
        .collect();
    assert!(segments.len() > 1, "expected a rotation");
}
