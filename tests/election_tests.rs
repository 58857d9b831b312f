//! Two-node election tests with a hand-driven message transport.

use std::time::{Duration, Instant};

use minisync::raft::RaftState;
use minisync::{Config, ElectionMode, Node};
use tempfile::tempdir;

fn candidate_node(dir: &std::path::Path, peer_id: u32, quorum: usize) -> Node {
    let config = Config {
        peer_id,
        data_dir: dir.to_path_buf(),
        sync_quorum: quorum,
        election_mode: ElectionMode::Candidate,
        // Long enough that the test transport, not a timeout, decides.
        election_timeout: 30.0,
        ..Default::default()
    };
    Node::new(config).unwrap()
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Shuttle raft broadcasts between two nodes until `done` or a timeout.
fn pump(
    a: &Node,
    a_rx: &std::sync::mpsc::Receiver<minisync::raft::RaftMessage>,
    b: &Node,
    b_rx: &std::sync::mpsc::Receiver<minisync::raft::RaftMessage>,
    mut done: impl FnMut() -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "transport pump timed out");
        let mut idle = true;
        while let Ok(msg) = a_rx.try_recv() {
            let _ = b.process_raft_msg(&msg, a.config().peer_id);
            idle = false;
        }
        while let Ok(msg) = b_rx.try_recv() {
            let _ = a.process_raft_msg(&msg, b.config().peer_id);
            idle = false;
        }
        if idle {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[test]
fn test_two_node_election() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let a = candidate_node(dir_a.path(), 1, 2);
    let b = candidate_node(dir_b.path(), 2, 2);
    a.set_registered_count(2);
    b.set_registered_count(2);

    let a_rx = a.raft().subscribe();
    let b_rx = b.raft().subscribe();

    // A campaigns; B grants the vote; A wins and broadcasts leadership.
    a.raft().new_term();
    pump(&a, &a_rx, &b, &b_rx, || {
        a.raft().state() == RaftState::Leader && b.raft().leader() == 1
    });
    assert_eq!(b.raft().state(), RaftState::Follower);
    assert_eq!(a.raft().term(), b.raft().term());

    // Winning the election hands A the limbo.
    wait_for("limbo promotion", || a.limbo().owner_id() == 1);
    assert_eq!(a.limbo().term(), a.raft().volatile_term());
}

#[test]
fn test_competing_candidate_yields_to_winner() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let a = candidate_node(dir_a.path(), 1, 2);
    let b = candidate_node(dir_b.path(), 2, 2);
    // Three registered peers: neither self-vote alone is a quorum.
    a.set_registered_count(3);
    b.set_registered_count(3);

    let a_rx = a.raft().subscribe();
    let b_rx = b.raft().subscribe();

    // Both campaign in their own terms.
    a.raft().new_term();
    b.raft().new_term();
    wait_for("a campaigns", || a.raft().state() == RaftState::Candidate);
    wait_for("b campaigns", || b.raft().state() == RaftState::Candidate);

    // A collects a vote from a third peer and wins its term.
    let term = a.raft().term();
    let vote = minisync::raft::RaftMessage {
        term,
        vote: 1,
        state: RaftState::Follower,
        vclock: None,
    };
    a.process_raft_msg(&vote, 3).unwrap();
    wait_for("a leads", || a.raft().state() == RaftState::Leader);

    // B observes A's leader broadcast and follows.
    pump(&a, &a_rx, &b, &b_rx, || {
        b.raft().leader() == 1 && b.raft().state() == RaftState::Follower
    });
}

#[test]
fn test_heartbeat_defers_election() {
    let dir = tempdir().unwrap();
    let config = Config {
        peer_id: 2,
        data_dir: dir.path().to_path_buf(),
        sync_quorum: 2,
        election_mode: ElectionMode::Candidate,
        election_timeout: 0.3,
        ..Default::default()
    };
    let node = Node::new(config).unwrap();
    node.set_registered_count(2);

    // Install a leader.
    let leader_msg = minisync::raft::RaftMessage {
        term: 2,
        vote: 1,
        state: RaftState::Leader,
        vclock: None,
    };
    node.process_raft_msg(&leader_msg, 1).unwrap();
    wait_for("leader known", || node.raft().leader() == 1);
    let term = node.raft().volatile_term();

    // Regular heartbeats keep the follower from campaigning.
    for _ in 0..6 {
        std::thread::sleep(Duration::from_millis(100));
        node.process_raft_heartbeat(1);
    }
    assert_eq!(node.raft().volatile_term(), term);
    assert_eq!(node.raft().leader(), 1);

    // Silence kills the leader and starts a new term.
    wait_for("new election after leader death", || {
        node.raft().volatile_term() > term
    });
}
