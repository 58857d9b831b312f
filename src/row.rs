//! Journal row structures
//!
//! A row is a single encoded change. Its header carries replication identity
//! (peer, lsn, tsn), the payload is a transport-opaque blob except for the
//! synchro and raft record kinds which the core itself produces and consumes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vclock::Vclock;

/// LSN placeholder of a row that has not reached the journal writer yet.
pub const LSN_UNASSIGNED: i64 = 0;

/// Replication group of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupId {
    /// Replicated to peers.
    Default,
    /// Stays on this node; keeps `peer_id = 0` and rides the local LSN stream.
    Local,
}

impl Default for GroupId {
    fn default() -> Self {
        GroupId::Default
    }
}

/// What a row is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    /// Barrier row with no payload; bumps the LSN stream only.
    Nop,
    Insert,
    Update,
    Delete,
    /// Synchro record: all entries of the owner up to `lsn` are committed.
    Confirm,
    /// Synchro record: all entries of the owner after `lsn` are rolled back.
    Rollback,
    /// Synchro record: ownership transfer to the record's origin.
    Promote,
    /// Synchro record: ownership cleared.
    Demote,
    /// Raft persistent state (term, vote).
    Raft,
}

impl RowKind {
    pub fn is_synchro(self) -> bool {
        matches!(
            self,
            RowKind::Confirm | RowKind::Rollback | RowKind::Promote | RowKind::Demote
        )
    }

    pub fn is_promote_like(self) -> bool {
        matches!(self, RowKind::Promote | RowKind::Demote)
    }

    pub fn is_dml(self) -> bool {
        matches!(self, RowKind::Insert | RowKind::Update | RowKind::Delete)
    }
}

/// Flags stored in the last row of a journal batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFlags {
    /// The transaction must wait for pending synchronous ones.
    pub wait_sync: bool,
    /// The transaction itself needs a quorum of acks.
    pub wait_ack: bool,
    /// Last row of a multi-row transaction.
    pub is_commit: bool,
}

/// A single journal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub kind: RowKind,
    /// Origin peer. 0 means "this node"; the journal writer rewrites it.
    pub peer_id: u32,
    /// Position in the origin peer's LSN stream. Assigned by the writer.
    pub lsn: i64,
    /// LSN of the first non-local row of the transaction this row belongs to.
    pub tsn: i64,
    /// Wall-clock timestamp (unix millis) stamped by the writer.
    pub tm: u64,
    pub group: GroupId,
    pub flags: RowFlags,
    /// Transport-opaque payload. Synchro and raft rows keep their encoded
    /// request here.
    pub body: Vec<u8>,
}

impl Row {
    pub fn nop() -> Self {
        Self {
            kind: RowKind::Nop,
            peer_id: 0,
            lsn: LSN_UNASSIGNED,
            tsn: 0,
            tm: 0,
            group: GroupId::Default,
            flags: RowFlags::default(),
            body: Vec::new(),
        }
    }

    pub fn dml(kind: RowKind, group: GroupId, body: Vec<u8>) -> Self {
        debug_assert!(kind.is_dml());
        Self {
            kind,
            peer_id: 0,
            lsn: LSN_UNASSIGNED,
            tsn: 0,
            tm: 0,
            group,
            flags: RowFlags::default(),
            body,
        }
    }

    /// Rough encoded size, used for queue accounting before the real
    /// encoding happens in the writer.
    pub fn approx_len(&self) -> u64 {
        48 + self.body.len() as u64
    }

    /// Decode the synchro payload of a Confirm/Rollback/Promote/Demote row.
    pub fn synchro_request(&self) -> Result<SynchroRequest> {
        if !self.kind.is_synchro() {
            return Err(Error::Protocol(format!(
                "row {:?} carries no synchro payload",
                self.kind
            )));
        }
        bincode::deserialize(&self.body)
            .map_err(|e| Error::Protocol(format!("malformed synchro payload: {}", e)))
    }

    /// Decode the payload of a Raft row.
    pub fn raft_state(&self) -> Result<RaftRecord> {
        if self.kind != RowKind::Raft {
            return Err(Error::Protocol(format!(
                "row {:?} carries no raft payload",
                self.kind
            )));
        }
        bincode::deserialize(&self.body)
            .map_err(|e| Error::Protocol(format!("malformed raft payload: {}", e)))
    }
}

/// Kind of a synchro request, mirrored in the carrying row's `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchroKind {
    Confirm,
    Rollback,
    Promote,
    Demote,
}

impl SynchroKind {
    pub fn row_kind(self) -> RowKind {
        match self {
            SynchroKind::Confirm => RowKind::Confirm,
            SynchroKind::Rollback => RowKind::Rollback,
            SynchroKind::Promote => RowKind::Promote,
            SynchroKind::Demote => RowKind::Demote,
        }
    }

    pub fn is_promote_like(self) -> bool {
        matches!(self, SynchroKind::Promote | SynchroKind::Demote)
    }
}

/// A CONFIRM/ROLLBACK/PROMOTE/DEMOTE request, either produced locally or
/// received from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchroRequest {
    pub kind: SynchroKind,
    /// Who produced the request. 0 only during bootstrap.
    pub origin_id: u32,
    /// The limbo owner the request applies to.
    pub peer_id: u32,
    /// Confirmation border in the owner's LSN stream.
    pub lsn: i64,
    /// Election term. Non-zero for Promote/Demote only.
    pub term: u64,
    /// Per-previous-owner confirmed LSNs. Serialized in checkpoint snapshots
    /// only, never in journaled or replicated records.
    pub confirmed_vclock: Option<Vclock>,
}

impl SynchroRequest {
    pub fn confirm(peer_id: u32, lsn: i64) -> Self {
        Self {
            kind: SynchroKind::Confirm,
            origin_id: peer_id,
            peer_id,
            lsn,
            term: 0,
            confirmed_vclock: None,
        }
    }

    pub fn rollback(peer_id: u32, lsn: i64) -> Self {
        Self {
            kind: SynchroKind::Rollback,
            origin_id: peer_id,
            peer_id,
            lsn,
            term: 0,
            confirmed_vclock: None,
        }
    }

    pub fn promote(origin_id: u32, peer_id: u32, lsn: i64, term: u64) -> Self {
        Self {
            kind: SynchroKind::Promote,
            origin_id,
            peer_id,
            lsn,
            term,
            confirmed_vclock: None,
        }
    }

    pub fn demote(origin_id: u32, peer_id: u32, lsn: i64, term: u64) -> Self {
        Self {
            kind: SynchroKind::Demote,
            origin_id,
            peer_id,
            lsn,
            term,
            confirmed_vclock: None,
        }
    }

    /// Encode into a journal row. The checkpoint-only `confirmed_vclock` is
    /// stripped here so it can never leak into the log.
    pub fn into_row(mut self) -> Row {
        self.confirmed_vclock = None;
        let kind = self.kind.row_kind();
        let body = bincode::serialize(&self).expect("synchro request is serializable");
        Row {
            kind,
            peer_id: 0,
            lsn: LSN_UNASSIGNED,
            tsn: 0,
            tm: 0,
            group: GroupId::Default,
            flags: RowFlags::default(),
            body,
        }
    }
}

/// Raft persistent state as stored in the journal. Only term and vote are
/// ever persisted; role and vclock travel over the network alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftRecord {
    pub term: u64,
    pub vote: u32,
}

impl RaftRecord {
    pub fn into_row(self) -> Row {
        let body = bincode::serialize(&self).expect("raft record is serializable");
        Row {
            kind: RowKind::Raft,
            peer_id: 0,
            lsn: LSN_UNASSIGNED,
            tsn: 0,
            tm: 0,
            group: GroupId::Local,
            flags: RowFlags::default(),
            body,
        }
    }
}
