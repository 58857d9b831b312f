//! Error types for minisync
//!
//! Defines a unified error type that can represent errors from all components,
//! plus the transaction signature codes the journal and limbo stamp onto
//! completed entries.

use std::fmt;
use std::io;

/// Signature of a journal entry / transaction. Non-negative values are the
/// maximal LSN of the written batch; negative values are failure codes.
pub mod signature {
    /// Entry didn't attempt a journal write yet.
    pub const UNKNOWN: i64 = -1;
    /// Tried to be written, but something happened related to IO.
    pub const IO_ERR: i64 = -2;
    /// Rolled back because an earlier entry in the submission stream failed.
    pub const CASCADE: i64 = -3;
    /// User-requested rollback.
    pub const ROLLBACK: i64 = -4;
    /// The synchronous quorum was not collected in time.
    pub const QUORUM_TIMEOUT: i64 = -5;
    /// The limbo owner changed while the entry was waiting.
    pub const SYNC_ROLLBACK: i64 = -6;
    /// The waiting task was cancelled.
    pub const CANCELLED: i64 = -7;
}

/// Unified error type for minisync operations
#[derive(Debug)]
pub enum Error {
    /// I/O error (file operations)
    Io(io::Error),
    /// A journal write failed
    WalIo,
    /// Rolled back because a previous entry's rollback is still in progress
    CascadeRollback,
    /// The waiting task was cancelled
    Cancelled,
    /// A synchro request from a stale or impossible timeline
    SplitBrain(String),
    /// A synchronous transaction was rolled back by an owner change
    SyncRollback,
    /// The synchronous quorum was not collected in time
    SyncQuorumTimeout,
    /// Deferred foreign key constraint violated at commit
    FkConstraint,
    /// Operation requires no active transaction, but one is active
    ActiveTransaction,
    /// Operation requires an active transaction
    NoTransaction,
    /// Commit is not allowed from a sub-statement
    CommitInSubStmt,
    /// Too many nested sub-statements
    SubStmtMax,
    /// A single-statement context got a multi-statement transaction
    MultistatementTransaction(String),
    /// Transaction-level error (timeout, state violation)
    Transaction(String),
    /// Broken or unsupported request
    Protocol(String),
    /// Recovery refused to load a damaged log
    Recovery(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::WalIo => write!(f, "Failed to write to disk"),
            Error::CascadeRollback => {
                write!(f, "WAL has a rollback in progress")
            }
            Error::Cancelled => write!(f, "The task has been cancelled"),
            Error::SplitBrain(msg) => write!(f, "Split-Brain discovered: {}", msg),
            Error::SyncRollback => {
                write!(f, "A rollback for a synchronous transaction is received")
            }
            Error::SyncQuorumTimeout => {
                write!(f, "Quorum collection for a synchronous transaction is timed out")
            }
            Error::FkConstraint => {
                write!(f, "Can not commit transaction: deferred foreign keys violations are not resolved")
            }
            Error::ActiveTransaction => {
                write!(f, "Operation is not permitted when there is an active transaction")
            }
            Error::NoTransaction => write!(f, "No active transaction"),
            Error::CommitInSubStmt => {
                write!(f, "Can not commit transaction in a nested statement")
            }
            Error::SubStmtMax => {
                write!(f, "Maximum number of nested statements reached")
            }
            Error::MultistatementTransaction(wher) => {
                write!(f, "{} does not support multi-statement transactions", wher)
            }
            Error::Transaction(msg) => write!(f, "{}", msg),
            Error::Protocol(msg) => write!(f, "{}", msg),
            Error::Recovery(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type alias for minisync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Convert a negative transaction signature into the error it stands for.
///
/// Panics on a non-negative signature or on `UNKNOWN`, exactly like asking
/// for the error of a transaction that has none.
pub fn error_from_signature(sig: i64) -> Error {
    match sig {
        signature::IO_ERR => Error::WalIo,
        signature::CASCADE => Error::CascadeRollback,
        signature::ROLLBACK => Error::Transaction("Transaction has been aborted by a rollback".to_string()),
        signature::QUORUM_TIMEOUT => Error::SyncQuorumTimeout,
        signature::SYNC_ROLLBACK => Error::SyncRollback,
        signature::CANCELLED => Error::Cancelled,
        _ => panic!("transaction signature {} can't be converted to an error", sig),
    }
}
