//! Error types for the request exchange.

use crate::types::{Rank, RequestId};
use std::io;
use thiserror::Error;

/// Result type alias for exchange operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the request exchange.
#[derive(Error, Debug)]
pub enum Error {
    /// Store errors that survived the retry policy.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Group transport errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol violations (unsupported kinds, malformed chunks, ...).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A poll deadline expired before every awaited result was observed.
    #[error("timed out waiting for {outstanding} result(s) on rank {rank}, first id {first_id}")]
    Timeout {
        rank: Rank,
        first_id: RequestId,
        outstanding: usize,
    },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors reported by a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is busy or locked. Always retried by `StoreClient`.
    #[error("store busy or locked")]
    Contention,

    /// Any non-transient failure: malformed statement, I/O error, closed handle.
    #[error("fatal store error on `{statement}`: {reason}")]
    Fatal { statement: String, reason: String },
}

impl StoreError {
    /// Build a fatal error for the given statement.
    pub fn fatal(statement: impl Into<String>, reason: impl ToString) -> Self {
        Self::Fatal {
            statement: statement.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Contention)
    }
}

/// Group transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The peer endpoint is gone.
    #[error("connection to rank {0} closed")]
    ConnectionClosed(Rank),

    /// No route from this endpoint to the destination rank.
    #[error("rank {from} cannot reach rank {to}")]
    Unroutable { from: Rank, to: Rank },

    /// Rank outside the group.
    #[error("rank {rank} outside group of size {size}")]
    InvalidRank { rank: Rank, size: usize },

    /// Failed to send a frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Violations of the request/response protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The request kind was never registered with this exchange.
    #[error("request kind {0} is not registered")]
    UnsupportedKind(&'static str),

    /// A store row carried an operating mode code outside the known set.
    #[error("unknown operating mode code {0}")]
    UnknownMode(i64),

    /// A row or record did not have the expected number of fields.
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    /// A chunk's byte length is not a whole number of records.
    #[error("chunk of {len} bytes is not a multiple of the {record} byte record size")]
    MalformedChunk { len: usize, record: usize },

    /// A chunk carried more records than the transfer capacity.
    #[error("chunk of {count} records exceeds capacity {capacity}")]
    ChunkOverflow { count: usize, capacity: usize },

    /// Chunk bookkeeping disagrees with the expected request count.
    #[error("rank {rank}: expected {expected} results, assembled {found}")]
    ChunkAccounting {
        rank: Rank,
        expected: usize,
        found: usize,
    },

    /// Kill-switch requests are single-shot and cannot be batched.
    #[error("kill-switch mode cannot be used for batch requests")]
    KillInBatch,

    /// The broker rank has no store connection.
    #[error("rank {0} is the broker but holds no store connection")]
    MissingStore(Rank),

    /// The broker failed the collective round this rank was waiting on.
    #[error("broker aborted the collective round: {0}")]
    BrokerAborted(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Contention
            }
            _ => StoreError::fatal("", e),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}
