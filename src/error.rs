//! Error types for the replication client.
//!
//! Errors are split into two recovery classes: transient failures that the
//! client loop absorbs by reconnecting from the last committed position, and
//! fatal failures that surface through [`Replica::run`](crate::Replica::run).

use crate::position::BinlogPosition;
use thiserror::Error;

/// Errors produced while following a primary's binary log.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the replication connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A socket operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Wire-protocol violation: bad sequence number, malformed packet,
    /// unexpected response byte.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server-side replication error (ERR packet with a retriable code).
    #[error("replication error {code}: {message}")]
    Replication { code: u16, message: String },

    /// The requested binlog position no longer exists on the primary
    /// (server error 1236). Requires operator intervention.
    #[error("binlog position lost: {0}")]
    PositionLost(String),

    /// Authentication with the primary failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Schema resolver failure that may succeed on retry (connection loss,
    /// query timeout).
    #[error("schema lookup failed: {0}")]
    Schema(String),

    /// The table structure observed on the wire disagrees with
    /// `information_schema`, or references a table that does not exist.
    #[error("schema drift: {0}")]
    SchemaDrift(String),

    /// Malformed event payload: truncation, checksum mismatch, or an
    /// unparseable body. The session is torn down and resumed from the last
    /// committed position.
    #[error("decode error: {0}")]
    Decode(String),

    /// A decoder invariant was violated (rows event without a table map,
    /// NULL bit set for a NOT NULL column). Not recoverable by reconnecting.
    #[error("decoder invariant violated: {0}")]
    Invariant(String),

    /// A subscriber callback panicked. The originating change's position is
    /// carried so the operator knows exactly what was not committed.
    #[error("callback for {database}.{table} failed at {position}")]
    CallbackFailed {
        database: String,
        table: String,
        position: BinlogPosition,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON (de)serialization failure in the state sink.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn schema_drift(msg: impl Into<String>) -> Self {
        Self::SchemaDrift(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether the client loop should reconnect and resume rather than give
    /// up. Everything schema-, auth- or invariant-shaped is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout(_)
                | Self::Protocol(_)
                | Self::Replication { .. }
                | Self::Schema(_)
                | Self::Decode(_)
        )
    }
}

impl From<mysql_async::Error> for Error {
    fn from(e: mysql_async::Error) -> Self {
        Self::Schema(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::protocol("seq gap").is_transient());
        assert!(Error::decode("truncated").is_transient());
        assert!(Error::schema("connection reset").is_transient());
        assert!(Error::Replication {
            code: 1159,
            message: "net read timeout".into()
        }
        .is_transient());

        assert!(!Error::Auth("denied".into()).is_transient());
        assert!(!Error::PositionLost("1236".into()).is_transient());
        assert!(!Error::schema_drift("column count").is_transient());
        assert!(!Error::invariant("null bit").is_transient());
        assert!(!Error::CallbackFailed {
            database: "db".into(),
            table: "t".into(),
            position: BinlogPosition::new("mysql-bin.000001", 4),
        }
        .is_transient());
    }

    #[test]
    fn display_carries_detail() {
        let err = Error::Replication {
            code: 1236,
            message: "could not find first log file".into(),
        };
        assert!(err.to_string().contains("1236"));
        assert!(err.to_string().contains("could not find"));
    }
}
