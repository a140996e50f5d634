//! Binlog position tracking with transaction-boundary commit semantics.
//!
//! The tracker distinguishes the durable, published position (advanced only
//! when a transaction commits) from the in-transaction shadow offset that
//! trails every processed event. Observers may block until a target position
//! has been committed; publication wakes them through a condition variable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A point in one primary's binlog history.
///
/// Ordering is lexicographic on `(file, offset)`, which matches the
/// primary's own numbering of its log files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Parse the `file:offset` form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        let (file, offset) = s.rsplit_once(':')?;
        if file.is_empty() {
            return None;
        }
        Some(Self {
            file: file.to_string(),
            offset: offset.parse().ok()?,
        })
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

#[derive(Debug)]
struct Inner {
    committed: BinlogPosition,
    /// Byte offset after the last processed event of the open transaction.
    /// Never published on its own.
    intransaction: u64,
}

/// Shared position state for one replication client.
#[derive(Debug)]
pub struct PositionTracker {
    inner: Mutex<Inner>,
    committed_cond: Condvar,
}

impl PositionTracker {
    pub fn new(initial: BinlogPosition) -> Self {
        let intransaction = initial.offset;
        Self {
            inner: Mutex::new(Inner {
                committed: initial,
                intransaction,
            }),
            committed_cond: Condvar::new(),
        }
    }

    /// Record that an event ending at `next_offset` has been processed
    /// inside the current transaction window.
    pub fn note_event(&self, next_offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.intransaction = next_offset;
    }

    /// Publish the shadow offset as the new durable position and wake
    /// waiters. Invoked at transaction commit and at start of stream.
    pub fn commit(&self) -> BinlogPosition {
        let mut inner = self.inner.lock().unwrap();
        inner.committed.offset = inner.intransaction;
        let committed = inner.committed.clone();
        drop(inner);
        self.committed_cond.notify_all();
        committed
    }

    /// Switch to a new binlog file and publish immediately. File rotation
    /// only happens between transactions.
    pub fn rotate(&self, file: impl Into<String>, offset: u64) -> BinlogPosition {
        let mut inner = self.inner.lock().unwrap();
        inner.committed = BinlogPosition::new(file, offset);
        inner.intransaction = offset;
        let committed = inner.committed.clone();
        drop(inner);
        self.committed_cond.notify_all();
        committed
    }

    /// Replace the position outright (manual rewind before a restart).
    pub fn set(&self, position: BinlogPosition) {
        let mut inner = self.inner.lock().unwrap();
        inner.intransaction = position.offset;
        inner.committed = position;
        drop(inner);
        self.committed_cond.notify_all();
    }

    /// Discard in-transaction progress after a disconnect; the primary will
    /// replay the aborted transaction from the committed position.
    pub fn reset_shadow(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.intransaction = inner.committed.offset;
    }

    pub fn committed(&self) -> BinlogPosition {
        self.inner.lock().unwrap().committed.clone()
    }

    /// Block until the committed position reaches `target` or the timeout
    /// elapses. Returns whether the target was reached.
    pub fn wait_for(&self, target: &BinlogPosition, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.committed >= *target {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .committed_cond
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if result.timed_out() && inner.committed < *target {
                return false;
            }
        }
    }
}
