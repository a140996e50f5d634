//! Pluggable persistence of replication progress.
//!
//! The client reports lifecycle transitions and committed positions through
//! a [`StateSink`]; on startup it asks the sink for the position to resume
//! from. Implementations decide durability: keep it in memory, write a file,
//! store it next to the data they maintain.

use crate::error::{Error, Result};
use crate::position::BinlogPosition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Receiver for replication progress and lifecycle notifications.
///
/// All methods are invoked from the client's session loop; implementations
/// should bound their work or they will stall the stream.
#[async_trait]
pub trait StateSink: Send + Sync {
    /// A connection attempt to the primary is starting.
    async fn on_connecting(&self) {}

    /// The session is authenticated and about to request the dump.
    async fn on_connected(&self) {}

    /// A position was committed (transaction boundary or rotate).
    async fn on_position(&self, file: &str, offset: u64);

    /// Timestamp (epoch seconds) of the most recently processed event.
    async fn on_last_event_time(&self, _epoch_secs: u64) {}

    /// Position to resume from; `None` means "start at the primary's
    /// current position". Called once during [`Replica::init`](crate::Replica::init).
    async fn load(&self) -> Result<Option<BinlogPosition>>;

    /// Persist whatever `on_position` last reported. Called after each
    /// committed position.
    async fn save(&self) -> Result<()>;
}

/// In-memory sink for tests and callers that track positions themselves.
#[derive(Debug, Default)]
pub struct MemoryStateSink {
    position: Mutex<Option<BinlogPosition>>,
    last_event_time: Mutex<u64>,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the resume position before handing the sink to a client.
    pub fn with_position(position: BinlogPosition) -> Self {
        Self {
            position: Mutex::new(Some(position)),
            last_event_time: Mutex::new(0),
        }
    }

    pub fn position(&self) -> Option<BinlogPosition> {
        self.position.lock().unwrap().clone()
    }

    pub fn last_event_time(&self) -> u64 {
        *self.last_event_time.lock().unwrap()
    }
}

#[async_trait]
impl StateSink for MemoryStateSink {
    async fn on_position(&self, file: &str, offset: u64) {
        *self.position.lock().unwrap() = Some(BinlogPosition::new(file, offset));
    }

    async fn on_last_event_time(&self, epoch_secs: u64) {
        *self.last_event_time.lock().unwrap() = epoch_secs;
    }

    async fn load(&self) -> Result<Option<BinlogPosition>> {
        Ok(self.position.lock().unwrap().clone())
    }

    async fn save(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    file: String,
    offset: u64,
}

/// File-backed sink: one JSON document, written atomically via a temp file
/// and rename, fsynced by default.
#[derive(Debug)]
pub struct FileStateSink {
    path: PathBuf,
    fsync: bool,
    position: Mutex<Option<BinlogPosition>>,
}

impl FileStateSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fsync: true,
            position: Mutex::new(None),
        }
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }
}

#[async_trait]
impl StateSink for FileStateSink {
    async fn on_position(&self, file: &str, offset: u64) {
        *self.position.lock().unwrap() = Some(BinlogPosition::new(file, offset));
    }

    async fn load(&self) -> Result<Option<BinlogPosition>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let state: PersistedState = serde_json::from_str(&contents)?;
        let position = BinlogPosition::new(state.file, state.offset);
        *self.position.lock().unwrap() = Some(position.clone());
        Ok(Some(position))
    }

    async fn save(&self) -> Result<()> {
        let Some(position) = self.position.lock().unwrap().clone() else {
            return Ok(());
        };

        let state = PersistedState {
            file: position.file,
            offset: position.offset,
        };
        let json = serde_json::to_string_pretty(&state)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);
        fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "saved replication position");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_tracks_position() {
        let sink = MemoryStateSink::new();
        assert_eq!(sink.load().await.unwrap(), None);

        sink.on_position("mysql-bin.000002", 987).await;
        sink.on_last_event_time(1_700_000_000).await;
        sink.save().await.unwrap();

        assert_eq!(
            sink.load().await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000002", 987))
        );
        assert_eq!(sink.last_event_time(), 1_700_000_000);
    }

    #[tokio::test]
    async fn file_sink_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.info");

        let sink = FileStateSink::new(&path);
        assert_eq!(sink.load().await.unwrap(), None);

        sink.on_position("mysql-bin.000007", 4242).await;
        sink.save().await.unwrap();

        // Fresh sink, as after a process restart.
        let restarted = FileStateSink::new(&path);
        assert_eq!(
            restarted.load().await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000007", 4242))
        );
    }

    #[tokio::test]
    async fn file_sink_save_without_position_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.info");

        let sink = FileStateSink::new(&path);
        sink.save().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_sink_rejects_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.info");
        std::fs::write(&path, "not json").unwrap();

        let sink = FileStateSink::new(&path);
        assert!(matches!(sink.load().await, Err(Error::Json(_))));
    }
}
