//! A MySQL replication client library.
//!
//! Connects to a MySQL primary as a replica, streams the row-based binary
//! log, decodes row events into typed records, and delivers them to
//! per-table callbacks. Applications observe database mutations in near
//! real time without polling: caches, search indexers and other
//! change-data-capture consumers.
//!
//! ```text
//! MySQL primary ──binlog dump──▶ Connection ──frames──▶ Decoder
//!                                                          │ schema lookups
//!                                                          ▼
//!                        subscribers ◀── Dispatcher ◀── RowChange
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use binlog_follower::{EventKindMask, MasterInfo, MemoryStateSink, Replica};
//! use std::sync::Arc;
//!
//! # async fn example() -> binlog_follower::Result<()> {
//! let master = MasterInfo::new("localhost", "repl")
//!     .with_password("secret")
//!     .with_server_id(4242);
//!
//! let mut replica = Replica::new(master, Arc::new(MemoryStateSink::new()));
//! replica.subscribe("shop", "orders", EventKindMask::ALL, |change| {
//!     println!("{} {}.{} at {}", change.kind, change.database, change.table, change.at_position);
//! });
//!
//! replica.init().await?;
//! replica.run(|| false).await
//! # }
//! ```
//!
//! # Positions and resume
//!
//! The committed position advances only at transaction boundaries (XID
//! events). After a crash or disconnect the client resumes from the last
//! committed position, so a transaction interrupted mid-flight is replayed
//! in full and never half-delivered. Persist positions across restarts by
//! plugging in a [`StateSink`] such as [`FileStateSink`].
//!
//! # Requirements
//!
//! MySQL 5.6 or newer with `binlog_format=ROW` and `binlog_row_image=FULL`,
//! and an account with `REPLICATION SLAVE` and `SELECT` on
//! `information_schema`.

pub mod client;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod position;
pub mod protocol;
pub mod record;
pub mod retry;
pub mod schema;
pub mod state;
pub mod value;
pub mod wire;

pub use client::{MasterInfo, Replica};
pub use decoder::{
    BinlogEvent, ChecksumAlgorithm, ColumnDescriptor, Decoder, EventHeader, EventType,
    FormatDescription, QueryEvent, RowsEventData, TableDescriptor, TableMapEvent,
};
pub use error::{Error, Result};
pub use position::{BinlogPosition, PositionTracker};
pub use record::{Cell, EventKind, EventKindMask, RowChange, RowImage};
pub use schema::{ColumnSchema, SchemaResolver, TableSchema};
pub use state::{FileStateSink, MemoryStateSink, StateSink};
pub use value::{ColumnType, Value};
