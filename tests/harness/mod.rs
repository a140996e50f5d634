//! Synthetic binlog stream harness.
//!
//! Builds raw event frames by hand and replays them through a miniature
//! session that mirrors the client's event handling, minus the network:
//! decoder, schema lookup, transaction buffering, dispatch, and position
//! commits. Lets stream-level behavior be tested without a server.

use binlog_follower::decoder::{BinlogEvent, Decoder, EventType, TableDescriptor};
use binlog_follower::dispatch::Dispatcher;
use binlog_follower::position::{BinlogPosition, PositionTracker};
use binlog_follower::record::RowChange;
use binlog_follower::schema::{ColumnSchema, TableSchema};
use binlog_follower::value::ColumnType;
use binlog_follower::{Error, Result};
use std::collections::HashMap;

pub const START_FILE: &str = "mysql-bin.000001";

pub fn frame(type_code: u8, body: &[u8], next_position: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(19 + body.len());
    out.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    out.push(type_code);
    out.extend_from_slice(&100u32.to_le_bytes()); // server id
    out.extend_from_slice(&((19 + body.len()) as u32).to_le_bytes());
    out.extend_from_slice(&next_position.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// FORMAT_DESCRIPTION with checksums off.
pub fn fd_frame(next_position: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&4u16.to_le_bytes());
    let mut version = [0u8; 50];
    version[..6].copy_from_slice(b"8.0.36");
    body.extend_from_slice(&version);
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(19);
    body.extend_from_slice(&[0u8; 40]);
    body.push(0); // checksum algorithm: off
    body.extend_from_slice(&[0u8; 4]);
    frame(15, &body, next_position)
}

pub fn begin_frame(db: &str, next_position: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(db.len() as u8);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(db.as_bytes());
    body.push(0);
    body.extend_from_slice(b"BEGIN");
    frame(2, &body, next_position)
}

pub fn xid_frame(xid: u64, next_position: u32) -> Vec<u8> {
    frame(16, &xid.to_le_bytes(), next_position)
}

pub fn rotate_frame(file: &str, position: u64, next_position: u32) -> Vec<u8> {
    let mut body = position.to_le_bytes().to_vec();
    body.extend_from_slice(file.as_bytes());
    frame(4, &body, next_position)
}

/// TABLE_MAP for a table with a single nullable INT column named `value`.
pub fn table_map_frame(table_map_id: u64, db: &str, table: &str, next_position: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_map_id.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.push(db.len() as u8);
    body.extend_from_slice(db.as_bytes());
    body.push(0);
    body.push(table.len() as u8);
    body.extend_from_slice(table.as_bytes());
    body.push(0);
    body.push(1); // column count
    body.push(ColumnType::Long as u8);
    body.push(0); // metadata block length
    body.push(0b1); // nullable bitmap
    frame(19, &body, next_position)
}

/// Matching schema for [`table_map_frame`].
pub fn int_schema(db: &str, table: &str) -> TableSchema {
    TableSchema {
        database: db.into(),
        table: table.into(),
        columns: vec![ColumnSchema {
            name: "value".into(),
            data_type: "int".into(),
            nullable: true,
            charset: None,
            unsigned: false,
            numeric_precision: Some(10),
            numeric_scale: Some(0),
            members: Vec::new(),
        }],
    }
}

pub fn write_rows_frame(table_map_id: u64, values: &[i32], next_position: u32) -> Vec<u8> {
    let mut body = rows_prefix(table_map_id);
    for value in values {
        body.push(0); // null bitmap
        body.extend_from_slice(&value.to_le_bytes());
    }
    frame(30, &body, next_position)
}

pub fn update_rows_frame(table_map_id: u64, before: i32, after: i32, next_position: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_map_id.to_le_bytes()[..6]);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.push(1);
    body.push(0b1); // before columns
    body.push(0b1); // after columns
    body.push(0);
    body.extend_from_slice(&before.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&after.to_le_bytes());
    frame(31, &body, next_position)
}

pub fn delete_rows_frame(table_map_id: u64, value: i32, next_position: u32) -> Vec<u8> {
    let mut body = rows_prefix(table_map_id);
    body.push(0);
    body.extend_from_slice(&value.to_le_bytes());
    frame(32, &body, next_position)
}

fn rows_prefix(table_map_id: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&table_map_id.to_le_bytes()[..6]);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes()); // v2 extra info, empty
    body.push(1); // column count
    body.push(0b1); // columns present
    body
}

/// Miniature replication session over in-memory frames.
pub struct Session {
    pub decoder: Decoder,
    pub dispatcher: Dispatcher,
    pub tracker: PositionTracker,
    schemas: HashMap<(String, String), TableSchema>,
    /// Every position publication, in order.
    pub published: Vec<BinlogPosition>,
    current_file: String,
    pending: Vec<RowChange>,
}

impl Session {
    pub fn new(start: BinlogPosition) -> Self {
        Self {
            decoder: Decoder::new(),
            dispatcher: Dispatcher::new(),
            tracker: PositionTracker::new(start.clone()),
            schemas: HashMap::new(),
            published: Vec::new(),
            current_file: start.file,
            pending: Vec::new(),
        }
    }

    pub fn add_schema(&mut self, schema: TableSchema) {
        self.schemas
            .insert((schema.database.clone(), schema.table.clone()), schema);
    }

    /// Drop in-transaction state, as the client does when a connection is
    /// torn down.
    pub fn disconnect(&mut self) {
        self.decoder.reset();
        self.pending.clear();
        self.tracker.reset_shadow();
    }

    pub fn apply(&mut self, raw: &[u8]) -> Result<()> {
        let (header, event) = self.decoder.decode(raw)?;

        let advances = !header.is_artificial()
            && header.next_position != 0
            && header.event_type != EventType::FormatDescription;
        if advances {
            self.tracker.note_event(header.next_position as u64);
        }

        match event {
            BinlogEvent::FormatDescription(_) => {
                self.published.push(self.tracker.commit());
            }
            BinlogEvent::Rotate { file, position } => {
                let p = self.tracker.rotate(file, position);
                self.current_file = p.file.clone();
                self.published.push(p);
            }
            BinlogEvent::TableMap(map) => {
                let schema = self
                    .schemas
                    .get(&(map.database.clone(), map.table.clone()))
                    .ok_or_else(|| {
                        Error::schema_drift(format!(
                            "no schema registered for {}.{}",
                            map.database, map.table
                        ))
                    })?;
                let descriptor = TableDescriptor::from_parts(&map, schema)?;
                self.decoder.install_table(descriptor);
            }
            BinlogEvent::Rows(rows) => {
                let descriptor = self
                    .decoder
                    .table(rows.table_map_id)
                    .expect("rows decoded without descriptor");
                let at_position =
                    BinlogPosition::new(self.current_file.clone(), header.next_position as u64);
                for pair in rows.rows {
                    self.pending.push(RowChange {
                        kind: rows.kind,
                        database: descriptor.database.clone(),
                        table: descriptor.table.clone(),
                        before: pair.before,
                        after: pair.after,
                        at_position: at_position.clone(),
                        is_transaction_boundary: false,
                    });
                }
            }
            BinlogEvent::Xid(_) => {
                if let Some(last) = self.pending.last_mut() {
                    last.is_transaction_boundary = true;
                }
                for change in self.pending.drain(..) {
                    self.dispatcher.dispatch(&change)?;
                }
                self.published.push(self.tracker.commit());
            }
            _ => {}
        }
        Ok(())
    }
}
