//! Binlog event decoding.
//!
//! The decoder is a stateful parser over raw event frames: it tracks the
//! current format description (and with it the checksum algorithm), the
//! dictionary of open table maps, and whether a transaction is open. Rows
//! events are projected into typed row images through the installed
//! [`TableDescriptor`]s; a rows event whose table id has no descriptor is an
//! invariant violation, not a recoverable decode failure.

use crate::error::{Error, Result};
use crate::record::{Cell, EventKind, RowImage};
use crate::schema::TableSchema;
use crate::value::{unpack_value, ColumnType, Value};
use crate::wire;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Binlog event type codes this client reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Query,
    Rotate,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Heartbeat,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Other(u8),
}

impl EventType {
    pub fn from_u8(code: u8) -> Self {
        match code {
            2 => Self::Query,
            4 => Self::Rotate,
            15 => Self::FormatDescription,
            16 => Self::Xid,
            19 => Self::TableMap,
            23 => Self::WriteRowsV1,
            24 => Self::UpdateRowsV1,
            25 => Self::DeleteRowsV1,
            27 => Self::Heartbeat,
            30 => Self::WriteRowsV2,
            31 => Self::UpdateRowsV2,
            32 => Self::DeleteRowsV2,
            other => Self::Other(other),
        }
    }

    pub fn is_rows(self) -> bool {
        matches!(
            self,
            Self::WriteRowsV1
                | Self::UpdateRowsV1
                | Self::DeleteRowsV1
                | Self::WriteRowsV2
                | Self::UpdateRowsV2
                | Self::DeleteRowsV2
        )
    }

    fn is_rows_v2(self) -> bool {
        matches!(
            self,
            Self::WriteRowsV2 | Self::UpdateRowsV2 | Self::DeleteRowsV2
        )
    }

    fn row_kind(self) -> Option<EventKind> {
        match self {
            Self::WriteRowsV1 | Self::WriteRowsV2 => Some(EventKind::Insert),
            Self::UpdateRowsV1 | Self::UpdateRowsV2 => Some(EventKind::Update),
            Self::DeleteRowsV1 | Self::DeleteRowsV2 => Some(EventKind::Delete),
            _ => None,
        }
    }
}

/// Common v4 event header.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    /// Synthetic events (the rotate the server fabricates at dump start)
    /// carry this flag and a meaningless next-position.
    pub const FLAG_ARTIFICIAL: u16 = 0x20;

    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::SIZE {
            return Err(Error::decode(format!(
                "event frame too short: {} bytes",
                frame.len()
            )));
        }
        let mut cursor = Cursor::new(frame);
        Ok(Self {
            timestamp: wire::read_u32_le(&mut cursor)?,
            event_type: EventType::from_u8(wire::read_u8(&mut cursor)?),
            server_id: wire::read_u32_le(&mut cursor)?,
            event_length: wire::read_u32_le(&mut cursor)?,
            next_position: wire::read_u32_le(&mut cursor)?,
            flags: wire::read_u16_le(&mut cursor)?,
        })
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & Self::FLAG_ARTIFICIAL != 0
    }
}

/// Event checksum algorithm announced by the format description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    Off,
    Crc32,
}

impl ChecksumAlgorithm {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Off),
            1 => Ok(Self::Crc32),
            other => Err(Error::decode(format!(
                "unsupported binlog checksum algorithm {other}"
            ))),
        }
    }

    pub fn trailer_len(self) -> usize {
        match self {
            Self::Off => 0,
            Self::Crc32 => 4,
        }
    }
}

/// FORMAT_DESCRIPTION event payload.
#[derive(Debug, Clone)]
pub struct FormatDescription {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub common_header_len: u8,
    pub post_header_lengths: Vec<u8>,
    pub checksum: ChecksumAlgorithm,
}

/// QUERY event payload (statement text plus default schema).
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub sql: String,
}

static DDL_RE: OnceLock<regex::Regex> = OnceLock::new();

impl QueryEvent {
    /// Whether this statement opens a transaction.
    pub fn is_begin(&self) -> bool {
        self.sql.trim_start().get(..5).is_some_and(|s| s.eq_ignore_ascii_case("BEGIN"))
    }

    /// Whether this statement changes table structure.
    pub fn is_ddl(&self) -> bool {
        let head = self.sql.trim_start();
        ["ALTER", "CREATE", "DROP", "RENAME", "TRUNCATE"]
            .iter()
            .any(|kw| {
                head.len() >= kw.len() && head[..kw.len()].eq_ignore_ascii_case(kw)
            })
    }

    /// `(database, table)` affected by a DDL statement. The database falls
    /// back to the event's default schema when the statement does not
    /// qualify the name. `None` when the statement defeats parsing, in
    /// which case the whole schema cache should be dropped.
    pub fn ddl_table(&self) -> Option<(String, String)> {
        // DROP and RENAME may name several tables; a single-target parse
        // would leave the rest stale.
        let head = self.sql.trim_start();
        let multi_capable = head.get(..4).is_some_and(|s| s.eq_ignore_ascii_case("DROP"))
            || head.get(..6).is_some_and(|s| s.eq_ignore_ascii_case("RENAME"));
        if multi_capable && self.sql.contains(',') {
            return None;
        }

        let re = DDL_RE.get_or_init(|| {
            regex::Regex::new(
                r"(?i)^\s*(?:ALTER|CREATE|DROP|RENAME|TRUNCATE)\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?`?([A-Za-z0-9_$]+)`?(?:\s*\.\s*`?([A-Za-z0-9_$]+)`?)?",
            )
            .expect("static regex")
        });
        let captures = re.captures(&self.sql)?;
        let first = captures.get(1)?.as_str().to_string();
        match captures.get(2) {
            Some(table) => Some((first, table.as_str().to_string())),
            None if self.schema.is_empty() => None,
            None => Some((self.schema.clone(), first)),
        }
    }
}

/// TABLE_MAP event payload, as parsed off the wire.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_map_id: u64,
    pub flags: u16,
    pub database: String,
    pub table: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

/// One column of an installed table descriptor: wire typing merged with the
/// resolved schema.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub metadata: u16,
    pub nullable: bool,
    pub unsigned: bool,
    pub charset: Option<String>,
    pub decimal_precision: u8,
    pub decimal_scale: u8,
    /// ENUM or SET members, declaration order.
    pub members: Vec<String>,
}

/// Typed description of a table referenced by rows events.
///
/// Keyed by the transient table map id the primary assigned; installed by a
/// TABLE_MAP event and dropped on rotate or reconnect.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub table_map_id: u64,
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Merge a wire table map with the resolved schema. The column counts
    /// must agree exactly; disagreement means the schema changed under us.
    pub fn from_parts(map: &TableMapEvent, schema: &TableSchema) -> Result<Self> {
        if map.column_count != schema.columns.len() {
            return Err(Error::schema_drift(format!(
                "{}.{}: table map has {} columns, information_schema has {}",
                map.database,
                map.table,
                map.column_count,
                schema.columns.len()
            )));
        }

        let columns = map
            .column_types
            .iter()
            .zip(&map.column_metadata)
            .zip(&schema.columns)
            .map(|((&column_type, &metadata), col)| ColumnDescriptor {
                name: col.name.clone(),
                column_type,
                metadata,
                nullable: col.nullable,
                unsigned: col.unsigned,
                charset: col.charset.clone(),
                decimal_precision: match column_type {
                    ColumnType::NewDecimal => (metadata >> 8) as u8,
                    _ => col.numeric_precision.unwrap_or(0),
                },
                decimal_scale: match column_type {
                    ColumnType::NewDecimal => (metadata & 0xFF) as u8,
                    _ => col.numeric_scale.unwrap_or(0),
                },
                members: col.members.clone(),
            })
            .collect();

        Ok(Self {
            table_map_id: map.table_map_id,
            database: map.database.clone(),
            table: map.table.clone(),
            columns,
        })
    }
}

/// One decoded row of a rows event.
#[derive(Debug, Clone)]
pub struct RowPair {
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

/// Decoded rows event.
#[derive(Debug, Clone)]
pub struct RowsEventData {
    pub kind: EventKind,
    pub table_map_id: u64,
    pub rows: Vec<RowPair>,
}

/// A decoded binlog event.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription(FormatDescription),
    Rotate { file: String, position: u64 },
    Query(QueryEvent),
    Xid(u64),
    TableMap(TableMapEvent),
    Rows(RowsEventData),
    Heartbeat,
    /// Recognized frame, intentionally not processed.
    Skipped(u8),
}

/// Stateful binlog event decoder.
#[derive(Debug, Default)]
pub struct Decoder {
    format: Option<FormatDescription>,
    /// Checksum assumption before the first FORMAT_DESCRIPTION arrives,
    /// seeded from `@@global.binlog_checksum`.
    assumed_checksum: ChecksumAlgorithm,
    tables: HashMap<u64, TableDescriptor>,
    in_transaction: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the checksum algorithm for frames that precede the format
    /// description (the server's initial rotate event).
    pub fn set_assumed_checksum(&mut self, checksum: ChecksumAlgorithm) {
        self.assumed_checksum = checksum;
    }

    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.format
            .as_ref()
            .map(|f| f.checksum)
            .unwrap_or(self.assumed_checksum)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn table(&self, table_map_id: u64) -> Option<&TableDescriptor> {
        self.tables.get(&table_map_id)
    }

    /// Install a merged table descriptor for subsequent rows events.
    pub fn install_table(&mut self, descriptor: TableDescriptor) {
        self.tables.insert(descriptor.table_map_id, descriptor);
    }

    /// Drop all transient state: open table maps, transaction flag, format.
    /// Used when the connection is torn down.
    pub fn reset(&mut self) {
        self.tables.clear();
        self.in_transaction = false;
        self.format = None;
    }

    /// Decode one event frame (header, body, optional checksum trailer).
    pub fn decode(&mut self, frame: &[u8]) -> Result<(EventHeader, BinlogEvent)> {
        let header = EventHeader::parse(frame)?;
        if header.event_length as usize != frame.len() {
            return Err(Error::decode(format!(
                "event length {} does not match frame size {}",
                header.event_length,
                frame.len()
            )));
        }

        // The format description carries its own checksum algorithm and is
        // validated during parsing; everything else uses the current one.
        let body = if header.event_type == EventType::FormatDescription {
            &frame[EventHeader::SIZE..]
        } else {
            let trailer = self.checksum().trailer_len();
            if trailer > 0 {
                verify_crc32(frame)?;
            }
            if frame.len() < EventHeader::SIZE + trailer {
                return Err(Error::decode("event frame shorter than its trailer"));
            }
            &frame[EventHeader::SIZE..frame.len() - trailer]
        };

        trace!(
            event_type = ?header.event_type,
            next_position = header.next_position,
            len = frame.len(),
            "decoding event"
        );

        let event = match header.event_type {
            EventType::FormatDescription => {
                let fd = parse_format_description(frame)?;
                debug!(
                    version = fd.binlog_version,
                    server = %fd.server_version,
                    checksum = ?fd.checksum,
                    "format description"
                );
                self.format = Some(fd.clone());
                BinlogEvent::FormatDescription(fd)
            }
            EventType::Rotate => {
                let event = parse_rotate(body)?;
                // A rotate invalidates every open table map id.
                self.tables.clear();
                event
            }
            EventType::Query => {
                let query = parse_query(body)?;
                if query.is_begin() {
                    self.in_transaction = true;
                }
                BinlogEvent::Query(query)
            }
            EventType::Xid => {
                let mut cursor = Cursor::new(body);
                let xid = wire::read_u64_le(&mut cursor)?;
                self.in_transaction = false;
                BinlogEvent::Xid(xid)
            }
            EventType::TableMap => BinlogEvent::TableMap(parse_table_map(body)?),
            ty if ty.is_rows() => BinlogEvent::Rows(self.parse_rows(ty, body)?),
            EventType::Heartbeat => BinlogEvent::Heartbeat,
            EventType::Other(code) => {
                debug!(code, "skipping unhandled event type");
                BinlogEvent::Skipped(code)
            }
            // Covered above; the match on `ty.is_rows()` confuses exhaustiveness.
            _ => BinlogEvent::Skipped(0),
        };

        Ok((header, event))
    }

    fn parse_rows(&mut self, event_type: EventType, body: &[u8]) -> Result<RowsEventData> {
        let kind = event_type
            .row_kind()
            .ok_or_else(|| Error::invariant("rows parser invoked for non-rows event"))?;

        let mut cursor = Cursor::new(body);
        let table_map_id = wire::read_u48_le(&mut cursor)?;
        let _flags = wire::read_u16_le(&mut cursor)?;

        if event_type.is_rows_v2() {
            let extra_len = wire::read_u16_le(&mut cursor)? as usize;
            if extra_len > 2 {
                wire::skip(&mut cursor, extra_len - 2)?;
            }
        }

        let descriptor = self.tables.get(&table_map_id).ok_or_else(|| {
            Error::invariant(format!(
                "rows event references table map id {table_map_id} with no prior TABLE_MAP"
            ))
        })?;

        let column_count = wire::read_lenenc_count(&mut cursor)? as usize;
        if column_count != descriptor.columns.len() {
            return Err(Error::schema_drift(format!(
                "{}.{}: rows event has {} columns, table map has {}",
                descriptor.database,
                descriptor.table,
                column_count,
                descriptor.columns.len()
            )));
        }

        let bitmap_len = column_count.div_ceil(8);
        let present_before = wire::read_fixed_bytes(&mut cursor, bitmap_len)?;
        let present_after = if kind == EventKind::Update {
            Some(wire::read_fixed_bytes(&mut cursor, bitmap_len)?)
        } else {
            None
        };

        let mut rows = Vec::new();
        while (cursor.position() as usize) < body.len() {
            let row = match kind {
                EventKind::Insert => RowPair {
                    before: None,
                    after: Some(decode_image(&mut cursor, descriptor, &present_before)?),
                },
                EventKind::Delete => RowPair {
                    before: Some(decode_image(&mut cursor, descriptor, &present_before)?),
                    after: None,
                },
                EventKind::Update => {
                    let before = decode_image(&mut cursor, descriptor, &present_before)?;
                    let after_bitmap = present_after.as_deref().unwrap_or(&present_before);
                    let after = decode_image(&mut cursor, descriptor, after_bitmap)?;
                    RowPair {
                        before: Some(before),
                        after: Some(after),
                    }
                }
            };
            rows.push(row);
        }

        Ok(RowsEventData {
            kind,
            table_map_id,
            rows,
        })
    }
}

fn bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
}

fn count_present(bitmap: &[u8], columns: usize) -> usize {
    (0..columns).filter(|&i| bit_set(bitmap, i)).count()
}

/// Decode one row image: a null bitmap over the present columns, then the
/// packed values of every present, non-NULL column in column order.
fn decode_image(
    cursor: &mut Cursor<&[u8]>,
    descriptor: &TableDescriptor,
    present: &[u8],
) -> Result<RowImage> {
    let present_count = count_present(present, descriptor.columns.len());
    let null_bitmap = wire::read_fixed_bytes(cursor, present_count.div_ceil(8))?;

    let mut cells = Vec::with_capacity(present_count);
    let mut null_idx = 0usize;

    for (idx, col) in descriptor.columns.iter().enumerate() {
        if !bit_set(present, idx) {
            continue;
        }
        let value = if bit_set(&null_bitmap, null_idx) {
            if !col.nullable {
                return Err(Error::invariant(format!(
                    "{}.{}: NULL bit set for NOT NULL column {}",
                    descriptor.database, descriptor.table, col.name
                )));
            }
            Value::Null
        } else {
            unpack_value(cursor, col)?
        };
        cells.push(Cell {
            name: col.name.clone(),
            column_type: col.column_type,
            value,
        });
        null_idx += 1;
    }

    Ok(RowImage::new(cells))
}

fn verify_crc32(frame: &[u8]) -> Result<()> {
    if frame.len() < EventHeader::SIZE + 4 {
        return Err(Error::decode("event frame too short for checksum trailer"));
    }
    let (payload, trailer) = frame.split_at(frame.len() - 4);
    let expected = u32::from_le_bytes(trailer.try_into().expect("4-byte slice"));
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(Error::decode(format!(
            "event checksum mismatch: stored {expected:#010X}, computed {actual:#010X}"
        )));
    }
    Ok(())
}

const SERVER_VERSION_LEN: usize = 50;

/// Parse a FORMAT_DESCRIPTION event from the full frame (the trailer length
/// depends on the algorithm the event itself announces).
fn parse_format_description(frame: &[u8]) -> Result<FormatDescription> {
    let body = &frame[EventHeader::SIZE..];
    let mut cursor = Cursor::new(body);

    let binlog_version = wire::read_u16_le(&mut cursor)?;
    if binlog_version != 4 {
        return Err(Error::decode(format!(
            "unsupported binlog format version {binlog_version}"
        )));
    }

    let version_bytes = wire::read_fixed_bytes(&mut cursor, SERVER_VERSION_LEN)?;
    let server_version = String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string();
    let create_timestamp = wire::read_u32_le(&mut cursor)?;
    let common_header_len = wire::read_u8(&mut cursor)?;

    // The tail is the per-type post-header length table, then one checksum
    // algorithm byte and the event's own 4-byte checksum.
    let consumed = cursor.position() as usize;
    if body.len() < consumed + 5 {
        return Err(Error::decode("format description event truncated"));
    }
    let post_header_lengths = body[consumed..body.len() - 5].to_vec();
    let checksum = ChecksumAlgorithm::from_u8(body[body.len() - 5])?;

    if checksum == ChecksumAlgorithm::Crc32 {
        verify_crc32(frame)?;
    }

    Ok(FormatDescription {
        binlog_version,
        server_version,
        create_timestamp,
        common_header_len,
        post_header_lengths,
        checksum,
    })
}

fn parse_rotate(body: &[u8]) -> Result<BinlogEvent> {
    let mut cursor = Cursor::new(body);
    let position = wire::read_u64_le(&mut cursor)?;
    let file_bytes = wire::read_fixed_bytes(&mut cursor, body.len() - 8)?;
    let file = String::from_utf8_lossy(&file_bytes)
        .trim_end_matches('\0')
        .to_string();
    Ok(BinlogEvent::Rotate { file, position })
}

fn parse_query(body: &[u8]) -> Result<QueryEvent> {
    let mut cursor = Cursor::new(body);
    let thread_id = wire::read_u32_le(&mut cursor)?;
    let exec_time = wire::read_u32_le(&mut cursor)?;
    let schema_len = wire::read_u8(&mut cursor)? as usize;
    let error_code = wire::read_u16_le(&mut cursor)?;
    let status_len = wire::read_u16_le(&mut cursor)? as usize;
    wire::skip(&mut cursor, status_len)?;

    let schema_bytes = wire::read_fixed_bytes(&mut cursor, schema_len)?;
    let schema = String::from_utf8_lossy(&schema_bytes).to_string();
    wire::skip(&mut cursor, 1)?; // NUL after the schema name

    let sql_len = body.len() - cursor.position() as usize;
    let sql_bytes = wire::read_fixed_bytes(&mut cursor, sql_len)?;
    let sql = String::from_utf8_lossy(&sql_bytes).to_string();

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        sql,
    })
}

fn parse_table_map(body: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(body);

    let table_map_id = wire::read_u48_le(&mut cursor)?;
    let flags = wire::read_u16_le(&mut cursor)?;

    let db_len = wire::read_u8(&mut cursor)? as usize;
    let db_bytes = wire::read_fixed_bytes(&mut cursor, db_len)?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();
    wire::skip(&mut cursor, 1)?;

    let table_len = wire::read_u8(&mut cursor)? as usize;
    let table_bytes = wire::read_fixed_bytes(&mut cursor, table_len)?;
    let table = String::from_utf8_lossy(&table_bytes).to_string();
    wire::skip(&mut cursor, 1)?;

    let column_count = wire::read_lenenc_count(&mut cursor)? as usize;
    let type_bytes = wire::read_fixed_bytes(&mut cursor, column_count)?;
    let mut column_types = Vec::with_capacity(column_count);
    for raw in &type_bytes {
        let ty = ColumnType::from_u8(*raw).ok_or_else(|| {
            Error::schema_drift(format!(
                "{database}.{table}: unsupported column type code {raw}"
            ))
        })?;
        column_types.push(ty);
    }

    let metadata_len = wire::read_lenenc_count(&mut cursor)? as usize;
    let metadata_start = cursor.position() as usize;
    let column_metadata = read_column_metadata(&mut cursor, &column_types)?;
    let consumed = cursor.position() as usize - metadata_start;
    if consumed != metadata_len {
        return Err(Error::decode(format!(
            "{database}.{table}: column metadata declared {metadata_len} bytes, consumed {consumed}"
        )));
    }

    let null_bitmap = wire::read_fixed_bytes(&mut cursor, column_count.div_ceil(8))?;

    Ok(TableMapEvent {
        table_map_id,
        flags,
        database,
        table,
        column_count,
        column_types,
        column_metadata,
        null_bitmap,
    })
}

/// Per-type metadata widths within a table map event.
fn read_column_metadata(
    cursor: &mut Cursor<&[u8]>,
    column_types: &[ColumnType],
) -> Result<Vec<u16>> {
    let mut metadata = Vec::with_capacity(column_types.len());
    for ty in column_types {
        let meta = match ty {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry => wire::read_u8(cursor)? as u16,
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                wire::read_u16_le(cursor)?
            }
            ColumnType::NewDecimal => {
                let precision = wire::read_u8(cursor)? as u16;
                let scale = wire::read_u8(cursor)? as u16;
                (precision << 8) | scale
            }
            // Real type byte first, then pack length / capacity.
            ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                let b0 = wire::read_u8(cursor)? as u16;
                let b1 = wire::read_u8(cursor)? as u16;
                (b0 << 8) | b1
            }
            ColumnType::Timestamp2 | ColumnType::DateTime2 | ColumnType::Time2 => {
                wire::read_u8(cursor)? as u16
            }
            _ => 0,
        };
        metadata.push(meta);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    pub(crate) fn make_frame(event_type: u8, body: &[u8], next_position: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity(EventHeader::SIZE + body.len());
        frame.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        frame.push(event_type);
        frame.extend_from_slice(&1u32.to_le_bytes()); // server id
        frame.extend_from_slice(&((EventHeader::SIZE + body.len()) as u32).to_le_bytes());
        frame.extend_from_slice(&next_position.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    fn fd_frame(checksum: ChecksumAlgorithm) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; SERVER_VERSION_LEN];
        version[..6].copy_from_slice(b"8.0.36");
        body.extend_from_slice(&version);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(EventHeader::SIZE as u8);
        body.extend_from_slice(&[0u8; 40]); // post-header length table
        body.push(match checksum {
            ChecksumAlgorithm::Off => 0,
            ChecksumAlgorithm::Crc32 => 1,
        });
        body.extend_from_slice(&[0u8; 4]); // checksum placeholder

        let mut frame = make_frame(15, &body, 120);
        if checksum == ChecksumAlgorithm::Crc32 {
            let len = frame.len();
            let crc = crc32fast::hash(&frame[..len - 4]);
            frame[len - 4..].copy_from_slice(&crc.to_le_bytes());
        }
        frame
    }

    fn int_column(name: &str, nullable: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            data_type: "int".into(),
            nullable,
            charset: None,
            unsigned: false,
            numeric_precision: Some(10),
            numeric_scale: Some(0),
            members: Vec::new(),
        }
    }

    fn table_map_frame(table_map_id: u64, db: &str, table: &str, nullable_first: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&table_map_id.to_le_bytes()[..6]);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(db.len() as u8);
        body.extend_from_slice(db.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);
        body.push(2); // column count
        body.extend_from_slice(&[ColumnType::Long as u8, ColumnType::Long as u8]);
        body.push(0); // metadata block length (LONG has none)
        body.push(if nullable_first { 0b01 } else { 0b00 });
        make_frame(19, &body, 240)
    }

    fn write_rows_frame(table_map_id: u64, values: &[(Option<i32>, i32)]) -> Vec<u8> {
        // Two LONG columns; first may be NULL.
        let mut body = Vec::new();
        body.extend_from_slice(&table_map_id.to_le_bytes()[..6]);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes()); // v2 extra-info: just its own length
        body.push(2); // column count
        body.push(0b11); // both columns present
        for (a, b) in values {
            body.push(if a.is_none() { 0b01 } else { 0 });
            if let Some(a) = a {
                body.extend_from_slice(&a.to_le_bytes());
            }
            body.extend_from_slice(&b.to_le_bytes());
        }
        make_frame(30, &body, 360)
    }

    fn with_trailer_for(decoder: &Decoder, mut frame: Vec<u8>) -> Vec<u8> {
        if decoder.checksum() == ChecksumAlgorithm::Crc32 {
            let new_len = (frame.len() as u32) + 4;
            frame[9..13].copy_from_slice(&new_len.to_le_bytes());
            frame.extend_from_slice(&[0u8; 4]);
            let len = frame.len();
            let crc = crc32fast::hash(&frame[..len - 4]);
            frame[len - 4..].copy_from_slice(&crc.to_le_bytes());
        }
        frame
    }

    fn install_test_table(decoder: &mut Decoder, table_map_id: u64, nullable_first: bool) {
        let frame = with_trailer_for(
            decoder,
            table_map_frame(table_map_id, "test", "t", nullable_first),
        );
        let (_, event) = decoder.decode(&frame).unwrap();
        let BinlogEvent::TableMap(map) = event else {
            panic!("expected table map");
        };
        let schema = TableSchema {
            database: "test".into(),
            table: "t".into(),
            columns: vec![int_column("id", nullable_first), int_column("value", false)],
        };
        let descriptor = TableDescriptor::from_parts(&map, &schema).unwrap();
        decoder.install_table(descriptor);
    }

    #[test]
    fn format_description_sets_checksum() {
        let mut decoder = Decoder::new();
        let (header, event) = decoder.decode(&fd_frame(ChecksumAlgorithm::Crc32)).unwrap();
        assert_eq!(header.event_type, EventType::FormatDescription);
        let BinlogEvent::FormatDescription(fd) = event else {
            panic!("expected format description");
        };
        assert_eq!(fd.binlog_version, 4);
        assert_eq!(fd.server_version, "8.0.36");
        assert_eq!(fd.checksum, ChecksumAlgorithm::Crc32);
        assert_eq!(decoder.checksum(), ChecksumAlgorithm::Crc32);
    }

    #[test]
    fn checksum_mismatch_is_a_decode_error() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Crc32)).unwrap();

        let mut body = 42u64.to_le_bytes().to_vec();
        body.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // bogus trailer
        let frame = make_frame(16, &body, 500);
        match decoder.decode(&frame) {
            Err(Error::Decode(msg)) => assert!(msg.contains("checksum"), "{msg}"),
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[test]
    fn xid_with_valid_checksum() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Crc32)).unwrap();

        let mut frame = make_frame(16, &[0u8; 12], 500);
        let len = frame.len();
        frame[len - 12..len - 4].copy_from_slice(&77u64.to_le_bytes());
        let crc = crc32fast::hash(&frame[..len - 4]);
        frame[len - 4..].copy_from_slice(&crc.to_le_bytes());

        let (_, event) = decoder.decode(&frame).unwrap();
        assert!(matches!(event, BinlogEvent::Xid(77)));
    }

    #[test]
    fn rows_without_table_map_is_invariant_violation() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        let frame = write_rows_frame(99, &[(Some(1), 2)]);
        assert!(matches!(decoder.decode(&frame), Err(Error::Invariant(_))));
    }

    #[test]
    fn write_rows_decodes_cells() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        install_test_table(&mut decoder, 7, true);

        let frame = write_rows_frame(7, &[(Some(1), 12321), (None, 5)]);
        let (_, event) = decoder.decode(&frame).unwrap();
        let BinlogEvent::Rows(rows) = event else {
            panic!("expected rows");
        };
        assert_eq!(rows.kind, EventKind::Insert);
        assert_eq!(rows.rows.len(), 2);

        let first = rows.rows[0].after.as_ref().unwrap();
        assert_eq!(first.get("id"), Some(&Value::Int(1)));
        assert_eq!(first.get("value"), Some(&Value::Int(12321)));

        let second = rows.rows[1].after.as_ref().unwrap();
        assert_eq!(second.get("id"), Some(&Value::Null));
        assert_eq!(second.get("value"), Some(&Value::Int(5)));
        assert!(rows.rows[1].before.is_none());
    }

    #[test]
    fn null_bit_on_not_null_column_is_fatal() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        install_test_table(&mut decoder, 7, false); // both columns NOT NULL

        let frame = write_rows_frame(7, &[(None, 5)]);
        match decoder.decode(&frame) {
            Err(Error::Invariant(msg)) => assert!(msg.contains("NOT NULL"), "{msg}"),
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[test]
    fn update_rows_carry_both_images() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        install_test_table(&mut decoder, 7, true);

        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_le_bytes()[..6]);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.push(2);
        body.push(0b11); // before image columns
        body.push(0b11); // after image columns
        // before: (1, 10)
        body.push(0);
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&10i32.to_le_bytes());
        // after: (1, 20)
        body.push(0);
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&20i32.to_le_bytes());
        let frame = make_frame(31, &body, 480);

        let (_, event) = decoder.decode(&frame).unwrap();
        let BinlogEvent::Rows(rows) = event else {
            panic!("expected rows");
        };
        assert_eq!(rows.kind, EventKind::Update);
        let row = &rows.rows[0];
        assert_eq!(
            row.before.as_ref().unwrap().get("value"),
            Some(&Value::Int(10))
        );
        assert_eq!(
            row.after.as_ref().unwrap().get("value"),
            Some(&Value::Int(20))
        );
        assert!(row.before.as_ref().unwrap().same_columns(row.after.as_ref().unwrap()));
    }

    #[test]
    fn column_count_mismatch_is_schema_drift() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        let frame = table_map_frame(9, "test", "t", true);
        let (_, event) = decoder.decode(&frame).unwrap();
        let BinlogEvent::TableMap(map) = event else {
            panic!("expected table map");
        };
        let schema = TableSchema {
            database: "test".into(),
            table: "t".into(),
            columns: vec![int_column("only_one", true)],
        };
        assert!(matches!(
            TableDescriptor::from_parts(&map, &schema),
            Err(Error::SchemaDrift(_))
        ));
    }

    #[test]
    fn rotate_clears_table_maps() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        install_test_table(&mut decoder, 7, true);
        assert!(decoder.table(7).is_some());

        let mut body = 4u64.to_le_bytes().to_vec();
        body.extend_from_slice(b"mysql-bin.000002");
        let (_, event) = decoder.decode(&make_frame(4, &body, 0)).unwrap();
        match event {
            BinlogEvent::Rotate { file, position } => {
                assert_eq!(file, "mysql-bin.000002");
                assert_eq!(position, 4);
            }
            other => panic!("expected rotate, got {other:?}"),
        }
        assert!(decoder.table(7).is_none());
    }

    #[test]
    fn query_begin_toggles_transaction_state() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(4); // schema length
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // no status vars
        body.extend_from_slice(b"test");
        body.push(0);
        body.extend_from_slice(b"BEGIN");
        let (_, event) = decoder.decode(&make_frame(2, &body, 600)).unwrap();

        let BinlogEvent::Query(query) = event else {
            panic!("expected query");
        };
        assert!(query.is_begin());
        assert!(decoder.in_transaction());

        let mut xid_body = 9u64.to_le_bytes().to_vec();
        xid_body.extend_from_slice(&[]);
        decoder.decode(&make_frame(16, &xid_body, 700)).unwrap();
        assert!(!decoder.in_transaction());
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        let frame = make_frame(33, &[1, 2, 3], 800); // GTID event, unhandled
        let (_, event) = decoder.decode(&frame).unwrap();
        assert!(matches!(event, BinlogEvent::Skipped(33)));
    }

    #[test]
    fn truncated_table_map_is_a_decode_error() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Off)).unwrap();
        let full = table_map_frame(7, "test", "t", true);
        let mut truncated = full[..full.len() - 3].to_vec();
        // Fix up the header length so only the body is short.
        let len = truncated.len() as u32;
        truncated[9..13].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(decoder.decode(&truncated), Err(Error::Decode(_))));
    }

    #[test]
    fn ddl_classification() {
        let query = |sql: &str, schema: &str| QueryEvent {
            thread_id: 1,
            exec_time: 0,
            error_code: 0,
            schema: schema.into(),
            sql: sql.into(),
        };

        assert!(query("BEGIN", "test").is_begin());
        assert!(query("  begin", "test").is_begin());
        assert!(!query("INSERT INTO t VALUES (1)", "test").is_begin());

        assert!(query("ALTER TABLE t ADD COLUMN c INT", "test").is_ddl());
        assert!(query("truncate table t", "test").is_ddl());
        assert!(!query("INSERT INTO t VALUES (1)", "test").is_ddl());

        assert_eq!(
            query("ALTER TABLE t ADD c INT", "test").ddl_table(),
            Some(("test".into(), "t".into()))
        );
        assert_eq!(
            query("DROP TABLE `other`.`t2`", "test").ddl_table(),
            Some(("other".into(), "t2".into()))
        );
        assert_eq!(
            query("CREATE TABLE IF NOT EXISTS t3 (x INT)", "test").ddl_table(),
            Some(("test".into(), "t3".into()))
        );
        // Unparseable target: caller clears the whole cache.
        assert_eq!(query("RENAME TABLE a TO b, c TO d", "").ddl_table(), None);
    }

    #[test]
    fn decoder_reset_clears_everything() {
        let mut decoder = Decoder::new();
        decoder.decode(&fd_frame(ChecksumAlgorithm::Crc32)).unwrap();
        install_test_table(&mut decoder, 7, true);

        decoder.reset();
        assert!(decoder.table(7).is_none());
        assert!(!decoder.in_transaction());
        assert_eq!(decoder.checksum(), ChecksumAlgorithm::Off);
    }
}
