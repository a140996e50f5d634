//! Table metadata resolution against `information_schema`.
//!
//! Rows events carry column ordinals and packed bytes only; projecting them
//! into named, typed fields needs the column list of the table as the
//! primary sees it. The resolver queries `information_schema.COLUMNS` over a
//! regular client connection (the replication connection cannot read result
//! sets) and caches per-table results with LRU eviction.

use crate::client::MasterInfo;
use crate::decoder::ChecksumAlgorithm;
use crate::error::{Error, Result};
use crate::position::BinlogPosition;
use mysql_async::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const COLUMNS_QUERY: &str = "\
    SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, \
           CHARACTER_SET_NAME, NUMERIC_PRECISION, NUMERIC_SCALE \
    FROM information_schema.COLUMNS \
    WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
    ORDER BY ORDINAL_POSITION";

/// One column as described by `information_schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    /// Lowercased `DATA_TYPE` ("int", "varchar", "enum", ...).
    pub data_type: String,
    pub nullable: bool,
    pub charset: Option<String>,
    pub unsigned: bool,
    pub numeric_precision: Option<u8>,
    pub numeric_scale: Option<u8>,
    /// Declared members for ENUM and SET columns, in declaration order.
    pub members: Vec<String>,
}

/// Ordered column list for one `(database, table)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

/// Bounded LRU of resolved table schemas.
struct SchemaCache {
    entries: HashMap<(String, String), Arc<TableSchema>>,
    recency: VecDeque<(String, String)>,
    capacity: usize,
}

impl SchemaCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    fn touch(&mut self, key: &(String, String)) {
        if let Some(idx) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(idx);
        }
        self.recency.push_back(key.clone());
    }

    fn get(&mut self, key: &(String, String)) -> Option<Arc<TableSchema>> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.touch(key);
        }
        found
    }

    fn insert(&mut self, key: (String, String), schema: Arc<TableSchema>) {
        if self.entries.insert(key.clone(), schema).is_none() {
            self.recency.push_back(key);
        } else {
            self.touch(&key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!("evicted schema cache entry for {}.{}", oldest.0, oldest.1);
        }
    }

    fn remove(&mut self, key: &(String, String)) {
        if self.entries.remove(key).is_some() {
            if let Some(idx) = self.recency.iter().position(|k| k == key) {
                self.recency.remove(idx);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

/// Default cache capacity, in tables.
pub const DEFAULT_SCHEMA_CACHE_CAPACITY: usize = 1024;

/// Resolves and caches table schemas for the event decoder.
pub struct SchemaResolver {
    pool: mysql_async::Pool,
    cache: Mutex<SchemaCache>,
}

impl SchemaResolver {
    /// Build a resolver over a connection pool to the primary. No I/O until
    /// the first query.
    pub fn connect(master: &MasterInfo) -> Self {
        Self::with_capacity(master, DEFAULT_SCHEMA_CACHE_CAPACITY)
    }

    pub fn with_capacity(master: &MasterInfo, capacity: usize) -> Self {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(master.host.clone())
            .tcp_port(master.port)
            .user(Some(master.user.clone()))
            .pass(master.password.clone());
        Self {
            pool: mysql_async::Pool::new(opts),
            cache: Mutex::new(SchemaCache::new(capacity)),
        }
    }

    /// Verify the metadata connection works.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.ping().await?;
        Ok(())
    }

    /// Column list for `(db, table)`, cached.
    ///
    /// A connection failure is retriable and surfaces as [`Error::Schema`];
    /// a table absent from `information_schema` is schema drift and fatal.
    pub async fn describe(&self, db: &str, table: &str) -> Result<Arc<TableSchema>> {
        let key = (db.to_string(), table.to_string());
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return Ok(cached);
        }

        let mut conn = self.pool.get_conn().await?;
        type ColumnRow = (
            String,
            String,
            String,
            String,
            Option<String>,
            Option<u64>,
            Option<u64>,
        );
        let rows: Vec<ColumnRow> = conn.exec(COLUMNS_QUERY, (db, table)).await?;

        if rows.is_empty() {
            return Err(Error::schema_drift(format!(
                "table {db}.{table} not present in information_schema"
            )));
        }

        let columns = rows
            .into_iter()
            .map(
                |(name, data_type, column_type, is_nullable, charset, precision, scale)| {
                    let data_type = data_type.to_ascii_lowercase();
                    let members = if data_type == "enum" || data_type == "set" {
                        parse_members(&column_type)
                    } else {
                        Vec::new()
                    };
                    ColumnSchema {
                        name,
                        unsigned: column_type.to_ascii_lowercase().contains(" unsigned"),
                        data_type,
                        nullable: is_nullable.eq_ignore_ascii_case("yes"),
                        charset,
                        numeric_precision: precision.map(|p| p.min(65) as u8),
                        numeric_scale: scale.map(|s| s.min(30) as u8),
                        members,
                    }
                },
            )
            .collect();

        let schema = Arc::new(TableSchema {
            database: db.to_string(),
            table: table.to_string(),
            columns,
        });
        debug!(
            "resolved schema for {}.{} ({} columns)",
            db,
            table,
            schema.columns.len()
        );
        self.cache.lock().unwrap().insert(key, schema.clone());
        Ok(schema)
    }

    /// Drop one cached table, typically after observing DDL for it.
    pub fn invalidate(&self, db: &str, table: &str) {
        self.cache
            .lock()
            .unwrap()
            .remove(&(db.to_string(), table.to_string()));
    }

    /// Drop everything; used on rotate and reconnect.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// The primary's current write position. Used when neither the state
    /// sink nor the configuration provides a resume point.
    pub async fn current_master_position(&self) -> Result<BinlogPosition> {
        let mut conn = self.pool.get_conn().await?;

        // MySQL 8.2 renamed the statement; try the new name first.
        let row: Option<mysql_async::Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(_) => conn.query_first("SHOW MASTER STATUS").await?,
        };

        let Some(row) = row else {
            return Err(Error::config(
                "SHOW MASTER STATUS returned no rows; is binary logging enabled?",
            ));
        };
        let file: String = row.get(0).unwrap_or_default();
        let offset: u64 = row.get(1).unwrap_or(4);
        if file.is_empty() {
            return Err(Error::config(
                "SHOW MASTER STATUS returned an empty file name; is binary logging enabled?",
            ));
        }

        info!("primary is at {}:{}", file, offset);
        Ok(BinlogPosition::new(file, offset))
    }

    /// The checksum algorithm the primary writes into its binlog. Seeds
    /// the decoder for frames that arrive before the format description.
    pub async fn binlog_checksum(&self) -> Result<ChecksumAlgorithm> {
        let mut conn = self.pool.get_conn().await?;
        let value: Option<String> = conn.query_first("SELECT @@global.binlog_checksum").await?;
        match value.as_deref() {
            Some(v) if v.eq_ignore_ascii_case("crc32") => Ok(ChecksumAlgorithm::Crc32),
            _ => Ok(ChecksumAlgorithm::Off),
        }
    }

    /// Tear down the metadata pool.
    pub async fn close(&self) -> Result<()> {
        if let Err(e) = self.pool.clone().disconnect().await {
            warn!("metadata pool disconnect failed: {e}");
        }
        Ok(())
    }
}

/// Extract member literals from an `enum('a','b')` / `set('a','b')`
/// `COLUMN_TYPE`. Doubled quotes inside a literal are unescaped.
fn parse_members(column_type: &str) -> Vec<String> {
    let Some(open) = column_type.find('(') else {
        return Vec::new();
    };
    let Some(close) = column_type.rfind(')') else {
        return Vec::new();
    };

    let mut members = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;
    let mut chars = column_type[open + 1..close].chars().peekable();

    while let Some(c) = chars.next() {
        if !in_literal {
            if c == '\'' {
                in_literal = true;
                current.clear();
            }
            continue;
        }
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                current.push('\'');
            } else {
                in_literal = false;
                members.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }

    members
}
