//! Row-change records delivered to subscribers.

use crate::position::BinlogPosition;
use crate::value::{ColumnType, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    Insert = 1,
    Update = 2,
    Delete = 4,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Insert => write!(f, "INSERT"),
            EventKind::Update => write!(f, "UPDATE"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Bitmask of event kinds used for subscriber filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventKindMask(u8);

impl EventKindMask {
    pub const NONE: Self = Self(0);
    pub const INSERT: Self = Self(EventKind::Insert as u8);
    pub const UPDATE: Self = Self(EventKind::Update as u8);
    pub const DELETE: Self = Self(EventKind::Delete as u8);
    pub const ALL: Self = Self(7);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind as u8 == kind as u8
    }
}

impl BitOr for EventKindMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<EventKind> for EventKindMask {
    fn from(kind: EventKind) -> Self {
        Self(kind as u8)
    }
}

/// One decoded cell of a row image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    pub column_type: ColumnType,
    pub value: Value,
}

/// A full row image: the decoded, named cells in table column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowImage {
    cells: Vec<Cell>,
}

impl RowImage {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.cells.iter().find(|c| c.name == name).map(|c| &c.value)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|c| c.name.as_str())
    }

    /// Whether both images cover the same columns, in the same order.
    pub fn same_columns(&self, other: &RowImage) -> bool {
        self.cells.len() == other.cells.len()
            && self
                .cells
                .iter()
                .zip(&other.cells)
                .all(|(a, b)| a.name == b.name)
    }
}

/// A single row mutation observed in the binlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: EventKind,
    pub database: String,
    pub table: String,
    /// Prior row state; present for UPDATE and DELETE.
    pub before: Option<RowImage>,
    /// New row state; present for INSERT and UPDATE.
    pub after: Option<RowImage>,
    /// Position of the event this change was decoded from.
    pub at_position: BinlogPosition,
    /// Set on the last change delivered before the position commit.
    pub is_transaction_boundary: bool,
}

impl RowChange {
    /// An UPDATE whose before and after images are identical. The primary
    /// may emit these; delivery is configurable at the dispatcher.
    pub fn is_unchanged_update(&self) -> bool {
        self.kind == EventKind::Update
            && match (&self.before, &self.after) {
                (Some(b), Some(a)) => b == a,
                _ => false,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(name: &str, v: i64) -> Cell {
        Cell {
            name: name.into(),
            column_type: ColumnType::Long,
            value: Value::Int(v),
        }
    }

    #[test]
    fn mask_contains() {
        assert!(EventKindMask::ALL.contains(EventKind::Insert));
        assert!(EventKindMask::ALL.contains(EventKind::Update));
        assert!(EventKindMask::ALL.contains(EventKind::Delete));

        assert!(!EventKindMask::NONE.contains(EventKind::Insert));
        assert!(!EventKindMask::NONE.contains(EventKind::Update));
        assert!(!EventKindMask::NONE.contains(EventKind::Delete));

        let mask = EventKindMask::INSERT | EventKindMask::DELETE;
        assert!(mask.contains(EventKind::Insert));
        assert!(!mask.contains(EventKind::Update));
        assert!(mask.contains(EventKind::Delete));
    }

    #[test]
    fn mask_from_bits_discards_garbage() {
        assert_eq!(EventKindMask::from_bits(0xFF), EventKindMask::ALL);
        assert_eq!(EventKindMask::from_bits(2), EventKindMask::UPDATE);
    }

    #[test]
    fn image_lookup() {
        let image = RowImage::new(vec![cell("id", 1), cell("value", 42)]);
        assert_eq!(image.get("value"), Some(&Value::Int(42)));
        assert_eq!(image.get("missing"), None);
        assert_eq!(image.len(), 2);
    }

    #[test]
    fn same_columns_checks_names_and_order() {
        let a = RowImage::new(vec![cell("id", 1), cell("value", 2)]);
        let b = RowImage::new(vec![cell("id", 9), cell("value", 8)]);
        let c = RowImage::new(vec![cell("value", 2), cell("id", 1)]);
        assert!(a.same_columns(&b));
        assert!(!a.same_columns(&c));
    }

    #[test]
    fn unchanged_update_detection() {
        let image = RowImage::new(vec![cell("id", 1)]);
        let change = RowChange {
            kind: EventKind::Update,
            database: "db".into(),
            table: "t".into(),
            before: Some(image.clone()),
            after: Some(image.clone()),
            at_position: BinlogPosition::new("mysql-bin.000001", 500),
            is_transaction_boundary: false,
        };
        assert!(change.is_unchanged_update());

        let changed = RowChange {
            after: Some(RowImage::new(vec![cell("id", 2)])),
            ..change.clone()
        };
        assert!(!changed.is_unchanged_update());

        let insert = RowChange {
            kind: EventKind::Insert,
            before: None,
            ..change
        };
        assert!(!insert.is_unchanged_update());
    }
}
