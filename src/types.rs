//! Data structures for WAL replication traffic
//!
//! This module contains the core data types flowing through the endpoint:
//! - Table identity (`TableName`)
//! - Individual value writes (`Cell`) and their grouping into WAL entries
//! - The zero-copy row-key view used to group cells without copying buffers
//!
//! Cell buffers are host-owned `Bytes`; the endpoint never mutates them and
//! only copies a row key when it has to outlive the batch being processed.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{EndpointError, EndpointResult};

/// Fully qualified table identity
///
/// The canonical string form is `<namespace>:<qualifier>`; a table in the
/// default namespace renders as the bare qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub namespace: String,
    pub qualifier: String,
}

impl TableName {
    pub fn new<N: Into<String>, Q: Into<String>>(namespace: N, qualifier: Q) -> Self {
        Self {
            namespace: namespace.into(),
            qualifier: qualifier.into(),
        }
    }

    /// Parse `"ns:qual"`; a string without a colon lands in the default
    /// (empty) namespace.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((ns, qual)) => Self::new(ns, qual),
            None => Self::new("", raw),
        }
    }

    /// Canonical `<namespace>:<qualifier>` form, or the bare qualifier for
    /// the default namespace.
    pub fn canonical(&self) -> String {
        if self.namespace.is_empty() {
            self.qualifier.clone()
        } else {
            format!("{}:{}", self.namespace, self.qualifier)
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A single value write carried by the WAL
///
/// Cells are host-supplied and read-only for the endpoint. A tombstone cell
/// represents a logical delete and carries no value payload.
#[derive(Debug, Clone)]
pub struct Cell {
    row: Bytes,
    family: Bytes,
    qualifier: Bytes,
    value: Bytes,
    timestamp: i64,
    tombstone: bool,
}

impl Cell {
    /// A regular value write.
    pub fn put(
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            timestamp,
            tombstone: false,
        }
    }

    /// A delete marker for one column.
    pub fn tombstone(
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: Bytes::new(),
            timestamp,
            tombstone: true,
        }
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn family(&self) -> &[u8] {
        &self.family
    }

    pub fn qualifier(&self) -> &[u8] {
        &self.qualifier
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }
}

/// One unit of replication traffic: the cells of one table committed together
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub table: TableName,
    pub sequence_id: Option<i64>,
    pub write_time: Option<i64>,
    pub cells: Vec<Cell>,
}

impl WalEntry {
    pub fn new(table: TableName, cells: Vec<Cell>) -> Self {
        Self {
            table,
            sequence_id: None,
            write_time: None,
            cells,
        }
    }

    pub fn with_sequence_id(mut self, sequence_id: i64) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    pub fn with_write_time(mut self, write_time: i64) -> Self {
        self.write_time = Some(write_time);
        self
    }
}

/// A batch of WAL entries handed over by the host in one `replicate` call
#[derive(Debug, Clone, Default)]
pub struct WalBatch {
    pub entries: Vec<WalEntry>,
}

impl WalBatch {
    pub fn new(entries: Vec<WalEntry>) -> Self {
        Self { entries }
    }
}

/// Zero-copy view over row-key bytes with a cached content hash
///
/// The view borrows a byte range owned by the host batch, so it is only valid
/// for the scope of one batch. Use [`RowKeyView::to_bytes`] to materialize a
/// copy when a key must outlive the batch.
#[derive(Clone, Copy)]
pub struct RowKeyView<'a> {
    bytes: &'a [u8],
    hash: u64,
}

impl<'a> RowKeyView<'a> {
    /// View over `backing[offset..offset + length]`.
    pub fn of(backing: &'a [u8], offset: usize, length: usize) -> EndpointResult<Self> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| EndpointError::out_of_bounds(offset, length, backing.len()))?;
        if end > backing.len() {
            return Err(EndpointError::out_of_bounds(offset, length, backing.len()));
        }
        Ok(Self::from_slice(&backing[offset..end]))
    }

    /// View over a whole buffer.
    pub fn whole(backing: &'a [u8]) -> Self {
        Self::from_slice(backing)
    }

    /// The zero-length view.
    pub fn empty() -> RowKeyView<'static> {
        RowKeyView::from_slice(&[])
    }

    fn from_slice(bytes: &'a [u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        Self {
            bytes,
            hash: hasher.finish(),
        }
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Freshly allocated copy; the only way a row key escapes the batch scope.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn content_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for RowKeyView<'_> {
    fn eq(&self, other: &Self) -> bool {
        // Cached hash first, then length, then the byte range.
        self.hash == other.hash
            && self.bytes.len() == other.bytes.len()
            && self.bytes == other.bytes
    }
}

impl Eq for RowKeyView<'_> {}

impl Hash for RowKeyView<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for RowKeyView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 16;
        let shown = &self.bytes[..self.bytes.len().min(PREVIEW)];
        write!(f, "RowKey({}", hex::encode(shown))?;
        if self.bytes.len() > PREVIEW {
            write!(f, "…+{}", self.bytes.len() - PREVIEW)?;
        }
        write!(f, ")")
    }
}
