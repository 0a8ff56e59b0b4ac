//! Column schema registry
//!
//! Maps `(table, qualifier)` to the declared type name of a column. The
//! registry holds an immutable snapshot behind a lock-protected `Arc`;
//! `refresh` rebuilds the snapshot off to the side and swaps it in, so
//! readers always see either the old or the new mapping, never a torn one.
//!
//! The JSON source is lenient by design: a missing file, a parse failure or
//! an empty document all produce an empty snapshot with a warning. Schema
//! problems must never take the replication stream down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::decode::normalize_type_name;
use crate::types::TableName;

/// Shape of one table in the schema document.
#[derive(Debug, Deserialize)]
struct TableDoc {
    #[serde(default)]
    columns: HashMap<String, String>,
}

/// Immutable alias-expanded mapping built from one schema document
///
/// Tables are published under up to six aliases (original, upper and lower
/// of both the full `ns:qual` form and the short name after the colon) and
/// qualifiers under three (original, upper, lower), so lookups are a single
/// exact probe.
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    tables: HashMap<String, Arc<HashMap<String, String>>>,
}

impl SchemaSnapshot {
    fn from_json(raw: &str) -> Option<Self> {
        let parsed: HashMap<String, TableDoc> = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Schema document is not valid JSON: {}", e);
                return None;
            }
        };

        let mut tables: HashMap<String, Arc<HashMap<String, String>>> = HashMap::new();
        for (table, doc) in parsed {
            let mut columns: HashMap<String, String> =
                HashMap::with_capacity(doc.columns.len() * 3);
            for (qualifier, type_name) in doc.columns {
                let canonical = normalize_type_name(&type_name);
                columns.insert(qualifier.to_uppercase(), canonical.clone());
                columns.insert(qualifier.to_lowercase(), canonical.clone());
                columns.insert(qualifier, canonical);
            }
            let columns = Arc::new(columns);

            for alias in table_aliases(&table) {
                tables.insert(alias, Arc::clone(&columns));
            }
        }

        Some(Self { tables })
    }

    fn column_type(&self, table: &str, qualifier: &str) -> Option<&str> {
        self.tables
            .get(table)
            .and_then(|columns| columns.get(qualifier))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// The aliases one table name is published under.
fn table_aliases(table: &str) -> Vec<String> {
    let mut aliases = vec![
        table.to_string(),
        table.to_uppercase(),
        table.to_lowercase(),
    ];
    if let Some((_, short)) = table.split_once(':') {
        if !short.is_empty() {
            aliases.push(short.to_string());
            aliases.push(short.to_uppercase());
            aliases.push(short.to_lowercase());
        }
    }
    aliases.sort();
    aliases.dedup();
    aliases
}

/// Registry of declared column types, reloadable at runtime
pub struct SchemaRegistry {
    source: Option<PathBuf>,
    snapshot: RwLock<Arc<SchemaSnapshot>>,
    generation: AtomicU64,
}

impl SchemaRegistry {
    /// Registry with no declared columns.
    pub fn empty() -> Self {
        Self {
            source: None,
            snapshot: RwLock::new(Arc::new(SchemaSnapshot::default())),
            generation: AtomicU64::new(0),
        }
    }

    /// Load from a schema file. Read or parse failures yield an empty
    /// registry; the error is logged, never propagated.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let registry = Self {
            source: Some(path),
            snapshot: RwLock::new(Arc::new(SchemaSnapshot::default())),
            generation: AtomicU64::new(0),
        };
        registry.install(registry.read_source());
        registry
    }

    /// Build directly from a JSON document (no backing file).
    pub fn from_json(raw: &str) -> Self {
        let registry = Self::empty();
        registry.install(SchemaSnapshot::from_json(raw));
        registry
    }

    /// Declared type name for a column, after alias expansion. Exact probe.
    pub fn column_type(&self, table: &TableName, qualifier: &str) -> Option<String> {
        self.snapshot
            .read()
            .column_type(&table.canonical(), qualifier)
            .map(str::to_string)
    }

    /// Like [`column_type`] but retries with the upper-cased and lower-cased
    /// qualifier before giving up.
    ///
    /// [`column_type`]: SchemaRegistry::column_type
    pub fn column_type_relaxed(&self, table: &TableName, qualifier: &str) -> Option<String> {
        let snapshot = self.snapshot.read();
        let table = table.canonical();
        snapshot
            .column_type(&table, qualifier)
            .or_else(|| snapshot.column_type(&table, &qualifier.to_uppercase()))
            .or_else(|| snapshot.column_type(&table, &qualifier.to_lowercase()))
            .map(str::to_string)
    }

    /// Reload from the source and swap the snapshot in atomically. Bumps the
    /// generation so per-column caches downstream can invalidate themselves.
    pub fn refresh(&self) {
        let next = self.read_source();
        self.install(next);
    }

    /// Monotonic counter, incremented on every snapshot replacement.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn read_source(&self) -> Option<SchemaSnapshot> {
        let path = match &self.source {
            Some(path) => path,
            None => {
                warn!("Schema registry has no backing file, keeping an empty snapshot");
                return None;
            }
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => SchemaSnapshot::from_json(&raw),
            Err(e) => {
                warn!("Failed to read schema file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn install(&self, snapshot: Option<SchemaSnapshot>) {
        let snapshot = Arc::new(snapshot.unwrap_or_default());
        debug!(
            "Installing schema snapshot with {} table aliases",
            snapshot.tables.len()
        );
        *self.snapshot.write() = snapshot;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
