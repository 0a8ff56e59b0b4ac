//! Typed value decoding
//!
//! Converts raw column bytes into JSON values using the type names declared
//! in the schema registry. Two decoders exist: the raw decoder passes bytes
//! through untouched, the typed decoder resolves a [`LogicalType`] per column
//! (cached after the first lookup) and converts accordingly.
//!
//! Wire encodings, fixed here because the upstream writers agree on them:
//! - signed and unsigned integers: fixed-width big-endian; unsigned widths
//!   decode into the next wider signed integer
//! - `FLOAT`/`DOUBLE`: IEEE-754 big-endian bit patterns, 4/8 bytes
//! - `BOOLEAN`: one byte, `0` or `1`
//! - `DECIMAL`: a UTF-8 decimal literal
//! - `DATE`/`TIME`/`TIMESTAMP`: 8-byte big-endian epoch milliseconds; a
//!   timestamp may carry 4 trailing nanosecond bytes, which are dropped
//! - arrays: 4-byte big-endian element count, then per element a 4-byte
//!   big-endian length (`-1` marks NULL) followed by the element bytes
//! - the empty value is the wire form of NULL

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{EndpointError, EndpointResult};
use crate::schema::SchemaRegistry;
use crate::types::TableName;

/// Canonicalize a declared type name: trim, upper-case, strip parenthesized
/// parameters, normalize both array spellings to `T ARRAY`, turn underscores
/// into spaces and collapse runs of whitespace.
///
/// Unknown names pass through unchanged (canonicalized in form only); the
/// decoder decides what to do with them.
pub fn normalize_type_name(raw: &str) -> String {
    let mut name = raw.trim().to_uppercase();

    // VARCHAR(10) -> VARCHAR, DECIMAL(10,2) -> DECIMAL
    let mut stripped = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }
    name = stripped;

    name = name.replace('_', " ");

    // T[] and ARRAY<T> -> T ARRAY
    let trimmed = name.trim();
    if let Some(element) = trimmed.strip_suffix("[]") {
        name = format!("{} ARRAY", element.trim());
    } else if let Some(inner) = trimmed
        .strip_prefix("ARRAY<")
        .and_then(|rest| rest.strip_suffix('>'))
    {
        name = format!("{} ARRAY", inner.trim());
    }

    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolved representation of a declared column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalType {
    Varchar,
    Char,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    UnsignedTinyInt,
    UnsignedSmallInt,
    UnsignedInt,
    UnsignedLong,
    Float,
    Double,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Varbinary,
    Array(Box<LogicalType>),
}

impl LogicalType {
    /// Resolve a canonicalized type name, mapping the usual aliases. `None`
    /// means the name is unknown and the caller should fall back.
    pub fn resolve(canonical: &str) -> Option<Self> {
        if let Some(element) = canonical.strip_suffix(" ARRAY") {
            return LogicalType::resolve(element).map(|t| LogicalType::Array(Box::new(t)));
        }
        let resolved = match canonical {
            "VARCHAR" | "STRING" => LogicalType::Varchar,
            "CHAR" => LogicalType::Char,
            "TINYINT" => LogicalType::TinyInt,
            "SMALLINT" => LogicalType::SmallInt,
            "INTEGER" | "INT" => LogicalType::Integer,
            "BIGINT" | "LONG" => LogicalType::BigInt,
            "UNSIGNED TINYINT" => LogicalType::UnsignedTinyInt,
            "UNSIGNED SMALLINT" => LogicalType::UnsignedSmallInt,
            "UNSIGNED INT" | "UNSIGNED INTEGER" => LogicalType::UnsignedInt,
            "UNSIGNED LONG" | "UNSIGNED BIGINT" => LogicalType::UnsignedLong,
            "FLOAT" => LogicalType::Float,
            "DOUBLE" => LogicalType::Double,
            "DECIMAL" | "NUMERIC" | "NUMBER" => LogicalType::Decimal,
            "BOOLEAN" | "BOOL" => LogicalType::Boolean,
            "DATE" => LogicalType::Date,
            "TIME" => LogicalType::Time,
            "TIMESTAMP" => LogicalType::Timestamp,
            "BINARY" => LogicalType::Binary,
            "VARBINARY" => LogicalType::Varbinary,
            _ => return None,
        };
        Some(resolved)
    }

    /// The canonical name of this type, as used in error reports.
    pub fn canonical_name(&self) -> String {
        match self {
            LogicalType::Varchar => "VARCHAR".to_string(),
            LogicalType::Char => "CHAR".to_string(),
            LogicalType::TinyInt => "TINYINT".to_string(),
            LogicalType::SmallInt => "SMALLINT".to_string(),
            LogicalType::Integer => "INTEGER".to_string(),
            LogicalType::BigInt => "BIGINT".to_string(),
            LogicalType::UnsignedTinyInt => "UNSIGNED TINYINT".to_string(),
            LogicalType::UnsignedSmallInt => "UNSIGNED SMALLINT".to_string(),
            LogicalType::UnsignedInt => "UNSIGNED INT".to_string(),
            LogicalType::UnsignedLong => "UNSIGNED LONG".to_string(),
            LogicalType::Float => "FLOAT".to_string(),
            LogicalType::Double => "DOUBLE".to_string(),
            LogicalType::Decimal => "DECIMAL".to_string(),
            LogicalType::Boolean => "BOOLEAN".to_string(),
            LogicalType::Date => "DATE".to_string(),
            LogicalType::Time => "TIME".to_string(),
            LogicalType::Timestamp => "TIMESTAMP".to_string(),
            LogicalType::Binary => "BINARY".to_string(),
            LogicalType::Varbinary => "VARBINARY".to_string(),
            LogicalType::Array(element) => format!("{} ARRAY", element.canonical_name()),
        }
    }
}

/// A conversion failure for one value; wrapped into the crate error with the
/// column coordinates by the typed decoder.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("expected {expected} value bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid UTF-8 in value")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid decimal literal '{0}'")]
    Decimal(String),
    #[error("invalid boolean byte {0:#04x}")]
    Boolean(u8),
    #[error("non-finite float cannot be represented in JSON")]
    NonFinite,
    #[error("truncated array encoding")]
    TruncatedArray,
}

fn expect_len(bytes: &[u8], expected: usize) -> Result<(), ConversionError> {
    if bytes.len() != expected {
        return Err(ConversionError::Length {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_i64_prefix(bytes: &[u8]) -> i64 {
    i64::from_be_bytes(bytes[..8].try_into().unwrap())
}

fn float_number(value: f64) -> Result<Value, ConversionError> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or(ConversionError::NonFinite)
}

/// Convert one value per its resolved type.
fn convert(ty: &LogicalType, bytes: &[u8]) -> Result<Value, ConversionError> {
    let value = match ty {
        LogicalType::Varchar | LogicalType::Char => {
            Value::String(std::str::from_utf8(bytes)?.to_string())
        }
        LogicalType::TinyInt => {
            expect_len(bytes, 1)?;
            Value::from(bytes[0] as i8 as i64)
        }
        LogicalType::SmallInt => {
            expect_len(bytes, 2)?;
            Value::from(i16::from_be_bytes(bytes.try_into().unwrap()) as i64)
        }
        LogicalType::Integer => {
            expect_len(bytes, 4)?;
            Value::from(i32::from_be_bytes(bytes.try_into().unwrap()) as i64)
        }
        LogicalType::BigInt => {
            expect_len(bytes, 8)?;
            Value::from(i64::from_be_bytes(bytes.try_into().unwrap()))
        }
        LogicalType::UnsignedTinyInt => {
            expect_len(bytes, 1)?;
            Value::from(bytes[0] as i64)
        }
        LogicalType::UnsignedSmallInt => {
            expect_len(bytes, 2)?;
            Value::from(u16::from_be_bytes(bytes.try_into().unwrap()) as i64)
        }
        LogicalType::UnsignedInt => {
            expect_len(bytes, 4)?;
            Value::from(u32::from_be_bytes(bytes.try_into().unwrap()) as i64)
        }
        LogicalType::UnsignedLong => {
            expect_len(bytes, 8)?;
            Value::from(u64::from_be_bytes(bytes.try_into().unwrap()))
        }
        LogicalType::Float => {
            expect_len(bytes, 4)?;
            float_number(f32::from_be_bytes(bytes.try_into().unwrap()) as f64)?
        }
        LogicalType::Double => {
            expect_len(bytes, 8)?;
            float_number(f64::from_be_bytes(bytes.try_into().unwrap()))?
        }
        LogicalType::Decimal => {
            let literal = std::str::from_utf8(bytes)?;
            let parsed = BigDecimal::from_str(literal)
                .map_err(|_| ConversionError::Decimal(literal.to_string()))?;
            let number = serde_json::Number::from_str(&parsed.to_string())
                .map_err(|_| ConversionError::Decimal(literal.to_string()))?;
            Value::Number(number)
        }
        LogicalType::Boolean => {
            expect_len(bytes, 1)?;
            match bytes[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(ConversionError::Boolean(other)),
            }
        }
        LogicalType::Date | LogicalType::Time => {
            expect_len(bytes, 8)?;
            Value::from(read_i64_prefix(bytes))
        }
        LogicalType::Timestamp => {
            // 8 bytes of millis, optionally 4 more of sub-millisecond nanos
            // which are normalized away.
            if bytes.len() != 8 && bytes.len() != 12 {
                return Err(ConversionError::Length {
                    expected: 8,
                    actual: bytes.len(),
                });
            }
            Value::from(read_i64_prefix(bytes))
        }
        LogicalType::Binary | LogicalType::Varbinary => byte_array(bytes),
        LogicalType::Array(element) => convert_array(element, bytes)?,
    };
    Ok(value)
}

fn byte_array(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|&b| Value::from(b)).collect())
}

fn convert_array(element: &LogicalType, bytes: &[u8]) -> Result<Value, ConversionError> {
    if bytes.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    if bytes.len() < 4 {
        return Err(ConversionError::TruncatedArray);
    }
    let count = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    let mut elements = Vec::with_capacity(count);
    let mut cursor = 4usize;
    for _ in 0..count {
        let header = cursor.checked_add(4).ok_or(ConversionError::TruncatedArray)?;
        if header > bytes.len() {
            return Err(ConversionError::TruncatedArray);
        }
        let len = i32::from_be_bytes(bytes[cursor..header].try_into().unwrap());
        cursor = header;
        if len < 0 {
            elements.push(Value::Null);
            continue;
        }
        let end = cursor
            .checked_add(len as usize)
            .ok_or(ConversionError::TruncatedArray)?;
        if end > bytes.len() {
            return Err(ConversionError::TruncatedArray);
        }
        elements.push(convert(element, &bytes[cursor..end])?);
        cursor = end;
    }
    Ok(Value::Array(elements))
}

type ColumnKey = (String, String, String);

fn column_key(table: &TableName, qualifier: &str) -> ColumnKey {
    (
        table.namespace.clone(),
        table.qualifier.clone(),
        qualifier.to_string(),
    )
}

/// Pass-through decoder: bytes in, bytes out
///
/// Stateless; the JSON form of a raw value is the plain byte array.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl RawDecoder {
    pub fn decode(&self, value: &[u8]) -> Option<Value> {
        Some(byte_array(value))
    }
}

/// Schema-driven decoder with a per-column resolved-type cache
///
/// The schema registry is consulted once per `(table, qualifier)`; the
/// resolved type is cached until the registry publishes a new snapshot
/// generation, at which point the cache is dropped wholesale. Columns with an
/// unknown or undeclared type fall back to `VARCHAR` semantics and warn once.
pub struct TypedDecoder {
    registry: Arc<SchemaRegistry>,
    cache: RwLock<HashMap<ColumnKey, LogicalType>>,
    warned: Mutex<HashSet<ColumnKey>>,
    seen_generation: AtomicU64,
}

impl TypedDecoder {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let seen_generation = AtomicU64::new(registry.generation());
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
            seen_generation,
        }
    }

    pub fn decode(
        &self,
        table: &TableName,
        qualifier: &[u8],
        value: &[u8],
    ) -> EndpointResult<Option<Value>> {
        if value.is_empty() {
            return Ok(None);
        }
        let qualifier = String::from_utf8_lossy(qualifier).into_owned();
        let ty = self.resolved_type(table, &qualifier);
        match convert(&ty, value) {
            Ok(converted) => Ok(Some(converted)),
            Err(e) => Err(EndpointError::decode(
                table.canonical(),
                qualifier,
                ty.canonical_name(),
                e,
            )),
        }
    }

    /// Number of columns that have hit the unknown-type fallback so far.
    pub fn warned_columns(&self) -> usize {
        self.warned.lock().len()
    }

    #[cfg(test)]
    fn cached_columns(&self) -> usize {
        self.cache.read().len()
    }

    fn resolved_type(&self, table: &TableName, qualifier: &str) -> LogicalType {
        self.invalidate_if_stale();

        let key = column_key(table, qualifier);
        if let Some(cached) = self.cache.read().get(&key) {
            return cached.clone();
        }

        let declared = self.registry.column_type_relaxed(table, qualifier);
        let resolved = match declared.as_deref().map(LogicalType::resolve) {
            Some(Some(ty)) => ty,
            Some(None) => {
                self.warn_once(
                    &key,
                    format!(
                        "Unknown type '{}' for column {}.{}, treating as VARCHAR",
                        declared.as_deref().unwrap_or_default(),
                        table.canonical(),
                        qualifier
                    ),
                );
                LogicalType::Varchar
            }
            None => {
                self.warn_once(
                    &key,
                    format!(
                        "No declared type for column {}.{}, treating as VARCHAR",
                        table.canonical(),
                        qualifier
                    ),
                );
                LogicalType::Varchar
            }
        };

        self.cache.write().insert(key, resolved.clone());
        resolved
    }

    /// The warning for one column fires once; repeats drop to debug.
    fn warn_once(&self, key: &ColumnKey, message: String) {
        let mut warned = self.warned.lock();
        if warned.insert(key.clone()) {
            warn!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    fn invalidate_if_stale(&self) {
        let current = self.registry.generation();
        if self.seen_generation.swap(current, Ordering::AcqRel) != current {
            debug!("Schema snapshot changed, dropping resolved column types");
            self.cache.write().clear();
        }
    }
}

/// The decoder the endpoint runs with
pub enum ValueDecoder {
    Raw(RawDecoder),
    Typed(TypedDecoder),
}

impl ValueDecoder {
    pub fn raw() -> Self {
        ValueDecoder::Raw(RawDecoder)
    }

    pub fn typed(registry: Arc<SchemaRegistry>) -> Self {
        ValueDecoder::Typed(TypedDecoder::new(registry))
    }

    /// Decode one cell value. `Ok(None)` is a decoded NULL: the typed
    /// decoder's empty-input case.
    pub fn decode(
        &self,
        table: &TableName,
        qualifier: &[u8],
        value: &[u8],
    ) -> EndpointResult<Option<Value>> {
        match self {
            ValueDecoder::Raw(raw) => Ok(raw.decode(value)),
            ValueDecoder::Typed(typed) => typed.decode(table, qualifier, value),
        }
    }
}
