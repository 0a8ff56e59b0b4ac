//! Configuration for the replication endpoint
//!
//! The host hands the endpoint a flat key-value map at `init` time. This
//! module wraps that map with typed accessors, validates everything once and
//! produces an immutable [`EndpointConfig`] through an explicit builder.
//! Topic names are derived here as well, since they are a pure function of
//! the configuration and the table identity.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;
use uuid::Uuid;

use crate::errors::{EndpointError, EndpointResult};
use crate::types::TableName;

pub const KEY_BOOTSTRAP: &str = "broker.bootstrap";
pub const KEY_TOPIC_PATTERN: &str = "topic.pattern";
pub const KEY_TOPIC_MAX_LENGTH: &str = "topic.max-length";
pub const KEY_FAMILY: &str = "family.name";
pub const KEY_INCLUDE_ROWKEY: &str = "payload.include-rowkey";
pub const KEY_ROWKEY_ENCODING: &str = "rowkey.encoding";
pub const KEY_INCLUDE_META: &str = "payload.include-meta";
pub const KEY_INCLUDE_META_WAL: &str = "payload.include-meta-wal";
pub const KEY_SERIALIZE_NULLS: &str = "json.serialize-nulls";
pub const KEY_WAL_MIN_TS: &str = "filter.wal.min-ts";
pub const KEY_TOPIC_ENSURE: &str = "topic.ensure";
pub const KEY_TOPIC_PARTITIONS: &str = "topic.partitions";
pub const KEY_TOPIC_REPLICATION: &str = "topic.replication";
pub const KEY_ADMIN_TIMEOUT_MS: &str = "admin.timeout-ms";
pub const KEY_ADMIN_CLIENT_ID: &str = "admin.client-id";
pub const KEY_UNKNOWN_BACKOFF_MS: &str = "topic.unknown-backoff-ms";
pub const KEY_AWAIT_EVERY: &str = "producer.await.every";
pub const KEY_AWAIT_TIMEOUT_MS: &str = "producer.await.timeout-ms";
pub const KEY_BATCH_COUNTERS: &str = "producer.batch.counters-enabled";
pub const KEY_BATCH_DEBUG_ON_FAILURE: &str = "producer.batch.debug-on-failure";
pub const KEY_DECODE_MODE: &str = "decode.mode";
pub const KEY_SCHEMA_PATH: &str = "schema.path";
pub const PREFIX_TOPIC_CONFIG: &str = "topic.config.";
pub const PREFIX_BROKER_CONFIG: &str = "broker.config.";

/// Characters allowed in a derived topic name; everything else becomes `_`.
fn is_topic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Row-key representation inside the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKeyEncoding {
    Hex,
    Base64,
}

/// Which value decoder the endpoint instantiates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Raw,
    Typed,
}

/// The flat key-value configuration handed over by the host framework
///
/// Accessors trim values, accept common truthy/falsy tokens for booleans and
/// fall back to the supplied default (with a warning) on unparseable input.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    entries: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.trim())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                other => {
                    warn!("Unrecognized boolean '{}' for {}, using {}", other, key, default);
                    default
                }
            },
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.parse_or(key, default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.parse_or(key, default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.parse_or(key, default)
    }

    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.parse_or(key, default)
    }

    pub fn get_opt_i64(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Unrecognized number '{}' for {}, leaving unset", raw, key);
                None
            }
        }
    }

    /// All entries under `prefix`, with the prefix stripped, in key order.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), v.trim().to_string()))
            })
            .collect()
    }

    fn parse_or<T: std::str::FromStr + std::fmt::Display + Copy>(
        &self,
        key: &str,
        default: T,
    ) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!("Unrecognized number '{}' for {}, using {}", raw, key, default);
                    default
                }
            },
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConfigMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Immutable, validated endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub bootstrap: String,
    pub topic_pattern: String,
    pub topic_max_length: usize,
    pub family: Vec<u8>,
    pub include_rowkey: bool,
    pub rowkey_encoding: RowKeyEncoding,
    pub include_meta: bool,
    pub include_wal_meta: bool,
    pub serialize_nulls: bool,
    pub wal_min_timestamp: Option<i64>,
    pub topic_ensure: bool,
    pub topic_partitions: i32,
    pub topic_replication: i16,
    pub admin_timeout_ms: u64,
    pub admin_client_id: String,
    pub unknown_backoff_ms: u64,
    pub await_every: usize,
    pub await_timeout_ms: u64,
    pub batch_counters_enabled: bool,
    pub batch_debug_on_failure: bool,
    pub topic_configs: BTreeMap<String, String>,
    /// Client properties for whoever constructs the producer/admin clients
    /// (security settings and the like); passed through untouched.
    pub broker_configs: BTreeMap<String, String>,
    pub decode_mode: DecodeMode,
    pub schema_path: Option<String>,
}

impl EndpointConfig {
    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder::default()
    }

    /// Build a validated configuration from the host's key-value map.
    pub fn from_map(map: &ConfigMap) -> EndpointResult<Self> {
        let mut builder = Self::builder()
            .bootstrap(map.get_string(KEY_BOOTSTRAP, ""))
            .topic_pattern(map.get_string(KEY_TOPIC_PATTERN, "${table}"))
            .topic_max_length(map.get_usize(KEY_TOPIC_MAX_LENGTH, 249))
            .family(map.get_string(KEY_FAMILY, "0").into_bytes())
            .include_rowkey(map.get_bool(KEY_INCLUDE_ROWKEY, true))
            .rowkey_encoding_name(map.get_string(KEY_ROWKEY_ENCODING, "hex"))
            .include_meta(map.get_bool(KEY_INCLUDE_META, false))
            .include_wal_meta(map.get_bool(KEY_INCLUDE_META_WAL, false))
            .serialize_nulls(map.get_bool(KEY_SERIALIZE_NULLS, false))
            .topic_ensure(map.get_bool(KEY_TOPIC_ENSURE, false))
            .topic_partitions(map.get_i32(KEY_TOPIC_PARTITIONS, 3))
            .topic_replication(map.get_i32(KEY_TOPIC_REPLICATION, 1) as i16)
            .admin_timeout_ms(map.get_u64(KEY_ADMIN_TIMEOUT_MS, 60_000))
            .unknown_backoff_ms(map.get_u64(KEY_UNKNOWN_BACKOFF_MS, 15_000))
            .await_every(map.get_usize(KEY_AWAIT_EVERY, 500))
            .await_timeout_ms(map.get_u64(KEY_AWAIT_TIMEOUT_MS, 180_000))
            .batch_counters_enabled(map.get_bool(KEY_BATCH_COUNTERS, false))
            .batch_debug_on_failure(map.get_bool(KEY_BATCH_DEBUG_ON_FAILURE, false))
            .topic_configs(map.with_prefix(PREFIX_TOPIC_CONFIG))
            .broker_configs(map.with_prefix(PREFIX_BROKER_CONFIG))
            .decode_mode_name(map.get_string(KEY_DECODE_MODE, "raw"));

        if let Some(min_ts) = map.get_opt_i64(KEY_WAL_MIN_TS) {
            builder = builder.wal_min_timestamp(min_ts);
        }
        if let Some(client_id) = map.get(KEY_ADMIN_CLIENT_ID) {
            builder = builder.admin_client_id(client_id);
        }
        if let Some(path) = map.get(KEY_SCHEMA_PATH) {
            builder = builder.schema_path(path);
        }

        builder.build()
    }

    /// Derive the broker topic for a table: expand the pattern placeholders,
    /// replace disallowed characters with `_` and clamp the length.
    pub fn topic_for(&self, table: &TableName) -> String {
        let table_flat = if table.namespace.is_empty() {
            table.qualifier.clone()
        } else {
            format!("{}_{}", table.namespace, table.qualifier)
        };
        let expanded = self
            .topic_pattern
            .replace("${table}", &table_flat)
            .replace("${namespace}", &table.namespace)
            .replace("${qualifier}", &table.qualifier);

        let mut sanitized: String = expanded
            .chars()
            .map(|c| if is_topic_char(c) { c } else { '_' })
            .collect();
        sanitized.truncate(self.topic_max_length);
        sanitized
    }
}

/// Builder for [`EndpointConfig`]; validation happens in [`build`].
///
/// [`build`]: EndpointConfigBuilder::build
#[derive(Debug, Clone)]
pub struct EndpointConfigBuilder {
    bootstrap: String,
    topic_pattern: String,
    topic_max_length: usize,
    family: Vec<u8>,
    include_rowkey: bool,
    rowkey_encoding: RowKeyEncoding,
    include_meta: bool,
    include_wal_meta: bool,
    serialize_nulls: bool,
    wal_min_timestamp: Option<i64>,
    topic_ensure: bool,
    topic_partitions: i32,
    topic_replication: i16,
    admin_timeout_ms: u64,
    admin_client_id: Option<String>,
    unknown_backoff_ms: u64,
    await_every: usize,
    await_timeout_ms: u64,
    batch_counters_enabled: bool,
    batch_debug_on_failure: bool,
    topic_configs: BTreeMap<String, String>,
    broker_configs: BTreeMap<String, String>,
    decode_mode: DecodeMode,
    schema_path: Option<String>,
}

impl Default for EndpointConfigBuilder {
    fn default() -> Self {
        Self {
            bootstrap: String::new(),
            topic_pattern: "${table}".to_string(),
            topic_max_length: 249,
            family: b"0".to_vec(),
            include_rowkey: true,
            rowkey_encoding: RowKeyEncoding::Hex,
            include_meta: false,
            include_wal_meta: false,
            serialize_nulls: false,
            wal_min_timestamp: None,
            topic_ensure: false,
            topic_partitions: 3,
            topic_replication: 1,
            admin_timeout_ms: 60_000,
            admin_client_id: None,
            unknown_backoff_ms: 15_000,
            await_every: 500,
            await_timeout_ms: 180_000,
            batch_counters_enabled: false,
            batch_debug_on_failure: false,
            topic_configs: BTreeMap::new(),
            broker_configs: BTreeMap::new(),
            decode_mode: DecodeMode::Raw,
            schema_path: None,
        }
    }
}

impl EndpointConfigBuilder {
    pub fn bootstrap(mut self, bootstrap: impl Into<String>) -> Self {
        self.bootstrap = bootstrap.into();
        self
    }

    pub fn topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.topic_pattern = pattern.into();
        self
    }

    pub fn topic_max_length(mut self, max: usize) -> Self {
        self.topic_max_length = max;
        self
    }

    pub fn family(mut self, family: Vec<u8>) -> Self {
        self.family = family;
        self
    }

    pub fn include_rowkey(mut self, include: bool) -> Self {
        self.include_rowkey = include;
        self
    }

    pub fn rowkey_encoding(mut self, encoding: RowKeyEncoding) -> Self {
        self.rowkey_encoding = encoding;
        self
    }

    /// Parse the configured encoding name; anything unrecognized normalizes
    /// to hex with a warning.
    pub fn rowkey_encoding_name(mut self, name: impl AsRef<str>) -> Self {
        self.rowkey_encoding = match name.as_ref().to_ascii_lowercase().as_str() {
            "base64" => RowKeyEncoding::Base64,
            "hex" => RowKeyEncoding::Hex,
            other => {
                warn!("Unrecognized rowkey encoding '{}', using hex", other);
                RowKeyEncoding::Hex
            }
        };
        self
    }

    pub fn include_meta(mut self, include: bool) -> Self {
        self.include_meta = include;
        self
    }

    pub fn include_wal_meta(mut self, include: bool) -> Self {
        self.include_wal_meta = include;
        self
    }

    pub fn serialize_nulls(mut self, serialize: bool) -> Self {
        self.serialize_nulls = serialize;
        self
    }

    pub fn wal_min_timestamp(mut self, min_ts: i64) -> Self {
        self.wal_min_timestamp = Some(min_ts);
        self
    }

    pub fn topic_ensure(mut self, ensure: bool) -> Self {
        self.topic_ensure = ensure;
        self
    }

    pub fn topic_partitions(mut self, partitions: i32) -> Self {
        self.topic_partitions = partitions;
        self
    }

    pub fn topic_replication(mut self, replication: i16) -> Self {
        self.topic_replication = replication;
        self
    }

    pub fn admin_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.admin_timeout_ms = timeout_ms;
        self
    }

    pub fn admin_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.admin_client_id = Some(client_id.into());
        self
    }

    pub fn unknown_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.unknown_backoff_ms = backoff_ms;
        self
    }

    pub fn await_every(mut self, every: usize) -> Self {
        self.await_every = every;
        self
    }

    pub fn await_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.await_timeout_ms = timeout_ms;
        self
    }

    pub fn batch_counters_enabled(mut self, enabled: bool) -> Self {
        self.batch_counters_enabled = enabled;
        self
    }

    pub fn batch_debug_on_failure(mut self, enabled: bool) -> Self {
        self.batch_debug_on_failure = enabled;
        self
    }

    pub fn topic_configs(mut self, configs: BTreeMap<String, String>) -> Self {
        self.topic_configs = configs;
        self
    }

    pub fn broker_configs(mut self, configs: BTreeMap<String, String>) -> Self {
        self.broker_configs = configs;
        self
    }

    pub fn decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    pub fn decode_mode_name(mut self, name: impl AsRef<str>) -> Self {
        self.decode_mode = match name.as_ref().to_ascii_lowercase().as_str() {
            "typed" => DecodeMode::Typed,
            "raw" => DecodeMode::Raw,
            other => {
                warn!("Unrecognized decode mode '{}', using raw", other);
                DecodeMode::Raw
            }
        };
        self
    }

    pub fn schema_path(mut self, path: impl Into<String>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    pub fn build(self) -> EndpointResult<EndpointConfig> {
        if self.bootstrap.trim().is_empty() {
            return Err(EndpointError::config(format!(
                "{} must be a non-empty broker endpoint list",
                KEY_BOOTSTRAP
            )));
        }
        if self.family.is_empty() {
            return Err(EndpointError::config(format!(
                "{} must name a column family",
                KEY_FAMILY
            )));
        }
        Self::require_positive(KEY_TOPIC_MAX_LENGTH, self.topic_max_length as i64)?;
        Self::require_positive(KEY_TOPIC_PARTITIONS, self.topic_partitions as i64)?;
        Self::require_positive(KEY_TOPIC_REPLICATION, self.topic_replication as i64)?;
        Self::require_positive(KEY_ADMIN_TIMEOUT_MS, self.admin_timeout_ms as i64)?;
        Self::require_positive(KEY_UNKNOWN_BACKOFF_MS, self.unknown_backoff_ms as i64)?;
        Self::require_positive(KEY_AWAIT_EVERY, self.await_every as i64)?;
        Self::require_positive(KEY_AWAIT_TIMEOUT_MS, self.await_timeout_ms as i64)?;
        if self.decode_mode == DecodeMode::Typed && self.schema_path.is_none() {
            return Err(EndpointError::config(format!(
                "{} is required when {} is 'typed'",
                KEY_SCHEMA_PATH, KEY_DECODE_MODE
            )));
        }

        let admin_client_id = self
            .admin_client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(default_admin_client_id);

        Ok(EndpointConfig {
            bootstrap: self.bootstrap.trim().to_string(),
            topic_pattern: self.topic_pattern,
            topic_max_length: self.topic_max_length,
            family: self.family,
            include_rowkey: self.include_rowkey,
            rowkey_encoding: self.rowkey_encoding,
            include_meta: self.include_meta,
            include_wal_meta: self.include_wal_meta,
            serialize_nulls: self.serialize_nulls,
            wal_min_timestamp: self.wal_min_timestamp,
            topic_ensure: self.topic_ensure,
            topic_partitions: self.topic_partitions,
            topic_replication: self.topic_replication,
            admin_timeout_ms: self.admin_timeout_ms,
            admin_client_id,
            unknown_backoff_ms: self.unknown_backoff_ms,
            await_every: self.await_every,
            await_timeout_ms: self.await_timeout_ms,
            batch_counters_enabled: self.batch_counters_enabled,
            batch_debug_on_failure: self.batch_debug_on_failure,
            topic_configs: self.topic_configs,
            broker_configs: self.broker_configs,
            decode_mode: self.decode_mode,
            schema_path: self.schema_path,
        })
    }

    fn require_positive(key: &str, value: i64) -> EndpointResult<()> {
        if value <= 0 {
            return Err(EndpointError::config(format!("{} must be > 0", key)));
        }
        Ok(())
    }
}

/// The default admin client id: the local hostname, or a UUID when the
/// hostname cannot be read.
fn default_admin_client_id() -> String {
    match hostname::get() {
        Ok(name) => format!("wal2kafka-admin-{}", name.to_string_lossy()),
        Err(_) => format!("wal2kafka-admin-{}", Uuid::new_v4()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_map() -> ConfigMap {
        let mut map = ConfigMap::new();
        map.set(KEY_BOOTSTRAP, "localhost:9092");
        map
    }

    #[test]
    fn test_config_missing_bootstrap() {
        let result = EndpointConfig::from_map(&ConfigMap::new());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains(KEY_BOOTSTRAP));
    }

    #[test]
    fn test_config_defaults() {
        let config = EndpointConfig::from_map(&minimal_map()).unwrap();
        assert_eq!(config.topic_pattern, "${table}");
        assert_eq!(config.family, b"0".to_vec());
        assert!(config.include_rowkey);
        assert_eq!(config.rowkey_encoding, RowKeyEncoding::Hex);
        assert_eq!(config.await_every, 500);
        assert_eq!(config.await_timeout_ms, 180_000);
        assert_eq!(config.decode_mode, DecodeMode::Raw);
        assert!(config.wal_min_timestamp.is_none());
        assert!(!config.admin_client_id.is_empty());
    }

    #[test]
    fn test_config_invalid_rowkey_encoding_normalizes_to_hex() {
        let mut map = minimal_map();
        map.set(KEY_ROWKEY_ENCODING, "base32");
        let config = EndpointConfig::from_map(&map).unwrap();
        assert_eq!(config.rowkey_encoding, RowKeyEncoding::Hex);
    }

    #[test]
    fn test_config_typed_mode_requires_schema_path() {
        let mut map = minimal_map();
        map.set(KEY_DECODE_MODE, "typed");
        let result = EndpointConfig::from_map(&map);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains(KEY_SCHEMA_PATH));

        map.set(KEY_SCHEMA_PATH, "/etc/schema.json");
        let config = EndpointConfig::from_map(&map).unwrap();
        assert_eq!(config.decode_mode, DecodeMode::Typed);
        assert_eq!(config.schema_path.as_deref(), Some("/etc/schema.json"));
    }

    #[test]
    fn test_config_rejects_non_positive_numbers() {
        let mut map = minimal_map();
        map.set(KEY_AWAIT_EVERY, "0");
        assert!(EndpointConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_config_topic_config_passthrough() {
        let mut map = minimal_map();
        map.set("topic.config.retention.ms", "86400000");
        map.set("topic.config.cleanup.policy", "compact");
        let config = EndpointConfig::from_map(&map).unwrap();
        assert_eq!(
            config.topic_configs.get("retention.ms").map(String::as_str),
            Some("86400000")
        );
        assert_eq!(
            config.topic_configs.get("cleanup.policy").map(String::as_str),
            Some("compact")
        );
    }

    #[test]
    fn test_config_broker_config_passthrough() {
        let mut map = minimal_map();
        map.set("broker.config.security.protocol", "SASL_SSL");
        map.set("broker.config.sasl.mechanism", "PLAIN");
        let config = EndpointConfig::from_map(&map).unwrap();
        assert_eq!(
            config
                .broker_configs
                .get("security.protocol")
                .map(String::as_str),
            Some("SASL_SSL")
        );
        assert_eq!(config.broker_configs.len(), 2);
    }

    #[test]
    fn test_bool_tokens() {
        let mut map = ConfigMap::new();
        map.set("a", "YES").set("b", "off").set("c", "maybe");
        assert!(map.get_bool("a", false));
        assert!(!map.get_bool("b", true));
        assert!(map.get_bool("c", true));
    }

    #[test]
    fn test_topic_derivation_patterns() {
        let table = TableName::new("ns", "TBL");

        let dotted = EndpointConfig::builder()
            .bootstrap("localhost:9092")
            .topic_pattern("${namespace}.${qualifier}")
            .build()
            .unwrap();
        assert_eq!(dotted.topic_for(&table), "ns.TBL");

        let colon = EndpointConfig::builder()
            .bootstrap("localhost:9092")
            .topic_pattern("${namespace}:${qualifier}")
            .build()
            .unwrap();
        assert_eq!(colon.topic_for(&table), "ns_TBL");

        let flat = EndpointConfig::builder()
            .bootstrap("localhost:9092")
            .build()
            .unwrap();
        assert_eq!(flat.topic_for(&table), "ns_TBL");
        assert_eq!(flat.topic_for(&TableName::new("", "events")), "events");
    }

    #[test]
    fn test_topic_derivation_clamps_length() {
        let config = EndpointConfig::builder()
            .bootstrap("localhost:9092")
            .topic_max_length(8)
            .build()
            .unwrap();
        let topic = config.topic_for(&TableName::new("verylongnamespace", "tbl"));
        assert_eq!(topic.len(), 8);
    }
}
