//! Payload assembly
//!
//! Turns the cells of one row into the ordered JSON object that gets
//! published for that row. Column keys are the cell qualifiers; reserved keys
//! (`event_version`, `delete`, the `_`-prefixed meta fields and the row-key
//! encodings) live in a disjoint namespace. The output map preserves
//! insertion order, which is also its serialization order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use crate::config::{EndpointConfig, RowKeyEncoding};
use crate::decode::ValueDecoder;
use crate::errors::EndpointResult;
use crate::types::{Cell, RowKeyView, TableName};

pub const KEY_EVENT_VERSION: &str = "event_version";
pub const KEY_DELETE: &str = "delete";
pub const KEY_ROWKEY_HEX: &str = "rowkey_hex";
pub const KEY_ROWKEY_B64: &str = "rowkey_b64";
pub const KEY_META_TABLE: &str = "_table";
pub const KEY_META_NAMESPACE: &str = "_namespace";
pub const KEY_META_QUALIFIER: &str = "_qualifier";
pub const KEY_META_CF: &str = "_cf";
pub const KEY_META_CELLS_TOTAL: &str = "_cells_total";
pub const KEY_META_CELLS_CF: &str = "_cells_cf";
pub const KEY_META_WAL_SEQ: &str = "_wal_seq";
pub const KEY_META_WAL_WRITE_TIME: &str = "_wal_write_time";

/// Map capacity that holds `estimated + hint` entries without rehashing.
/// Integer arithmetic only.
pub(crate) fn presize_capacity(estimated: usize, hint: usize) -> usize {
    let expected = estimated + hint;
    1 + (4 * expected + 2) / 3
}

/// Builds one JSON payload per source row
pub struct PayloadAssembler {
    family: Vec<u8>,
    include_rowkey: bool,
    rowkey_encoding: RowKeyEncoding,
    include_meta: bool,
    include_wal_meta: bool,
    serialize_nulls: bool,
}

impl PayloadAssembler {
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self {
            family: config.family.clone(),
            include_rowkey: config.include_rowkey,
            rowkey_encoding: config.rowkey_encoding,
            include_meta: config.include_meta,
            include_wal_meta: config.include_wal_meta,
            serialize_nulls: config.serialize_nulls,
        }
    }

    /// Assemble the payload for one row.
    ///
    /// Cells outside the target family are skipped. `event_version` is the
    /// maximum cell timestamp seen in the family (0 when none); a tombstone
    /// sets `delete` instead of contributing a column.
    pub fn build(
        &self,
        decoder: &ValueDecoder,
        table: &TableName,
        cells: &[&Cell],
        row_key: Option<&RowKeyView<'_>>,
        sequence_id: Option<i64>,
        write_time: Option<i64>,
    ) -> EndpointResult<Map<String, Value>> {
        let reserved = 1
            + if self.include_meta { 5 } else { 0 }
            + if self.include_rowkey && row_key.is_some() { 1 } else { 0 }
            + if self.include_wal_meta { 2 } else { 0 };
        let mut payload =
            Map::with_capacity(presize_capacity(cells.len(), reserved));

        if self.include_meta {
            payload.insert(
                KEY_META_TABLE.to_string(),
                Value::String(table.canonical()),
            );
            payload.insert(
                KEY_META_NAMESPACE.to_string(),
                Value::String(table.namespace.clone()),
            );
            payload.insert(
                KEY_META_QUALIFIER.to_string(),
                Value::String(table.qualifier.clone()),
            );
            payload.insert(
                KEY_META_CF.to_string(),
                Value::String(String::from_utf8_lossy(&self.family).into_owned()),
            );
            payload.insert(KEY_META_CELLS_TOTAL.to_string(), Value::from(cells.len()));
        }

        let mut family_cells = 0u64;
        let mut max_timestamp = 0i64;
        let mut has_delete = false;

        for cell in cells {
            if cell.family() != self.family.as_slice() {
                continue;
            }
            family_cells += 1;
            max_timestamp = max_timestamp.max(cell.timestamp());

            if cell.is_tombstone() {
                has_delete = true;
                continue;
            }

            let decoded = decoder.decode(table, cell.qualifier(), cell.value())?;
            match decoded {
                Some(value) => {
                    payload.insert(
                        String::from_utf8_lossy(cell.qualifier()).into_owned(),
                        value,
                    );
                }
                None if self.serialize_nulls => {
                    payload.insert(
                        String::from_utf8_lossy(cell.qualifier()).into_owned(),
                        Value::Null,
                    );
                }
                None => {}
            }
        }

        if self.include_meta {
            payload.insert(KEY_META_CELLS_CF.to_string(), Value::from(family_cells));
        }
        payload.insert(KEY_EVENT_VERSION.to_string(), Value::from(max_timestamp));
        if has_delete {
            payload.insert(KEY_DELETE.to_string(), Value::Bool(true));
        }

        if self.include_rowkey {
            if let Some(row_key) = row_key {
                match self.rowkey_encoding {
                    RowKeyEncoding::Hex => payload.insert(
                        KEY_ROWKEY_HEX.to_string(),
                        Value::String(hex::encode(row_key.as_slice())),
                    ),
                    RowKeyEncoding::Base64 => payload.insert(
                        KEY_ROWKEY_B64.to_string(),
                        Value::String(BASE64.encode(row_key.as_slice())),
                    ),
                };
            }
        }

        if self.include_wal_meta {
            if let Some(seq) = sequence_id.filter(|&v| v >= 0) {
                payload.insert(KEY_META_WAL_SEQ.to_string(), Value::from(seq));
            }
            if let Some(time) = write_time.filter(|&v| v >= 0) {
                payload.insert(KEY_META_WAL_WRITE_TIME.to_string(), Value::from(time));
            }
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, EndpointConfigBuilder};
    use serde_json::json;

    fn assembler(builder: EndpointConfigBuilder) -> PayloadAssembler {
        PayloadAssembler::from_config(
            &builder.bootstrap("localhost:9092").build().unwrap(),
        )
    }

    fn bare_assembler() -> PayloadAssembler {
        assembler(
            EndpointConfig::builder()
                .include_rowkey(false)
                .include_meta(false)
                .include_wal_meta(false),
        )
    }

    #[test]
    fn test_presize_capacity_monotonic() {
        for estimated in 0..50 {
            for hint in 0..10 {
                let here = presize_capacity(estimated, hint);
                assert!(presize_capacity(estimated + 1, hint) >= here);
                assert!(presize_capacity(estimated, hint + 1) >= here);
                assert!(here > estimated + hint);
            }
        }
        assert_eq!(presize_capacity(0, 0), 1);
        assert_eq!(presize_capacity(2, 1), 5);
    }

    #[test]
    fn test_two_cells_yield_two_columns_plus_event_version() {
        let cells = vec![
            Cell::put(b"r".to_vec(), b"0".to_vec(), b"a".to_vec(), vec![1], 100),
            Cell::put(b"r".to_vec(), b"0".to_vec(), b"b".to_vec(), vec![2], 200),
        ];
        let refs: Vec<&Cell> = cells.iter().collect();
        let payload = bare_assembler()
            .build(
                &ValueDecoder::raw(),
                &TableName::new("ns", "t"),
                &refs,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[KEY_EVENT_VERSION], json!(200));
        assert_eq!(payload["a"], json!([1]));
        assert_eq!(payload["b"], json!([2]));
    }

    #[test]
    fn test_tombstone_sets_delete_and_drops_column() {
        let cells = vec![
            Cell::put(b"r".to_vec(), b"0".to_vec(), b"a".to_vec(), vec![1], 100),
            Cell::tombstone(b"r".to_vec(), b"0".to_vec(), b"gone".to_vec(), 300),
        ];
        let refs: Vec<&Cell> = cells.iter().collect();
        let payload = bare_assembler()
            .build(
                &ValueDecoder::raw(),
                &TableName::new("ns", "t"),
                &refs,
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(payload[KEY_DELETE], json!(true));
        assert_eq!(payload[KEY_EVENT_VERSION], json!(300));
        assert!(!payload.contains_key("gone"));
    }

    #[test]
    fn test_other_family_cells_are_skipped() {
        let cells = vec![
            Cell::put(b"r".to_vec(), b"0".to_vec(), b"a".to_vec(), vec![1], 100),
            Cell::put(b"r".to_vec(), b"x".to_vec(), b"b".to_vec(), vec![2], 900),
        ];
        let refs: Vec<&Cell> = cells.iter().collect();
        let payload = bare_assembler()
            .build(
                &ValueDecoder::raw(),
                &TableName::new("ns", "t"),
                &refs,
                None,
                None,
                None,
            )
            .unwrap();
        assert!(!payload.contains_key("b"));
        assert_eq!(payload[KEY_EVENT_VERSION], json!(100));
    }

    #[test]
    fn test_rowkey_encodings_are_exclusive() {
        let cells: Vec<Cell> = vec![];
        let refs: Vec<&Cell> = cells.iter().collect();
        let backing = [0x01u8, 0x02];
        let row_key = RowKeyView::whole(&backing);
        let table = TableName::new("ns", "t");

        let hex_payload = assembler(EndpointConfig::builder())
            .build(&ValueDecoder::raw(), &table, &refs, Some(&row_key), None, None)
            .unwrap();
        assert_eq!(hex_payload[KEY_ROWKEY_HEX], json!("0102"));
        assert!(!hex_payload.contains_key(KEY_ROWKEY_B64));

        let b64_payload = assembler(
            EndpointConfig::builder().rowkey_encoding(RowKeyEncoding::Base64),
        )
        .build(&ValueDecoder::raw(), &table, &refs, Some(&row_key), None, None)
        .unwrap();
        assert_eq!(b64_payload[KEY_ROWKEY_B64], json!("AQI="));
        assert!(!b64_payload.contains_key(KEY_ROWKEY_HEX));
    }

    #[test]
    fn test_empty_rowkey_encodes_to_empty_string() {
        let cells: Vec<Cell> = vec![];
        let refs: Vec<&Cell> = cells.iter().collect();
        let empty = RowKeyView::empty();
        let payload = assembler(EndpointConfig::builder())
            .build(
                &ValueDecoder::raw(),
                &TableName::new("ns", "t"),
                &refs,
                Some(&empty),
                None,
                None,
            )
            .unwrap();
        assert_eq!(payload[KEY_ROWKEY_HEX], json!(""));
    }

    #[test]
    fn test_meta_fields_and_order() {
        let cells = vec![
            Cell::put(b"r".to_vec(), b"0".to_vec(), b"a".to_vec(), vec![1], 5),
            Cell::put(b"r".to_vec(), b"z".to_vec(), b"b".to_vec(), vec![2], 9),
        ];
        let refs: Vec<&Cell> = cells.iter().collect();
        let payload = assembler(
            EndpointConfig::builder()
                .include_meta(true)
                .include_rowkey(false),
        )
        .build(
            &ValueDecoder::raw(),
            &TableName::new("ns", "t"),
            &refs,
            None,
            None,
            None,
        )
        .unwrap();

        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                KEY_META_TABLE,
                KEY_META_NAMESPACE,
                KEY_META_QUALIFIER,
                KEY_META_CF,
                KEY_META_CELLS_TOTAL,
                "a",
                KEY_META_CELLS_CF,
                KEY_EVENT_VERSION,
            ]
        );
        assert_eq!(payload[KEY_META_TABLE], json!("ns:t"));
        assert_eq!(payload[KEY_META_CELLS_TOTAL], json!(2));
        assert_eq!(payload[KEY_META_CELLS_CF], json!(1));
    }

    #[test]
    fn test_wal_meta_only_when_non_negative() {
        let cells: Vec<Cell> = vec![];
        let refs: Vec<&Cell> = cells.iter().collect();
        let assembler = assembler(
            EndpointConfig::builder()
                .include_wal_meta(true)
                .include_rowkey(false),
        );
        let table = TableName::new("ns", "t");

        let payload = assembler
            .build(&ValueDecoder::raw(), &table, &refs, None, Some(42), Some(-1))
            .unwrap();
        assert_eq!(payload[KEY_META_WAL_SEQ], json!(42));
        assert!(!payload.contains_key(KEY_META_WAL_WRITE_TIME));

        let payload = assembler
            .build(&ValueDecoder::raw(), &table, &refs, None, None, Some(7))
            .unwrap();
        assert!(!payload.contains_key(KEY_META_WAL_SEQ));
        assert_eq!(payload[KEY_META_WAL_WRITE_TIME], json!(7));
    }

    #[test]
    fn test_serialize_nulls_keeps_null_columns() {
        use crate::schema::SchemaRegistry;
        use std::sync::Arc;

        let registry =
            Arc::new(SchemaRegistry::from_json(r#"{"t":{"columns":{"v":"BIGINT"}}}"#));
        let decoder = ValueDecoder::typed(registry);
        // Empty value bytes are the wire form of NULL for the typed decoder.
        let cells = vec![Cell::put(
            b"r".to_vec(),
            b"0".to_vec(),
            b"v".to_vec(),
            Vec::new(),
            10,
        )];
        let refs: Vec<&Cell> = cells.iter().collect();
        let table = TableName::new("", "t");

        let without = bare_assembler()
            .build(&decoder, &table, &refs, None, None, None)
            .unwrap();
        assert!(!without.contains_key("v"));

        let with = assembler(
            EndpointConfig::builder()
                .serialize_nulls(true)
                .include_rowkey(false),
        )
        .build(&decoder, &table, &refs, None, None, None)
        .unwrap();
        assert_eq!(with["v"], Value::Null);
    }
}
