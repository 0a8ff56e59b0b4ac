//! End-to-end tests: WAL batches in, JSON records out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use wal2kafka::{
    AdminError, BrokerAdmin, BrokerError, Cell, ConfigMap, DeliveryHandle, HostContext,
    NewTopic, RecordMetadata, RecordProducer, ReplicationEndpoint, TableName,
    TopicDescription, WalBatch, WalEntry,
};

#[derive(Debug, Clone)]
struct SentRecord {
    topic: String,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl SentRecord {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.value).expect("record value is JSON")
    }
}

/// Producer capturing every record; acknowledges immediately unless failing.
#[derive(Default)]
struct MemoryProducer {
    records: Mutex<Vec<SentRecord>>,
    failing: AtomicBool,
}

impl MemoryProducer {
    fn records(&self) -> Vec<SentRecord> {
        self.records.lock().clone()
    }

    fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl RecordProducer for MemoryProducer {
    fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> DeliveryHandle {
        if self.failing.load(Ordering::Acquire) {
            return DeliveryHandle::resolved(Err(BrokerError::Rejected(
                "broker unavailable".to_string(),
            )));
        }
        let mut records = self.records.lock();
        let offset = records.len() as i64;
        records.push(SentRecord {
            topic: topic.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        DeliveryHandle::resolved(Ok(RecordMetadata {
            topic: topic.to_string(),
            partition: 0,
            offset,
        }))
    }

    fn flush(&self) {}

    fn close(&self) {}
}

/// Admin where nothing exists yet; creation always succeeds.
#[derive(Default)]
struct MemoryAdmin {
    described: Mutex<Vec<String>>,
    created: Mutex<Vec<String>>,
}

#[async_trait]
impl BrokerAdmin for MemoryAdmin {
    async fn describe_topics(
        &self,
        topics: &[String],
        _timeout: Duration,
    ) -> HashMap<String, Result<TopicDescription, AdminError>> {
        self.described.lock().extend(topics.iter().cloned());
        topics
            .iter()
            .map(|t| (t.clone(), Err(AdminError::UnknownTopicOrPartition)))
            .collect()
    }

    async fn create_topics(
        &self,
        requests: &[NewTopic],
        _timeout: Duration,
    ) -> HashMap<String, Result<(), AdminError>> {
        self.created
            .lock()
            .extend(requests.iter().map(|r| r.name.clone()));
        requests.iter().map(|r| (r.name.clone(), Ok(()))).collect()
    }

    async fn close(&self, _timeout: Duration) {}
}

fn base_config() -> ConfigMap {
    let mut config = ConfigMap::new();
    config.set("broker.bootstrap", "localhost:9092");
    config.set("payload.include-rowkey", "false");
    config
}

fn endpoint_with(
    config: ConfigMap,
) -> (Arc<MemoryProducer>, ReplicationEndpoint) {
    let producer = Arc::new(MemoryProducer::default());
    let context = HostContext::new(config, Arc::clone(&producer) as Arc<dyn RecordProducer>);
    let endpoint = ReplicationEndpoint::init(&context).unwrap();
    endpoint.start();
    (producer, endpoint)
}

fn single_cell_batch() -> WalBatch {
    let cell = Cell::put(
        b"row-1".to_vec(),
        b"0".to_vec(),
        b"colX".to_vec(),
        vec![1, 2, 3, 4],
        100,
    );
    WalBatch::new(vec![WalEntry::new(TableName::new("ns", "tbl"), vec![cell])])
}

#[tokio::test]
async fn test_raw_mode_publishes_row_as_json() {
    let (producer, endpoint) = endpoint_with(base_config());

    assert!(endpoint.replicate(&single_cell_batch()).await);

    let records = producer.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "ns_tbl");
    assert_eq!(records[0].key, b"row-1".to_vec());

    let payload = records[0].json();
    assert_eq!(payload["colX"], json!([1, 2, 3, 4]));
    assert_eq!(payload["event_version"], json!(100));
}

#[tokio::test]
async fn test_wal_timestamp_filter_drops_old_rows() {
    let mut config = base_config();
    config.set("filter.wal.min-ts", "200");
    let (producer, endpoint) = endpoint_with(config);

    assert!(endpoint.replicate(&single_cell_batch()).await);
    assert!(producer.records().is_empty());

    // The same batch passes with the filter off.
    let (producer, endpoint) = endpoint_with(base_config());
    assert!(endpoint.replicate(&single_cell_batch()).await);
    assert_eq!(producer.records().len(), 1);
}

#[tokio::test]
async fn test_rows_publish_in_first_appearance_order() {
    let (producer, endpoint) = endpoint_with(base_config());

    let cells = vec![
        Cell::put(b"beta".to_vec(), b"0".to_vec(), b"a".to_vec(), vec![1], 10),
        Cell::put(b"alpha".to_vec(), b"0".to_vec(), b"a".to_vec(), vec![2], 20),
        Cell::put(b"beta".to_vec(), b"0".to_vec(), b"b".to_vec(), vec![3], 30),
    ];
    let batch = WalBatch::new(vec![WalEntry::new(TableName::new("ns", "tbl"), cells)]);
    assert!(endpoint.replicate(&batch).await);

    let records = producer.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, b"beta".to_vec());
    assert_eq!(records[1].key, b"alpha".to_vec());

    // Both cells of the row land in one document.
    let beta = records[0].json();
    assert_eq!(beta["a"], json!([1]));
    assert_eq!(beta["b"], json!([3]));
    assert_eq!(beta["event_version"], json!(30));
}

#[tokio::test]
async fn test_entries_for_different_tables_go_to_their_topics() {
    let (producer, endpoint) = endpoint_with(base_config());

    let entry = |table: TableName| {
        WalEntry::new(
            table,
            vec![Cell::put(
                b"r".to_vec(),
                b"0".to_vec(),
                b"q".to_vec(),
                vec![1],
                1,
            )],
        )
    };
    let batch = WalBatch::new(vec![
        entry(TableName::new("ns", "orders")),
        entry(TableName::new("ns", "users")),
    ]);
    assert!(endpoint.replicate(&batch).await);

    let topics: Vec<String> = producer.records().iter().map(|r| r.topic.clone()).collect();
    assert_eq!(topics, vec!["ns_orders".to_string(), "ns_users".to_string()]);
}

#[tokio::test]
async fn test_tombstone_row_carries_delete_flag() {
    let (producer, endpoint) = endpoint_with(base_config());

    let cells = vec![
        Cell::put(b"r".to_vec(), b"0".to_vec(), b"kept".to_vec(), vec![1], 10),
        Cell::tombstone(b"r".to_vec(), b"0".to_vec(), b"gone".to_vec(), 99),
    ];
    let batch = WalBatch::new(vec![WalEntry::new(TableName::new("ns", "tbl"), cells)]);
    assert!(endpoint.replicate(&batch).await);

    let payload = producer.records()[0].json();
    assert_eq!(payload["delete"], json!(true));
    assert_eq!(payload["event_version"], json!(99));
    assert!(payload.get("gone").is_none());
}

#[tokio::test]
async fn test_rowkey_hex_included_by_default() {
    let mut config = ConfigMap::new();
    config.set("broker.bootstrap", "localhost:9092");
    let (producer, endpoint) = endpoint_with(config);

    assert!(endpoint.replicate(&single_cell_batch()).await);
    let payload = producer.records()[0].json();
    assert_eq!(payload["rowkey_hex"], json!(hex::encode(b"row-1")));
}

#[tokio::test]
async fn test_failed_delivery_reports_batch_retriable() {
    let (producer, endpoint) = endpoint_with(base_config());
    producer.fail_sends(true);

    assert!(!endpoint.replicate(&single_cell_batch()).await);

    // After the broker recovers the same batch goes through.
    producer.fail_sends(false);
    assert!(endpoint.replicate(&single_cell_batch()).await);
    assert_eq!(producer.records().len(), 1);
}

#[tokio::test]
async fn test_topic_ensured_once_per_entry_run() {
    let mut config = base_config();
    config.set("topic.ensure", "true");

    let producer = Arc::new(MemoryProducer::default());
    let admin = Arc::new(MemoryAdmin::default());
    let context = HostContext::new(config, Arc::clone(&producer) as Arc<dyn RecordProducer>)
        .with_admin(Arc::clone(&admin) as Arc<dyn BrokerAdmin>);
    let endpoint = ReplicationEndpoint::init(&context).unwrap();
    endpoint.start();

    let entry = |row: &[u8]| {
        WalEntry::new(
            TableName::new("ns", "tbl"),
            vec![Cell::put(
                row.to_vec(),
                b"0".to_vec(),
                b"q".to_vec(),
                vec![1],
                1,
            )],
        )
    };
    let batch = WalBatch::new(vec![entry(b"r1"), entry(b"r2")]);
    assert!(endpoint.replicate(&batch).await);

    // Same topic for consecutive entries: ensured once, created once.
    assert_eq!(admin.described.lock().len(), 1);
    assert_eq!(admin.created.lock().as_slice(), ["ns_tbl".to_string()]);
    assert_eq!(producer.records().len(), 2);

    // The next batch hits the ensured cache.
    assert!(endpoint.replicate(&WalBatch::new(vec![entry(b"r3")])).await);
    assert_eq!(admin.described.lock().len(), 1);
}

#[tokio::test]
async fn test_typed_mode_decodes_via_schema_file() {
    use std::io::Write;

    let mut schema = tempfile::NamedTempFile::new().unwrap();
    write!(
        schema,
        r#"{{"ns:tbl":{{"columns":{{"amount":"DECIMAL(10,2)","count":"BIGINT"}}}}}}"#
    )
    .unwrap();
    schema.flush().unwrap();

    let mut config = base_config();
    config.set("decode.mode", "typed");
    config.set("schema.path", schema.path().to_str().unwrap());
    let (producer, endpoint) = endpoint_with(config);

    let cells = vec![
        Cell::put(
            b"r".to_vec(),
            b"0".to_vec(),
            b"amount".to_vec(),
            b"12.34".to_vec(),
            5,
        ),
        Cell::put(
            b"r".to_vec(),
            b"0".to_vec(),
            b"count".to_vec(),
            42i64.to_be_bytes().to_vec(),
            7,
        ),
    ];
    let batch = WalBatch::new(vec![WalEntry::new(TableName::new("ns", "tbl"), cells)]);
    assert!(endpoint.replicate(&batch).await);

    let payload = producer.records()[0].json();
    assert_eq!(payload["amount"].to_string(), "12.34");
    assert_eq!(payload["count"], json!(42));
    assert_eq!(payload["event_version"], json!(7));
}

#[tokio::test]
async fn test_typed_mode_decode_failure_is_retriable() {
    use std::io::Write;

    let mut schema = tempfile::NamedTempFile::new().unwrap();
    write!(schema, r#"{{"ns:tbl":{{"columns":{{"count":"BIGINT"}}}}}}"#).unwrap();
    schema.flush().unwrap();

    let mut config = base_config();
    config.set("decode.mode", "typed");
    config.set("schema.path", schema.path().to_str().unwrap());
    let (producer, endpoint) = endpoint_with(config);

    // Wrong width for a BIGINT: the batch must not be acknowledged.
    let cell = Cell::put(b"r".to_vec(), b"0".to_vec(), b"count".to_vec(), vec![1, 2], 5);
    let batch = WalBatch::new(vec![WalEntry::new(TableName::new("ns", "tbl"), vec![cell])]);
    assert!(!endpoint.replicate(&batch).await);
    assert!(producer.records().is_empty());
}

#[tokio::test]
async fn test_wal_meta_fields_in_payload() {
    let mut config = base_config();
    config.set("payload.include-meta-wal", "true");
    let (producer, endpoint) = endpoint_with(config);

    let entry = WalEntry::new(
        TableName::new("ns", "tbl"),
        vec![Cell::put(
            b"r".to_vec(),
            b"0".to_vec(),
            b"q".to_vec(),
            vec![1],
            1,
        )],
    )
    .with_sequence_id(77)
    .with_write_time(1_700_000_000_000);
    assert!(endpoint.replicate(&WalBatch::new(vec![entry])).await);

    let payload = producer.records()[0].json();
    assert_eq!(payload["_wal_seq"], json!(77));
    assert_eq!(payload["_wal_write_time"], json!(1_700_000_000_000i64));
}

#[tokio::test]
async fn test_metrics_track_publication() {
    let (producer, endpoint) = endpoint_with(base_config());

    assert!(endpoint.replicate(&single_cell_batch()).await);
    producer.fail_sends(true);
    assert!(!endpoint.replicate(&single_cell_batch()).await);

    let metrics = endpoint.metrics();
    assert_eq!(metrics.batches_total, 2);
    assert_eq!(metrics.batches_failed, 1);
    assert_eq!(metrics.entries_total, 2);
    assert_eq!(metrics.rows_published, 2);
    assert!(metrics.bytes_published > 0);
}

#[tokio::test]
async fn test_stop_flushes_and_closes() {
    let (producer, endpoint) = endpoint_with(base_config());
    assert!(endpoint.replicate(&single_cell_batch()).await);
    endpoint.stop().await;
    assert!(!endpoint.is_started());
    assert_eq!(producer.records().len(), 1);
}
