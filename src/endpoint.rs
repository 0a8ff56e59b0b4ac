//! The replication endpoint
//!
//! Lifecycle and the per-batch main loop. The host framework constructs the
//! endpoint once via [`ReplicationEndpoint::init`], then calls `start`,
//! `replicate` per WAL batch and finally `stop`. `replicate` returns `true`
//! to acknowledge a batch; anything that could lose data if acknowledged
//! (decode failures, flush failures, timeouts) returns `false` so the host
//! re-submits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BatchSender, BrokerAdmin, RecordProducer, TopicEnsurer};
use crate::config::{ConfigMap, DecodeMode, EndpointConfig};
use crate::decode::ValueDecoder;
use crate::errors::{EndpointError, EndpointResult};
use crate::payload::PayloadAssembler;
use crate::schema::SchemaRegistry;
use crate::types::{Cell, RowKeyView, WalBatch};

/// What the host hands over at `init`: the configuration map plus the broker
/// clients it has built for this endpoint.
pub struct HostContext {
    config: ConfigMap,
    producer: Arc<dyn RecordProducer>,
    admin: Option<Arc<dyn BrokerAdmin>>,
}

impl HostContext {
    pub fn new(config: ConfigMap, producer: Arc<dyn RecordProducer>) -> Self {
        Self {
            config,
            producer,
            admin: None,
        }
    }

    pub fn with_admin(mut self, admin: Arc<dyn BrokerAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn configuration(&self) -> &ConfigMap {
        &self.config
    }
}

#[derive(Default)]
struct EndpointCounters {
    batches_total: AtomicU64,
    batches_failed: AtomicU64,
    entries_total: AtomicU64,
    rows_published: AtomicU64,
    bytes_published: AtomicU64,
}

/// Point-in-time view of the endpoint's publication counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointMetrics {
    pub batches_total: u64,
    pub batches_failed: u64,
    pub entries_total: u64,
    pub rows_published: u64,
    pub bytes_published: u64,
}

/// Replication endpoint publishing WAL edits as JSON events
pub struct ReplicationEndpoint {
    config: EndpointConfig,
    producer: Arc<dyn RecordProducer>,
    decoder: ValueDecoder,
    schema: Option<Arc<SchemaRegistry>>,
    assembler: PayloadAssembler,
    ensurer: Option<TopicEnsurer>,
    counters: EndpointCounters,
    peer_id: Uuid,
    started: AtomicBool,
}

impl ReplicationEndpoint {
    /// Build the endpoint from the host context. Fails fast on configuration
    /// problems; schema problems do not fail here (an unreadable schema file
    /// yields an empty registry and warnings).
    pub fn init(context: &HostContext) -> EndpointResult<Self> {
        let config = EndpointConfig::from_map(context.configuration())?;

        let (decoder, schema) = match config.decode_mode {
            DecodeMode::Raw => (ValueDecoder::raw(), None),
            DecodeMode::Typed => {
                let path = config.schema_path.as_deref().ok_or_else(|| {
                    EndpointError::config("typed decoding requires a schema path")
                })?;
                let registry = Arc::new(SchemaRegistry::load(path));
                (ValueDecoder::typed(Arc::clone(&registry)), Some(registry))
            }
        };

        let ensurer = if config.topic_ensure {
            match &context.admin {
                Some(admin) => Some(TopicEnsurer::from_config(&config, Arc::clone(admin))),
                None => {
                    return Err(EndpointError::config(
                        "topic.ensure is enabled but no admin client was provided",
                    ));
                }
            }
        } else {
            None
        };

        info!(
            "Replication endpoint initialized: family '{}', topic pattern '{}', {} decoding, ensure={}",
            String::from_utf8_lossy(&config.family),
            config.topic_pattern,
            match config.decode_mode {
                DecodeMode::Raw => "raw",
                DecodeMode::Typed => "typed",
            },
            config.topic_ensure
        );

        Ok(Self {
            assembler: PayloadAssembler::from_config(&config),
            producer: Arc::clone(&context.producer),
            decoder,
            schema,
            ensurer,
            counters: EndpointCounters::default(),
            peer_id: Uuid::new_v4(),
            started: AtomicBool::new(false),
            config,
        })
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        info!("Replication endpoint started");
    }

    /// Best-effort flush, then release the producer and the admin client.
    /// Per-batch senders are already drained when their batch ends, so only
    /// the producer's own buffers remain.
    pub async fn stop(&self) {
        self.producer.flush();
        self.producer.close();
        if let Some(ensurer) = &self.ensurer {
            ensurer.close().await;
        }
        self.started.store(false, Ordering::Release);
        let metrics = self.metrics();
        info!(
            "Replication endpoint stopped: {} rows ({} bytes) over {} batches, {} batches failed",
            metrics.rows_published,
            metrics.bytes_published,
            metrics.batches_total,
            metrics.batches_failed
        );
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn peer_uuid(&self) -> Option<Uuid> {
        Some(self.peer_id)
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn metrics(&self) -> EndpointMetrics {
        EndpointMetrics {
            batches_total: self.counters.batches_total.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            entries_total: self.counters.entries_total.load(Ordering::Relaxed),
            rows_published: self.counters.rows_published.load(Ordering::Relaxed),
            bytes_published: self.counters.bytes_published.load(Ordering::Relaxed),
        }
    }

    /// Reload the schema registry, when one is attached.
    pub fn refresh_schema(&self) {
        if let Some(schema) = &self.schema {
            schema.refresh();
        }
    }

    /// Process one batch of WAL entries. A fresh pending sender is scoped to
    /// the invocation and strictly flushed before it is released; `true`
    /// acknowledges the batch, `false` asks the host to resubmit it.
    pub async fn replicate(&self, batch: &WalBatch) -> bool {
        let mut sender = match BatchSender::from_config(&self.config) {
            Ok(sender) => sender,
            Err(e) => {
                warn!("Could not set up the pending-send buffer: {}", e);
                return false;
            }
        };
        self.counters.batches_total.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process_batch(&mut sender, batch).await;
        let flushed = sender.flush().await;

        let acknowledged = match (outcome, flushed) {
            (Ok(()), Ok(())) => true,
            (Err(e), _) => {
                warn!("Replication batch failed, asking the host to retry: {}", e);
                false
            }
            (Ok(()), Err(e)) => {
                warn!("Batch-end flush failed, asking the host to retry: {}", e);
                false
            }
        };
        if !acknowledged {
            self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
        acknowledged
    }

    async fn process_batch(
        &self,
        sender: &mut BatchSender,
        batch: &WalBatch,
    ) -> EndpointResult<()> {
        let mut last_ensured: Option<String> = None;

        for entry in &batch.entries {
            self.counters.entries_total.fetch_add(1, Ordering::Relaxed);
            let topic = self.config.topic_for(&entry.table);

            if let Some(ensurer) = &self.ensurer {
                if last_ensured.as_deref() != Some(topic.as_str()) {
                    // Ensure failures never fail the batch.
                    if !ensurer.ensure(&topic).await {
                        debug!("Topic '{}' not confirmed, publishing anyway", topic);
                    }
                    last_ensured = Some(topic.clone());
                }
            }

            let grouped = group_by_row(&entry.cells);
            for (row_key, cells) in &grouped {
                if let Some(min_ts) = self.config.wal_min_timestamp {
                    if !self.row_passes_filter(cells, min_ts) {
                        continue;
                    }
                }

                let payload = self.assembler.build(
                    &self.decoder,
                    &entry.table,
                    cells,
                    Some(row_key),
                    entry.sequence_id,
                    entry.write_time,
                )?;
                let value = serde_json::to_vec(&payload)?;
                let handle = self.producer.send(&topic, row_key.as_slice(), &value);
                self.counters.rows_published.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_published
                    .fetch_add(value.len() as u64, Ordering::Relaxed);
                sender.add(handle).await;
            }
        }

        Ok(())
    }

    /// A row survives the WAL-timestamp filter when at least one cell of the
    /// target family is at or past the threshold.
    fn row_passes_filter(&self, cells: &[&Cell], min_ts: i64) -> bool {
        cells.iter().any(|cell| {
            cell.family() == self.config.family.as_slice() && cell.timestamp() >= min_ts
        })
    }
}

/// Group an entry's cells by row key, preserving first-appearance order.
/// The views borrow the cell buffers, so nothing is copied here.
fn group_by_row(cells: &[Cell]) -> IndexMap<RowKeyView<'_>, Vec<&Cell>> {
    let mut grouped: IndexMap<RowKeyView<'_>, Vec<&Cell>> =
        IndexMap::with_capacity(cells.len());
    for cell in cells {
        grouped
            .entry(RowKeyView::whole(cell.row()))
            .or_default()
            .push(cell);
    }
    grouped
}
