//! WAL-to-broker replication endpoint
//!
//! Plugs into a column-store database's WAL replication framework and
//! publishes each replicated row as a JSON event on a partitioned log
//! broker: one document per row key per WAL batch, keyed by the row-key
//! bytes so a row always lands in the same partition.
//!
//! The pipeline: group an entry's cells by row key without copying, decode
//! values (raw pass-through or schema-typed), assemble an insertion-ordered
//! JSON payload, publish, and synchronize on the pending delivery handles
//! with a bounded in-flight window and a strict flush at batch end.

pub mod broker;
pub mod config;
pub mod decode;
pub mod endpoint;
pub mod errors;
pub mod payload;
pub mod schema;
pub mod types;

pub use broker::{
    AdminError, BatchSender, BrokerAdmin, BrokerError, DeliveryHandle, DeliveryResult,
    NewTopic, RecordMetadata, RecordProducer, TopicDescription, TopicEnsurer,
};
pub use config::{ConfigMap, DecodeMode, EndpointConfig, RowKeyEncoding};
pub use decode::{LogicalType, RawDecoder, TypedDecoder, ValueDecoder};
pub use endpoint::{EndpointMetrics, HostContext, ReplicationEndpoint};
pub use errors::{EndpointError, EndpointResult};
pub use payload::PayloadAssembler;
pub use schema::SchemaRegistry;
pub use types::{Cell, RowKeyView, TableName, WalBatch, WalEntry};
