//! Broker-facing interfaces
//!
//! The endpoint consumes a partitioned-log broker through two traits: a
//! producer that hands back a completion handle per send, and an admin client
//! for topic description and creation. Concrete clients live outside this
//! crate; the stdout producer in this module tree exists for the replay
//! binary and local smoke runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod batch;
pub mod ensure;
pub mod stdout;

pub use batch::BatchSender;
pub use ensure::TopicEnsurer;

/// Where a record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Errors surfaced by the producer side of the broker client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("send rejected by broker: {0}")]
    Rejected(String),

    #[error("delivery wait timed out")]
    AwaitTimeout,

    #[error("delivery canceled before acknowledgment")]
    Canceled,

    #[error("producer is closed")]
    Closed,
}

/// Errors surfaced by the admin side of the broker client
///
/// `UnknownTopicOrPartition` and `TopicAlreadyExists` carry semantics of
/// their own and must stay distinguishable from generic failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,

    #[error("topic already exists")]
    TopicAlreadyExists,

    #[error("admin call timed out after {0} ms")]
    Timeout(u64),

    #[error("admin failure: {0}")]
    Other(String),
}

/// Outcome of one delivery
pub type DeliveryResult = Result<RecordMetadata, BrokerError>;

enum HandleState {
    Pending(oneshot::Receiver<DeliveryResult>),
    Done(DeliveryResult),
}

/// Completion handle for one in-flight send
///
/// The handle can be awaited repeatedly: once resolved (including resolved
/// into an error) the outcome is retained, so a failed flush can re-inspect
/// the same handles later. A wait that runs out of time leaves the handle
/// pending.
pub struct DeliveryHandle {
    state: HandleState,
}

impl DeliveryHandle {
    /// Handle plus the sender half a producer completes it with.
    pub fn channel() -> (oneshot::Sender<DeliveryResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: HandleState::Pending(rx),
            },
        )
    }

    /// A handle that is already resolved, for producers that acknowledge
    /// synchronously.
    pub fn resolved(result: DeliveryResult) -> Self {
        Self {
            state: HandleState::Done(result),
        }
    }

    /// Wait for the delivery outcome, at most `timeout`.
    pub async fn wait(&mut self, timeout: Duration) -> DeliveryResult {
        match &mut self.state {
            HandleState::Done(result) => result.clone(),
            HandleState::Pending(rx) => {
                match tokio::time::timeout(timeout, &mut *rx).await {
                    Err(_) => Err(BrokerError::AwaitTimeout),
                    Ok(received) => {
                        // A dropped sender means the producer abandoned the
                        // record; treat it as a cancellation.
                        let result = received.unwrap_or(Err(BrokerError::Canceled));
                        self.state = HandleState::Done(result.clone());
                        result
                    }
                }
            }
        }
    }

    /// Whether the outcome is already known.
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, HandleState::Done(_))
    }
}

/// The producer half of the broker client
pub trait RecordProducer: Send + Sync {
    /// Submit one record; the key is partitioning input and travels as-is.
    fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> DeliveryHandle;

    /// Ask the client to push everything it has buffered.
    fn flush(&self);

    /// Release client resources. Idempotent.
    fn close(&self);
}

/// Requested shape of a topic to create
#[derive(Debug, Clone)]
pub struct NewTopic {
    pub name: String,
    pub partitions: i32,
    pub replication: i16,
    pub configs: Vec<(String, String)>,
}

/// Description of an existing topic
#[derive(Debug, Clone)]
pub struct TopicDescription {
    pub name: String,
    pub partitions: i32,
}

/// The admin half of the broker client
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Describe each topic; per-topic outcomes.
    async fn describe_topics(
        &self,
        topics: &[String],
        timeout: Duration,
    ) -> HashMap<String, Result<TopicDescription, AdminError>>;

    /// Create each topic; per-topic outcomes.
    async fn create_topics(
        &self,
        requests: &[NewTopic],
        timeout: Duration,
    ) -> HashMap<String, Result<(), AdminError>>;

    /// Release the admin client, waiting at most `timeout`.
    async fn close(&self, timeout: Duration);
}
