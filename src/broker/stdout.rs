//! Standard output producer for local runs and debugging

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::debug;

use crate::broker::{BrokerError, DeliveryHandle, RecordMetadata, RecordProducer};

/// Producer that prints each record and acknowledges it immediately
///
/// Offsets are a single process-local sequence; partition is always 0.
pub struct StdoutProducer {
    enabled: bool,
    closed: AtomicBool,
    next_offset: AtomicI64,
}

impl StdoutProducer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            closed: AtomicBool::new(false),
            next_offset: AtomicI64::new(0),
        }
    }

    /// A producer that acknowledges without printing.
    pub fn new_silent() -> Self {
        Self {
            enabled: false,
            closed: AtomicBool::new(false),
            next_offset: AtomicI64::new(0),
        }
    }
}

impl Default for StdoutProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordProducer for StdoutProducer {
    fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> DeliveryHandle {
        if self.closed.load(Ordering::Acquire) {
            return DeliveryHandle::resolved(Err(BrokerError::Closed));
        }

        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
        if self.enabled {
            let mut stdout = io::stdout();
            let _ = writeln!(
                stdout,
                "{}@{} key={} {}",
                topic,
                offset,
                hex::encode(key),
                String::from_utf8_lossy(value)
            );
            let _ = stdout.flush();
        }

        DeliveryHandle::resolved(Ok(RecordMetadata {
            topic: topic.to_string(),
            partition: 0,
            offset,
        }))
    }

    fn flush(&self) {}

    fn close(&self) {
        debug!("Closing stdout producer");
        self.closed.store(true, Ordering::Release);
    }
}
