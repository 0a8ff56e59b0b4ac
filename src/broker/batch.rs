//! Pending-send buffer with bounded synchronization
//!
//! The sender owns the completion handles of in-flight sends and enforces a
//! periodic synchronization point: every `await_every` additions it silently
//! waits for everything pending, and at batch end the endpoint runs a strict
//! flush. One deadline covers an entire flush no matter how many handles are
//! pending, so a slow broker cannot stretch the wait per handle.
//!
//! The sender is single-owner by contract. It is not thread-safe and must
//! not be made so; concurrent producers need a channel in front of it whose
//! receiver owns the sender.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::broker::{BrokerError, DeliveryHandle};
use crate::config::EndpointConfig;
use crate::errors::{EndpointError, EndpointResult};

/// Ordered buffer of delivery handles with threshold-triggered flushing
pub struct BatchSender {
    pending: Vec<DeliveryHandle>,
    await_every: usize,
    await_timeout: Duration,
    auto_flush_suspended: bool,
    counters_enabled: bool,
    debug_on_failure: bool,
    confirmed: u64,
    flushes: u64,
    failed_flushes: u64,
}

impl BatchSender {
    pub fn new(await_every: usize, await_timeout: Duration) -> EndpointResult<Self> {
        if await_every == 0 {
            return Err(EndpointError::config("await-every must be > 0"));
        }
        if await_timeout.is_zero() {
            return Err(EndpointError::config("await-timeout must be > 0"));
        }
        Ok(Self {
            pending: Vec::new(),
            await_every,
            await_timeout,
            auto_flush_suspended: false,
            counters_enabled: false,
            debug_on_failure: false,
            confirmed: 0,
            flushes: 0,
            failed_flushes: 0,
        })
    }

    pub fn from_config(config: &EndpointConfig) -> EndpointResult<Self> {
        Ok(Self::new(
            config.await_every,
            Duration::from_millis(config.await_timeout_ms),
        )?
        .with_counters(config.batch_counters_enabled)
        .with_debug_on_failure(config.batch_debug_on_failure))
    }

    pub fn with_counters(mut self, enabled: bool) -> Self {
        self.counters_enabled = enabled;
        self
    }

    pub fn with_debug_on_failure(mut self, enabled: bool) -> Self {
        self.debug_on_failure = enabled;
        self
    }

    /// Register one handle. Crossing the threshold triggers a silent flush
    /// unless a previous silent flush failed and suspended auto-flushing.
    pub async fn add(&mut self, handle: DeliveryHandle) {
        self.pending.push(handle);
        if self.pending.len() >= self.await_every && !self.auto_flush_suspended {
            self.try_flush().await;
        }
    }

    /// Register a batch of handles, flushing silently at each threshold
    /// crossing. The trailing remainder below the threshold stays buffered.
    /// Behavior is identical to the same sequence of [`add`] calls.
    ///
    /// [`add`]: BatchSender::add
    pub async fn add_all(&mut self, handles: impl IntoIterator<Item = DeliveryHandle>) {
        let handles = handles.into_iter();
        self.pending.reserve(handles.size_hint().0);

        let mut until_threshold = self.next_threshold_distance();
        for handle in handles {
            self.pending.push(handle);
            until_threshold -= 1;
            if until_threshold > 0 {
                continue;
            }
            if !self.auto_flush_suspended {
                self.try_flush().await;
            }
            until_threshold = self.next_threshold_distance();
        }
    }

    /// Strict flush: wait for every pending handle under one deadline. On
    /// failure the error propagates and the buffer is left intact, so the
    /// caller can report the batch as retriable.
    pub async fn flush(&mut self) -> Result<(), BrokerError> {
        match self.await_all().await {
            Ok(confirmed) => {
                self.complete_flush(confirmed);
                Ok(())
            }
            Err((_, error)) => Err(error),
        }
    }

    /// Silent flush: same waiting semantics as [`flush`], reported as a
    /// boolean. A failure suspends auto-flushing until a flush succeeds.
    ///
    /// [`flush`]: BatchSender::flush
    pub async fn try_flush(&mut self) -> bool {
        match self.await_all().await {
            Ok(confirmed) => {
                self.complete_flush(confirmed);
                true
            }
            Err((position, error)) => {
                self.auto_flush_suspended = true;
                if self.counters_enabled {
                    self.failed_flushes += 1;
                }
                if self.debug_on_failure {
                    debug!(
                        "Silent flush failed at handle {}/{}: {}",
                        position + 1,
                        self.pending.len(),
                        error
                    );
                }
                false
            }
        }
    }

    /// Diagnostic walk: how many handles confirmed before the first failure,
    /// and that failure if there was one. Leaves the buffer and the counters
    /// untouched.
    pub async fn flush_up_to_first_failure(&mut self) -> (usize, Option<BrokerError>) {
        match self.await_all().await {
            Ok(confirmed) => (confirmed, None),
            Err((position, error)) => (position, Some(error)),
        }
    }

    /// Strict flush; the terminal synchronization point.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.flush().await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn await_every(&self) -> usize {
        self.await_every
    }

    pub fn await_timeout(&self) -> Duration {
        self.await_timeout
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes
    }

    pub fn is_auto_flush_suspended(&self) -> bool {
        self.auto_flush_suspended
    }

    pub fn counters_enabled(&self) -> bool {
        self.counters_enabled
    }

    pub fn debug_on_failure(&self) -> bool {
        self.debug_on_failure
    }

    /// Await every pending handle against one shared deadline. `Ok` carries
    /// the confirmed count; `Err` carries the failing position and error.
    /// A wait whose remaining time hits zero fails without touching the
    /// underlying handle.
    async fn await_all(&mut self) -> Result<usize, (usize, BrokerError)> {
        let deadline = Instant::now() + self.await_timeout;
        for (position, handle) in self.pending.iter_mut().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err((position, BrokerError::AwaitTimeout));
            }
            if let Err(error) = handle.wait(remaining).await {
                return Err((position, error));
            }
        }
        Ok(self.pending.len())
    }

    fn complete_flush(&mut self, confirmed: usize) {
        self.pending.clear();
        self.auto_flush_suspended = false;
        if self.counters_enabled {
            self.confirmed += confirmed as u64;
            self.flushes += 1;
        }
    }

    fn next_threshold_distance(&self) -> usize {
        self.await_every.saturating_sub(self.pending.len()).max(1)
    }
}
