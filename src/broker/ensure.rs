//! Topic existence management
//!
//! Ensures broker topics exist before records are published at them. Every
//! confirmed topic is cached for the process lifetime; ambiguous admin
//! outcomes (timeouts, transport failures) put the topic into a jittered
//! cool-down so a flapping broker is not hammered with describe calls.
//! Creation races are expected: a concurrent creator winning the race counts
//! as success here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{AdminError, BrokerAdmin, NewTopic};
use crate::config::EndpointConfig;

/// Broker-mandated topic name length limit.
const MAX_TOPIC_NAME_LEN: usize = 249;

/// Config keys worth naming in the creation log line.
const SUMMARY_KEYS: [&str; 4] = [
    "retention.ms",
    "cleanup.policy",
    "compression.type",
    "min.insync.replicas",
];

/// Whether `name` is a name the broker will accept.
pub fn is_valid_topic_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_TOPIC_NAME_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// Uniform sample in `[0, bound)` from the OS generator, with rejection to
/// avoid modulo bias on narrow ranges.
fn sample_below(bound: u64) -> u64 {
    debug_assert!(bound > 0);
    let zone = u64::MAX - u64::MAX % bound;
    loop {
        let v = OsRng.next_u64();
        if v < zone {
            return v % bound;
        }
    }
}

#[derive(Default)]
struct EnsureCounters {
    invocations: AtomicU64,
    cache_hits: AtomicU64,
    exists_true: AtomicU64,
    exists_false: AtomicU64,
    exists_unknown: AtomicU64,
    create_ok: AtomicU64,
    create_race: AtomicU64,
    create_fail: AtomicU64,
}

/// Point-in-time view of the ensure counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureCounterSnapshot {
    pub invocations: u64,
    pub cache_hits: u64,
    pub exists_true: u64,
    pub exists_false: u64,
    pub exists_unknown: u64,
    pub create_ok: u64,
    pub create_race: u64,
    pub create_fail: u64,
}

/// Idempotent topic existence checks and creation against the admin client
pub struct TopicEnsurer {
    admin: Arc<dyn BrokerAdmin>,
    partitions: i32,
    replication: i16,
    topic_configs: Vec<(String, String)>,
    admin_timeout: Duration,
    unknown_backoff: Duration,
    ensured: RwLock<HashSet<String>>,
    unknown_until: Mutex<HashMap<String, Instant>>,
    counters: EnsureCounters,
}

impl TopicEnsurer {
    pub fn new(
        admin: Arc<dyn BrokerAdmin>,
        partitions: i32,
        replication: i16,
        topic_configs: Vec<(String, String)>,
        admin_timeout: Duration,
        unknown_backoff: Duration,
    ) -> Self {
        Self {
            admin,
            partitions,
            replication,
            topic_configs,
            admin_timeout,
            unknown_backoff,
            ensured: RwLock::new(HashSet::new()),
            unknown_until: Mutex::new(HashMap::new()),
            counters: EnsureCounters::default(),
        }
    }

    pub fn from_config(config: &EndpointConfig, admin: Arc<dyn BrokerAdmin>) -> Self {
        Self::new(
            admin,
            config.topic_partitions,
            config.topic_replication,
            config
                .topic_configs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Duration::from_millis(config.admin_timeout_ms),
            Duration::from_millis(config.unknown_backoff_ms),
        )
    }

    /// Ensure one topic exists. Returns whether the topic is known to exist
    /// after this call; failures are absorbed (logged and counted), never
    /// propagated.
    pub async fn ensure(&self, topic: &str) -> bool {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let topic = topic.trim();
        if !is_valid_topic_name(topic) {
            warn!("Refusing to ensure invalid topic name '{}'", topic);
            return false;
        }

        if self.ensured.read().contains(topic) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if self.in_unknown_backoff(topic) {
            debug!("Topic '{}' is in unknown-backoff, skipping ensure", topic);
            return false;
        }

        let outcome = self
            .admin
            .describe_topics(std::slice::from_ref(&topic.to_string()), self.admin_timeout)
            .await
            .remove(topic);

        match outcome {
            Some(Ok(_)) => {
                self.counters.exists_true.fetch_add(1, Ordering::Relaxed);
                self.mark_ensured(topic);
                true
            }
            Some(Err(AdminError::UnknownTopicOrPartition)) => {
                self.counters.exists_false.fetch_add(1, Ordering::Relaxed);
                self.create(topic).await
            }
            other => {
                self.counters.exists_unknown.fetch_add(1, Ordering::Relaxed);
                self.enter_unknown_backoff(topic, describe_failure(other));
                false
            }
        }
    }

    /// Batched variant: one describe for everything not cached, one create
    /// for everything missing.
    pub async fn ensure_all<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut to_check: Vec<String> = Vec::new();
        for topic in topics {
            self.counters.invocations.fetch_add(1, Ordering::Relaxed);
            let topic = topic.as_ref().trim();
            if !is_valid_topic_name(topic) {
                warn!("Refusing to ensure invalid topic name '{}'", topic);
                continue;
            }
            if self.ensured.read().contains(topic) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if self.in_unknown_backoff(topic) {
                debug!("Topic '{}' is in unknown-backoff, skipping ensure", topic);
                continue;
            }
            if !to_check.iter().any(|t| t == topic) {
                to_check.push(topic.to_string());
            }
        }
        if to_check.is_empty() {
            return;
        }

        let mut outcomes = self
            .admin
            .describe_topics(&to_check, self.admin_timeout)
            .await;

        let mut missing: Vec<String> = Vec::new();
        for topic in &to_check {
            match outcomes.remove(topic) {
                Some(Ok(_)) => {
                    self.counters.exists_true.fetch_add(1, Ordering::Relaxed);
                    self.mark_ensured(topic);
                }
                Some(Err(AdminError::UnknownTopicOrPartition)) => {
                    self.counters.exists_false.fetch_add(1, Ordering::Relaxed);
                    missing.push(topic.clone());
                }
                other => {
                    self.counters.exists_unknown.fetch_add(1, Ordering::Relaxed);
                    self.enter_unknown_backoff(topic, describe_failure(other));
                }
            }
        }
        if missing.is_empty() {
            return;
        }

        let requests: Vec<NewTopic> = missing.iter().map(|t| self.new_topic(t)).collect();
        let mut created = self
            .admin
            .create_topics(&requests, self.admin_timeout)
            .await;
        for topic in &missing {
            self.record_create_outcome(topic, created.remove(topic));
        }
    }

    /// Release the admin client.
    pub async fn close(&self) {
        self.admin.close(self.admin_timeout).await;
    }

    pub fn counters(&self) -> EnsureCounterSnapshot {
        EnsureCounterSnapshot {
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            exists_true: self.counters.exists_true.load(Ordering::Relaxed),
            exists_false: self.counters.exists_false.load(Ordering::Relaxed),
            exists_unknown: self.counters.exists_unknown.load(Ordering::Relaxed),
            create_ok: self.counters.create_ok.load(Ordering::Relaxed),
            create_race: self.counters.create_race.load(Ordering::Relaxed),
            create_fail: self.counters.create_fail.load(Ordering::Relaxed),
        }
    }

    pub fn is_ensured(&self, topic: &str) -> bool {
        self.ensured.read().contains(topic)
    }

    async fn create(&self, topic: &str) -> bool {
        let request = self.new_topic(topic);
        let outcome = self
            .admin
            .create_topics(std::slice::from_ref(&request), self.admin_timeout)
            .await
            .remove(topic);
        self.record_create_outcome(topic, outcome)
    }

    fn record_create_outcome(
        &self,
        topic: &str,
        outcome: Option<Result<(), AdminError>>,
    ) -> bool {
        match outcome {
            Some(Ok(())) => {
                self.counters.create_ok.fetch_add(1, Ordering::Relaxed);
                self.mark_ensured(topic);
                info!(
                    "Created topic '{}' with partitions={} replication={}{}",
                    topic,
                    self.partitions,
                    self.replication,
                    self.config_summary()
                );
                true
            }
            Some(Err(AdminError::TopicAlreadyExists)) => {
                // Lost the creation race; someone else got there first.
                self.counters.create_race.fetch_add(1, Ordering::Relaxed);
                self.mark_ensured(topic);
                true
            }
            other => {
                self.counters.create_fail.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Failed to create topic '{}': {}",
                    topic,
                    describe_failure(other)
                );
                false
            }
        }
    }

    fn new_topic(&self, topic: &str) -> NewTopic {
        NewTopic {
            name: topic.to_string(),
            partitions: self.partitions,
            replication: self.replication,
            configs: self.topic_configs.clone(),
        }
    }

    fn mark_ensured(&self, topic: &str) {
        self.ensured.write().insert(topic.to_string());
        self.unknown_until.lock().remove(topic);
    }

    fn in_unknown_backoff(&self, topic: &str) -> bool {
        let mut backoffs = self.unknown_until.lock();
        match backoffs.get(topic) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                backoffs.remove(topic);
                false
            }
            None => false,
        }
    }

    fn enter_unknown_backoff(&self, topic: &str, reason: String) {
        let backoff = self.jittered_backoff();
        warn!(
            "Existence of topic '{}' is unknown ({}), backing off for {} ms",
            topic,
            reason,
            backoff.as_millis()
        );
        self.unknown_until
            .lock()
            .insert(topic.to_string(), Instant::now() + backoff);
    }

    /// Base backoff ±20%, jitter at least 1 ms either way.
    fn jittered_backoff(&self) -> Duration {
        let base = self.unknown_backoff.as_millis() as u64;
        let spread = (base / 5).max(1);
        let delta = sample_below(2 * spread + 1) as i64 - spread as i64;
        Duration::from_millis(base.saturating_add_signed(delta).max(1))
    }

    fn config_summary(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for key in SUMMARY_KEYS {
            if let Some((_, value)) = self.topic_configs.iter().find(|(k, _)| k == key) {
                parts.push(format!("{}={}", key, value));
            }
        }
        let extra = self.topic_configs.len() - parts.len();
        if extra > 0 {
            parts.push(format!("+{} more", extra));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" configs [{}]", parts.join(", "))
        }
    }

    #[cfg(test)]
    fn backoff_remaining(&self, topic: &str) -> Option<Duration> {
        self.unknown_until
            .lock()
            .get(topic)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

fn describe_failure(outcome: Option<Result<impl std::fmt::Debug, AdminError>>) -> String {
    match outcome {
        Some(Err(e)) => e.to_string(),
        Some(Ok(_)) => "unexpected outcome".to_string(),
        None => "no result returned".to_string(),
    }
}
