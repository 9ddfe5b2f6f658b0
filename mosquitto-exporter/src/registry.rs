//! Registry of broker metrics, one entry per `$SYS` topic.
//!
//! Entries are created on the first update for a topic and live for the rest
//! of the process. Inbound broker messages reach the registry through an mpsc
//! channel drained by [`run_dispatcher`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::mapping::{
    PrometheusType, TopicClass, classify, counter_description, parse_value, translate_topic,
};

/// Label set attached to a metric, sorted by name.
pub type Labels = Vec<(String, String)>;

/// Build the label set for broker metrics.
///
/// `broker` is always present; default labels never override it.
pub fn broker_labels(broker_host: &str, default_labels: &HashMap<String, String>) -> Labels {
    let mut labels = Vec::with_capacity(1 + default_labels.len());
    labels.push(("broker".to_string(), broker_host.to_string()));

    for (k, v) in default_labels {
        if !labels.iter().any(|(lk, _)| lk == k) {
            labels.push((k.clone(), v.clone()));
        }
    }

    labels.sort_by(|a, b| a.0.cmp(&b.0));
    labels
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Build a message from a raw publish payload, decoding it lossily.
    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload))
    }
}

/// One exported metric.
#[derive(Debug, Clone)]
pub struct MetricEntry {
    /// Prometheus metric name, derived from the topic.
    pub name: String,
    /// The topic this metric tracks.
    pub topic: String,
    /// HELP text.
    pub help: String,
    pub metric_type: PrometheusType,
    pub value: f64,
    pub labels: Labels,
}

impl MetricEntry {
    fn new(topic: &str, metric_type: PrometheusType, labels: &[(String, String)]) -> Self {
        let help = match metric_type {
            PrometheusType::Counter => counter_description(topic).unwrap_or(topic).to_string(),
            PrometheusType::Gauge => topic.to_string(),
        };

        Self {
            name: translate_topic(topic),
            topic: topic.to_string(),
            help,
            metric_type,
            value: 0.0,
            labels: labels.to_vec(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Total broker messages processed.
    pub messages_received: u64,
    /// Messages dropped because their topic is ignored.
    pub messages_ignored: u64,
    /// Gauge updates applied.
    pub gauge_updates: u64,
    /// Counter updates applied.
    pub counter_updates: u64,
}

/// Thread-safe registry of broker metrics keyed by topic.
pub struct MetricRegistry {
    entries: RwLock<HashMap<String, MetricEntry>>,
    /// Labels applied by [`MetricRegistry::process_update`].
    labels: Labels,
    stats: RwLock<RegistryStats>,
}

impl MetricRegistry {
    /// Create an empty registry whose routed updates carry `labels`.
    pub fn new(labels: Labels) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            labels,
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// Classify a broker message and record it.
    pub fn process_update(&self, topic: &str, payload: &str) -> TopicClass {
        self.stats.write().messages_received += 1;

        let class = classify(topic);
        match class {
            TopicClass::Ignored => {
                self.stats.write().messages_ignored += 1;
                trace!(topic, payload, "Ignoring metric");
            }
            TopicClass::Counter => {
                trace!(topic, payload, "Processing counter metric");
                self.record_counter(topic, payload, &self.labels);
            }
            TopicClass::Gauge => {
                trace!(topic, payload, "Processing gauge metric");
                self.record_gauge(topic, payload, &self.labels);
            }
        }
        class
    }

    /// Set a gauge from a payload, creating it on first sight.
    pub fn record_gauge(&self, topic: &str, payload: &str, labels: &[(String, String)]) -> f64 {
        let value = self.record(topic, PrometheusType::Gauge, payload, labels);
        self.stats.write().gauge_updates += 1;
        value
    }

    /// Set a counter from a payload, creating it on first sight.
    ///
    /// The broker publishes running totals, so the payload replaces the value.
    pub fn record_counter(&self, topic: &str, payload: &str, labels: &[(String, String)]) -> f64 {
        let value = self.record(topic, PrometheusType::Counter, payload, labels);
        self.stats.write().counter_updates += 1;
        value
    }

    fn record(
        &self,
        topic: &str,
        metric_type: PrometheusType,
        payload: &str,
        labels: &[(String, String)],
    ) -> f64 {
        let value = parse_value(payload);

        let mut entries = self.entries.write();
        let entry = entries.entry(topic.to_string()).or_insert_with(|| {
            let entry = MetricEntry::new(topic, metric_type, labels);
            debug!(
                topic,
                name = %entry.name,
                kind = entry.metric_type.as_str(),
                "Registered metric"
            );
            entry
        });
        entry.value = value;

        value
    }

    /// Get a copy of the entry for a topic.
    pub fn get(&self, topic: &str) -> Option<MetricEntry> {
        self.entries.read().get(topic).cloned()
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy every entry, sorted by metric name then topic.
    pub fn snapshot(&self) -> Vec<MetricEntry> {
        let mut entries: Vec<MetricEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.topic.cmp(&b.topic)));
        entries
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

/// Feed broker messages into the registry until every sender is dropped.
pub async fn run_dispatcher(registry: SharedRegistry, mut messages: mpsc::Receiver<BrokerMessage>) {
    while let Some(message) = messages.recv().await {
        registry.process_update(&message.topic, &message.payload);
    }

    let stats = registry.stats();
    info!(
        messages_received = stats.messages_received,
        metrics = registry.len(),
        "Dispatcher stopped"
    );
}
