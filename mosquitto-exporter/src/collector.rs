//! Scrape collector that renders metrics in Prometheus exposition format.
//!
//! Every scrape emits, in order:
//! 1. the identity metric carrying the exporter version
//! 2. the samples of each [`AuxiliaryCollector`], followed by how long each took
//! 3. every broker metric held by the [`MetricRegistry`](crate::registry::MetricRegistry)

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::mapping::{PrometheusType, translate_topic};
use crate::registry::{Labels, MetricEntry, SharedRegistry};
use crate::subscriber::SharedStatus;

/// Application name used for the identity metric.
pub const APPLICATION: &str = env!("CARGO_PKG_NAME");

/// Exporter version reported by the identity metric.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A single sample ready for exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub metric_type: PrometheusType,
    pub labels: Labels,
    pub value: f64,
}

impl Sample {
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            metric_type: PrometheusType::Gauge,
            labels: Vec::new(),
            value,
        }
    }

    pub fn counter(name: impl Into<String>, help: impl Into<String>, value: f64) -> Self {
        Self {
            metric_type: PrometheusType::Counter,
            ..Self::gauge(name, help, value)
        }
    }

    /// Add a label, keeping labels sorted by name.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self.labels.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }

    /// Format labels for Prometheus exposition format.
    pub fn format_labels(&self) -> String {
        format_labels(&self.labels)
    }
}

impl From<MetricEntry> for Sample {
    fn from(entry: MetricEntry) -> Self {
        Self {
            name: entry.name,
            help: entry.help,
            metric_type: entry.metric_type,
            labels: entry.labels,
            value: entry.value,
        }
    }
}

/// Extra metrics emitted on every scrape, independent of broker state.
pub trait AuxiliaryCollector: Send + Sync {
    /// Name reported in the task timing metric.
    fn name(&self) -> &str;

    /// Produce the current samples.
    fn collect(&self) -> Vec<Sample>;
}

/// Reports the exporter's own view of the broker connection and traffic.
pub struct ExporterStatsCollector {
    registry: SharedRegistry,
    status: SharedStatus,
}

impl ExporterStatsCollector {
    pub fn new(registry: SharedRegistry, status: SharedStatus) -> Self {
        Self { registry, status }
    }
}

impl AuxiliaryCollector for ExporterStatsCollector {
    fn name(&self) -> &str {
        "exporter_stats"
    }

    fn collect(&self) -> Vec<Sample> {
        let stats = self.registry.stats();
        let prefix = translate_topic(APPLICATION);

        vec![
            Sample::gauge(
                format!("{}_broker_connected", prefix),
                "Whether the exporter is connected to the broker.",
                if self.status.is_connected() { 1.0 } else { 0.0 },
            ),
            Sample::counter(
                format!("{}_connection_attempts_total", prefix),
                "Connection attempts made to the broker.",
                self.status.attempts() as f64,
            ),
            Sample::counter(
                format!("{}_messages_received_total", prefix),
                "Broker messages received.",
                stats.messages_received as f64,
            ),
            Sample::counter(
                format!("{}_messages_ignored_total", prefix),
                "Broker messages dropped because their topic is ignored.",
                stats.messages_ignored as f64,
            ),
            Sample::gauge(
                format!("{}_metrics", prefix),
                "Broker metrics currently exported.",
                self.registry.len() as f64,
            ),
        ]
    }
}

/// Collects every sample for a scrape.
pub struct ScrapeCollector {
    registry: SharedRegistry,
    auxiliaries: Vec<Box<dyn AuxiliaryCollector>>,
}

impl ScrapeCollector {
    /// Create a collector over a registry with no auxiliary collectors.
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            auxiliaries: Vec::new(),
        }
    }

    /// Add an auxiliary collector.
    pub fn with_auxiliary(mut self, collector: impl AuxiliaryCollector + 'static) -> Self {
        self.auxiliaries.push(Box::new(collector));
        self
    }

    /// The registry backing this collector.
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// The static identity metric.
    pub fn identity() -> Sample {
        Sample::gauge(
            translate_topic(APPLICATION),
            format!("{} build information", APPLICATION),
            1.0,
        )
        .with_label("version", VERSION)
    }

    /// Gather all samples for one scrape.
    ///
    /// Returns once every auxiliary collector has finished.
    pub fn collect(&self) -> Vec<Sample> {
        let mut samples = vec![Self::identity()];
        let mut timings = Vec::with_capacity(self.auxiliaries.len());

        for auxiliary in &self.auxiliaries {
            let start = Instant::now();
            samples.extend(auxiliary.collect());
            let elapsed = start.elapsed().as_secs_f64();

            debug!(task = auxiliary.name(), elapsed_secs = elapsed, "Auxiliary collector finished");
            timings.push(
                Sample::gauge(
                    format!("{}_task_seconds", translate_topic(APPLICATION)),
                    "Time spent in an auxiliary collector during the last scrape.",
                    elapsed,
                )
                .with_label("task", auxiliary.name()),
            );
        }

        samples.extend(timings);
        samples.extend(self.registry.snapshot().into_iter().map(Sample::from));
        samples
    }

    /// Render metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        render_samples(&self.collect())
    }
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<ScrapeCollector>;

/// Render samples, writing HELP and TYPE once per metric name.
pub fn render_samples(samples: &[Sample]) -> String {
    let mut output = Vec::with_capacity(samples.len() * 100);

    // Group by name, keeping first-seen order
    let mut order: Vec<&str> = Vec::new();
    let mut by_name: HashMap<&str, Vec<&Sample>> = HashMap::new();
    for sample in samples {
        by_name
            .entry(&sample.name)
            .or_insert_with(|| {
                order.push(&sample.name);
                Vec::new()
            })
            .push(sample);
    }

    for name in order {
        let series = &by_name[name];
        let first = series[0];

        writeln!(output, "# HELP {} {}", name, escape_help(&first.help)).ok();
        writeln!(output, "# TYPE {} {}", name, first.metric_type.as_str()).ok();

        for sample in series {
            writeln!(
                output,
                "{}{} {}",
                sample.name,
                sample.format_labels(),
                format_value(sample.value)
            )
            .ok();
        }
    }

    String::from_utf8(output).unwrap_or_default()
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape HELP text (backslash and newline only).
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
