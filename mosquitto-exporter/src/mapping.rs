//! Mapping from broker `$SYS` topics to Prometheus metrics.
//!
//! Three pure functions live here:
//! - [`classify`] decides whether a topic is ignored, a counter or a gauge
//! - [`parse_value`] pulls the first number out of a payload
//! - [`translate_topic`] turns a topic path into a Prometheus metric name

use once_cell::sync::Lazy;
use regex::Regex;

/// Topic prefix under which brokers publish their statistics.
pub const SYS_PREFIX: &str = "$SYS";

/// Namespace that replaces [`SYS_PREFIX`] in metric names.
pub const METRIC_NAMESPACE: &str = "mqtt";

/// Topics that carry no numeric state worth exporting.
pub const IGNORED_TOPICS: &[(&str, &str)] = &[
    (
        "$SYS/broker/timestamp",
        "The timestamp at which this particular build of the broker was made. Static.",
    ),
    ("$SYS/broker/version", "The version of the broker. Static."),
    (
        "$SYS/broker/clients/active",
        "Deprecated in favour of $SYS/broker/clients/connected",
    ),
    (
        "$SYS/broker/clients/inactive",
        "Deprecated in favour of $SYS/broker/clients/disconnected",
    ),
];

/// Topics whose payload is a cumulative total maintained by the broker.
pub const COUNTER_TOPICS: &[(&str, &str)] = &[
    (
        "$SYS/broker/bytes/received",
        "The total number of bytes received since the broker started.",
    ),
    (
        "$SYS/broker/bytes/sent",
        "The total number of bytes sent since the broker started.",
    ),
    (
        "$SYS/broker/messages/received",
        "The total number of messages of any type received since the broker started.",
    ),
    (
        "$SYS/broker/messages/sent",
        "The total number of messages of any type sent since the broker started.",
    ),
    (
        "$SYS/broker/publish/bytes/received",
        "The total number of PUBLISH bytes received since the broker started.",
    ),
    (
        "$SYS/broker/publish/bytes/sent",
        "The total number of PUBLISH bytes sent since the broker started.",
    ),
    (
        "$SYS/broker/publish/messages/received",
        "The total number of PUBLISH messages received since the broker started.",
    ),
    (
        "$SYS/broker/publish/messages/sent",
        "The total number of PUBLISH messages sent since the broker started.",
    ),
    (
        "$SYS/broker/publish/messages/dropped",
        "The total number of PUBLISH messages that have been dropped due to inflight/queuing limits.",
    ),
    (
        "$SYS/broker/uptime",
        "The total number of seconds since the broker started.",
    ),
    (
        "$SYS/broker/clients/maximum",
        "The maximum number of clients connected simultaneously since the broker started.",
    ),
    (
        "$SYS/broker/clients/total",
        "The total number of clients connected since the broker started.",
    ),
];

/// How a topic is exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicClass {
    /// Dropped without creating a metric.
    Ignored,
    /// Exported as a monotonic counter.
    Counter,
    /// Exported as a point-in-time gauge.
    Gauge,
}

/// Prometheus metric type of an exported series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrometheusType {
    Counter,
    Gauge,
}

impl PrometheusType {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrometheusType::Counter => "counter",
            PrometheusType::Gauge => "gauge",
        }
    }
}

impl TopicClass {
    /// The exported metric type, or `None` for ignored topics.
    pub fn metric_type(&self) -> Option<PrometheusType> {
        match self {
            TopicClass::Ignored => None,
            TopicClass::Counter => Some(PrometheusType::Counter),
            TopicClass::Gauge => Some(PrometheusType::Gauge),
        }
    }
}

fn lookup(table: &'static [(&'static str, &'static str)], topic: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(name, _)| *name == topic)
        .map(|(_, description)| *description)
}

/// Classify a topic by exact match against the ignore and counter tables.
///
/// Anything not listed in either table is a gauge.
pub fn classify(topic: &str) -> TopicClass {
    if lookup(IGNORED_TOPICS, topic).is_some() {
        TopicClass::Ignored
    } else if lookup(COUNTER_TOPICS, topic).is_some() {
        TopicClass::Counter
    } else {
        TopicClass::Gauge
    }
}

/// Description of a counter topic, if it is one.
pub fn counter_description(topic: &str) -> Option<&'static str> {
    lookup(COUNTER_TOPICS, topic)
}

// Decimal alternative must come first, otherwise "1.5" stops at the dot.
// Integers take an optional sign too, so "-5" is -5.0 rather than 5.0.
static NUMERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+\.\d+|-?\d+").unwrap());

/// Extract the first integer or decimal numeral from a payload.
///
/// Payloads without a numeral, or whose numeral does not parse, yield `0.0`.
/// Only the first match counts, so `"1.2.3"` is `1.2`.
pub fn parse_value(payload: &str) -> f64 {
    NUMERAL
        .find(payload)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Translate a topic into a Prometheus metric name.
///
/// The first `$SYS` becomes `mqtt`; every `/`, space, `-` and `.` becomes `_`.
pub fn translate_topic(topic: &str) -> String {
    topic
        .replacen(SYS_PREFIX, METRIC_NAMESPACE, 1)
        .chars()
        .map(|c| match c {
            '/' | ' ' | '-' | '.' => '_',
            other => other,
        })
        .collect()
}
