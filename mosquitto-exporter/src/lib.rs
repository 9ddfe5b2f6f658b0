//! Prometheus exporter for Mosquitto broker statistics.
//!
//! This crate subscribes to the `$SYS/#` topics an MQTT broker publishes about
//! itself and exposes them via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   MQTT Broker   │────>│   Connection    │────>│    Registry     │────>│   HTTP Server   │
//! │    ($SYS/#)     │     │    Manager      │ mpsc│ (one per topic) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! mosquitto-exporter --endpoint tcp://mosquitto:1883 --port 9344
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod mapping;
pub mod registry;
pub mod subscriber;
pub mod tls;

pub use collector::{AuxiliaryCollector, ExporterStatsCollector, ScrapeCollector, SharedCollector};
pub use config::ExporterConfig;
pub use error::{ExporterError, Result};
pub use http::HttpServer;
pub use mapping::{TopicClass, classify, parse_value, translate_topic};
pub use registry::{BrokerMessage, MetricRegistry, SharedRegistry, run_dispatcher};
pub use subscriber::{ConnectionManager, ConnectionState};
