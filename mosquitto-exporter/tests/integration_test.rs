//! Integration tests for the Mosquitto exporter.
//!
//! These tests verify the full flow from broker messages arriving on the
//! dispatcher channel to exposing them via the HTTP /metrics endpoint.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use mosquitto_exporter::collector::{ExporterStatsCollector, ScrapeCollector};
use mosquitto_exporter::registry::broker_labels;
use mosquitto_exporter::{
    BrokerMessage, ExporterConfig, HttpServer, MetricRegistry, SharedCollector,
    SharedRegistry, run_dispatcher,
};

/// Helper to create a registry labelled for `host1`.
fn create_registry() -> SharedRegistry {
    Arc::new(MetricRegistry::new(broker_labels("host1", &HashMap::new())))
}

fn create_collector(registry: SharedRegistry) -> SharedCollector {
    Arc::new(ScrapeCollector::new(registry))
}

/// Helper to parse Prometheus text format into (series, value) pairs.
fn parse_samples(output: &str) -> Vec<(String, f64)> {
    output
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .filter_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            Some((series.to_string(), value.parse().ok()?))
        })
        .collect()
}

#[tokio::test]
async fn test_full_flow_through_dispatcher() {
    let registry = create_registry();
    let collector = create_collector(registry.clone());
    let (tx, rx) = mpsc::channel(16);
    let dispatcher = tokio::spawn(run_dispatcher(registry.clone(), rx));

    let messages = [
        ("$SYS/broker/clients/connected", "7"),
        ("$SYS/broker/version", "mosquitto version 2.0.18"),
        ("$SYS/broker/uptime", "86400 seconds"),
        ("$SYS/broker/load/messages/received/1min", "12.75"),
        ("$SYS/broker/retained messages/count", "42"),
    ];
    for (topic, payload) in messages {
        tx.send(BrokerMessage::new(topic, payload)).await.unwrap();
    }
    drop(tx);
    dispatcher.await.unwrap();

    let samples = parse_samples(&collector.render());

    let expect = |series: &str, value: f64| {
        assert!(
            samples.iter().any(|(s, v)| s == series && *v == value),
            "missing {} {} in {:?}",
            series,
            value,
            samples
        );
    };
    expect("mqtt_broker_clients_connected{broker=\"host1\"}", 7.0);
    expect("mqtt_broker_uptime{broker=\"host1\"}", 86400.0);
    expect(
        "mqtt_broker_load_messages_received_1min{broker=\"host1\"}",
        12.75,
    );
    expect("mqtt_broker_retained_messages_count{broker=\"host1\"}", 42.0);

    assert!(
        !samples.iter().any(|(s, _)| s.starts_with("mqtt_broker_version")),
        "ignored topics must not be exported"
    );
}

#[tokio::test]
async fn test_metric_updates_preserve_latest_value() {
    let registry = create_registry();
    let collector = create_collector(registry.clone());

    for payload in ["1", "5", "3"] {
        registry.process_update("$SYS/broker/clients/connected", payload);
    }

    let output = collector.render();
    let lines: Vec<&str> = output
        .lines()
        .filter(|l| l.starts_with("mqtt_broker_clients_connected"))
        .collect();

    assert_eq!(lines, vec!["mqtt_broker_clients_connected{broker=\"host1\"} 3"]);
}

#[tokio::test]
async fn test_exposition_names_are_valid() {
    let registry = create_registry();
    let collector = create_collector(registry.clone());

    registry.process_update("$SYS/broker/load/sockets/5min", "0.5");
    registry.process_update("$SYS/broker/store/messages/bytes", "1024");
    registry.process_update("$SYS/broker/publish/bytes/received", "2048");

    let output = collector.render();

    for (series, _) in parse_samples(&output) {
        let metric_name = series.split('{').next().unwrap_or(&series);
        assert!(
            !metric_name.chars().next().unwrap().is_ascii_digit(),
            "Metric name '{}' should not start with digit",
            metric_name
        );
        assert!(
            metric_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':'),
            "Metric name '{}' contains invalid characters",
            metric_name
        );
    }
}

#[tokio::test]
async fn test_concurrent_recording() {
    let registry = create_registry();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                for j in 0..100 {
                    registry.process_update(&format!("$SYS/broker/custom/{}", j), &i.to_string());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.stats().messages_received, 1000);
    assert_eq!(registry.len(), 100);
}

#[tokio::test]
async fn test_http_server_serves_without_broker_data() {
    let registry = create_registry();
    let status = Arc::new(mosquitto_exporter::subscriber::ConnectionStatus::new());
    let collector = Arc::new(
        ScrapeCollector::new(registry.clone())
            .with_auxiliary(ExporterStatsCollector::new(registry, status)),
    );

    let server = HttpServer::new(collector, "127.0.0.1:0".parse().unwrap(), "/metrics".to_string());
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(server.serve(listener, shutdown_rx));

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert!(body.contains("mosquitto_exporter{version="));
    assert!(body.contains("mosquitto_exporter_broker_connected 0"));

    let landing = client
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(landing.contains("href=\"/metrics\""));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), server_handle)
        .await
        .unwrap();
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let server = HttpServer::new(
        create_collector(create_registry()),
        addr,
        "/metrics".to_string(),
    );

    let err = server.bind().await.unwrap_err();
    assert!(err.to_string().contains("Failed to bind"));
}

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            mqtt: {{ endpoint: "mqtt://broker.example:1884", client_id: "exporter" }},
            prometheus: {{ listen: "127.0.0.1:9400" }},
        }}"#
    )
    .unwrap();

    let config = ExporterConfig::load_from_file(file.path()).unwrap();
    let endpoint = config.mqtt.broker_endpoint().unwrap();

    assert_eq!(endpoint.host, "broker.example");
    assert_eq!(endpoint.port, 1884);
    assert!(!endpoint.tls);
    assert_eq!(config.mqtt.resolve_client_id(), "exporter");
    assert_eq!(config.prometheus.listen, "127.0.0.1:9400");
}

#[test]
fn test_load_config_missing_file() {
    assert!(ExporterConfig::load_from_file("/nonexistent/exporter.json5").is_err());
}
