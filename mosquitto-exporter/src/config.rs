//! Configuration for the Mosquitto exporter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::error::ExporterError;
use crate::http::HEALTH_PATH;

/// Client id value that asks for a generated one.
pub const RANDOM_CLIENT_ID: &str = "random";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// MQTT broker connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, e.g. "tcp://mosquitto:1883" or "ssl://broker:8883".
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// MQTT client id, or "random" to generate one.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Username for authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication (only used together with a username).
    #[serde(default)]
    pub password: Option<String>,

    /// TLS material.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Topic filter to subscribe to (default: "$SYS/#").
    #[serde(default = "default_topic")]
    pub topic: String,

    /// MQTT keep-alive interval (seconds).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// How long a single connection attempt may take (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Fixed delay between connection attempts (seconds).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// How long to wait for the subscription acknowledgement (seconds).
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "tcp://mosquitto:1883".to_string()
}

fn default_client_id() -> String {
    RANDOM_CLIENT_ID.to_string()
}

fn default_topic() -> String {
    "$SYS/#".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_retry_interval() -> u64 {
    5
}

fn default_subscribe_timeout() -> u64 {
    10
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            client_id: default_client_id(),
            username: None,
            password: None,
            tls: TlsConfig::default(),
            topic: default_topic(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            retry_interval_secs: default_retry_interval(),
            subscribe_timeout_secs: default_subscribe_timeout(),
        }
    }
}

impl MqttConfig {
    /// Parse the configured endpoint.
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ExporterError> {
        BrokerEndpoint::parse(&self.endpoint)
    }

    /// Resolve the client id, generating one when "random" is configured.
    pub fn resolve_client_id(&self) -> String {
        if self.client_id == RANDOM_CLIENT_ID || self.client_id.is_empty() {
            format!("mosquitto_exporter_{}", chrono::Utc::now().timestamp())
        } else {
            self.client_id.clone()
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to CA certificate file used to verify the broker.
    ///
    /// Without one the broker certificate is not verified.
    #[serde(default)]
    pub ca_cert: Option<String>,

    /// Path to client certificate file (PEM).
    #[serde(default)]
    pub client_cert: Option<String>,

    /// Path to client key file (PEM).
    #[serde(default)]
    pub client_key: Option<String>,
}

/// A parsed broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    /// Whether the scheme asks for a TLS transport.
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Default port for plain MQTT.
    pub const DEFAULT_PORT: u16 = 1883;
    /// Default port for MQTT over TLS.
    pub const DEFAULT_TLS_PORT: u16 = 8883;

    /// Parse an endpoint URL.
    ///
    /// Accepted schemes: `tcp`, `mqtt` (plain) and `ssl`, `tls`, `mqtts` (TLS).
    pub fn parse(endpoint: &str) -> Result<Self, ExporterError> {
        let url = Url::parse(endpoint).map_err(|e| ExporterError::endpoint(endpoint, e.to_string()))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => {
                return Err(ExporterError::endpoint(
                    endpoint,
                    format!("unsupported scheme '{}'", other),
                ));
            }
        };

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ExporterError::endpoint(endpoint, "missing host"))?
            .to_string();

        let port = url.port().unwrap_or(if tls {
            Self::DEFAULT_TLS_PORT
        } else {
            Self::DEFAULT_PORT
        });

        Ok(Self { host, port, tls })
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9344").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Extra labels added to every broker metric.
    #[serde(default)]
    pub default_labels: HashMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:9344".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            default_labels: HashMap::new(),
        }
    }
}

impl PrometheusConfig {
    /// Replace the port of the listen address, keeping its host.
    pub fn override_port(&mut self, port: u16) {
        self.listen = match self.listen.parse::<SocketAddr>() {
            Ok(mut addr) => {
                addr.set_port(port);
                addr.to_string()
            }
            Err(_) => format!("0.0.0.0:{}", port),
        };
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = self.mqtt.broker_endpoint() {
            return Err(ConfigError::Validation(e.to_string()));
        }

        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::Validation(
                "topic must not be empty".to_string(),
            ));
        }

        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::Validation(
                "keep_alive_secs must be >= 5".to_string(),
            ));
        }

        for (name, value) in [
            ("connect_timeout_secs", self.mqtt.connect_timeout_secs),
            ("retry_interval_secs", self.mqtt.retry_interval_secs),
            ("subscribe_timeout_secs", self.mqtt.subscribe_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be > 0", name)));
            }
        }

        // Validate listen address format
        if self.prometheus.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        // Validate path starts with /
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.prometheus.path == HEALTH_PATH {
            return Err(ConfigError::Validation(format!(
                "Metrics path must not be {}",
                HEALTH_PATH
            )));
        }

        // Router path syntax would turn these into captures or wildcards
        if self.prometheus.path.contains([':', '*', '{', '}']) {
            return Err(ConfigError::Validation(format!(
                "Metrics path must be a literal path: {}",
                self.prometheus.path
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = ExporterConfig::parse("{}").unwrap();

        assert_eq!(config.mqtt.endpoint, "tcp://mosquitto:1883");
        assert_eq!(config.mqtt.client_id, "random");
        assert_eq!(config.mqtt.topic, "$SYS/#");
        assert_eq!(config.mqtt.connect_timeout_secs, 5);
        assert_eq!(config.mqtt.retry_interval_secs, 5);
        assert_eq!(config.mqtt.subscribe_timeout_secs, 10);
        assert_eq!(config.prometheus.listen, "0.0.0.0:9344");
        assert_eq!(config.prometheus.path, "/metrics");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            mqtt: {
                endpoint: "ssl://broker.local:8884",
                client_id: "exporter-01",
                username: "monitor",
                password: "secret",
                tls: {
                    ca_cert: "/etc/mosquitto/ca.pem",
                    client_cert: "/etc/mosquitto/client.pem",
                    client_key: "/etc/mosquitto/client.key",
                },
                keep_alive_secs: 60,
                retry_interval_secs: 2,
            },
            prometheus: {
                listen: "127.0.0.1:9500",
                path: "/prometheus/metrics",
                default_labels: {
                    environment: "production",
                },
            },
            logging: {
                level: "debug",
                format: "json",
            },
        }"#;

        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.mqtt.client_id, "exporter-01");
        assert_eq!(config.mqtt.username.as_deref(), Some("monitor"));
        assert_eq!(config.mqtt.password.as_deref(), Some("secret"));
        assert_eq!(
            config.mqtt.tls.client_key.as_deref(),
            Some("/etc/mosquitto/client.key")
        );
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.mqtt.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.prometheus.listen, "127.0.0.1:9500");
        assert_eq!(
            config.prometheus.default_labels.get("environment"),
            Some(&"production".to_string())
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        let endpoint = config.mqtt.broker_endpoint().unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 8884);
        assert!(endpoint.tls);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = ExporterConfig::default();
        config.mqtt.username = Some("monitor".to_string());
        config
            .prometheus
            .default_labels
            .insert("site".to_string(), "lab".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let parsed = ExporterConfig::parse(&json).unwrap();

        assert_eq!(parsed.mqtt.username.as_deref(), Some("monitor"));
        assert_eq!(parsed.mqtt.keep_alive_secs, 30);
        assert_eq!(
            parsed.prometheus.default_labels.get("site").map(String::as_str),
            Some("lab")
        );
    }

    #[test]
    fn test_broker_endpoint_default_ports() {
        let plain = BrokerEndpoint::parse("tcp://mosquitto").unwrap();
        assert_eq!(plain.port, 1883);
        assert!(!plain.tls);

        let secure = BrokerEndpoint::parse("mqtts://mosquitto").unwrap();
        assert_eq!(secure.port, 8883);
        assert!(secure.tls);

        let ipv6 = BrokerEndpoint::parse("tcp://[::1]:1884").unwrap();
        assert_eq!(ipv6.host, "::1");
        assert_eq!(ipv6.port, 1884);
    }

    #[test]
    fn test_broker_endpoint_rejects_bad_urls() {
        assert!(BrokerEndpoint::parse("http://mosquitto:1883").is_err());
        assert!(BrokerEndpoint::parse("mosquitto:1883").is_err());
        assert!(BrokerEndpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_resolve_client_id() {
        let mut config = MqttConfig::default();
        assert!(config.resolve_client_id().starts_with("mosquitto_exporter_"));

        config.client_id = "fixed".to_string();
        assert_eq!(config.resolve_client_id(), "fixed");
    }

    #[test]
    fn test_override_port() {
        let mut prometheus = PrometheusConfig::default();
        prometheus.override_port(9999);
        assert_eq!(prometheus.listen, "0.0.0.0:9999");

        prometheus.listen = "127.0.0.1:1".to_string();
        prometheus.override_port(8080);
        assert_eq!(prometheus.listen, "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_invalid_listen() {
        let json = r#"{
            prometheus: { listen: "not-an-address" }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_validate_invalid_path() {
        let json = r#"{
            prometheus: { path: "no-leading-slash" }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("must start with /")
        );
    }

    #[test]
    fn test_validate_path_reserved_or_pattern() {
        for path in ["/health", "/:x", "/*rest", "/{id}", "/metrics/{x"] {
            let json = format!(r#"{{ prometheus: {{ path: "{}" }} }}"#, path);
            let result = ExporterConfig::parse(&json);
            assert!(result.is_err(), "{} should be rejected", path);
        }

        let config = ExporterConfig::parse(r#"{ prometheus: { path: "/prometheus/metrics" } }"#);
        assert!(config.is_ok());
        let config = ExporterConfig::parse(r#"{ prometheus: { path: "/" } }"#);
        assert!(config.is_ok());
    }

    #[test]
    fn test_validate_invalid_endpoint() {
        let json = r#"{
            mqtt: { endpoint: "udp://mosquitto:1883" }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_validate_short_keep_alive() {
        let json = r#"{
            mqtt: { keep_alive_secs: 2 }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(result.unwrap_err().to_string().contains("keep_alive_secs"));
    }

    #[test]
    fn test_validate_zero_retry_interval() {
        let json = r#"{
            mqtt: { retry_interval_secs: 0 }
        }"#;

        let result = ExporterConfig::parse(json);
        assert!(result.is_err());
    }
}
