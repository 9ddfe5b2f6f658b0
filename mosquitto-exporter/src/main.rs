//! Prometheus exporter for Mosquitto broker statistics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use mosquitto_exporter::collector::{ExporterStatsCollector, ScrapeCollector};
use mosquitto_exporter::registry::{MetricRegistry, broker_labels, run_dispatcher};
use mosquitto_exporter::{ConnectionManager, ExporterConfig, HttpServer, logging};

/// Capacity of the broker message channel.
const MESSAGE_CAPACITY: usize = 1024;

/// Prometheus exporter for Mosquitto broker statistics.
#[derive(Parser, Debug)]
#[command(name = "mosquitto-exporter")]
#[command(about = "Export Mosquitto $SYS statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Broker endpoint, e.g. tcp://mosquitto:1883 (overrides config).
    #[arg(long)]
    endpoint: Option<String>,

    /// MQTT client id, or "random" (overrides config).
    #[arg(long)]
    client_id: Option<String>,

    /// Username for authentication.
    #[arg(long)]
    username: Option<String>,

    /// Password for authentication.
    #[arg(long)]
    password: Option<String>,

    /// Client certificate (PEM) for TLS authentication.
    #[arg(long)]
    cert_file: Option<String>,

    /// Client private key (PEM) for TLS authentication.
    #[arg(long)]
    key_file: Option<String>,

    /// CA certificate (PEM) used to verify the broker.
    #[arg(long)]
    ca_file: Option<String>,

    /// Listen port for the HTTP metrics endpoint (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Apply command line overrides on top of the loaded configuration.
    fn apply(self, config: &mut ExporterConfig) {
        if let Some(endpoint) = self.endpoint {
            config.mqtt.endpoint = endpoint;
        }
        if let Some(client_id) = self.client_id {
            config.mqtt.client_id = client_id;
        }
        if self.username.is_some() {
            config.mqtt.username = self.username;
        }
        if self.password.is_some() {
            config.mqtt.password = self.password;
        }
        if self.cert_file.is_some() {
            config.mqtt.tls.client_cert = self.cert_file;
        }
        if self.key_file.is_some() {
            config.mqtt.tls.client_key = self.key_file;
        }
        if self.ca_file.is_some() {
            config.mqtt.tls.ca_cert = self.ca_file;
        }
        if let Some(listen) = self.listen {
            config.prometheus.listen = listen;
        }
        if let Some(port) = self.port {
            config.prometheus.override_port(port);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };
    args.apply(&mut config);
    config.validate()?;

    logging::init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Mosquitto Exporter");

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (message_tx, message_rx) = mpsc::channel(MESSAGE_CAPACITY);
    let manager = ConnectionManager::new(config.mqtt.clone(), message_tx)?;

    let labels = broker_labels(&manager.endpoint().host, &config.prometheus.default_labels);
    let registry = Arc::new(MetricRegistry::new(labels));
    let collector = Arc::new(
        ScrapeCollector::new(registry.clone())
            .with_auxiliary(ExporterStatsCollector::new(registry.clone(), manager.status())),
    );

    // Parse listen address
    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Bind failures are fatal
    let http_server = HttpServer::new(collector, listen_addr, config.prometheus.path.clone());
    let listener = http_server.bind().await?;

    let http_shutdown = shutdown_rx.clone();
    let mut http_task = tokio::spawn(async move {
        if let Err(e) = http_server.serve(listener, http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let dispatcher_task = tokio::spawn(run_dispatcher(registry.clone(), message_rx));

    // Connect in the background so metrics are served without a broker
    let manager_shutdown = shutdown_rx.clone();
    let manager_task = tokio::spawn(async move {
        if let Err(e) = manager.run(manager_shutdown).await {
            error!("Connection manager error: {}", e);
        }
    });

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let terminate = async {
        #[cfg(unix)]
        {
            sigterm.recv().await;
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    // Wait for shutdown signal
    let http_failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            false
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
            false
        }
        _ = &mut http_task => {
            error!("HTTP server exited unexpectedly");
            true
        }
    };

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = manager_task.await;
        let _ = dispatcher_task.await;
        if !http_failed {
            let _ = http_task.await;
        }
    })
    .await;

    // Print final stats
    let stats = registry.stats();
    info!(
        messages_received = stats.messages_received,
        messages_ignored = stats.messages_ignored,
        metrics = registry.len(),
        "Final statistics"
    );

    if http_failed {
        anyhow::bail!("HTTP server stopped serving metrics");
    }

    info!("Exporter stopped");
    Ok(())
}
