//! MQTT connection manager that subscribes to the broker's `$SYS` topics.
//!
//! The manager owns the broker session, retries forever with a fixed delay and
//! re-subscribes every time the broker acknowledges a (re)connection. Inbound
//! publishes are forwarded to the dispatcher over an mpsc channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BrokerEndpoint, MqttConfig};
use crate::error::Result;
use crate::registry::BrokerMessage;
use crate::tls::build_transport;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 64;

/// Lifecycle of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Connection status shared with the scrape path.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    state: RwLock<ConnectionState>,
    attempts: AtomicU64,
    connections: AtomicU64,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of the session.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Number of successful connections so far.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = current.as_str(), to = state.as_str(), "Connection state changed");
            *current = state;
        }
    }

    fn begin_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);
    }

    fn connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
    }
}

/// Create a shareable status handle.
pub type SharedStatus = Arc<ConnectionStatus>;

/// Result of waiting for the next transport event.
enum Poll {
    Event(std::result::Result<Event, ConnectionError>),
    TimedOut,
    Shutdown,
    SubscribeTimeout,
}

/// Owns the MQTT session and keeps it alive.
pub struct ConnectionManager {
    config: MqttConfig,
    endpoint: BrokerEndpoint,
    status: SharedStatus,
    messages: mpsc::Sender<BrokerMessage>,
}

impl ConnectionManager {
    /// Create a connection manager forwarding publishes to `messages`.
    pub fn new(config: MqttConfig, messages: mpsc::Sender<BrokerMessage>) -> Result<Self> {
        let endpoint = config.broker_endpoint()?;
        Ok(Self {
            config,
            endpoint,
            status: Arc::new(ConnectionStatus::new()),
            messages,
        })
    }

    /// Status handle for the scrape path.
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// The parsed broker endpoint.
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = self.config.resolve_client_id();
        let mut options = MqttOptions::new(client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(true);

        if let Some(username) = self.config.username.as_deref().filter(|u| !u.is_empty()) {
            let password = self.config.password.clone().unwrap_or_default();
            options.set_credentials(username, password);
        }

        options.set_transport(build_transport(&self.endpoint, &self.config.tls));
        options
    }

    /// Run until the shutdown signal is received.
    ///
    /// Connection failures never end the loop; they are logged and retried
    /// after `retry_interval`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY);
        let endpoint = self.config.endpoint.as_str();
        let topic = self.config.topic.as_str();
        let mut subscribe_deadline: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.status.state() == ConnectionState::Disconnected {
                self.status.begin_attempt();
                info!(
                    endpoint,
                    attempt = self.status.attempts(),
                    "Attempting to connect to mosquitto endpoint"
                );
            }

            let poll = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Poll::Shutdown
                    } else {
                        continue;
                    }
                }
                _ = wait_until(subscribe_deadline) => Poll::SubscribeTimeout,
                poll = next_event(&mut eventloop, self.status.state(), self.config.connect_timeout()) => poll,
            };

            match poll {
                Poll::Shutdown => break,
                Poll::SubscribeTimeout => {
                    subscribe_deadline = None;
                    error!(topic, "Timeout subscribing to topic");
                }
                Poll::TimedOut => {
                    error!(endpoint, "Timeout connecting to mosquitto endpoint");
                    self.status.set_state(ConnectionState::Disconnected);
                    subscribe_deadline = None;
                    if !self.wait_retry(&mut shutdown).await {
                        break;
                    }
                }
                Poll::Event(Err(e)) => {
                    if self.status.is_connected() {
                        warn!(endpoint, error = %e, "Connection to mosquitto endpoint lost");
                    } else {
                        error!(endpoint, error = %e, "Failed to connect to mosquitto endpoint");
                    }
                    self.status.set_state(ConnectionState::Disconnected);
                    subscribe_deadline = None;
                    if !self.wait_retry(&mut shutdown).await {
                        break;
                    }
                }
                Poll::Event(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    self.status.connected();
                    info!(endpoint, "Connected to mosquitto endpoint");

                    // Subscribe on every (re)connect
                    match client.try_subscribe(topic, QoS::AtMostOnce) {
                        Ok(()) => {
                            subscribe_deadline = Some(Instant::now() + self.config.subscribe_timeout());
                        }
                        Err(e) => {
                            error!(topic, error = %e, "Failed to subscribe to topic");
                        }
                    }
                }
                Poll::Event(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    subscribe_deadline = None;
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        error!(topic, "Failed to subscribe to topic: rejected by broker");
                    } else {
                        info!(topic, "Subscribed to topic");
                    }
                }
                Poll::Event(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let message = BrokerMessage::from_bytes(publish.topic.clone(), &publish.payload);
                    trace!(topic = %message.topic, payload = %message.payload, "Received broker update");
                    if self.messages.send(message).await.is_err() {
                        warn!("Dispatcher closed, stopping connection manager");
                        break;
                    }
                }
                Poll::Event(Ok(event)) => {
                    trace!(?event, "MQTT event");
                }
            }
        }

        if self.status.is_connected() {
            let _ = client.try_disconnect();
        }
        self.status.set_state(ConnectionState::Disconnected);

        info!(
            attempts = self.status.attempts(),
            connections = self.status.connections(),
            "Connection manager stopped"
        );
        Ok(())
    }

    /// Sleep for the retry interval. Returns `false` if shutdown was requested.
    async fn wait_retry(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.config.retry_interval();
        debug!(delay_secs = delay.as_secs(), "Waiting before next connection attempt");

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }
}

/// Poll the event loop, bounding the wait while a connection is being set up.
async fn next_event(eventloop: &mut EventLoop, state: ConnectionState, connect_timeout: Duration) -> Poll {
    if state == ConnectionState::Connecting {
        match tokio::time::timeout(connect_timeout, eventloop.poll()).await {
            Ok(result) => Poll::Event(result),
            Err(_) => Poll::TimedOut,
        }
    } else {
        Poll::Event(eventloop.poll().await)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
