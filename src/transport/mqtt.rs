//! MQTT-tunneled Modbus RTU transport.
//!
//! The serial-to-MQTT gateway on the other end of the broker republishes
//! raw Modbus RTU frames: requests go out on a command topic, responses
//! come back on a data topic. This client serializes exactly one
//! outstanding transaction at a time and rejects any response that does
//! not match the currently pending (slave, function) pair.

use super::GatewayTransport;
use crate::config::BrokerConfig;
use crate::error::{BridgeError, Result};
use crate::frame::{build_request, parse_response};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Connection state of the underlying broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Settings for [`MqttGateway`].
#[derive(Debug, Clone)]
pub struct MqttGatewayConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub retry_delay: Duration,
    pub command_topic: String,
    pub data_topic: String,
    pub availability_topic: String,
}

impl MqttGatewayConfig {
    pub fn from_broker(broker: &BrokerConfig, availability_topic: &str) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            username: broker.username.clone(),
            password: broker.password.clone(),
            client_id: broker.client_id.clone(),
            retry_delay: Duration::from_millis(broker.retry_delay_ms),
            command_topic: broker.gateway_command_topic.clone(),
            data_topic: broker.gateway_data_topic.clone(),
            availability_topic: availability_topic.to_string(),
        }
    }
}

/// Rolling counters surfaced to diagnostics/metrics.
#[derive(Debug, Default)]
pub struct GatewayTransportMetrics {
    pub transactions: AtomicU64,
    pub timeouts: AtomicU64,
    pub rejected_responses: AtomicU64,
}

/// MQTT-tunneled Modbus RTU gateway transport (component C).
pub struct MqttGateway {
    config: MqttGatewayConfig,
    client: AsyncClient,
    state: Arc<RwLock<ConnectionState>>,
    /// Serializes Modbus transactions end to end: exactly one outstanding
    /// request at a time across the whole process.
    command_mutex: Mutex<()>,
    expected: Arc<RwLock<Option<(u8, u8)>>>,
    response_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    pub metrics: GatewayTransportMetrics,
}

impl MqttGateway {
    /// Builds the gateway and spawns its background connection/dispatch
    /// task. The rendezvous channel capacity is fixed at 4, well above the
    /// single outstanding transaction this transport ever has in flight.
    pub fn new(config: MqttGatewayConfig) -> Arc<Self> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            &config.availability_topic,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let (tx, rx) = mpsc::channel(4);

        let gateway = Arc::new(Self {
            config: config.clone(),
            client,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            command_mutex: Mutex::new(()),
            expected: Arc::new(RwLock::new(None)),
            response_rx: Mutex::new(rx),
            metrics: GatewayTransportMetrics::default(),
        });

        tokio::spawn(dispatch_loop(
            gateway.client.clone(),
            eventloop,
            config,
            gateway.state.clone(),
            gateway.expected.clone(),
            tx,
        ));

        gateway
    }
}

/// The background task owning the `rumqttc` event loop: it (re)subscribes
/// to the data topic on every connect and routes matching Modbus responses
/// into the rendezvous channel.
async fn dispatch_loop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    config: MqttGatewayConfig,
    state: Arc<RwLock<ConnectionState>>,
    expected: Arc<RwLock<Option<(u8, u8)>>>,
    response_tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                *state.write().await = ConnectionState::Connected;
                info!(topic = %config.data_topic, "mqtt gateway connected, subscribing");
                if let Err(err) = client.subscribe(&config.data_topic, QoS::AtMostOnce).await {
                    warn!(%err, "failed to subscribe to gateway data topic");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic != config.data_topic {
                    continue;
                }
                trace!(frame = %hex::encode(&publish.payload), "received gateway data frame");
                match parse_response(&publish.payload) {
                    Ok(parsed) => {
                        let expected_pair = *expected.read().await;
                        match expected_pair {
                            Some((slave, function)) if slave == parsed.slave && function == parsed.function => {
                                if response_tx.try_send(parsed.payload).is_err() {
                                    warn!("response rendezvous full, dropping late frame");
                                }
                            }
                            Some((slave, function)) => {
                                debug!(
                                    expected_slave = slave,
                                    expected_function = function,
                                    actual_slave = parsed.slave,
                                    actual_function = parsed.function,
                                    "discarding response for non-pending transaction"
                                );
                            }
                            None => {
                                debug!("discarding unsolicited gateway response");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "discarding malformed gateway response frame");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                *state.write().await = ConnectionState::Disconnected;
            }
            Ok(_) => {}
            Err(err) => {
                *state.write().await = ConnectionState::Disconnected;
                warn!(%err, "mqtt gateway connection error, retrying");
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}

#[async_trait]
impl GatewayTransport for MqttGateway {
    async fn connect(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;
        // The dispatch loop owns reconnection; this call just waits for the
        // first successful connect so startup can fail fast on a config error.
        for _ in 0..600 {
            if self.is_connected().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(BridgeError::ConnectionLost {
            reason: "timed out waiting for initial broker connection".into(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|err| BridgeError::ConnectionLost { reason: err.to_string() })?;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Connected)
    }

    async fn send_and_wait(
        &self,
        slave: u8,
        function: u8,
        address: u16,
        count: u16,
        timeout: Duration,
        settle_delay: Duration,
    ) -> Result<Vec<u8>> {
        let _permit = self.command_mutex.lock().await;
        self.metrics.transactions.fetch_add(1, Ordering::Relaxed);
        let started_ns = crate::types::timestamp_ns();

        let mut rx = self.response_rx.lock().await;
        while rx.try_recv().is_ok() {
            // drain any stale response left over from a prior timeout
        }

        *self.expected.write().await = Some((slave, function));

        let frame = build_request(slave, function, address, count);
        trace!(frame = %hex::encode(&frame), "publishing gateway command frame");
        self.client
            .publish(&self.config.command_topic, QoS::AtMostOnce, false, frame)
            .await
            .map_err(|err| BridgeError::PublishFailed {
                topic: self.config.command_topic.clone(),
                reason: err.to_string(),
            })?;

        let outcome = tokio::time::timeout(timeout, rx.recv()).await;
        *self.expected.write().await = None;

        match outcome {
            Ok(Some(payload)) => {
                trace!(
                    slave,
                    function,
                    elapsed_ns = crate::types::timestamp_ns() - started_ns,
                    "gateway transaction completed"
                );
                tokio::time::sleep(settle_delay).await;
                Ok(payload)
            }
            Ok(None) => Err(BridgeError::ConnectionLost {
                reason: "response rendezvous closed".into(),
            }),
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(settle_delay).await;
                while rx.try_recv().is_ok() {
                    self.metrics.rejected_responses.fetch_add(1, Ordering::Relaxed);
                }
                Err(BridgeError::ResponseTimeout { slave, function })
            }
        }
    }
}
