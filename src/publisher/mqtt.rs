//! MQTT-backed [`Publisher`]: republishes sensor telemetry using the Home
//! Assistant MQTT discovery convention (retained discovery, non-retained
//! state, retained availability with a last-will).

use super::{DeviceInfo, Publisher};
use crate::config::BrokerConfig;
use crate::error::{BridgeError, Result};
use crate::types::{DeviceMetrics, SensorResult};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

/// Settings for [`MqttPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub discovery_prefix: String,
    pub availability_topic: String,
    pub diagnostic_topic: String,
    pub state_topic_base: String,
}

impl PublisherConfig {
    pub fn from_broker(broker: &BrokerConfig, discovery_prefix: &str, availability_topic: &str, diagnostic_topic: &str) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            username: broker.username.clone(),
            password: broker.password.clone(),
            client_id: format!("{}-publisher", broker.client_id),
            discovery_prefix: discovery_prefix.to_string(),
            availability_topic: availability_topic.to_string(),
            diagnostic_topic: diagnostic_topic.to_string(),
            state_topic_base: "modbus-gateway-bridge/state".to_string(),
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    config: PublisherConfig,
}

impl MqttPublisher {
    pub fn new(config: PublisherConfig) -> Self {
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

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!(%err, "publisher mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        Self { client, config }
    }

    fn state_topic(&self, device_id: &str, sensor_key: &str) -> String {
        format!("{}/{}/{}/state", self.config.state_topic_base, device_id, sensor_key)
    }

    fn discovery_topic(&self, device_id: &str, sensor_key: &str) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.config.discovery_prefix, device_id, sensor_key
        )
    }

    fn diagnostic_state_topic(&self, device_id: &str) -> String {
        format!("{}/{}/diagnostic/state", self.config.state_topic_base, device_id)
    }

    fn diagnostic_discovery_topic(&self, device_id: &str) -> String {
        format!(
            "{}/sensor/{}/diagnostic/config",
            self.config.discovery_prefix, device_id
        )
    }

    async fn publish_json(&self, topic: &str, payload: serde_json::Value, retain: bool) -> Result<()> {
        let body = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, body)
            .await
            .map_err(|err| BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    /// Energy-class sensors round to 3 decimals; power-factor to 2; other
    /// classes publish full precision.
    fn rounded_value(result: &SensorResult) -> f64 {
        match result.device_class.as_deref() {
            Some("energy") => (result.value * 1000.0).round() / 1000.0,
            Some("power_factor") => (result.value * 100.0).round() / 100.0,
            _ => result.value,
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish_sensor_discovery(&self, result: &SensorResult, device: &DeviceInfo) -> Result<()> {
        let unique_id = format!("{}_{}", result.device_key, result.sensor_key);
        let state_topic = self.state_topic(&result.device_key, &result.sensor_key);
        let payload = json!({
            "name": result.display_name,
            "unique_id": unique_id,
            "state_topic": state_topic,
            "value_template": "{{ value_json.value }}",
            "unit_of_measurement": result.unit,
            "device_class": result.device_class,
            "state_class": result.state_class,
            "device": device,
            "availability_topic": self.config.availability_topic,
            "payload_available": "online",
            "payload_not_available": "offline",
        });
        self.publish_json(&self.discovery_topic(&result.device_key, &result.sensor_key), payload, true)
            .await
    }

    async fn publish_sensor_state(&self, result: &SensorResult) -> Result<()> {
        let payload = json!({
            "value": Self::rounded_value(result),
            "unit": result.unit,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.publish_json(&self.state_topic(&result.device_key, &result.sensor_key), payload, false)
            .await
    }

    async fn publish_availability_online(&self) -> Result<()> {
        self.client
            .publish(&self.config.availability_topic, QoS::AtLeastOnce, true, "online")
            .await
            .map_err(|err| BridgeError::PublishFailed {
                topic: self.config.availability_topic.clone(),
                reason: err.to_string(),
            })
    }

    async fn publish_availability_offline(&self) -> Result<()> {
        self.client
            .publish(&self.config.availability_topic, QoS::AtLeastOnce, true, "offline")
            .await
            .map_err(|err| BridgeError::PublishFailed {
                topic: self.config.availability_topic.clone(),
                reason: err.to_string(),
            })
    }

    async fn publish_bridge_diagnostic(&self, code: u16, message: &str) -> Result<()> {
        let payload = json!({
            "code": code,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.publish_json(&self.config.diagnostic_topic, payload, false).await
    }

    async fn publish_device_diagnostic_discovery(&self, device_id: &str, device: &DeviceInfo) -> Result<()> {
        let state_topic = self.diagnostic_state_topic(device_id);
        let payload = json!({
            "name": format!("{} Diagnostic", device.name),
            "unique_id": format!("{device_id}_diagnostic"),
            "state_topic": state_topic,
            "value_template": "{{ value_json.current_state }}",
            "entity_category": "diagnostic",
            "json_attributes_topic": state_topic,
            "device": device,
            "availability_topic": self.config.availability_topic,
            "payload_available": "online",
            "payload_not_available": "offline",
        });
        self.publish_json(&self.diagnostic_discovery_topic(device_id), payload, true)
            .await
    }

    async fn publish_device_diagnostic_state(&self, device_id: &str, metrics: &DeviceMetrics) -> Result<()> {
        let mut payload = serde_json::to_value(metrics)?;
        if let Some(object) = payload.as_object_mut() {
            object.insert(
                "average_response_time_ms".into(),
                json!(metrics.average_response_time_ms()),
            );
        }
        self.publish_json(&self.diagnostic_state_topic(device_id), payload, false).await
    }
}
