//! Publisher contract (component K): the thin interface the executor,
//! scheduler, and diagnostics call to publish discovery, state,
//! availability, and diagnostic documents.

mod mqtt;

pub use mqtt::{MqttPublisher, PublisherConfig};

use crate::error::Result;
use crate::types::{DeviceMetrics, SensorResult};
use async_trait::async_trait;
use serde::Serialize;

/// Device descriptor attached to discovery documents (name, stable
/// identifiers, manufacturer, model).
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes a retained discovery document for a sensor or calculated
    /// value, idempotent and keyed by the sensor's unique id.
    async fn publish_sensor_discovery(&self, result: &SensorResult, device: &DeviceInfo) -> Result<()>;

    /// Publishes a non-retained state document for a sensor.
    async fn publish_sensor_state(&self, result: &SensorResult) -> Result<()>;

    /// Publishes "online" retained on the bridge's availability topic.
    async fn publish_availability_online(&self) -> Result<()>;

    /// Publishes "offline" retained on the bridge's availability topic.
    async fn publish_availability_offline(&self) -> Result<()>;

    /// Publishes a non-retained `{code, message, timestamp}` bridge
    /// diagnostic.
    async fn publish_bridge_diagnostic(&self, code: u16, message: &str) -> Result<()>;

    /// Publishes a retained discovery document for a device's diagnostic
    /// entity.
    async fn publish_device_diagnostic_discovery(&self, device_id: &str, device: &DeviceInfo) -> Result<()>;

    /// Publishes a non-retained device diagnostic state document.
    async fn publish_device_diagnostic_state(&self, device_id: &str, metrics: &DeviceMetrics) -> Result<()>;
}
