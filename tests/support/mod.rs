//! Shared test doubles for the scenario tests in this directory.

use async_trait::async_trait;
use modbus_gateway_bridge::config::DeviceConfig;
use modbus_gateway_bridge::error::{BridgeError, Result};
use modbus_gateway_bridge::frame::parse_response;
use modbus_gateway_bridge::publisher::{DeviceInfo, Publisher};
use modbus_gateway_bridge::transport::GatewayTransport;
use modbus_gateway_bridge::types::{DeviceMetrics, SensorResult};
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// A [`GatewayTransport`] backed by a queue of raw RTU response frames
/// instead of a live broker. `send_and_wait` replays the same matching
/// discipline the real MQTT dispatcher applies: frames whose slave or
/// function do not match the pending request are discarded, and an empty
/// queue (or an entirely mismatched one) times out.
pub struct FakeGatewayTransport {
    incoming: Mutex<VecDeque<Vec<u8>>>,
}

impl FakeGatewayTransport {
    pub fn new() -> Self {
        Self {
            incoming: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a raw RTU frame as if it had just arrived on the gateway data
    /// topic, ahead of the next `send_and_wait` call.
    pub async fn push_frame(&self, frame: Vec<u8>) {
        self.incoming.lock().await.push_back(frame);
    }
}

#[async_trait]
impl GatewayTransport for FakeGatewayTransport {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn send_and_wait(
        &self,
        slave: u8,
        function: u8,
        _address: u16,
        _count: u16,
        _timeout: std::time::Duration,
        _settle_delay: std::time::Duration,
    ) -> Result<Vec<u8>> {
        let mut queue = self.incoming.lock().await;
        while let Some(raw) = queue.pop_front() {
            match parse_response(&raw) {
                Ok(parsed) if parsed.slave == slave && parsed.function == function => {
                    return Ok(parsed.payload);
                }
                _ => continue,
            }
        }
        Err(BridgeError::ResponseTimeout { slave, function })
    }
}

/// A [`Publisher`] that records every call instead of talking to a broker.
#[derive(Default)]
pub struct RecordingPublisher {
    pub states: StdMutex<Vec<SensorResult>>,
    pub device_diagnostics: StdMutex<Vec<(String, DeviceMetrics)>>,
    pub availability: StdMutex<Vec<bool>>,
    pub bridge_diagnostics: StdMutex<Vec<(u16, String)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_for(&self, sensor_key: &str) -> Option<SensorResult> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.sensor_key == sensor_key)
            .cloned()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_sensor_discovery(&self, _result: &SensorResult, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    async fn publish_sensor_state(&self, result: &SensorResult) -> Result<()> {
        self.states.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn publish_availability_online(&self) -> Result<()> {
        self.availability.lock().unwrap().push(true);
        Ok(())
    }

    async fn publish_availability_offline(&self) -> Result<()> {
        self.availability.lock().unwrap().push(false);
        Ok(())
    }

    async fn publish_bridge_diagnostic(&self, code: u16, message: &str) -> Result<()> {
        self.bridge_diagnostics.lock().unwrap().push((code, message.to_string()));
        Ok(())
    }

    async fn publish_device_diagnostic_discovery(&self, _device_id: &str, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    async fn publish_device_diagnostic_state(&self, device_id: &str, metrics: &DeviceMetrics) -> Result<()> {
        self.device_diagnostics
            .lock()
            .unwrap()
            .push((device_id.to_string(), metrics.clone()));
        Ok(())
    }
}

/// Builds a single-group, single-lane device: slave `slave_id`, group
/// `"main"` at `0x2000` with `count` registers, one lane `"voltage"` at
/// offset 0.
pub fn voltage_device(key: &str, slave_id: u8, count: u16) -> DeviceConfig {
    use modbus_gateway_bridge::config::{GroupRegisterConfig, RegisterGroupConfig};

    DeviceConfig {
        key: key.into(),
        name: key.into(),
        slave_id,
        poll_interval_ms: None,
        enabled: true,
        manufacturer: None,
        model: None,
        ha_id: None,
        groups: vec![RegisterGroupConfig {
            key: "main".into(),
            start_address: 0x2000,
            count,
            enabled: true,
            slave_id: None,
            registers: vec![GroupRegisterConfig {
                key: "voltage".into(),
                display_name: "Voltage".into(),
                offset: 0,
                unit: Some("V".into()),
                scale: 1.0,
                apply_abs: false,
                device_class: Some("voltage".into()),
                state_class: Some("measurement".into()),
                min: None,
                max: None,
                max_change_per_hour: None,
            }],
        }],
        calculated: vec![],
    }
}
