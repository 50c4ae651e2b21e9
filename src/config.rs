//! Configuration types for the bridge: the device-centric schema loaded
//! from YAML (`BridgeConfig`), plus a builder for tests and programmatic
//! construction.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Schema versions this build of the loader understands.
pub const SUPPORTED_CONFIG_VERSIONS: &[u32] = &[1];

// =============================================================================
// Top-level configuration
// =============================================================================

/// Complete bridge configuration, as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Schema version; must be one of [`SUPPORTED_CONFIG_VERSIONS`].
    pub config_version: u32,

    /// Broker connection settings, including the gateway command/data topics.
    pub broker: BrokerConfig,

    /// Prefix under which sensor discovery documents are published.
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Retained topic carrying the bridge's own "online"/"offline" state.
    #[serde(default = "default_availability_topic")]
    pub bridge_availability_topic: String,

    /// Topic carrying non-retained `{code, message, timestamp}` diagnostics.
    #[serde(default = "default_diagnostic_topic")]
    pub bridge_diagnostic_topic: String,

    /// Defaults inherited by devices/groups that do not override them.
    #[serde(default)]
    pub modbus_defaults: ModbusDefaults,

    /// The configured device fleet.
    pub devices: Vec<DeviceConfig>,
}

impl BridgeConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Validates the configuration's invariants:
    /// supported schema version, unique slave ids among enabled devices,
    /// unique device/home-automation ids, well-formed register groups, and
    /// calculated values whose formulas resolve entirely against sibling
    /// registers or earlier calculated values on the same device.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_CONFIG_VERSIONS.contains(&self.config_version) {
            return Err(BridgeError::UnsupportedConfigVersion {
                found: self.config_version,
                supported: SUPPORTED_CONFIG_VERSIONS.to_vec(),
            });
        }

        let mut seen_device_keys = HashSet::new();
        let mut seen_slave_ids = HashSet::new();
        let mut seen_ha_ids = HashSet::new();

        for device in &self.devices {
            if !seen_device_keys.insert(device.key.clone()) {
                return Err(BridgeError::InvalidConfig {
                    reason: format!("duplicate device key: {}", device.key),
                });
            }

            let ha_id = device.ha_id();
            if !seen_ha_ids.insert(ha_id.clone()) {
                return Err(BridgeError::InvalidConfig {
                    reason: format!("duplicate home-automation id: {ha_id}"),
                });
            }

            if device.enabled {
                if !(1..=247).contains(&device.slave_id) {
                    return Err(BridgeError::InvalidConfig {
                        reason: format!(
                            "device {} has slave id {} out of range [1,247]",
                            device.key, device.slave_id
                        ),
                    });
                }
                if !seen_slave_ids.insert(device.slave_id) {
                    return Err(BridgeError::InvalidConfig {
                        reason: format!("duplicate slave id {} among enabled devices", device.slave_id),
                    });
                }
            }

            device.validate()?;
        }

        Ok(())
    }
}

/// Builder for [`BridgeConfig`], used by tests and by programmatic
/// construction outside the YAML loader.
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config_version: Option<u32>,
    broker: Option<BrokerConfig>,
    discovery_prefix: Option<String>,
    bridge_availability_topic: Option<String>,
    bridge_diagnostic_topic: Option<String>,
    modbus_defaults: Option<ModbusDefaults>,
    devices: Vec<DeviceConfig>,
}

impl BridgeConfigBuilder {
    pub fn config_version(mut self, version: u32) -> Self {
        self.config_version = Some(version);
        self
    }

    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn discovery_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.discovery_prefix = Some(prefix.into());
        self
    }

    pub fn modbus_defaults(mut self, defaults: ModbusDefaults) -> Self {
        self.modbus_defaults = Some(defaults);
        self
    }

    pub fn add_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    pub fn build(self) -> Result<BridgeConfig> {
        let config = BridgeConfig {
            config_version: self.config_version.unwrap_or(1),
            broker: self.broker.ok_or_else(|| BridgeError::InvalidConfig {
                reason: "broker configuration is required".into(),
            })?,
            discovery_prefix: self.discovery_prefix.unwrap_or_else(default_discovery_prefix),
            bridge_availability_topic: self
                .bridge_availability_topic
                .unwrap_or_else(default_availability_topic),
            bridge_diagnostic_topic: self
                .bridge_diagnostic_topic
                .unwrap_or_else(default_diagnostic_topic),
            modbus_defaults: self.modbus_defaults.unwrap_or_default(),
            devices: self.devices,
        };

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Broker configuration
// =============================================================================

/// Connection settings for the MQTT broker that also tunnels Modbus RTU
/// frames to and from the serial gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Outbound topic the gateway listens on for request frames.
    pub gateway_command_topic: String,
    /// Inbound topic the gateway publishes response frames on.
    pub gateway_data_topic: String,
}

// =============================================================================
// Modbus defaults
// =============================================================================

/// Defaults shared across devices/groups unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusDefaults {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_register_delay_ms")]
    pub register_delay_ms: u64,
    #[serde(default = "default_energy_delay_ms")]
    pub energy_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_republish_interval_ms")]
    pub republish_interval_ms: u64,
}

impl Default for ModbusDefaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            register_delay_ms: default_register_delay_ms(),
            energy_delay_ms: default_energy_delay_ms(),
            timeout_ms: default_timeout_ms(),
            republish_interval_ms: default_republish_interval_ms(),
        }
    }
}

// =============================================================================
// Device configuration
// =============================================================================

/// A logical Modbus slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub key: String,
    pub name: String,
    pub slave_id: u8,
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    /// Home-automation id override; defaults to `key` when absent.
    pub ha_id: Option<String>,
    #[serde(default)]
    pub groups: Vec<RegisterGroupConfig>,
    #[serde(default)]
    pub calculated: Vec<CalculatedValueConfig>,
}

impl DeviceConfig {
    /// The effective home-automation id: the override if set, else the key.
    pub fn ha_id(&self) -> String {
        self.ha_id.clone().unwrap_or_else(|| self.key.clone())
    }

    fn validate(&self) -> Result<()> {
        let mut seen_groups = HashSet::new();
        let mut seen_sensor_keys = HashSet::new();
        let mut known_identifiers = HashSet::new();

        for group in &self.groups {
            if !seen_groups.insert(group.key.clone()) {
                return Err(BridgeError::InvalidConfig {
                    reason: format!("duplicate group key {} on device {}", group.key, self.key),
                });
            }

            for register in &group.registers {
                if !seen_sensor_keys.insert(register.key.clone()) {
                    return Err(BridgeError::InvalidConfig {
                        reason: format!(
                            "duplicate sensor key {} on device {}",
                            register.key, self.key
                        ),
                    });
                }
                known_identifiers.insert(register.key.clone());
                if register.offset % 2 != 0 {
                    return Err(BridgeError::InvalidConfig {
                        reason: format!(
                            "sensor {} on device {} has odd byte offset {}",
                            register.key, self.key, register.offset
                        ),
                    });
                }
                if register.offset as u32 + 4 > 2 * group.count as u32 {
                    return Err(BridgeError::InvalidConfig {
                        reason: format!(
                            "sensor {} on device {} (offset {}) does not fit group {} (count {})",
                            register.key, self.key, register.offset, group.key, group.count
                        ),
                    });
                }
            }
        }

        for calc in &self.calculated {
            if !seen_sensor_keys.insert(calc.key.clone()) {
                return Err(BridgeError::InvalidConfig {
                    reason: format!(
                        "calculated value key {} collides with a sensor key on device {}",
                        calc.key, self.key
                    ),
                });
            }

            let dependencies = crate::eval::free_identifiers(&calc.formula).map_err(|err| BridgeError::InvalidConfig {
                reason: format!(
                    "calculated value {} on device {} has a malformed formula: {err}",
                    calc.key, self.key
                ),
            })?;
            for dependency in &dependencies {
                if !known_identifiers.contains(dependency) {
                    return Err(BridgeError::InvalidConfig {
                        reason: format!(
                            "calculated value {} on device {} references unknown identifier '{}' (must be a sibling register or an earlier calculated value)",
                            calc.key, self.key, dependency
                        ),
                    });
                }
            }
            known_identifiers.insert(calc.key.clone());
        }

        Ok(())
    }
}

/// A contiguous block of holding registers read in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterGroupConfig {
    pub key: String,
    pub start_address: u16,
    pub count: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the device's slave id for this group, if set.
    pub slave_id: Option<u8>,
    #[serde(default)]
    pub registers: Vec<GroupRegisterConfig>,
}

/// One sensor lane inside a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRegisterConfig {
    pub key: String,
    pub display_name: String,
    pub offset: u16,
    pub unit: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub apply_abs: bool,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Maximum allowed increase per hour, for monotonic energy lanes.
    pub max_change_per_hour: Option<f64>,
}

/// A derived sensor computed from a formula over sibling sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatedValueConfig {
    pub key: String,
    pub formula: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "modbus-gateway-bridge".into()
}
fn default_retry_delay_ms() -> u64 {
    5000
}
fn default_discovery_prefix() -> String {
    "homeassistant".into()
}
fn default_availability_topic() -> String {
    "modbus-gateway-bridge/availability".into()
}
fn default_diagnostic_topic() -> String {
    "modbus-gateway-bridge/diagnostic".into()
}
fn default_poll_interval_ms() -> u64 {
    10_000
}
fn default_register_delay_ms() -> u64 {
    50
}
fn default_energy_delay_ms() -> u64 {
    50
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_republish_interval_ms() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}
fn default_scale() -> f64 {
    1.0
}
