//! # modbus-gateway-bridge
//!
//! Bridges a fleet of Modbus RTU slaves — reachable only through a
//! serial-to-MQTT gateway — to a home-automation broker's MQTT discovery
//! convention. Periodically reads configured register groups, decodes
//! float32 lanes, evaluates calculated values, and republishes typed sensor
//! states while tracking per-device health and diagnostics.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Scheduler (H)                                              │
//! │   per-group next_due timers, execution_mutex               │
//! ├───────────────────────────────────────────────────────────┤
//! │ Strategy executor (G)                                      │
//! │   group decode → scale/abs → calculated values (F)         │
//! ├───────────────────────────────────────────────────────────┤
//! │ Circuit breaker (D) → Gateway transport (C)                 │
//! │   Closed/Open/Half-Open            command_mutex, MQTT      │
//! ├───────────────────────────────────────────────────────────┤
//! │ Frame builder/parser (B) → CRC-16 codec (A)                 │
//! ├───────────────────────────────────────────────────────────┤
//! │ Health monitor (I) · Device diagnostics (J) · Publisher (K) │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod breaker;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crc;
pub mod diagnostics;
pub mod error;
pub mod eval;
pub mod executor;
pub mod frame;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod scheduler;
pub mod transport;
pub mod types;

#[cfg(feature = "http")]
pub mod http;

pub use config::{BridgeConfig, DeviceConfig};
pub use error::{BridgeError, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
