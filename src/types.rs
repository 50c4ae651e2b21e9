//! Shared value types that flow between the executor, cache, health monitor,
//! diagnostics, and publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a published [`SensorResult`] came from a fresh read, a cached
/// fallback, or could not be produced at all this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Fresh,
    Cached,
    Missing,
}

/// The runtime record emitted per sensor per poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorResult {
    pub device_key: String,
    pub sensor_key: String,
    pub display_name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub status: ResultStatus,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl SensorResult {
    /// The device-qualified key used by the cache: `"device_key/sensor_key"`.
    pub fn cache_key(&self) -> String {
        cache_key(&self.device_key, &self.sensor_key)
    }

    /// `"device_key_sensor_key"`, the key `execute_all` returns results under.
    pub fn result_key(&self) -> String {
        format!("{}_{}", self.device_key, self.sensor_key)
    }
}

/// Builds the `"device_key/sensor_key"` cache key shared by the executor and
/// the value cache.
pub fn cache_key(device_key: &str, sensor_key: &str) -> String {
    format!("{device_key}/{sensor_key}")
}

/// A [`SensorResult`] plus the instant it was produced, used by the value
/// cache for TTL-bounded last-good-value fallback.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: SensorResult,
    pub cached_at: DateTime<Utc>,
}

/// Health state machine states (component I). Online absorbs nothing;
/// GracePeriod absorbs errors shorter than the grace period; Offline is
/// entered only once the grace period has fully elapsed without a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Online,
    GracePeriod,
    Offline,
}

/// Device diagnostic classification (component J), computed at publish time
/// from rolling success/failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticState {
    Operational,
    Warning,
    Error,
    Offline,
}

impl DiagnosticState {
    /// The per-state republish cadence used when no transition has occurred.
    pub fn publish_interval(&self) -> std::time::Duration {
        match self {
            Self::Operational => std::time::Duration::from_secs(60),
            Self::Warning => std::time::Duration::from_secs(30),
            Self::Error => std::time::Duration::from_secs(5),
            Self::Offline => std::time::Duration::from_secs(60),
        }
    }
}

/// Per-device rolling counters, classified into a [`DiagnosticState`] at
/// publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_key: String,
    pub last_read: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_errors: u64,
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub cumulative_response_time_ms: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub current_state: DiagnosticState,
}

impl DeviceMetrics {
    pub fn new(device_key: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            last_read: None,
            last_success: None,
            consecutive_errors: 0,
            total_reads: 0,
            successful_reads: 0,
            failed_reads: 0,
            cumulative_response_time_ms: 0,
            last_error: None,
            last_error_time: None,
            current_state: DiagnosticState::Operational,
        }
    }

    /// Fraction of reads that have succeeded, 1.0 when no reads have
    /// happened yet (nothing has had a chance to fail).
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            1.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.successful_reads == 0 {
            0.0
        } else {
            self.cumulative_response_time_ms as f64 / self.successful_reads as f64
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>, response_time_ms: u64) {
        self.last_read = Some(now);
        self.last_success = Some(now);
        self.consecutive_errors = 0;
        self.total_reads += 1;
        self.successful_reads += 1;
        self.cumulative_response_time_ms += response_time_ms;
    }

    pub fn record_error(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.last_read = Some(now);
        self.consecutive_errors += 1;
        self.total_reads += 1;
        self.failed_reads += 1;
        self.last_error = Some(error.into());
        self.last_error_time = Some(now);
    }
}

/// Current timestamp in nanoseconds since the Unix epoch, used for log
/// correlation and transport transaction timing.
pub fn timestamp_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}
