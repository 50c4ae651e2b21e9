//! Device diagnostics (component J): per-device rolling metrics classified
//! into operational/warning/error/offline, with immediate-on-transition or
//! interval-based publish gating.

use crate::types::{DeviceMetrics, DiagnosticState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Thresholds driving [`DeviceMetrics::current_state`] classification.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsThresholds {
    pub offline_timeout: Duration,
    pub error_rate_threshold: f64,
    pub error_consecutive: u64,
    pub warning_rate_threshold: f64,
    pub warning_consecutive: u64,
}

impl Default for DiagnosticsThresholds {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(30),
            error_rate_threshold: 0.5,
            error_consecutive: 5,
            warning_rate_threshold: 0.9,
            warning_consecutive: 2,
        }
    }
}

/// Tracks [`DeviceMetrics`] per device and decides when a diagnostic state
/// is worth (re)publishing.
pub struct DeviceDiagnostics {
    thresholds: DiagnosticsThresholds,
    metrics: RwLock<HashMap<String, DeviceMetrics>>,
    last_published: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl DeviceDiagnostics {
    pub fn new(thresholds: DiagnosticsThresholds) -> Self {
        Self {
            thresholds,
            metrics: RwLock::new(HashMap::new()),
            last_published: RwLock::new(HashMap::new()),
        }
    }

    fn classify(&self, metrics: &DeviceMetrics, now: DateTime<Utc>) -> DiagnosticState {
        let offline_timeout = chrono::Duration::from_std(self.thresholds.offline_timeout).unwrap_or_default();
        let is_offline = match metrics.last_success {
            Some(last) => now - last >= offline_timeout,
            None => metrics
                .last_error_time
                .is_some_and(|t| now - t >= offline_timeout),
        };
        if is_offline {
            return DiagnosticState::Offline;
        }

        let rate = metrics.success_rate();
        if rate < self.thresholds.error_rate_threshold || metrics.consecutive_errors >= self.thresholds.error_consecutive {
            return DiagnosticState::Error;
        }
        if rate < self.thresholds.warning_rate_threshold
            || metrics.consecutive_errors >= self.thresholds.warning_consecutive
        {
            return DiagnosticState::Warning;
        }
        DiagnosticState::Operational
    }

    /// Records a successful read and returns `true` if the device's
    /// classification changed as a result (an immediate-publish trigger).
    pub async fn record_success(&self, device_key: &str, response_time_ms: u64) -> bool {
        let now = Utc::now();
        let mut metrics_map = self.metrics.write().await;
        let metrics = metrics_map
            .entry(device_key.to_string())
            .or_insert_with(|| DeviceMetrics::new(device_key));
        let previous_state = metrics.current_state;
        metrics.record_success(now, response_time_ms);
        metrics.current_state = self.classify(metrics, now);
        metrics.current_state != previous_state
    }

    /// Records a failed read; same transition semantics as
    /// [`Self::record_success`].
    pub async fn record_error(&self, device_key: &str, error: impl Into<String>) -> bool {
        let now = Utc::now();
        let mut metrics_map = self.metrics.write().await;
        let metrics = metrics_map
            .entry(device_key.to_string())
            .or_insert_with(|| DeviceMetrics::new(device_key));
        let previous_state = metrics.current_state;
        metrics.record_error(now, error);
        metrics.current_state = self.classify(metrics, now);
        metrics.current_state != previous_state
    }

    pub async fn snapshot(&self, device_key: &str) -> Option<DeviceMetrics> {
        self.metrics.read().await.get(device_key).cloned()
    }

    pub async fn all_snapshots(&self) -> Vec<DeviceMetrics> {
        self.metrics.read().await.values().cloned().collect()
    }

    /// Whether `device_key` is due for a diagnostic republish: either it
    /// transitioned this call (`transitioned = true`) or its state's
    /// cadence has elapsed since the last publish.
    pub async fn due_for_publish(&self, device_key: &str, transitioned: bool) -> bool {
        if transitioned {
            return true;
        }
        let metrics_map = self.metrics.read().await;
        let Some(metrics) = metrics_map.get(device_key) else {
            return false;
        };
        let last_published = self.last_published.read().await;
        match last_published.get(device_key) {
            Some(last) => {
                let interval = chrono::Duration::from_std(metrics.current_state.publish_interval()).unwrap_or_default();
                Utc::now() - *last >= interval
            }
            None => true,
        }
    }

    pub async fn mark_published(&self, device_key: &str) {
        self.last_published
            .write()
            .await
            .insert(device_key.to_string(), Utc::now());
    }
}
