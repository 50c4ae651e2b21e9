//! Health state machine (component I): converts a per-device
//! success/failure stream into a bounded set of observable states.

use crate::types::HealthState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// A state transition worth publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    EnteredOnline,
    EnteredOffline,
}

struct HealthMonitor {
    state: HealthState,
    first_error_time: Option<DateTime<Utc>>,
    grace_period: Duration,
}

impl HealthMonitor {
    fn new(grace_period: Duration) -> Self {
        Self {
            state: HealthState::Online,
            first_error_time: None,
            grace_period,
        }
    }

    fn record_success(&mut self) -> Option<HealthEvent> {
        let was_offline = self.state == HealthState::Offline;
        self.state = HealthState::Online;
        self.first_error_time = None;
        if was_offline {
            Some(HealthEvent::EnteredOnline)
        } else {
            None
        }
    }

    fn record_error(&mut self, now: DateTime<Utc>) -> Option<HealthEvent> {
        match self.state {
            HealthState::Online => {
                self.state = HealthState::GracePeriod;
                self.first_error_time = Some(now);
                None
            }
            HealthState::GracePeriod => {
                let elapsed = self
                    .first_error_time
                    .map(|t| now - t)
                    .unwrap_or_default();
                if elapsed >= chrono::Duration::from_std(self.grace_period).unwrap_or_default() {
                    self.state = HealthState::Offline;
                    Some(HealthEvent::EnteredOffline)
                } else {
                    None
                }
            }
            HealthState::Offline => None,
        }
    }
}

/// Per-device [`HealthMonitor`] instances, keyed by device key.
pub struct HealthMonitorSet {
    grace_period: Duration,
    monitors: RwLock<HashMap<String, HealthMonitor>>,
}

impl HealthMonitorSet {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record_success(&self, device_key: &str) -> Option<HealthEvent> {
        let mut monitors = self.monitors.write().await;
        let monitor = monitors
            .entry(device_key.to_string())
            .or_insert_with(|| HealthMonitor::new(self.grace_period));
        let event = monitor.record_success();
        if let Some(event) = event {
            info!(device = device_key, ?event, "health transition");
        }
        event
    }

    pub async fn record_error(&self, device_key: &str) -> Option<HealthEvent> {
        let mut monitors = self.monitors.write().await;
        let monitor = monitors
            .entry(device_key.to_string())
            .or_insert_with(|| HealthMonitor::new(self.grace_period));
        let event = monitor.record_error(Utc::now());
        if let Some(event) = event {
            info!(device = device_key, ?event, "health transition");
        }
        event
    }

    pub async fn state(&self, device_key: &str) -> HealthState {
        self.monitors
            .read()
            .await
            .get(device_key)
            .map(|m| m.state)
            .unwrap_or(HealthState::Online)
    }

    /// Whether every known device is currently non-Offline; used for the
    /// bridge-wide availability signal and `/health` endpoint.
    pub async fn all_online_or_grace(&self) -> bool {
        self.monitors
            .read()
            .await
            .values()
            .all(|m| m.state != HealthState::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_short_error_burst_stays_online() {
        let set = HealthMonitorSet::new(Duration::from_millis(200));
        for _ in 0..3 {
            set.record_error("meter1").await;
        }
        assert_eq!(set.state("meter1").await, HealthState::GracePeriod);
        set.record_success("meter1").await;
        assert_eq!(set.state("meter1").await, HealthState::Online);
    }

    #[tokio::test]
    async fn test_long_error_burst_goes_offline_then_recovers() {
        let set = HealthMonitorSet::new(Duration::from_millis(50));
        set.record_error("meter1").await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        let event = set.record_error("meter1").await;
        assert_eq!(event, Some(HealthEvent::EnteredOffline));
        assert_eq!(set.state("meter1").await, HealthState::Offline);

        let event = set.record_success("meter1").await;
        assert_eq!(event, Some(HealthEvent::EnteredOnline));
        assert_eq!(set.state("meter1").await, HealthState::Online);
    }

    #[tokio::test]
    async fn test_unknown_device_defaults_online() {
        let set = HealthMonitorSet::new(Duration::from_secs(15));
        assert_eq!(set.state("ghost").await, HealthState::Online);
    }
}
