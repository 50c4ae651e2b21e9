//! Scheduler (component H): drives heterogeneous register groups at
//! independent cadences under a single execution mutex.

use crate::config::DeviceConfig;
use crate::diagnostics::DeviceDiagnostics;
use crate::error::BridgeError;
use crate::executor::StrategyExecutor;
use crate::health::HealthMonitorSet;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::publisher::Publisher;
use crate::types::ResultStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing between two bridge diagnostic messages carrying the same
/// error code, so a hot error loop doesn't flood the diagnostic topic.
const BRIDGE_DIAGNOSTIC_RATE_LIMIT: Duration = Duration::from_secs(30);

/// Per-group polling key: `"device_key/group_key"`.
fn group_key(device_key: &str, group_key: &str) -> String {
    format!("{device_key}/{group_key}")
}

/// Ticks every ~100 ms and, under `execution_mutex`, executes every group
/// whose `next_due` has elapsed.
pub struct Scheduler {
    executor: Arc<StrategyExecutor>,
    health: Arc<HealthMonitorSet>,
    diagnostics: Arc<DeviceDiagnostics>,
    publisher: Arc<dyn Publisher>,
    periods: HashMap<String, Duration>,
    next_due: RwLock<HashMap<String, Instant>>,
    /// Serializes group executions so at most one runs at a time even if
    /// the tick loop is ever reentered.
    execution_mutex: Mutex<()>,
    device_vars: RwLock<HashMap<String, HashMap<String, f64>>>,
    bridge_diagnostic_last: RwLock<HashMap<u16, Instant>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Scheduler {
    pub fn new(
        devices: &[DeviceConfig],
        default_period: Duration,
        executor: Arc<StrategyExecutor>,
        health: Arc<HealthMonitorSet>,
        diagnostics: Arc<DeviceDiagnostics>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let mut periods = HashMap::new();
        let now = Instant::now();
        let mut next_due = HashMap::new();

        for device in devices.iter().filter(|d| d.enabled) {
            let period = device
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(default_period);
            for group in device.groups.iter().filter(|g| g.enabled) {
                let key = group_key(&device.key, &group.key);
                periods.insert(key.clone(), period);
                next_due.insert(key, now);
            }
        }

        Self {
            executor,
            health,
            diagnostics,
            publisher,
            periods,
            next_due: RwLock::new(next_due),
            execution_mutex: Mutex::new(()),
            device_vars: RwLock::new(HashMap::new()),
            bridge_diagnostic_last: RwLock::new(HashMap::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Attaches a metrics sink, replacing the no-op default installed by
    /// [`Self::new`].
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Runs the tick loop until `shutdown` is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping on shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let _guard = self.execution_mutex.lock().await;
        let now = Instant::now();

        let due: Vec<String> = {
            let next_due = self.next_due.read().await;
            next_due
                .iter()
                .filter(|(_, &due_at)| due_at <= now)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if due.is_empty() {
            return;
        }

        for group in self.executor.groups() {
            let key = group_key(&group.device_key, &group.group_key);
            if !due.contains(&key) {
                continue;
            }

            // Drop this group's own lanes before repopulating so a failed
            // read with no cached fallback doesn't leave a stale value from
            // an earlier tick feeding calculated values.
            {
                let mut device_vars = self.device_vars.write().await;
                let vars = device_vars.entry(group.device_key.clone()).or_default();
                for lane in &group.lanes {
                    vars.remove(&lane.sensor_key);
                }
            }

            let started = Instant::now();
            match self.executor.execute_group(group).await {
                Ok(results) => {
                    let response_time_ms = started.elapsed().as_millis() as u64;
                    let transitioned = self.diagnostics.record_success(&group.device_key, response_time_ms).await;
                    self.health.record_success(&group.device_key).await;
                    let mut device_vars = self.device_vars.write().await;
                    let vars = device_vars.entry(group.device_key.clone()).or_default();
                    for (sensor_key, result) in results {
                        vars.insert(sensor_key, result.value);
                        self.publish_result(&result).await;
                    }
                    drop(device_vars);
                    if self.diagnostics.due_for_publish(&group.device_key, transitioned).await {
                        self.publish_diagnostic(&group.device_key).await;
                    }
                }
                Err(err) => {
                    let transitioned = self.diagnostics.record_error(&group.device_key, err.to_string()).await;
                    self.health.record_error(&group.device_key).await;
                    error!(device = %group.device_key, group = %group.group_key, %err, "group execution failed");
                    self.publish_bridge_diagnostic_if_due(&err).await;

                    let fallback = self.executor.cached_fallback(group).await;
                    if !fallback.is_empty() {
                        let mut device_vars = self.device_vars.write().await;
                        let vars = device_vars.entry(group.device_key.clone()).or_default();
                        for (sensor_key, result) in fallback {
                            vars.insert(sensor_key, result.value);
                            self.publish_result(&result).await;
                        }
                    }

                    if self.diagnostics.due_for_publish(&group.device_key, transitioned).await {
                        self.publish_diagnostic(&group.device_key).await;
                    }
                }
            }

            if let Some(period) = self.periods.get(&key) {
                self.next_due.write().await.insert(key, now + *period);
            }
        }

        let mut device_vars = self.device_vars.write().await;
        for calc in self.executor.calcs() {
            let result = {
                let Some(vars) = device_vars.get(&calc.device_key) else {
                    continue;
                };
                self.executor.execute_calc(calc, vars)
            };
            let Some(result) = result else {
                continue;
            };
            if let Some(vars) = device_vars.get_mut(&calc.device_key) {
                vars.insert(calc.key.clone(), result.value);
            }
            self.publish_result(&result).await;
        }
    }

    /// Emits a `{code, message, timestamp}` bridge diagnostic for a
    /// non-fatal group execution error, subject to a per-error-code rate
    /// limit so a hot error loop doesn't flood the diagnostic topic.
    async fn publish_bridge_diagnostic_if_due(&self, err: &BridgeError) {
        let code = err.error_code();
        let now = Instant::now();
        {
            let mut last = self.bridge_diagnostic_last.write().await;
            if let Some(previous) = last.get(&code) {
                if now.duration_since(*previous) < BRIDGE_DIAGNOSTIC_RATE_LIMIT {
                    return;
                }
            }
            last.insert(code, now);
        }
        if let Err(publish_err) = self.publisher.publish_bridge_diagnostic(code, &err.to_string()).await {
            error!(%publish_err, "failed to publish bridge diagnostic");
        }
    }

    async fn publish_result(&self, result: &crate::types::SensorResult) {
        if matches!(result.status, ResultStatus::Missing) {
            return;
        }
        let outcome = self.publisher.publish_sensor_state(result).await;
        self.metrics.record_publish(outcome.is_ok());
        if let Err(err) = outcome {
            error!(device = %result.device_key, sensor = %result.sensor_key, %err, "failed to publish sensor state");
        }
    }

    async fn publish_diagnostic(&self, device_key: &str) {
        if let Some(metrics) = self.diagnostics.snapshot(device_key).await {
            if let Err(err) = self.publisher.publish_device_diagnostic_state(device_key, &metrics).await {
                error!(device = device_key, %err, "failed to publish device diagnostic");
            }
            self.diagnostics.mark_published(device_key).await;
        }
    }
}
