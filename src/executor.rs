//! Strategy executor (component G): decodes register group payloads into
//! named sensor values and evaluates calculated values over them.

use crate::breaker::CircuitBreaker;
use crate::cache::ValueCache;
use crate::config::DeviceConfig;
use crate::error::BridgeError;
use crate::eval;
use crate::frame::READ_HOLDING_REGISTERS;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::transport::GatewayTransport;
use crate::types::{cache_key, ResultStatus, SensorResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One sensor lane inside a [`GroupStrategy`].
#[derive(Debug, Clone)]
pub struct LaneStrategy {
    pub sensor_key: String,
    pub display_name: String,
    pub offset: u16,
    pub scale: f64,
    pub apply_abs: bool,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub max_change_per_hour: Option<f64>,
}

/// A contiguous register read and its lanes, for one device.
#[derive(Debug, Clone)]
pub struct GroupStrategy {
    pub device_key: String,
    pub group_key: String,
    pub slave_id: u8,
    pub start_address: u16,
    pub count: u16,
    pub lanes: Vec<LaneStrategy>,
    /// Whether any lane in this group is an energy (monotonic) register,
    /// which settles slower than ordinary registers after a read.
    pub is_energy: bool,
}

/// A calculated value and the sensor keys its formula depends on.
#[derive(Debug, Clone)]
pub struct CalcStrategy {
    pub device_key: String,
    pub key: String,
    pub formula: String,
    pub scale: f64,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub dependencies: std::collections::HashSet<String>,
}

struct LastValue {
    value: f64,
    at: DateTime<Utc>,
}

/// Walks the enabled device/group/lane tree once at startup and replays it
/// every scheduler tick: `execute_group` reads and decodes one group,
/// `execute_all` runs every group then every calculated value.
pub struct StrategyExecutor {
    groups: Vec<GroupStrategy>,
    calcs: Vec<CalcStrategy>,
    transport: Arc<dyn GatewayTransport>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ValueCache>,
    timeout: Duration,
    register_delay: Duration,
    energy_delay: Duration,
    last_values: RwLock<HashMap<String, LastValue>>,
    metrics: Arc<dyn MetricsSink>,
}

impl StrategyExecutor {
    pub fn new(
        devices: &[DeviceConfig],
        transport: Arc<dyn GatewayTransport>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<ValueCache>,
        timeout: Duration,
        register_delay: Duration,
        energy_delay: Duration,
    ) -> Self {
        let mut groups = Vec::new();
        let mut calcs = Vec::new();

        for device in devices.iter().filter(|d| d.enabled) {
            for group in device.groups.iter().filter(|g| g.enabled) {
                let lanes: Vec<LaneStrategy> = group
                    .registers
                    .iter()
                    .map(|r| LaneStrategy {
                        sensor_key: r.key.clone(),
                        display_name: r.display_name.clone(),
                        offset: r.offset,
                        scale: r.scale,
                        apply_abs: r.apply_abs,
                        unit: r.unit.clone(),
                        device_class: r.device_class.clone(),
                        state_class: r.state_class.clone(),
                        min: r.min,
                        max: r.max,
                        max_change_per_hour: r.max_change_per_hour,
                    })
                    .collect();
                let is_energy = lanes.iter().any(|l| l.device_class.as_deref() == Some("energy"));

                groups.push(GroupStrategy {
                    device_key: device.key.clone(),
                    group_key: group.key.clone(),
                    slave_id: group.slave_id.unwrap_or(device.slave_id),
                    start_address: group.start_address,
                    count: group.count,
                    lanes,
                    is_energy,
                });
            }

            for calc in &device.calculated {
                // Config validation already rejects malformed formulas, so this
                // only fails for a strategy built from an unvalidated config.
                let dependencies = eval::free_identifiers(&calc.formula).unwrap_or_default();
                calcs.push(CalcStrategy {
                    device_key: device.key.clone(),
                    key: calc.key.clone(),
                    formula: calc.formula.clone(),
                    scale: calc.scale,
                    unit: calc.unit.clone(),
                    device_class: calc.device_class.clone(),
                    state_class: calc.state_class.clone(),
                    min: calc.min,
                    max: calc.max,
                    dependencies,
                });
            }
        }

        Self {
            groups,
            calcs,
            transport,
            breaker,
            cache,
            timeout,
            register_delay,
            energy_delay,
            last_values: RwLock::new(HashMap::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Attaches a metrics sink, replacing the no-op default installed by
    /// [`Self::new`].
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn groups(&self) -> &[GroupStrategy] {
        &self.groups
    }

    /// Reads and decodes one group. Transport/framing failures abort the
    /// whole group (the caller falls back to cached values); per-lane
    /// validation failures are logged and skip just that lane.
    pub async fn execute_group(&self, group: &GroupStrategy) -> Result<HashMap<String, SensorResult>, BridgeError> {
        let transport = self.transport.clone();
        let slave = group.slave_id;
        let start = group.start_address;
        let count = group.count;
        let timeout = self.timeout;
        let settle_delay = if group.is_energy { self.energy_delay } else { self.register_delay };

        let started = std::time::Instant::now();
        let payload_result = self
            .breaker
            .call(|| async move {
                transport
                    .send_and_wait(slave, READ_HOLDING_REGISTERS, start, count, timeout, settle_delay)
                    .await
            })
            .await;
        self.metrics.record_read(payload_result.is_ok(), started.elapsed());
        self.metrics.set_gateway_online(self.transport.is_connected().await);
        let payload = payload_result?;

        let expected_len = 2 * group.count as usize;
        if payload.len() != expected_len {
            return Err(BridgeError::WrongPayloadLength {
                expected: expected_len,
                actual: payload.len(),
            });
        }

        let mut results = HashMap::new();
        for lane in &group.lanes {
            match self.decode_lane(group, lane, &payload).await {
                Ok(result) => {
                    self.cache.set(result.clone()).await;
                    results.insert(lane.sensor_key.clone(), result);
                }
                Err(err) => {
                    warn!(
                        device = %group.device_key,
                        sensor = %lane.sensor_key,
                        %err,
                        "skipping sensor after validation failure"
                    );
                }
            }
        }
        Ok(results)
    }

    async fn decode_lane(
        &self,
        group: &GroupStrategy,
        lane: &LaneStrategy,
        payload: &[u8],
    ) -> Result<SensorResult, BridgeError> {
        let offset = lane.offset as usize;
        let raw = &payload[offset..offset + 4];
        let mut value = f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64;
        value *= lane.scale;
        if lane.apply_abs {
            value = value.abs();
        }

        if !value.is_finite() {
            return Err(BridgeError::NonFiniteValue {
                device_key: group.device_key.clone(),
                sensor_key: lane.sensor_key.clone(),
            });
        }
        if let (Some(min), true) = (lane.min, lane.min.is_some_and(|m| value < m)) {
            return Err(BridgeError::OutOfBounds {
                device_key: group.device_key.clone(),
                sensor_key: lane.sensor_key.clone(),
                value,
                min,
                max: lane.max.unwrap_or(f64::INFINITY),
            });
        }
        if let (Some(max), true) = (lane.max, lane.max.is_some_and(|m| value > m)) {
            return Err(BridgeError::OutOfBounds {
                device_key: group.device_key.clone(),
                sensor_key: lane.sensor_key.clone(),
                value,
                min: lane.min.unwrap_or(f64::NEG_INFINITY),
                max,
            });
        }

        let key = cache_key(&group.device_key, &lane.sensor_key);
        let now = Utc::now();
        {
            let mut last_values = self.last_values.write().await;
            if let Some(limit) = lane.max_change_per_hour {
                if let Some(prev) = last_values.get(&key) {
                    if value < prev.value {
                        return Err(BridgeError::MonotonicityBreach {
                            device_key: group.device_key.clone(),
                            sensor_key: lane.sensor_key.clone(),
                            value,
                            previous: prev.value,
                        });
                    }
                    let elapsed_hours = (now - prev.at).num_milliseconds() as f64 / 3_600_000.0;
                    if elapsed_hours > 0.0 {
                        let rate = (value - prev.value) / elapsed_hours;
                        if rate > limit {
                            return Err(BridgeError::ExcessiveRateOfChange {
                                device_key: group.device_key.clone(),
                                sensor_key: lane.sensor_key.clone(),
                                rate,
                                max: limit,
                            });
                        }
                    }
                }
            }
            last_values.insert(key, LastValue { value, at: now });
        }

        Ok(SensorResult {
            device_key: group.device_key.clone(),
            sensor_key: lane.sensor_key.clone(),
            display_name: lane.display_name.clone(),
            value,
            unit: lane.unit.clone(),
            device_class: lane.device_class.clone(),
            state_class: lane.state_class.clone(),
            status: ResultStatus::Fresh,
            raw: raw.to_vec(),
        })
    }

    /// Looks up the last cached value (within TTL) for every lane in `group`,
    /// for use when a fresh read fails. A cached value is published in
    /// place of a failed read and marked accordingly.
    pub async fn cached_fallback(&self, group: &GroupStrategy) -> HashMap<String, SensorResult> {
        let mut results = HashMap::new();
        for lane in &group.lanes {
            let key = cache_key(&group.device_key, &lane.sensor_key);
            if let Some(mut cached) = self.cache.get(&key).await {
                cached.status = ResultStatus::Cached;
                if let Some(cached_at) = self.cache.cached_at(&key).await {
                    let age_seconds = (Utc::now() - cached_at).num_seconds();
                    debug!(
                        device = %group.device_key,
                        sensor = %lane.sensor_key,
                        age_seconds,
                        "falling back to cached value after read failure"
                    );
                }
                results.insert(lane.sensor_key.clone(), cached);
            }
        }
        results
    }

    pub fn calcs(&self) -> &[CalcStrategy] {
        &self.calcs
    }

    pub fn execute_calc(&self, calc: &CalcStrategy, vars: &HashMap<String, f64>) -> Option<SensorResult> {
        if !calc.dependencies.iter().all(|dep| vars.contains_key(dep)) {
            debug!(device = %calc.device_key, calc = %calc.key, "skipping calculated value, missing dependency");
            return None;
        }
        match eval::evaluate(&calc.formula, vars) {
            Ok(value) => Some(SensorResult {
                device_key: calc.device_key.clone(),
                sensor_key: calc.key.clone(),
                display_name: calc.key.clone(),
                value: value * calc.scale,
                unit: calc.unit.clone(),
                device_class: calc.device_class.clone(),
                state_class: calc.state_class.clone(),
                status: ResultStatus::Fresh,
                raw: Vec::new(),
            }),
            Err(err) => {
                warn!(device = %calc.device_key, calc = %calc.key, %err, "calculated value evaluation failed");
                None
            }
        }
    }

    /// Runs every group strategy, then every calculated strategy, returning
    /// all produced results keyed by `"device_key_sensor_key"`. Failing
    /// groups fall back to a cached value per sensor when one is available
    /// within TTL; `health` is updated with the group's outcome so the
    /// scheduler-level health machine reflects the same success/failure
    /// stream the executor just observed.
    pub async fn execute_all(&self, health: &crate::health::HealthMonitorSet) -> HashMap<String, SensorResult> {
        let mut all_results: HashMap<String, SensorResult> = HashMap::new();
        let mut per_device_vars: HashMap<String, HashMap<String, f64>> = HashMap::new();

        for group in &self.groups {
            match self.execute_group(group).await {
                Ok(results) => {
                    health.record_success(&group.device_key).await;
                    let vars = per_device_vars.entry(group.device_key.clone()).or_default();
                    for (sensor_key, result) in results {
                        vars.insert(sensor_key.clone(), result.value);
                        all_results.insert(result.result_key(), result);
                    }
                }
                Err(err) => {
                    health.record_error(&group.device_key).await;
                    warn!(device = %group.device_key, group = %group.group_key, %err, "group read failed");
                    for lane in &group.lanes {
                        let key = cache_key(&group.device_key, &lane.sensor_key);
                        if let Some(mut cached) = self.cache.get(&key).await {
                            cached.status = ResultStatus::Cached;
                            let vars = per_device_vars.entry(group.device_key.clone()).or_default();
                            vars.insert(lane.sensor_key.clone(), cached.value);
                            all_results.insert(cached.result_key(), cached);
                        }
                    }
                }
            }
        }

        for calc in &self.calcs {
            let vars = per_device_vars.entry(calc.device_key.clone()).or_default();
            if let Some(result) = self.execute_calc(calc, vars) {
                vars.insert(calc.key.clone(), result.value);
                all_results.insert(result.result_key(), result);
            }
        }

        all_results
    }
}
