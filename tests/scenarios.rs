//! End-to-end scenario tests (S1, S2, S3, S4) driving the strategy executor
//! against a fake gateway transport. S5 (health grace) is covered by
//! `src/health.rs`'s unit tests and S6 (circuit breaker) by
//! `src/breaker.rs`'s, since both are pure state machines that don't need a
//! transport.

mod support;

use modbus_gateway_bridge::breaker::{BreakerConfig, CircuitBreaker};
use modbus_gateway_bridge::cache::ValueCache;
use modbus_gateway_bridge::config::{CalculatedValueConfig, DeviceConfig};
use modbus_gateway_bridge::crc::append_crc;
use modbus_gateway_bridge::executor::StrategyExecutor;
use modbus_gateway_bridge::health::HealthMonitorSet;
use std::sync::Arc;
use std::time::Duration;
use support::{voltage_device, FakeGatewayTransport};

fn executor_for(devices: &[DeviceConfig], transport: Arc<FakeGatewayTransport>) -> StrategyExecutor {
    StrategyExecutor::new(
        devices,
        transport,
        Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        Arc::new(ValueCache::default()),
        Duration::from_millis(200),
        Duration::from_millis(50),
        Duration::from_millis(50),
    )
}

/// S1: one device, slave 11, group at 0x2000 count 2, lane "voltage" at
/// offset 0. Gateway replies `0B 03 04 43 5C 40 00 <crc>` (220.25 as a
/// big-endian f32). After one group execution the result value is ≈220.25.
#[tokio::test]
async fn s1_happy_path() {
    let transport = Arc::new(FakeGatewayTransport::new());
    transport
        .push_frame(append_crc(&[0x0B, 0x03, 0x04, 0x43, 0x5C, 0x40, 0x00]))
        .await;

    let devices = vec![voltage_device("meter1", 11, 2)];
    let executor = executor_for(&devices, transport);
    let group = &executor.groups()[0];

    let results = executor.execute_group(group).await.expect("group read succeeds");
    let voltage = results.get("voltage").expect("voltage lane decoded");
    assert!((voltage.value - 220.25).abs() < 0.01);
}

/// S2: two devices on slaves 11 and 1. A response for slave 1 arrives ahead
/// of the one actually requested for slave 11; it must be discarded rather
/// than delivered, and the slave-11 request still times out since no
/// matching frame follows. A second attempt with the correct frame queued
/// succeeds.
#[tokio::test]
async fn s2_cross_slave_isolation() {
    let transport = Arc::new(FakeGatewayTransport::new());
    // A frame addressed to slave 1 shows up first; irrelevant to the slave
    // 11 request about to be made.
    transport
        .push_frame(append_crc(&[0x01, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00]))
        .await;

    let devices = vec![voltage_device("meter11", 11, 2)];
    let executor = executor_for(&devices, transport.clone());
    let group = &executor.groups()[0];

    let first = executor.execute_group(group).await;
    assert!(first.is_err(), "mismatched slave must not satisfy the pending request");

    transport
        .push_frame(append_crc(&[0x0B, 0x03, 0x04, 0x43, 0x5C, 0x40, 0x00]))
        .await;
    let second = executor.execute_group(group).await.expect("correct frame now satisfies the request");
    assert!((second["voltage"].value - 220.25).abs() < 0.01);
}

/// S3: a response with a corrupted CRC is rejected outright (the group read
/// fails), but the executor's cache still holds the previous successful
/// reading and the scheduler-level fallback path serves it.
#[tokio::test]
async fn s3_crc_corruption_falls_back_to_cache() {
    let transport = Arc::new(FakeGatewayTransport::new());
    transport
        .push_frame(append_crc(&[0x0B, 0x03, 0x04, 0x43, 0x5C, 0x40, 0x00]))
        .await;

    let devices = vec![voltage_device("meter1", 11, 2)];
    let executor = executor_for(&devices, transport.clone());
    let group = &executor.groups()[0];

    executor.execute_group(group).await.expect("first read succeeds and populates the cache");

    let mut corrupted = append_crc(&[0x0B, 0x03, 0x04, 0x43, 0x5C, 0x40, 0x00]);
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xFF;
    transport.push_frame(corrupted).await;

    let second = executor.execute_group(group).await;
    assert!(second.is_err(), "corrupted CRC must fail the group read");

    let fallback = executor.cached_fallback(group).await;
    let cached = fallback.get("voltage").expect("a cached value survives the failed read");
    assert!((cached.value - 220.25).abs() < 0.01);
}

/// S4: power_active = 2400, power_apparent = 3000, calculated
/// power_reactive = sqrt(power_apparent^2 - power_active^2) ≈ 1800.
#[tokio::test]
async fn s4_calculated_value() {
    use modbus_gateway_bridge::config::{GroupRegisterConfig, RegisterGroupConfig};

    let device = DeviceConfig {
        key: "meter1".into(),
        name: "meter1".into(),
        slave_id: 11,
        poll_interval_ms: None,
        enabled: true,
        manufacturer: None,
        model: None,
        ha_id: None,
        groups: vec![RegisterGroupConfig {
            key: "power".into(),
            start_address: 0x3000,
            count: 4,
            enabled: true,
            slave_id: None,
            registers: vec![
                GroupRegisterConfig {
                    key: "power_active".into(),
                    display_name: "Active power".into(),
                    offset: 0,
                    unit: Some("W".into()),
                    scale: 1.0,
                    apply_abs: false,
                    device_class: Some("power".into()),
                    state_class: Some("measurement".into()),
                    min: None,
                    max: None,
                    max_change_per_hour: None,
                },
                GroupRegisterConfig {
                    key: "power_apparent".into(),
                    display_name: "Apparent power".into(),
                    offset: 4,
                    unit: Some("VA".into()),
                    scale: 1.0,
                    apply_abs: false,
                    device_class: Some("apparent_power".into()),
                    state_class: Some("measurement".into()),
                    min: None,
                    max: None,
                    max_change_per_hour: None,
                },
            ],
        }],
        calculated: vec![CalculatedValueConfig {
            key: "power_reactive".into(),
            formula: "sqrt(power_apparent^2 - power_active^2)".into(),
            scale: 1.0,
            unit: Some("var".into()),
            device_class: Some("reactive_power".into()),
            state_class: Some("measurement".into()),
            min: None,
            max: None,
        }],
    };

    let transport = Arc::new(FakeGatewayTransport::new());
    let active: f32 = 2400.0;
    let apparent: f32 = 3000.0;
    let mut prefix = vec![0x0B, 0x03, 0x08];
    prefix.extend_from_slice(&active.to_be_bytes());
    prefix.extend_from_slice(&apparent.to_be_bytes());
    transport.push_frame(append_crc(&prefix)).await;

    let devices = vec![device];
    let executor = executor_for(&devices, transport);
    let group = &executor.groups()[0];
    let results = executor.execute_group(group).await.expect("power group reads cleanly");

    let mut vars = std::collections::HashMap::new();
    for (sensor_key, result) in &results {
        vars.insert(sensor_key.clone(), result.value);
    }

    let calc = &executor.calcs()[0];
    let reactive = executor.execute_calc(calc, &vars).expect("formula evaluates");
    assert!((reactive.value - 1800.0).abs() < 0.01);
}

/// Exercises the full scheduler/executor/health/diagnostics wiring for one
/// tick against a recording publisher, confirming a successful read is
/// actually published end to end.
#[tokio::test]
async fn scheduler_publishes_a_fresh_reading() {
    use modbus_gateway_bridge::diagnostics::{DeviceDiagnostics, DiagnosticsThresholds};
    use modbus_gateway_bridge::scheduler::Scheduler;
    use support::RecordingPublisher;

    let transport = Arc::new(FakeGatewayTransport::new());
    transport
        .push_frame(append_crc(&[0x0B, 0x03, 0x04, 0x43, 0x5C, 0x40, 0x00]))
        .await;

    let devices = vec![voltage_device("meter1", 11, 2)];
    let executor = Arc::new(executor_for(&devices, transport));
    let health = Arc::new(HealthMonitorSet::new(Duration::from_secs(15)));
    let diagnostics = Arc::new(DeviceDiagnostics::new(DiagnosticsThresholds::default()));
    let publisher = Arc::new(RecordingPublisher::new());

    let scheduler = Scheduler::new(
        &devices,
        Duration::from_millis(50),
        executor,
        health,
        diagnostics,
        publisher.clone(),
    );
    let scheduler = Arc::new(scheduler);

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_millis(250)).await;
    task.abort();

    let voltage = publisher.state_for("voltage").expect("voltage was published at least once");
    assert!((voltage.value - 220.25).abs() < 0.01);
}

/// A calculated value that references an earlier calculated value on the
/// same device resolves correctly through the scheduler's live tick path,
/// not just through `execute_all`.
#[tokio::test]
async fn scheduler_chains_calculated_values() {
    use modbus_gateway_bridge::config::{GroupRegisterConfig, RegisterGroupConfig};
    use modbus_gateway_bridge::diagnostics::{DeviceDiagnostics, DiagnosticsThresholds};
    use modbus_gateway_bridge::scheduler::Scheduler;
    use support::RecordingPublisher;

    let device = DeviceConfig {
        key: "meter1".into(),
        name: "meter1".into(),
        slave_id: 11,
        poll_interval_ms: None,
        enabled: true,
        manufacturer: None,
        model: None,
        ha_id: None,
        groups: vec![RegisterGroupConfig {
            key: "power".into(),
            start_address: 0x3000,
            count: 4,
            enabled: true,
            slave_id: None,
            registers: vec![
                GroupRegisterConfig {
                    key: "power_active".into(),
                    display_name: "Active power".into(),
                    offset: 0,
                    unit: Some("W".into()),
                    scale: 1.0,
                    apply_abs: false,
                    device_class: Some("power".into()),
                    state_class: Some("measurement".into()),
                    min: None,
                    max: None,
                    max_change_per_hour: None,
                },
                GroupRegisterConfig {
                    key: "power_apparent".into(),
                    display_name: "Apparent power".into(),
                    offset: 4,
                    unit: Some("VA".into()),
                    scale: 1.0,
                    apply_abs: false,
                    device_class: Some("apparent_power".into()),
                    state_class: Some("measurement".into()),
                    min: None,
                    max: None,
                    max_change_per_hour: None,
                },
            ],
        }],
        calculated: vec![
            CalculatedValueConfig {
                key: "power_reactive".into(),
                formula: "sqrt(power_apparent^2 - power_active^2)".into(),
                scale: 1.0,
                unit: Some("var".into()),
                device_class: Some("reactive_power".into()),
                state_class: Some("measurement".into()),
                min: None,
                max: None,
            },
            CalculatedValueConfig {
                key: "power_reactive_doubled".into(),
                formula: "power_reactive * 2".into(),
                scale: 1.0,
                unit: Some("var".into()),
                device_class: Some("reactive_power".into()),
                state_class: Some("measurement".into()),
                min: None,
                max: None,
            },
        ],
    };

    let transport = Arc::new(FakeGatewayTransport::new());
    let active: f32 = 2400.0;
    let apparent: f32 = 3000.0;
    let mut prefix = vec![0x0B, 0x03, 0x08];
    prefix.extend_from_slice(&active.to_be_bytes());
    prefix.extend_from_slice(&apparent.to_be_bytes());
    transport.push_frame(append_crc(&prefix)).await;

    let devices = vec![device];
    let executor = Arc::new(executor_for(&devices, transport));
    let health = Arc::new(HealthMonitorSet::new(Duration::from_secs(15)));
    let diagnostics = Arc::new(DeviceDiagnostics::new(DiagnosticsThresholds::default()));
    let publisher = Arc::new(RecordingPublisher::new());

    let scheduler = Scheduler::new(
        &devices,
        Duration::from_millis(50),
        executor,
        health,
        diagnostics,
        publisher.clone(),
    );
    let scheduler = Arc::new(scheduler);

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_millis(250)).await;
    task.abort();

    let doubled = publisher
        .state_for("power_reactive_doubled")
        .expect("chained calculated value was published");
    assert!((doubled.value - 3600.0).abs() < 0.01);
}

/// A group that fails on every tick (no frame queued, so every read times
/// out) emits a rate-limited bridge diagnostic instead of one per tick.
#[tokio::test]
async fn scheduler_rate_limits_bridge_diagnostics() {
    use modbus_gateway_bridge::diagnostics::{DeviceDiagnostics, DiagnosticsThresholds};
    use modbus_gateway_bridge::scheduler::Scheduler;
    use support::RecordingPublisher;

    let transport = Arc::new(FakeGatewayTransport::new());
    let devices = vec![voltage_device("meter1", 11, 2)];
    let executor = Arc::new(executor_for(&devices, transport));
    let health = Arc::new(HealthMonitorSet::new(Duration::from_secs(15)));
    let diagnostics = Arc::new(DeviceDiagnostics::new(DiagnosticsThresholds::default()));
    let publisher = Arc::new(RecordingPublisher::new());

    let scheduler = Scheduler::new(
        &devices,
        Duration::from_millis(20),
        executor,
        health,
        diagnostics,
        publisher.clone(),
    );
    let scheduler = Arc::new(scheduler);

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_millis(300)).await;
    task.abort();

    let diagnostics = publisher.bridge_diagnostics.lock().unwrap();
    // The breaker trips to open after a handful of consecutive timeouts,
    // which changes the error code once; within each code's own window the
    // repeated failures must collapse to a single diagnostic.
    let mut seen_codes = std::collections::HashSet::new();
    for (code, _) in diagnostics.iter() {
        assert!(seen_codes.insert(*code), "error code {code} was reported more than once within the rate limit window");
    }
    assert!(!diagnostics.is_empty(), "a failing group must eventually emit a bridge diagnostic");
}
