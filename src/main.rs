use clap::Parser;
use modbus_gateway_bridge::breaker::{BreakerConfig, CircuitBreaker};
use modbus_gateway_bridge::cache::ValueCache;
use modbus_gateway_bridge::cli::Args;
use modbus_gateway_bridge::config::BridgeConfig;
use modbus_gateway_bridge::diagnostics::{DeviceDiagnostics, DiagnosticsThresholds};
use modbus_gateway_bridge::executor::StrategyExecutor;
use modbus_gateway_bridge::health::HealthMonitorSet;
use modbus_gateway_bridge::metrics::MetricsSink;
#[cfg(not(feature = "http"))]
use modbus_gateway_bridge::metrics::NoopMetrics;
use modbus_gateway_bridge::publisher::{DeviceInfo, MqttPublisher, Publisher, PublisherConfig};
use modbus_gateway_bridge::scheduler::Scheduler;
use modbus_gateway_bridge::transport::{GatewayTransport, MqttGateway, MqttGatewayConfig};
use modbus_gateway_bridge::types::{ResultStatus, SensorResult};
use modbus_gateway_bridge::{logging, DeviceConfig, VERSION};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!(version = VERSION, "starting modbus-gateway-bridge");

    let raw = std::fs::read_to_string(&args.config)
        .map_err(|err| anyhow::anyhow!("reading config {}: {err}", args.config.display()))?;
    let config: BridgeConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;

    let gateway_config = MqttGatewayConfig::from_broker(&config.broker, &config.bridge_availability_topic);
    let transport: Arc<dyn GatewayTransport> = MqttGateway::new(gateway_config);

    let publisher_config = PublisherConfig::from_broker(
        &config.broker,
        &config.discovery_prefix,
        &config.bridge_availability_topic,
        &config.bridge_diagnostic_topic,
    );
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(publisher_config));

    if args.diagnostic {
        return run_diagnostic(transport, publisher).await;
    }

    transport.connect().await?;
    publisher.publish_availability_online().await?;
    publish_discovery(&config.devices, &publisher).await?;

    #[cfg(feature = "http")]
    let http_metrics = Arc::new(modbus_gateway_bridge::http::BridgeMetrics::new()?);
    #[cfg(feature = "http")]
    let metrics_sink: Arc<dyn MetricsSink> = http_metrics.clone();
    #[cfg(not(feature = "http"))]
    let metrics_sink: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let cache = Arc::new(ValueCache::new(Duration::from_secs(300)));
    let timeout = Duration::from_millis(config.modbus_defaults.timeout_ms);
    let register_delay = Duration::from_millis(config.modbus_defaults.register_delay_ms);
    let energy_delay = Duration::from_millis(config.modbus_defaults.energy_delay_ms);
    let executor = Arc::new(
        StrategyExecutor::new(
            &config.devices,
            transport.clone(),
            breaker,
            cache,
            timeout,
            register_delay,
            energy_delay,
        )
        .with_metrics(metrics_sink.clone()),
    );

    let health = Arc::new(HealthMonitorSet::new(Duration::from_secs(15)));
    let diagnostics = Arc::new(DeviceDiagnostics::new(DiagnosticsThresholds::default()));

    #[cfg(feature = "http")]
    let diagnostics_for_http = diagnostics.clone();
    #[cfg(feature = "http")]
    let health_for_http = health.clone();
    #[cfg(feature = "http")]
    let publisher_for_http = publisher.clone();

    let default_period = Duration::from_millis(config.modbus_defaults.poll_interval_ms);
    let scheduler = Arc::new(
        Scheduler::new(
            &config.devices,
            default_period,
            executor,
            health,
            diagnostics,
            publisher.clone(),
        )
        .with_metrics(metrics_sink),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    #[cfg(feature = "http")]
    if let Some(addr) = args.http_addr.clone() {
        let health_state = Arc::new(tokio::sync::RwLock::new(modbus_gateway_bridge::http::HealthState::default()));

        let sampler_state = health_state.clone();
        let sampler_transport = transport.clone();
        let mut bridge_online = true;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                let snapshots = diagnostics_for_http.all_snapshots().await;
                let success_count = snapshots.iter().map(|m| m.successful_reads).sum();
                let error_count = snapshots.iter().map(|m| m.failed_reads).sum();
                let last_successful_poll = snapshots.iter().filter_map(|m| m.last_success).max();
                let gateway_connected = sampler_transport.is_connected().await;
                let mut state = sampler_state.write().await;
                state.gateway_online = gateway_connected;
                state.success_count = success_count;
                state.error_count = error_count;
                state.last_successful_poll = last_successful_poll;
                drop(state);

                let fleet_online = health_for_http.all_online_or_grace().await;
                if fleet_online != bridge_online {
                    bridge_online = fleet_online;
                    let outcome = if bridge_online {
                        publisher_for_http.publish_availability_online().await
                    } else {
                        publisher_for_http.publish_availability_offline().await
                    };
                    if let Err(err) = outcome {
                        error!(%err, "failed to republish bridge availability on fleet health transition");
                    }
                }
            }
        });

        tokio::spawn(async move {
            if let Err(err) = modbus_gateway_bridge::http::serve(&addr, http_metrics, health_state).await {
                error!(%err, "http server exited");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = publisher.publish_availability_offline().await;
    let _ = transport.disconnect().await;

    Ok(())
}

/// Publishes the retained Home Assistant discovery document for every
/// enabled sensor, calculated value, and device diagnostic entity.
/// Run once at startup so entities exist in the registry before the first
/// state publish arrives.
async fn publish_discovery(devices: &[DeviceConfig], publisher: &Arc<dyn Publisher>) -> anyhow::Result<()> {
    for device in devices.iter().filter(|d| d.enabled) {
        let info = DeviceInfo {
            identifiers: vec![device.ha_id()],
            name: device.name.clone(),
            manufacturer: device.manufacturer.clone(),
            model: device.model.clone(),
        };

        for group in device.groups.iter().filter(|g| g.enabled) {
            for register in &group.registers {
                let placeholder = SensorResult {
                    device_key: device.key.clone(),
                    sensor_key: register.key.clone(),
                    display_name: register.display_name.clone(),
                    value: 0.0,
                    unit: register.unit.clone(),
                    device_class: register.device_class.clone(),
                    state_class: register.state_class.clone(),
                    status: ResultStatus::Missing,
                    raw: Vec::new(),
                };
                publisher.publish_sensor_discovery(&placeholder, &info).await?;
            }
        }

        for calc in &device.calculated {
            let placeholder = SensorResult {
                device_key: device.key.clone(),
                sensor_key: calc.key.clone(),
                display_name: calc.key.clone(),
                value: 0.0,
                unit: calc.unit.clone(),
                device_class: calc.device_class.clone(),
                state_class: calc.state_class.clone(),
                status: ResultStatus::Missing,
                raw: Vec::new(),
            };
            publisher.publish_sensor_discovery(&placeholder, &info).await?;
        }

        publisher.publish_device_diagnostic_discovery(&device.key, &info).await?;
    }

    Ok(())
}

/// Runs a one-shot connectivity probe: connect to the broker, publish
/// availability online, then disconnect. Exits non-zero on failure.
async fn run_diagnostic(transport: Arc<dyn GatewayTransport>, publisher: Arc<dyn Publisher>) -> anyhow::Result<()> {
    transport.connect().await?;
    publisher.publish_availability_online().await?;
    info!("diagnostic probe succeeded: broker reachable");
    publisher.publish_availability_offline().await?;
    transport.disconnect().await?;
    Ok(())
}
