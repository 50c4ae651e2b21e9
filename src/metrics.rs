//! Runtime instrumentation seam: the executor and scheduler call into this
//! on every read and publish so the optional HTTP metrics surface (feature
//! `http`) has real counters to report instead of a permanently zeroed one.

use std::time::Duration;

/// Counters and gauges updated as the executor/scheduler run.
pub trait MetricsSink: Send + Sync {
    fn record_read(&self, ok: bool, duration: Duration);
    fn record_publish(&self, ok: bool);
    fn set_gateway_online(&self, online: bool);
}

/// Discards everything; installed by default when no metrics surface is
/// wired up (e.g. the `http` feature is disabled).
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_read(&self, _ok: bool, _duration: Duration) {}
    fn record_publish(&self, _ok: bool) {}
    fn set_gateway_online(&self, _online: bool) {}
}
