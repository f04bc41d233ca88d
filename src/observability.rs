use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "deskslot_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "deskslot_operation_duration_seconds";

/// Counter: admissions refused by the storage exclusion constraint after
/// passing admission control. Should stay at zero.
pub const EXCLUSION_BACKSTOP_TOTAL: &str = "deskslot_exclusion_backstop_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent acquiring resource write locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "deskslot_lock_wait_seconds";

/// Counter: lock acquisitions that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "deskslot_lock_timeouts_total";

/// Gauge: number of loaded organizations.
pub const TENANTS_ACTIVE: &str = "deskslot_tenants_active";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "deskslot_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskslot_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count one operation by outcome and record its latency.
pub fn record<T>(op: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
