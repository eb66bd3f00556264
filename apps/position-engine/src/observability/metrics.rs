//! Prometheus metrics for the position engine.
//!
//! All recorders are no-ops until [`init_metrics`] installs the exporter, so
//! library code calls them unconditionally.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Start the Prometheus exporter on the configured address.
///
/// # Errors
///
/// Returns an error if the address does not parse or the listener cannot be
/// installed (e.g. port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e: std::net::AddrParseError| MetricsError::Configuration(e.to_string()))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// ============================================================================
// Entries and exits
// ============================================================================

/// Record an opened position.
pub fn record_entry(mode: &str, provenance: &str) {
    counter!(
        "position_entries_total",
        "mode" => mode.to_string(),
        "provenance" => provenance.to_string()
    )
    .increment(1);
}

/// Record a rejected entry.
///
/// * `reason` - Stable reason label (e.g. `"allocation_limit"`, `"breaker_paused"`)
pub fn record_rejection(mode: &str, reason: &str) {
    counter!(
        "position_entry_rejections_total",
        "mode" => mode.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a full close and its realized PnL.
pub fn record_close(mode: &str, reason: &str, pnl: f64) {
    counter!(
        "position_closes_total",
        "mode" => mode.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    histogram!("position_close_pnl", "mode" => mode.to_string()).record(pnl);
}

/// Record an executed take-profit level.
pub fn record_take_profit(mode: &str, level: usize) {
    counter!(
        "take_profit_hits_total",
        "mode" => mode.to_string(),
        "level" => (level + 1).to_string()
    )
    .increment(1);
}

/// Record a stop moved on the exchange.
pub fn record_stop_move(cause: &str) {
    counter!("stop_moves_total", "cause" => cause.to_string()).increment(1);
}

/// Update the open positions gauge.
pub fn update_open_positions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("open_positions").set(count as f64);
}

// ============================================================================
// Protection
// ============================================================================

/// Record a heal attempt.
///
/// * `outcome` - `"healed"` or `"failed"`
pub fn record_heal(outcome: &str) {
    counter!("protection_heals_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record an emergency close.
pub fn record_emergency(symbol: &str) {
    counter!("protection_emergencies_total", "symbol" => symbol.to_string()).increment(1);
}

/// Record a dust position surfaced for manual handling.
pub fn record_dust(symbol: &str) {
    counter!("protection_dust_total", "symbol" => symbol.to_string()).increment(1);
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Record a reconciliation mutation.
///
/// * `kind` - `"external_close"`, `"shrink"`, `"grow"`, `"adopt"`
pub fn record_reconciliation(kind: &str) {
    counter!("reconciliation_mutations_total", "kind" => kind.to_string()).increment(1);
}

/// Record a cancelled orphan order.
pub fn record_orphan_cancelled(kind: &str) {
    counter!("orphan_orders_cancelled_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Circuit breakers
// ============================================================================

/// Record a breaker trip.
pub fn record_breaker_trip(scope: &str, reason: &str) {
    counter!(
        "circuit_breaker_trips_total",
        "scope" => scope.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an instrument added to the blocklist.
pub fn record_instrument_blocked(permanent: bool) {
    counter!("instrument_blocks_total", "permanent" => permanent.to_string()).increment(1);
}

/// Record a supervised task restart.
pub fn record_task_restart(task: &str) {
    counter!("task_restarts_total", "task" => task.to_string()).increment(1);
}
