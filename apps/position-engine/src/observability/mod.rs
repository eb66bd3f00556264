//! Tracing subscriber setup and Prometheus metrics.

pub mod metrics;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub use metrics::{MetricsError, init_metrics};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false` if
/// a subscriber was already installed (tests install their own).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("position_engine={}", config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.format.eq_ignore_ascii_case("pretty") {
        builder.pretty().try_init()
    } else {
        builder
            .json()
            .with_current_span(config.include_spans)
            .with_span_list(config.include_spans)
            .try_init()
    };
    installed.is_ok()
}
