//! Periodic advisory stop polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::execution::{AdvisoryPort, ExecutionController, StopUpdate};

/// What one advisory pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdvisoryReport {
    /// Positions whose advisor was asked.
    pub polled: usize,
    /// Stops moved.
    pub applied: Vec<String>,
    /// Proposals refused by a validation rule.
    pub rejected: Vec<String>,
    /// Failures.
    pub errors: Vec<String>,
}

/// Asks the advisory port for stop suggestions, each position at its mode's
/// `advisory_interval_secs`.
pub struct AdvisoryPoller {
    controller: Arc<ExecutionController>,
    port: Arc<dyn AdvisoryPort>,
    last_polled: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl std::fmt::Debug for AdvisoryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryPoller")
            .field("tracked", &self.last_polled.lock().len())
            .finish_non_exhaustive()
    }
}

impl AdvisoryPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(controller: Arc<ExecutionController>, port: Arc<dyn AdvisoryPort>) -> Self {
        Self {
            controller,
            port,
            last_polled: Mutex::new(HashMap::new()),
        }
    }

    /// Shortest advisory interval across enabled modes.
    fn period(&self) -> Duration {
        let modes = &self.controller.config().modes;
        let secs = modes
            .enabled()
            .map(|mode| modes.get(mode).advisory_interval_secs)
            .min()
            .unwrap_or(60);
        Duration::from_secs(secs.max(1))
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.period();
        tracing::info!(interval_secs = period.as_secs(), "Advisory poller started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Advisory poller shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_once(Utc::now()).await;
                    tracing::debug!(
                        polled = report.polled,
                        applied = report.applied.len(),
                        rejected = report.rejected.len(),
                        "Advisory pass"
                    );
                }
            }
        }
    }

    /// Poll every position whose interval has elapsed at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> AdvisoryReport {
        let mut report = AdvisoryReport::default();
        let positions = self.controller.registry().snapshot_all();
        self.last_polled
            .lock()
            .retain(|symbol, _| positions.iter().any(|p| &p.symbol == symbol));

        for position in positions {
            if position.is_closing() || position.protection.dust {
                continue;
            }
            let symbol = position.symbol.as_str();
            let every = self.controller.config().modes.get(position.mode).advisory_interval_secs;
            let due = self.last_polled.lock().get(symbol).is_none_or(|last| {
                now - *last >= chrono::Duration::seconds(i64::try_from(every).unwrap_or(i64::MAX))
            });
            if !due {
                continue;
            }
            self.last_polled.lock().insert(symbol.to_string(), now);
            report.polled += 1;

            let mark = match self.controller.gateway().mark_price(symbol).await {
                Ok(mark) => mark,
                Err(e) => {
                    report.errors.push(format!("{symbol}: mark price: {e}"));
                    continue;
                }
            };
            let proposed = match self
                .port
                .suggest_stop(symbol, position.side, mark, position.stop_price())
                .await
            {
                Ok(Some(stop)) => stop,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(symbol = %symbol, error = %e, "Advisor gave no answer");
                    report.errors.push(format!("{symbol}: {e}"));
                    continue;
                }
            };

            match self.controller.apply_advisory_stop(symbol, proposed).await {
                Ok(StopUpdate::Applied { .. }) => report.applied.push(symbol.to_string()),
                Ok(StopUpdate::Rejected(_)) => report.rejected.push(symbol.to_string()),
                Ok(StopUpdate::Skipped) => {}
                Err(e) => report.errors.push(format!("{symbol}: {e}")),
            }
        }
        report
    }
}
