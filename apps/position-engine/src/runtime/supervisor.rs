//! Restart-on-failure wrapper for background loops.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;

/// Spawn `factory(cancel)` and keep it running until `cancel` fires.
///
/// A body that panics, or returns while the token is still live, is logged,
/// counted and started again after `restart_delay`. The returned handle
/// completes once the token is cancelled and the current body has returned.
pub fn supervise<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    restart_delay: Duration,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u64 = 0;
        loop {
            let result = tokio::spawn(factory(cancel.clone())).await;
            if cancel.is_cancelled() {
                break;
            }

            match result {
                Ok(()) => tracing::warn!(task = name, restarts, "Task exited while engine running"),
                Err(e) if e.is_panic() => {
                    tracing::error!(task = name, restarts, error = %e, "Task panicked");
                }
                Err(e) => tracing::warn!(task = name, restarts, error = %e, "Task aborted"),
            }
            restarts += 1;
            metrics::record_task_restart(name);

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(restart_delay) => {
                    tracing::info!(task = name, restarts, "Restarting task");
                }
            }
        }
        tracing::info!(task = name, "Task stopped");
    })
}
