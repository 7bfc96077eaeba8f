//! Periodic resync.
//!
//! While a user is logged in, the reconnect handlers are re-run on a fixed
//! period so state that drifted without a visible disconnect catches up.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::manager::WebsocketManager;
use crate::saga::{SagaCancel, SagaRunner};

pub const PERIODIC_SYNC_SAGA: &str = "periodic-sync";

pub const SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// (Re)start the periodic sync saga, replacing any run already going.
pub fn start_periodic_sync(
    runner: &SagaRunner,
    manager: Arc<WebsocketManager>,
    period: Duration,
) -> SagaCancel {
    runner.replace_saga(PERIODIC_SYNC_SAGA, async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !manager.is_logged_in() {
                continue;
            }
            debug!(
                component = "sync",
                event = "sync.tick",
                "Running periodic sync"
            );
            manager.run_reconnect_handlers();
        }
    })
}

/// Stop the periodic sync saga. Stopping when it is not running is fine.
pub fn stop_periodic_sync(runner: &SagaRunner) {
    if runner.is_saga_running(PERIODIC_SYNC_SAGA) {
        let _ = runner.cancel_saga(PERIODIC_SYNC_SAGA);
    }
}
