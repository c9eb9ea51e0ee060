use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::retention::{RetentionSweeper, SweepReport};

#[derive(Clone, Copy, Debug)]
pub struct RetentionSchedule {
    pub every: Duration,
    pub days: u32,
    pub purge_audit: bool,
}

/// Run one sweep on the blocking pool.
pub async fn run_once(sweeper: Arc<RetentionSweeper>, schedule: RetentionSchedule) -> Result<SweepReport, EngineError> {
    tokio::task::spawn_blocking(move || sweeper.sweep(schedule.days, schedule.purge_audit))
        .await
        .map_err(|e| EngineError::Internal(format!("sweep task failed: {e}")))?
}

/// Start a background task that sweeps every `schedule.every`. The first
/// sweep happens one interval after startup.
pub fn spawn_retention_schedule(sweeper: Arc<RetentionSweeper>, schedule: RetentionSchedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(schedule.every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match run_once(sweeper.clone(), schedule).await {
                Ok(report) => info!(removed = report.total_removed(), "scheduled retention sweep"),
                Err(EngineError::SweepInProgress) => info!("scheduled sweep skipped, another sweep is running"),
                Err(e) => warn!(error = %e, "scheduled retention sweep failed"),
            }
        }
    })
}
