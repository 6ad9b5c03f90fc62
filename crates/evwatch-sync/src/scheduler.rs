use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{is_detailed_run, SyncConfig};
use crate::gate::CycleGate;
use crate::pipeline::{CycleError, Pipeline};

/// How long to wait before the first cycle, given when the last fetch of any source started.
///
/// No history, or a last fetch at least one interval ago, means start immediately.
pub fn startup_delay(
    latest_fetch: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> Duration {
    let Some(latest) = latest_fetch else {
        return Duration::ZERO;
    };
    match now.signed_duration_since(latest).to_std() {
        Ok(elapsed) => interval.saturating_sub(elapsed),
        // Clock went backwards; wait a full interval rather than fetching twice.
        Err(_) => interval,
    }
}

/// Drives cycles on a fixed interval until cancelled.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    gate: CycleGate,
    interval: Duration,
    detailed_every: u32,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration, detailed_every: u32) -> Self {
        Self {
            pipeline,
            gate: CycleGate::new(),
            interval,
            detailed_every,
        }
    }

    pub fn from_config(pipeline: Arc<Pipeline>, config: &SyncConfig) -> Self {
        Self::new(pipeline, config.fetch_interval, config.fetch_detailed_every)
    }

    /// Gate shared with manually triggered cycles.
    pub fn gate(&self) -> CycleGate {
        self.gate.clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Runs until `cancel` fires. Failed or panicking cycles are logged and do not stop the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        let latest = match self.pipeline.store().latest_fetch_started_at().await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(error = %err, "could not read latest fetch time; starting without delay");
                None
            }
        };
        let delay = startup_delay(latest, Utc::now(), self.interval);
        info!(
            interval_secs = self.interval.as_secs(),
            detailed_every = self.detailed_every,
            startup_delay_secs = delay.as_secs(),
            "scheduler started"
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopped before first cycle");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut run_index: u64 = 0;
        loop {
            let detailed = is_detailed_run(run_index, self.detailed_every);
            let cycle = {
                let pipeline = Arc::clone(&self.pipeline);
                let gate = self.gate.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pipeline.run_cycle(&gate, detailed, &cancel).await })
            };
            match cycle.await {
                Ok(Ok(report)) => info!(
                    run_id = %report.run_id,
                    new_items = report.new_items,
                    updated_items = report.updated_items,
                    "scheduled cycle completed"
                ),
                Ok(Err(CycleError::Cancelled)) => break,
                Ok(Err(err)) => error!(error = %err, "scheduled cycle failed"),
                Err(err) => error!(error = %err, "scheduled cycle aborted"),
            }
            run_index += 1;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        info!("scheduler stopped");
    }
}
