use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CycleEngine;

/// What to do after a cycle took `elapsed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep for the rest of the period
    Sleep(Duration),
    /// The cycle overran; start the next one right away
    Overrun(Duration),
}

/// A cycle that used exactly its period is on time; only `elapsed > period`
/// counts as an overrun.
pub fn pace(elapsed: Duration, period: Duration) -> Pacing {
    match period.checked_sub(elapsed) {
        Some(rest) => Pacing::Sleep(rest),
        None => Pacing::Overrun(elapsed - period),
    }
}

impl CycleEngine {
    /// Runs cycles until `shutdown` is cancelled. Cancellation is observed
    /// between cycles only, so a started cycle always completes.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            cycle_period_ms = self.config().cycle_period_ms,
            io_timeout_ms = self.config().io_timeout_ms,
            "cycle engine started"
        );

        while !shutdown.is_cancelled() {
            if let Some(config) = self.pending_config() {
                self.reconfigure(config);
            }

            let started = tokio::time::Instant::now();
            let cycle = self.run_cycle().await;
            let period = self.config().cycle_period();

            match pace(started.elapsed(), period) {
                Pacing::Sleep(rest) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(rest) => {}
                    }
                }
                Pacing::Overrun(by) => {
                    let overruns = self.record_overrun();
                    warn!(
                        cycle = cycle.number,
                        overrun_ms = by.as_millis() as u64,
                        period_ms = period.as_millis() as u64,
                        overruns,
                        "cycle overran its period"
                    );
                }
            }
        }

        info!(cycles = self.cycle_number(), "cycle engine stopped");
    }
}
