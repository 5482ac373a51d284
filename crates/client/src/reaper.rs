// Periodic eviction of stale presence, cursor and selection entries.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::CollaborationContext;

/// Entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub presence: usize,
    pub cursors: usize,
    pub selections: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.presence + self.cursors + self.selections
    }
}

pub fn spawn_reaper(context: CollaborationContext, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = context.sweep(Utc::now()).await;
            if report.total() > 0 {
                debug!(
                    presence = report.presence,
                    cursors = report.cursors,
                    selections = report.selections,
                    "reaper evicted stale entries"
                );
            }
        }
    })
}
