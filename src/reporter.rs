//! Progress reporter — logs the scheduler's counters on an interval.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::scheduler::{StatusHandle, StatusSnapshot};

/// Spawn the progress ticker. Logs only when the counters changed since the
/// last tick.
pub fn spawn_progress_reporter(status: StatusHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        let mut last: Option<StatusSnapshot> = None;
        loop {
            ticker.tick().await;
            let snapshot = status.snapshot();
            if should_report(last.as_ref(), &snapshot) {
                tracing::info!(
                    launched = snapshot.launched,
                    alive = snapshot.alive,
                    finished = snapshot.finished,
                    total = snapshot.total,
                    "Progress"
                );
            }
            last = Some(snapshot);
        }
    })
}

fn should_report(last: Option<&StatusSnapshot>, current: &StatusSnapshot) -> bool {
    last != Some(current)
}
