//! Launch counters and the read-only status snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Process-wide launch accounting. Only the scheduler mutates it.
///
/// `alive` is derived, so `alive == launched - finished` cannot drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchCounters {
    launched: usize,
    finished: usize,
    total: usize,
}

impl LaunchCounters {
    pub fn new(total: usize) -> Self {
        Self {
            launched: 0,
            finished: 0,
            total,
        }
    }

    pub fn launched(&self) -> usize {
        self.launched
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn alive(&self) -> usize {
        self.launched - self.finished
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn record_launch(&mut self) {
        debug_assert!(self.launched < self.total, "launched past total");
        self.launched += 1;
    }

    /// Record an exit. Ignored if nothing is alive.
    pub fn record_exit(&mut self) {
        if self.alive() == 0 {
            tracing::warn!("Exit recorded with no live agents, ignoring");
            return;
        }
        self.finished += 1;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            launched: self.launched,
            alive: self.alive(),
            finished: self.finished,
            total: self.total,
        }
    }
}

/// What the progress reporter (or a status page) sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub launched: usize,
    pub alive: usize,
    pub finished: usize,
    pub total: usize,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "launched={}, alive={}, finished={}, total={}",
            self.launched, self.alive, self.finished, self.total
        )
    }
}

/// Cloneable read-only view of the scheduler's counters.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusHandle {
    pub(crate) fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        *self.rx.borrow()
    }

    /// Wait until the snapshot satisfies `pred`. Returns the matching
    /// snapshot, or `None` if the scheduler is gone.
    pub async fn wait_for(
        &mut self,
        pred: impl FnMut(&StatusSnapshot) -> bool,
    ) -> Option<StatusSnapshot> {
        self.rx.wait_for(pred).await.ok().map(|s| *s)
    }
}
