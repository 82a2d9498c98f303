//! Milestone progress logging.
//!
//! Milestones follow completion order, not input order: small batches log
//! every completion, larger ones log at {1, 5, 10, ...} and at the end.

use std::time::Instant;
use tracing::info;

pub(crate) struct ProgressTracker {
    total: usize,
    completed: usize,
    succeeded: usize,
    failed: usize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            succeeded: 0,
            failed: 0,
            started: Instant::now(),
        }
    }

    pub fn on_complete(&mut self, success: bool) {
        self.completed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if !self.is_milestone() {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.completed as f64 / elapsed
        } else {
            0.0
        };
        let eta_secs = if rate > 0.0 {
            (self.total - self.completed) as f64 / rate
        } else {
            0.0
        };
        info!(
            completed = self.completed,
            total = self.total,
            successful = self.succeeded,
            failed = self.failed,
            rate_per_sec = format!("{rate:.2}").as_str(),
            eta_secs = format!("{eta_secs:.1}").as_str(),
            "batch progress"
        );
    }

    fn is_milestone(&self) -> bool {
        self.total <= 5
            || self.completed == 1
            || self.completed % 5 == 0
            || self.completed == self.total
    }

    #[cfg(test)]
    fn milestones(total: usize) -> Vec<usize> {
        let mut tracker = Self::new(total);
        (1..=total)
            .filter(|_| {
                tracker.completed += 1;
                tracker.is_milestone()
            })
            .collect()
    }
}
