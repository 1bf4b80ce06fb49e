use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pipeline counters for one coordinator
#[derive(Debug, Default)]
pub struct PipelineStats {
    submitted: AtomicU64,
    fold_failures: AtomicU64,
    completed: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    peak_tracked_keys: AtomicUsize,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self, tracked_keys: usize) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.peak_tracked_keys
            .fetch_max(tracked_keys, Ordering::Relaxed);
    }

    pub(crate) fn record_fold_failure(&self) {
        self.fold_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, timed_out: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            fold_failures: self.fold_failures.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            peak_tracked_keys: self.peak_tracked_keys.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStatsSnapshot {
    pub submitted: u64,
    pub fold_failures: u64,
    pub completed: u64,
    pub superseded: u64,
    /// Includes timeouts
    pub failed: u64,
    pub timed_out: u64,
    pub peak_tracked_keys: usize,
}

impl PipelineStatsSnapshot {
    /// Pipelines that reached a terminal phase
    pub fn finished(&self) -> u64 {
        self.completed + self.superseded + self.failed
    }

    /// Share of finished pipelines that were superseded by a newer trigger
    pub fn supersede_ratio(&self) -> f64 {
        let finished = self.finished();
        if finished == 0 {
            0.0
        } else {
            self.superseded as f64 / finished as f64
        }
    }
}
