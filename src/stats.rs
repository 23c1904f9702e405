use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::names::NameCacheStats;

/// What happened during one capture pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub threads: usize,
    /// Frames written to the buffer. Frames dropped by truncation are not counted.
    pub frames: usize,
    pub bytes: usize,
    pub truncated: bool,
    /// Time between suspending and resuming the runtime.
    pub frozen: Duration,
    pub published: bool,
    pub suspend_error: Option<RuntimeError>,
    pub resume_error: Option<RuntimeError>,
    pub enumerate_error: Option<RuntimeError>,
    /// Threads whose stack walk failed, with the first failure seen.
    pub walk_failures: usize,
    pub first_walk_error: Option<RuntimeError>,
}

/// Counters shared between the sampling thread and whoever wants to report on overhead.
#[derive(Default)]
pub struct SamplerStats {
    passes: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
    truncated: AtomicU64,
    failed_resumes: AtomicU64,
    last_frozen_micros: AtomicU64,
    max_frozen_micros: AtomicU64,
    total_frozen_micros: AtomicU64,
    names: Mutex<NameCacheStats>,
}

impl SamplerStats {
    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self, report: &PassReport) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        if report.published {
            self.published.fetch_add(1, Ordering::Relaxed);
        }
        if report.truncated {
            self.truncated.fetch_add(1, Ordering::Relaxed);
        }
        if report.resume_error.is_some() {
            self.failed_resumes.fetch_add(1, Ordering::Relaxed);
        }
        let micros = report.frozen.as_micros() as u64;
        self.last_frozen_micros.store(micros, Ordering::Relaxed);
        self.max_frozen_micros.fetch_max(micros, Ordering::Relaxed);
        self.total_frozen_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// A resume that failed outside any pass report, while unwinding out of the frozen window.
    pub fn record_failed_resume(&self) {
        self.failed_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_names(&self, names: NameCacheStats) {
        *self.names.lock() = names;
    }

    /// `dropped` is left at zero; only the exchange knows it.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            failed_resumes: self.failed_resumes.load(Ordering::Relaxed),
            last_frozen_micros: self.last_frozen_micros.load(Ordering::Relaxed),
            max_frozen_micros: self.max_frozen_micros.load(Ordering::Relaxed),
            total_frozen_micros: self.total_frozen_micros.load(Ordering::Relaxed),
            dropped: 0,
            names: *self.names.lock(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub passes: u64,
    /// Intervals skipped because the reader had not drained anything.
    pub skipped: u64,
    pub published: u64,
    /// Published buffers the exchange had to throw away.
    pub dropped: u64,
    pub truncated: u64,
    pub failed_resumes: u64,
    pub last_frozen_micros: u64,
    pub max_frozen_micros: u64,
    pub total_frozen_micros: u64,
    pub names: NameCacheStats,
}
