use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by handler and flush tasks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    admitted: AtomicU64,
    decode_failures: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    rows_rejected: AtomicU64,
    given_up: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub decode_failures: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rows_rejected: u64,
    pub given_up: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self, n: u64) {
        self.acked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_requeued(&self, n: u64) {
        self.requeued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, n: u64) {
        self.rows_rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_given_up(&self, n: u64) {
        self.given_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_batch(&self, failed: bool) {
        if failed {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            rows_rejected: self.rows_rejected.load(Ordering::Relaxed),
            given_up: self.given_up.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}
