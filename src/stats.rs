use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide counter set. All counters are monotonic for the lifetime of
/// the run; updates are plain atomic adds so no lock is needed anywhere.
#[derive(Debug, Default)]
pub struct Counters {
    pub received: AtomicU64,
    pub sent: AtomicU64,
    pub errors: AtomicU64,
    pub updated: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub items_cache_reads: AtomicU64,
    pub items_cache_writes: AtomicU64,
    pub macros_written: AtomicU64,
    pub macros_read: AtomicU64,
    pub macros_expired: AtomicU64,
    /// Highest `clock` seen on the replication stream, unix seconds.
    /// 0 until the first row arrives.
    last_clock: AtomicI64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_clock(&self, clock: i64) {
        self.last_clock.fetch_max(clock, Ordering::Relaxed);
    }

    /// Replication lag in seconds, or `None` before any data has been seen.
    pub fn delay_seconds(&self, now: i64) -> Option<i64> {
        let last = self.last_clock.load(Ordering::Relaxed);
        if last == 0 {
            None
        } else {
            Some((now - last).max(0))
        }
    }

    /// Snapshot of every counter as `(name, value)` pairs, in the order the
    /// telemetry loop emits them.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("received", self.received.load(Ordering::Relaxed)),
            ("sent", self.sent.load(Ordering::Relaxed)),
            ("errors", self.errors.load(Ordering::Relaxed)),
            ("updated", self.updated.load(Ordering::Relaxed)),
            ("rows_skipped", self.rows_skipped.load(Ordering::Relaxed)),
            (
                "items_cache_reads",
                self.items_cache_reads.load(Ordering::Relaxed),
            ),
            (
                "items_cache_writes",
                self.items_cache_writes.load(Ordering::Relaxed),
            ),
            ("macros_written", self.macros_written.load(Ordering::Relaxed)),
            ("macros_read", self.macros_read.load(Ordering::Relaxed)),
            ("macros_expired", self.macros_expired.load(Ordering::Relaxed)),
        ]
    }
}

/// Bump a counter by one.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bump a counter by `n`.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
