use std::sync::atomic::{AtomicI64, Ordering};

/// Writer counters. Shared between the writer task and the sender pool's tasks.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub client_payloads: AtomicI64,
    pub payloads: AtomicI64,
    pub stats_buckets: AtomicI64,
    pub stats_entries: AtomicI64,
    pub bytes: AtomicI64,
    pub retries: AtomicI64,
    pub splits: AtomicI64,
    pub errors: AtomicI64,
    pub dropped: AtomicI64,
    pub dropped_bytes: AtomicI64,
    /// Sum of delivery durations of sent payloads, in microseconds.
    pub flush_duration_us: AtomicI64,
}

/// Counter values taken by [`WriterStats::swap`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterReport {
    pub client_payloads: i64,
    pub payloads: i64,
    pub stats_buckets: i64,
    pub stats_entries: i64,
    pub bytes: i64,
    pub retries: i64,
    pub splits: i64,
    pub errors: i64,
    pub dropped: i64,
    pub dropped_bytes: i64,
    pub flush_duration_us: i64,
}

impl WriterStats {
    pub fn add(counter: &AtomicI64, n: i64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read every counter and reset it to zero.
    pub fn swap(&self) -> WriterReport {
        let take = |c: &AtomicI64| c.swap(0, Ordering::Relaxed);
        WriterReport {
            client_payloads: take(&self.client_payloads),
            payloads: take(&self.payloads),
            stats_buckets: take(&self.stats_buckets),
            stats_entries: take(&self.stats_entries),
            bytes: take(&self.bytes),
            retries: take(&self.retries),
            splits: take(&self.splits),
            errors: take(&self.errors),
            dropped: take(&self.dropped),
            dropped_bytes: take(&self.dropped_bytes),
            flush_duration_us: take(&self.flush_duration_us),
        }
    }
}

impl WriterReport {
    pub fn is_zero(&self) -> bool {
        *self == WriterReport::default()
    }
}
