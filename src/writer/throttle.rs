use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Lets at most `limit` log calls through per `interval`; the rest are counted and skipped.
///
/// Lock-free: called from sender pool outcome callbacks on the drop path.
pub struct ThrottledLogger {
    limit: u32,
    interval_ms: u64,
    origin: Instant,
    /// Start of the current window, in ms since `origin`.
    window_start_ms: AtomicU64,
    emitted: AtomicU32,
    suppressed: AtomicU64,
}

impl ThrottledLogger {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval_ms: interval.as_millis() as u64,
            origin: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            emitted: AtomicU32::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Run `log` unless the current window is exhausted. `log` receives the
    /// number of calls suppressed since the previous emitted one.
    /// Returns whether it ran.
    pub fn emit(&self, log: impl FnOnce(u64)) -> bool {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) >= self.interval_ms
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.emitted.store(0, Ordering::Release);
        }

        let admitted = self
            .emitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        log(self.suppressed.swap(0, Ordering::AcqRel));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn allows_limit_per_interval() {
        let throttle = ThrottledLogger::new(5, Duration::from_secs(10));
        let emitted = (0..8).filter(|_| throttle.emit(|_| {})).count();
        assert_eq!(emitted, 5);

        tokio::time::advance(Duration::from_secs(10)).await;
        let mut skipped = None;
        assert!(throttle.emit(|n| skipped = Some(n)));
        assert_eq!(skipped, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn window_does_not_reset_early() {
        let throttle = ThrottledLogger::new(1, Duration::from_secs(10));
        assert!(throttle.emit(|_| {}));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!throttle.emit(|_| {}));
    }

    #[test]
    fn concurrent_callers_share_one_budget() {
        let throttle = Arc::new(ThrottledLogger::new(5, Duration::from_secs(3600)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                std::thread::spawn(move || (0..100).filter(|_| throttle.emit(|_| {})).count())
            })
            .collect();
        let emitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(emitted, 5);
    }
}
