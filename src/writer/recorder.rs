use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::stats::WriterStats;
use super::throttle::ThrottledLogger;
use crate::sender::{EventData, EventRecorder, EventType};

/// Turns sender pool events into writer counters and logs.
pub struct WriterRecorder {
    stats: Arc<WriterStats>,
    easylog: ThrottledLogger,
}

impl WriterRecorder {
    pub fn new(stats: Arc<WriterStats>) -> Self {
        Self {
            stats,
            // no more than 5 messages every 10 seconds
            easylog: ThrottledLogger::new(5, Duration::from_secs(10)),
        }
    }
}

impl EventRecorder for WriterRecorder {
    fn record_event(&self, event: EventType, data: &EventData) {
        let stats = &self.stats;
        match event {
            EventType::Retry => {
                debug!(
                    attempt = data.attempt,
                    error = data.error.as_deref().unwrap_or(""),
                    "retrying pipeline stats payload"
                );
                WriterStats::add(&stats.retries, 1);
            }
            EventType::Sent => {
                debug!(
                    bytes = data.bytes,
                    duration_ms = data.duration.as_millis() as u64,
                    "flushed pipeline stats to the API"
                );
                WriterStats::add(&stats.payloads, 1);
                WriterStats::add(&stats.bytes, data.bytes as i64);
                WriterStats::add(&stats.flush_duration_us, data.duration.as_micros() as i64);
            }
            EventType::Rejected => {
                warn!(
                    error = data.error.as_deref().unwrap_or(""),
                    attempts = data.attempt,
                    "pipeline stats payload rejected"
                );
                WriterStats::add(&stats.errors, 1);
            }
            EventType::Dropped => {
                WriterStats::add(&stats.dropped, 1);
                WriterStats::add(&stats.dropped_bytes, data.bytes as i64);
                self.easylog.emit(|suppressed| {
                    warn!(
                        kb = data.bytes as f64 / 1024.0,
                        suppressed,
                        "pipeline stats writer queue full, payload dropped"
                    )
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(bytes: usize, duration_ms: u64) -> EventData {
        EventData {
            bytes,
            duration: Duration::from_millis(duration_ms),
            attempt: 1,
            error: None,
        }
    }

    #[tokio::test]
    async fn events_update_matching_counters() {
        let stats = Arc::new(WriterStats::default());
        let recorder = WriterRecorder::new(stats.clone());

        recorder.record_event(EventType::Sent, &data(100, 3));
        recorder.record_event(EventType::Sent, &data(50, 2));
        recorder.record_event(EventType::Retry, &data(50, 1));
        recorder.record_event(EventType::Rejected, &data(50, 1));
        recorder.record_event(EventType::Dropped, &data(4096, 0));

        let report = stats.swap();
        assert_eq!(report.payloads, 2);
        assert_eq!(report.bytes, 150);
        assert_eq!(report.flush_duration_us, 5_000);
        assert_eq!(report.retries, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.dropped_bytes, 4096);
    }

    #[tokio::test]
    async fn throttled_drops_are_still_counted() {
        let stats = Arc::new(WriterStats::default());
        let recorder = WriterRecorder::new(stats.clone());
        for _ in 0..20 {
            recorder.record_event(EventType::Dropped, &data(10, 0));
        }
        let report = stats.swap();
        assert_eq!(report.dropped, 20);
        assert_eq!(report.dropped_bytes, 200);
    }
}
