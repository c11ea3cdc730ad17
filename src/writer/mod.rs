// src/writer/mod.rs
//! Delivery of aggregated pipeline stats: splitting, encoding, queue sizing
//! and periodic counter reports.

mod encode;
mod recorder;
mod stats;
mod throttle;

pub use encode::{encode_payload, payload_headers, split_payload, EncodeError, HEADER_LANGUAGES};
pub use recorder::WriterRecorder;
pub use stats::{WriterReport, WriterStats};
pub use throttle::ThrottledLogger;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cli::config::AgentConfig;
use crate::info::Languages;
use crate::payload::PipelineStatsPayload;
use crate::sender::{
    HttpSenderPool, HttpTransport, Payload, PoolConfig, RetryConfig, SenderLimits, SenderPool,
};

/// Upper bound on stat entries in one outgoing payload.
pub const MAX_ENTRIES_PER_PAYLOAD: usize = 4000;
/// Rough encoded size of one entry, used to size the sender queue.
pub const BYTES_PER_ENTRY: u64 = 375;
pub const DEFAULT_CONNECTION_LIMIT: usize = 20;
/// How often counters are swapped and reported.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_QUEUE_MEMORY: u64 = 250 * 1024 * 1024;
const RETRY_BASE_MS: u64 = 100;
const RETRY_MAX_MS: u64 = 10_000;

/// Connection limit and queue depth for the sender pool.
///
/// Without an explicit queue size, a quarter of `max_memory` (250 MiB when
/// unbound) is divided by the size of a full payload.
pub fn sender_limits(config: &AgentConfig) -> SenderLimits {
    let connection_limit = match config.stats_writer.connection_limit {
        0 => DEFAULT_CONNECTION_LIMIT,
        n => n,
    };
    let queue_size = match config.stats_writer.queue_size {
        0 => {
            let payload_size = MAX_ENTRIES_PER_PAYLOAD as u64 * BYTES_PER_ENTRY;
            let budget = match config.max_memory / 4 {
                0 => DEFAULT_QUEUE_MEMORY,
                m => m,
            };
            usize::try_from((budget / payload_size).max(1)).unwrap_or(usize::MAX)
        }
        n => n,
    };
    SenderLimits {
        connection_limit,
        queue_size,
    }
}

/// Non-blocking hand-off of flushed payloads to the writer task.
#[derive(Clone, Debug)]
pub struct PayloadSubmitter {
    tx: mpsc::UnboundedSender<PipelineStatsPayload>,
}

impl PayloadSubmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineStatsPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false when the writer is gone.
    pub fn submit(&self, payload: PipelineStatsPayload) -> bool {
        self.tx.send(payload).is_ok()
    }
}

/// Encodes flushed payloads and hands them to a sender pool.
pub struct PipelineStatsWriter {
    input: mpsc::UnboundedReceiver<PipelineStatsPayload>,
    pool: Box<dyn SenderPool>,
    stats: Arc<WriterStats>,
    languages: Languages,
}

impl PipelineStatsWriter {
    /// `stats` must be the counters the pool's recorder writes to.
    pub fn new(
        input: mpsc::UnboundedReceiver<PipelineStatsPayload>,
        languages: Languages,
        stats: Arc<WriterStats>,
        pool: Box<dyn SenderPool>,
    ) -> Self {
        Self {
            input,
            pool,
            stats,
            languages,
        }
    }

    /// Writer delivering over HTTP to `config.endpoint`. Must be called inside a tokio runtime.
    pub fn with_http(
        config: &AgentConfig,
        input: mpsc::UnboundedReceiver<PipelineStatsPayload>,
        languages: Languages,
    ) -> Result<Self, String> {
        let limits = sender_limits(config);
        let transport = HttpTransport::new(&config.endpoint, config.api_key.clone())?;
        let stats = Arc::new(WriterStats::default());
        let pool = HttpSenderPool::start(
            Arc::new(transport),
            PoolConfig {
                limits,
                retry: RetryConfig::exponential(
                    config.stats_writer.max_attempts,
                    RETRY_BASE_MS,
                    RETRY_MAX_MS,
                ),
                drain_timeout: Duration::from_secs(config.stats_writer.drain_timeout_secs),
            },
            Arc::new(WriterRecorder::new(stats.clone())),
        );
        debug!(
            climit = limits.connection_limit,
            qsize = limits.queue_size,
            "pipeline stats writer initialized"
        );
        Ok(Self::new(input, languages, stats, Box::new(pool)))
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Split, encode and push one payload. Encoding failures drop the affected part.
    pub fn send_payload(&self, payload: PipelineStatsPayload) {
        WriterStats::add(&self.stats.client_payloads, 1);
        WriterStats::add(&self.stats.stats_buckets, payload.stats.len() as i64);
        WriterStats::add(&self.stats.stats_entries, payload.entry_count() as i64);

        let parts = split_payload(payload, MAX_ENTRIES_PER_PAYLOAD);
        if parts.len() > 1 {
            WriterStats::add(&self.stats.splits, parts.len() as i64 - 1);
        }

        let headers = payload_headers(&self.languages.header_value());
        for part in parts {
            match encode_payload(&part) {
                Ok(body) => {
                    debug!(
                        env = %part.env,
                        version = %part.version,
                        entries = part.entry_count(),
                        bytes = body.len(),
                        "sending pipeline stats payload"
                    );
                    self.pool.push(Payload::new(body, headers.clone()));
                }
                Err(e) => {
                    error!(error = %e, env = %part.env, "pipeline stats encoding error, payload dropped");
                }
            }
        }
    }

    /// Swap every counter to zero and log the values.
    pub fn report(&self) -> WriterReport {
        let r = self.stats.swap();
        if r.is_zero() {
            debug!("pipeline stats writer idle");
            return r;
        }
        info!(
            client_payloads = r.client_payloads,
            payloads = r.payloads,
            stats_buckets = r.stats_buckets,
            stats_entries = r.stats_entries,
            bytes = r.bytes,
            retries = r.retries,
            splits = r.splits,
            errors = r.errors,
            dropped = r.dropped,
            dropped_bytes = r.dropped_bytes,
            flush_duration_us = r.flush_duration_us,
            "pipeline stats writer report"
        );
        r
    }

    /// Process payloads until `stop` fires (or its sender is dropped), then
    /// drain submitted payloads and stop the pool.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + REPORT_INTERVAL, REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(payload) = self.input.recv() => self.send_payload(payload),
                _ = ticker.tick() => {
                    self.report();
                }
                _ = &mut stop => break,
            }
        }

        let mut drained = 0;
        while let Ok(payload) = self.input.try_recv() {
            self.send_payload(payload);
            drained += 1;
        }
        self.pool.stop().await;
        self.report();
        info!(drained, "pipeline stats writer stopped");
    }

    pub fn start(self) -> WriterHandle {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        WriterHandle { stop, task }
    }
}

/// Owner handle of a running writer.
pub struct WriterHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Drain submitted payloads, stop the sender pool and wait for it.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "pipeline stats writer task failed");
        }
    }
}
