//! Aggregator task: owns the window store and serializes all access to it.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::window::WindowStore;
use crate::payload::{ClientStatsPayload, PipelineStatsPayload};
use crate::writer::PayloadSubmitter;

/// How often windows are checked for flushing.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const INPUT_QUEUE_SIZE: usize = 10;

/// The aggregator task is gone (stopped or panicked).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorClosed;

impl std::fmt::Display for AggregatorClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipeline stats aggregator is not running")
    }
}

impl std::error::Error for AggregatorClosed {}

enum Command {
    Ingest(ClientStatsPayload),
    FlushDue { now: u64, done: oneshot::Sender<usize> },
    FlushAll { done: oneshot::Sender<usize> },
}

/// Aggregates client pipeline stats into windows and hands finished windows to the writer.
pub struct PipelineStatsAggregator {
    store: WindowStore,
    out: PayloadSubmitter,
    clock: fn() -> u64,
}

impl PipelineStatsAggregator {
    pub fn new(store: WindowStore, out: PayloadSubmitter) -> Self {
        Self {
            store,
            out,
            clock: unix_now,
        }
    }

    /// Replace the wall clock used by the periodic flush (unix seconds).
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the aggregator task.
    pub fn start(self) -> AggregatorHandle {
        let (commands, rx) = mpsc::channel(INPUT_QUEUE_SIZE);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(rx, stop_rx));
        AggregatorHandle {
            ingester: Ingester { commands },
            stop,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut stop: oneshot::Receiver<()>) {
        let mut ticker = interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = (self.clock)();
                    let payloads = self.store.flush_due(now);
                    self.flush(payloads);
                }
                Some(command) = commands.recv() => self.handle(command),
                _ = &mut stop => {
                    let payloads = self.store.flush_all();
                    let count = self.flush(payloads);
                    info!(payloads = count, "pipeline stats aggregator stopped");
                    return;
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Ingest(payload) => {
                let outcome = self.store.add(&payload);
                debug!(
                    env = %payload.env,
                    version = %payload.version,
                    buckets = payload.stats.len(),
                    inserted = outcome.inserted,
                    merged = outcome.merged,
                    skipped = outcome.skipped,
                    "ingested client pipeline stats"
                );
            }
            Command::FlushDue { now, done } => {
                let payloads = self.store.flush_due(now);
                let _ = done.send(self.flush(payloads));
            }
            Command::FlushAll { done } => {
                let payloads = self.store.flush_all();
                let _ = done.send(self.flush(payloads));
            }
        }
    }

    fn flush(&self, payloads: Vec<PipelineStatsPayload>) -> usize {
        if payloads.is_empty() {
            debug!("nothing to flush");
            return 0;
        }
        let mut sent = 0;
        for payload in payloads {
            if self.out.submit(payload) {
                sent += 1;
            } else {
                warn!("pipeline stats writer is gone, dropping flushed payload");
            }
        }
        sent
    }
}

/// Cloneable ingestion endpoint of a running aggregator.
#[derive(Clone)]
pub struct Ingester {
    commands: mpsc::Sender<Command>,
}

impl Ingester {
    /// Queue a client payload for aggregation. Waits if the input queue is full.
    pub async fn ingest(&self, payload: ClientStatsPayload) -> Result<(), AggregatorClosed> {
        self.commands
            .send(Command::Ingest(payload))
            .await
            .map_err(|_| AggregatorClosed)
    }
}

/// Owner handle of a running aggregator. Dropping it also ends the task after a
/// final flush, but without waiting for it.
pub struct AggregatorHandle {
    ingester: Ingester,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AggregatorHandle {
    pub fn ingester(&self) -> Ingester {
        self.ingester.clone()
    }

    pub async fn ingest(&self, payload: ClientStatsPayload) -> Result<(), AggregatorClosed> {
        self.ingester.ingest(payload).await
    }

    /// Flush windows due at `now` (unix seconds). Returns the number of payloads emitted.
    pub async fn flush_due(&self, now: u64) -> Result<usize, AggregatorClosed> {
        let (done, rx) = oneshot::channel();
        self.ingester
            .commands
            .send(Command::FlushDue { now, done })
            .await
            .map_err(|_| AggregatorClosed)?;
        rx.await.map_err(|_| AggregatorClosed)
    }

    /// Flush every live window. Returns the number of payloads emitted.
    pub async fn flush_all(&self) -> Result<usize, AggregatorClosed> {
        let (done, rx) = oneshot::channel();
        self.ingester
            .commands
            .send(Command::FlushAll { done })
            .await
            .map_err(|_| AggregatorClosed)?;
        rx.await.map_err(|_| AggregatorClosed)
    }

    /// Flush everything and wait for the task to exit. Consumes the handle.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "pipeline stats aggregator task failed");
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
