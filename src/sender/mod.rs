// src/sender/mod.rs
//! Bounded-concurrency delivery of encoded payloads with asynchronous outcome events.

pub mod client;
pub mod pool;
pub mod retry;

use bytes::Bytes;
use std::time::Duration;

pub use client::{HttpTransport, SendError, Transport, PIPELINE_STATS_PATH};
pub use pool::{HttpSenderPool, PoolConfig};
pub use retry::{with_retry, BackoffStrategy, IsRetryable, RetryConfig};

/// An encoded request body plus the headers it must be delivered with.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
}

impl Payload {
    pub fn new(body: Bytes, headers: Vec<(String, String)>) -> Self {
        Self { body, headers }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// An attempt failed with a transient error and will be retried.
    Retry,
    /// The backend accepted the payload.
    Sent,
    /// The backend refused the payload, or attempts ran out.
    Rejected,
    /// The queue was full; the payload never left the process.
    Dropped,
}

#[derive(Debug, Clone, Default)]
pub struct EventData {
    pub bytes: usize,
    /// Time since the delivery started.
    pub duration: Duration,
    /// 1-based number of the attempt that produced the event (0 for drops).
    pub attempt: u32,
    pub error: Option<String>,
}

/// Receives delivery outcomes. Called from the pool's own tasks.
pub trait EventRecorder: Send + Sync {
    fn record_event(&self, event: EventType, data: &EventData);
}

/// Delivery backend of the writer.
#[async_trait::async_trait]
pub trait SenderPool: Send {
    /// Queue a payload for delivery. Never blocks; a full queue drops the payload.
    fn push(&self, payload: Payload);

    /// Stop accepting payloads and wait for queued deliveries to finish.
    async fn stop(&mut self);
}

/// Connection and queue bounds of a sender pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderLimits {
    pub connection_limit: usize,
    pub queue_size: usize,
}
