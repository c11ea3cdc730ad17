use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::sender::client::Transport;
use crate::sender::retry::{with_retry, RetryConfig};
use crate::sender::{EventData, EventRecorder, EventType, Payload, SenderLimits, SenderPool};

/// Settings of an [`HttpSenderPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub limits: SenderLimits,
    pub retry: RetryConfig,
    /// How long `stop` waits for queued and in-flight deliveries.
    pub drain_timeout: Duration,
}

/// Payloads accepted by the pool that have not produced a final event yet.
///
/// Whoever settles an id first (the delivery, or `stop` after a drain timeout)
/// reports its outcome, so every payload gets exactly one.
#[derive(Default)]
struct Outstanding {
    next_id: AtomicU64,
    bytes: Mutex<HashMap<u64, usize>>,
}

impl Outstanding {
    fn track(&self, bytes: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, bytes);
        id
    }

    fn settle(&self, id: u64) -> bool {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    fn abandon(&self) -> Vec<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, bytes)| bytes)
            .collect()
    }
}

/// Sender pool backed by a bounded queue and at most `connection_limit`
/// concurrent deliveries.
pub struct HttpSenderPool {
    queue: Option<mpsc::Sender<(u64, Payload)>>,
    outstanding: Arc<Outstanding>,
    recorder: Arc<dyn EventRecorder>,
    dispatcher: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl HttpSenderPool {
    /// Spawn the dispatcher. Must be called inside a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: PoolConfig,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.limits.queue_size.max(1));
        let connections = Arc::new(Semaphore::new(config.limits.connection_limit.max(1)));
        let outstanding = Arc::new(Outstanding::default());
        let dispatcher = tokio::spawn(dispatch(
            rx,
            transport,
            connections,
            Arc::new(config.retry),
            recorder.clone(),
            outstanding.clone(),
        ));
        debug!(
            connection_limit = config.limits.connection_limit,
            queue_size = config.limits.queue_size,
            "sender pool started"
        );
        Self {
            queue: Some(queue),
            outstanding,
            recorder,
            dispatcher: Some(dispatcher),
            drain_timeout: config.drain_timeout,
        }
    }

    fn record_drop(&self, bytes: usize) {
        self.recorder.record_event(
            EventType::Dropped,
            &EventData {
                bytes,
                ..EventData::default()
            },
        );
    }
}

#[async_trait::async_trait]
impl SenderPool for HttpSenderPool {
    fn push(&self, payload: Payload) {
        let Some(queue) = &self.queue else {
            self.record_drop(payload.len());
            return;
        };
        let bytes = payload.len();
        let id = self.outstanding.track(bytes);
        if queue.try_send((id, payload)).is_err() {
            self.outstanding.settle(id);
            self.record_drop(bytes);
        }
    }

    async fn stop(&mut self) {
        // Closing the queue lets the dispatcher finish once it is drained.
        self.queue.take();
        let Some(mut dispatcher) = self.dispatcher.take() else {
            return;
        };
        match tokio::time::timeout(self.drain_timeout, &mut dispatcher).await {
            Ok(Ok(())) => debug!("sender pool drained"),
            Ok(Err(e)) => error!(error = %e, "sender pool dispatcher failed"),
            Err(_) => {
                dispatcher.abort();
                let abandoned = self.outstanding.abandon();
                warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    abandoned = abandoned.len(),
                    "sender pool drain timed out, aborting in-flight deliveries"
                );
                for bytes in abandoned {
                    self.record_drop(bytes);
                }
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<(u64, Payload)>,
    transport: Arc<dyn Transport>,
    connections: Arc<Semaphore>,
    retry: Arc<RetryConfig>,
    recorder: Arc<dyn EventRecorder>,
    outstanding: Arc<Outstanding>,
) {
    let mut deliveries = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "delivery task failed");
                }
            }
            next = rx.recv() => {
                let Some((id, payload)) = next else { break };
                let Ok(permit) = connections.clone().acquire_owned().await else {
                    break;
                };
                let transport = transport.clone();
                let retry = retry.clone();
                let recorder = recorder.clone();
                let outstanding = outstanding.clone();
                deliveries.spawn(async move {
                    let (event, data) =
                        deliver(transport.as_ref(), &retry, recorder.as_ref(), payload).await;
                    drop(permit);
                    if outstanding.settle(id) {
                        recorder.record_event(event, &data);
                    }
                });
            }
        }
    }

    while let Some(joined) = deliveries.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "delivery task failed");
        }
    }
}

/// Send with retries. Retry events are recorded as they happen; the final
/// event is returned for the caller to record.
async fn deliver(
    transport: &dyn Transport,
    retry: &RetryConfig,
    recorder: &dyn EventRecorder,
    payload: Payload,
) -> (EventType, EventData) {
    let started = Instant::now();
    let bytes = payload.len();
    let mut attempts = 1;

    let result = with_retry(
        retry,
        || transport.send(&payload),
        |e, attempt| {
            attempts = attempt + 1;
            recorder.record_event(
                EventType::Retry,
                &EventData {
                    bytes,
                    duration: started.elapsed(),
                    attempt,
                    error: Some(e.to_string()),
                },
            );
        },
    )
    .await;

    let (event, error) = match result {
        Ok(()) => (EventType::Sent, None),
        Err(e) => (EventType::Rejected, Some(e.to_string())),
    };
    (
        event,
        EventData {
            bytes,
            duration: started.elapsed(),
            attempt: attempts,
            error,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::retry::BackoffStrategy;
    use crate::sender::SendError;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Events(Mutex<Vec<(EventType, EventData)>>);

    impl EventRecorder for Events {
        fn record_event(&self, event: EventType, data: &EventData) {
            self.0.lock().unwrap().push((event, data.clone()));
        }
    }

    impl Events {
        fn kinds(&self) -> Vec<EventType> {
            self.0.lock().unwrap().iter().map(|(e, _)| *e).collect()
        }
    }

    /// Answers attempts from a script, then succeeds.
    struct Scripted(Mutex<VecDeque<u16>>);

    impl Scripted {
        fn new(statuses: &[u16]) -> Self {
            Self(Mutex::new(statuses.iter().copied().collect()))
        }
    }

    #[async_trait::async_trait]
    impl Transport for Scripted {
        async fn send(&self, _payload: &Payload) -> Result<(), SendError> {
            match self.0.lock().unwrap().pop_front() {
                Some(status) if !(200..300).contains(&status) => Err(SendError::Http {
                    status,
                    endpoint: "test".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl Transport for Hanging {
        async fn send(&self, _payload: &Payload) -> Result<(), SendError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for Slow {
        async fn send(&self, _payload: &Payload) -> Result<(), SendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(connection_limit: usize, queue_size: usize) -> PoolConfig {
        PoolConfig {
            limits: SenderLimits {
                connection_limit,
                queue_size,
            },
            retry: RetryConfig {
                max_attempts: 3,
                delay: Duration::from_millis(1),
                backoff: BackoffStrategy::Fixed,
            },
            drain_timeout: Duration::from_secs(1),
        }
    }

    fn payload(len: usize) -> Payload {
        Payload::new(Bytes::from(vec![0u8; len]), Vec::new())
    }

    #[tokio::test]
    async fn successful_delivery_reports_sent_with_bytes() {
        let events = Arc::new(Events::default());
        let mut pool =
            HttpSenderPool::start(Arc::new(Scripted::new(&[200])), config(2, 4), events.clone());

        pool.push(payload(128));
        pool.stop().await;

        let recorded = events.0.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, EventType::Sent);
        assert_eq!(recorded[0].1.bytes, 128);
        assert_eq!(recorded[0].1.attempt, 1);
    }

    #[tokio::test]
    async fn transient_failures_report_retries_before_sent() {
        let events = Arc::new(Events::default());
        let mut pool = HttpSenderPool::start(
            Arc::new(Scripted::new(&[503, 429, 200])),
            config(1, 4),
            events.clone(),
        );

        pool.push(payload(10));
        pool.stop().await;

        assert_eq!(
            events.kinds(),
            vec![EventType::Retry, EventType::Retry, EventType::Sent]
        );
        assert_eq!(events.0.lock().unwrap()[2].1.attempt, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_rejected_without_retry() {
        let events = Arc::new(Events::default());
        let mut pool =
            HttpSenderPool::start(Arc::new(Scripted::new(&[400])), config(1, 4), events.clone());

        pool.push(payload(10));
        pool.stop().await;

        assert_eq!(events.kinds(), vec![EventType::Rejected]);
        let recorded = events.0.lock().unwrap();
        assert!(recorded[0].1.error.as_deref().unwrap().contains("400"));
    }

    #[tokio::test]
    async fn exhausted_retries_are_rejected() {
        let events = Arc::new(Events::default());
        let mut pool = HttpSenderPool::start(
            Arc::new(Scripted::new(&[500, 500, 500])),
            config(1, 4),
            events.clone(),
        );

        pool.push(payload(10));
        pool.stop().await;

        assert_eq!(
            events.kinds(),
            vec![EventType::Retry, EventType::Retry, EventType::Rejected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_and_stop_is_bounded() {
        let events = Arc::new(Events::default());
        let mut pool = HttpSenderPool::start(Arc::new(Hanging), config(1, 1), events.clone());

        // The dispatcher has not run yet, so only one slot is available.
        for _ in 0..4 {
            pool.push(payload(2048));
        }
        assert_eq!(events.kinds(), vec![EventType::Dropped; 3]);
        assert_eq!(events.0.lock().unwrap()[0].1.bytes, 2048);

        // The one accepted payload never completes and is dropped at the deadline.
        pool.stop().await;
        assert_eq!(events.kinds(), vec![EventType::Dropped; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_deliveries_are_reported_dropped() {
        let events = Arc::new(Events::default());
        let mut pool = HttpSenderPool::start(Arc::new(Hanging), config(1, 4), events.clone());

        for len in [10, 20, 30] {
            pool.push(payload(len));
        }
        assert!(events.kinds().is_empty());

        pool.stop().await;
        assert_eq!(events.kinds(), vec![EventType::Dropped; 3]);
        let mut bytes: Vec<usize> = events
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| d.bytes)
            .collect();
        bytes.sort_unstable();
        assert_eq!(bytes, vec![10, 20, 30]);
        assert_eq!(pool.outstanding.abandon().len(), 0);
    }

    #[tokio::test]
    async fn push_after_stop_is_dropped() {
        let events = Arc::new(Events::default());
        let mut pool =
            HttpSenderPool::start(Arc::new(Scripted::new(&[])), config(1, 1), events.clone());
        pool.stop().await;

        pool.push(payload(7));
        assert_eq!(events.kinds(), vec![EventType::Dropped]);
    }

    #[tokio::test(start_paused = true)]
    async fn deliveries_respect_connection_limit() {
        let events = Arc::new(Events::default());
        let transport = Arc::new(Slow::default());
        let mut pool = HttpSenderPool::start(transport.clone(), config(2, 16), events.clone());

        for _ in 0..6 {
            pool.push(payload(1));
        }
        pool.stop().await;

        assert_eq!(events.kinds(), vec![EventType::Sent; 6]);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    }
}
