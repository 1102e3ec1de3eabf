use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use health::HealthHandle;
use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::event::{Event, ProcessedEventRecord};
use crate::processor::EventProcessor;
use crate::prometheus::report_dropped_events;
use crate::stats::{Counters, Statistics, StatsSnapshot};
use crate::store::{DedupStore, StoreError};

/// Errors surfaced to callers of the pipeline. Duplicates are outcomes, not errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("intake queue is closed, the consumer task is gone")]
    QueueClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("processing step failed: {0:#}")]
    Processing(anyhow::Error),
}

/// Terminal state of an event taken off the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    DroppedDuplicate,
    /// Passed the `exists` check but another writer committed the key first.
    CommitRace,
}

/// Acknowledges that an event was queued. Nothing is committed yet, and the
/// queue does not survive a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitAck {
    pub event_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchAck {
    pub received: usize,
}

/// What the boundary fast path did with a publish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub received: usize,
    pub queued: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Longest the consumer blocks on an empty queue before checking whether
    /// it was asked to stop.
    pub poll_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
        }
    }
}

enum Lifecycle {
    Idle(UnboundedReceiver<Event>),
    Running(JoinHandle<UnboundedReceiver<Event>>),
    /// The consumer task died and took the receiver with it.
    Detached,
}

/// The single background task draining the intake queue.
struct Consumer {
    store: DedupStore,
    processor: Arc<dyn EventProcessor + Send + Sync>,
    stats: Arc<Statistics>,
    running: Arc<AtomicBool>,
    depth: Arc<AtomicUsize>,
    poll_timeout: Duration,
    liveness: Option<HealthHandle>,
}

impl Consumer {
    async fn run(self, mut receiver: UnboundedReceiver<Event>) -> UnboundedReceiver<Event> {
        info!("event consumer started");

        while self.running.load(Ordering::Acquire) {
            match timeout(self.poll_timeout, receiver.recv()).await {
                Err(_elapsed) => {}
                Ok(None) => {
                    warn!("intake queue closed, event consumer exiting");
                    break;
                }
                Ok(Some(event)) => {
                    let depth = self.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                    gauge!("aggregator_queue_depth").set(depth as f64);
                    let key = event.key().to_string();
                    if AssertUnwindSafe(self.consume(event))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        self.stats.record_failure();
                        counter!("aggregator_processing_failures_total").increment(1);
                        error!(key = %key, "event processing panicked");
                    }
                }
            }

            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }
        }

        info!("event consumer stopped");
        receiver
    }

    /// Errors are counted and logged here so one bad event never stops the loop.
    async fn consume(&self, event: Event) {
        match self.try_consume(&event).await {
            Ok(Outcome::Committed) => {
                self.stats.record_committed();
                counter!("aggregator_events_committed_total").increment(1);
                debug!(key = %event.key(), "event processed");
            }
            Ok(Outcome::DroppedDuplicate) => {
                self.stats.record_duplicate();
                report_dropped_events("duplicate", 1);
                info!(key = %event.key(), "duplicate dropped");
            }
            Ok(Outcome::CommitRace) => {
                self.stats.record_commit_race();
                report_dropped_events("commit_race", 1);
                counter!("aggregator_commit_races_total").increment(1);
                warn!(key = %event.key(), "commit race lost, dropping as duplicate");
            }
            Err(err) => {
                self.stats.record_failure();
                counter!("aggregator_processing_failures_total").increment(1);
                error!(key = %event.key(), "failed to process event: {:#}", err);
            }
        }
    }

    async fn try_consume(&self, event: &Event) -> Result<Outcome, PipelineError> {
        if self.store.exists(&event.topic, &event.event_id).await? {
            return Ok(Outcome::DroppedDuplicate);
        }

        self.processor
            .process(event)
            .await
            .map_err(PipelineError::Processing)?;

        // The commit, not the check above, decides who owns the key.
        match self.store.commit(event).await? {
            true => Ok(Outcome::Committed),
            false => Ok(Outcome::CommitRace),
        }
    }
}

/// Decouples accepting events from processing them.
///
/// Events go into an unbounded in-memory queue drained by one consumer task,
/// which checks the store, runs the processor and commits. Submitting never
/// blocks and never waits for the commit. The queue is not persisted: what is
/// still queued on `stop` or on a crash is gone, and producers are expected
/// to redeliver it.
pub struct IngestionPipeline {
    store: DedupStore,
    processor: Arc<dyn EventProcessor + Send + Sync>,
    stats: Arc<Statistics>,
    sender: UnboundedSender<Event>,
    lifecycle: Mutex<Lifecycle>,
    running: Arc<AtomicBool>,
    depth: Arc<AtomicUsize>,
    poll_timeout: Duration,
    liveness: Option<HealthHandle>,
}

impl IngestionPipeline {
    pub fn new<P>(store: DedupStore, processor: P, config: PipelineConfig) -> Self
    where
        P: EventProcessor + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            store,
            processor: Arc::new(processor),
            stats: Arc::new(Statistics::new()),
            sender,
            lifecycle: Mutex::new(Lifecycle::Idle(receiver)),
            running: Arc::new(AtomicBool::new(false)),
            depth: Arc::new(AtomicUsize::new(0)),
            poll_timeout: config.poll_timeout,
            liveness: None,
        }
    }

    /// The consumer reports to `liveness` once per poll cycle.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Spawn the consumer task. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let receiver = match std::mem::replace(&mut *lifecycle, Lifecycle::Detached) {
            Lifecycle::Idle(receiver) => receiver,
            other => {
                *lifecycle = other;
                return;
            }
        };

        self.running.store(true, Ordering::Release);
        let consumer = Consumer {
            store: self.store.clone(),
            processor: self.processor.clone(),
            stats: self.stats.clone(),
            running: self.running.clone(),
            depth: self.depth.clone(),
            poll_timeout: self.poll_timeout,
            liveness: self.liveness.clone(),
        };
        *lifecycle = Lifecycle::Running(tokio::spawn(consumer.run(receiver)));
        info!("ingestion pipeline started");
    }

    /// Ask the consumer to exit and wait for it, at most one poll timeout
    /// after the event it is working on. Events still queued are discarded;
    /// returns how many.
    pub async fn stop(&self) -> u64 {
        let mut lifecycle = self.lifecycle.lock().await;
        let handle = match std::mem::replace(&mut *lifecycle, Lifecycle::Detached) {
            Lifecycle::Running(handle) => handle,
            other => {
                *lifecycle = other;
                return 0;
            }
        };

        self.running.store(false, Ordering::Release);
        match handle.await {
            Ok(mut receiver) => {
                let mut lost: u64 = 0;
                while receiver.try_recv().is_ok() {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    lost += 1;
                }
                if lost > 0 {
                    report_dropped_events("shutdown", lost);
                    warn!(lost, "consumer stopped with queued events, they are lost");
                }
                gauge!("aggregator_queue_depth").set(0.0);
                *lifecycle = Lifecycle::Idle(receiver);
                info!("ingestion pipeline stopped");
                lost
            }
            Err(err) => {
                error!("event consumer task failed: {}", err);
                0
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn enqueue(&self, event: Event) -> Result<(), PipelineError> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(PipelineError::QueueClosed);
        }
        Ok(())
    }

    /// Count the event as received, then queue it.
    pub fn submit(&self, event: Event) -> Result<SubmitAck, PipelineError> {
        self.stats.record_received(1);
        counter!("aggregator_events_received_total").increment(1);

        let event_id = event.event_id.clone();
        self.enqueue(event)?;
        Ok(SubmitAck { event_id })
    }

    /// The received counter moves by the whole batch in one update. Each
    /// event is still processed on its own once dequeued.
    pub fn submit_batch(&self, events: Vec<Event>) -> Result<BatchAck, PipelineError> {
        let received = events.len();
        self.stats.record_received(received as u64);
        counter!("aggregator_events_received_total").increment(received as u64);

        for event in events {
            self.enqueue(event)?;
        }
        debug!(received, "queued events for processing");
        Ok(BatchAck { received })
    }

    /// Boundary entry point. Events whose key is already committed are counted
    /// as received duplicates right away and never queued; the rest go through
    /// `submit_batch`.
    pub async fn publish(&self, events: Vec<Event>) -> Result<PublishSummary, PipelineError> {
        let received = events.len();
        let mut fresh = Vec::with_capacity(received);
        for event in events {
            if self.store.exists(&event.topic, &event.event_id).await? {
                info!(key = %event.key(), "duplicate rejected before queueing");
            } else {
                fresh.push(event);
            }
        }

        let duplicates = received - fresh.len();
        if duplicates > 0 {
            self.stats.record_rejected_duplicates(duplicates as u64);
            report_dropped_events("known_duplicate", duplicates as u64);
        }

        let queued = fresh.len();
        if queued > 0 {
            self.submit_batch(fresh)?;
        }

        info!(received, queued, duplicates, "published events");
        Ok(PublishSummary {
            received,
            queued,
            duplicates,
        })
    }

    /// Counters plus the store's topics, with uptime and duplicate rate computed now.
    pub async fn stats(&self) -> Result<StatsSnapshot, PipelineError> {
        let topics = self.store.list_topics().await?;
        Ok(self.stats.snapshot(topics.into_iter().collect()))
    }

    pub fn counters(&self) -> Counters {
        self.stats.counters()
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.stats.uptime_seconds()
    }

    pub async fn events_for_topic(
        &self,
        topic: &str,
        limit: u32,
    ) -> Result<Vec<ProcessedEventRecord>, PipelineError> {
        Ok(self.store.list_by_topic(topic, limit).await?)
    }

    /// Events waiting in the intake queue.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::NoopProcessor;
    use serde_json::Map;
    use tempfile::TempDir;

    fn event(topic: &str, event_id: &str) -> Event {
        Event::new(topic, event_id, "2025-10-22T10:00:00Z", "test", Map::new())
    }

    async fn pipeline(dir: &TempDir) -> IngestionPipeline {
        let store = DedupStore::open(dir.path().join("dedup.db")).await.unwrap();
        IngestionPipeline::new(
            store,
            NoopProcessor::new(Duration::ZERO),
            PipelineConfig {
                poll_timeout: Duration::from_millis(50),
            },
        )
    }

    async fn wait_until_settled(pipeline: &IngestionPipeline) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let counters = pipeline.counters();
            if counters.settled() >= counters.received {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "pipeline did not settle: {counters:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn submit_counts_before_processing() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir).await;

        let ack = pipeline.submit(event("orders", "A1")).unwrap();

        assert_eq!(ack.event_id, "A1");
        assert_eq!(pipeline.counters().received, 1);
        assert_eq!(pipeline.counters().unique_processed, 0);
        assert_eq!(pipeline.queue_depth(), 1);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir).await;

        pipeline.stop().await;
        pipeline.start().await;
        pipeline.start().await;
        assert!(pipeline.is_running());

        pipeline.submit(event("orders", "A1")).unwrap();
        wait_until_settled(&pipeline).await;

        pipeline.stop().await;
        pipeline.stop().await;
        assert!(!pipeline.is_running());

        // the receiver survives a stop, so the pipeline can be restarted
        pipeline.start().await;
        pipeline.submit(event("orders", "A2")).unwrap();
        wait_until_settled(&pipeline).await;
        assert_eq!(pipeline.counters().unique_processed, 2);
        pipeline.stop().await;
    }

    struct SlowProcessor(Duration);

    #[async_trait::async_trait]
    impl EventProcessor for SlowProcessor {
        async fn process(&self, _event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_discards_queued_events() {
        let dir = TempDir::new().unwrap();
        let store = DedupStore::open(dir.path().join("dedup.db")).await.unwrap();
        let pipeline = IngestionPipeline::new(
            store,
            SlowProcessor(Duration::from_millis(300)),
            PipelineConfig {
                poll_timeout: Duration::from_millis(50),
            },
        );
        pipeline.start().await;

        pipeline
            .submit_batch(vec![
                event("orders", "1"),
                event("orders", "2"),
                event("orders", "3"),
            ])
            .unwrap();
        // let the consumer pick up the first event
        tokio::time::sleep(Duration::from_millis(50)).await;

        let lost = pipeline.stop().await;

        // the event in flight is finished, the two behind it are dropped
        assert_eq!(lost, 2);
        assert_eq!(pipeline.queue_depth(), 0);
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
        assert!(pipeline.store().exists("orders", "1").await.unwrap());
        let counters = pipeline.counters();
        assert_eq!(counters.received, 3);
        assert_eq!(counters.unique_processed, 1);

        // a second stop has nothing left to discard
        assert_eq!(pipeline.stop().await, 0);
    }

    struct PanickingProcessor;

    #[async_trait::async_trait]
    impl EventProcessor for PanickingProcessor {
        async fn process(&self, event: &Event) -> anyhow::Result<()> {
            if event.event_id == "boom" {
                panic!("processor blew up on {}", event.event_id);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_processor_does_not_kill_the_consumer() {
        let dir = TempDir::new().unwrap();
        let store = DedupStore::open(dir.path().join("dedup.db")).await.unwrap();
        let pipeline = IngestionPipeline::new(
            store,
            PanickingProcessor,
            PipelineConfig {
                poll_timeout: Duration::from_millis(50),
            },
        );
        pipeline.start().await;

        pipeline.submit(event("orders", "boom")).unwrap();
        wait_until_settled(&pipeline).await;
        assert_eq!(pipeline.counters().processing_failed, 1);
        assert!(pipeline.is_running());

        // the queue is still open and drained after the panic
        pipeline.submit(event("orders", "fine")).unwrap();
        wait_until_settled(&pipeline).await;

        let counters = pipeline.counters();
        assert_eq!(counters.unique_processed, 1);
        assert_eq!(counters.processing_failed, 1);
        assert!(!pipeline.store().exists("orders", "boom").await.unwrap());
        assert_eq!(pipeline.stop().await, 0);
    }

    #[tokio::test]
    async fn publish_rejects_known_keys_up_front() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir).await;
        pipeline.store().commit(&event("orders", "A1")).await.unwrap();

        let summary = pipeline
            .publish(vec![event("orders", "A1"), event("orders", "A2")])
            .await
            .unwrap();

        assert_eq!(
            summary,
            PublishSummary {
                received: 2,
                queued: 1,
                duplicates: 1
            }
        );
        let counters = pipeline.counters();
        assert_eq!(counters.received, 2);
        assert_eq!(counters.duplicate_dropped, 1);
        assert_eq!(pipeline.queue_depth(), 1);
    }
}
