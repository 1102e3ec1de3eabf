#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Once};
use std::time::Duration;

use aggregator::event::Event;
use aggregator::pipeline::{IngestionPipeline, PipelineConfig};
use aggregator::processor::{EventProcessor, NoopProcessor};
use aggregator::store::DedupStore;
use aggregator::time::TimeSource;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub fn event(topic: &str, event_id: &str) -> Event {
    let mut payload = Map::new();
    payload.insert("user_id".to_string(), Value::from("123"));
    Event::new(topic, event_id, "2025-10-22T10:00:00Z", "web-app", payload)
}

pub fn event_json(topic: &str, event_id: &str) -> Value {
    json!({
        "topic": topic,
        "event_id": event_id,
        "timestamp": "2025-10-22T10:00:00Z",
        "source": "web-app",
        "payload": {"user_id": "123", "action": "login"}
    })
}

pub async fn open_store(dir: &TempDir) -> DedupStore {
    DedupStore::open(dir.path().join("dedup.db"))
        .await
        .expect("failed to open store")
}

pub fn pipeline_with<P>(store: DedupStore, processor: P) -> IngestionPipeline
where
    P: EventProcessor + Send + Sync + 'static,
{
    IngestionPipeline::new(
        store,
        processor,
        PipelineConfig {
            poll_timeout: POLL_TIMEOUT,
        },
    )
}

pub fn pipeline(store: DedupStore) -> IngestionPipeline {
    pipeline_with(store, NoopProcessor::new(Duration::ZERO))
}

/// Waits until every received event reached a terminal state.
pub async fn wait_until_settled(pipeline: &IngestionPipeline) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let counters = pipeline.counters();
        if counters.settled() >= counters.received && pipeline.queue_depth() == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not settle: {counters:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fails on the listed event ids, succeeds on everything else.
pub struct FailingProcessor {
    pub fail_on: HashSet<String>,
}

impl FailingProcessor {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            fail_on: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl EventProcessor for FailingProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        if self.fail_on.contains(&event.event_id) {
            bail!("downstream rejected {}", event.event_id);
        }
        Ok(())
    }
}

/// Commits every event into a second handle on the same database before the
/// pipeline gets to, so the pipeline's own commit always loses the race.
pub struct RacingProcessor {
    pub rival: Arc<DedupStore>,
}

#[async_trait]
impl EventProcessor for RacingProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        self.rival.commit(event).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.to_string()
    }
}
