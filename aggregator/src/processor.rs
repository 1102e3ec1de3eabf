use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::event::Event;

/// The business step run on every event that is not a known duplicate,
/// before its key is committed. An error leaves the key uncommitted, so a
/// redelivery of the same event gets another chance.
#[async_trait]
pub trait EventProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()>;
}

/// Aggregation only needs the event stored, so the default step does no work
/// beyond simulating a short processing delay.
#[derive(Clone, Debug)]
pub struct NoopProcessor {
    delay: Duration,
}

impl NoopProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for NoopProcessor {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

#[async_trait]
impl EventProcessor for NoopProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }

        debug!(
            topic = %event.topic,
            event_id = %event.event_id,
            source = %event.source,
            "processing event"
        );
        Ok(())
    }
}
