use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use health::HealthRegistry;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::pipeline::{IngestionPipeline, PipelineConfig};
use crate::processor::NoopProcessor;
use crate::prometheus::setup_metrics_recorder;
use crate::router;
use crate::store::DedupStore;
use crate::time::SystemTime;

/// Longest the consumer may go without reporting before `/_liveness` fails.
fn consumer_deadline(poll_timeout: Duration) -> Duration {
    Duration::from_secs(30).max(poll_timeout * 3)
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let store = DedupStore::open_with_options(config.store_options())
        .await
        .context("failed to open dedup store")?;
    let records = store
        .count()
        .await
        .context("failed to count stored events")?;
    info!(path = %store.path().display(), records, "dedup store ready");

    let consumer_liveness = liveness
        .register(
            "consumer".to_string(),
            consumer_deadline(config.poll_timeout_ms.0),
        )
        .await;
    let pipeline = Arc::new(
        IngestionPipeline::new(
            store.clone(),
            NoopProcessor::new(config.processing_delay_ms.0),
            PipelineConfig {
                poll_timeout: config.poll_timeout_ms.0,
            },
        )
        .with_liveness(consumer_liveness),
    );
    pipeline.start().await;

    // Installing a global recorder when the crate is used as a library (tests)
    // does not work well, so only do it when asked to.
    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let app = router::router(
        SystemTime {},
        liveness,
        pipeline.clone(),
        metrics,
        config.max_body_size,
    );

    info!("listening on {:?}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed");

    pipeline.stop().await;

    let counters = pipeline.counters();
    info!(
        received = counters.received,
        unique_processed = counters.unique_processed,
        duplicate_dropped = counters.duplicate_dropped,
        processing_failed = counters.processing_failed,
        duplicate_rate = crate::stats::duplicate_rate(counters.duplicate_dropped, counters.received),
        uptime_seconds = pipeline.uptime_seconds(),
        "final statistics"
    );

    store.close().await;
    served
}
