use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::endpoints;
use crate::pipeline::IngestionPipeline;
use crate::prometheus::track_metrics;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub pipeline: Arc<IngestionPipeline>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
}

async fn readiness() -> &'static str {
    "log-aggregator"
}

/// `metrics` is the handle of an already installed recorder; `/metrics` is
/// only routed when one is given.
pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    liveness: HealthRegistry,
    pipeline: Arc<IngestionPipeline>,
    metrics: Option<PrometheusHandle>,
    max_body_size: usize,
) -> Router {
    let state = State {
        pipeline,
        timesource: Arc::new(timesource),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(AllowOrigin::any());

    let router = Router::new()
        .route("/", get(endpoints::index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/publish", post(endpoints::publish))
        .route("/events", get(endpoints::events))
        .route("/stats", get(endpoints::stats))
        .route("/health", get(endpoints::health))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}
