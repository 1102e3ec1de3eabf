use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use bytes::Bytes;
use metrics::histogram;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::api::{AggregatorError, EventsResponse, HealthResponse, PublishResponse, ServiceInfo};
use crate::event::decode_events;
use crate::router;
use crate::stats::StatsSnapshot;
use crate::store::MAX_LIST_LIMIT;

pub const DEFAULT_EVENTS_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub topic: String,
    pub limit: Option<u32>,
}

/// Accepts one event object or an array of them. The whole request is
/// validated before anything is counted or queued.
#[instrument(skip_all, fields(body_len = body.len()))]
pub async fn publish(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<PublishResponse>, AggregatorError> {
    let events = decode_events(&body)?;
    if events.is_empty() {
        return Err(AggregatorError::EmptyBatch);
    }
    for (index, event) in events.iter().enumerate() {
        event
            .validate()
            .map_err(|error| AggregatorError::InvalidEvent { index, error })?;
    }

    histogram!("aggregator_publish_batch_size").record(events.len() as f64);
    let summary = state.pipeline.publish(events).await?;
    Ok(Json(summary.into()))
}

#[instrument(skip_all)]
pub async fn events(
    State(state): State<router::State>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<EventsResponse>, AggregatorError> {
    let Query(query) = query.map_err(|rejection| AggregatorError::InvalidQuery(rejection.body_text()))?;

    if query.topic.is_empty() {
        return Err(AggregatorError::InvalidQuery(
            "topic must not be empty".to_string(),
        ));
    }
    let limit = query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(AggregatorError::InvalidQuery(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}, got {limit}"
        )));
    }

    let events = state.pipeline.events_for_topic(&query.topic, limit).await?;
    debug!(topic = %query.topic, found = events.len(), "queried events");

    Ok(Json(EventsResponse {
        topic: query.topic,
        count: events.len(),
        events,
    }))
}

pub async fn stats(
    State(state): State<router::State>,
) -> Result<Json<StatsSnapshot>, AggregatorError> {
    Ok(Json(state.pipeline.stats().await?))
}

pub async fn health(State(state): State<router::State>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: state.timesource.current_time(),
    })
}

pub async fn index() -> Json<ServiceInfo> {
    Json(ServiceInfo::running())
}
