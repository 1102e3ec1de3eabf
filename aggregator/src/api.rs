use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::event::{ProcessedEventRecord, ValidationError};
use crate::pipeline::{PipelineError, PublishSummary};
use crate::prometheus::report_rejected_request;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("request holds no event")]
    EmptyBatch,
    #[error("event {index} is invalid: {error}")]
    InvalidEvent {
        index: usize,
        error: ValidationError,
    },
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("internal error: {0}")]
    PipelineError(#[from] PipelineError),
}

impl AggregatorError {
    fn status(&self) -> StatusCode {
        match self {
            AggregatorError::EmptyBatch => StatusCode::BAD_REQUEST,

            AggregatorError::RequestParsingError(_)
            | AggregatorError::InvalidEvent { .. }
            | AggregatorError::InvalidQuery(_) => StatusCode::UNPROCESSABLE_ENTITY,

            AggregatorError::PipelineError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AggregatorError::RequestParsingError(_) => "parsing",
            AggregatorError::EmptyBatch => "empty_batch",
            AggregatorError::InvalidEvent { .. } => "invalid_event",
            AggregatorError::InvalidQuery(_) => "invalid_query",
            AggregatorError::PipelineError(_) => "internal",
        }
    }
}

impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        report_rejected_request(self.reason());

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PublishResponse {
    pub status: String,
    pub received: usize,
    /// Events queued for processing. They are not committed yet.
    pub processed: usize,
    /// Events rejected because their key was already committed.
    pub duplicates: usize,
    pub message: String,
}

impl From<PublishSummary> for PublishResponse {
    fn from(summary: PublishSummary) -> Self {
        Self {
            status: "success".to_string(),
            received: summary.received,
            processed: summary.queued,
            duplicates: summary.duplicates,
            message: format!("Successfully queued {} unique events", summary.queued),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct EventsResponse {
    pub topic: String,
    pub count: usize,
    pub events: Vec<ProcessedEventRecord>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
}

impl ServiceInfo {
    pub fn running() -> Self {
        Self {
            service: "log-aggregator",
            version: env!("CARGO_PKG_VERSION"),
            status: "running",
            endpoints: BTreeMap::from([
                ("publish", "POST /publish"),
                ("query", "GET /events?topic=<topic>"),
                ("stats", "GET /stats"),
                ("health", "GET /health"),
            ]),
        }
    }
}
