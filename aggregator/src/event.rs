use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound, in bytes, for the topic, event_id and source fields.
pub const MAX_FIELD_LEN: usize = 255;

/// Local date-time shapes accepted on top of RFC 3339.
const LOCAL_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("{field} is {len} bytes long, at most 255 are allowed")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("invalid ISO8601 timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A log event as published by a producer.
///
/// `event_id` is assigned by the producer and is never generated here: two
/// deliveries with the same `(topic, event_id)` are the same logical event.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    /// Kept exactly as received, only checked for shape.
    pub timestamp: String,
    pub source: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(
        topic: impl Into<String>,
        event_id: impl Into<String>,
        timestamp: impl Into<String>,
        source: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_id: event_id.into(),
            timestamp: timestamp.into(),
            source: source.into(),
            payload,
        }
    }

    pub fn key(&self) -> DedupKey<'_> {
        DedupKey {
            topic: &self.topic,
            event_id: &self.event_id,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_field("topic", &self.topic)?;
        check_field("event_id", &self.event_id)?;
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("event_id"));
        }
        check_field("source", &self.source)?;

        if !is_iso8601(&self.timestamp) {
            return Err(ValidationError::InvalidTimestamp(self.timestamp.clone()));
        }
        Ok(())
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(ValidationError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn is_iso8601(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || LOCAL_DATETIME_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(value, format).is_ok())
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Identity of a logical event. Topic and event_id are independent axes, so
/// the same event_id under two topics yields two distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
    pub topic: &'a str,
    pub event_id: &'a str,
}

impl fmt::Display for DedupKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.event_id)
    }
}

/// The durable form of an event, as read back from the dedup store.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProcessedEventRecord {
    #[serde(flatten)]
    pub event: Event,
    pub processed_at: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRequest {
    /// Batch of events
    Batch(Vec<Event>),
    /// Single event
    One(Event),
}

impl RawRequest {
    fn events(self) -> Vec<Event> {
        match self {
            RawRequest::Batch(events) => events,
            RawRequest::One(event) => vec![event],
        }
    }
}

/// Decodes a publish body holding either one event object or an array of them.
/// Shape only: callers still have to `validate` each event.
pub fn decode_events(body: &Bytes) -> Result<Vec<Event>, serde_json::Error> {
    tracing::debug!(len = body.len(), "decoding publish body");
    Ok(serde_json::from_slice::<RawRequest>(body)?.events())
}
