use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::CorrelationId;

/// The wire-level wrapper around a domain event.
///
/// Every message crossing the broker uses this shape, serialized as
/// camelCase JSON with an epoch-milliseconds timestamp so that
/// participants written in other languages can consume it directly.
/// Envelopes are immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// The type of the event (e.g., "cattle.transfer", "saga.step.success").
    pub event_type: String,

    /// The event payload as JSON. Participants decode it themselves.
    pub payload: serde_json::Value,

    /// When the event was published, epoch milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// The service that published the event.
    pub source: String,

    /// The saga execution this event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    timestamp: Option<DateTime<Utc>>,
    source: Option<String>,
    correlation_id: Option<CorrelationId>,
}

impl EventEnvelopeBuilder {
    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the publishing service.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if required fields (event_type, payload, source) are not set.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_type: self.event_type.expect("event_type is required"),
            payload: self.payload.expect("payload is required"),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self.source.expect("source is required"),
            correlation_id: self.correlation_id,
        }
    }

    /// Tries to build the event envelope, returning None if required fields
    /// are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_type: self.event_type?,
            payload: self.payload?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self.source?,
            correlation_id: self.correlation_id,
        })
    }
}
