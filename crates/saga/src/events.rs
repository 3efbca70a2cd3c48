//! The closed set of saga control events.
//!
//! Participants publish step outcomes with these reserved event types;
//! the orchestrator publishes the terminal notifications. Everything
//! else on the bus is an opaque domain payload the participants decode
//! themselves.

use serde::{Deserialize, Serialize};

use common::CorrelationId;
use event_bus::EventEnvelope;

use crate::error::SagaError;

/// Reserved event type a participant publishes after a step succeeds.
pub const STEP_SUCCESS: &str = "saga.step.success";
/// Reserved event type a participant publishes after a step fails.
pub const STEP_FAILURE: &str = "saga.step.failure";
/// Reserved event type the orchestrator publishes when a saga completes.
pub const SAGA_COMPLETED: &str = "saga.completed";
/// Reserved event type the orchestrator publishes after compensation.
pub const SAGA_COMPENSATED: &str = "saga.compensated";

/// Payload of `saga.step.success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSuccessData {
    pub correlation_id: CorrelationId,
    pub step_id: String,
    /// Result carried forward as the next step's payload, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Payload of `saga.step.failure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailureData {
    pub correlation_id: CorrelationId,
    pub step_id: String,
    pub error: String,
}

/// Payload of `saga.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaCompletedData {
    pub saga_id: String,
    pub correlation_id: CorrelationId,
}

/// Payload of `saga.compensated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaCompensatedData {
    pub saga_id: String,
    pub correlation_id: CorrelationId,
    /// The original step error that triggered the rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A parsed saga control event.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    StepSuccess(StepSuccessData),
    StepFailure(StepFailureData),
    SagaCompleted(SagaCompletedData),
    SagaCompensated(SagaCompensatedData),
}

impl ControlEvent {
    /// Returns the reserved event type for this control event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ControlEvent::StepSuccess(_) => STEP_SUCCESS,
            ControlEvent::StepFailure(_) => STEP_FAILURE,
            ControlEvent::SagaCompleted(_) => SAGA_COMPLETED,
            ControlEvent::SagaCompensated(_) => SAGA_COMPENSATED,
        }
    }

    /// Parses a control event out of an envelope.
    ///
    /// Fails with `NotControlEvent` for any non-reserved event type and
    /// with a serialization error for a reserved type whose payload does
    /// not match the wire shape.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, SagaError> {
        let payload = envelope.payload.clone();
        match envelope.event_type.as_str() {
            STEP_SUCCESS => Ok(ControlEvent::StepSuccess(serde_json::from_value(payload)?)),
            STEP_FAILURE => Ok(ControlEvent::StepFailure(serde_json::from_value(payload)?)),
            SAGA_COMPLETED => Ok(ControlEvent::SagaCompleted(serde_json::from_value(payload)?)),
            SAGA_COMPENSATED => Ok(ControlEvent::SagaCompensated(serde_json::from_value(
                payload,
            )?)),
            other => Err(SagaError::NotControlEvent(other.to_string())),
        }
    }
}

// Convenience constructors
impl ControlEvent {
    /// Creates a step success outcome.
    pub fn step_success(
        correlation_id: CorrelationId,
        step_id: impl Into<String>,
        result: Option<serde_json::Value>,
    ) -> Self {
        ControlEvent::StepSuccess(StepSuccessData {
            correlation_id,
            step_id: step_id.into(),
            result,
        })
    }

    /// Creates a step failure outcome.
    pub fn step_failure(
        correlation_id: CorrelationId,
        step_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        ControlEvent::StepFailure(StepFailureData {
            correlation_id,
            step_id: step_id.into(),
            error: error.into(),
        })
    }

    /// Creates a saga completed notification.
    pub fn saga_completed(saga_id: impl Into<String>, correlation_id: CorrelationId) -> Self {
        ControlEvent::SagaCompleted(SagaCompletedData {
            saga_id: saga_id.into(),
            correlation_id,
        })
    }

    /// Creates a saga compensated notification.
    pub fn saga_compensated(
        saga_id: impl Into<String>,
        correlation_id: CorrelationId,
        error: Option<String>,
    ) -> Self {
        ControlEvent::SagaCompensated(SagaCompensatedData {
            saga_id: saga_id.into(),
            correlation_id,
            error,
        })
    }

    /// Serializes the control payload for publishing.
    pub fn into_payload(self) -> serde_json::Value {
        let result = match self {
            ControlEvent::StepSuccess(data) => serde_json::to_value(data),
            ControlEvent::StepFailure(data) => serde_json::to_value(data),
            ControlEvent::SagaCompleted(data) => serde_json::to_value(data),
            ControlEvent::SagaCompensated(data) => serde_json::to_value(data),
        };
        result.expect("control event payloads are plain JSON-serializable structs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type(event_type)
            .payload_raw(payload)
            .source("test")
            .build()
    }

    #[test]
    fn test_event_type() {
        let corr = CorrelationId::from("corr-1");
        assert_eq!(
            ControlEvent::step_success(corr.clone(), "A", None).event_type(),
            STEP_SUCCESS
        );
        assert_eq!(
            ControlEvent::step_failure(corr.clone(), "A", "boom").event_type(),
            STEP_FAILURE
        );
        assert_eq!(
            ControlEvent::saga_completed("transfer", corr.clone()).event_type(),
            SAGA_COMPLETED
        );
        assert_eq!(
            ControlEvent::saga_compensated("transfer", corr, None).event_type(),
            SAGA_COMPENSATED
        );
    }

    #[test]
    fn test_parse_step_success() {
        let event = envelope(
            STEP_SUCCESS,
            serde_json::json!({
                "correlationId": "corr-1",
                "stepId": "A",
                "result": {"reservationId": "RES-1"}
            }),
        );

        match ControlEvent::from_envelope(&event).unwrap() {
            ControlEvent::StepSuccess(data) => {
                assert_eq!(data.correlation_id, CorrelationId::from("corr-1"));
                assert_eq!(data.step_id, "A");
                assert_eq!(
                    data.result,
                    Some(serde_json::json!({"reservationId": "RES-1"}))
                );
            }
            other => panic!("expected StepSuccess, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_step_success_without_result() {
        let event = envelope(
            STEP_SUCCESS,
            serde_json::json!({"correlationId": "corr-1", "stepId": "A"}),
        );
        match ControlEvent::from_envelope(&event).unwrap() {
            ControlEvent::StepSuccess(data) => assert!(data.result.is_none()),
            other => panic!("expected StepSuccess, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_step_failure() {
        let event = envelope(
            STEP_FAILURE,
            serde_json::json!({"correlationId": "corr-1", "stepId": "B", "error": "timeout"}),
        );
        match ControlEvent::from_envelope(&event).unwrap() {
            ControlEvent::StepFailure(data) => {
                assert_eq!(data.step_id, "B");
                assert_eq!(data.error, "timeout");
            }
            other => panic!("expected StepFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_non_reserved_type_is_rejected() {
        let event = envelope("cattle.transfer", serde_json::json!({}));
        assert!(matches!(
            ControlEvent::from_envelope(&event),
            Err(SagaError::NotControlEvent(_))
        ));
    }

    #[test]
    fn test_malformed_payload_is_a_serialization_error() {
        let event = envelope(STEP_SUCCESS, serde_json::json!({"stepId": "A"}));
        assert!(matches!(
            ControlEvent::from_envelope(&event),
            Err(SagaError::Serialization(_))
        ));
    }

    #[test]
    fn test_payload_roundtrip() {
        let corr = CorrelationId::from("corr-1");
        let payload =
            ControlEvent::saga_compensated("transfer", corr.clone(), Some("timeout".into()))
                .into_payload();

        assert_eq!(payload["sagaId"], serde_json::json!("transfer"));
        assert_eq!(payload["correlationId"], serde_json::json!("corr-1"));
        assert_eq!(payload["error"], serde_json::json!("timeout"));

        let event = envelope(SAGA_COMPENSATED, payload);
        match ControlEvent::from_envelope(&event).unwrap() {
            ControlEvent::SagaCompensated(data) => {
                assert_eq!(data.correlation_id, corr);
                assert_eq!(data.error, Some("timeout".to_string()));
            }
            other => panic!("expected SagaCompensated, got {other:?}"),
        }
    }
}
