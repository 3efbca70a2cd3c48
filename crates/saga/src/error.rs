//! Saga error types.

use common::CorrelationId;
use event_bus::EventBusError;
use thiserror::Error;

/// Errors that can occur during saga operations.
///
/// A participant reporting a step failure is not an error in this sense;
/// that outcome travels purely through `saga.step.failure` events and
/// drives compensation.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered under the given saga id.
    #[error("Unknown saga: {0}")]
    UnknownSaga(String),

    /// An in-flight execution already exists for this correlation id.
    #[error("Correlation id '{0}' already has an in-flight execution")]
    DuplicateCorrelationId(CorrelationId),

    /// An event carried a reserved-looking type that is not a saga
    /// control event.
    #[error("Not a saga control event: {0}")]
    NotControlEvent(String),

    /// Event bus error.
    #[error("Event bus error: {0}")]
    Bus(#[from] EventBusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
