//! Saga orchestration layer for multi-step business transactions.
//!
//! A saga is a long-running transaction expressed as an ordered list of
//! steps, each owned by an independent participant service (transferring
//! cattle between farms, processing a purchase order). The orchestrator
//! publishes each step as a command event on the shared bus, listens for
//! the participant's outcome event, and either advances to the next step
//! or rolls back by publishing the compensating actions of every
//! completed step in reverse order.
//!
//! No outcome is returned synchronously: callers observe the terminal
//! `saga.completed` / `saga.compensated` events, or poll execution state
//! by correlation id.

pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod execution;
pub mod orchestrator;
pub mod registry;

pub use common::CorrelationId;
pub use config::OrchestratorConfig;
pub use definition::{SagaDefinition, SagaStep};
pub use error::SagaError;
pub use events::{
    ControlEvent, SAGA_COMPENSATED, SAGA_COMPLETED, STEP_FAILURE, STEP_SUCCESS,
    SagaCompensatedData, SagaCompletedData, StepFailureData, StepSuccessData,
};
pub use execution::{SagaExecution, SagaStatus};
pub use orchestrator::SagaOrchestrator;
pub use registry::SagaRegistry;
