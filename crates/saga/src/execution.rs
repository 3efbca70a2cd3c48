//! Per-correlation-id execution state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::CorrelationId;

/// The status of a saga execution.
///
/// Status transitions are monotonic:
/// ```text
/// Pending ──┬──► Completed
///           └──► Failed ──► Compensating ──► Compensated
/// ```
/// An execution never re-enters `Pending` after leaving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    /// Steps are being dispatched and awaited.
    #[default]
    Pending,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed; compensation is about to begin.
    Failed,

    /// Compensating actions are being published in reverse order.
    Compensating,

    /// The compensation sweep finished (terminal state).
    Compensated,
}

impl SagaStatus {
    /// Returns true if forward progress is still possible.
    pub fn can_advance(&self) -> bool {
        matches!(self, SagaStatus::Pending)
    }

    /// Returns true if the execution can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Failed)
    }

    /// Returns true if this is a terminal state eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress record for one saga execution, keyed by correlation id.
///
/// Mutated exclusively by the orchestrator's own event handlers.
/// `completed_steps` is append-only and strictly forward; compensation
/// reads it in reverse and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaExecution {
    saga_id: String,
    correlation_id: CorrelationId,
    status: SagaStatus,
    current_step_index: usize,
    completed_steps: Vec<String>,
    failed_step: Option<String>,
    error: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl SagaExecution {
    /// Creates a pending execution pointing at step 0.
    pub fn new(saga_id: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            saga_id: saga_id.into(),
            correlation_id,
            status: SagaStatus::Pending,
            current_step_index: 0,
            completed_steps: Vec::new(),
            failed_step: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Returns true if this step id was the most recently completed step.
    ///
    /// A matching outcome event is a duplicate delivery and must not
    /// advance the execution a second time.
    pub fn is_duplicate_success(&self, step_id: &str) -> bool {
        self.completed_steps
            .last()
            .is_some_and(|last| last == step_id)
    }

    /// Records a successful step and moves the cursor to the next one.
    pub fn advance(&mut self, step_id: impl Into<String>) {
        self.completed_steps.push(step_id.into());
        self.current_step_index += 1;
    }

    /// Marks the execution completed.
    pub fn complete(&mut self) {
        self.status = SagaStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    /// Records a step failure.
    pub fn fail(&mut self, step_id: impl Into<String>, error: impl Into<String>) {
        self.status = SagaStatus::Failed;
        self.failed_step = Some(step_id.into());
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
    }

    /// Enters the compensation sweep.
    pub fn begin_compensation(&mut self) {
        self.status = SagaStatus::Compensating;
    }

    /// Marks the compensation sweep finished.
    pub fn mark_compensated(&mut self) {
        self.status = SagaStatus::Compensated;
        self.end_time = Some(Utc::now());
    }
}

// Query methods
impl SagaExecution {
    /// Returns the id of the definition this execution runs.
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Returns the correlation id keying this execution.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Returns the current status.
    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Returns the index of the next step to dispatch.
    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    /// Returns the ids of completed steps in completion order.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Returns the step that failed, if any.
    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Returns the error recorded on failure, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns when the execution started.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Returns when the execution reached a terminal or failed state.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }
}
