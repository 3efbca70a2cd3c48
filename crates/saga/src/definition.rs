//! Saga definitions: the ordered step lists that sagas execute.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One step of a saga.
///
/// The forward command is published as `"<service>.<action>"`. A step may
/// declare a compensating action to undo it during rollback; steps without
/// one (read-only or naturally idempotent actions) are skipped when the
/// saga compensates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStep {
    /// Unique within one definition.
    pub step_id: String,

    /// The participant service that owns this step.
    pub service: String,

    /// The action the participant performs.
    pub action: String,

    /// Static payload template, used for step 0 or whenever no result was
    /// carried forward from the previous step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Compensating action published during rollback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_action: Option<String>,

    /// Payload for the compensating action. Falls back to the forward
    /// template when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_payload: Option<serde_json::Value>,
}

impl SagaStep {
    /// Creates a step with no payload template and no compensation.
    pub fn new(
        step_id: impl Into<String>,
        service: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            service: service.into(),
            action: action.into(),
            payload: None,
            compensation_action: None,
            compensation_payload: None,
        }
    }

    /// Sets the static payload template.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Declares a compensating action.
    pub fn with_compensation(mut self, action: impl Into<String>) -> Self {
        self.compensation_action = Some(action.into());
        self
    }

    /// Sets the payload published with the compensating action.
    pub fn with_compensation_payload(mut self, payload: serde_json::Value) -> Self {
        self.compensation_payload = Some(payload);
        self
    }

    /// The event type of the forward command: `"<service>.<action>"`.
    pub fn command_type(&self) -> String {
        format!("{}.{}", self.service, self.action)
    }

    /// The event type of the compensating command, if the step declares one.
    pub fn compensation_command_type(&self) -> Option<String> {
        self.compensation_action
            .as_ref()
            .map(|action| format!("{}.{}", self.service, action))
    }
}

/// An immutable-after-registration description of a saga.
///
/// Steps are never mutated during execution; re-registering under the
/// same id replaces the whole definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaDefinition {
    /// Identifier callers use to start this saga.
    pub saga_id: String,

    /// Ordered forward steps.
    pub steps: Vec<SagaStep>,

    /// Carried on the definition but not enforced: a participant that
    /// never publishes an outcome leaves the execution parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl SagaDefinition {
    /// Creates a definition from an ordered list of steps.
    pub fn new(saga_id: impl Into<String>, steps: Vec<SagaStep>) -> Self {
        Self {
            saga_id: saga_id.into(),
            steps,
            timeout: None,
        }
    }

    /// Sets the (unenforced) timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the number of steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the step at `index`, or None past the end.
    pub fn step(&self, index: usize) -> Option<&SagaStep> {
        self.steps.get(index)
    }

    /// Returns the step with the given id, if present.
    pub fn step_by_id(&self, step_id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }
}
