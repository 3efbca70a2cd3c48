//! Saga orchestrator: dispatches step commands, routes outcome events,
//! and runs the compensation sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use common::CorrelationId;
use event_bus::{ChannelTransport, EventBus, EventEnvelope, EventHandler};

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::{
    ControlEvent, SAGA_COMPENSATED, SAGA_COMPLETED, STEP_FAILURE, STEP_SUCCESS, StepFailureData,
    StepSuccessData,
};
use crate::execution::{SagaExecution, SagaStatus};
use crate::registry::SagaRegistry;

/// Drives saga executions over the event bus.
///
/// A single logical instance holds all execution state in local memory;
/// running a second instance against the same bus duplicates step
/// dispatch. Within one process the handle is cheap to clone and all
/// clones share state.
///
/// Every execution advances purely through asynchronous outcome events.
/// Nothing is returned synchronously to whoever started a saga: callers
/// subscribe to `saga.completed` / `saga.compensated`, or poll
/// `get_execution`.
pub struct SagaOrchestrator<T: ChannelTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ChannelTransport> Clone for SagaOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: ChannelTransport> {
    bus: EventBus<T>,
    source: String,
    registry: SagaRegistry,
    // Mutated only inside short, non-await critical sections; the lock
    // supplies the per-correlation-id mutual exclusion outcome routing
    // relies on.
    executions: Mutex<HashMap<CorrelationId, SagaExecution>>,
    started: AtomicBool,
}

/// What `execute_next_step` decided to do, computed under the lock and
/// acted on after it is released.
enum Dispatch {
    Complete {
        saga_id: String,
        duration_secs: f64,
    },
    Command {
        step_id: String,
        command_type: String,
        payload: serde_json::Value,
    },
}

impl<T: ChannelTransport + 'static> SagaOrchestrator<T> {
    /// Creates an orchestrator publishing with the given source name.
    pub fn new(bus: EventBus<T>, source: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                source: source.into(),
                registry: SagaRegistry::new(),
                executions: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a saga definition. Re-registering an id replaces the
    /// prior definition and logs a warning.
    pub fn register_saga(&self, definition: SagaDefinition) {
        self.inner.registry.register(definition);
    }

    /// Returns the registry of definitions.
    pub fn registry(&self) -> &SagaRegistry {
        &self.inner.registry
    }

    /// Subscribes to the reserved step outcome events.
    ///
    /// Must be called once before any saga is started; calling it again
    /// is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handler = Arc::new(ControlEventHandler {
            orchestrator: self.clone(),
        });
        self.inner.bus.subscribe(STEP_SUCCESS, handler.clone()).await?;
        self.inner.bus.subscribe(STEP_FAILURE, handler).await?;

        tracing::info!(source = %self.inner.source, "saga orchestrator listening for step outcomes");
        Ok(())
    }

    /// Starts a saga execution keyed by `correlation_id` and dispatches
    /// its first step.
    ///
    /// A definition with zero steps completes before this returns. Step
    /// dispatch failures are converted into a step failure (and thus a
    /// compensation sweep), never returned to the caller.
    #[tracing::instrument(skip(self, initial_payload), fields(correlation_id = %correlation_id))]
    pub async fn start_saga(
        &self,
        saga_id: &str,
        correlation_id: CorrelationId,
        initial_payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let definition = self
            .inner
            .registry
            .get(saga_id)
            .ok_or_else(|| SagaError::UnknownSaga(saga_id.to_string()))?;

        {
            let mut executions = self.inner.executions.lock().unwrap();
            if let Some(existing) = executions.get(&correlation_id)
                && !existing.status().is_terminal()
            {
                return Err(SagaError::DuplicateCorrelationId(correlation_id));
            }
            executions.insert(
                correlation_id.clone(),
                SagaExecution::new(saga_id, correlation_id.clone()),
            );
        }

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(steps = definition.step_count(), "saga started");

        self.execute_next_step(&correlation_id, initial_payload).await;
        Ok(())
    }

    /// Returns a snapshot of the execution for a correlation id.
    pub fn get_execution(&self, correlation_id: &CorrelationId) -> Option<SagaExecution> {
        self.inner
            .executions
            .lock()
            .unwrap()
            .get(correlation_id)
            .cloned()
    }

    /// Deletes terminal executions whose `end_time` is older than the
    /// retention window. Pending, failed, and compensating executions are
    /// never swept, even if stuck. Returns the number removed.
    pub fn cleanup_completed_sagas(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut executions = self.inner.executions.lock().unwrap();
        let before = executions.len();
        executions.retain(|_, execution| {
            !(execution.status().is_terminal()
                && execution.end_time().is_some_and(|end| end < cutoff))
        });
        let removed = before - executions.len();
        if removed > 0 {
            tracing::info!(removed, "cleaned up terminal saga executions");
        }
        removed
    }

    /// Spawns a periodic cleanup sweep. Abort the returned handle on
    /// shutdown.
    pub fn spawn_cleanup(
        &self,
        interval: std::time::Duration,
        retention: chrono::Duration,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.cleanup_completed_sagas(retention);
            }
        })
    }

    /// Dispatches the step at the current index, or completes the saga
    /// when the cursor is past the last step.
    async fn execute_next_step(
        &self,
        correlation_id: &CorrelationId,
        carried: Option<serde_json::Value>,
    ) {
        let dispatch = {
            let mut executions = self.inner.executions.lock().unwrap();
            let Some(execution) = executions.get_mut(correlation_id) else {
                tracing::debug!(%correlation_id, "no execution to advance");
                return;
            };
            let Some(definition) = self.inner.registry.get(execution.saga_id()) else {
                tracing::error!(
                    %correlation_id,
                    saga_id = execution.saga_id(),
                    "definition missing, execution parked"
                );
                return;
            };

            match definition.step(execution.current_step_index()) {
                None => {
                    execution.complete();
                    let duration = Utc::now() - execution.start_time();
                    Dispatch::Complete {
                        saga_id: execution.saga_id().to_string(),
                        duration_secs: duration.num_milliseconds() as f64 / 1000.0,
                    }
                }
                Some(step) => Dispatch::Command {
                    step_id: step.step_id.clone(),
                    command_type: step.command_type(),
                    // Carried-forward result wins over the static template.
                    payload: carried
                        .or_else(|| step.payload.clone())
                        .unwrap_or(serde_json::Value::Null),
                },
            }
        };

        match dispatch {
            Dispatch::Complete {
                saga_id,
                duration_secs,
            } => {
                metrics::counter!("saga_completed_total").increment(1);
                metrics::histogram!("saga_duration_seconds").record(duration_secs);
                tracing::info!(%correlation_id, saga_id, duration_secs, "saga completed");

                let payload = ControlEvent::saga_completed(saga_id, correlation_id.clone())
                    .into_payload();
                if let Err(error) = self
                    .inner
                    .bus
                    .publish(
                        SAGA_COMPLETED,
                        payload,
                        &self.inner.source,
                        Some(correlation_id.clone()),
                    )
                    .await
                {
                    tracing::error!(%correlation_id, %error, "failed to publish saga.completed");
                }
            }
            Dispatch::Command {
                step_id,
                command_type,
                payload,
            } => {
                tracing::info!(%correlation_id, step_id, command_type, "dispatching saga step");
                if let Err(error) = self
                    .inner
                    .bus
                    .publish(
                        &command_type,
                        payload,
                        &self.inner.source,
                        Some(correlation_id.clone()),
                    )
                    .await
                {
                    // A broker problem during dispatch is a step failure,
                    // not an exception for whoever started the saga.
                    tracing::warn!(%correlation_id, step_id, %error, "step dispatch failed");
                    self.handle_step_failure(StepFailureData {
                        correlation_id: correlation_id.clone(),
                        step_id,
                        error: error.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    /// Routes a `saga.step.success` outcome to its execution.
    async fn handle_step_success(&self, data: StepSuccessData) {
        {
            let mut executions = self.inner.executions.lock().unwrap();
            let Some(execution) = executions.get_mut(&data.correlation_id) else {
                // Already cleaned up, or an unrelated producer's event.
                tracing::debug!(
                    correlation_id = %data.correlation_id,
                    "step success for unknown correlation id ignored"
                );
                return;
            };
            if !execution.status().can_advance() {
                tracing::debug!(
                    correlation_id = %data.correlation_id,
                    status = %execution.status(),
                    "step success for non-pending execution ignored"
                );
                return;
            }
            if execution.is_duplicate_success(&data.step_id) {
                tracing::debug!(
                    correlation_id = %data.correlation_id,
                    step_id = %data.step_id,
                    "duplicate step success ignored"
                );
                return;
            }
            execution.advance(data.step_id.as_str());
        }

        self.execute_next_step(&data.correlation_id, data.result).await;
    }

    /// Routes a `saga.step.failure` outcome to its execution and begins
    /// the compensation sweep.
    async fn handle_step_failure(&self, data: StepFailureData) {
        {
            let mut executions = self.inner.executions.lock().unwrap();
            let Some(execution) = executions.get_mut(&data.correlation_id) else {
                tracing::debug!(
                    correlation_id = %data.correlation_id,
                    "step failure for unknown correlation id ignored"
                );
                return;
            };
            if !execution.status().can_advance() {
                tracing::debug!(
                    correlation_id = %data.correlation_id,
                    status = %execution.status(),
                    "step failure for non-pending execution ignored"
                );
                return;
            }
            execution.fail(data.step_id.as_str(), data.error.as_str());
        }

        metrics::counter!("saga_step_failures_total").increment(1);
        tracing::warn!(
            correlation_id = %data.correlation_id,
            step_id = %data.step_id,
            error = %data.error,
            "saga step failed"
        );

        self.begin_compensation(&data.correlation_id).await;
    }

    /// Publishes the compensating action of every completed step in
    /// strict reverse order.
    ///
    /// Publish failures are logged and the sweep continues; there is no
    /// second-order compensation and no escalation path for a failed
    /// compensating action.
    async fn begin_compensation(&self, correlation_id: &CorrelationId) {
        let (saga_id, completed_steps, error) = {
            let mut executions = self.inner.executions.lock().unwrap();
            let Some(execution) = executions.get_mut(correlation_id) else {
                tracing::debug!(%correlation_id, "no execution to compensate");
                return;
            };
            if !execution.status().can_compensate() {
                tracing::debug!(
                    %correlation_id,
                    status = %execution.status(),
                    "execution not eligible for compensation"
                );
                return;
            }
            execution.begin_compensation();
            (
                execution.saga_id().to_string(),
                execution.completed_steps().to_vec(),
                execution.error().map(String::from),
            )
        };

        tracing::info!(
            %correlation_id,
            saga_id,
            steps = completed_steps.len(),
            "compensating saga"
        );

        if let Some(definition) = self.inner.registry.get(&saga_id) {
            for step_id in completed_steps.iter().rev() {
                let Some(step) = definition.step_by_id(step_id) else {
                    tracing::warn!(
                        %correlation_id,
                        step_id,
                        "completed step missing from definition, compensation skipped"
                    );
                    continue;
                };
                let Some(command_type) = step.compensation_command_type() else {
                    tracing::debug!(%correlation_id, step_id, "step declares no compensation");
                    continue;
                };
                let payload = step
                    .compensation_payload
                    .clone()
                    .or_else(|| step.payload.clone())
                    .unwrap_or(serde_json::Value::Null);

                if let Err(error) = self
                    .inner
                    .bus
                    .publish(
                        &command_type,
                        payload,
                        &self.inner.source,
                        Some(correlation_id.clone()),
                    )
                    .await
                {
                    metrics::counter!("saga_compensation_failures_total").increment(1);
                    tracing::error!(
                        %correlation_id,
                        step_id,
                        %error,
                        "compensation publish failed, continuing sweep"
                    );
                }
            }
        } else {
            tracing::error!(%correlation_id, saga_id, "definition missing during compensation");
        }

        let duration_secs = {
            let mut executions = self.inner.executions.lock().unwrap();
            match executions.get_mut(correlation_id) {
                Some(execution) => {
                    execution.mark_compensated();
                    (Utc::now() - execution.start_time()).num_milliseconds() as f64 / 1000.0
                }
                None => 0.0,
            }
        };

        metrics::counter!("saga_compensated_total").increment(1);
        metrics::histogram!("saga_duration_seconds").record(duration_secs);
        tracing::warn!(%correlation_id, saga_id, "saga compensated");

        let payload =
            ControlEvent::saga_compensated(saga_id, correlation_id.clone(), error).into_payload();
        if let Err(error) = self
            .inner
            .bus
            .publish(
                SAGA_COMPENSATED,
                payload,
                &self.inner.source,
                Some(correlation_id.clone()),
            )
            .await
        {
            tracing::error!(%correlation_id, %error, "failed to publish saga.compensated");
        }
    }
}

/// The orchestrator's single global subscription to step outcome events.
struct ControlEventHandler<T: ChannelTransport> {
    orchestrator: SagaOrchestrator<T>,
}

#[async_trait]
impl<T: ChannelTransport + 'static> EventHandler for ControlEventHandler<T> {
    fn name(&self) -> &str {
        "saga-control"
    }

    async fn handle(&self, event: &EventEnvelope) -> event_bus::Result<()> {
        match ControlEvent::from_envelope(event) {
            Ok(ControlEvent::StepSuccess(data)) => {
                self.orchestrator.handle_step_success(data).await;
            }
            Ok(ControlEvent::StepFailure(data)) => {
                self.orchestrator.handle_step_failure(data).await;
            }
            // Terminal notifications are emitted, not consumed, here.
            Ok(_) => {}
            Err(SagaError::Serialization(error)) => {
                tracing::warn!(
                    event_type = %event.event_type,
                    %error,
                    "malformed control event payload ignored"
                );
            }
            Err(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{SagaDefinition, SagaStep};
    use event_bus::{BusConfig, InMemoryBroker, InMemoryTransport};

    async fn orchestrator() -> SagaOrchestrator<InMemoryTransport> {
        let transport = Arc::new(InMemoryTransport::new(InMemoryBroker::new()));
        transport.connect().await.unwrap();
        let bus = EventBus::new(transport, &BusConfig::default());
        let orchestrator = SagaOrchestrator::new(bus, "saga-orchestrator");
        orchestrator.start().await.unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_unknown_saga_is_an_error() {
        let orchestrator = orchestrator().await;
        let result = orchestrator
            .start_saga("missing", CorrelationId::from("corr-1"), None)
            .await;
        assert!(matches!(result, Err(SagaError::UnknownSaga(_))));
        assert!(orchestrator.get_execution(&CorrelationId::from("corr-1")).is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let orchestrator = orchestrator().await;
        orchestrator.start().await.unwrap();
        orchestrator.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_step_saga_completes_inside_start_saga() {
        let orchestrator = orchestrator().await;
        orchestrator.register_saga(SagaDefinition::new("noop", vec![]));

        let corr = CorrelationId::from("corr-1");
        orchestrator.start_saga("noop", corr.clone(), None).await.unwrap();

        let execution = orchestrator.get_execution(&corr).unwrap();
        assert_eq!(execution.status(), SagaStatus::Completed);
        assert!(execution.completed_steps().is_empty());
        assert!(execution.end_time().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_correlation_id_is_rejected() {
        let orchestrator = orchestrator().await;
        orchestrator.register_saga(SagaDefinition::new(
            "transfer",
            vec![SagaStep::new("A", "svcA", "doA")],
        ));

        let corr = CorrelationId::from("corr-1");
        orchestrator.start_saga("transfer", corr.clone(), None).await.unwrap();

        let result = orchestrator.start_saga("transfer", corr, None).await;
        assert!(matches!(result, Err(SagaError::DuplicateCorrelationId(_))));
    }

    #[tokio::test]
    async fn test_terminal_correlation_id_can_be_reused() {
        let orchestrator = orchestrator().await;
        orchestrator.register_saga(SagaDefinition::new("noop", vec![]));

        let corr = CorrelationId::from("corr-1");
        orchestrator.start_saga("noop", corr.clone(), None).await.unwrap();
        orchestrator.start_saga("noop", corr.clone(), None).await.unwrap();

        let execution = orchestrator.get_execution(&corr).unwrap();
        assert_eq!(execution.status(), SagaStatus::Completed);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_terminal_executions() {
        let orchestrator = orchestrator().await;
        orchestrator.register_saga(SagaDefinition::new("noop", vec![]));
        orchestrator.register_saga(SagaDefinition::new(
            "transfer",
            vec![SagaStep::new("A", "svcA", "doA")],
        ));

        let done = CorrelationId::from("corr-done");
        let parked = CorrelationId::from("corr-parked");
        orchestrator.start_saga("noop", done.clone(), None).await.unwrap();
        orchestrator.start_saga("transfer", parked.clone(), None).await.unwrap();

        // A negative retention puts the cutoff in the future, so any
        // terminal execution qualifies regardless of age.
        let removed = orchestrator.cleanup_completed_sagas(chrono::Duration::seconds(-1));

        assert_eq!(removed, 1);
        assert!(orchestrator.get_execution(&done).is_none());
        assert_eq!(
            orchestrator.get_execution(&parked).unwrap().status(),
            SagaStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_fresh_terminal_executions_are_retained() {
        let orchestrator = orchestrator().await;
        orchestrator.register_saga(SagaDefinition::new("noop", vec![]));

        let corr = CorrelationId::from("corr-1");
        orchestrator.start_saga("noop", corr.clone(), None).await.unwrap();

        let removed = orchestrator.cleanup_completed_sagas(chrono::Duration::hours(1));
        assert_eq!(removed, 0);
        assert!(orchestrator.get_execution(&corr).is_some());
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_outcome_is_ignored() {
        let orchestrator = orchestrator().await;
        orchestrator
            .handle_step_success(StepSuccessData {
                correlation_id: CorrelationId::from("corr-ghost"),
                step_id: "A".to_string(),
                result: None,
            })
            .await;
        orchestrator
            .handle_step_failure(StepFailureData {
                correlation_id: CorrelationId::from("corr-ghost"),
                step_id: "A".to_string(),
                error: "boom".to_string(),
            })
            .await;

        assert!(orchestrator
            .get_execution(&CorrelationId::from("corr-ghost"))
            .is_none());
    }
}
