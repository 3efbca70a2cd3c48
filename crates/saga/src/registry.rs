//! Catalog of registered saga definitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::definition::SagaDefinition;

/// Maps saga ids to their definitions.
///
/// Owned as a field of the orchestrator rather than ambient global state.
/// Definitions are read-only once stored; re-registering an id replaces
/// the prior definition wholesale. In-flight executions resolve the
/// definition at each step, so they observe a replacement mid-flight.
#[derive(Default)]
pub struct SagaRegistry {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
}

impl SagaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a definition by its saga id.
    ///
    /// Replacing an existing definition is allowed but logged, since any
    /// in-flight execution of the old shape will continue under the new
    /// one.
    pub fn register(&self, definition: SagaDefinition) {
        let saga_id = definition.saga_id.clone();
        let mut definitions = self.definitions.write().unwrap();
        if definitions
            .insert(saga_id.clone(), Arc::new(definition))
            .is_some()
        {
            tracing::warn!(saga_id, "saga definition replaced");
        } else {
            tracing::info!(saga_id, "saga definition registered");
        }
    }

    /// Returns the definition for a saga id, if registered.
    pub fn get(&self, saga_id: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.read().unwrap().get(saga_id).cloned()
    }

    /// Returns the number of registered definitions.
    pub fn len(&self) -> usize {
        self.definitions.read().unwrap().len()
    }

    /// Returns true if no definitions are registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.read().unwrap().is_empty()
    }
}
