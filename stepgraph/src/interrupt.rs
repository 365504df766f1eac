//! Human-in-the-loop interruption

use crate::config::RunnableConfig;
use crate::state::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Why and where a run paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionMetadata {
    /// Node (or edge source) the run paused at
    pub node_id: String,
    /// State at the moment of suspension
    pub state: State,
    /// Free-form data for whoever reviews the pause
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InterruptionMetadata {
    /// Create metadata for a pause at `node_id`
    pub fn new(node_id: &str, state: State) -> Self {
        Self { node_id: node_id.to_string(), state, metadata: HashMap::new() }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Get a metadata entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

impl std::fmt::Display for InterruptionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted at '{}'", self.node_id)
    }
}

/// Predicate deciding whether to pause at a node or before an edge.
///
/// Receives `(node_id, state, config)`; returning metadata suspends the run.
pub type InterruptFn =
    Arc<dyn Fn(&str, &State, &RunnableConfig) -> Option<InterruptionMetadata> + Send + Sync>;

/// Build an [`InterruptFn`] from a closure
pub fn interrupt_when<F>(f: F) -> InterruptFn
where
    F: Fn(&str, &State, &RunnableConfig) -> Option<InterruptionMetadata> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Pause on every visit. The stepper skips the check once when re-entering
/// the paused node, so a resume always makes progress.
pub fn always() -> InterruptFn {
    Arc::new(|node_id: &str, state: &State, _config: &RunnableConfig| {
        Some(InterruptionMetadata::new(node_id, state.clone()))
    })
}
