//! Node actions
//!
//! Nodes are the computational units of a graph. An action receives the
//! current state and the run configuration and returns a partial update that
//! the stepper folds into state through the channel reducers.

use crate::config::{RunnableConfig, StreamMode};
use crate::edge::{END, START};
use crate::error::{GraphError, Result};
use crate::graph::CompiledGraph;
use crate::input::GraphInput;
use crate::interrupt::InterruptFn;
use crate::state::{State, StateSchema, StateUpdate};
use crate::stream::RunResult;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The work a node performs
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Execute against a read-only view of state and return the partial update
    async fn call(&self, state: &State, config: &RunnableConfig) -> Result<StateUpdate>;

    /// The result as ordered partials, each folded into state in turn.
    ///
    /// Actions that produce several results (fan-in, nested runs) override
    /// this so non-associative reducers see every partial separately.
    async fn call_partials(
        &self,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<Vec<StateUpdate>> {
        Ok(vec![self.call(state, config).await?])
    }
}

/// Owned inputs handed to a [`FunctionAction`] closure
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// Current graph state
    pub state: State,
    /// Configuration for this run
    pub config: RunnableConfig,
}

impl NodeContext {
    /// Create a new node context
    pub fn new(state: State, config: RunnableConfig) -> Self {
        Self { state, config }
    }

    /// Get a value from state
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Get a value from state as a specific type
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Id of the node being executed
    pub fn node_id(&self) -> &str {
        self.config.node_id().unwrap_or_default()
    }
}

/// Type alias for async function signature
pub type AsyncNodeFn = Box<
    dyn Fn(NodeContext) -> Pin<Box<dyn Future<Output = Result<StateUpdate>> + Send>>
        + Send
        + Sync,
>;

/// Function action - wraps an async closure
pub struct FunctionAction {
    func: AsyncNodeFn,
}

impl FunctionAction {
    /// Create a new function action
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StateUpdate>> + Send + 'static,
    {
        Self { func: Box::new(move |ctx| Box::pin(func(ctx))) }
    }
}

#[async_trait]
impl NodeAction for FunctionAction {
    async fn call(&self, state: &State, config: &RunnableConfig) -> Result<StateUpdate> {
        (self.func)(NodeContext::new(state.clone(), config.clone())).await
    }
}

/// Passthrough action - leaves state unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughAction;

#[async_trait]
impl NodeAction for PassthroughAction {
    async fn call(&self, _state: &State, _config: &RunnableConfig) -> Result<StateUpdate> {
        Ok(StateUpdate::new())
    }
}

/// Runs a compiled graph as a single node.
///
/// The child run starts from the parent's state, streams in
/// [`StreamMode::Updates`] and every step's partial is folded into the parent
/// state in order. The child observes the parent's
/// cancellation and runs one level deeper in the [`GraphPath`](crate::config::GraphPath).
pub struct SubgraphAction {
    graph: CompiledGraph,
    parent_schema: StateSchema,
}

impl SubgraphAction {
    pub(crate) fn new(graph: CompiledGraph, parent_schema: StateSchema) -> Self {
        Self { graph, parent_schema }
    }
}

impl SubgraphAction {
    /// Drain the child run, keeping each step's partial
    async fn drain(&self, state: &State, config: &RunnableConfig) -> Result<Vec<StateUpdate>> {
        let node_id = config.node_id().unwrap_or_default().to_string();
        let mut child = RunnableConfig::new(&format!("{}/{}", config.thread_id, node_id))
            .with_stream_mode(StreamMode::Updates);
        child.metadata = config.metadata.clone();
        child.executors = config.executors.clone();
        child.graph_path = config.graph_path.child(&node_id);
        child.control = config.control.child();

        let mut stream = self.graph.stream(GraphInput::args(state.clone()), child);
        let mut partials = Vec::new();
        while let Some(output) = stream.next().await {
            let output = output?;
            if output.node_id == START || output.node_id == END {
                continue;
            }
            partials.push(output.state);
        }

        match stream.result() {
            Some(RunResult::Done(_)) => Ok(partials),
            Some(RunResult::Interrupted(meta)) => {
                Err(GraphError::SubgraphInterrupted { node: node_id, at: meta.node_id })
            }
            None => Err(GraphError::Cancelled),
        }
    }
}

#[async_trait]
impl NodeAction for SubgraphAction {
    async fn call(&self, state: &State, config: &RunnableConfig) -> Result<StateUpdate> {
        let mut aggregate = StateUpdate::new();
        for update in self.drain(state, config).await? {
            self.parent_schema.merge_partial(&mut aggregate, update);
        }
        Ok(aggregate)
    }

    async fn call_partials(
        &self,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<Vec<StateUpdate>> {
        self.drain(state, config).await
    }
}

/// A node as declared on the builder and frozen into the compiled plan
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique node id
    pub id: String,
    /// The work to perform
    pub action: Arc<dyn NodeAction>,
    /// Optional pause predicate evaluated before the action runs
    pub interrupt: Option<InterruptFn>,
    /// Whether this is a synthesized parallel fan-out node
    pub parallel: bool,
}

impl NodeSpec {
    /// Create a node spec
    pub fn new(id: &str, action: Arc<dyn NodeAction>) -> Self {
        Self { id: id.to_string(), action, interrupt: None, parallel: false }
    }

    /// Attach a pause predicate
    pub fn with_interrupt(mut self, interrupt: InterruptFn) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Whether this node can pause before running
    pub fn is_interruptible(&self) -> bool {
        self.interrupt.is_some()
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("interruptible", &self.is_interruptible())
            .field("parallel", &self.parallel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::partial;
    use serde_json::json;

    #[tokio::test]
    async fn test_function_action_sees_state_and_node() {
        let action = FunctionAction::new(|ctx: NodeContext| async move {
            let count: i64 = ctx.get_as("count").unwrap_or(0);
            Ok(partial(json!({"count": count + 1, "by": ctx.node_id()})))
        });

        let mut state = State::new();
        state.insert("count".to_string(), json!(41));
        let config = RunnableConfig::default().for_node("inc", false);

        let update = action.call(&state, &config).await.unwrap();
        assert_eq!(update.get("count"), Some(&json!(42)));
        assert_eq!(update.get("by"), Some(&json!("inc")));
    }

    #[tokio::test]
    async fn test_passthrough_is_empty() {
        let update = PassthroughAction.call(&State::new(), &RunnableConfig::default()).await.unwrap();
        assert!(update.is_empty());
    }

    #[tokio::test]
    async fn test_action_error_propagates() {
        let action = FunctionAction::new(|_ctx| async { Err(GraphError::action("nope")) });
        let err = action.call(&State::new(), &RunnableConfig::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}
