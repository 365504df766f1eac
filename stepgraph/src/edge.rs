//! Edge types for graph control flow
//!
//! Edges define how execution flows between nodes. A static edge always
//! follows the same target; a conditional edge asks an [`EdgeAction`] for a
//! route label and resolves it through its declared mapping.

use crate::config::RunnableConfig;
use crate::error::{GraphError, Result};
use crate::node::NodeContext;
use crate::state::{State, StateUpdate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Special node identifiers
pub const START: &str = "__start__";
pub const END: &str = "__end__";

/// Target of an edge
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeTarget {
    /// Specific node
    Node(String),
    /// End of graph
    End,
}

impl EdgeTarget {
    /// Check if this is the END target
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Get the node name if this is a Node target
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Self::Node(name) => Some(name),
            Self::End => None,
        }
    }

    /// Node id for bookkeeping, with END as its sentinel
    pub fn id(&self) -> &str {
        match self {
            Self::Node(name) => name,
            Self::End => END,
        }
    }
}

impl From<&str> for EdgeTarget {
    fn from(s: &str) -> Self {
        if s == END { Self::End } else { Self::Node(s.to_string()) }
    }
}

/// Routing decision of a conditional edge: a label plus an optional state update
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Command {
    /// Route label, looked up in the edge's mapping
    pub route: String,
    /// Merged into state before the route is followed
    pub update: StateUpdate,
}

impl Command {
    /// Route without updating state
    pub fn goto(route: &str) -> Self {
        Self { route: route.to_string(), update: StateUpdate::new() }
    }

    /// Attach a state update
    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = update;
        self
    }
}

/// Routing logic of a conditional edge
#[async_trait]
pub trait EdgeAction: Send + Sync {
    /// Choose a route for the state produced by the edge's source node
    async fn route(&self, state: &State, config: &RunnableConfig) -> Result<Command>;
}

/// Router function type
pub type RouterFn = Arc<dyn Fn(&State) -> String + Send + Sync>;

/// Synchronous router over state
pub struct RouterAction {
    router: RouterFn,
}

impl RouterAction {
    /// Wrap a router closure
    pub fn new<F>(router: F) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
    {
        Self { router: Arc::new(router) }
    }
}

#[async_trait]
impl EdgeAction for RouterAction {
    async fn route(&self, state: &State, _config: &RunnableConfig) -> Result<Command> {
        Ok(Command::goto(&(self.router)(state)))
    }
}

type AsyncEdgeFn =
    Box<dyn Fn(NodeContext) -> Pin<Box<dyn Future<Output = Result<Command>> + Send>> + Send + Sync>;

/// Asynchronous, fallible router - wraps an async closure returning a [`Command`]
pub struct FunctionEdge {
    func: AsyncEdgeFn,
}

impl FunctionEdge {
    /// Create a new function edge
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Command>> + Send + 'static,
    {
        Self { func: Box::new(move |ctx| Box::pin(func(ctx))) }
    }
}

#[async_trait]
impl EdgeAction for FunctionEdge {
    async fn route(&self, state: &State, config: &RunnableConfig) -> Result<Command> {
        (self.func)(NodeContext::new(state.clone(), config.clone())).await
    }
}

/// Edge type
#[derive(Clone)]
pub enum Edge {
    /// Direct edge: always go from source to target
    Direct { source: String, target: EdgeTarget },

    /// Conditional edge: route based on state
    Conditional {
        source: String,
        /// Produces the route label
        action: Arc<dyn EdgeAction>,
        /// Map of route labels to targets (for validation and documentation)
        targets: HashMap<String, EdgeTarget>,
    },
}

impl Edge {
    /// Node this edge leaves from
    pub fn source(&self) -> &str {
        match self {
            Self::Direct { source, .. } | Self::Conditional { source, .. } => source,
        }
    }

    /// Whether routing is data dependent
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional { .. })
    }

    /// Every target this edge can lead to
    pub fn possible_targets(&self) -> Vec<&EdgeTarget> {
        match self {
            Self::Direct { target, .. } => vec![target],
            Self::Conditional { targets, .. } => targets.values().collect(),
        }
    }

    /// Resolve a route label against the declared mapping.
    ///
    /// A label missing from the mapping is accepted only when it is END.
    pub fn resolve(&self, route: &str) -> Result<EdgeTarget> {
        match self {
            Self::Direct { target, .. } => Ok(target.clone()),
            Self::Conditional { source, targets, .. } => match targets.get(route) {
                Some(target) => Ok(target.clone()),
                None if route == END => Ok(EdgeTarget::End),
                None => Err(GraphError::UnknownRouteTarget {
                    source_node: source.clone(),
                    route: route.to_string(),
                }),
            },
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct { source, target } => {
                f.debug_struct("Direct").field("source", source).field("target", target).finish()
            }
            Self::Conditional { source, targets, .. } => f
                .debug_struct("Conditional")
                .field("source", source)
                .field("targets", targets)
                .finish(),
        }
    }
}

/// Router helper functions for common patterns
pub struct Router;

impl Router {
    /// Route based on a state field value
    ///
    /// # Example
    /// ```ignore
    /// graph.add_conditional_edges("supervisor", Router::by_field("next_agent"), targets)
    /// ```
    pub fn by_field(field: &str) -> impl Fn(&State) -> String + Send + Sync + Clone {
        let field = field.to_string();
        move |state: &State| state.get(&field).and_then(|v| v.as_str()).unwrap_or(END).to_string()
    }

    /// Route based on a boolean state field
    ///
    /// # Example
    /// ```ignore
    /// graph.add_conditional_edges("check", Router::by_bool("approved", "publish", END), targets)
    /// ```
    pub fn by_bool(
        field: &str,
        if_true: &str,
        if_false: &str,
    ) -> impl Fn(&State) -> String + Send + Sync + Clone {
        let field = field.to_string();
        let if_true = if_true.to_string();
        let if_false = if_false.to_string();

        move |state: &State| {
            let is_true = state.get(&field).and_then(|v| v.as_bool()).unwrap_or(false);

            if is_true { if_true.clone() } else { if_false.clone() }
        }
    }

    /// Route based on iteration count
    ///
    /// # Example
    /// ```ignore
    /// graph.add_conditional_edges("loop", Router::max_iterations("iteration", 5, "continue", "done"), targets)
    /// ```
    pub fn max_iterations(
        counter_field: &str,
        max: usize,
        continue_target: &str,
        done_target: &str,
    ) -> impl Fn(&State) -> String + Send + Sync + Clone {
        let counter_field = counter_field.to_string();
        let continue_target = continue_target.to_string();
        let done_target = done_target.to_string();

        move |state: &State| {
            let count = state.get(&counter_field).and_then(|v| v.as_u64()).unwrap_or(0) as usize;

            if count < max { continue_target.clone() } else { done_target.clone() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conditional(targets: &[(&str, &str)]) -> Edge {
        Edge::Conditional {
            source: "check".to_string(),
            action: Arc::new(RouterAction::new(|_: &State| END.to_string())),
            targets: targets.iter().map(|(k, v)| (k.to_string(), EdgeTarget::from(*v))).collect(),
        }
    }

    #[test]
    fn test_resolve_mapping() {
        let edge = conditional(&[("yes", "publish"), ("no", END)]);
        assert_eq!(edge.resolve("yes").unwrap(), EdgeTarget::Node("publish".to_string()));
        assert_eq!(edge.resolve("no").unwrap(), EdgeTarget::End);
        assert_eq!(edge.resolve(END).unwrap(), EdgeTarget::End);

        let err = edge.resolve("maybe").unwrap_err();
        assert!(
            matches!(err, GraphError::UnknownRouteTarget { ref route, .. } if route == "maybe")
        );
    }

    #[tokio::test]
    async fn test_router_action_builds_command() {
        let action = RouterAction::new(Router::by_field("next"));
        let mut state = State::new();
        state.insert("next".to_string(), json!("agent_a"));

        let command = action.route(&state, &RunnableConfig::default()).await.unwrap();
        assert_eq!(command, Command::goto("agent_a"));
    }

    #[test]
    fn test_by_field_router() {
        let router = Router::by_field("next");

        let mut state = State::new();
        state.insert("next".to_string(), json!("agent_a"));
        assert_eq!(router(&state), "agent_a");

        // Missing field returns END
        assert_eq!(router(&State::new()), END);
    }

    #[test]
    fn test_by_bool_router() {
        let router = Router::by_bool("should_continue", "continue", "stop");

        let mut state = State::new();
        state.insert("should_continue".to_string(), json!(true));
        assert_eq!(router(&state), "continue");

        state.insert("should_continue".to_string(), json!(false));
        assert_eq!(router(&state), "stop");
    }

    #[test]
    fn test_max_iterations_router() {
        let router = Router::max_iterations("count", 3, "loop", "done");

        let mut state = State::new();
        state.insert("count".to_string(), json!(2));
        assert_eq!(router(&state), "loop");

        state.insert("count".to_string(), json!(3));
        assert_eq!(router(&state), "done");
    }

    #[test]
    fn test_edge_target_from_str() {
        assert_eq!(EdgeTarget::from("node_a"), EdgeTarget::Node("node_a".to_string()));
        assert_eq!(EdgeTarget::from(END), EdgeTarget::End);
        assert_eq!(EdgeTarget::End.id(), END);
    }
}
