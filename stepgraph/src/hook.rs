//! Hook pipeline
//!
//! Hooks intercept node and conditional-edge evaluation. Each kind can be
//! registered globally or scoped to one node id:
//!
//! - **Before** hooks return a partial folded into state before the action runs.
//! - **After** hooks see the action result and return a partial folded after it.
//! - **Wrap** hooks receive the inner action and decide how (or whether) to call it.
//!
//! Ordering within a scope: the most recently registered wrap hook sits
//! innermost, and before/after hooks run most-recent first. Global hooks run
//! before node-scoped ones, and global wraps sit inside node-scoped wraps, so
//! a node-scoped wrap sees the global wraps already applied.
//!
//! The registry is only mutated while building. [`StateGraph::compile`](crate::StateGraph::compile)
//! freezes one [`NodeHooks`] or [`EdgeHooks`] chain per node.

use crate::config::RunnableConfig;
use crate::edge::{Command, EdgeAction};
use crate::error::Result;
use crate::node::NodeAction;
use crate::state::{State, StateSchema, StateUpdate};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Runs before a node action; the returned partial is folded into state first
#[async_trait]
pub trait BeforeCall: Send + Sync {
    async fn before_call(
        &self,
        node_id: &str,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<StateUpdate>;
}

/// Runs after a node action; the returned partial is folded in after its result
#[async_trait]
pub trait AfterCall: Send + Sync {
    async fn after_call(
        &self,
        node_id: &str,
        state: &State,
        config: &RunnableConfig,
        result: &StateUpdate,
    ) -> Result<StateUpdate>;
}

/// Surrounds a node action
#[async_trait]
pub trait WrapCall: Send + Sync {
    async fn wrap_call(
        &self,
        node_id: &str,
        state: &State,
        config: &RunnableConfig,
        next: &dyn NodeAction,
    ) -> Result<StateUpdate>;
}

/// Runs before a conditional edge routes; the partial is folded into state first
#[async_trait]
pub trait EdgeBeforeCall: Send + Sync {
    async fn before_call(
        &self,
        source_id: &str,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<StateUpdate>;
}

/// Runs after a conditional edge routes and may rewrite the command
#[async_trait]
pub trait EdgeAfterCall: Send + Sync {
    async fn after_call(
        &self,
        source_id: &str,
        state: &State,
        config: &RunnableConfig,
        command: Command,
    ) -> Result<Command>;
}

/// Surrounds a conditional edge's routing action
#[async_trait]
pub trait EdgeWrapCall: Send + Sync {
    async fn wrap_call(
        &self,
        source_id: &str,
        state: &State,
        config: &RunnableConfig,
        next: &dyn EdgeAction,
    ) -> Result<Command>;
}

/// Where a hook applies
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HookScope {
    /// Every node (or every conditional edge)
    Global,
    /// One node id (or the conditional edge leaving it)
    Node(String),
}

impl HookScope {
    /// Scope a hook to a node id
    pub fn node(id: &str) -> Self {
        Self::Node(id.to_string())
    }

    fn applies_to(&self, id: &str) -> bool {
        match self {
            Self::Global => true,
            Self::Node(node) => node == id,
        }
    }

    fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }
}

/// Pick the hooks for `id`: global ones most-recent first, then node-scoped
/// ones most-recent first.
fn select<H: ?Sized>(entries: &[(HookScope, Arc<H>)], id: &str) -> Vec<Arc<H>> {
    let global = entries.iter().rev().filter(|(scope, _)| scope.is_global());
    let scoped =
        entries.iter().rev().filter(|(scope, _)| !scope.is_global() && scope.applies_to(id));
    global.chain(scoped).map(|(_, hook)| hook.clone()).collect()
}

/// Builder-side store of registered hooks, in registration order
#[derive(Clone, Default)]
pub struct HookRegistry {
    before: Vec<(HookScope, Arc<dyn BeforeCall>)>,
    after: Vec<(HookScope, Arc<dyn AfterCall>)>,
    wrap: Vec<(HookScope, Arc<dyn WrapCall>)>,
    edge_before: Vec<(HookScope, Arc<dyn EdgeBeforeCall>)>,
    edge_after: Vec<(HookScope, Arc<dyn EdgeAfterCall>)>,
    edge_wrap: Vec<(HookScope, Arc<dyn EdgeWrapCall>)>,
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before_call(&mut self, scope: HookScope, hook: Arc<dyn BeforeCall>) {
        self.before.push((scope, hook));
    }

    pub fn add_after_call(&mut self, scope: HookScope, hook: Arc<dyn AfterCall>) {
        self.after.push((scope, hook));
    }

    pub fn add_wrap_call(&mut self, scope: HookScope, hook: Arc<dyn WrapCall>) {
        self.wrap.push((scope, hook));
    }

    pub fn add_edge_before_call(&mut self, scope: HookScope, hook: Arc<dyn EdgeBeforeCall>) {
        self.edge_before.push((scope, hook));
    }

    pub fn add_edge_after_call(&mut self, scope: HookScope, hook: Arc<dyn EdgeAfterCall>) {
        self.edge_after.push((scope, hook));
    }

    pub fn add_edge_wrap_call(&mut self, scope: HookScope, hook: Arc<dyn EdgeWrapCall>) {
        self.edge_wrap.push((scope, hook));
    }

    /// Whether nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.wrap.is_empty()
            && self.edge_before.is_empty()
            && self.edge_after.is_empty()
            && self.edge_wrap.is_empty()
    }

    /// Node ids referenced by node-scoped registrations
    pub(crate) fn scoped_ids(&self) -> Vec<&str> {
        fn ids<H: ?Sized>(entries: &[(HookScope, Arc<H>)]) -> impl Iterator<Item = &str> {
            entries.iter().filter_map(|(scope, _)| match scope {
                HookScope::Node(id) => Some(id.as_str()),
                HookScope::Global => None,
            })
        }
        ids(&self.before)
            .chain(ids(&self.after))
            .chain(ids(&self.wrap))
            .chain(ids(&self.edge_before))
            .chain(ids(&self.edge_after))
            .chain(ids(&self.edge_wrap))
            .collect()
    }

    /// Freeze the chain for one node around its action
    pub(crate) fn node_hooks(&self, node_id: &str, action: Arc<dyn NodeAction>) -> NodeHooks {
        // `select` yields innermost first: global wraps, then node-scoped ones around them.
        let mut wrapped = action;
        for hook in select(&self.wrap, node_id) {
            wrapped = Arc::new(WrappedAction { node_id: node_id.to_string(), hook, inner: wrapped });
        }
        NodeHooks {
            before: select(&self.before, node_id),
            after: select(&self.after, node_id),
            action: wrapped,
        }
    }

    /// Freeze the chain for the conditional edge leaving `source_id`
    pub(crate) fn edge_hooks(&self, source_id: &str, action: Arc<dyn EdgeAction>) -> EdgeHooks {
        let mut wrapped = action;
        for hook in select(&self.edge_wrap, source_id) {
            wrapped =
                Arc::new(WrappedEdge { source_id: source_id.to_string(), hook, inner: wrapped });
        }
        EdgeHooks {
            before: select(&self.edge_before, source_id),
            after: select(&self.edge_after, source_id),
            action: wrapped,
        }
    }
}

struct WrappedAction {
    node_id: String,
    hook: Arc<dyn WrapCall>,
    inner: Arc<dyn NodeAction>,
}

#[async_trait]
impl NodeAction for WrappedAction {
    async fn call(&self, state: &State, config: &RunnableConfig) -> Result<StateUpdate> {
        self.hook.wrap_call(&self.node_id, state, config, self.inner.as_ref()).await
    }
}

struct WrappedEdge {
    source_id: String,
    hook: Arc<dyn EdgeWrapCall>,
    inner: Arc<dyn EdgeAction>,
}

#[async_trait]
impl EdgeAction for WrappedEdge {
    async fn route(&self, state: &State, config: &RunnableConfig) -> Result<Command> {
        self.hook.wrap_call(&self.source_id, state, config, self.inner.as_ref()).await
    }
}

/// Frozen hook chain of one node
#[derive(Clone)]
pub struct NodeHooks {
    before: Vec<Arc<dyn BeforeCall>>,
    after: Vec<Arc<dyn AfterCall>>,
    action: Arc<dyn NodeAction>,
}

impl NodeHooks {
    /// Run before hooks, the wrapped action and after hooks.
    ///
    /// Returns the step's partials in fold order: before-hook partials, the
    /// action's partials, then after-hook partials. Folding each into `state`
    /// in turn gives the post-step state.
    pub async fn run(
        &self,
        node_id: &str,
        state: &State,
        config: &RunnableConfig,
        schema: &StateSchema,
    ) -> Result<Vec<StateUpdate>> {
        let mut partials = Vec::new();
        let mut current = state.clone();
        for hook in &self.before {
            let update = hook.before_call(node_id, &current, config).await?;
            schema.apply_updates(&mut current, update.clone());
            partials.push(update);
        }

        let results = self.action.call_partials(&current, config).await?;
        let result = match results.as_slice() {
            [single] => single.clone(),
            _ => results.iter().cloned().fold(StateUpdate::new(), |mut acc, update| {
                schema.merge_partial(&mut acc, update);
                acc
            }),
        };
        partials.extend(results);

        for hook in &self.after {
            partials.push(hook.after_call(node_id, &current, config, &result).await?);
        }
        Ok(partials)
    }
}

/// Frozen hook chain of one conditional edge
#[derive(Clone)]
pub struct EdgeHooks {
    before: Vec<Arc<dyn EdgeBeforeCall>>,
    after: Vec<Arc<dyn EdgeAfterCall>>,
    action: Arc<dyn EdgeAction>,
}

impl EdgeHooks {
    /// Run before hooks, the wrapped router and after hooks.
    ///
    /// The returned routing carries the before-hook partials followed by the
    /// router's own update, in fold order.
    pub async fn run(
        &self,
        source_id: &str,
        state: &State,
        config: &RunnableConfig,
        schema: &StateSchema,
    ) -> Result<Routing> {
        let mut updates = Vec::new();
        let mut current = state.clone();
        for hook in &self.before {
            let update = hook.before_call(source_id, &current, config).await?;
            schema.apply_updates(&mut current, update.clone());
            updates.push(update);
        }

        let mut command = self.action.route(&current, config).await?;
        for hook in &self.after {
            command = hook.after_call(source_id, &current, config, command).await?;
        }

        updates.push(command.update);
        Ok(Routing { route: command.route, updates })
    }
}

/// Outcome of a hooked conditional edge
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routing {
    /// Route label chosen by the router
    pub route: String,
    /// State updates to fold in order before following the route
    pub updates: Vec<StateUpdate>,
}

/// Before hook from a closure
pub struct BeforeFn<F>(pub F);

#[async_trait]
impl<F> BeforeCall for BeforeFn<F>
where
    F: Fn(&str, &State) -> Result<StateUpdate> + Send + Sync,
{
    async fn before_call(
        &self,
        node_id: &str,
        state: &State,
        _config: &RunnableConfig,
    ) -> Result<StateUpdate> {
        (self.0)(node_id, state)
    }
}

/// After hook from a closure
pub struct AfterFn<F>(pub F);

#[async_trait]
impl<F> AfterCall for AfterFn<F>
where
    F: Fn(&str, &State, &StateUpdate) -> Result<StateUpdate> + Send + Sync,
{
    async fn after_call(
        &self,
        node_id: &str,
        state: &State,
        _config: &RunnableConfig,
        result: &StateUpdate,
    ) -> Result<StateUpdate> {
        (self.0)(node_id, state, result)
    }
}

/// Wraps every node and edge evaluation in a `tracing` span
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingHook;

#[async_trait]
impl WrapCall for TracingHook {
    async fn wrap_call(
        &self,
        node_id: &str,
        state: &State,
        config: &RunnableConfig,
        next: &dyn NodeAction,
    ) -> Result<StateUpdate> {
        let span = tracing::info_span!(
            "evaluate_node",
            node = node_id,
            thread_id = %config.thread_id,
            graph_path = %config.graph_path(),
        );
        let started = Instant::now();
        let result = next.call(state, config).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(update) => {
                tracing::debug!(parent: &span, keys = update.len(), elapsed_ms, "node completed")
            }
            Err(e) => tracing::debug!(parent: &span, error = %e, elapsed_ms, "node failed"),
        }
        result
    }
}

#[async_trait]
impl EdgeWrapCall for TracingHook {
    async fn wrap_call(
        &self,
        source_id: &str,
        state: &State,
        config: &RunnableConfig,
        next: &dyn EdgeAction,
    ) -> Result<Command> {
        let span = tracing::info_span!(
            "evaluate_edge",
            source = source_id,
            thread_id = %config.thread_id,
            graph_path = %config.graph_path(),
        );
        let result = next.route(state, config).instrument(span.clone()).await;
        if let Ok(command) = &result {
            tracing::debug!(parent: &span, route = %command.route, "edge routed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::RouterAction;
    use crate::error::GraphError;
    use crate::node::FunctionAction;
    use crate::state::partial;
    use serde_json::json;

    /// Appends its tag to `trace` on the way in and out
    struct Tag(&'static str);

    #[async_trait]
    impl WrapCall for Tag {
        async fn wrap_call(
            &self,
            _node_id: &str,
            state: &State,
            config: &RunnableConfig,
            next: &dyn NodeAction,
        ) -> Result<StateUpdate> {
            let mut result = next.call(state, config).await?;
            let mut trace =
                result.remove("trace").and_then(|v| v.as_array().cloned()).unwrap_or_default();
            trace.push(json!(self.0));
            result.insert("trace".to_string(), json!(trace));
            Ok(result)
        }
    }

    fn noop() -> Arc<dyn NodeAction> {
        Arc::new(FunctionAction::new(|_| async { Ok(StateUpdate::new()) }))
    }

    #[tokio::test]
    async fn test_wrap_order() {
        let mut registry = HookRegistry::new();
        registry.add_wrap_call(HookScope::node("a"), Arc::new(Tag("node-1")));
        registry.add_wrap_call(HookScope::Global, Arc::new(Tag("global-1")));
        registry.add_wrap_call(HookScope::node("a"), Arc::new(Tag("node-2")));
        registry.add_wrap_call(HookScope::Global, Arc::new(Tag("global-2")));
        registry.add_wrap_call(HookScope::node("b"), Arc::new(Tag("other")));

        let hooks = registry.node_hooks("a", noop());
        let updates = hooks
            .run("a", &State::new(), &RunnableConfig::default(), &StateSchema::new())
            .await
            .unwrap();

        // Results bubble out from the innermost wrap.
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].get("trace"),
            Some(&json!(["global-2", "global-1", "node-2", "node-1"]))
        );
    }

    #[tokio::test]
    async fn test_before_after_merge_order() {
        let schema = StateSchema::builder().list_channel("log").build();
        let mut registry = HookRegistry::new();
        registry.add_before_call(
            HookScope::node("a"),
            Arc::new(BeforeFn(|_: &str, _: &State| -> Result<StateUpdate> {
                Ok(partial(json!({"log": "node-before"})))
            })),
        );
        registry.add_before_call(
            HookScope::Global,
            Arc::new(BeforeFn(|_: &str, _: &State| -> Result<StateUpdate> {
                Ok(partial(json!({"log": "global-before"})))
            })),
        );
        registry.add_after_call(
            HookScope::Global,
            Arc::new(AfterFn(|_: &str, _: &State, result: &StateUpdate| -> Result<StateUpdate> {
                assert_eq!(result.get("log"), Some(&json!("action")));
                Ok(partial(json!({"log": "after"})))
            })),
        );

        let action: Arc<dyn NodeAction> = Arc::new(FunctionAction::new(|ctx| async move {
            // Before-hook partials are already visible
            assert_eq!(ctx.get("log"), Some(&json!(["global-before", "node-before"])));
            Ok(partial(json!({"log": "action"})))
        }));

        let hooks = registry.node_hooks("a", action);
        let updates =
            hooks.run("a", &State::new(), &RunnableConfig::default(), &schema).await.unwrap();
        assert_eq!(updates.len(), 4);

        let mut state = State::new();
        for update in updates {
            schema.apply_updates(&mut state, update);
        }
        assert_eq!(
            state.get("log"),
            Some(&json!(["global-before", "node-before", "action", "after"]))
        );
    }

    #[tokio::test]
    async fn test_action_error_surfaces_through_wraps() {
        let mut registry = HookRegistry::new();
        registry.add_wrap_call(HookScope::Global, Arc::new(Tag("global")));
        registry.add_wrap_call(HookScope::Global, Arc::new(TracingHook));
        let action: Arc<dyn NodeAction> =
            Arc::new(FunctionAction::new(|_| async { Err(GraphError::action("broken")) }));

        let hooks = registry.node_hooks("a", action);
        let err = hooks
            .run("a", &State::new(), &RunnableConfig::default(), &StateSchema::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "broken");
    }

    struct Redirect;

    #[async_trait]
    impl EdgeAfterCall for Redirect {
        async fn after_call(
            &self,
            _source_id: &str,
            _state: &State,
            _config: &RunnableConfig,
            command: Command,
        ) -> Result<Command> {
            Ok(Command::goto("review").with_update(command.update))
        }
    }

    struct Stamp;

    #[async_trait]
    impl EdgeBeforeCall for Stamp {
        async fn before_call(
            &self,
            source_id: &str,
            _state: &State,
            _config: &RunnableConfig,
        ) -> Result<StateUpdate> {
            Ok(partial(json!({"routed_from": source_id})))
        }
    }

    #[tokio::test]
    async fn test_edge_hooks() {
        let mut registry = HookRegistry::new();
        registry.add_edge_before_call(HookScope::Global, Arc::new(Stamp));
        registry.add_edge_after_call(HookScope::node("check"), Arc::new(Redirect));
        registry.add_edge_wrap_call(HookScope::Global, Arc::new(TracingHook));

        let router: Arc<dyn EdgeAction> = Arc::new(RouterAction::new(|_: &State| "publish".into()));
        let hooks = registry.edge_hooks("check", router);
        let routing = hooks
            .run("check", &State::new(), &RunnableConfig::default(), &StateSchema::new())
            .await
            .unwrap();

        assert_eq!(routing.route, "review");
        assert_eq!(routing.updates.len(), 2);
        assert_eq!(routing.updates[0].get("routed_from"), Some(&json!("check")));
        assert!(routing.updates[1].is_empty());
    }

    #[test]
    fn test_scoped_ids() {
        let mut registry = HookRegistry::new();
        assert!(registry.is_empty());
        registry.add_wrap_call(HookScope::Global, Arc::new(TracingHook));
        registry.add_edge_wrap_call(HookScope::node("x"), Arc::new(TracingHook));
        assert_eq!(registry.scoped_ids(), vec!["x"]);
    }
}
