//! StateGraph builder for constructing graphs
//!
//! [`StateGraph`] accumulates nodes, edges and hooks. [`StateGraph::compile_with`]
//! validates the structure, freezes hook chains, turns static fan-outs into
//! parallel nodes and produces an immutable [`CompiledGraph`] that can run any
//! number of times.

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::config::{CompileConfig, RunnableConfig};
use crate::edge::{END, Edge, EdgeAction, EdgeTarget, RouterAction, START};
use crate::error::{GraphError, Result};
use crate::executor::Stepper;
use crate::hook::{
    AfterCall, BeforeCall, EdgeAfterCall, EdgeBeforeCall, EdgeHooks, EdgeWrapCall, HookRegistry,
    HookScope, NodeHooks, WrapCall,
};
use crate::input::GraphInput;
use crate::interrupt::InterruptFn;
use crate::node::{FunctionAction, NodeAction, NodeContext, NodeSpec, SubgraphAction};
use crate::parallel::{PARALLEL_PREFIX, ParallelAction, parallel_node_id};
use crate::state::{State, StateSchema, StateUpdate};
use crate::stream::{GraphStream, RunOutcome, RunResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Builder for constructing graphs
pub struct StateGraph {
    schema: StateSchema,
    nodes: Vec<NodeSpec>,
    edges: Vec<Edge>,
    edge_interrupts: Vec<(String, InterruptFn)>,
    hooks: HookRegistry,
}

impl StateGraph {
    /// Create a new graph with the given state schema
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            nodes: vec![],
            edges: vec![],
            edge_interrupts: vec![],
            hooks: HookRegistry::new(),
        }
    }

    /// Create with a simple schema (just channel names, all overwrite)
    pub fn with_channels(channels: &[&str]) -> Self {
        Self::new(StateSchema::simple(channels))
    }

    /// Add a node to the graph
    pub fn add_node<A: NodeAction + 'static>(self, id: &str, action: A) -> Self {
        self.add_node_arc(id, Arc::new(action))
    }

    /// Add a node sharing an existing action
    pub fn add_node_arc(mut self, id: &str, action: Arc<dyn NodeAction>) -> Self {
        self.nodes.push(NodeSpec::new(id, action));
        self
    }

    /// Add an async function as a node
    pub fn add_node_fn<F, Fut>(self, id: &str, func: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StateUpdate>> + Send + 'static,
    {
        self.add_node(id, FunctionAction::new(func))
    }

    /// Add a node that may pause before it runs
    pub fn add_interruptible_node<A: NodeAction + 'static>(
        mut self,
        id: &str,
        action: A,
        interrupt: InterruptFn,
    ) -> Self {
        self.nodes.push(NodeSpec::new(id, Arc::new(action)).with_interrupt(interrupt));
        self
    }

    /// Add a compiled graph as a node
    pub fn add_subgraph(self, id: &str, graph: CompiledGraph) -> Self {
        let action = SubgraphAction::new(graph, self.schema.clone());
        self.add_node(id, action)
    }

    /// Add a direct edge from source to target
    pub fn add_edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge::Direct { source: source.to_string(), target: EdgeTarget::from(target) });
        self
    }

    /// Add a conditional edge with a router function
    pub fn add_conditional_edges<'a, F, I>(self, source: &str, router: F, targets: I) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.add_conditional_edges_action(source, RouterAction::new(router), targets)
    }

    /// Add a conditional edge with an async routing action
    pub fn add_conditional_edges_action<'a, E, I>(
        mut self,
        source: &str,
        action: E,
        targets: I,
    ) -> Self
    where
        E: EdgeAction + 'static,
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let targets: HashMap<String, EdgeTarget> =
            targets.into_iter().map(|(k, v)| (k.to_string(), EdgeTarget::from(v))).collect();

        self.edges.push(Edge::Conditional {
            source: source.to_string(),
            action: Arc::new(action),
            targets,
        });
        self
    }

    /// Pause before the edge leaving `source` is evaluated, when `interrupt` says so
    pub fn add_interruptible_edge(mut self, source: &str, interrupt: InterruptFn) -> Self {
        self.edge_interrupts.push((source.to_string(), interrupt));
        self
    }

    pub fn with_before_call<H: BeforeCall + 'static>(mut self, scope: HookScope, hook: H) -> Self {
        self.hooks.add_before_call(scope, Arc::new(hook));
        self
    }

    pub fn with_after_call<H: AfterCall + 'static>(mut self, scope: HookScope, hook: H) -> Self {
        self.hooks.add_after_call(scope, Arc::new(hook));
        self
    }

    pub fn with_wrap_call<H: WrapCall + 'static>(mut self, scope: HookScope, hook: H) -> Self {
        self.hooks.add_wrap_call(scope, Arc::new(hook));
        self
    }

    pub fn with_edge_before_call<H: EdgeBeforeCall + 'static>(
        mut self,
        scope: HookScope,
        hook: H,
    ) -> Self {
        self.hooks.add_edge_before_call(scope, Arc::new(hook));
        self
    }

    pub fn with_edge_after_call<H: EdgeAfterCall + 'static>(
        mut self,
        scope: HookScope,
        hook: H,
    ) -> Self {
        self.hooks.add_edge_after_call(scope, Arc::new(hook));
        self
    }

    pub fn with_edge_wrap_call<H: EdgeWrapCall + 'static>(
        mut self,
        scope: HookScope,
        hook: H,
    ) -> Self {
        self.hooks.add_edge_wrap_call(scope, Arc::new(hook));
        self
    }

    /// Compile the graph with default options
    pub fn compile(self) -> Result<CompiledGraph> {
        self.compile_with(CompileConfig::default())
    }

    /// Validate the graph and freeze it into an executable plan
    pub fn compile_with(self, config: CompileConfig) -> Result<CompiledGraph> {
        let node_ids = self.validate_nodes()?;
        let by_source = self.validate_edges(&node_ids)?;
        let fan_outs = self.validate_fan_outs(&by_source, &config)?;
        self.validate_references(&node_ids, &by_source, &config)?;

        let schema = Arc::new(self.schema);
        let mut nodes: HashMap<String, CompiledNode> = HashMap::new();
        for spec in self.nodes {
            let hooks = self.hooks.node_hooks(&spec.id, spec.action.clone());
            nodes.insert(spec.id.clone(), CompiledNode { spec, hooks });
        }

        let mut edge_interrupts: HashMap<String, InterruptFn> =
            self.edge_interrupts.into_iter().collect();
        let mut edges: HashMap<String, CompiledEdge> = HashMap::new();
        for (source, mut outgoing) in by_source {
            if let Some(join) = fan_outs.get(&source) {
                let id = parallel_node_id(&source);
                let branches = outgoing
                    .iter()
                    .filter_map(|edge| match edge {
                        Edge::Direct { target: EdgeTarget::Node(branch), .. } => nodes
                            .get(branch)
                            .map(|node| (branch.clone(), node.hooks.clone())),
                        _ => None,
                    })
                    .collect();
                let action: Arc<dyn NodeAction> =
                    Arc::new(ParallelAction::new(&source, branches, schema.clone()));
                let mut spec = NodeSpec::new(&id, action.clone());
                spec.parallel = true;
                let hooks = HookRegistry::new().node_hooks(&id, action);
                nodes.insert(id.clone(), CompiledNode { spec, hooks });

                let to_parallel = CompiledEdge::direct(&source, EdgeTarget::Node(id.clone()));
                edges.insert(source.clone(), to_parallel);
                edges.insert(id.clone(), CompiledEdge::direct(&id, join.clone()));
                continue;
            }

            let Some(edge) = outgoing.pop() else { continue };
            let hooks = match &edge {
                Edge::Conditional { action, .. } => {
                    Some(self.hooks.edge_hooks(&source, action.clone()))
                }
                Edge::Direct { .. } => None,
            };
            let interrupt = edge_interrupts.remove(&source);
            edges.insert(source, CompiledEdge { edge, hooks, interrupt });
        }

        tracing::debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            parallel = fan_outs.len(),
            "graph compiled"
        );

        Ok(CompiledGraph { plan: Arc::new(ExecutionPlan { schema, nodes, edges, config }) })
    }

    fn validate_nodes(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for spec in &self.nodes {
            if spec.id.is_empty() {
                return Err(GraphError::InvalidGraph("node id must not be empty".to_string()));
            }
            if spec.id == START || spec.id == END || spec.id.starts_with(PARALLEL_PREFIX) {
                return Err(GraphError::InvalidGraph(format!("node id '{}' is reserved", spec.id)));
            }
            if !ids.insert(spec.id.clone()) {
                return Err(GraphError::DuplicateNode(spec.id.clone()));
            }
        }
        Ok(ids)
    }

    /// Check edge endpoints and group edges by source, in declaration order
    fn validate_edges(&self, node_ids: &HashSet<String>) -> Result<Vec<(String, Vec<Edge>)>> {
        let mut by_source: Vec<(String, Vec<Edge>)> = Vec::new();
        for edge in &self.edges {
            let source = edge.source();
            if source == END {
                return Err(GraphError::InvalidGraph("END cannot have outgoing edges".to_string()));
            }
            if source != START && !node_ids.contains(source) {
                return Err(GraphError::NodeNotFound(source.to_string()));
            }
            for target in edge.possible_targets() {
                if let EdgeTarget::Node(name) = target {
                    if !node_ids.contains(name) {
                        return Err(GraphError::EdgeTargetNotFound(name.clone()));
                    }
                }
            }

            match by_source.iter_mut().find(|(s, _)| s == source) {
                Some((_, edges)) => edges.push(edge.clone()),
                None => by_source.push((source.to_string(), vec![edge.clone()])),
            }
        }

        if !by_source.iter().any(|(source, _)| source == START) {
            return Err(GraphError::NoEntryPoint);
        }

        for (source, edges) in &by_source {
            let conditional = edges.iter().filter(|e| e.is_conditional()).count();
            if conditional > 1 {
                return Err(GraphError::InvalidGraph(format!(
                    "node '{source}' has more than one conditional edge"
                )));
            }
            if conditional == 1 && edges.len() > 1 {
                return Err(GraphError::InvalidGraph(format!(
                    "node '{source}' mixes conditional and static edges"
                )));
            }
            if conditional == 1 {
                continue;
            }
            let mut seen = HashSet::new();
            for target in edges.iter().flat_map(|e| e.possible_targets()) {
                if !seen.insert(target.id()) {
                    return Err(GraphError::InvalidGraph(format!(
                        "duplicate edge '{source}' -> '{}'",
                        target.id()
                    )));
                }
            }
        }
        Ok(by_source)
    }

    /// Resolve static fan-outs: source -> common join target
    fn validate_fan_outs(
        &self,
        by_source: &[(String, Vec<Edge>)],
        config: &CompileConfig,
    ) -> Result<HashMap<String, EdgeTarget>> {
        let outgoing = |id: &str| by_source.iter().find(|(s, _)| s == id).map(|(_, e)| e);
        let mut fan_outs = HashMap::new();

        for (source, edges) in by_source {
            if edges.len() < 2 {
                continue;
            }
            let mut join: Option<EdgeTarget> = None;
            for edge in edges {
                let branch = match edge {
                    Edge::Direct { target: EdgeTarget::Node(branch), .. } => branch,
                    _ => {
                        return Err(GraphError::InvalidGraph(format!(
                            "parallel branches of '{source}' must be nodes"
                        )));
                    }
                };
                let branch_edges = outgoing(branch).map(Vec::as_slice).unwrap_or_default();
                let target = match branch_edges {
                    [Edge::Direct { target, .. }] => target,
                    _ => {
                        return Err(GraphError::InvalidGraph(format!(
                            "parallel branch '{branch}' must have exactly one static edge"
                        )));
                    }
                };
                match &join {
                    None => join = Some(target.clone()),
                    Some(existing) if existing == target => {}
                    Some(_) => {
                        return Err(GraphError::InvalidGraph(format!(
                            "parallel branches of '{source}' must join on one node"
                        )));
                    }
                }

                let interruptible = config.interrupt_before.contains(branch)
                    || config.interrupt_after.contains(branch)
                    || self.edge_interrupts.iter().any(|(s, _)| s == branch)
                    || self.nodes.iter().any(|n| &n.id == branch && n.is_interruptible());
                if interruptible {
                    return Err(GraphError::InvalidGraph(format!(
                        "parallel branch '{branch}' cannot be interrupted"
                    )));
                }
            }
            if let Some(join) = join {
                fan_outs.insert(source.clone(), join);
            }
        }
        Ok(fan_outs)
    }

    fn validate_references(
        &self,
        node_ids: &HashSet<String>,
        by_source: &[(String, Vec<Edge>)],
        config: &CompileConfig,
    ) -> Result<()> {
        let referenced = config
            .interrupt_before
            .iter()
            .chain(config.interrupt_after.iter())
            .map(String::as_str)
            .chain(self.edge_interrupts.iter().map(|(s, _)| s.as_str()))
            .chain(self.hooks.scoped_ids());
        for id in referenced {
            if !node_ids.contains(id) {
                return Err(GraphError::NodeNotFound(id.to_string()));
            }
        }

        for spec in &self.nodes {
            if !by_source.iter().any(|(source, _)| source == &spec.id) {
                return Err(GraphError::InvalidGraph(format!(
                    "node '{}' has no outgoing edge",
                    spec.id
                )));
            }
        }
        Ok(())
    }
}

/// A node frozen into the plan together with its hook chain
pub(crate) struct CompiledNode {
    pub(crate) spec: NodeSpec,
    pub(crate) hooks: NodeHooks,
}

/// The edge leaving one node, with its frozen hooks and pause predicate
pub(crate) struct CompiledEdge {
    pub(crate) edge: Edge,
    pub(crate) hooks: Option<EdgeHooks>,
    pub(crate) interrupt: Option<InterruptFn>,
}

impl CompiledEdge {
    fn direct(source: &str, target: EdgeTarget) -> Self {
        Self {
            edge: Edge::Direct { source: source.to_string(), target },
            hooks: None,
            interrupt: None,
        }
    }
}

/// Immutable plan shared by every run of a compiled graph
pub(crate) struct ExecutionPlan {
    pub(crate) schema: Arc<StateSchema>,
    pub(crate) nodes: HashMap<String, CompiledNode>,
    pub(crate) edges: HashMap<String, CompiledEdge>,
    pub(crate) config: CompileConfig,
}

impl ExecutionPlan {
    pub(crate) fn node(&self, id: &str) -> Result<&CompiledNode> {
        self.nodes.get(id).ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    pub(crate) fn edge(&self, source: &str) -> Result<&CompiledEdge> {
        self.edges
            .get(source)
            .ok_or_else(|| GraphError::InvalidGraph(format!("no edge leaves '{source}'")))
    }

    pub(crate) fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.config.checkpointer.as_ref()
    }
}

/// A checkpoint as seen by callers inspecting a thread
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    /// Checkpoint id
    pub checkpoint_id: String,
    /// Last node executed
    pub node_id: String,
    /// Node pending next; `None` while the outgoing edge is unresolved
    pub next_node: Option<String>,
    /// State at this checkpoint
    pub state: State,
    /// Checkpoint this one was derived from
    pub parent_id: Option<String>,
    /// Save time
    pub saved_at: DateTime<Utc>,
}

impl From<Checkpoint> for StateSnapshot {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.id,
            node_id: checkpoint.node_id,
            next_node: checkpoint.next_node_id,
            state: checkpoint.state,
            parent_id: checkpoint.parent_id,
            saved_at: checkpoint.saved_at,
        }
    }
}

/// A compiled graph ready for execution.
///
/// Cheap to clone; every clone shares the same immutable plan.
#[derive(Clone)]
pub struct CompiledGraph {
    plan: Arc<ExecutionPlan>,
}

impl CompiledGraph {
    /// Start a run and return its output stream.
    ///
    /// Nothing executes until the stream is polled.
    pub fn stream(&self, input: GraphInput, config: RunnableConfig) -> GraphStream {
        let mut config = config;
        if config.graph_path().is_root() {
            config.control = crate::cancel::RunControl::new();
        }
        let control = config.control.clone();
        let outcome = Arc::new(Mutex::new(RunOutcome::default()));
        let stepper = Stepper::new(self.plan.clone(), config, outcome.clone());
        GraphStream::new(Box::pin(stepper.run(input)), control, outcome)
    }

    /// Run to completion or suspension
    pub async fn invoke(&self, input: GraphInput, config: RunnableConfig) -> Result<RunResult> {
        self.stream(input, config).for_each_async(|_| {}).await
    }

    /// The checkpoint selected by `config` (or the thread's latest) as a snapshot
    pub async fn get_state(&self, config: &RunnableConfig) -> Result<Option<StateSnapshot>> {
        let store = self.require_checkpointer()?;
        let checkpoint = match &config.checkpoint_id {
            Some(id) => store.get(id).await?,
            None => store.latest(&config.thread_id).await?,
        };
        Ok(checkpoint.map(StateSnapshot::from))
    }

    /// Every checkpoint of the thread, newest first
    pub async fn get_state_history(&self, config: &RunnableConfig) -> Result<Vec<StateSnapshot>> {
        let store = self.require_checkpointer()?;
        let history = store.history(&config.thread_id).await?;
        Ok(history.into_iter().map(StateSnapshot::from).collect())
    }

    /// Fork the selected checkpoint (or the thread's latest) with edited values.
    ///
    /// The fork is appended as a new checkpoint whose `parent_id` points at
    /// the original; nothing is removed. With `as_node`, the fork records that
    /// node as last executed and leaves its outgoing edge to be evaluated on
    /// resume. Returns a config selecting the fork.
    pub async fn update_state(
        &self,
        config: &RunnableConfig,
        values: StateUpdate,
        as_node: Option<&str>,
    ) -> Result<RunnableConfig> {
        let store = self.require_checkpointer()?;
        let base = match &config.checkpoint_id {
            Some(id) => {
                store.get(id).await?.ok_or_else(|| GraphError::CheckpointNotFound(id.clone()))?
            }
            None => store
                .latest(&config.thread_id)
                .await?
                .ok_or_else(|| GraphError::NothingToResume(config.thread_id.clone()))?,
        };

        let mut fork = base.fork();
        fork.thread_id = config.thread_id.clone();
        self.plan.schema.apply_updates(&mut fork.state, values);
        if let Some(node) = as_node {
            if node != START && !self.plan.nodes.contains_key(node) {
                return Err(GraphError::NodeNotFound(node.to_string()));
            }
            fork.node_id = node.to_string();
            fork.next_node_id = None;
            fork.metadata.remove(crate::executor::INTERRUPT_KEY);
        }

        let id = store.append(&fork).await?;
        tracing::info!(
            thread_id = %config.thread_id,
            checkpoint_id = %id,
            parent_id = %base.id,
            "checkpoint forked"
        );
        Ok(config.clone().with_checkpoint_id(&id))
    }

    /// Get the state schema
    pub fn schema(&self) -> &StateSchema {
        &self.plan.schema
    }

    /// Get the checkpointer if configured
    pub fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.plan.checkpointer()
    }

    /// Ids of the compiled nodes, synthesized parallel nodes included
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plan.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// The edge leaving `source`
    pub fn edge(&self, source: &str) -> Option<&Edge> {
        self.plan.edges.get(source).map(|e| &e.edge)
    }

    fn require_checkpointer(&self) -> Result<&Arc<dyn Checkpointer>> {
        self.checkpointer().ok_or_else(|| {
            GraphError::CheckpointError("graph was compiled without a checkpointer".to_string())
        })
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.node_ids())
            .field("config", &self.plan.config)
            .finish()
    }
}
