//! Compile-time and run-time configuration

use crate::cancel::RunControl;
use crate::checkpoint::Checkpointer;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Thread id used when a run does not name one
pub const DEFAULT_THREAD_ID: &str = "$default";

/// Default bound on executed steps per run
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// What each [`NodeOutput`](crate::stream::NodeOutput) carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMode {
    /// Full state after each step
    #[default]
    Values,
    /// Only the partial result merged by each step
    Updates,
}

/// Stack of node ids traversed to reach the current (sub-)graph execution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphPath(Vec<String>);

impl GraphPath {
    /// The root path
    pub fn root() -> Self {
        Self::default()
    }

    /// A new path with `node_id` pushed on top
    pub fn child(&self, node_id: &str) -> Self {
        let mut elements = self.0.clone();
        elements.push(node_id.to_string());
        Self(elements)
    }

    /// The innermost element, `None` at the root
    pub fn last_element(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Nesting depth (0 at the root)
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root path
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path elements, outermost first
    pub fn elements(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for GraphPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() { write!(f, "/") } else { write!(f, "/{}", self.0.join("/")) }
    }
}

/// Configuration passed to a single run, and to every action in it
#[derive(Clone, Debug)]
pub struct RunnableConfig {
    /// Logical thread identifier for checkpointing
    pub thread_id: String,
    /// Resume from (or edit) a specific historical checkpoint
    pub checkpoint_id: Option<String>,
    /// Arbitrary metadata visible to actions and hooks
    pub metadata: HashMap<String, Value>,
    /// Executors bound to parallel fan-out nodes, keyed by the fan-out source node id
    pub executors: HashMap<String, tokio::runtime::Handle>,
    /// What stream outputs carry
    pub stream_mode: StreamMode,
    /// Node currently executing, set by the stepper
    pub(crate) node_id: Option<String>,
    /// Whether the current node is being re-entered after a suspension
    pub(crate) resumed: bool,
    pub(crate) graph_path: GraphPath,
    pub(crate) control: RunControl,
}

impl RunnableConfig {
    /// Create a new config with the given thread ID
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            checkpoint_id: None,
            metadata: HashMap::new(),
            executors: HashMap::new(),
            stream_mode: StreamMode::default(),
            node_id: None,
            resumed: false,
            graph_path: GraphPath::root(),
            control: RunControl::new(),
        }
    }

    /// Select a historical checkpoint
    pub fn with_checkpoint_id(mut self, checkpoint_id: &str) -> Self {
        self.checkpoint_id = Some(checkpoint_id.to_string());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Run the fan-out following `node_id` on `executor`
    pub fn with_parallel_executor(mut self, node_id: &str, executor: tokio::runtime::Handle) -> Self {
        self.executors.insert(node_id.to_string(), executor);
        self
    }

    /// Set the stream mode
    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    /// Get metadata
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Id of the node or edge source currently executing
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Whether the current node is being re-entered after a suspension
    pub fn is_resume(&self) -> bool {
        self.resumed
    }

    /// Path of nested graph executions leading here
    pub fn graph_path(&self) -> &GraphPath {
        &self.graph_path
    }

    /// Cancellation state of the run this config belongs to
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Executor bound to the fan-out following `node_id`
    pub fn executor_for(&self, node_id: &str) -> Option<&tokio::runtime::Handle> {
        self.executors.get(node_id)
    }

    pub(crate) fn for_node(&self, node_id: &str, resumed: bool) -> Self {
        let mut config = self.clone();
        config.node_id = Some(node_id.to_string());
        config.resumed = resumed;
        config
    }
}

impl Default for RunnableConfig {
    fn default() -> Self {
        Self::new(DEFAULT_THREAD_ID)
    }
}

/// Options bound into a graph at compile time
#[derive(Clone)]
pub struct CompileConfig {
    /// Checkpoint store; without one runs are not durable
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    /// Suspend before these nodes run
    pub interrupt_before: HashSet<String>,
    /// Suspend after these nodes run
    pub interrupt_after: HashSet<String>,
    /// With `interrupt_after`, suspend before the outgoing edge is evaluated
    pub interrupt_before_edge: bool,
    /// Release the thread's history when a run completes
    pub release_thread: bool,
    /// Bound on executed steps per run
    pub recursion_limit: usize,
}

impl CompileConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self {
            checkpointer: None,
            interrupt_before: HashSet::new(),
            interrupt_after: HashSet::new(),
            interrupt_before_edge: false,
            release_thread: false,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    /// Configure checkpointing
    pub fn with_checkpointer<C: Checkpointer + 'static>(mut self, checkpointer: C) -> Self {
        self.checkpointer = Some(Arc::new(checkpointer));
        self
    }

    /// Configure checkpointing with a shared store
    pub fn with_checkpointer_arc(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Configure interrupt before specific nodes
    pub fn with_interrupt_before(mut self, nodes: &[&str]) -> Self {
        self.interrupt_before.extend(nodes.iter().map(|s| s.to_string()));
        self
    }

    /// Configure interrupt after specific nodes
    pub fn with_interrupt_after(mut self, nodes: &[&str]) -> Self {
        self.interrupt_after.extend(nodes.iter().map(|s| s.to_string()));
        self
    }

    /// Defer edge evaluation of `interrupt_after` nodes until resume
    pub fn with_interrupt_before_edge(mut self, enabled: bool) -> Self {
        self.interrupt_before_edge = enabled;
        self
    }

    /// Release thread history on completion
    pub fn with_release_thread(mut self, enabled: bool) -> Self {
        self.release_thread = enabled;
        self
    }

    /// Set recursion limit for cycles
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileConfig")
            .field("checkpointer", &self.checkpointer.is_some())
            .field("interrupt_before", &self.interrupt_before)
            .field("interrupt_after", &self.interrupt_after)
            .field("interrupt_before_edge", &self.interrupt_before_edge)
            .field("release_thread", &self.release_thread)
            .field("recursion_limit", &self.recursion_limit)
            .finish()
    }
}
