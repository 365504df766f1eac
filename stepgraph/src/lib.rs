//! # stepgraph
//!
//! Resumable, graph-based workflow execution.
//!
//! ## Overview
//!
//! `stepgraph` runs workflows described as directed graphs of async nodes over
//! a shared JSON state. Each channel of the state carries a reducer that merges
//! node updates. A compiled graph is driven one step at a time by a lazy,
//! cancellable stream, and every step can be checkpointed so that a thread can
//! pause for a human, be edited, forked and resumed.
//!
//! ## Features
//!
//! - **Channels and reducers**: replace, append, sum or custom merge per channel
//! - **Compile-time validation**: entry point, dangling edges, fan-out shape
//! - **Conditional routing**: route labels mapped onto target nodes
//! - **Parallel fan-out**: branches run on a bound executor, merged in order
//! - **Hooks**: before/after/wrap around nodes and conditional edges
//! - **Human-in-the-loop**: interrupt before or after nodes, or at an edge
//! - **Checkpointing**: in-memory or SQLite stores, fork-on-edit history
//! - **Cancellation**: abandon or abort the in-flight step
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepgraph::prelude::*;
//!
//! let graph = StateGraph::with_channels(&["input", "result"])
//!     .add_node_fn("fetch", |ctx| async move {
//!         Ok(partial(json!({"result": ctx.get("input").cloned()})))
//!     })
//!     .add_node_fn("review", |_ctx| async move { Ok(StateUpdate::new()) })
//!     .add_edge(START, "fetch")
//!     .add_edge("fetch", "review")
//!     .add_edge("review", END)
//!     .compile_with(
//!         CompileConfig::new()
//!             .with_checkpointer(MemoryCheckpointer::new())
//!             .with_interrupt_before(&["review"]),
//!     )?;
//!
//! let config = RunnableConfig::new("thread-1");
//! let paused = graph.invoke(GraphInput::args(partial(json!({"input": 1}))), config.clone()).await?;
//! assert!(paused.is_interrupted());
//!
//! let done = graph.invoke(GraphInput::resume(), config).await?;
//! ```
//!
//! ## Routing
//!
//! ```rust,ignore
//! use stepgraph::prelude::*;
//!
//! let graph = StateGraph::with_channels(&["messages", "tool_calls"])
//!     .add_node_fn("llm", call_model)
//!     .add_node_fn("tools", execute_tools)
//!     .add_edge(START, "llm")
//!     .add_conditional_edges(
//!         "llm",
//!         Router::by_field("action"),
//!         [("tools", "tools"), (END, END)],
//!     )
//!     .add_edge("tools", "llm")
//!     .compile()?;
//! ```

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod edge;
pub mod error;
mod executor;
pub mod graph;
pub mod hook;
pub mod input;
pub mod interrupt;
pub mod node;
pub mod parallel;
pub mod serializer;
pub mod state;
pub mod stream;

// Re-exports
pub use cancel::RunControl;
pub use checkpoint::{Checkpoint, Checkpointer, MemoryCheckpointer, ReleasedThread};
pub use config::{
    CompileConfig, DEFAULT_RECURSION_LIMIT, DEFAULT_THREAD_ID, GraphPath, RunnableConfig,
    StreamMode,
};
pub use edge::{
    Command, END, Edge, EdgeAction, EdgeTarget, FunctionEdge, Router, RouterAction, START,
};
pub use error::{BoxError, GraphError, Result};
pub use graph::{CompiledGraph, StateGraph, StateSnapshot};
pub use hook::{
    AfterCall, AfterFn, BeforeCall, BeforeFn, EdgeAfterCall, EdgeBeforeCall, EdgeHooks,
    EdgeWrapCall, HookRegistry, HookScope, NodeHooks, Routing, TracingHook, WrapCall,
};
pub use input::GraphInput;
pub use interrupt::{InterruptFn, InterruptionMetadata, always, interrupt_when};
pub use node::{FunctionAction, NodeAction, NodeContext, PassthroughAction, SubgraphAction};
pub use parallel::{PARALLEL_PREFIX, ParallelAction, parallel_node_id};
pub use serializer::{JsonStateSerializer, StateSerializer};
pub use state::{Channel, Reducer, State, StateSchema, StateSchemaBuilder, StateUpdate, partial};
pub use stream::{BlockingIter, CancelHandle, GraphStream, NodeOutput, RunResult, RunStatus};

#[cfg(feature = "sqlite")]
pub use checkpoint::SqliteCheckpointer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{Checkpointer, MemoryCheckpointer};
    pub use crate::config::{CompileConfig, RunnableConfig, StreamMode};
    pub use crate::edge::{Command, END, EdgeTarget, Router, START};
    pub use crate::error::{GraphError, Result};
    pub use crate::graph::{CompiledGraph, StateGraph, StateSnapshot};
    pub use crate::hook::{HookScope, TracingHook};
    pub use crate::input::GraphInput;
    pub use crate::interrupt::{InterruptionMetadata, interrupt_when};
    pub use crate::node::{FunctionAction, NodeAction, NodeContext};
    pub use crate::state::{Channel, Reducer, State, StateSchema, StateUpdate, partial};
    pub use crate::stream::{GraphStream, NodeOutput, RunResult, RunStatus};

    #[cfg(feature = "sqlite")]
    pub use crate::checkpoint::SqliteCheckpointer;

    // Re-export commonly used serde_json
    pub use serde_json::{Value, json};
}
