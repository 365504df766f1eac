//! Error types for stepgraph

use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Boxed business error raised by a node or edge action
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    /// The same node id was declared twice
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Edge target not found
    #[error("Edge target not found: {0}")]
    EdgeTargetNotFound(String),

    /// No entry point defined
    #[error("No entry point defined (missing edge from START)")]
    NoEntryPoint,

    /// Router returned a label with no declared mapping
    #[error("Router for '{source_node}' returned unknown target: {route}")]
    UnknownRouteTarget { source_node: String, route: String },

    /// Recursion limit exceeded
    #[error("Recursion limit exceeded: {0} steps")]
    RecursionLimitExceeded(usize),

    /// Node or edge execution failed; the original cause is kept in the chain
    #[error("Node '{node}' execution failed")]
    NodeExecutionFailed {
        node: String,
        #[source]
        source: Box<GraphError>,
    },

    /// Business error raised by a user action
    #[error("{0}")]
    Action(#[source] BoxError),

    /// A nested graph paused; suspension does not cross graph boundaries
    #[error("Subgraph node '{node}' suspended at '{at}'")]
    SubgraphInterrupted { node: String, at: String },

    /// Run was cancelled by its consumer
    #[error("Execution cancelled")]
    Cancelled,

    /// Resume requested but the thread has no checkpoint to continue from
    #[error("Nothing to resume for thread '{0}'")]
    NothingToResume(String),

    /// Referenced checkpoint does not exist
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// State serialization error
    #[error("State serialization error: {0}")]
    SerializationError(String),

    /// A spawned task panicked or could not be joined
    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Database error (when sqlite feature enabled)
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

impl GraphError {
    /// Wrap a business error raised by an action
    pub fn action(err: impl Into<BoxError>) -> Self {
        Self::Action(err.into())
    }

    /// Attach the failing node id, keeping `self` as the source
    pub fn in_node(self, node: &str) -> Self {
        match self {
            // Cancellation is not a node failure
            Self::Cancelled => Self::Cancelled,
            other => Self::NodeExecutionFailed { node: node.to_string(), source: Box::new(other) },
        }
    }

    /// The innermost error of the `source()` chain
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    /// Whether a consumer-requested cancellation appears anywhere in the chain
    pub fn is_cancellation(&self) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            let graph_err = err
                .downcast_ref::<GraphError>()
                .or_else(|| err.downcast_ref::<Box<GraphError>>().map(|b| b.as_ref()));
            if matches!(graph_err, Some(GraphError::Cancelled)) {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// Structural errors detected while compiling a graph
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidGraph(_)
                | Self::DuplicateNode(_)
                | Self::NodeNotFound(_)
                | Self::EdgeTargetNotFound(_)
                | Self::NoEntryPoint
        )
    }
}

impl From<tokio::task::JoinError> for GraphError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() { Self::Cancelled } else { Self::TaskJoin(err.to_string()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("quota exhausted")]
    struct QuotaError;

    #[test]
    fn test_root_cause_walks_chain() {
        let err = GraphError::action(QuotaError).in_node("billing");
        assert!(matches!(err, GraphError::NodeExecutionFailed { ref node, .. } if node == "billing"));
        assert!(err.root_cause().downcast_ref::<QuotaError>().is_some());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_cancellation_is_not_wrapped() {
        let err = GraphError::Cancelled.in_node("any");
        assert!(matches!(err, GraphError::Cancelled));
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_string_action_error() {
        let err = GraphError::action("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
