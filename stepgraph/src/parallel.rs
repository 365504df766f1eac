//! Parallel fan-out / fan-in
//!
//! When one node has several static outgoing edges, the compiler replaces the
//! fan-out with a synthesized parallel node that runs every branch and merges
//! their partials before continuing at the common join node.

use crate::config::RunnableConfig;
use crate::error::{GraphError, Result};
use crate::hook::NodeHooks;
use crate::node::NodeAction;
use crate::state::{State, StateSchema, StateUpdate};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;

/// Prefix of synthesized parallel node ids
pub const PARALLEL_PREFIX: &str = "__parallel__";

/// Id of the parallel node that follows `source_id`
pub fn parallel_node_id(source_id: &str) -> String {
    format!("{PARALLEL_PREFIX}({source_id})")
}

/// Runs several branch actions as one node.
///
/// Branches run as tasks on the executor bound to the fan-out source in
/// [`RunnableConfig::executors`], or one after another when none is bound.
/// Results are folded in branch declaration order whatever the completion
/// order. The first failure fails the node; siblings still running are
/// detached and their results discarded.
pub struct ParallelAction {
    source_id: String,
    branches: Vec<(String, NodeHooks)>,
    schema: Arc<StateSchema>,
}

impl ParallelAction {
    pub(crate) fn new(
        source_id: &str,
        branches: Vec<(String, NodeHooks)>,
        schema: Arc<StateSchema>,
    ) -> Self {
        Self { source_id: source_id.to_string(), branches, schema }
    }

    /// Branch node ids, in declaration order
    pub fn branch_ids(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|(id, _)| id.as_str())
    }

    async fn run_sequential(
        &self,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<Vec<Vec<StateUpdate>>> {
        let mut results = Vec::with_capacity(self.branches.len());
        for (id, hooks) in &self.branches {
            if config.control().is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let branch_config = config.for_node(id, false);
            let updates =
                hooks.run(id, state, &branch_config, &self.schema).await.map_err(|e| e.in_node(id))?;
            results.push(updates);
        }
        Ok(results)
    }

    async fn run_on(
        &self,
        executor: &tokio::runtime::Handle,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<Vec<Vec<StateUpdate>>> {
        let control = config.control();
        let mut pending = FuturesUnordered::new();
        for (index, (id, hooks)) in self.branches.iter().enumerate() {
            if control.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let hooks = hooks.clone();
            let schema = self.schema.clone();
            let state = state.clone();
            let branch_config = config.for_node(id, false);
            let branch_id = id.clone();
            let task = executor
                .spawn(async move { hooks.run(&branch_id, &state, &branch_config, &schema).await });
            control.track(task.abort_handle());
            pending.push(async move { (index, task.await) });
        }

        let mut slots: Vec<Option<Vec<StateUpdate>>> = vec![None; self.branches.len()];
        loop {
            tokio::select! {
                biased;
                _ = control.cancelled() => return Err(GraphError::Cancelled),
                next = pending.next() => {
                    let Some((index, joined)) = next else { break };
                    let id = &self.branches[index].0;
                    let updates = joined
                        .map_err(GraphError::from)
                        .and_then(|result| result)
                        .map_err(|e| e.in_node(id))?;
                    tracing::trace!(node = %id, "parallel branch completed");
                    slots[index] = Some(updates);
                }
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

#[async_trait]
impl NodeAction for ParallelAction {
    async fn call(&self, state: &State, config: &RunnableConfig) -> Result<StateUpdate> {
        let mut merged = StateUpdate::new();
        for update in self.call_partials(state, config).await? {
            self.schema.merge_partial(&mut merged, update);
        }
        Ok(merged)
    }

    /// Every branch's partials, branch by branch in declaration order
    async fn call_partials(
        &self,
        state: &State,
        config: &RunnableConfig,
    ) -> Result<Vec<StateUpdate>> {
        let results = match config.executor_for(&self.source_id) {
            Some(executor) => self.run_on(executor, state, config).await?,
            None => self.run_sequential(state, config).await?,
        };
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookRegistry;
    use crate::node::FunctionAction;
    use crate::state::partial;
    use serde_json::json;
    use std::time::Duration;

    fn branch(id: &str, delay_ms: u64) -> (String, NodeHooks) {
        let tag = id.to_string();
        let action = Arc::new(FunctionAction::new(move |_| {
            let tag = tag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(partial(json!({"seen": tag})))
            }
        }));
        (id.to_string(), HookRegistry::new().node_hooks(id, action))
    }

    fn schema() -> Arc<StateSchema> {
        Arc::new(StateSchema::builder().list_channel("seen").build())
    }

    #[tokio::test]
    async fn test_sequential_declaration_order() {
        let node = ParallelAction::new("src", vec![branch("a", 5), branch("b", 0)], schema());
        let update = node.call(&State::new(), &RunnableConfig::default()).await.unwrap();
        assert_eq!(update.get("seen"), Some(&json!(["a", "b"])));
        assert_eq!(node.branch_ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_executor_merges_in_declaration_order() {
        let node = ParallelAction::new(
            "src",
            vec![branch("slow", 60), branch("mid", 30), branch("fast", 0)],
            schema(),
        );
        let config = RunnableConfig::default()
            .with_parallel_executor("src", tokio::runtime::Handle::current());

        let update = node.call(&State::new(), &config).await.unwrap();
        assert_eq!(update.get("seen"), Some(&json!(["slow", "mid", "fast"])));

        let partials = node.call_partials(&State::new(), &config).await.unwrap();
        let seen: Vec<_> = partials.iter().map(|p| p["seen"].clone()).collect();
        assert_eq!(seen, vec![json!("slow"), json!("mid"), json!("fast")]);
    }

    #[test]
    fn test_parallel_node_id() {
        assert_eq!(parallel_node_id("fan"), "__parallel__(fan)");
    }
}
