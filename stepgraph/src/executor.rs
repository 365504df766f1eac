//! Step execution engine
//!
//! The [`Stepper`] drives a compiled plan one step at a time:
//!
//! ```text
//! Start -> Edge(START) -> Node(a) -> Node(b) -> ... -> End
//!                              \-> Suspend(metadata)
//! ```
//!
//! A node step checks cancellation and the recursion limit, evaluates the
//! interrupt-before checks, runs the hook-wrapped action as a tracked task,
//! merges its partial, evaluates interrupt-after and edge checks, routes,
//! persists a checkpoint and emits one [`NodeOutput`]. Every step runs racing
//! the run's cancellation token; an abandoned step writes no checkpoint.

use crate::checkpoint::Checkpoint;
use crate::config::{RunnableConfig, StreamMode};
use crate::edge::{END, Edge, EdgeTarget, START};
use crate::error::{GraphError, Result};
use crate::graph::ExecutionPlan;
use crate::input::GraphInput;
use crate::interrupt::InterruptionMetadata;
use crate::state::{State, StateUpdate};
use crate::stream::{NodeOutput, RunResult, RunStatus, SharedOutcome, lock_outcome};
use futures::Stream;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Checkpoint metadata key recording why a run paused there
pub(crate) const INTERRUPT_KEY: &str = "interrupt";

const PAUSED_BEFORE: &str = "before";
const PAUSED_AFTER: &str = "after";
const PAUSED_AT_EDGE: &str = "edge";

/// Position of the stepper between steps
#[derive(Debug)]
enum Phase {
    Start,
    Node(String),
    Edge(String),
    End,
    Suspend(InterruptionMetadata),
}

impl Phase {
    fn after(target: EdgeTarget) -> Self {
        match target {
            EdgeTarget::End => Self::End,
            EdgeTarget::Node(id) => Self::Node(id),
        }
    }
}

/// Output of one transition, and where to go next (`None` once finished)
type Step = (Option<NodeOutput>, Option<Phase>);

/// Drives one run of a compiled graph
pub(crate) struct Stepper {
    plan: Arc<ExecutionPlan>,
    config: RunnableConfig,
    outcome: SharedOutcome,
    state: State,
    start_partial: StateUpdate,
    /// Last checkpoint written or loaded by this run
    tip: Option<Checkpoint>,
    /// Checkpoint step counter, continued across resumes
    step: usize,
    /// Nodes executed by this run, bounded by the recursion limit
    executed: usize,
    /// The next node is the first one after a resume
    resuming: bool,
    /// The tip is a selected historical checkpoint: edit a fork, never the original
    fork_tip: bool,
    skip_interrupt_before: Option<String>,
}

impl Stepper {
    pub(crate) fn new(
        plan: Arc<ExecutionPlan>,
        config: RunnableConfig,
        outcome: SharedOutcome,
    ) -> Self {
        Self {
            plan,
            config,
            outcome,
            state: State::new(),
            start_partial: StateUpdate::new(),
            tip: None,
            step: 0,
            executed: 0,
            resuming: false,
            fork_tip: false,
            skip_interrupt_before: None,
        }
    }

    /// Run lazily; nothing happens until the returned stream is polled
    pub(crate) fn run(
        mut self,
        input: GraphInput,
    ) -> impl Stream<Item = Result<NodeOutput>> + Send + 'static {
        async_stream::stream! {
            self.set_status(RunStatus::Running);
            info!(
                thread_id = %self.config.thread_id,
                graph_path = %self.config.graph_path(),
                resume = input.is_resume(),
                "run started"
            );

            let mut phase = match self.prepare(input).await {
                Ok(phase) => phase,
                Err(e) => {
                    self.fail(&e);
                    yield Err(e);
                    return;
                }
            };

            loop {
                match self.advance(phase).await {
                    Ok((output, next)) => {
                        if let Some(output) = output {
                            yield Ok(output);
                        }
                        match next {
                            Some(next) => phase = next,
                            None => return,
                        }
                    }
                    Err(_) if self.config.control().is_cancelled() => {
                        self.mark_cancelled();
                        return;
                    }
                    Err(e) => {
                        self.fail(&e);
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    }

    async fn prepare(&mut self, input: GraphInput) -> Result<Phase> {
        match input {
            GraphInput::Args(values) => {
                self.state = self.plan.schema.initialize_state();
                self.plan.schema.apply_updates(&mut self.state, values.clone());
                self.start_partial = values;
                Ok(Phase::Start)
            }
            GraphInput::Resume(overrides) => self.rehydrate(overrides).await,
        }
    }

    /// Load the checkpoint to continue from and work out where to re-enter
    async fn rehydrate(&mut self, overrides: Option<StateUpdate>) -> Result<Phase> {
        let thread_id = self.config.thread_id.clone();
        let store = self
            .plan
            .checkpointer()
            .cloned()
            .ok_or_else(|| GraphError::NothingToResume(thread_id.clone()))?;

        let mut checkpoint = match &self.config.checkpoint_id {
            Some(id) => {
                store.get(id).await?.ok_or_else(|| GraphError::CheckpointNotFound(id.clone()))?
            }
            None => store
                .latest(&thread_id)
                .await?
                .ok_or_else(|| GraphError::NothingToResume(thread_id.clone()))?,
        };

        // A selected historical checkpoint is forked, never rewritten.
        self.fork_tip = self.config.checkpoint_id.is_some();
        if let Some(overrides) = overrides {
            self.plan.schema.apply_updates(&mut checkpoint.state, overrides);
            if std::mem::take(&mut self.fork_tip) {
                checkpoint = checkpoint.fork();
                checkpoint.thread_id = thread_id.clone();
                store.append(&checkpoint).await?;
            } else {
                checkpoint.saved_at = chrono::Utc::now();
                store.replace(&checkpoint.id, &checkpoint).await?;
            }
        }

        self.state = checkpoint.state.clone();
        self.step = checkpoint.step;
        self.resuming = true;
        let paused_before =
            checkpoint.metadata.get(INTERRUPT_KEY).and_then(Value::as_str) == Some(PAUSED_BEFORE);
        let phase = match checkpoint.next_node_id.as_deref() {
            Some(END) => Phase::End,
            Some(next) => {
                if paused_before {
                    self.skip_interrupt_before = Some(next.to_string());
                }
                Phase::Node(next.to_string())
            }
            None => Phase::Edge(checkpoint.node_id.clone()),
        };

        info!(
            thread_id = %thread_id,
            checkpoint_id = %checkpoint.id,
            node = %checkpoint.node_id,
            next = ?checkpoint.next_node_id,
            "resuming from checkpoint"
        );
        self.tip = Some(checkpoint);
        Ok(phase)
    }

    async fn advance(&mut self, phase: Phase) -> Result<Step> {
        match phase {
            Phase::Start => {
                let output = self.output(START, &self.start_partial, None, None, false);
                Ok((Some(output), Some(Phase::Edge(START.to_string()))))
            }
            Phase::Node(id) => self.run_node(id).await,
            Phase::Edge(source) => self.resolve_pending_edge(source).await,
            Phase::End => self.complete().await,
            Phase::Suspend(meta) => {
                info!(
                    thread_id = %self.config.thread_id,
                    node = %meta.node_id,
                    "run suspended"
                );
                self.finish(RunResult::Interrupted(meta), RunStatus::Suspended);
                Ok((None, None))
            }
        }
    }

    async fn run_node(&mut self, id: String) -> Result<Step> {
        if self.config.control().is_cancelled() {
            return Err(GraphError::Cancelled);
        }
        let limit = self.plan.config.recursion_limit;
        if self.executed >= limit {
            return Err(GraphError::RecursionLimitExceeded(limit));
        }

        let plan = self.plan.clone();
        let node = plan.node(&id)?;
        let resumed = std::mem::take(&mut self.resuming);
        let node_config = self.config.for_node(&id, resumed);

        if self.skip_interrupt_before.take().as_deref() != Some(id.as_str()) {
            let pause = if plan.config.interrupt_before.contains(&id) {
                Some(InterruptionMetadata::new(&id, self.state.clone()))
            } else {
                node.spec.interrupt.as_ref().and_then(|f| f(&id, &self.state, &node_config))
            };
            if let Some(meta) = pause {
                self.mark_paused_before(&id).await?;
                return Ok((None, Some(Phase::Suspend(meta))));
            }
        }

        self.executed += 1;
        self.step += 1;
        debug!(
            thread_id = %self.config.thread_id,
            node = %id,
            step = self.step,
            parallel = node.spec.parallel,
            "executing node"
        );

        let task = {
            let plan = plan.clone();
            let state = self.state.clone();
            let config = node_config.clone();
            let node_id = id.clone();
            async move {
                let node = plan.node(&node_id)?;
                node.hooks.run(&node_id, &state, &config, &plan.schema).await
            }
        };
        let partials = self.cancellable(task).await.map_err(|e| e.in_node(&id))?;
        if self.config.control().is_cancelled() {
            return Err(GraphError::Cancelled);
        }

        let mut step_partial = StateUpdate::new();
        self.fold(&mut step_partial, partials);

        if plan.config.interrupt_after.contains(&id) {
            let next = if plan.config.interrupt_before_edge {
                None
            } else {
                let (target, updates) = self.route(&id).await?;
                self.fold(&mut step_partial, updates);
                Some(target)
            };
            let next_id = next.as_ref().map(EdgeTarget::id);
            let checkpoint_id = self.persist(&id, next_id, Some(PAUSED_AFTER)).await?;
            let output = self.output(&id, &step_partial, next_id, checkpoint_id, false);
            let meta = InterruptionMetadata::new(&id, self.state.clone());
            return Ok((Some(output), Some(Phase::Suspend(meta))));
        }

        if let Some(predicate) = plan.edge(&id)?.interrupt.as_ref() {
            if let Some(meta) = predicate(&id, &self.state, &node_config) {
                let checkpoint_id = self.persist(&id, None, Some(PAUSED_AT_EDGE)).await?;
                let output = self.output(&id, &step_partial, None, checkpoint_id, false);
                return Ok((Some(output), Some(Phase::Suspend(meta))));
            }
        }

        let (target, updates) = self.route(&id).await?;
        self.fold(&mut step_partial, updates);
        let checkpoint_id = self.persist(&id, Some(target.id()), None).await?;
        let output = self.output(&id, &step_partial, Some(target.id()), checkpoint_id, false);
        Ok((Some(output), Some(Phase::after(target))))
    }

    /// Evaluate an edge whose source already ran: the START edge of a fresh
    /// run, or an edge left pending by a pause
    async fn resolve_pending_edge(&mut self, source: String) -> Result<Step> {
        let (target, updates) = self.route(&source).await?;
        self.fold(&mut StateUpdate::new(), updates);

        let pending = self
            .tip
            .as_ref()
            .is_some_and(|tip| tip.node_id == source && tip.next_node_id.is_none());
        if pending {
            let next = target.id().to_string();
            let state = self.state.clone();
            self.rewrite_tip(move |tip| {
                tip.next_node_id = Some(next);
                tip.state = state;
                tip.metadata.remove(INTERRUPT_KEY);
            })
            .await?;
        }
        Ok((None, Some(Phase::after(target))))
    }

    async fn complete(&mut self) -> Result<Step> {
        let output = self.output(END, &StateUpdate::new(), None, None, true);

        if self.plan.config.release_thread {
            if let Some(store) = self.plan.checkpointer() {
                let released = store.release(&self.config.thread_id).await?;
                info!(
                    thread_id = %released.thread_id,
                    checkpoints = released.checkpoints.len(),
                    "thread released"
                );
            }
        }

        info!(thread_id = %self.config.thread_id, steps = self.executed, "run completed");
        self.finish(RunResult::Done(self.state.clone()), RunStatus::Done);
        Ok((Some(output), None))
    }

    /// Pick the target of the edge leaving `source`, with the routing updates
    async fn route(&self, source: &str) -> Result<(EdgeTarget, Vec<StateUpdate>)> {
        let plan = self.plan.clone();
        let compiled = plan.edge(source)?;
        if let Edge::Direct { target, .. } = &compiled.edge {
            return Ok((target.clone(), Vec::new()));
        }

        let hooks = compiled.hooks.clone().ok_or_else(|| {
            GraphError::InvalidGraph(format!("conditional edge of '{source}' was not compiled"))
        })?;
        let task = {
            let plan = plan.clone();
            let state = self.state.clone();
            let config = self.config.for_node(source, false);
            let source = source.to_string();
            async move { hooks.run(&source, &state, &config, &plan.schema).await }
        };
        let routing = self.cancellable(task).await.map_err(|e| e.in_node(source))?;
        if self.config.control().is_cancelled() {
            return Err(GraphError::Cancelled);
        }

        let target = compiled.edge.resolve(&routing.route)?;
        debug!(
            thread_id = %self.config.thread_id,
            source,
            route = %routing.route,
            target = target.id(),
            "edge evaluated"
        );
        Ok((target, routing.updates))
    }

    /// Fold each partial into state in order, collecting the step's partial
    /// for `Updates` outputs
    fn fold(&mut self, step_partial: &mut StateUpdate, partials: Vec<StateUpdate>) {
        for update in partials.into_iter().filter(|u| !u.is_empty()) {
            self.plan.schema.apply_updates(&mut self.state, update.clone());
            self.plan.schema.merge_partial(step_partial, update);
        }
    }

    /// Apply `edit` to the tip: in place when this run owns it, as an
    /// appended fork when the tip is a selected historical checkpoint
    async fn rewrite_tip<F>(&mut self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Checkpoint) + Send,
    {
        let Some(store) = self.plan.checkpointer().cloned() else {
            return Ok(());
        };
        let Some(tip) = self.tip.as_mut() else {
            return Ok(());
        };
        if std::mem::take(&mut self.fork_tip) {
            let mut fork = tip.fork();
            fork.thread_id = self.config.thread_id.clone();
            edit(&mut fork);
            store.append(&fork).await?;
            *tip = fork;
        } else {
            edit(tip);
            store.replace(&tip.id, &*tip).await?;
        }
        Ok(())
    }

    /// Run `work` as a tracked task, abandoning it if the run is cancelled
    async fn cancellable<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let control = self.config.control();
        let mut task = tokio::spawn(work);
        control.track(task.abort_handle());
        tokio::select! {
            biased;
            _ = control.cancelled() => Err(GraphError::Cancelled),
            joined = &mut task => joined?,
        }
    }

    /// Record a pause before `id`, reusing the checkpoint that already points at it
    async fn mark_paused_before(&mut self, id: &str) -> Result<()> {
        if self.plan.checkpointer().is_none() {
            return Ok(());
        }
        let points_here =
            self.tip.as_ref().is_some_and(|tip| tip.next_node_id.as_deref() == Some(id));
        if points_here {
            self.rewrite_tip(|tip| {
                tip.metadata.insert(INTERRUPT_KEY.to_string(), json!(PAUSED_BEFORE));
            })
            .await?;
        } else {
            let last = self.tip.as_ref().map_or(START, |tip| tip.node_id.as_str()).to_string();
            self.persist(&last, Some(id), Some(PAUSED_BEFORE)).await?;
        }
        Ok(())
    }

    async fn persist(
        &mut self,
        node_id: &str,
        next: Option<&str>,
        paused: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(store) = self.plan.checkpointer().cloned() else {
            return Ok(None);
        };
        let mut checkpoint =
            Checkpoint::new(&self.config.thread_id, node_id, next, self.state.clone(), self.step);
        checkpoint.parent_id = self.tip.as_ref().map(|tip| tip.id.clone());
        if let Some(paused) = paused {
            checkpoint.metadata.insert(INTERRUPT_KEY.to_string(), json!(paused));
        }

        let id = store.append(&checkpoint).await?;
        debug!(
            thread_id = %self.config.thread_id,
            checkpoint_id = %id,
            node = node_id,
            step = self.step,
            "checkpoint saved"
        );
        self.tip = Some(checkpoint);
        self.fork_tip = false;
        Ok(Some(id))
    }

    fn output(
        &self,
        node_id: &str,
        partial: &StateUpdate,
        next: Option<&str>,
        checkpoint_id: Option<String>,
        is_terminal: bool,
    ) -> NodeOutput {
        let state = match self.config.stream_mode {
            StreamMode::Values => self.state.clone(),
            StreamMode::Updates => partial.clone(),
        };
        NodeOutput {
            node_id: node_id.to_string(),
            state,
            is_terminal,
            next_node: next.map(str::to_string),
            checkpoint_id,
        }
    }

    fn set_status(&self, status: RunStatus) {
        let mut outcome = lock_outcome(&self.outcome);
        if !outcome.status.is_finished() {
            outcome.status = status;
        }
    }

    fn finish(&self, result: RunResult, status: RunStatus) {
        let mut outcome = lock_outcome(&self.outcome);
        if !outcome.status.is_finished() {
            outcome.status = status;
            outcome.result = Some(result);
        }
    }

    fn mark_cancelled(&self) {
        warn!(
            thread_id = %self.config.thread_id,
            step = self.step,
            "run cancelled; in-flight step abandoned"
        );
        self.set_status(RunStatus::Cancelled);
    }

    fn fail(&self, e: &GraphError) {
        error!(thread_id = %self.config.thread_id, step = self.step, error = %e, "run failed");
        self.set_status(RunStatus::Failed);
    }
}
