//! Cancellable lazy output stream
//!
//! Every run produces exactly one [`GraphStream`]. It yields one
//! [`NodeOutput`] per executed step and finishes with a [`RunResult`] that is
//! either the final state or the metadata of a suspension. A stream is not
//! restartable: continuing a suspended or cancelled thread means starting a
//! new stream with [`GraphInput::Resume`](crate::GraphInput::Resume).

use crate::cancel::RunControl;
use crate::edge::{END, START};
use crate::error::{GraphError, Result};
use crate::interrupt::InterruptionMetadata;
use crate::state::State;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

/// Output of one step
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutput {
    /// Node that produced this output (START / END sentinels included)
    pub node_id: String,
    /// Full state, or only the step's partial in `Updates` mode
    pub state: State,
    /// Whether this is the last output of a completed run
    pub is_terminal: bool,
    /// Node scheduled next, when already resolved
    pub next_node: Option<String>,
    /// Checkpoint written for this step
    pub checkpoint_id: Option<String>,
}

impl NodeOutput {
    /// Output of the START sentinel
    pub fn is_start(&self) -> bool {
        self.node_id == START
    }

    /// Output of the END sentinel
    pub fn is_end(&self) -> bool {
        self.node_id == END
    }
}

/// Lifecycle of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunStatus {
    /// Stream created, not yet polled
    #[default]
    Pending,
    /// Executing steps
    Running,
    /// Paused at an interruption; resumable
    Suspended,
    /// Reached END
    Done,
    /// Aborted by the consumer
    Cancelled,
    /// A step failed
    Failed,
}

impl RunStatus {
    /// Whether the run can make no further progress
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Suspended | Self::Done | Self::Cancelled | Self::Failed)
    }
}

/// How a run ended
#[derive(Clone, Debug, PartialEq)]
pub enum RunResult {
    /// Reached END with this state
    Done(State),
    /// Paused; resume with a new stream on the same thread
    Interrupted(InterruptionMetadata),
}

impl RunResult {
    /// State at the end of the run or at the pause
    pub fn state(&self) -> &State {
        match self {
            Self::Done(state) => state,
            Self::Interrupted(meta) => &meta.state,
        }
    }

    /// Consume into the state
    pub fn into_state(self) -> State {
        match self {
            Self::Done(state) => state,
            Self::Interrupted(meta) => meta.state,
        }
    }

    /// Whether the run paused
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Suspension metadata, if the run paused
    pub fn interruption(&self) -> Option<&InterruptionMetadata> {
        match self {
            Self::Interrupted(meta) => Some(meta),
            Self::Done(_) => None,
        }
    }
}

/// Status and result shared between a stream and the stepper driving it
#[derive(Debug, Default)]
pub(crate) struct RunOutcome {
    pub(crate) status: RunStatus,
    pub(crate) result: Option<RunResult>,
}

pub(crate) type SharedOutcome = Arc<Mutex<RunOutcome>>;

pub(crate) fn lock_outcome(outcome: &SharedOutcome) -> MutexGuard<'_, RunOutcome> {
    outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cancels a run from anywhere; obtained from [`GraphStream::cancel_handle`]
#[derive(Clone, Debug)]
pub struct CancelHandle {
    control: RunControl,
    outcome: SharedOutcome,
}

impl CancelHandle {
    /// Request cancellation; see [`GraphStream::cancel`]
    pub fn cancel(&self, interrupt_running: bool) -> bool {
        {
            let mut outcome = lock_outcome(&self.outcome);
            if outcome.status.is_finished() {
                return false;
            }
            outcome.status = RunStatus::Cancelled;
        }
        tracing::warn!(interrupt_running, "run cancellation requested");
        self.control.cancel(interrupt_running)
    }

    /// Whether the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

type BoxedOutputs = Pin<Box<dyn Stream<Item = Result<NodeOutput>> + Send>>;

/// Lazy, cancellable sequence of step outputs
pub struct GraphStream {
    inner: BoxedOutputs,
    handle: CancelHandle,
    finished: bool,
}

impl GraphStream {
    pub(crate) fn new(inner: BoxedOutputs, control: RunControl, outcome: SharedOutcome) -> Self {
        Self { inner, handle: CancelHandle { control, outcome }, finished: false }
    }

    /// Request cancellation.
    ///
    /// The step in flight is abandoned and writes no checkpoint. With
    /// `interrupt_running` its task is aborted; otherwise it is left to finish
    /// and its result is discarded. Returns `false` if the run had already
    /// finished or been cancelled.
    pub fn cancel(&self, interrupt_running: bool) -> bool {
        self.handle.cancel(interrupt_running)
    }

    /// Whether the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// A handle that can cancel this run from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Current lifecycle status
    pub fn status(&self) -> RunStatus {
        lock_outcome(&self.handle.outcome).status
    }

    /// How the run ended; `None` until it reaches END or pauses
    pub fn result(&self) -> Option<RunResult> {
        lock_outcome(&self.handle.outcome).result.clone()
    }

    /// Drive the run to its end, handing every output to `f`
    pub async fn for_each_async<F>(mut self, mut f: F) -> Result<RunResult>
    where
        F: FnMut(NodeOutput),
    {
        while let Some(output) = self.next().await {
            f(output?);
        }
        self.finish()
    }

    /// Drive the run to its end, collecting every output
    pub async fn collect_outputs(mut self) -> Result<(Vec<NodeOutput>, RunResult)> {
        let mut outputs = Vec::new();
        while let Some(output) = self.next().await {
            outputs.push(output?);
        }
        let result = self.finish()?;
        Ok((outputs, result))
    }

    /// Iterate synchronously from a thread outside the runtime.
    ///
    /// `handle` must belong to a multi-threaded runtime; each `next` blocks on it.
    pub fn blocking_iter(self, handle: tokio::runtime::Handle) -> BlockingIter {
        BlockingIter { stream: self, handle }
    }

    fn finish(&self) -> Result<RunResult> {
        if self.is_cancelled() {
            return Err(GraphError::Cancelled);
        }
        self.result().ok_or(GraphError::Cancelled)
    }
}

impl Stream for GraphStream {
    type Item = Result<NodeOutput>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.handle.is_cancelled() {
            // Dropping the stepper releases the abandoned step.
            self.finished = true;
            self.inner = Box::pin(futures::stream::empty::<Result<NodeOutput>>());
            return Poll::Ready(None);
        }
        let polled = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
        }
        polled
    }
}

impl std::fmt::Debug for GraphStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStream")
            .field("status", &self.status())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Synchronous iterator over a [`GraphStream`]
pub struct BlockingIter {
    stream: GraphStream,
    handle: tokio::runtime::Handle,
}

impl BlockingIter {
    /// The underlying stream, for status and result
    pub fn stream(&self) -> &GraphStream {
        &self.stream
    }

    /// Consume the rest of the run and return its result
    pub fn into_result(mut self) -> Result<RunResult> {
        for output in self.by_ref() {
            output?;
        }
        self.stream.finish()
    }
}

impl Iterator for BlockingIter {
    type Item = Result<NodeOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        self.handle.block_on(self.stream.next())
    }
}
