//! Run input: a fresh run or the continuation of a suspended thread

use crate::state::StateUpdate;

/// Input that starts a run
#[derive(Clone, Debug)]
pub enum GraphInput {
    /// Start a fresh run with these channel values
    Args(StateUpdate),
    /// Continue the thread's last checkpoint, optionally overriding channel values
    Resume(Option<StateUpdate>),
}

impl GraphInput {
    /// Fresh run
    pub fn args(values: StateUpdate) -> Self {
        Self::Args(values)
    }

    /// Continue as-is
    pub fn resume() -> Self {
        Self::Resume(None)
    }

    /// Continue after merging `overrides` into the suspended state
    pub fn resume_with(overrides: StateUpdate) -> Self {
        Self::Resume(Some(overrides))
    }

    /// Whether this input continues an existing thread
    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Resume(_))
    }
}

impl From<StateUpdate> for GraphInput {
    fn from(values: StateUpdate) -> Self {
        Self::Args(values)
    }
}
