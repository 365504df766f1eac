//! Serialization of state snapshots for checkpoint backends

use crate::error::{GraphError, Result};
use crate::state::State;

/// Converts a state snapshot to bytes and back
pub trait StateSerializer: Send + Sync {
    /// Encode a snapshot
    fn serialize(&self, state: &State) -> Result<Vec<u8>>;

    /// Decode a snapshot
    fn deserialize(&self, bytes: &[u8]) -> Result<State>;
}

/// JSON encoding via `serde_json`
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonStateSerializer;

impl StateSerializer for JsonStateSerializer {
    fn serialize(&self, state: &State) -> Result<Vec<u8>> {
        serde_json::to_vec(state).map_err(|e| GraphError::SerializationError(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<State> {
        serde_json::from_slice(bytes).map_err(|e| GraphError::SerializationError(e.to_string()))
    }
}
