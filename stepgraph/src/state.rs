//! State management for graph execution
//!
//! State is an ordered map of channel names to JSON values. Every write goes
//! through the channel's [`Reducer`]; keys without a declared channel fall back
//! to replace semantics.

use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Graph state - an ordered map of channel names to values
pub type State = Map<String, Value>;

/// Partial result produced by a hook, node or edge
pub type StateUpdate = Map<String, Value>;

/// Build a [`StateUpdate`] from a JSON object literal.
///
/// Non-object values produce an empty update.
///
/// ```
/// use stepgraph::state::partial;
/// use serde_json::json;
///
/// let update = partial(json!({"count": 1}));
/// assert_eq!(update.get("count"), Some(&json!(1)));
/// ```
pub fn partial(value: Value) -> StateUpdate {
    match value {
        Value::Object(map) => map,
        _ => StateUpdate::new(),
    }
}

/// Reducer determines how state updates are merged
#[derive(Clone, Default)]
pub enum Reducer {
    /// Replace the value entirely (default)
    #[default]
    Replace,
    /// Append to an ordered list
    Append,
    /// Sum numeric values
    Sum,
    /// Custom merge function `(existing, incoming) -> merged`
    Custom(Arc<dyn Fn(Value, Value) -> Value + Send + Sync>),
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => write!(f, "Replace"),
            Self::Append => write!(f, "Append"),
            Self::Sum => write!(f, "Sum"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Reducer {
    /// Merge `incoming` onto `current` (`Value::Null` when absent)
    pub fn reduce(&self, current: Value, incoming: Value) -> Value {
        match self {
            Self::Replace => incoming,
            Self::Append => {
                let mut items = match current {
                    Value::Array(items) => items,
                    Value::Null => vec![],
                    other => vec![other],
                };
                match incoming {
                    Value::Array(more) => items.extend(more),
                    Value::Null => {}
                    single => items.push(single),
                }
                Value::Array(items)
            }
            Self::Sum => {
                let current = if current.is_null() { json!(0) } else { current };
                if let (Some(a), Some(b)) = (current.as_i64(), incoming.as_i64()) {
                    if let Some(total) = a.checked_add(b) {
                        return json!(total);
                    }
                }
                let a = current.as_f64().unwrap_or(0.0);
                let b = incoming.as_f64().unwrap_or(0.0);
                json!(a + b)
            }
            Self::Custom(f) => f(current, incoming),
        }
    }
}

/// Channel definition for a state field
#[derive(Clone, Debug)]
pub struct Channel {
    /// Channel name
    pub name: String,
    /// Reducer for merging updates
    pub reducer: Reducer,
    /// Default value
    pub default: Option<Value>,
}

impl Channel {
    /// Create a new channel with replace semantics
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), reducer: Reducer::Replace, default: None }
    }

    /// Create a list channel with append semantics
    pub fn list(name: &str) -> Self {
        Self { name: name.to_string(), reducer: Reducer::Append, default: Some(json!([])) }
    }

    /// Create a counter channel with sum semantics
    pub fn counter(name: &str) -> Self {
        Self { name: name.to_string(), reducer: Reducer::Sum, default: Some(json!(0)) }
    }

    /// Set the reducer
    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    /// Set the default value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// State schema: the channels of a graph and their reducers
#[derive(Clone, Debug, Default)]
pub struct StateSchema {
    /// Channel definitions
    pub channels: HashMap<String, Channel>,
}

impl StateSchema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a schema builder
    pub fn builder() -> StateSchemaBuilder {
        StateSchemaBuilder::default()
    }

    /// Create a simple schema with just channel names (all replace)
    pub fn simple(channels: &[&str]) -> Self {
        let mut schema = Self::new();
        for name in channels {
            schema.channels.insert((*name).to_string(), Channel::new(name));
        }
        schema
    }

    /// Get the reducer for a channel
    pub fn get_reducer(&self, channel: &str) -> &Reducer {
        static REPLACE: Reducer = Reducer::Replace;
        self.channels.get(channel).map(|c| &c.reducer).unwrap_or(&REPLACE)
    }

    /// Get the default value for a channel
    pub fn get_default(&self, channel: &str) -> Option<&Value> {
        self.channels.get(channel).and_then(|c| c.default.as_ref())
    }

    /// Apply one update to state using the channel's reducer.
    ///
    /// An absent key starts from the channel default.
    pub fn apply_update(&self, state: &mut State, key: &str, value: Value) {
        let current = state
            .get(key)
            .or_else(|| self.get_default(key))
            .cloned()
            .unwrap_or(Value::Null);
        let merged = self.get_reducer(key).reduce(current, value);
        state.insert(key.to_string(), merged);
    }

    /// Fold a whole partial result into state, key by key in map order
    pub fn apply_updates(&self, state: &mut State, updates: StateUpdate) {
        for (key, value) in updates {
            self.apply_update(state, &key, value);
        }
    }

    /// Fold `incoming` into another partial result without seeding defaults.
    ///
    /// Used to aggregate several partial results before they reach the state,
    /// so an append channel never repeats values already in the state.
    pub fn merge_partial(&self, acc: &mut StateUpdate, incoming: StateUpdate) {
        for (key, value) in incoming {
            let reducer = self.get_reducer(&key);
            match acc.get_mut(&key) {
                Some(existing) => *existing = reducer.reduce(existing.take(), value),
                None => {
                    let merged = match reducer {
                        Reducer::Append | Reducer::Sum => reducer.reduce(Value::Null, value),
                        _ => value,
                    };
                    acc.insert(key, merged);
                }
            }
        }
    }

    /// Initialize state with default values
    pub fn initialize_state(&self) -> State {
        let mut names: Vec<_> = self.channels.keys().collect();
        names.sort();
        let mut state = State::new();
        for name in names {
            if let Some(default) = &self.channels[name].default {
                state.insert(name.clone(), default.clone());
            }
        }
        state
    }
}

/// Builder for StateSchema
#[derive(Default)]
pub struct StateSchemaBuilder {
    channels: HashMap<String, Channel>,
}

impl StateSchemaBuilder {
    /// Add a channel with replace semantics
    pub fn channel(mut self, name: &str) -> Self {
        self.channels.insert(name.to_string(), Channel::new(name));
        self
    }

    /// Add a channel with append semantics (for lists)
    pub fn list_channel(mut self, name: &str) -> Self {
        self.channels.insert(name.to_string(), Channel::list(name));
        self
    }

    /// Add a counter channel with sum semantics
    pub fn counter_channel(mut self, name: &str) -> Self {
        self.channels.insert(name.to_string(), Channel::counter(name));
        self
    }

    /// Add a channel with custom reducer
    pub fn channel_with_reducer(mut self, name: &str, reducer: Reducer) -> Self {
        self.channels.insert(name.to_string(), Channel::new(name).with_reducer(reducer));
        self
    }

    /// Add a channel with default value
    pub fn channel_with_default(mut self, name: &str, default: Value) -> Self {
        self.channels.insert(name.to_string(), Channel::new(name).with_default(default));
        self
    }

    /// Add a fully specified channel
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channels.insert(channel.name.clone(), channel);
        self
    }

    /// Build the schema
    pub fn build(self) -> StateSchema {
        StateSchema { channels: self.channels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_reducer() {
        let schema = StateSchema::simple(&["value"]);
        let mut state = State::new();

        schema.apply_update(&mut state, "value", json!(1));
        schema.apply_update(&mut state, "value", json!(2));
        assert_eq!(state.get("value"), Some(&json!(2)));
    }

    #[test]
    fn test_undeclared_key_replaces() {
        let schema = StateSchema::new();
        let mut state = State::new();

        schema.apply_update(&mut state, "loose", json!([1]));
        schema.apply_update(&mut state, "loose", json!([2]));
        assert_eq!(state.get("loose"), Some(&json!([2])));
    }

    #[test]
    fn test_append_starts_from_default() {
        let schema = StateSchema::builder()
            .with_channel(Channel::list("log").with_default(json!(["boot"])))
            .build();
        let mut state = State::new();

        schema.apply_update(&mut state, "log", json!("ready"));
        assert_eq!(state.get("log"), Some(&json!(["boot", "ready"])));
    }

    #[test]
    fn test_sum_keeps_integers() {
        let schema = StateSchema::builder().counter_channel("count").build();
        let mut state = schema.initialize_state();

        schema.apply_update(&mut state, "count", json!(5));
        schema.apply_update(&mut state, "count", json!(3));
        assert_eq!(state.get("count"), Some(&json!(8)));

        schema.apply_update(&mut state, "count", json!(0.5));
        assert_eq!(state.get("count"), Some(&json!(8.5)));
    }

    #[test]
    fn test_merge_partial_skips_defaults() {
        let schema = StateSchema::builder()
            .with_channel(Channel::list("log").with_default(json!(["boot"])))
            .build();
        let mut acc = StateUpdate::new();

        schema.merge_partial(&mut acc, partial(json!({"log": "a"})));
        schema.merge_partial(&mut acc, partial(json!({"log": ["b", "c"]})));
        assert_eq!(acc.get("log"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn test_partial_from_non_object() {
        assert!(partial(json!(42)).is_empty());
    }
}
