//! State and reducer tests

use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use stepgraph::state::{Channel, Reducer, State, StateSchema, StateUpdate, partial};

#[test]
fn test_replace_reducer() {
    let schema = StateSchema::simple(&["value"]);
    let mut state = State::new();

    schema.apply_update(&mut state, "value", json!(1));
    schema.apply_update(&mut state, "value", json!(2));
    assert_eq!(state.get("value"), Some(&json!(2)));
}

#[test]
fn test_append_reducer_accepts_items_and_lists() {
    let schema = StateSchema::builder().list_channel("messages").build();
    let mut state = schema.initialize_state();

    schema.apply_update(&mut state, "messages", json!({"role": "user", "content": "hi"}));
    schema.apply_update(&mut state, "messages", json!([{"role": "assistant", "content": "hello"}]));
    assert_eq!(
        state.get("messages"),
        Some(&json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"}
        ]))
    );
}

#[test]
fn test_sum_reducer_mixes_integers_and_floats() {
    let schema = StateSchema::builder().counter_channel("count").build();
    let mut state = schema.initialize_state();

    schema.apply_update(&mut state, "count", json!(5));
    schema.apply_update(&mut state, "count", json!(3));
    assert_eq!(state.get("count"), Some(&json!(8)));

    schema.apply_update(&mut state, "count", json!(0.5));
    assert_eq!(state.get("count"), Some(&json!(8.5)));
}

#[test]
fn test_custom_reducer() {
    let max = Reducer::Custom(Arc::new(|current: Value, incoming: Value| {
        let a = current.as_i64().unwrap_or(i64::MIN);
        let b = incoming.as_i64().unwrap_or(i64::MIN);
        json!(a.max(b))
    }));
    let schema = StateSchema::builder().channel_with_reducer("best", max).build();
    let mut state = State::new();

    schema.apply_updates(&mut state, partial(json!({"best": 7})));
    schema.apply_updates(&mut state, partial(json!({"best": 3})));
    assert_eq!(state.get("best"), Some(&json!(7)));
}

#[test]
fn test_undeclared_keys_replace() {
    let schema = StateSchema::builder().list_channel("log").build();
    let mut state = schema.initialize_state();

    schema.apply_updates(&mut state, partial(json!({"free": "a", "log": "x"})));
    schema.apply_updates(&mut state, partial(json!({"free": "b", "log": "y"})));
    assert_eq!(state.get("free"), Some(&json!("b")));
    assert_eq!(state.get("log"), Some(&json!(["x", "y"])));
}

#[test]
fn test_defaults_seed_initial_state() {
    let schema = StateSchema::builder()
        .with_channel(Channel::new("mode").with_default(json!("draft")))
        .counter_channel("attempts")
        .channel("untouched")
        .build();

    let state = schema.initialize_state();
    assert_eq!(state.get("mode"), Some(&json!("draft")));
    assert_eq!(state.get("attempts"), Some(&json!(0)));
    assert!(!state.contains_key("untouched"));
}

#[test]
fn test_merge_partial_does_not_seed_defaults() {
    let schema = StateSchema::builder().list_channel("seen").counter_channel("hits").build();
    let mut merged = StateUpdate::new();

    schema.merge_partial(&mut merged, partial(json!({"seen": "a", "hits": 1})));
    schema.merge_partial(&mut merged, partial(json!({"seen": ["b", "c"], "hits": 2})));
    assert_eq!(merged.get("seen"), Some(&json!(["a", "b", "c"])));
    assert_eq!(merged.get("hits"), Some(&json!(3)));
}

proptest! {
    #[test]
    fn prop_append_preserves_order_and_length(
        batches in prop::collection::vec(prop::collection::vec(any::<i32>(), 0..5), 0..8)
    ) {
        let schema = StateSchema::builder().list_channel("items").build();
        let mut state = schema.initialize_state();
        for batch in &batches {
            schema.apply_update(&mut state, "items", json!(batch));
        }

        let expected: Vec<Value> = batches.iter().flatten().map(|n| json!(n)).collect();
        prop_assert_eq!(state.get("items"), Some(&Value::Array(expected)));
    }

    #[test]
    fn prop_sum_matches_integer_total(values in prop::collection::vec(-1000i64..1000, 0..20)) {
        let schema = StateSchema::builder().counter_channel("total").build();
        let mut state = schema.initialize_state();
        for value in &values {
            schema.apply_update(&mut state, "total", json!(value));
        }
        prop_assert_eq!(state.get("total"), Some(&json!(values.iter().sum::<i64>())));
    }
}
