//! Human-in-the-loop suspension and resume tests

use serde_json::json;
use stepgraph::checkpoint::MemoryCheckpointer;
use stepgraph::config::{CompileConfig, RunnableConfig};
use stepgraph::edge::{END, START};
use stepgraph::error::GraphError;
use stepgraph::graph::{CompiledGraph, StateGraph};
use stepgraph::input::GraphInput;
use stepgraph::interrupt::{InterruptionMetadata, always, interrupt_when};
use stepgraph::node::FunctionAction;
use stepgraph::state::{StateSchema, StateUpdate, partial};
use stepgraph::stream::{NodeOutput, RunStatus};

fn tracer(name: &'static str) -> FunctionAction {
    FunctionAction::new(move |_| async move { Ok(partial(json!({"trace": name}))) })
}

fn chain() -> StateGraph {
    StateGraph::new(StateSchema::builder().list_channel("trace").channel("approved").build())
        .add_node("a", tracer("a"))
        .add_node("b", tracer("b"))
        .add_node("c", tracer("c"))
        .add_node("d", tracer("d"))
        .add_edge(START, "a")
        .add_edge("a", "b")
        .add_edge("b", "c")
        .add_edge("c", "d")
        .add_edge("d", END)
}

fn with_store(config: CompileConfig) -> CompiledGraph {
    chain().compile_with(config.with_checkpointer(MemoryCheckpointer::new())).unwrap()
}

fn ids(outputs: &[NodeOutput]) -> Vec<&str> {
    outputs.iter().map(|o| o.node_id.as_str()).collect()
}

#[tokio::test]
async fn test_interrupt_after_then_resume() {
    let graph = with_store(CompileConfig::new().with_interrupt_after(&["b"]));
    let config = RunnableConfig::new("review-1");

    let stream = graph.stream(GraphInput::args(StateUpdate::new()), config.clone());
    let (outputs, result) = stream.collect_outputs().await.unwrap();
    assert_eq!(ids(&outputs), vec![START, "a", "b"]);
    let paused = result.interruption().unwrap();
    assert_eq!(paused.node_id, "b");
    assert_eq!(paused.state.get("trace"), Some(&json!(["a", "b"])));

    let snapshot = graph.get_state(&config).await.unwrap().unwrap();
    assert_eq!(snapshot.node_id, "b");
    assert_eq!(snapshot.next_node.as_deref(), Some("c"));

    let (outputs, result) =
        graph.stream(GraphInput::resume(), config.clone()).collect_outputs().await.unwrap();
    assert_eq!(ids(&outputs), vec!["c", "d", END]);
    assert_eq!(result.state().get("trace"), Some(&json!(["a", "b", "c", "d"])));
}

#[tokio::test]
async fn test_interrupt_before_then_resume() {
    let graph = with_store(CompileConfig::new().with_interrupt_before(&["c"]));
    let config = RunnableConfig::new("review-2");

    let mut stream = graph.stream(GraphInput::args(StateUpdate::new()), config.clone());
    let mut seen = Vec::new();
    while let Some(output) = futures::StreamExt::next(&mut stream).await {
        seen.push(output.unwrap().node_id);
    }
    assert_eq!(seen, vec![START, "a", "b"]);
    assert_eq!(stream.status(), RunStatus::Suspended);
    assert_eq!(stream.result().unwrap().interruption().unwrap().node_id, "c");

    // The pause does not re-trigger when the paused node is re-entered.
    let (outputs, result) =
        graph.stream(GraphInput::resume(), config).collect_outputs().await.unwrap();
    assert_eq!(ids(&outputs), vec!["c", "d", END]);
    assert_eq!(result.state().get("trace"), Some(&json!(["a", "b", "c", "d"])));
}

#[tokio::test]
async fn test_interrupt_before_first_node() {
    let graph = with_store(CompileConfig::new().with_interrupt_before(&["a"]));
    let config = RunnableConfig::new("review-3");

    let (outputs, result) = graph
        .stream(GraphInput::args(partial(json!({"approved": false}))), config.clone())
        .collect_outputs()
        .await
        .unwrap();
    assert_eq!(ids(&outputs), vec![START]);
    assert!(result.is_interrupted());

    let snapshot = graph.get_state(&config).await.unwrap().unwrap();
    assert_eq!(snapshot.node_id, START);
    assert_eq!(snapshot.next_node.as_deref(), Some("a"));

    let result = graph.invoke(GraphInput::resume(), config).await.unwrap();
    assert_eq!(result.state().get("approved"), Some(&json!(false)));
    assert_eq!(result.state().get("trace"), Some(&json!(["a", "b", "c", "d"])));
}

#[tokio::test]
async fn test_resume_with_overrides() {
    let graph = StateGraph::with_channels(&["draft", "approved", "published"])
        .add_node_fn("write", |_| async { Ok(partial(json!({"draft": "v1"}))) })
        .add_node_fn("publish", |ctx| async move {
            let approved = ctx.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok(partial(json!({"published": approved})))
        })
        .add_edge(START, "write")
        .add_edge("write", "publish")
        .add_edge("publish", END)
        .compile_with(
            CompileConfig::new()
                .with_checkpointer(MemoryCheckpointer::new())
                .with_interrupt_before(&["publish"]),
        )
        .unwrap();
    let config = RunnableConfig::new("editor");

    let paused = graph.invoke(GraphInput::args(StateUpdate::new()), config.clone()).await.unwrap();
    assert!(paused.is_interrupted());
    let before = graph.get_state_history(&config).await.unwrap().len();

    let done = graph
        .invoke(GraphInput::resume_with(partial(json!({"approved": true}))), config.clone())
        .await
        .unwrap();
    assert_eq!(done.state().get("published"), Some(&json!(true)));
    assert_eq!(done.state().get("draft"), Some(&json!("v1")));

    // The paused tip is edited in place; only the publish step adds a checkpoint.
    let history = graph.get_state_history(&config).await.unwrap();
    assert_eq!(history.len(), before + 1);
    assert_eq!(history[1].state.get("approved"), Some(&json!(true)));
}

#[tokio::test]
async fn test_dynamic_node_interrupt() {
    let guard = interrupt_when(|node_id, state, _config| {
        let amount = state.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
        (amount > 100).then(|| {
            InterruptionMetadata::new(node_id, state.clone()).with_metadata("reason", json!("large"))
        })
    });
    let graph = StateGraph::with_channels(&["amount", "paid"])
        .add_interruptible_node(
            "pay",
            FunctionAction::new(|_| async { Ok(partial(json!({"paid": true}))) }),
            guard,
        )
        .add_edge(START, "pay")
        .add_edge("pay", END)
        .compile_with(CompileConfig::new().with_checkpointer(MemoryCheckpointer::new()))
        .unwrap();

    let small = graph
        .invoke(GraphInput::args(partial(json!({"amount": 5}))), RunnableConfig::new("small"))
        .await
        .unwrap();
    assert_eq!(small.state().get("paid"), Some(&json!(true)));

    let config = RunnableConfig::new("large");
    let large =
        graph.invoke(GraphInput::args(partial(json!({"amount": 500}))), config.clone()).await.unwrap();
    let meta = large.interruption().unwrap();
    assert_eq!(meta.node_id, "pay");
    assert_eq!(meta.get("reason"), Some(&json!("large")));
    assert!(!meta.state.contains_key("paid"));

    let resumed = graph.invoke(GraphInput::resume(), config).await.unwrap();
    assert_eq!(resumed.state().get("paid"), Some(&json!(true)));
}

#[tokio::test]
async fn test_resumed_node_knows_it_is_resumed() {
    let graph = StateGraph::with_channels(&["resumed"])
        .add_node_fn("check", |ctx| async move {
            Ok(partial(json!({"resumed": ctx.config.is_resume()})))
        })
        .add_edge(START, "check")
        .add_edge("check", END)
        .compile_with(
            CompileConfig::new()
                .with_checkpointer(MemoryCheckpointer::new())
                .with_interrupt_before(&["check"]),
        )
        .unwrap();
    let config = RunnableConfig::new("t");

    graph.invoke(GraphInput::args(StateUpdate::new()), config.clone()).await.unwrap();
    let result = graph.invoke(GraphInput::resume(), config).await.unwrap();
    assert_eq!(result.state().get("resumed"), Some(&json!(true)));
}

#[tokio::test]
async fn test_edge_interrupt_leaves_edge_pending() {
    let graph = chain()
        .add_interruptible_edge("b", always())
        .compile_with(CompileConfig::new().with_checkpointer(MemoryCheckpointer::new()))
        .unwrap();
    let config = RunnableConfig::new("edge");

    let (outputs, result) = graph
        .stream(GraphInput::args(StateUpdate::new()), config.clone())
        .collect_outputs()
        .await
        .unwrap();
    assert_eq!(ids(&outputs), vec![START, "a", "b"]);
    assert_eq!(outputs[2].next_node, None);
    assert_eq!(result.interruption().unwrap().node_id, "b");

    let snapshot = graph.get_state(&config).await.unwrap().unwrap();
    assert_eq!(snapshot.node_id, "b");
    assert_eq!(snapshot.next_node, None);

    let (outputs, _) = graph.stream(GraphInput::resume(), config).collect_outputs().await.unwrap();
    assert_eq!(ids(&outputs), vec!["c", "d", END]);
}

#[tokio::test]
async fn test_interrupt_before_edge_lets_resume_change_the_route() {
    let graph = StateGraph::with_channels(&["route"])
        .add_node_fn("decide", |_| async { Ok(partial(json!({"route": "left"}))) })
        .add_node_fn("left", |_| async { Ok(StateUpdate::new()) })
        .add_node_fn("right", |_| async { Ok(StateUpdate::new()) })
        .add_edge(START, "decide")
        .add_conditional_edges(
            "decide",
            stepgraph::Router::by_field("route"),
            [("left", "left"), ("right", "right")],
        )
        .add_edge("left", END)
        .add_edge("right", END)
        .compile_with(
            CompileConfig::new()
                .with_checkpointer(MemoryCheckpointer::new())
                .with_interrupt_after(&["decide"])
                .with_interrupt_before_edge(true),
        )
        .unwrap();
    let config = RunnableConfig::new("route");

    let (outputs, result) = graph
        .stream(GraphInput::args(StateUpdate::new()), config.clone())
        .collect_outputs()
        .await
        .unwrap();
    assert_eq!(ids(&outputs), vec![START, "decide"]);
    assert!(result.is_interrupted());
    assert_eq!(graph.get_state(&config).await.unwrap().unwrap().next_node, None);

    let (outputs, _) = graph
        .stream(GraphInput::resume_with(partial(json!({"route": "right"}))), config.clone())
        .collect_outputs()
        .await
        .unwrap();
    assert_eq!(ids(&outputs), vec!["right", END]);

    // The pending edge was resolved onto the paused checkpoint.
    let history = graph.get_state_history(&config).await.unwrap();
    assert_eq!(history[1].node_id, "decide");
    assert_eq!(history[1].next_node.as_deref(), Some("right"));
}

#[tokio::test]
async fn test_resume_without_checkpoint() {
    let graph = with_store(CompileConfig::new());
    let err = graph.invoke(GraphInput::resume(), RunnableConfig::new("fresh")).await.unwrap_err();
    assert!(matches!(err, GraphError::NothingToResume(thread) if thread == "fresh"));

    let volatile = chain().compile().unwrap();
    let err = volatile.invoke(GraphInput::resume(), RunnableConfig::new("fresh")).await.unwrap_err();
    assert!(matches!(err, GraphError::NothingToResume(_)));
}

#[tokio::test]
async fn test_completed_thread_resumes_to_end() {
    let graph = with_store(CompileConfig::new());
    let config = RunnableConfig::new("done");
    graph.invoke(GraphInput::args(StateUpdate::new()), config.clone()).await.unwrap();

    let (outputs, result) =
        graph.stream(GraphInput::resume(), config).collect_outputs().await.unwrap();
    assert_eq!(ids(&outputs), vec![END]);
    assert_eq!(result.state().get("trace"), Some(&json!(["a", "b", "c", "d"])));
}
