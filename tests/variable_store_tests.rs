use std::collections::BTreeMap;
use std::sync::Arc;

use botflow::flow::{SessionConfig, SessionOperation};
use botflow::state::VariableKey;
use botflow::{
    BotFlowError, ExecutionStatus, FlowBuilder, FlowEngine, FlowStore, FlowVariable, MemoryStore,
    RecordingAdapter, ScopedVariables, SessionInfo, VariableScope, VariableStore, VariableView,
};

#[tokio::test]
async fn concurrent_increments_are_not_lost() -> anyhow::Result<()> {
    let store: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
    let counter = ScopedVariables::flow(store.clone(), "flow-1");

    let mut handles = Vec::new();
    for _ in 0..50 {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move { counter.increment("hits", 1.0).await }));
    }
    for handle in handles {
        handle.await??;
    }
    assert_eq!(counter.get("hits").await?.as_deref(), Some("50"));

    let value = counter.increment("hits", -0.5).await?;
    assert_eq!(value, "49.5");
    Ok(())
}

#[tokio::test]
async fn increment_rejects_non_numeric_value() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let key = VariableKey::session("exec-1", "name");
    store.set(&key, "Ada".to_string()).await?;
    let result = store.increment(&key, 1.0).await;
    assert!(matches!(result, Err(BotFlowError::Validation(_))));
    assert_eq!(store.get(&key).await?.as_deref(), Some("Ada"));
    Ok(())
}

#[tokio::test]
async fn scopes_are_isolated() -> anyhow::Result<()> {
    let store: Arc<dyn VariableStore> = Arc::new(MemoryStore::new());
    let first = ScopedVariables::session(store.clone(), "exec-1");
    let second = ScopedVariables::session(store.clone(), "exec-2");
    let shared = ScopedVariables::flow(store.clone(), "exec-1");

    first.set("step", "a").await?;
    second.set("step", "b").await?;
    shared.set("step", "flow").await?;

    assert_eq!(first.get("step").await?.as_deref(), Some("a"));
    assert_eq!(second.get("step").await?.as_deref(), Some("b"));
    assert_eq!(shared.get("step").await?.as_deref(), Some("flow"));

    assert_eq!(first.clear().await?, 1);
    assert_eq!(first.get("step").await?, None);
    assert_eq!(shared.get("step").await?.as_deref(), Some("flow"));

    assert!(shared.set_if_absent("seeded", "1").await?);
    assert!(!shared.set_if_absent("seeded", "2").await?);
    assert_eq!(shared.get("seeded").await?.as_deref(), Some("1"));
    Ok(())
}

#[test]
fn view_resolves_session_before_flow() {
    let session = BTreeMap::from([("name".to_string(), "Ada".to_string())]);
    let flow = BTreeMap::from([
        ("name".to_string(), "Shared".to_string()),
        ("total".to_string(), "7".to_string()),
    ]);
    let view = VariableView::new(session, flow);

    assert_eq!(view.render("Hi {{name}}"), "Hi Ada");
    assert_eq!(view.render("{{flow.name}} / {{ total }}"), "Shared / 7");
    assert_eq!(view.render("[{{missing}}]"), "[]");
    assert_eq!(view.render("open {{name"), "open {{name");
}

#[tokio::test]
async fn flow_variables_are_shared_across_executions() -> anyhow::Result<()> {
    let flows = Arc::new(FlowStore::new());
    let adapter = Arc::new(RecordingAdapter::new());
    let engine = FlowEngine::new(flows.clone(), adapter.clone());
    let doc = flows.create(
        "p1",
        FlowBuilder::new("counter")
            .start("start")
            .session_increment("count", VariableScope::Flow, "visitors")
            .message("report", "Visitor #{{visitors}}, {{greeting}}")
            .variable(FlowVariable::new("visitors", VariableScope::Flow).with_default("100"))
            .variable(FlowVariable::new("greeting", VariableScope::Session).with_default("welcome"))
            .connect("start", "count")
            .connect("count", "report")
            .build_draft(),
    )?;

    for session in ["s1", "s2"] {
        let outcome = engine
            .start(&doc.flow_id, Some(1), SessionInfo::new(session), None)
            .await?;
        assert_eq!(outcome.state.status, ExecutionStatus::Completed);
    }
    assert_eq!(
        adapter.sent_texts(),
        vec!["Visitor #101, welcome", "Visitor #102, welcome"]
    );
    let visitors = engine.flow_variables(&doc.flow_id).get("visitors").await?;
    assert_eq!(visitors.as_deref(), Some("102"));
    Ok(())
}

#[tokio::test]
async fn session_node_operations() -> anyhow::Result<()> {
    let flows = Arc::new(FlowStore::new());
    let adapter = Arc::new(RecordingAdapter::new());
    let engine = FlowEngine::new(flows.clone(), adapter.clone());
    let op = |operation, scope, key: &str, value: Option<&str>, target: Option<&str>| SessionConfig {
        operation,
        scope,
        key: key.to_string(),
        value: value.map(str::to_string),
        amount: None,
        target: target.map(str::to_string),
    };
    let doc = flows.create(
        "p1",
        FlowBuilder::new("ops")
            .start("start")
            .session_set("set", VariableScope::Flow, "plan", "pro-{{tier}}")
            .session("get", op(SessionOperation::Get, VariableScope::Flow, "plan", None, Some("my_plan")))
            .session("dec", op(SessionOperation::Decrement, VariableScope::Session, "credits", None, None))
            .session("del", op(SessionOperation::Delete, VariableScope::Session, "tier", None, None))
            .message("report", "{{my_plan}} {{credits}} [{{tier}}]")
            .variable(FlowVariable::new("tier", VariableScope::Session).with_default("gold"))
            .variable(FlowVariable::new("credits", VariableScope::Session).with_default("3"))
            .connect("start", "set")
            .connect("set", "get")
            .connect("get", "dec")
            .connect("dec", "del")
            .connect("del", "report")
            .build_draft(),
    )?;

    let outcome = engine
        .start(&doc.flow_id, Some(1), SessionInfo::new("s1"), None)
        .await?;
    assert_eq!(outcome.state.status, ExecutionStatus::Completed);
    assert_eq!(adapter.sent_texts(), vec!["pro-gold 2 []"]);
    Ok(())
}

#[tokio::test]
async fn non_numeric_increment_fails_execution() -> anyhow::Result<()> {
    let flows = Arc::new(FlowStore::new());
    let engine = FlowEngine::new(flows.clone(), Arc::new(RecordingAdapter::new()));
    let doc = flows.create(
        "p1",
        FlowBuilder::new("bad counter")
            .start("start")
            .session_increment("count", VariableScope::Session, "name")
            .variable(FlowVariable::new("name", VariableScope::Session).with_default("Ada"))
            .connect("start", "count")
            .build_draft(),
    )?;
    let outcome = engine
        .start(&doc.flow_id, Some(1), SessionInfo::new("s1"), None)
        .await?;
    assert_eq!(outcome.state.status, ExecutionStatus::Failed);
    assert!(outcome
        .state
        .error
        .as_deref()
        .is_some_and(|error| error.contains("not numeric")));
    Ok(())
}
