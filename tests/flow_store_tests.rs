use std::io::Write;
use std::sync::Arc;

use botflow::flow::ConditionOperator;
use botflow::{
    load_draft_from_file, BotFlowError, ConnectionKind, ExecutionStatus, FlowBuilder, FlowEngine,
    FlowStore, RecordingAdapter, SessionInfo,
};

fn greeting(text: &str) -> botflow::FlowDraft {
    FlowBuilder::new("greeting")
        .start("start")
        .message("hello", text)
        .connect("start", "hello")
        .build_draft()
}

#[test]
fn update_creates_new_versions() -> anyhow::Result<()> {
    let flows = FlowStore::new();
    let v1 = flows.create("p1", greeting("Hello"))?;
    let v2 = flows.update(&v1.flow_id, greeting("Hi there"))?;

    assert_eq!(v1.version, 1);
    assert_eq!(v2.version, 2);
    assert_eq!(flows.versions(&v1.flow_id)?, vec![1, 2]);
    assert_eq!(flows.latest(&v1.flow_id)?.version, 2);
    // 旧版本保持不变
    assert_eq!(flows.get(&v1.flow_id, 1)?, v1);

    let missing = flows.get(&v1.flow_id, 9);
    assert!(matches!(
        missing,
        Err(BotFlowError::FlowVersionNotFound { version: 9, .. })
    ));
    Ok(())
}

#[test]
fn publish_keeps_one_live_flow_per_project() -> anyhow::Result<()> {
    let flows = FlowStore::new();
    let first = flows.create("p1", greeting("first"))?;
    let second = flows.create("p1", greeting("second"))?;
    let other = flows.create("p2", greeting("other"))?;

    flows.publish(&first.flow_id, 1)?;
    flows.publish(&other.flow_id, 1)?;
    flows.publish(&second.flow_id, 1)?;

    assert_eq!(flows.live_version(&first.flow_id), None);
    assert_eq!(flows.live_version(&second.flow_id), Some(1));
    assert_eq!(flows.live_version(&other.flow_id), Some(1));
    let active = flows
        .active_for_project("p1")
        .ok_or_else(|| anyhow::anyhow!("no live flow"))?;
    assert_eq!(active.flow_id, second.flow_id);
    assert!(matches!(
        flows.live(&first.flow_id),
        Err(BotFlowError::FlowNotPublished(_))
    ));

    flows.unpublish(&second.flow_id)?;
    assert!(flows.active_for_project("p1").is_none());
    Ok(())
}

#[test]
fn publish_rejects_malformed_graph() -> anyhow::Result<()> {
    let flows = FlowStore::new();
    let doc = flows.create(
        "p1",
        FlowBuilder::new("broken")
            .start("start")
            .condition("check", "x", ConditionOperator::Equals, "1")
            .message("yes", "yes")
            .end("done")
            .connect("start", "check")
            .connect_kind("check", "yes", ConnectionKind::True)
            .connect("done", "yes")
            .connect("yes", "ghost")
            .build_draft(),
    )?;

    let Err(BotFlowError::Graph(error)) = flows.publish(&doc.flow_id, 1) else {
        anyhow::bail!("publish should fail graph validation");
    };
    assert_eq!(error.problems.len(), 3);
    assert!(error.problems.iter().any(|p| p.contains("unknown target `ghost`")));
    assert!(error.problems.iter().any(|p| p.contains("condition node `check`")));
    assert!(error.problems.iter().any(|p| p.contains("end node `done`")));
    assert_eq!(flows.live_version(&doc.flow_id), None);
    Ok(())
}

#[test]
fn delete_hides_flow_but_keeps_versions() -> anyhow::Result<()> {
    let flows = FlowStore::new();
    let doc = flows.create("p1", greeting("bye"))?;
    flows.publish(&doc.flow_id, 1)?;
    flows.delete(&doc.flow_id)?;

    assert!(flows.list("p1").is_empty());
    assert!(flows.active_for_project("p1").is_none());
    assert!(matches!(
        flows.latest(&doc.flow_id),
        Err(BotFlowError::FlowNotFound(_))
    ));
    assert_eq!(flows.get(&doc.flow_id, 1)?.version, 1);
    Ok(())
}

#[tokio::test]
async fn execution_stays_on_its_bound_version() -> anyhow::Result<()> {
    let flows = Arc::new(FlowStore::new());
    let adapter = Arc::new(RecordingAdapter::new());
    let engine = FlowEngine::new(flows.clone(), adapter.clone());

    let v1 = flows.create(
        "p1",
        FlowBuilder::new("ask")
            .start("start")
            .input("name", "Name?", "name", botflow::flow::InputRule::Text)
            .message("bye", "Bye v1")
            .connect("start", "name")
            .connect("name", "bye")
            .build_draft(),
    )?;
    flows.publish(&v1.flow_id, 1)?;
    let started = engine
        .start(&v1.flow_id, None, SessionInfo::new("s1"), None)
        .await?;

    let v2 = flows.update(
        &v1.flow_id,
        FlowBuilder::new("ask")
            .start("start")
            .input("name", "Name?", "name", botflow::flow::InputRule::Text)
            .message("bye", "Bye v2")
            .connect("start", "name")
            .connect("name", "bye")
            .build_draft(),
    )?;
    flows.publish(&v1.flow_id, v2.version)?;

    let done = engine
        .advance(&started.state.id, Some(botflow::Trigger::message("Ada")))
        .await?;
    assert_eq!(done.state.status, ExecutionStatus::Completed);
    assert_eq!(done.state.flow_version, 1);
    assert_eq!(adapter.sent_texts(), vec!["Name?", "Bye v1"]);
    Ok(())
}

#[test]
fn loads_editor_json_with_handle_inferred_connections() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            "name": "age gate",
            "nodes": [
                {{"id": "start", "type": "start"}},
                {{"id": "adult?", "type": "condition",
                  "config": {{"variable": "age", "operator": ">=", "value": "18"}}}},
                {{"id": "ok", "type": "message", "config": {{"text": "Welcome"}}}},
                {{"id": "no", "type": "message", "config": {{"text": "Sorry"}}}}
            ],
            "connections": [
                {{"id": "c1", "source": "start", "target": "adult?"}},
                {{"id": "c2", "source": "adult?", "target": "ok", "sourceHandle": "true"}},
                {{"id": "c3", "source": "adult?", "target": "no", "sourceHandle": "false"}}
            ]
        }}"#
    )?;

    let draft = load_draft_from_file(file.path())?;
    assert_eq!(draft.name, "age gate");
    let kinds: Vec<ConnectionKind> = draft
        .connections
        .iter()
        .map(|connection| connection.effective_kind())
        .collect();
    assert_eq!(
        kinds,
        vec![ConnectionKind::Default, ConnectionKind::True, ConnectionKind::False]
    );

    let flows = FlowStore::new();
    let doc = flows.create("p1", draft)?;
    flows.publish(&doc.flow_id, 1)?;
    Ok(())
}

#[test]
fn missing_file_is_a_config_error() {
    let result = load_draft_from_file("/nonexistent/botflow/flow.json");
    assert!(matches!(result, Err(BotFlowError::Config(_))));
}
