use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use botflow::flow::InputRule;
use botflow::{
    EngineConfig, ExecutionFilter, ExecutionMonitor, ExecutionProjection, ExecutionStatus,
    ExecutionSubscription, FlowBuilder, FlowEngine, FlowStore, MonitorEvent, RecordingAdapter,
    SessionInfo, Trigger,
};

fn setup(config: EngineConfig) -> anyhow::Result<(ExecutionMonitor, String)> {
    let flows = Arc::new(FlowStore::new());
    let engine =
        FlowEngine::new(flows.clone(), Arc::new(RecordingAdapter::new())).with_config(config);
    let doc = flows.create(
        "p1",
        FlowBuilder::new("survey")
            .start("start")
            .message("hello", "Hello")
            .input("age", "Age?", "age", InputRule::Number)
            .message("thanks", "Thanks")
            .end("end")
            .connect("start", "hello")
            .connect("hello", "age")
            .connect("age", "thanks")
            .connect("thanks", "end")
            .build_draft(),
    )?;
    Ok((ExecutionMonitor::new(engine), doc.flow_id.clone()))
}

async fn drain(subscription: &mut ExecutionSubscription) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), subscription.next_event()).await
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn snapshot_then_incremental_events() -> anyhow::Result<()> {
    let (monitor, flow_id) = setup(EngineConfig::default())?;
    let engine = monitor.engine().clone();
    let started = engine
        .start(&flow_id, Some(1), SessionInfo::new("s1"), None)
        .await?;
    let id = started.state.id.clone();

    let mut subscription = monitor.subscribe(&id).await?;
    let first = subscription
        .next_event()
        .await
        .ok_or_else(|| anyhow::anyhow!("stream closed"))?;
    let MonitorEvent::Snapshot { execution, steps } = &first else {
        anyhow::bail!("first event must be a snapshot, got {}", first.kind());
    };
    assert_eq!(execution.status, ExecutionStatus::Waiting);
    assert_eq!(steps.len(), 3);

    engine.advance(&id, Some(Trigger::message("42"))).await?;
    let events = drain(&mut subscription).await;
    let kinds: Vec<&str> = events.iter().map(MonitorEvent::kind).collect();
    assert!(kinds.contains(&"status"));
    assert!(kinds.contains(&"logs"));
    assert!(kinds.contains(&"execution"));
    assert!(events.iter().all(|event| event.execution_id() == id));

    let last_status = events.iter().rev().find_map(|event| match event {
        MonitorEvent::Status { status, .. } => Some(*status),
        _ => None,
    });
    assert_eq!(last_status, Some(ExecutionStatus::Completed));

    let mut projection = ExecutionProjection::new();
    projection.apply(&first)?;
    for event in &events {
        projection.apply(event)?;
    }
    let stored = engine.executions().get(&id).await?;
    let stored_steps = engine.executions().steps(&id).await?;
    assert_eq!(projection.execution(), Some(&stored));
    assert_eq!(projection.steps(), stored_steps.iter().collect::<Vec<_>>());

    // 重复投递不改变投影结果
    let before = projection.clone();
    for event in std::iter::once(&first).chain(events.iter()) {
        projection.apply(event)?;
    }
    assert_eq!(projection.execution(), before.execution());
    assert_eq!(projection.steps(), before.steps());
    Ok(())
}

#[tokio::test]
async fn lagging_subscriber_gets_fresh_snapshot() -> anyhow::Result<()> {
    let config = EngineConfig {
        event_buffer: 2,
        logs_batch_size: 1,
        ..EngineConfig::default()
    };
    let (monitor, flow_id) = setup(config)?;
    let engine = monitor.engine().clone();
    let started = engine
        .start(&flow_id, Some(1), SessionInfo::new("s1"), None)
        .await?;
    let id = started.state.id.clone();

    let mut subscription = monitor.subscribe(&id).await?;
    let initial = subscription.next_event().await;
    assert!(matches!(initial, Some(MonitorEvent::Snapshot { .. })));

    engine.advance(&id, Some(Trigger::message("7"))).await?;
    let resync = subscription
        .next_event()
        .await
        .ok_or_else(|| anyhow::anyhow!("stream closed"))?;
    let MonitorEvent::Snapshot { execution, .. } = resync else {
        anyhow::bail!("expected a resync snapshot, got {}", resync.kind());
    };
    assert_eq!(execution.status, ExecutionStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn stream_reports_cancel_and_detail_lists_history() -> anyhow::Result<()> {
    let (monitor, flow_id) = setup(EngineConfig::default())?;
    let engine = monitor.engine().clone();
    let started = engine
        .start(&flow_id, Some(1), SessionInfo::new("s1").with_user("u1"), None)
        .await?;
    let id = started.state.id.clone();

    let mut stream = Box::pin(monitor.subscribe(&id).await?.into_stream());
    let first = stream.next().await;
    assert!(matches!(first, Some(MonitorEvent::Snapshot { .. })));

    monitor.cancel(&id).await?;
    let mut cancelled = None;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
        if let MonitorEvent::Status { status, .. } = event {
            cancelled = Some(status);
            break;
        }
    }
    assert_eq!(cancelled, Some(ExecutionStatus::Cancelled));

    let detail = monitor.execution_detail(&id).await?;
    assert_eq!(detail.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(detail.steps.len(), 3);
    assert!(detail.runs.is_empty());
    assert!(detail.session_variables.is_empty());

    let restarted = monitor.restart(&id, false).await?;
    assert_eq!(restarted.state.status, ExecutionStatus::Waiting);
    let detail = monitor.execution_detail(&id).await?;
    assert_eq!(detail.runs.len(), 1);
    assert_eq!(detail.steps.len(), 6);
    Ok(())
}

#[tokio::test]
async fn list_filters_by_status_and_search() -> anyhow::Result<()> {
    let (monitor, flow_id) = setup(EngineConfig::default())?;
    let engine = monitor.engine().clone();
    let mut all_events = engine.hub().subscribe_all();

    let waiting = engine
        .start(&flow_id, Some(1), SessionInfo::new("alice"), None)
        .await?;
    let done = engine
        .start(&flow_id, Some(1), SessionInfo::new("bob"), None)
        .await?;
    engine
        .advance(&done.state.id, Some(Trigger::message("30")))
        .await?;

    let completed = monitor
        .list_executions(&ExecutionFilter::default().with_status(ExecutionStatus::Completed))
        .await?;
    assert_eq!(completed.total, 1);
    assert_eq!(completed.items[0].id, done.state.id);

    let by_session = monitor
        .list_executions(&ExecutionFilter::default().with_search("ALICE"))
        .await?;
    assert_eq!(by_session.total, 1);
    assert_eq!(by_session.items[0].id, waiting.state.id);

    let paged = monitor
        .list_executions(&ExecutionFilter::default().with_page(2, 1))
        .await?;
    assert_eq!(paged.total, 2);
    assert_eq!(paged.items.len(), 1);

    let mut seen = std::collections::HashSet::new();
    while let Ok(event) = all_events.try_recv() {
        seen.insert(event.execution_id().to_string());
    }
    assert!(seen.contains(&waiting.state.id));
    assert!(seen.contains(&done.state.id));
    Ok(())
}
