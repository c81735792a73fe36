use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::processor::Run;
use super::recorder::Recorder;
use super::slots::{ExecutionSlot, ExecutionSlots};
use super::store::{ExecutionStore, MemoryExecutionStore};
use super::types::{
    AdvanceOutcome, ExecutionState, ExecutionStatus, SessionInfo, StepStatus, Trigger,
    TriggerOutcome,
};
use crate::actions::ActionAdapter;
use crate::config::EngineConfig;
use crate::error::{BotFlowError, Result};
use crate::flow::{validate_graph, FlowDocument, FlowStore, NodeConfig};
use crate::monitor::EventHub;
use crate::runtime::handlers::match_command;
use crate::state::{MemoryStore, ScopedVariables, VariableStore};

/// Flow 执行引擎
///
/// 多个执行可以并发推进；同一个执行的 `advance`/`restart`/超时检查通过槽位锁串行化，
/// 排队的触发器按到达顺序应用。取消不排队，直接抢占
#[derive(Clone)]
pub struct FlowEngine {
    config: EngineConfig,
    flows: Arc<FlowStore>,
    variables: Arc<dyn VariableStore>,
    executions: Arc<dyn ExecutionStore>,
    adapter: Arc<dyn ActionAdapter>,
    hub: EventHub,
    slots: Arc<ExecutionSlots>,
}

impl FlowEngine {
    pub fn new(flows: Arc<FlowStore>, adapter: Arc<dyn ActionAdapter>) -> Self {
        let config = EngineConfig::default();
        Self {
            hub: EventHub::new(config.event_buffer),
            config,
            flows,
            variables: Arc::new(MemoryStore::new()),
            executions: Arc::new(MemoryExecutionStore::new()),
            adapter,
            slots: Arc::new(ExecutionSlots::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        if config.event_buffer != self.config.event_buffer {
            self.hub = EventHub::new(config.event_buffer);
        }
        self.config = config;
        self
    }

    pub fn with_variable_store(mut self, store: Arc<dyn VariableStore>) -> Self {
        self.variables = store;
        self
    }

    pub fn with_execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.executions = store;
        self
    }

    pub fn with_event_hub(mut self, hub: EventHub) -> Self {
        self.hub = hub;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> &Arc<FlowStore> {
        &self.flows
    }

    pub fn variables(&self) -> &Arc<dyn VariableStore> {
        &self.variables
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        &self.executions
    }

    pub fn adapter(&self) -> &Arc<dyn ActionAdapter> {
        &self.adapter
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn session_variables(&self, execution_id: &str) -> ScopedVariables {
        ScopedVariables::session(self.variables.clone(), execution_id)
    }

    pub fn flow_variables(&self, flow_id: &str) -> ScopedVariables {
        ScopedVariables::flow(self.variables.clone(), flow_id)
    }

    /// 为会话启动一个新执行
    ///
    /// `version` 为空时绑定已发布的版本；执行在整个生命周期内使用这个版本
    #[instrument(skip(self, session, trigger), fields(session_id = %session.session_id))]
    pub async fn start(
        &self,
        flow_id: &str,
        version: Option<u32>,
        session: SessionInfo,
        trigger: Option<Trigger>,
    ) -> Result<AdvanceOutcome> {
        let doc = match version {
            Some(version) => self.flows.get(flow_id, version)?,
            None => self.flows.live(flow_id)?,
        };
        self.start_document(doc, session, trigger).await
    }

    /// 以指定文档启动执行，文档必须通过图校验
    pub async fn start_document(
        &self,
        doc: Arc<FlowDocument>,
        session: SessionInfo,
        trigger: Option<Trigger>,
    ) -> Result<AdvanceOutcome> {
        validate_graph(&doc)?;
        let start = doc
            .start_node()
            .ok_or_else(|| BotFlowError::Validation(format!("flow `{}` has no start node", doc.flow_id)))?
            .clone();

        let outcome = match (&trigger, &start.config) {
            (None, _) => TriggerOutcome::Ignored,
            (Some(trigger), NodeConfig::Start(config)) => match &config.command {
                Some(command) => {
                    let matched = trigger
                        .text()
                        .and_then(|text| match_command(command, &config.aliases, false, text));
                    if matched.is_none() {
                        return Err(BotFlowError::Validation(format!(
                            "trigger does not match start command `{command}`"
                        )));
                    }
                    TriggerOutcome::Consumed
                }
                None => TriggerOutcome::Consumed,
            },
            (Some(_), _) => TriggerOutcome::Consumed,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let slot = self.slots.lease(&id);
        let _guard = slot.lock().await;

        let state = ExecutionState::new(id.clone(), &doc, &start.id, &session);
        let mut run = Run::new(self, doc.clone(), slot.handle(), state).with_trigger(trigger);
        run.insert().await?;
        run.seed_variables().await?;
        info!(
            execution_id = %id,
            flow_id = %doc.flow_id,
            version = doc.version,
            "execution created"
        );
        let state = run.drive(start.id.clone()).await?;
        Ok(AdvanceOutcome {
            state,
            trigger: outcome,
        })
    }

    /// 把入站触发器路由到会话的执行
    ///
    /// 会话在项目当前发布的 flow 上有未结束的执行时推进它；否则触发器匹配开始节点时新建执行。
    /// 项目没有发布的 flow 或触发器无法开始执行时返回 `None`
    #[instrument(skip(self, session, trigger), fields(session_id = %session.session_id))]
    pub async fn handle_trigger(
        &self,
        project_id: &str,
        session: SessionInfo,
        trigger: Trigger,
    ) -> Result<Option<AdvanceOutcome>> {
        let Some(doc) = self.flows.active_for_project(project_id) else {
            debug!(project_id, "no live flow for project");
            return Ok(None);
        };
        if let Some(open) = self
            .executions
            .find_open(&doc.flow_id, &session.session_id)
            .await?
        {
            return self.advance(&open.id, Some(trigger)).await.map(Some);
        }

        let starts = match doc.start_node().map(|node| &node.config) {
            Some(NodeConfig::Start(config)) => match &config.command {
                Some(command) => trigger
                    .text()
                    .and_then(|text| match_command(command, &config.aliases, false, text))
                    .is_some(),
                None => trigger.text().is_some(),
            },
            _ => false,
        };
        if !starts {
            debug!(project_id, "trigger does not start the live flow");
            return Ok(None);
        }
        self.start_document(doc, session, Some(trigger))
            .await
            .map(Some)
    }

    /// 推进执行，同一执行上的并发调用按到达顺序排队
    #[instrument(skip(self, trigger))]
    pub async fn advance(&self, execution_id: &str, trigger: Option<Trigger>) -> Result<AdvanceOutcome> {
        let slot = self.slots.lease(execution_id);
        let _guard = slot.lock().await;
        self.advance_locked(execution_id, slot.handle(), trigger).await
    }

    /// 推进执行；执行正忙时立即返回 `Concurrency` 错误而不排队
    #[instrument(skip(self, trigger))]
    pub async fn try_advance(&self, execution_id: &str, trigger: Option<Trigger>) -> Result<AdvanceOutcome> {
        let slot = self.slots.lease(execution_id);
        let Some(_guard) = slot.try_lock() else {
            return Err(BotFlowError::Concurrency(execution_id.to_string()));
        };
        self.advance_locked(execution_id, slot.handle(), trigger).await
    }

    async fn advance_locked(
        &self,
        execution_id: &str,
        slot: Arc<ExecutionSlot>,
        trigger: Option<Trigger>,
    ) -> Result<AdvanceOutcome> {
        let state = self.executions.get(execution_id).await?;
        if state.is_terminal() {
            return Err(BotFlowError::ExecutionClosed {
                id: state.id,
                status: state.status.to_string(),
            });
        }
        let doc = self.flows.get(&state.flow_id, state.flow_version)?;
        let (state, trigger) = Run::resume(self, doc, slot, state).advance(trigger).await?;
        if trigger == TriggerOutcome::Rejected {
            warn!(execution_id, status = %state.status, "trigger rejected");
        }
        Ok(AdvanceOutcome { state, trigger })
    }

    /// 运维取消，任何状态下都接受
    ///
    /// 进行中的推进会在下一次写入时被拒绝并停止；已结束的执行原样返回
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionState> {
        let before = self.executions.get(execution_id).await?;
        let slot = self.slots.lease(execution_id);
        slot.cancel();

        let (state, changed) = self.executions.mark_cancelled(execution_id).await?;
        if !changed {
            debug!(execution_id, status = %state.status, "execution already finished");
            return Ok(state);
        }
        let closed = self
            .executions
            .close_open_steps(execution_id, StepStatus::Skipped, "cancelled by operator")
            .await?;

        let mut recorder = Recorder::new(
            self.executions.clone(),
            self.hub.clone(),
            self.config.logs_batch_size,
        )
        .with_baseline(&before);
        recorder.record(closed);
        recorder.flush();
        recorder.announce(state.clone())?;
        info!(execution_id, "execution cancelled");
        Ok(state)
    }

    /// 从开始节点重新执行
    ///
    /// 沿用原来的 flow 版本和会话；上一轮状态被归档，步骤序号接着上一轮继续。
    /// `reset_variables` 只清空 session 变量，flow 变量不受影响
    #[instrument(skip(self))]
    pub async fn restart(&self, execution_id: &str, reset_variables: bool) -> Result<AdvanceOutcome> {
        let slot = self.slots.lease(execution_id);
        let _guard = slot.lock().await;

        let previous = self.executions.get(execution_id).await?;
        let doc = self.flows.get(&previous.flow_id, previous.flow_version)?;
        let start = doc
            .start_node()
            .ok_or_else(|| BotFlowError::Validation(format!("flow `{}` has no start node", doc.flow_id)))?
            .id
            .clone();

        let closed = self
            .executions
            .close_open_steps(execution_id, StepStatus::Skipped, "superseded by restart")
            .await?;
        self.executions.archive_run(&previous).await?;
        slot.reset();

        let session = self.session_variables(execution_id);
        if reset_variables {
            let cleared = session.clear().await?;
            debug!(execution_id, cleared, "session variables cleared");
        }

        let mut next = previous.clone();
        let now = Utc::now();
        next.run = previous.run + 1;
        next.run_base_step = previous.step_count;
        next.status = ExecutionStatus::Running;
        next.current_node_id = start.clone();
        next.clear_wait();
        next.input_attempts = 0;
        next.error = None;
        next.started_at = now;
        next.finished_at = None;

        let mut run = Run::resume(self, doc, slot.handle(), previous);
        run.state = next;
        run.record(closed);
        // 与取消竞争失败时存储拒绝写入，取消结果保留
        run.save().await?;
        run.seed_variables().await?;
        info!(
            execution_id,
            run = run.state.run,
            reset_variables,
            "execution restarted"
        );
        let state = run.drive(start).await?;
        Ok(AdvanceOutcome {
            state,
            trigger: TriggerOutcome::Ignored,
        })
    }

    /// 把超过等待期限的执行标记为 failed，返回被处理的执行
    ///
    /// 单个执行处理失败只记录日志，不影响其余执行
    #[instrument(skip(self))]
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionState>> {
        let mut expired = Vec::new();
        for candidate in self.executions.waiting().await? {
            if !candidate.wait_deadline.is_some_and(|deadline| deadline <= now) {
                continue;
            }
            match self.expire_one(&candidate.id, now).await {
                Ok(Some(state)) => expired.push(state),
                Ok(None) => {}
                Err(error) => {
                    warn!(execution_id = %candidate.id, %error, "failed to expire waiting execution");
                }
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired waiting executions");
        }
        Ok(expired)
    }

    async fn expire_one(&self, execution_id: &str, now: DateTime<Utc>) -> Result<Option<ExecutionState>> {
        let slot = self.slots.lease(execution_id);
        let _guard = slot.lock().await;
        let state = self.executions.get(execution_id).await?;
        let still_due = state.status == ExecutionStatus::Waiting
            && state.wait_deadline.is_some_and(|deadline| deadline <= now);
        if !still_due {
            return Ok(None);
        }
        let doc = self.flows.get(&state.flow_id, state.flow_version)?;
        let state = Run::resume(self, doc, slot.handle(), state).expire().await?;
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::RecordingAdapter;
    use crate::flow::{FlowBuilder, InputConfig};

    fn engine() -> (FlowEngine, Arc<FlowStore>) {
        let flows = Arc::new(FlowStore::new());
        let engine = FlowEngine::new(flows.clone(), Arc::new(RecordingAdapter::new()));
        (engine, flows)
    }

    fn pin_flow() -> FlowBuilder {
        let mut builder = FlowBuilder::new("pin");
        builder
            .start("start")
            .input_config(
                "pin",
                InputConfig {
                    prompt: "PIN?".to_string(),
                    variable: "pin".to_string(),
                    timeout_secs: Some(0),
                    ..InputConfig::default()
                },
            )
            .connect("start", "pin");
        builder
    }

    #[tokio::test]
    async fn test_slots_released_after_each_call() {
        let (engine, flows) = engine();
        let doc = flows
            .create(
                "p1",
                FlowBuilder::new("bye")
                    .start("start")
                    .end("done")
                    .connect("start", "done")
                    .build_draft(),
            )
            .unwrap();
        for n in 0..100 {
            let outcome = engine
                .start(&doc.flow_id, Some(1), SessionInfo::new(format!("s{n}")), None)
                .await
                .unwrap();
            assert_eq!(outcome.state.status, ExecutionStatus::Completed);
        }
        assert!(engine.slots.is_empty());

        assert!(matches!(
            engine.restart("missing", false).await,
            Err(BotFlowError::ExecutionNotFound(_))
        ));
        assert!(engine.advance("missing", None).await.is_err());
        assert!(engine.cancel("missing").await.is_err());
        assert!(engine.slots.is_empty());

        let waiting = flows.create("p1", pin_flow().build_draft()).unwrap();
        let started = engine
            .start(&waiting.flow_id, Some(1), SessionInfo::new("w"), None)
            .await
            .unwrap();
        assert_eq!(started.state.status, ExecutionStatus::Waiting);
        engine.cancel(&started.state.id).await.unwrap();
        assert!(engine.slots.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_sweep_skips_broken_execution() {
        let (engine, flows) = engine();
        // 未登记到 FlowStore 的文档，超时处理时找不到对应版本
        let orphan = Arc::new(pin_flow().build_document("orphan-flow", "p1"));
        let broken = engine
            .start_document(orphan, SessionInfo::new("a"), None)
            .await
            .unwrap();
        let doc = flows.create("p1", pin_flow().build_draft()).unwrap();
        let healthy = engine
            .start(&doc.flow_id, Some(1), SessionInfo::new("b"), None)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let expired = engine.check_timeouts(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, healthy.state.id);

        let broken = engine.executions().get(&broken.state.id).await.unwrap();
        assert_eq!(broken.status, ExecutionStatus::Waiting);
        let healthy = engine.executions().get(&healthy.state.id).await.unwrap();
        assert_eq!(healthy.status, ExecutionStatus::Failed);
        assert!(engine.slots.is_empty());
    }
}
