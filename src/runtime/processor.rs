use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::executor::FlowEngine;
use super::handlers::{NodeOutcome, NodeResult, Reply};
use super::recorder::Recorder;
use super::slots::ExecutionSlot;
use super::types::{
    ExecutionState, ExecutionStatus, ExecutionStep, StepStatus, Trigger, TriggerOutcome,
};
use crate::error::{BotFlowError, Result};
use crate::flow::{ConnectionKind, FlowDocument, MiddlewareConfig, Node, NodeConfig};
use crate::state::{ScopedVariables, VariableScope, VariableView};

/// 一次推进过程
///
/// 持有执行状态的本地副本，所有写入都经由 [`Recorder`] 落到执行存储并发布事件。
/// 调用方必须先拿到该执行的槽位锁
pub(crate) struct Run<'e> {
    pub(super) engine: &'e FlowEngine,
    pub(super) doc: Arc<FlowDocument>,
    slot: Arc<ExecutionSlot>,
    pub(super) state: ExecutionState,
    pub(super) recorder: Recorder,
    pub(super) session_vars: ScopedVariables,
    pub(super) flow_vars: ScopedVariables,
    pub(super) trigger: Option<Trigger>,
}

/// 存储层拒绝写入说明并发的取消或重启已经生效
fn lost_race(error: &BotFlowError) -> bool {
    matches!(
        error,
        BotFlowError::ExecutionClosed { .. } | BotFlowError::InvalidTransition { .. }
    )
}

impl<'e> Run<'e> {
    /// 新执行，状态尚未写入存储
    pub fn new(
        engine: &'e FlowEngine,
        doc: Arc<FlowDocument>,
        slot: Arc<ExecutionSlot>,
        state: ExecutionState,
    ) -> Self {
        let recorder = Recorder::new(
            engine.executions().clone(),
            engine.hub().clone(),
            engine.config().logs_batch_size,
        );
        Self::with_recorder(engine, doc, slot, state, recorder)
    }

    /// 已存储的执行
    pub fn resume(
        engine: &'e FlowEngine,
        doc: Arc<FlowDocument>,
        slot: Arc<ExecutionSlot>,
        state: ExecutionState,
    ) -> Self {
        let recorder = Recorder::new(
            engine.executions().clone(),
            engine.hub().clone(),
            engine.config().logs_batch_size,
        )
        .with_baseline(&state);
        Self::with_recorder(engine, doc, slot, state, recorder)
    }

    fn with_recorder(
        engine: &'e FlowEngine,
        doc: Arc<FlowDocument>,
        slot: Arc<ExecutionSlot>,
        state: ExecutionState,
        recorder: Recorder,
    ) -> Self {
        let session_vars = engine.session_variables(&state.id);
        let flow_vars = engine.flow_variables(&state.flow_id);
        Self {
            engine,
            doc,
            slot,
            state,
            recorder,
            session_vars,
            flow_vars,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: Option<Trigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub async fn insert(&mut self) -> Result<()> {
        self.recorder.insert(&mut self.state).await
    }

    pub async fn save(&mut self) -> Result<()> {
        self.recorder.save(&mut self.state).await
    }

    pub fn record(&mut self, steps: Vec<ExecutionStep>) {
        self.recorder.record(steps);
    }

    /// 写入声明变量的默认值，已存在的值保持不变
    pub async fn seed_variables(&mut self) -> Result<()> {
        for variable in self.doc.declared(VariableScope::Flow) {
            if let Some(default) = &variable.default {
                self.flow_vars
                    .set_if_absent(&variable.name, default.clone())
                    .await?;
            }
        }
        for variable in self.doc.declared(VariableScope::Session) {
            if let Some(default) = &variable.default {
                self.session_vars
                    .set_if_absent(&variable.name, default.clone())
                    .await?;
            }
        }
        Ok(())
    }

    pub(super) fn vars(&self, scope: VariableScope) -> &ScopedVariables {
        match scope {
            VariableScope::Session => &self.session_vars,
            VariableScope::Flow => &self.flow_vars,
        }
    }

    pub(super) async fn view(&self) -> Result<VariableView> {
        VariableView::load(&self.session_vars, &self.flow_vars).await
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let view = self.view().await?;
        let mut snapshot = BTreeMap::new();
        for (prefix, scope) in [("session", VariableScope::Session), ("flow", VariableScope::Flow)] {
            for (key, value) in view.scope(scope) {
                snapshot.insert(format!("{prefix}.{key}"), value.clone());
            }
        }
        Ok(snapshot)
    }

    pub(super) fn max_steps(&self) -> u32 {
        self.doc.settings.max_steps(self.engine.config())
    }

    fn step_limit_reached(&self) -> bool {
        self.state.steps_in_run() >= u64::from(self.max_steps())
    }

    /// 沿指定类型的出边前进；缺少默认出边视为流程自然结束
    pub(super) fn follow(&self, node_id: &str, kind: ConnectionKind) -> NodeOutcome {
        match self.doc.next_node(node_id, kind) {
            Some(target) => NodeOutcome::Next(target.to_string()),
            None if kind == ConnectionKind::Default => NodeOutcome::Complete,
            None => NodeOutcome::Fail(format!(
                "node `{node_id}` has no `{}` connection",
                kind.as_str()
            )),
        }
    }

    /// 从指定节点开始推进，直到等待、结束或失败
    pub async fn drive(mut self, from: String) -> Result<ExecutionState> {
        let result = self.drive_from(from).await;
        self.settle(result).await?;
        self.recorder.flush();
        Ok(self.state)
    }

    /// 对已存储的执行应用触发器
    pub async fn advance(mut self, trigger: Option<Trigger>) -> Result<(ExecutionState, TriggerOutcome)> {
        let result = self.apply_trigger(trigger).await;
        let outcome = self.settle(result).await?.unwrap_or(TriggerOutcome::Ignored);
        self.recorder.flush();
        Ok((self.state, outcome))
    }

    /// 等待超时，执行转为 failed
    pub async fn expire(mut self) -> Result<ExecutionState> {
        let result = self.expire_wait().await;
        self.settle(result).await?;
        self.recorder.flush();
        Ok(self.state)
    }

    /// 统一处理推进过程中的错误
    ///
    /// 被取消或重启抢占时重新加载存储中的状态；其他错误尽量把执行标记为 failed 后返回
    async fn settle<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) if lost_race(&error) => {
                debug!(execution_id = %self.state.id, %error, "advance preempted");
                self.recorder.flush();
                self.state = self.engine.executions().get(&self.state.id).await?;
                Ok(None)
            }
            Err(error) => {
                warn!(execution_id = %self.state.id, %error, "advance aborted");
                self.abort(&error).await;
                Err(error)
            }
        }
    }

    async fn abort(&mut self, error: &BotFlowError) {
        let message = error.to_string();
        if let Ok(closed) = self
            .engine
            .executions()
            .close_open_steps(&self.state.id, StepStatus::Error, &message)
            .await
        {
            self.recorder.record(closed);
        }
        if self.state.is_terminal() {
            return;
        }
        if let Err(error) = self.fail_run(message).await {
            warn!(execution_id = %self.state.id, %error, "failed to record aborted execution");
        }
    }

    fn cancelled(&self) -> BotFlowError {
        BotFlowError::ExecutionClosed {
            id: self.state.id.clone(),
            status: ExecutionStatus::Cancelled.to_string(),
        }
    }

    async fn drive_from(&mut self, from: String) -> Result<()> {
        let mut next = Some(from);
        while let Some(node_id) = next.take() {
            if self.slot.is_cancelled() {
                return Err(self.cancelled());
            }
            if self.step_limit_reached() {
                let limit = self.max_steps();
                self.fail_run(BotFlowError::MaxStepsExceeded(limit).to_string())
                    .await?;
                return Ok(());
            }
            let node = match self.doc.node(&node_id) {
                Some(node) => node.clone(),
                None => {
                    self.fail_run(BotFlowError::UnknownNode(node_id).to_string())
                        .await?;
                    return Ok(());
                }
            };
            next = if let NodeConfig::Middleware(_) = node.config {
                self.run_middleware(node).await?
            } else {
                self.visit(&node).await?
            };
        }
        Ok(())
    }

    async fn visit(&mut self, node: &Node) -> Result<Option<String>> {
        let step = self.enter(node).await?;
        let result = self.execute(node).await?;
        self.apply(node, step, result).await
    }

    async fn apply_trigger(&mut self, trigger: Option<Trigger>) -> Result<TriggerOutcome> {
        match self.state.status {
            ExecutionStatus::Running => {
                let from = self.state.current_node_id.clone();
                self.drive_from(from).await?;
                Ok(TriggerOutcome::Ignored)
            }
            ExecutionStatus::Waiting => {
                let Some(trigger) = trigger else {
                    return Ok(TriggerOutcome::Ignored);
                };
                if self
                    .state
                    .wait_deadline
                    .is_some_and(|deadline| deadline <= Utc::now())
                {
                    self.expire_wait().await?;
                    return Ok(TriggerOutcome::Rejected);
                }
                let node = self
                    .doc
                    .node(&self.state.current_node_id)
                    .cloned()
                    .ok_or_else(|| BotFlowError::UnknownNode(self.state.current_node_id.clone()))?;
                let Some(mut step) = self.open_step().await? else {
                    self.drive_from(node.id.clone()).await?;
                    return Ok(TriggerOutcome::Ignored);
                };
                match self.on_trigger(&node, &mut step, &trigger).await? {
                    Reply::Rejected => {
                        debug!(
                            execution_id = %self.state.id,
                            node_id = %node.id,
                            "trigger rejected, wait continues"
                        );
                        Ok(TriggerOutcome::Rejected)
                    }
                    Reply::Done(outcome) => Ok(outcome),
                    Reply::Accepted(result) => {
                        if let Some(next) = self.apply(&node, step, result).await? {
                            self.drive_from(next).await?;
                        }
                        Ok(TriggerOutcome::Consumed)
                    }
                }
            }
            _ => Err(BotFlowError::ExecutionClosed {
                id: self.state.id.clone(),
                status: self.state.status.to_string(),
            }),
        }
    }

    async fn open_step(&self) -> Result<Option<ExecutionStep>> {
        let steps = self.engine.executions().steps(&self.state.id).await?;
        Ok(steps
            .into_iter()
            .rev()
            .find(|step| step.run == self.state.run && !step.status.is_final()))
    }

    async fn expire_wait(&mut self) -> Result<()> {
        let message = BotFlowError::Timeout(format!(
            "no valid reply to node `{}` before the wait deadline",
            self.state.current_node_id
        ))
        .to_string();
        let closed = self
            .engine
            .executions()
            .close_open_steps(&self.state.id, StepStatus::Error, &message)
            .await?;
        self.recorder.record(closed);
        self.fail_run(message).await
    }

    /// 进入节点：追加步骤并更新当前节点
    pub(super) async fn enter(&mut self, node: &Node) -> Result<ExecutionStep> {
        self.state.current_node_id = node.id.clone();
        self.state.status = ExecutionStatus::Running;
        self.state.clear_wait();
        let mut step = ExecutionStep::running(&self.state, node);
        if self.engine.config().snapshot_variables {
            step.variables_snapshot = Some(self.snapshot().await?);
        }
        let step = self.recorder.append(&mut self.state, step).await?;
        self.recorder.save(&mut self.state).await?;
        debug!(
            execution_id = %self.state.id,
            step = step.step,
            node_id = %node.id,
            node_type = %node.node_type(),
            "entered node"
        );
        Ok(step)
    }

    pub(super) async fn close_step(&mut self, step: &mut ExecutionStep) -> Result<()> {
        if self.engine.config().snapshot_variables {
            step.variables_snapshot = Some(self.snapshot().await?);
        }
        self.recorder.update(step).await
    }

    pub(super) async fn apply(
        &mut self,
        node: &Node,
        mut step: ExecutionStep,
        result: NodeResult,
    ) -> Result<Option<String>> {
        let NodeResult {
            outcome,
            status,
            message,
            data,
        } = result;
        if data.is_some() {
            step.data = data;
        }
        match outcome {
            NodeOutcome::Next(target) => {
                step.finish(status, message);
                self.close_step(&mut step).await?;
                Ok(Some(target))
            }
            NodeOutcome::Wait {
                wait_type,
                payload,
                deadline,
            } => {
                if message.is_some() {
                    step.message = message;
                }
                self.recorder.update(&step).await?;
                self.state.status = ExecutionStatus::Waiting;
                self.state.wait_type = Some(wait_type);
                self.state.wait_payload = Some(payload);
                self.state.wait_deadline = deadline;
                self.save().await?;
                debug!(execution_id = %self.state.id, node_id = %node.id, ?wait_type, "waiting");
                Ok(None)
            }
            NodeOutcome::Complete => {
                step.finish(status, message);
                self.close_step(&mut step).await?;
                self.complete_run().await?;
                Ok(None)
            }
            NodeOutcome::Fail(error) => {
                step.finish(StepStatus::Error, Some(error.clone()));
                self.close_step(&mut step).await?;
                self.fail_run(error).await?;
                Ok(None)
            }
        }
    }

    async fn complete_run(&mut self) -> Result<()> {
        self.state.status = ExecutionStatus::Completed;
        self.state.clear_wait();
        self.state.error = None;
        self.state.finished_at = Some(Utc::now());
        self.save().await?;
        info!(
            execution_id = %self.state.id,
            flow_id = %self.state.flow_id,
            steps = self.state.step_count,
            "execution completed"
        );
        Ok(())
    }

    pub(super) async fn fail_run(&mut self, error: String) -> Result<()> {
        self.state.status = ExecutionStatus::Failed;
        self.state.clear_wait();
        self.state.finished_at = Some(Utc::now());
        self.state.error = Some(error);
        self.save().await?;
        warn!(
            execution_id = %self.state.id,
            node_id = %self.state.current_node_id,
            error = self.state.error.as_deref().unwrap_or_default(),
            "execution failed"
        );
        Ok(())
    }

    /// 收集从 `first` 开始沿默认出边相连的 middleware，以及它们包裹的下一个节点
    fn middleware_chain(&self, first: Node) -> (Vec<(Node, MiddlewareConfig)>, Option<String>) {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = first;
        loop {
            seen.insert(current.id.clone());
            let next = self
                .doc
                .next_node(&current.id, ConnectionKind::Default)
                .map(str::to_string);
            if let NodeConfig::Middleware(config) = &current.config {
                chain.push((current.clone(), config.clone()));
            }
            match next {
                Some(next_id) => match self.doc.node(&next_id) {
                    Some(node)
                        if matches!(node.config, NodeConfig::Middleware(_))
                            && !seen.contains(&next_id) =>
                    {
                        current = node.clone();
                    }
                    _ => return (chain, Some(next_id)),
                },
                None => return (chain, None),
            }
        }
    }

    /// 执行 middleware 链：按 priority 升序运行前置检查，
    /// 然后执行被包裹的节点，最后按相反顺序运行后置钩子
    async fn run_middleware(&mut self, first: Node) -> Result<Option<String>> {
        let (mut chain, target) = self.middleware_chain(first);
        chain.sort_by_key(|(_, config)| config.priority);

        let mut opened: Vec<(Node, MiddlewareConfig, ExecutionStep)> = Vec::new();
        for (node, config) in chain {
            if self.slot.is_cancelled() {
                return Err(self.cancelled());
            }
            if self.step_limit_reached() {
                self.unwind(opened, json!({ "skipped": true })).await?;
                let limit = self.max_steps();
                self.fail_run(BotFlowError::MaxStepsExceeded(limit).to_string())
                    .await?;
                return Ok(None);
            }
            let mut step = self.enter(&node).await?;
            let view = self.view().await?;
            match self.middleware_pre(&node, &config.kind, &view, target.as_deref()) {
                Ok(data) => {
                    step.data = Some(data);
                    self.recorder.update(&step).await?;
                    opened.push((node, config, step));
                }
                Err(reason) => {
                    warn!(
                        execution_id = %self.state.id,
                        node_id = %node.id,
                        %reason,
                        "middleware vetoed continuation"
                    );
                    step.finish(StepStatus::Error, Some(reason.clone()));
                    self.close_step(&mut step).await?;
                    self.unwind(opened, json!({ "skipped": true })).await?;
                    return match self.doc.next_node(&node.id, ConnectionKind::Error) {
                        Some(error_target) => Ok(Some(error_target.to_string())),
                        None => {
                            self.fail_run(format!("middleware `{}` rejected: {reason}", node.id))
                                .await?;
                            Ok(None)
                        }
                    };
                }
            }
        }

        let Some(target) = target else {
            self.unwind(opened, json!({ "next": Value::Null })).await?;
            self.complete_run().await?;
            return Ok(None);
        };
        if self.step_limit_reached() {
            self.unwind(opened, json!({ "skipped": true })).await?;
            let limit = self.max_steps();
            self.fail_run(BotFlowError::MaxStepsExceeded(limit).to_string())
                .await?;
            return Ok(None);
        }
        let Some(node) = self.doc.node(&target).cloned() else {
            self.unwind(opened, json!({ "skipped": true })).await?;
            self.fail_run(BotFlowError::UnknownNode(target).to_string())
                .await?;
            return Ok(None);
        };

        let step = self.enter(&node).await?;
        let result = self.execute(&node).await?;
        let summary = json!({ "next": node.id, "outcome": result.outcome.as_str() });
        let next = self.apply(&node, step, result).await?;
        self.unwind(opened, summary).await?;
        Ok(next)
    }

    async fn unwind(
        &mut self,
        opened: Vec<(Node, MiddlewareConfig, ExecutionStep)>,
        post: Value,
    ) -> Result<()> {
        for (node, config, mut step) in opened.into_iter().rev() {
            self.middleware_post(&node, &config.kind, &post);
            let pre = step.data.take().unwrap_or(Value::Null);
            step.data = Some(json!({ "pre": pre, "post": post }));
            step.finish(StepStatus::Completed, None);
            self.close_step(&mut step).await?;
        }
        Ok(())
    }
}
