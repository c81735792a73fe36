use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::events::MonitorEvent;
use super::subscription::ExecutionSubscription;
use crate::error::Result;
use crate::runtime::{
    AdvanceOutcome, ExecutionFilter, ExecutionPage, ExecutionState, ExecutionStep, FlowEngine,
};

/// 单个执行的完整视图
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution: ExecutionState,
    pub steps: Vec<ExecutionStep>,
    /// 之前被重启替换的运行
    pub runs: Vec<ExecutionState>,
    pub session_variables: BTreeMap<String, String>,
    pub flow_variables: BTreeMap<String, String>,
}

/// 面向运维工具的执行监控接口
#[derive(Clone)]
pub struct ExecutionMonitor {
    engine: FlowEngine,
}

impl ExecutionMonitor {
    pub fn new(engine: FlowEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<ExecutionPage> {
        if filter.per_page == 0 {
            let filter = filter
                .clone()
                .with_page(filter.page, self.engine.config().default_page_size);
            return self.engine.executions().list(&filter).await;
        }
        self.engine.executions().list(filter).await
    }

    #[instrument(skip(self))]
    pub async fn execution_detail(&self, execution_id: &str) -> Result<ExecutionDetail> {
        let executions = self.engine.executions();
        let execution = executions.get(execution_id).await?;
        let steps = executions.steps(execution_id).await?;
        let runs = executions.runs(execution_id).await?;
        let session_variables = self.engine.session_variables(execution_id).snapshot().await?;
        let flow_variables = self
            .engine
            .flow_variables(&execution.flow_id)
            .snapshot()
            .await?;
        Ok(ExecutionDetail {
            execution,
            steps,
            runs,
            session_variables,
            flow_variables,
        })
    }

    pub async fn restart(&self, execution_id: &str, reset_variables: bool) -> Result<AdvanceOutcome> {
        self.engine.restart(execution_id, reset_variables).await
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionState> {
        self.engine.cancel(execution_id).await
    }

    /// 订阅单个执行：先快照，再增量事件
    pub async fn subscribe(&self, execution_id: &str) -> Result<ExecutionSubscription> {
        ExecutionSubscription::open(
            self.engine.hub(),
            self.engine.executions().clone(),
            execution_id,
        )
        .await
    }

    /// 所有执行的增量事件，不含快照
    pub fn subscribe_all(&self) -> tokio::sync::broadcast::Receiver<MonitorEvent> {
        self.engine.hub().subscribe_all()
    }
}
