use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BotFlowError, Result};
use crate::runtime::{ExecutionState, ExecutionStatus, ExecutionStep, WaitType};

/// 监控事件
///
/// 投递语义是至少一次，客户端按 `(execution_id, step)` 与 revision 去重
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// 订阅时（以及落后后重新同步时）发送的完整快照
    Snapshot {
        execution: ExecutionState,
        steps: Vec<ExecutionStep>,
    },
    Status {
        execution_id: String,
        revision: u64,
        status: ExecutionStatus,
        current_node_id: String,
        wait_type: Option<WaitType>,
        error: Option<String>,
    },
    /// 新追加或更新的步骤，按批发送
    Logs {
        execution_id: String,
        steps: Vec<ExecutionStep>,
    },
    /// ExecutionState 的部分字段更新
    Execution {
        execution_id: String,
        revision: u64,
        patch: Map<String, Value>,
    },
}

impl MonitorEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            MonitorEvent::Snapshot { execution, .. } => &execution.id,
            MonitorEvent::Status { execution_id, .. }
            | MonitorEvent::Logs { execution_id, .. }
            | MonitorEvent::Execution { execution_id, .. } => execution_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::Snapshot { .. } => "snapshot",
            MonitorEvent::Status { .. } => "status",
            MonitorEvent::Logs { .. } => "logs",
            MonitorEvent::Execution { .. } => "execution",
        }
    }

    pub fn status_of(state: &ExecutionState) -> Self {
        MonitorEvent::Status {
            execution_id: state.id.clone(),
            revision: state.revision,
            status: state.status,
            current_node_id: state.current_node_id.clone(),
            wait_type: state.wait_type,
            error: state.error.clone(),
        }
    }

    /// 计算两个状态之间变化的字段，没有变化时返回 None
    pub fn patch_between(
        previous: Option<&ExecutionState>,
        next: &ExecutionState,
    ) -> Result<Option<Self>> {
        let next_fields = to_object(next)?;
        let patch: Map<String, Value> = match previous {
            Some(previous) => {
                let previous_fields = to_object(previous)?;
                next_fields
                    .into_iter()
                    .filter(|(key, value)| previous_fields.get(key) != Some(value))
                    .collect()
            }
            None => next_fields,
        };
        if patch.is_empty() {
            return Ok(None);
        }
        Ok(Some(MonitorEvent::Execution {
            execution_id: next.id.clone(),
            revision: next.revision,
            patch,
        }))
    }
}

/// 状态行是否变化（status / 当前节点 / 等待 / 错误）
pub(crate) fn status_changed(previous: Option<&ExecutionState>, next: &ExecutionState) -> bool {
    match previous {
        None => true,
        Some(previous) => {
            previous.status != next.status
                || previous.current_node_id != next.current_node_id
                || previous.wait_type != next.wait_type
                || previous.error != next.error
                || previous.run != next.run
        }
    }
}

pub(crate) fn to_object(state: &ExecutionState) -> Result<Map<String, Value>> {
    match serde_json::to_value(state) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(BotFlowError::Store(
            "execution state did not serialize to an object".to_string(),
        )),
        Err(e) => Err(BotFlowError::Store(e.to_string())),
    }
}
