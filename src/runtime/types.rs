use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{FlowDocument, Node, NodeType};

/// 执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 等待类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    Input,
    Command,
    Callback,
}

/// 会话标识
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl SessionInfo {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// 一次会话遍历的执行状态
///
/// `step_count` 跨 run 累计，`run_base_step` 是当前 run 开始前的步数，
/// `revision` 由存储在每次写入时递增，供监控端去重
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: String,
    pub flow_id: String,
    pub flow_version: u32,
    pub project_id: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub current_node_id: String,
    #[serde(default)]
    pub wait_type: Option<WaitType>,
    #[serde(default)]
    pub wait_payload: Option<Value>,
    #[serde(default)]
    pub wait_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_attempts: u32,
    pub step_count: u64,
    pub run: u32,
    #[serde(default)]
    pub run_base_step: u64,
    #[serde(default)]
    pub revision: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionState {
    pub fn new(id: impl Into<String>, doc: &FlowDocument, start_node: &str, session: &SessionInfo) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            flow_id: doc.flow_id.clone(),
            flow_version: doc.version,
            project_id: doc.project_id.clone(),
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            status: ExecutionStatus::Running,
            current_node_id: start_node.to_string(),
            wait_type: None,
            wait_payload: None,
            wait_deadline: None,
            input_attempts: 0,
            step_count: 0,
            run: 1,
            run_base_step: 0,
            revision: 0,
            started_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 当前 run 内已产生的步数
    pub fn steps_in_run(&self) -> u64 {
        self.step_count.saturating_sub(self.run_base_step)
    }

    /// 消息投递目标
    pub fn target(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.session_id)
    }

    pub fn clear_wait(&mut self) {
        self.wait_type = None;
        self.wait_payload = None;
        self.wait_deadline = None;
    }

    pub fn session(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// 步骤状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    /// 终态步骤不再允许修改
    pub fn is_final(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error | StepStatus::Skipped)
    }
}

/// 执行历史中的一行，每访问一个节点产生一条
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub execution_id: String,
    pub step: u64,
    pub run: u32,
    pub node_id: String,
    pub node_type: NodeType,
    pub status: StepStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub variables_snapshot: Option<BTreeMap<String, String>>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    /// 新步骤，序号由记录器分配
    pub fn running(state: &ExecutionState, node: &Node) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: state.id.clone(),
            step: 0,
            run: state.run,
            node_id: node.id.clone(),
            node_type: node.node_type(),
            status: StepStatus::Running,
            message: None,
            data: None,
            variables_snapshot: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn finish(&mut self, status: StepStatus, message: Option<String>) {
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        self.completed_at = Some(Utc::now());
    }
}

/// 驱动执行的外部事件
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// 用户发来的文本
    Message { text: String },
    /// 按钮回调数据
    Callback { data: String },
    /// 定时器或外部事件恢复
    Resume,
}

impl Trigger {
    pub fn message(text: impl Into<String>) -> Self {
        Trigger::Message { text: text.into() }
    }

    pub fn callback(data: impl Into<String>) -> Self {
        Trigger::Callback { data: data.into() }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Trigger::Message { text } => Some(text),
            _ => None,
        }
    }
}

/// 触发器的处理结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// 触发器被当前等待点接受
    Consumed,
    /// 输入未通过校验，已重新提示
    Retried,
    /// 与等待类型或模式不匹配，等待保持不变
    Rejected,
    /// 没有提供触发器或执行无需触发器
    Ignored,
}

/// `advance` 的返回值
#[derive(Clone, Debug, PartialEq)]
pub struct AdvanceOutcome {
    pub state: ExecutionState,
    pub trigger: TriggerOutcome,
}

impl AdvanceOutcome {
    pub fn status(&self) -> ExecutionStatus {
        self.state.status
    }
}
