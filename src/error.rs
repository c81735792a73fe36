use std::fmt;

use thiserror::Error;

use crate::actions::AdapterError;

pub type Result<T> = std::result::Result<T, BotFlowError>;

#[derive(Debug, Error)]
pub enum BotFlowError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("execution `{0}` is busy")]
    Concurrency(String),
    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),
    #[error("flow `{0}` not found")]
    FlowNotFound(String),
    #[error("flow `{flow_id}` has no version {version}")]
    FlowVersionNotFound { flow_id: String, version: u32 },
    #[error("flow `{0}` has no published version")]
    FlowNotPublished(String),
    #[error("invalid transition from `{from}` to `{to}`")]
    InvalidTransition { from: String, to: String },
    #[error("execution `{id}` is {status} and cannot advance")]
    ExecutionClosed { id: String, status: String },
    #[error("maximum step count {0} exceeded")]
    MaxStepsExceeded(u32),
    #[error("unknown node `{0}` in flow")]
    UnknownNode(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotFlowError {
    /// 是否属于运维操作错误（对不存在的执行/流程发起操作）
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            BotFlowError::ExecutionNotFound(_)
                | BotFlowError::FlowNotFound(_)
                | BotFlowError::FlowVersionNotFound { .. }
                | BotFlowError::FlowNotPublished(_)
        )
    }
}

/// 图结构错误，发布时检测
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct GraphError {
    pub problems: Vec<String>,
}

impl GraphError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed flow graph: {}", self.problems.join("; "))
    }
}
