// Action Adapter - 引擎调用外部能力的窄接口

pub mod expression;
#[cfg(feature = "http-adapter")]
pub mod http;
pub mod recording;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::flow::Keyboard;

pub use recording::{RecordingAdapter, SentMessage};

/// Adapter 调用错误
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AdapterError {
    #[error("adapter call timed out after {0} ms")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    /// 不可恢复的传输失败，message 节点遇到它会终止执行
    #[error("fatal transport error: {0}")]
    Fatal(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fatal(_))
    }
}

/// 外部 HTTP 请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

/// 外部 HTTP 响应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

impl ExternalResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 写入变量时使用的文本形式
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Action Adapter trait
///
/// 所有调用对引擎来说都是同步等待的；超时由引擎通过 [`with_timeout`] 统一施加，
/// `call_external` 额外在请求里携带 `timeout_ms` 供实现方使用
#[async_trait]
pub trait ActionAdapter: Send + Sync {
    /// 发送消息，返回投递 id
    async fn send_message(
        &self,
        target: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<String, AdapterError>;

    async fn call_external(&self, request: &ExternalRequest) -> Result<ExternalResponse, AdapterError>;

    async fn db_operation(&self, operation: &Value) -> Result<Value, AdapterError>;

    async fn evaluate_expression(
        &self,
        expression: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, AdapterError> {
        expression::evaluate(expression, variables)
            .map_err(|e| AdapterError::Rejected(e.to_string()))
    }
}

/// 给 adapter 调用加上超时
pub async fn with_timeout<T, F>(timeout_ms: u64, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(timeout_ms)),
    }
}
