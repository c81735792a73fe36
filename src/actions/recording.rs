use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{ActionAdapter, AdapterError, ExternalRequest, ExternalResponse};
use crate::flow::Keyboard;

/// 已发送的消息
#[derive(Clone, Debug, PartialEq)]
pub struct SentMessage {
    pub delivery_id: String,
    pub target: String,
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Clone, Debug)]
enum Scripted {
    Respond(ExternalResponse),
    Fail(AdapterError),
}

/// 内存 Adapter
///
/// 记录所有调用，外部请求的响应可以按 URL 预设，用于测试和 CLI 演示。
/// 未预设的 URL 返回 `200` + `null`
#[derive(Default)]
pub struct RecordingAdapter {
    sent: Mutex<Vec<SentMessage>>,
    requests: Mutex<Vec<ExternalRequest>>,
    db_calls: Mutex<Vec<Value>>,
    scripted: Mutex<HashMap<String, Scripted>>,
    delays: Mutex<HashMap<String, u64>>,
    send_failures: Mutex<VecDeque<AdapterError>>,
    db_result: Mutex<Option<Result<Value, AdapterError>>>,
    deliveries: AtomicU64,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, url: impl Into<String>, response: ExternalResponse) -> &Self {
        self.scripted.lock().insert(url.into(), Scripted::Respond(response));
        self
    }

    pub fn fail_with(&self, url: impl Into<String>, error: AdapterError) -> &Self {
        self.scripted.lock().insert(url.into(), Scripted::Fail(error));
        self
    }

    /// 让某个 URL 的调用延迟返回，用于触发超时
    pub fn delay(&self, url: impl Into<String>, delay_ms: u64) -> &Self {
        self.delays.lock().insert(url.into(), delay_ms);
        self
    }

    /// 下一次 send_message 返回指定错误
    pub fn fail_next_send(&self, error: AdapterError) -> &Self {
        self.send_failures.lock().push_back(error);
        self
    }

    pub fn respond_db(&self, result: Result<Value, AdapterError>) -> &Self {
        *self.db_result.lock() = Some(result);
        self
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.text.clone()).collect()
    }

    pub fn requests(&self) -> Vec<ExternalRequest> {
        self.requests.lock().clone()
    }

    pub fn db_calls(&self) -> Vec<Value> {
        self.db_calls.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
        self.requests.lock().clear();
        self.db_calls.lock().clear();
    }
}

#[async_trait]
impl ActionAdapter for RecordingAdapter {
    async fn send_message(
        &self,
        target: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<String, AdapterError> {
        if let Some(error) = self.send_failures.lock().pop_front() {
            return Err(error);
        }
        let delivery_id = format!("msg-{}", self.deliveries.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent.lock().push(SentMessage {
            delivery_id: delivery_id.clone(),
            target: target.to_string(),
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(delivery_id)
    }

    async fn call_external(&self, request: &ExternalRequest) -> Result<ExternalResponse, AdapterError> {
        self.requests.lock().push(request.clone());
        let delay = self.delays.lock().get(&request.url).copied();
        if let Some(delay_ms) = delay {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let scripted = self.scripted.lock().get(&request.url).cloned();
        match scripted {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            None => Ok(ExternalResponse::ok(Value::Null)),
        }
    }

    async fn db_operation(&self, operation: &Value) -> Result<Value, AdapterError> {
        self.db_calls.lock().push(operation.clone());
        match self.db_result.lock().clone() {
            Some(result) => result,
            None => Ok(Value::Null),
        }
    }

    async fn evaluate_expression(
        &self,
        expression: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, AdapterError> {
        super::expression::evaluate(expression, variables)
            .map_err(|e| AdapterError::Rejected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(url: &str) -> ExternalRequest {
        ExternalRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_records_messages_and_scripted_failures() {
        let adapter = RecordingAdapter::new();
        adapter.fail_next_send(AdapterError::Transport("offline".into()));

        assert!(adapter.send_message("u1", "first", None).await.is_err());
        let id = adapter.send_message("u1", "second", None).await.unwrap();
        assert_eq!(id, "msg-1");
        assert_eq!(adapter.sent_texts(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_external_calls() {
        let adapter = RecordingAdapter::new();
        adapter
            .respond_with("https://api/ok", ExternalResponse::ok(json!({"points": 10})))
            .fail_with("https://api/down", AdapterError::Transport("503".into()));

        let ok = adapter.call_external(&request("https://api/ok")).await.unwrap();
        assert_eq!(ok.body["points"], 10);
        assert!(adapter.call_external(&request("https://api/down")).await.is_err());
        assert_eq!(adapter.requests().len(), 2);
    }
}
