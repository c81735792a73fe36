use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ActionAdapter, AdapterError, ExternalRequest, ExternalResponse};
use crate::flow::Keyboard;

/// 基于 reqwest 的外部调用 Adapter
///
/// 只负责 `call_external`，消息发送、数据库和表达式委托给内部 Adapter
#[derive(Clone)]
pub struct HttpActionAdapter {
    client: reqwest::Client,
    inner: Arc<dyn ActionAdapter>,
}

impl HttpActionAdapter {
    pub fn new(inner: Arc<dyn ActionAdapter>) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AdapterError::Fatal(e.to_string()))?;
        Ok(Self { client, inner })
    }

    pub fn with_client(client: reqwest::Client, inner: Arc<dyn ActionAdapter>) -> Self {
        Self { client, inner }
    }
}

fn classify(error: reqwest::Error, timeout_ms: u64) -> AdapterError {
    if error.is_timeout() {
        AdapterError::Timeout(timeout_ms)
    } else if error.is_builder() {
        AdapterError::Rejected(error.to_string())
    } else {
        AdapterError::Transport(error.to_string())
    }
}

#[async_trait]
impl ActionAdapter for HttpActionAdapter {
    async fn send_message(
        &self,
        target: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<String, AdapterError> {
        self.inner.send_message(target, text, keyboard).await
    }

    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn call_external(&self, request: &ExternalRequest) -> Result<ExternalResponse, AdapterError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| AdapterError::Rejected(format!("invalid method `{}`", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(request.timeout_ms));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, request.timeout_ms))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify(e, request.timeout_ms))?;
        debug!(status = status.as_u16(), "external call finished");

        if !status.is_success() {
            return Err(AdapterError::Transport(format!(
                "{} returned {}: {}",
                request.url,
                status.as_u16(),
                text
            )));
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(ExternalResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn db_operation(&self, operation: &Value) -> Result<Value, AdapterError> {
        self.inner.db_operation(operation).await
    }

    async fn evaluate_expression(
        &self,
        expression: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, AdapterError> {
        self.inner.evaluate_expression(expression, variables).await
    }
}
