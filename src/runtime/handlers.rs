use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::processor::Run;
use super::types::{ExecutionStep, StepStatus, Trigger, TriggerOutcome, WaitType};
use crate::actions::{with_timeout, AdapterError, ExternalRequest};
use crate::error::{BotFlowError, Result};
use crate::flow::{
    parse_number, ActionConfig, ActionKind, CallbackConfig, CallbackMatch, ConnectionKind,
    InputConfig, InputRule, MessageConfig, MiddlewareKind, Node, NodeConfig, SessionConfig,
    SessionOperation,
};
use crate::state::VariableView;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email pattern"));
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{7,15}$").expect("valid phone pattern"));

/// 等待时长上限（十年）
const MAX_WAIT_SECS: i64 = 10 * 365 * 24 * 3600;

/// 节点执行后的去向
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NodeOutcome {
    Next(String),
    Wait {
        wait_type: WaitType,
        payload: Value,
        deadline: Option<DateTime<Utc>>,
    },
    Complete,
    /// 不可恢复的错误，原样记录到 ExecutionState.error
    Fail(String),
}

impl NodeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeOutcome::Next(_) => "next",
            NodeOutcome::Wait { .. } => "wait",
            NodeOutcome::Complete => "complete",
            NodeOutcome::Fail(_) => "fail",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct NodeResult {
    pub outcome: NodeOutcome,
    /// 步骤关闭时的状态（等待时忽略）
    pub status: StepStatus,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl NodeResult {
    pub fn new(outcome: NodeOutcome) -> Self {
        Self {
            outcome,
            status: StepStatus::Completed,
            message: None,
            data: None,
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// 等待中的节点对触发器的响应
pub(crate) enum Reply {
    /// 不匹配，等待保持不变
    Rejected,
    /// 已在处理器内部完成状态迁移
    Done(TriggerOutcome),
    /// 接受触发器，按结果关闭当前步骤
    Accepted(NodeResult),
}

/// 匹配命令，返回命令后的参数
///
/// 忽略前导 `/` 与 `@bot` 后缀；`case_sensitive` 为 false 时不区分大小写
pub fn match_command(
    command: &str,
    aliases: &[String],
    case_sensitive: bool,
    text: &str,
) -> Option<String> {
    let text = text.trim();
    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };
    let head = head.split('@').next().unwrap_or(head);
    let normalize = |value: &str| {
        let value = value.trim();
        let value = value.strip_prefix('/').unwrap_or(value);
        if case_sensitive {
            value.to_string()
        } else {
            value.to_lowercase()
        }
    };
    let head = normalize(head);
    if head.is_empty() {
        return None;
    }
    std::iter::once(command)
        .chain(aliases.iter().map(String::as_str))
        .any(|candidate| normalize(candidate) == head)
        .then(|| rest.to_string())
}

pub fn match_callback(config: &CallbackConfig, data: &str) -> bool {
    match config.match_type {
        CallbackMatch::Exact => data == config.pattern,
        CallbackMatch::Prefix => data.starts_with(&config.pattern),
        CallbackMatch::Regex => Regex::new(&config.pattern)
            .map(|pattern| pattern.is_match(data))
            .unwrap_or(false),
    }
}

/// 按规则校验输入，成功时返回规范化后的值
pub fn validate_input(rule: &InputRule, text: &str) -> std::result::Result<String, String> {
    let value = text.trim();
    match rule {
        InputRule::Text => {
            if value.is_empty() {
                Err("value is empty".to_string())
            } else {
                Ok(value.to_string())
            }
        }
        InputRule::Email => {
            if EMAIL.is_match(value) {
                Ok(value.to_string())
            } else {
                Err(format!("`{value}` is not a valid email address"))
            }
        }
        InputRule::Phone => {
            let compact: String = value
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
                .collect();
            if PHONE.is_match(&compact) {
                Ok(compact)
            } else {
                Err(format!("`{value}` is not a valid phone number"))
            }
        }
        InputRule::Number => parse_number(value)
            .map(|_| value.to_string())
            .ok_or_else(|| format!("`{value}` is not a number")),
        InputRule::Regex(pattern) => {
            let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern: {e}"))?;
            if regex.is_match(value) {
                Ok(value.to_string())
            } else {
                Err(format!("`{value}` does not match `{pattern}`"))
            }
        }
    }
}

fn render_value(view: &VariableView, value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(view.render(text)),
        Value::Array(items) => Value::Array(items.iter().map(|item| render_value(view, item)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), render_value(view, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl<'e> Run<'e> {
    pub(super) async fn execute(&mut self, node: &Node) -> Result<NodeResult> {
        match &node.config {
            NodeConfig::Start(_) => {
                let data = json!({ "trigger": self.trigger });
                Ok(NodeResult::new(self.follow(&node.id, ConnectionKind::Default)).with_data(data))
            }
            NodeConfig::Message(config) => self.send_message(node, config).await,
            NodeConfig::Command(config) => Ok(NodeResult::new(NodeOutcome::Wait {
                wait_type: WaitType::Command,
                payload: json!({ "command": config.command, "aliases": config.aliases }),
                deadline: None,
            })),
            NodeConfig::Callback(config) => Ok(NodeResult::new(NodeOutcome::Wait {
                wait_type: WaitType::Callback,
                payload: json!({ "pattern": config.pattern, "match_type": config.match_type }),
                deadline: None,
            })),
            NodeConfig::Input(config) => self.prompt_input(node, config).await,
            NodeConfig::Condition(config) => {
                let view = self.view().await?;
                let left = view.resolve_or_empty(&config.variable);
                let right = view.render(&config.value);
                let result = config.operator.evaluate(&left, &right);
                let kind = if result {
                    ConnectionKind::True
                } else {
                    ConnectionKind::False
                };
                Ok(NodeResult::new(self.follow(&node.id, kind)).with_data(json!({
                    "variable": config.variable,
                    "left": left,
                    "operator": config.operator.as_str(),
                    "right": right,
                    "result": result,
                })))
            }
            NodeConfig::Action(config) => self.run_action(node, config).await,
            // middleware 由链式处理器包裹下一个节点执行，这里只会在链外被直接访问
            NodeConfig::Middleware(_) => {
                Ok(NodeResult::new(self.follow(&node.id, ConnectionKind::Default)))
            }
            NodeConfig::Session(config) => self.session_operation(node, config).await,
            NodeConfig::End => Ok(NodeResult::new(NodeOutcome::Complete)),
        }
    }

    async fn deliver(&self, text: &str, config: &MessageConfig) -> std::result::Result<String, AdapterError> {
        let timeout = self.doc.settings.action_timeout_ms(self.engine.config());
        let target = self.state.target().to_string();
        let adapter = self.engine.adapter().clone();
        with_timeout(
            timeout,
            adapter.send_message(&target, text, config.keyboard.as_ref()),
        )
        .await
    }

    async fn send_message(&mut self, node: &Node, config: &MessageConfig) -> Result<NodeResult> {
        let view = self.view().await?;
        let text = view.render(&config.text);
        let next = self.follow(&node.id, ConnectionKind::Default);
        match self.deliver(&text, config).await {
            Ok(delivery_id) => Ok(NodeResult::new(next)
                .with_message(text)
                .with_data(json!({ "delivery_id": delivery_id }))),
            Err(error) if error.is_fatal() => {
                Ok(NodeResult::new(NodeOutcome::Fail(BotFlowError::Adapter(error).to_string())))
            }
            Err(error) => {
                warn!(execution_id = %self.state.id, node_id = %node.id, %error, "message delivery failed");
                Ok(NodeResult::new(next)
                    .with_status(StepStatus::Error)
                    .with_message(format!("delivery failed: {error}"))
                    .with_data(json!({ "text": text, "error": error })))
            }
        }
    }

    async fn prompt_input(&mut self, node: &Node, config: &InputConfig) -> Result<NodeResult> {
        let view = self.view().await?;
        let prompt = view.render(&config.prompt);
        self.state.input_attempts = 0;

        let message = MessageConfig {
            text: prompt.clone(),
            keyboard: None,
        };
        match self.deliver(&prompt, &message).await {
            Ok(_) => {}
            Err(error) if error.is_fatal() => {
                return Ok(NodeResult::new(NodeOutcome::Fail(
                    BotFlowError::Adapter(error).to_string(),
                )));
            }
            Err(error) => {
                warn!(execution_id = %self.state.id, node_id = %node.id, %error, "prompt delivery failed");
            }
        }

        let timeout_secs = config
            .timeout_secs
            .unwrap_or_else(|| self.doc.settings.input_timeout_secs(self.engine.config()));
        let secs = i64::try_from(timeout_secs).unwrap_or(MAX_WAIT_SECS).min(MAX_WAIT_SECS);
        let deadline = Utc::now() + Duration::seconds(secs);
        Ok(NodeResult::new(NodeOutcome::Wait {
            wait_type: WaitType::Input,
            payload: json!({
                "variable": config.variable,
                "scope": config.scope,
                "rule": config.validation,
                "attempt": 0,
            }),
            deadline: Some(deadline),
        })
        .with_message(prompt))
    }

    pub(super) async fn on_trigger(
        &mut self,
        node: &Node,
        step: &mut ExecutionStep,
        trigger: &Trigger,
    ) -> Result<Reply> {
        match (&node.config, trigger) {
            (NodeConfig::Input(config), Trigger::Message { text }) => {
                self.input_reply(node, config, step, text).await
            }
            (NodeConfig::Command(config), Trigger::Message { text }) => {
                match match_command(&config.command, &config.aliases, config.case_sensitive, text) {
                    Some(args) => {
                        if let Some(variable) = &config.args_variable {
                            self.session_vars.set(variable, args.clone()).await?;
                        }
                        Ok(Reply::Accepted(
                            NodeResult::new(self.follow(&node.id, ConnectionKind::Default))
                                .with_data(json!({ "matched": true, "text": text, "args": args })),
                        ))
                    }
                    None => Ok(self.no_match(node, json!({ "matched": false, "text": text }))),
                }
            }
            (NodeConfig::Callback(config), Trigger::Callback { data }) => {
                if match_callback(config, data) {
                    if let Some(variable) = &config.data_variable {
                        self.session_vars.set(variable, data.clone()).await?;
                    }
                    Ok(Reply::Accepted(
                        NodeResult::new(self.follow(&node.id, ConnectionKind::Default))
                            .with_data(json!({ "matched": true, "data": data })),
                    ))
                } else {
                    Ok(self.no_match(node, json!({ "matched": false, "data": data })))
                }
            }
            _ => Ok(Reply::Rejected),
        }
    }

    /// 命令/回调不匹配时，存在 `false` 出边则走该分支，否则继续等待
    fn no_match(&self, node: &Node, data: Value) -> Reply {
        match self.doc.next_node(&node.id, ConnectionKind::False) {
            Some(target) => Reply::Accepted(
                NodeResult::new(NodeOutcome::Next(target.to_string())).with_data(data),
            ),
            None => Reply::Rejected,
        }
    }

    async fn input_reply(
        &mut self,
        node: &Node,
        config: &InputConfig,
        step: &mut ExecutionStep,
        text: &str,
    ) -> Result<Reply> {
        let attempt = self.state.input_attempts + 1;
        let reason = match validate_input(&config.validation, text) {
            Ok(value) => {
                self.vars(config.scope)
                    .set(&config.variable, value.clone())
                    .await?;
                return Ok(Reply::Accepted(
                    NodeResult::new(self.follow(&node.id, ConnectionKind::Default)).with_data(
                        json!({ "variable": config.variable, "value": value, "attempt": attempt }),
                    ),
                ));
            }
            Err(reason) => reason,
        };

        self.state.input_attempts = attempt;
        step.data = Some(json!({ "value": text, "attempt": attempt }));
        step.finish(StepStatus::Error, Some(format!("validation failed: {reason}")));
        self.close_step(step).await?;

        let max_retries = config
            .max_retries
            .unwrap_or_else(|| self.doc.settings.max_input_retries(self.engine.config()));
        if attempt > max_retries {
            let error = BotFlowError::Timeout(format!(
                "input on node `{}` failed validation {attempt} times",
                node.id
            ));
            self.fail_run(error.to_string()).await?;
            return Ok(Reply::Done(TriggerOutcome::Consumed));
        }
        if self.state.steps_in_run() >= u64::from(self.max_steps()) {
            let limit = self.max_steps();
            self.fail_run(BotFlowError::MaxStepsExceeded(limit).to_string())
                .await?;
            return Ok(Reply::Done(TriggerOutcome::Consumed));
        }

        let view = self.view().await?;
        let retry_text = view.render(config.retry_message.as_deref().unwrap_or(&config.prompt));
        let message = MessageConfig {
            text: retry_text.clone(),
            keyboard: None,
        };
        if let Err(error) = self.deliver(&retry_text, &message).await {
            if error.is_fatal() {
                self.fail_run(BotFlowError::Adapter(error).to_string()).await?;
                return Ok(Reply::Done(TriggerOutcome::Consumed));
            }
            warn!(execution_id = %self.state.id, node_id = %node.id, %error, "retry prompt delivery failed");
        }

        let mut retry = ExecutionStep::running(&self.state, node);
        retry.message = Some(retry_text);
        retry.data = Some(json!({ "attempt": attempt, "reason": reason }));
        self.recorder.append(&mut self.state, retry).await?;
        if let Some(Value::Object(payload)) = self.state.wait_payload.as_mut() {
            payload.insert("attempt".to_string(), json!(attempt));
        }
        self.save().await?;
        Ok(Reply::Done(TriggerOutcome::Retried))
    }

    async fn run_action(&mut self, node: &Node, config: &ActionConfig) -> Result<NodeResult> {
        let view = self.view().await?;
        let timeout = config
            .timeout_ms
            .unwrap_or_else(|| self.doc.settings.action_timeout_ms(self.engine.config()));
        let adapter = self.engine.adapter().clone();
        let default_target = self.state.target().to_string();

        let call: std::result::Result<(String, Value), AdapterError> = match &config.kind {
            ActionKind::SendMessage {
                text,
                keyboard,
                target,
            } => {
                let text = view.render(text);
                let to = target
                    .as_deref()
                    .map(|target| view.render(target))
                    .unwrap_or(default_target);
                with_timeout(timeout, adapter.send_message(&to, &text, keyboard.as_ref()))
                    .await
                    .map(|id| (id.clone(), json!({ "delivery_id": id, "target": to, "text": text })))
            }
            ActionKind::Http {
                url,
                method,
                headers,
                body,
            } => {
                let request = ExternalRequest {
                    url: view.render(url),
                    method: method.clone(),
                    headers: headers
                        .iter()
                        .map(|(name, value)| (name.clone(), view.render(value)))
                        .collect(),
                    body: body.as_ref().map(|body| render_value(&view, body)),
                    timeout_ms: timeout,
                };
                with_timeout(timeout, adapter.call_external(&request))
                    .await
                    .map(|response| {
                        (
                            response.body_text(),
                            json!({
                                "url": request.url,
                                "method": request.method,
                                "status": response.status,
                                "body": response.body,
                            }),
                        )
                    })
            }
            ActionKind::Database { operation } => {
                let operation = render_value(&view, operation);
                with_timeout(timeout, adapter.db_operation(&operation))
                    .await
                    .map(|result| (value_text(&result), json!({ "result": result })))
            }
            ActionKind::Expression { expression } => {
                let variables = view.merged();
                with_timeout(timeout, adapter.evaluate_expression(expression, &variables))
                    .await
                    .map(|value| (value.clone(), json!({ "expression": expression, "value": value })))
            }
            ActionKind::Notification {
                text,
                channel,
                target,
            } => {
                let text = view.render(text);
                let to = target
                    .as_deref()
                    .or(channel.as_deref())
                    .map(|target| view.render(target))
                    .unwrap_or(default_target);
                with_timeout(timeout, adapter.send_message(&to, &text, None))
                    .await
                    .map(|id| (id.clone(), json!({ "delivery_id": id, "target": to, "text": text })))
            }
        };

        match call {
            Ok((value, data)) => {
                if let Some(variable) = &config.result_variable {
                    self.session_vars.set(variable, value).await?;
                }
                Ok(NodeResult::new(self.follow(&node.id, ConnectionKind::Default)).with_data(data))
            }
            Err(error) => {
                let message = BotFlowError::Adapter(error.clone()).to_string();
                let data = json!({ "action": config.kind.as_str(), "error": error });
                match self.doc.next_node(&node.id, ConnectionKind::Error) {
                    Some(target) => {
                        warn!(
                            execution_id = %self.state.id,
                            node_id = %node.id,
                            error = %message,
                            "action failed, following error connection"
                        );
                        Ok(NodeResult::new(NodeOutcome::Next(target.to_string()))
                            .with_status(StepStatus::Error)
                            .with_message(message)
                            .with_data(data))
                    }
                    None => Ok(NodeResult::new(NodeOutcome::Fail(message)).with_data(data)),
                }
            }
        }
    }

    async fn session_operation(&mut self, node: &Node, config: &SessionConfig) -> Result<NodeResult> {
        let vars = self.vars(config.scope).clone();
        let data = match config.operation {
            SessionOperation::Set => {
                let view = self.view().await?;
                let value = view.render(config.value.as_deref().unwrap_or_default());
                vars.set(&config.key, value.clone()).await?;
                json!({ "operation": "set", "scope": config.scope, "key": config.key, "value": value })
            }
            SessionOperation::Get => {
                let value = vars.get(&config.key).await?.unwrap_or_default();
                let target = config.target.clone().unwrap_or_else(|| config.key.clone());
                self.session_vars.set(&target, value.clone()).await?;
                json!({ "operation": "get", "scope": config.scope, "key": config.key, "target": target, "value": value })
            }
            SessionOperation::Delete => {
                vars.delete(&config.key).await?;
                json!({ "operation": "delete", "scope": config.scope, "key": config.key })
            }
            SessionOperation::Increment | SessionOperation::Decrement => {
                let amount = config.amount.unwrap_or(1.0);
                let delta = if config.operation == SessionOperation::Increment {
                    amount
                } else {
                    -amount
                };
                match vars.increment(&config.key, delta).await {
                    Ok(value) => json!({
                        "operation": if delta >= 0.0 { "increment" } else { "decrement" },
                        "scope": config.scope,
                        "key": config.key,
                        "value": value,
                    }),
                    Err(BotFlowError::Validation(reason)) => {
                        return Ok(NodeResult::new(NodeOutcome::Fail(reason)));
                    }
                    Err(error) => return Err(error),
                }
            }
        };
        Ok(NodeResult::new(self.follow(&node.id, ConnectionKind::Default)).with_data(data))
    }

    pub(super) fn middleware_pre(
        &self,
        node: &Node,
        kind: &MiddlewareKind,
        view: &VariableView,
        next: Option<&str>,
    ) -> std::result::Result<Value, String> {
        match kind {
            MiddlewareKind::Logging { label } => {
                info!(
                    execution_id = %self.state.id,
                    middleware = %node.id,
                    label = label.as_deref().unwrap_or_default(),
                    next = next.unwrap_or_default(),
                    "flow middleware"
                );
                Ok(json!({ "kind": "logging", "label": label, "next": next }))
            }
            MiddlewareKind::Auth {
                require_user,
                variable,
                expected,
            } => {
                if *require_user && self.state.user_id.is_none() {
                    return Err("authentication required: session has no user".to_string());
                }
                if let Some(variable) = variable {
                    let actual = view.resolve_or_empty(variable);
                    match expected {
                        Some(expected) if actual != view.render(expected) => {
                            return Err(format!("auth check failed: `{variable}` does not match"));
                        }
                        None if actual.trim().is_empty() => {
                            return Err(format!("auth check failed: `{variable}` is not set"));
                        }
                        _ => {}
                    }
                }
                Ok(json!({ "kind": "auth", "user_id": self.state.user_id }))
            }
            MiddlewareKind::Validation { variable, rule } => {
                let value = view.resolve_or_empty(variable);
                validate_input(rule, &value)
                    .map(|value| json!({ "kind": "validation", "variable": variable, "value": value }))
                    .map_err(|reason| format!("validation of `{variable}` failed: {reason}"))
            }
        }
    }

    pub(super) fn middleware_post(&self, node: &Node, kind: &MiddlewareKind, post: &Value) {
        if let MiddlewareKind::Logging { label } = kind {
            info!(
                execution_id = %self.state.id,
                middleware = %node.id,
                label = label.as_deref().unwrap_or_default(),
                post = %post,
                "flow middleware finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_command() {
        let aliases = vec!["/go".to_string()];
        assert_eq!(match_command("/start", &aliases, false, "/start"), Some(String::new()));
        assert_eq!(match_command("/start", &aliases, false, "/START@bonus_bot ref42"), Some("ref42".to_string()));
        assert_eq!(match_command("/start", &aliases, false, "/go"), Some(String::new()));
        assert_eq!(match_command("/start", &aliases, true, "/START"), None);
        assert_eq!(match_command("/start", &aliases, false, "hello"), None);
        assert_eq!(match_command("/start", &aliases, false, "   "), None);
    }

    #[test]
    fn test_match_callback() {
        let mut config = CallbackConfig {
            pattern: "buy:".to_string(),
            match_type: CallbackMatch::Prefix,
            data_variable: None,
        };
        assert!(match_callback(&config, "buy:42"));
        config.match_type = CallbackMatch::Exact;
        assert!(!match_callback(&config, "buy:42"));
        config.match_type = CallbackMatch::Regex;
        config.pattern = r"^buy:\d+$".to_string();
        assert!(match_callback(&config, "buy:42"));
        assert!(!match_callback(&config, "buy:x"));
    }

    #[test]
    fn test_validate_input_rules() {
        assert!(validate_input(&InputRule::Phone, "abc").is_err());
        assert_eq!(
            validate_input(&InputRule::Phone, "+1 (555) 123-4567").unwrap(),
            "+15551234567"
        );
        assert!(validate_input(&InputRule::Email, "user@example.com").is_ok());
        assert!(validate_input(&InputRule::Email, "user@").is_err());
        assert!(validate_input(&InputRule::Number, "12.5").is_ok());
        assert!(validate_input(&InputRule::Number, "twelve").is_err());
        assert!(validate_input(&InputRule::Text, "  ").is_err());
        assert!(validate_input(&InputRule::Regex(r"^\d{4}$".to_string()), "2024").is_ok());
        assert!(validate_input(&InputRule::Regex("(".to_string()), "x").is_err());
    }
}
