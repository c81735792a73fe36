use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::conditions::ConditionOperator;
use crate::state::VariableScope;

/// Flow 节点类型定义

/// 节点类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Message,
    Command,
    Callback,
    Input,
    Condition,
    Action,
    Middleware,
    Session,
    End,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::Message => "message",
            NodeType::Command => "command",
            NodeType::Callback => "callback",
            NodeType::Input => "input",
            NodeType::Condition => "condition",
            NodeType::Action => "action",
            NodeType::Middleware => "middleware",
            NodeType::Session => "session",
            NodeType::End => "end",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow 节点
///
/// 序列化格式与编辑器保存的文档一致：`{ "id", "type", "config" }`，
/// 反序列化时按 `type` 把 `config` 解析成对应的强类型配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub label: Option<String>,
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: None,
            config,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }
}

/// 节点配置，每种节点类型一个变体
#[derive(Clone, Debug, PartialEq)]
pub enum NodeConfig {
    Start(StartConfig),
    Message(MessageConfig),
    Command(CommandConfig),
    Callback(CallbackConfig),
    Input(InputConfig),
    Condition(ConditionConfig),
    Action(ActionConfig),
    Middleware(MiddlewareConfig),
    Session(SessionConfig),
    End,
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Start(_) => NodeType::Start,
            NodeConfig::Message(_) => NodeType::Message,
            NodeConfig::Command(_) => NodeType::Command,
            NodeConfig::Callback(_) => NodeType::Callback,
            NodeConfig::Input(_) => NodeType::Input,
            NodeConfig::Condition(_) => NodeType::Condition,
            NodeConfig::Action(_) => NodeType::Action,
            NodeConfig::Middleware(_) => NodeType::Middleware,
            NodeConfig::Session(_) => NodeType::Session,
            NodeConfig::End => NodeType::End,
        }
    }

    fn to_value(&self) -> Value {
        let value = match self {
            NodeConfig::Start(config) => serde_json::to_value(config),
            NodeConfig::Message(config) => serde_json::to_value(config),
            NodeConfig::Command(config) => serde_json::to_value(config),
            NodeConfig::Callback(config) => serde_json::to_value(config),
            NodeConfig::Input(config) => serde_json::to_value(config),
            NodeConfig::Condition(config) => serde_json::to_value(config),
            NodeConfig::Action(config) => serde_json::to_value(config),
            NodeConfig::Middleware(config) => serde_json::to_value(config),
            NodeConfig::Session(config) => serde_json::to_value(config),
            NodeConfig::End => Ok(Value::Object(Default::default())),
        };
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

fn parse_config<T: DeserializeOwned>(node_id: &str, node_type: NodeType, config: Value) -> Result<T, String> {
    let config = match config {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(config)
        .map_err(|e| format!("node `{node_id}` has invalid {node_type} config: {e}"))
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let id = raw.id;
        let ty = raw.node_type;
        let config = match ty {
            NodeType::Start => NodeConfig::Start(parse_config(&id, ty, raw.config)?),
            NodeType::Message => NodeConfig::Message(parse_config(&id, ty, raw.config)?),
            NodeType::Command => NodeConfig::Command(parse_config(&id, ty, raw.config)?),
            NodeType::Callback => NodeConfig::Callback(parse_config(&id, ty, raw.config)?),
            NodeType::Input => NodeConfig::Input(parse_config(&id, ty, raw.config)?),
            NodeType::Condition => NodeConfig::Condition(parse_config(&id, ty, raw.config)?),
            NodeType::Action => NodeConfig::Action(parse_config(&id, ty, raw.config)?),
            NodeType::Middleware => NodeConfig::Middleware(parse_config(&id, ty, raw.config)?),
            NodeType::Session => NodeConfig::Session(parse_config(&id, ty, raw.config)?),
            NodeType::End => NodeConfig::End,
        };
        Ok(Node {
            id,
            label: raw.label,
            config,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        RawNode {
            node_type: node.node_type(),
            config: node.config.to_value(),
            id: node.id,
            label: node.label,
        }
    }
}

/// start 节点：可选的触发命令（如 `/start`）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// 消息按钮
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// 消息键盘
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyboard {
    #[serde(default)]
    pub rows: Vec<Vec<KeyboardButton>>,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    /// 命令参数写入的 session 变量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_variable: Option<String>,
}

/// callback data 匹配方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackMatch {
    #[default]
    Exact,
    Prefix,
    Regex,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub pattern: String,
    #[serde(default)]
    pub match_type: CallbackMatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_variable: Option<String>,
}

/// input 校验规则
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRule {
    #[default]
    Text,
    Email,
    Phone,
    Number,
    Regex(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub prompt: String,
    pub variable: String,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default)]
    pub validation: InputRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub variable: String,
    pub operator: ConditionOperator,
    /// 比较值，可以是 `{{variable}}` 引用
    #[serde(default)]
    pub value: String,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// action 节点的具体动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keyboard: Option<Keyboard>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Database {
        operation: Value,
    },
    Expression {
        expression: String,
    },
    Notification {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendMessage { .. } => "send_message",
            ActionKind::Http { .. } => "http",
            ActionKind::Database { .. } => "database",
            ActionKind::Expression { .. } => "expression",
            ActionKind::Notification { .. } => "notification",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(flatten)]
    pub kind: ActionKind,
    /// 声明了错误处理的 action 必须有且仅有一条 error 连线
    #[serde(default)]
    pub handle_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// 结果写入的 session 变量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
}

/// middleware 类型
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MiddlewareKind {
    Logging {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Auth {
        #[serde(default)]
        require_user: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variable: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<String>,
    },
    Validation {
        variable: String,
        rule: InputRule,
    },
}

impl MiddlewareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareKind::Logging { .. } => "logging",
            MiddlewareKind::Auth { .. } => "auth",
            MiddlewareKind::Validation { .. } => "validation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(flatten)]
    pub kind: MiddlewareKind,
    /// 数值越小越先执行
    #[serde(default)]
    pub priority: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOperation {
    Set,
    Get,
    Delete,
    Increment,
    Decrement,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub operation: SessionOperation,
    #[serde(default)]
    pub scope: VariableScope,
    pub key: String,
    /// set 的值，支持模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// increment/decrement 的步长，默认 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// get 的结果写入的 session 变量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_parses_typed_config() {
        let node: Node = serde_json::from_value(json!({
            "id": "ask_phone",
            "type": "input",
            "config": {
                "prompt": "Your phone?",
                "variable": "phone",
                "validation": "phone",
                "timeout_secs": 60
            }
        }))
        .unwrap();
        match &node.config {
            NodeConfig::Input(config) => {
                assert_eq!(config.validation, InputRule::Phone);
                assert_eq!(config.timeout_secs, Some(60));
                assert_eq!(config.scope, VariableScope::Session);
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_end_node_without_config() {
        let node: Node = serde_json::from_value(json!({"id": "done", "type": "end"})).unwrap();
        assert_eq!(node.node_type(), NodeType::End);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result: Result<Node, _> = serde_json::from_value(json!({
            "id": "cond",
            "type": "condition",
            "config": {"operator": "equals"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_action_config_roundtrip_keeps_kind() {
        let node: Node = serde_json::from_value(json!({
            "id": "call",
            "type": "action",
            "config": {
                "kind": "http",
                "url": "https://api.example.com/balance",
                "handle_errors": true,
                "timeout_ms": 500
            }
        }))
        .unwrap();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["config"]["kind"], "http");
        assert_eq!(value["config"]["method"], "GET");
        let reparsed: Node = serde_json::from_value(value).unwrap();
        assert_eq!(reparsed, node);
    }
}
