use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::flow::nodes::{Node, NodeType};
use crate::state::VariableScope;

/// Flow 核心类型定义

/// 连线类型
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    #[default]
    Default,
    True,
    False,
    Error,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Default => "default",
            ConnectionKind::True => "true",
            ConnectionKind::False => "false",
            ConnectionKind::Error => "error",
        }
    }
}

/// 节点之间的有向连线
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, alias = "source_handle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ConnectionKind,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        kind: ConnectionKind,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            kind,
        }
    }

    /// 未显式声明类型时，按 sourceHandle 推断（true/false/error）
    pub fn effective_kind(&self) -> ConnectionKind {
        if self.kind != ConnectionKind::Default {
            return self.kind;
        }
        match self.source_handle.as_deref() {
            Some("true") => ConnectionKind::True,
            Some("false") => ConnectionKind::False,
            Some("error") => ConnectionKind::Error,
            _ => ConnectionKind::Default,
        }
    }
}

/// Flow 变量声明
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowVariable {
    pub name: String,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FlowVariable {
    pub fn new(name: impl Into<String>, scope: VariableScope) -> Self {
        Self {
            name: name.into(),
            scope,
            default: None,
            description: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Flow 级别设置，覆盖引擎默认值
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_timeout_ms: Option<u64>,
}

impl FlowSettings {
    pub fn max_steps(&self, config: &EngineConfig) -> u32 {
        self.max_steps.unwrap_or(config.max_steps)
    }

    pub fn input_timeout_secs(&self, config: &EngineConfig) -> u64 {
        self.input_timeout_secs.unwrap_or(config.input_timeout_secs)
    }

    pub fn max_input_retries(&self, config: &EngineConfig) -> u32 {
        self.max_input_retries.unwrap_or(config.max_input_retries)
    }

    pub fn action_timeout_ms(&self, config: &EngineConfig) -> u64 {
        self.action_timeout_ms.unwrap_or(config.action_timeout_ms)
    }
}

/// 编辑器提交的图内容（尚未分配版本）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDraft {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<FlowVariable>,
    #[serde(default)]
    pub settings: FlowSettings,
}

/// 不可变的 Flow 文档，由 `(flow_id, version)` 唯一标识
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDocument {
    pub flow_id: String,
    pub project_id: String,
    pub version: u32,
    pub name: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<FlowVariable>,
    #[serde(default)]
    pub settings: FlowSettings,
    pub created_at: DateTime<Utc>,
}

impl FlowDocument {
    pub fn from_draft(
        flow_id: impl Into<String>,
        project_id: impl Into<String>,
        version: u32,
        draft: FlowDraft,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            project_id: project_id.into(),
            version,
            name: draft.name,
            nodes: draft.nodes,
            connections: draft.connections,
            variables: draft.variables,
            settings: draft.settings,
            created_at: Utc::now(),
        }
    }

    pub fn to_draft(&self) -> FlowDraft {
        FlowDraft {
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            connections: self.connections.clone(),
            variables: self.variables.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| node.node_type() == NodeType::Start)
    }

    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Connection> {
        let node_id = node_id.to_string();
        self.connections
            .iter()
            .filter(move |connection| connection.source == node_id)
    }

    pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &Connection> {
        let node_id = node_id.to_string();
        self.connections
            .iter()
            .filter(move |connection| connection.target == node_id)
    }

    /// 按类型查找出边目标
    pub fn next_node(&self, node_id: &str, kind: ConnectionKind) -> Option<&str> {
        self.outgoing(node_id)
            .find(|connection| connection.effective_kind() == kind)
            .map(|connection| connection.target.as_str())
    }

    pub fn has_edge(&self, node_id: &str, kind: ConnectionKind) -> bool {
        self.next_node(node_id, kind).is_some()
    }

    pub fn declared(&self, scope: VariableScope) -> impl Iterator<Item = &FlowVariable> {
        self.variables
            .iter()
            .filter(move |variable| variable.scope == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_kind_inferred_from_handle() {
        let connection: Connection = serde_json::from_value(json!({
            "id": "e1",
            "source": "check",
            "target": "vip",
            "sourceHandle": "true"
        }))
        .unwrap();
        assert_eq!(connection.kind, ConnectionKind::Default);
        assert_eq!(connection.effective_kind(), ConnectionKind::True);
    }

    #[test]
    fn test_explicit_kind_wins() {
        let connection: Connection = serde_json::from_value(json!({
            "id": "e1",
            "source": "call",
            "target": "fallback",
            "sourceHandle": "out",
            "type": "error"
        }))
        .unwrap();
        assert_eq!(connection.effective_kind(), ConnectionKind::Error);
    }
}
