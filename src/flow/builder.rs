use crate::flow::conditions::ConditionOperator;
use crate::flow::nodes::{
    ActionConfig, ActionKind, CallbackConfig, CallbackMatch, CommandConfig, ConditionConfig,
    InputConfig, InputRule, Keyboard, MessageConfig, MiddlewareConfig, MiddlewareKind, Node,
    NodeConfig, SessionConfig, SessionOperation, StartConfig,
};
use crate::flow::types::{
    Connection, ConnectionKind, FlowDocument, FlowDraft, FlowSettings, FlowVariable,
};
use crate::state::VariableScope;

/// Flow 构建器
///
/// 主要用于测试和 CLI，编辑器产出的文档走 JSON 加载
pub struct FlowBuilder {
    name: String,
    nodes: Vec<Node>,
    connections: Vec<Connection>,
    variables: Vec<FlowVariable>,
    settings: FlowSettings,
}

impl FlowBuilder {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            settings: FlowSettings::default(),
        }
    }

    pub fn node(&mut self, node: Node) -> &mut Self {
        self.nodes.retain(|existing| existing.id != node.id);
        self.nodes.push(node);
        self
    }

    pub fn start(&mut self, id: &str) -> &mut Self {
        self.node(Node::new(id, NodeConfig::Start(StartConfig::default())))
    }

    pub fn start_command(&mut self, id: &str, command: &str) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Start(StartConfig {
                command: Some(command.to_string()),
                aliases: Vec::new(),
            }),
        ))
    }

    pub fn message(&mut self, id: &str, text: &str) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Message(MessageConfig {
                text: text.to_string(),
                keyboard: None,
            }),
        ))
    }

    pub fn message_with_keyboard(&mut self, id: &str, text: &str, keyboard: Keyboard) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Message(MessageConfig {
                text: text.to_string(),
                keyboard: Some(keyboard),
            }),
        ))
    }

    pub fn command(&mut self, id: &str, command: &str, aliases: &[&str]) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Command(CommandConfig {
                command: command.to_string(),
                aliases: aliases.iter().map(|alias| alias.to_string()).collect(),
                case_sensitive: false,
                args_variable: None,
            }),
        ))
    }

    pub fn callback(&mut self, id: &str, pattern: &str, match_type: CallbackMatch) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Callback(CallbackConfig {
                pattern: pattern.to_string(),
                match_type,
                data_variable: None,
            }),
        ))
    }

    pub fn input(&mut self, id: &str, prompt: &str, variable: &str, rule: InputRule) -> &mut Self {
        self.input_config(
            id,
            InputConfig {
                prompt: prompt.to_string(),
                variable: variable.to_string(),
                validation: rule,
                ..InputConfig::default()
            },
        )
    }

    pub fn input_config(&mut self, id: &str, config: InputConfig) -> &mut Self {
        self.node(Node::new(id, NodeConfig::Input(config)))
    }

    pub fn condition(
        &mut self,
        id: &str,
        variable: &str,
        operator: ConditionOperator,
        value: &str,
    ) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Condition(ConditionConfig {
                variable: variable.to_string(),
                operator,
                value: value.to_string(),
            }),
        ))
    }

    pub fn action(&mut self, id: &str, kind: ActionKind, handle_errors: bool) -> &mut Self {
        self.action_config(
            id,
            ActionConfig {
                kind,
                handle_errors,
                timeout_ms: None,
                result_variable: None,
            },
        )
    }

    pub fn action_config(&mut self, id: &str, config: ActionConfig) -> &mut Self {
        self.node(Node::new(id, NodeConfig::Action(config)))
    }

    pub fn middleware(&mut self, id: &str, kind: MiddlewareKind, priority: i32) -> &mut Self {
        self.node(Node::new(
            id,
            NodeConfig::Middleware(MiddlewareConfig { kind, priority }),
        ))
    }

    pub fn session(&mut self, id: &str, config: SessionConfig) -> &mut Self {
        self.node(Node::new(id, NodeConfig::Session(config)))
    }

    pub fn session_set(
        &mut self,
        id: &str,
        scope: VariableScope,
        key: &str,
        value: &str,
    ) -> &mut Self {
        self.session(
            id,
            SessionConfig {
                operation: SessionOperation::Set,
                scope,
                key: key.to_string(),
                value: Some(value.to_string()),
                amount: None,
                target: None,
            },
        )
    }

    pub fn session_increment(&mut self, id: &str, scope: VariableScope, key: &str) -> &mut Self {
        self.session(
            id,
            SessionConfig {
                operation: SessionOperation::Increment,
                scope,
                key: key.to_string(),
                value: None,
                amount: None,
                target: None,
            },
        )
    }

    pub fn end(&mut self, id: &str) -> &mut Self {
        self.node(Node::new(id, NodeConfig::End))
    }

    pub fn connect(&mut self, from: &str, to: &str) -> &mut Self {
        self.connect_kind(from, to, ConnectionKind::Default)
    }

    pub fn connect_kind(&mut self, from: &str, to: &str, kind: ConnectionKind) -> &mut Self {
        let id = format!("e{}", self.connections.len() + 1);
        self.connections.push(Connection::new(id, from, to, kind));
        self
    }

    pub fn variable(&mut self, variable: FlowVariable) -> &mut Self {
        self.variables.push(variable);
        self
    }

    pub fn settings(&mut self, settings: FlowSettings) -> &mut Self {
        self.settings = settings;
        self
    }

    pub fn max_steps(&mut self, max_steps: u32) -> &mut Self {
        self.settings.max_steps = Some(max_steps);
        self
    }

    pub fn build_draft(&self) -> FlowDraft {
        FlowDraft {
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            connections: self.connections.clone(),
            variables: self.variables.clone(),
            settings: self.settings.clone(),
        }
    }

    /// 直接生成版本 1 的文档（不经过 FlowStore）
    pub fn build_document(&self, flow_id: &str, project_id: &str) -> FlowDocument {
        FlowDocument::from_draft(flow_id, project_id, 1, self.build_draft())
    }
}
