// Flow 模块 - 流程文档定义、校验与存储

pub mod builder;
pub mod conditions;
pub mod loader;
pub mod nodes;
pub mod registry;
pub mod types;
pub mod validation;

// 重新导出核心类型
pub use builder::FlowBuilder;
pub use conditions::{parse_number, ConditionOperator};
pub use loader::{load_draft_from_file, load_draft_from_str, load_draft_from_value};
pub use nodes::{
    ActionConfig, ActionKind, CallbackConfig, CallbackMatch, CommandConfig, ConditionConfig,
    InputConfig, InputRule, Keyboard, KeyboardButton, MessageConfig, MiddlewareConfig,
    MiddlewareKind, Node, NodeConfig, NodeType, SessionConfig, SessionOperation, StartConfig,
};
pub use registry::{FlowStore, FlowSummary};
pub use types::{
    Connection, ConnectionKind, FlowDocument, FlowDraft, FlowSettings, FlowVariable,
};
pub use validation::validate_graph;
