pub mod actions;
pub mod config;
pub mod error;
pub mod flow;
pub mod monitor;
pub mod runtime;
pub mod state;
pub mod utils;

pub use actions::{ActionAdapter, AdapterError, ExternalRequest, ExternalResponse, RecordingAdapter};
#[cfg(feature = "http-adapter")]
pub use actions::http::HttpActionAdapter;
pub use config::EngineConfig;
pub use error::{BotFlowError, GraphError, Result};
pub use flow::{
    load_draft_from_file, load_draft_from_str, validate_graph, Connection, ConnectionKind,
    FlowBuilder, FlowDocument, FlowDraft, FlowSettings, FlowStore, FlowVariable, Node, NodeConfig,
    NodeType,
};
pub use monitor::{
    EventHub, ExecutionDetail, ExecutionMonitor, ExecutionProjection, ExecutionSubscription,
    MonitorEvent,
};
pub use runtime::{
    AdvanceOutcome, ExecutionFilter, ExecutionPage, ExecutionState, ExecutionStatus,
    ExecutionStep, ExecutionStore, FlowEngine, MemoryExecutionStore, SessionInfo, StepStatus,
    TimeoutSweeper, Trigger, TriggerOutcome, WaitType,
};
pub use state::{MemoryStore, ScopedVariables, VariableScope, VariableStore, VariableView};
#[cfg(feature = "redis-store")]
pub use state::RedisStore;
pub use utils::logging;
