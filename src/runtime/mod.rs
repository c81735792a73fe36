// 运行时执行引擎模块

mod executor;
mod handlers;
mod processor;
mod recorder;
mod slots;
mod store;
mod sweeper;
mod types;

pub use executor::FlowEngine;
pub use handlers::{match_callback, match_command, validate_input};
pub use slots::{ExecutionSlot, ExecutionSlots, SlotLease};
pub use store::{ExecutionFilter, ExecutionPage, ExecutionStore, MemoryExecutionStore};
pub use sweeper::{SweeperHandle, TimeoutSweeper};
pub use types::{
    AdvanceOutcome, ExecutionState, ExecutionStatus, ExecutionStep, SessionInfo, StepStatus,
    Trigger, TriggerOutcome, WaitType,
};
