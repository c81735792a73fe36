// 执行监控与事件流

pub mod events;
mod hub;
mod projection;
mod service;
mod subscription;

pub use events::MonitorEvent;
pub use hub::EventHub;
pub use projection::ExecutionProjection;
pub use service::{ExecutionDetail, ExecutionMonitor};
pub use subscription::ExecutionSubscription;
