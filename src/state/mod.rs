// 变量存储模块

mod context;
mod scope;
mod session;
mod store;

pub use context::VariableView;
pub use scope::{VariableKey, VariableScope};
pub use session::ScopedVariables;
#[cfg(feature = "redis-store")]
pub use store::redis::RedisStore;
pub use store::{format_number, MemoryStore, VariableStore};
