// 引擎配置

mod engine;
mod env;

pub use engine::EngineConfig;
pub use env::EnvConfig;
