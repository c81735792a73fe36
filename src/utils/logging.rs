use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEBUG_VAR: &str = "BOTFLOW_DEBUG";

/// 日志配置
pub struct LoggingConfig;

impl LoggingConfig {
    /// 初始化日志系统
    ///
    /// 支持通过环境变量配置：
    /// - RUST_LOG: 设置日志级别（error, warn, info, debug, trace）
    /// - BOTFLOW_DEBUG: 启用详细调试输出（target、文件、行号、线程）
    ///
    /// 使用示例：
    /// ```no_run
    /// use botflow::utils::LoggingConfig;
    ///
    /// fn main() {
    ///     LoggingConfig::init();
    /// }
    /// ```
    pub fn init() {
        let is_debug = Self::is_debug();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Self::default_filter(is_debug)));

        let fmt_layer = fmt::layer()
            .with_target(is_debug)
            .with_file(is_debug)
            .with_line_number(is_debug)
            .with_thread_ids(is_debug);

        // 重复初始化（例如多个测试）时保留已有的 subscriber
        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok();

        if installed && is_debug {
            tracing::debug!("debug logging enabled");
        }
    }

    /// 使用自定义过滤器初始化
    pub fn init_with_filter(filter: &str) {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(fmt::layer())
            .try_init();
    }

    pub fn is_debug() -> bool {
        env::var(DEBUG_VAR).is_ok()
    }

    fn default_filter(is_debug: bool) -> &'static str {
        if is_debug {
            "botflow=debug,info"
        } else {
            "botflow=info,warn"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_follows_debug_flag() {
        assert_eq!(LoggingConfig::default_filter(false), "botflow=info,warn");
        assert_eq!(LoggingConfig::default_filter(true), "botflow=debug,info");
    }
}
