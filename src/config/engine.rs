use serde::{Deserialize, Serialize};

use super::env::EnvConfig;
use crate::error::{BotFlowError, Result};

/// 引擎运行参数
///
/// 所有字段都有默认值，可以通过 JSON 或 `BOTFLOW_*` 环境变量覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 单次运行（run）允许的最大步数，防止循环图无限执行
    pub max_steps: u32,
    /// input 节点默认等待时长（秒）
    pub input_timeout_secs: u64,
    /// input 节点默认最大重试次数
    pub max_input_retries: u32,
    /// Action Adapter 调用默认超时（毫秒）
    pub action_timeout_ms: u64,
    /// 每个执行的事件广播缓冲区大小
    pub event_buffer: usize,
    /// logs 事件批量大小
    pub logs_batch_size: usize,
    /// 完成的步骤是否记录 session 变量快照
    pub snapshot_variables: bool,
    /// 监控列表默认分页大小
    pub default_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 256,
            input_timeout_secs: 300,
            max_input_retries: 3,
            action_timeout_ms: 10_000,
            event_buffer: 256,
            logs_batch_size: 32,
            snapshot_variables: true,
            default_page_size: 20,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BotFlowError::Config(format!("failed to parse engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 默认值 + 环境变量覆盖
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_MAX_STEPS")? {
            config.max_steps = value;
        }
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_INPUT_TIMEOUT_SECS")? {
            config.input_timeout_secs = value;
        }
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_MAX_INPUT_RETRIES")? {
            config.max_input_retries = value;
        }
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_ACTION_TIMEOUT_MS")? {
            config.action_timeout_ms = value;
        }
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_EVENT_BUFFER")? {
            config.event_buffer = value;
        }
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_LOGS_BATCH_SIZE")? {
            config.logs_batch_size = value;
        }
        if let Some(value) = EnvConfig::parse_optional("BOTFLOW_SNAPSHOT_VARIABLES")? {
            config.snapshot_variables = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_input_timeout_secs(mut self, secs: u64) -> Self {
        self.input_timeout_secs = secs;
        self
    }

    pub fn with_action_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.action_timeout_ms = timeout_ms;
        self
    }

    pub fn with_logs_batch_size(mut self, size: usize) -> Self {
        self.logs_batch_size = size.max(1);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(BotFlowError::Config("max_steps must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(BotFlowError::Config("event_buffer must be positive".into()));
        }
        if self.logs_batch_size == 0 {
            return Err(BotFlowError::Config(
                "logs_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"max_steps": 12}"#).unwrap();
        assert_eq!(config.max_steps, 12);
        assert_eq!(config.input_timeout_secs, 300);
        assert_eq!(config.logs_batch_size, 32);
    }

    #[test]
    fn test_zero_max_steps_rejected() {
        assert!(EngineConfig::from_json(r#"{"max_steps": 0}"#).is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("BOTFLOW_MAX_INPUT_RETRIES", "7");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.max_input_retries, 7);
        std::env::remove_var("BOTFLOW_MAX_INPUT_RETRIES");
    }
}
