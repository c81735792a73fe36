use crate::error::{BotFlowError, Result};
use std::env;
use std::str::FromStr;

/// 环境变量读取
pub struct EnvConfig;

impl EnvConfig {
    /// 获取可选的环境变量，空白值视为未设置
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 解析可选的环境变量，格式错误时返回配置错误
    pub fn parse_optional<T>(key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_env_optional(key) {
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                BotFlowError::Config(format!("environment variable `{key}`: {e}"))
            }),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optional() {
        env::set_var("BOTFLOW_TEST_PARSE_OK", "42");
        assert_eq!(
            EnvConfig::parse_optional::<u32>("BOTFLOW_TEST_PARSE_OK").unwrap(),
            Some(42)
        );
        env::remove_var("BOTFLOW_TEST_PARSE_OK");

        env::set_var("BOTFLOW_TEST_PARSE_BAD", "many");
        assert!(EnvConfig::parse_optional::<u32>("BOTFLOW_TEST_PARSE_BAD").is_err());
        env::remove_var("BOTFLOW_TEST_PARSE_BAD");

        env::set_var("BOTFLOW_TEST_PARSE_BLANK", "  ");
        assert_eq!(
            EnvConfig::parse_optional::<u32>("BOTFLOW_TEST_PARSE_BLANK").unwrap(),
            None
        );
        env::remove_var("BOTFLOW_TEST_PARSE_BLANK");
    }
}
