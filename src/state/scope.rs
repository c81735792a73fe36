use std::fmt;

use serde::{Deserialize, Serialize};

/// 变量作用域
///
/// - `Session`: 以 execution id 命名空间隔离，只属于该执行
/// - `Flow`: 以 flow id 命名空间隔离，同一 flow 的所有执行共享（后写覆盖）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    #[default]
    Session,
    #[serde(alias = "global")]
    Flow,
}

impl VariableScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableScope::Session => "session",
            VariableScope::Flow => "flow",
        }
    }
}

impl fmt::Display for VariableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 变量键 `(scope, owner, key)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableKey {
    pub scope: VariableScope,
    pub owner: String,
    pub key: String,
}

impl VariableKey {
    pub fn new(scope: VariableScope, owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope,
            owner: owner.into(),
            key: key.into(),
        }
    }

    pub fn session(execution_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(VariableScope::Session, execution_id, key)
    }

    pub fn flow(flow_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(VariableScope::Flow, flow_id, key)
    }

    /// 扁平化的存储键，供 KV 后端使用
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.scope.as_str(), self.owner, self.key)
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}
