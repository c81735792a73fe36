use std::collections::BTreeMap;
use std::sync::Arc;

use super::scope::{VariableKey, VariableScope};
use super::store::VariableStore;
use crate::error::Result;

/// 绑定到某个 owner 的变量句柄
///
/// session 作用域的 owner 是 execution id，flow 作用域的 owner 是 flow id
#[derive(Clone)]
pub struct ScopedVariables {
    store: Arc<dyn VariableStore>,
    scope: VariableScope,
    owner: String,
}

impl ScopedVariables {
    pub fn new(store: Arc<dyn VariableStore>, scope: VariableScope, owner: impl Into<String>) -> Self {
        Self {
            store,
            scope,
            owner: owner.into(),
        }
    }

    /// execution 专属的 session 变量
    pub fn session(store: Arc<dyn VariableStore>, execution_id: impl Into<String>) -> Self {
        Self::new(store, VariableScope::Session, execution_id)
    }

    /// flow 共享变量
    pub fn flow(store: Arc<dyn VariableStore>, flow_id: impl Into<String>) -> Self {
        Self::new(store, VariableScope::Flow, flow_id)
    }

    pub fn scope(&self) -> VariableScope {
        self.scope
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn key(&self, key: &str) -> VariableKey {
        VariableKey::new(self.scope, self.owner.clone(), key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.key(key)).await
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.store.set(&self.key(key), value.into()).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.key(key)).await
    }

    pub async fn increment(&self, key: &str, delta: f64) -> Result<String> {
        self.store.increment(&self.key(key), delta).await
    }

    pub async fn set_if_absent(&self, key: &str, value: impl Into<String>) -> Result<bool> {
        self.store.set_if_absent(&self.key(key), value.into()).await
    }

    pub async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        self.store.snapshot(self.scope, &self.owner).await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.store.clear(self.scope, &self.owner).await
    }
}
