use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::scope::{VariableKey, VariableScope};
use crate::error::{BotFlowError, Result};
use crate::flow::parse_number;

/// 变量存储 trait
///
/// 每个操作只涉及单个 key，`increment` 必须按 key 原子执行；
/// 不提供跨 key 事务
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn get(&self, key: &VariableKey) -> Result<Option<String>>;
    async fn set(&self, key: &VariableKey, value: String) -> Result<()>;
    async fn delete(&self, key: &VariableKey) -> Result<()>;
    /// 原子加法，缺失的值视为 0，返回新值
    async fn increment(&self, key: &VariableKey, delta: f64) -> Result<String>;
    /// 仅在 key 不存在时写入，返回是否写入
    async fn set_if_absent(&self, key: &VariableKey, value: String) -> Result<bool>;
    async fn snapshot(&self, scope: VariableScope, owner: &str) -> Result<BTreeMap<String, String>>;
    /// 清空某个 owner 的全部变量，返回删除数量
    async fn clear(&self, scope: VariableScope, owner: &str) -> Result<usize>;
}

/// 数字格式化：整数不带小数点
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

pub(crate) fn apply_delta(key: &VariableKey, current: Option<&str>, delta: f64) -> Result<String> {
    let base = match current {
        None => 0.0,
        Some(raw) if raw.trim().is_empty() => 0.0,
        Some(raw) => parse_number(raw).ok_or_else(|| {
            BotFlowError::Validation(format!("variable `{key}` is not numeric: `{raw}`"))
        })?,
    };
    Ok(format_number(base + delta))
}

type Partition = (VariableScope, String);

/// 内存存储实现
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<Partition, BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn partition(key: &VariableKey) -> Partition {
        (key.scope, key.owner.clone())
    }
}

#[async_trait]
impl VariableStore for MemoryStore {
    async fn get(&self, key: &VariableKey) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .get(&Self::partition(key))
            .and_then(|values| values.get(&key.key).cloned()))
    }

    async fn set(&self, key: &VariableKey, value: String) -> Result<()> {
        self.inner
            .write()
            .entry(Self::partition(key))
            .or_default()
            .insert(key.key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &VariableKey) -> Result<()> {
        if let Some(values) = self.inner.write().get_mut(&Self::partition(key)) {
            values.remove(&key.key);
        }
        Ok(())
    }

    async fn increment(&self, key: &VariableKey, delta: f64) -> Result<String> {
        // 读-改-写在同一把写锁内完成
        let mut inner = self.inner.write();
        let values = inner.entry(Self::partition(key)).or_default();
        let next = apply_delta(key, values.get(&key.key).map(String::as_str), delta)?;
        values.insert(key.key.clone(), next.clone());
        Ok(next)
    }

    async fn set_if_absent(&self, key: &VariableKey, value: String) -> Result<bool> {
        let mut inner = self.inner.write();
        let values = inner.entry(Self::partition(key)).or_default();
        if values.contains_key(&key.key) {
            return Ok(false);
        }
        values.insert(key.key.clone(), value);
        Ok(true)
    }

    async fn snapshot(&self, scope: VariableScope, owner: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .inner
            .read()
            .get(&(scope, owner.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, scope: VariableScope, owner: &str) -> Result<usize> {
        Ok(self
            .inner
            .write()
            .remove(&(scope, owner.to_string()))
            .map(|values| values.len())
            .unwrap_or(0))
    }
}

#[cfg(feature = "redis-store")]
pub mod redis {
    use super::*;
    use redis::AsyncCommands;

    const PREFIX: &str = "botflow";

    /// Redis 存储实现
    ///
    /// 每个 owner 维护一个 key 索引集合，用于 snapshot/clear；
    /// increment 使用 INCRBYFLOAT 保证单 key 原子性
    pub struct RedisStore {
        client: redis::Client,
    }

    impl RedisStore {
        pub fn new(client: redis::Client) -> Self {
            Self { client }
        }

        fn value_key(key: &VariableKey) -> String {
            format!("{PREFIX}:{}", key.storage_key())
        }

        fn index_key(scope: VariableScope, owner: &str) -> String {
            format!("{PREFIX}:{}:{}:__keys", scope.as_str(), owner)
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| BotFlowError::Store(e.to_string()))
        }
    }

    fn store_err(e: redis::RedisError) -> BotFlowError {
        BotFlowError::Store(e.to_string())
    }

    #[async_trait]
    impl VariableStore for RedisStore {
        async fn get(&self, key: &VariableKey) -> Result<Option<String>> {
            let mut conn = self.connection().await?;
            conn.get(Self::value_key(key)).await.map_err(store_err)
        }

        async fn set(&self, key: &VariableKey, value: String) -> Result<()> {
            let mut conn = self.connection().await?;
            let _: () = conn
                .set(Self::value_key(key), value)
                .await
                .map_err(store_err)?;
            let _: () = conn
                .sadd(Self::index_key(key.scope, &key.owner), &key.key)
                .await
                .map_err(store_err)?;
            Ok(())
        }

        async fn delete(&self, key: &VariableKey) -> Result<()> {
            let mut conn = self.connection().await?;
            let _: () = conn.del(Self::value_key(key)).await.map_err(store_err)?;
            let _: () = conn
                .srem(Self::index_key(key.scope, &key.owner), &key.key)
                .await
                .map_err(store_err)?;
            Ok(())
        }

        async fn increment(&self, key: &VariableKey, delta: f64) -> Result<String> {
            let mut conn = self.connection().await?;
            let value: f64 = conn
                .incr(Self::value_key(key), delta)
                .await
                .map_err(store_err)?;
            let _: () = conn
                .sadd(Self::index_key(key.scope, &key.owner), &key.key)
                .await
                .map_err(store_err)?;
            Ok(format_number(value))
        }

        async fn set_if_absent(&self, key: &VariableKey, value: String) -> Result<bool> {
            let mut conn = self.connection().await?;
            let written: bool = conn
                .set_nx(Self::value_key(key), value)
                .await
                .map_err(store_err)?;
            if written {
                let _: () = conn
                    .sadd(Self::index_key(key.scope, &key.owner), &key.key)
                    .await
                    .map_err(store_err)?;
            }
            Ok(written)
        }

        async fn snapshot(
            &self,
            scope: VariableScope,
            owner: &str,
        ) -> Result<BTreeMap<String, String>> {
            let mut conn = self.connection().await?;
            let keys: Vec<String> = conn
                .smembers(Self::index_key(scope, owner))
                .await
                .map_err(store_err)?;
            let mut values = BTreeMap::new();
            for name in keys {
                let key = VariableKey::new(scope, owner, name.clone());
                let value: Option<String> =
                    conn.get(Self::value_key(&key)).await.map_err(store_err)?;
                if let Some(value) = value {
                    values.insert(name, value);
                }
            }
            Ok(values)
        }

        async fn clear(&self, scope: VariableScope, owner: &str) -> Result<usize> {
            let mut conn = self.connection().await?;
            let index = Self::index_key(scope, owner);
            let keys: Vec<String> = conn.smembers(&index).await.map_err(store_err)?;
            for name in &keys {
                let key = VariableKey::new(scope, owner, name.clone());
                let _: () = conn.del(Self::value_key(&key)).await.map_err(store_err)?;
            }
            let _: () = conn.del(&index).await.map_err(store_err)?;
            Ok(keys.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn test_increment_rejects_non_numeric() {
        let store = MemoryStore::new();
        let key = VariableKey::session("exec-1", "name");
        store.set(&key, "alice".into()).await.unwrap();
        assert!(store.increment(&key, 1.0).await.is_err());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("alice"));
    }
}
