//! 登录会话存储
//!
//! 当前登录用户以 JSON 形式保存在本地键值存储的 `user` 键下。读取失败或数据损坏都视为
//! “未登录”，由上层回到登录流程；会话没有过期和刷新机制，直到被下一次登录覆盖。

use crate::im::error::{ChatError, ChatResult};
use crate::im::types::User;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 保存登录用户的键
pub const SESSION_KEY: &str = "user";

/// 本地持久化键值存储
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// 进程内存储（测试 / 演示）
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// 基于 SQLite 的存储（local_storage 表由迁移创建）
pub struct SqliteStorage {
    db: Pool<Sqlite>,
}

impl SqliteStorage {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 连接数据库并执行迁移
    pub async fn connect(db_url: &str) -> Result<Self> {
        let db = crate::im::db::create_sqlite_pool_with_migration(db_url).await?;
        Ok(Self::new(db))
    }
}

#[async_trait]
impl LocalStorage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM local_storage WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .with_context(|| format!("读取本地存储失败: {}", key))?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO local_storage (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.db)
        .await
        .with_context(|| format!("写入本地存储失败: {}", key))?;
        debug!("[Session] 已写入本地存储: {}", key);
        Ok(())
    }
}

/// 登录会话存储
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn LocalStorage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    /// 读取登录用户；不存在或损坏时返回 `None`，从不报错
    pub async fn load(&self) -> Option<User> {
        match self.try_load().await {
            Ok(user) => user,
            Err(e) => {
                warn!("[Session] ⚠️ 本地会话不可用，按未登录处理: {}", e);
                None
            }
        }
    }

    /// 读取登录用户，区分“未登录”和“数据损坏”
    pub async fn try_load(&self) -> ChatResult<Option<User>> {
        let raw = self
            .storage
            .get(SESSION_KEY)
            .await
            .map_err(|e| ChatError::Malformed(format!("{:#}", e)))?;
        let Some(raw) = raw else {
            debug!("[Session] 本地没有登录会话");
            return Ok(None);
        };
        let user: User =
            serde_json::from_str(&raw).map_err(|e| ChatError::Malformed(e.to_string()))?;
        Ok(Some(user))
    }

    /// 保存登录用户
    pub async fn save(&self, user: &User) -> ChatResult<()> {
        let raw = serde_json::to_string(user)
            .context("序列化登录用户失败")?;
        self.storage.set(SESSION_KEY, &raw).await?;
        info!("[Session] 💾 已保存登录会话: {}", user.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User {
            id: "u1".to_string(),
            full_name: "Alice".to_string(),
            mobile_number: "+919876543210".to_string(),
            avatar_url: None,
            role: "member".to_string(),
        }
    }

    #[tokio::test]
    async fn save_then_load_returns_user() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        assert!(store.load().await.is_none());
        store.save(&alice()).await.unwrap();
        assert_eq!(store.load().await, Some(alice()));
    }

    #[tokio::test]
    async fn malformed_session_is_treated_as_signed_out() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_KEY, "{not json").await.unwrap();
        let store = SessionStore::new(storage);
        assert!(matches!(store.try_load().await, Err(ChatError::Malformed(_))));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn sqlite_storage_overwrites_previous_session() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let store = SessionStore::new(Arc::new(storage));
        store.save(&alice()).await.unwrap();

        let mut bob = alice();
        bob.id = "u2".to_string();
        bob.full_name = "Bob".to_string();
        store.save(&bob).await.unwrap();

        assert_eq!(store.load().await.map(|u| u.id), Some("u2".to_string()));
    }
}
