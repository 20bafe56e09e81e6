use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::debug;

use crate::app_config;
use crate::error::AppError;

/// 首次启动(或游标丢失)时往回看多久的邮件
pub const FIRST_LOOKBACK_MS: i64 = 72 * 3600 * 1000;

/// 轮询游标的持久化抽象,按邮箱账号维度记一个毫秒时间戳。
/// 游标只在一轮完整成功后推进,中途失败下一轮从原地重扫,
/// 重复拉到的邮件由落库去重吸收。
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, account: &str) -> Result<Option<i64>, AppError>;
    async fn save(&self, account: &str, cursor_ms: i64) -> Result<(), AppError>;
}

/// Redis 实现,进程重启后游标还在
pub struct RedisCursorStore;

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn load(&self, account: &str) -> Result<Option<i64>, AppError> {
        let mut conn = app_config::redis::get_redis_connection()
            .await
            .map_err(|e| AppError::DbError(e.to_string()))?;
        let key = app_config::redis::signal_cursor_key(account);
        let value: Option<String> = conn.get(&key).await?;
        Ok(value.and_then(|v| v.parse::<i64>().ok()))
    }

    async fn save(&self, account: &str, cursor_ms: i64) -> Result<(), AppError> {
        let mut conn = app_config::redis::get_redis_connection()
            .await
            .map_err(|e| AppError::DbError(e.to_string()))?;
        let key = app_config::redis::signal_cursor_key(account);
        conn.set::<_, _, ()>(&key, cursor_ms.to_string()).await?;
        debug!("信号游标已推进: {} -> {}", account, cursor_ms);
        Ok(())
    }
}

/// 内存实现,测试用
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<String, i64>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, account: &str) -> Result<Option<i64>, AppError> {
        Ok(self.cursors.get(account).map(|v| *v))
    }

    async fn save(&self, account: &str, cursor_ms: i64) -> Result<(), AppError> {
        self.cursors.insert(account.to_string(), cursor_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cursor_round_trip() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load("a@b.com").await.unwrap(), None);
        store.save("a@b.com", 1_700_000_000_000).await.unwrap();
        assert_eq!(store.load("a@b.com").await.unwrap(), Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_memory_cursor_is_per_account() {
        let store = MemoryCursorStore::new();
        store.save("a@b.com", 1).await.unwrap();
        assert_eq!(store.load("c@d.com").await.unwrap(), None);
    }
}
