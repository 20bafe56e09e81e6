use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AppError;
use crate::trading::model::parsed_signal::{ParsedSignalEntity, ParsedSignalModel};

/// 已解析信号的存取抽象。落库实现走 MySQL,内存实现给测试用,
/// 去重语义(同指纹只落一条)两边保持一致。
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// 按 signal_id 幂等写入,真正新插入返回 true,已存在返回 false
    async fn insert_once(&self, signal: &ParsedSignalEntity) -> Result<bool, AppError>;
    async fn get(&self, signal_id: &str) -> Result<Option<ParsedSignalEntity>, AppError>;
    /// 指定时间之后收到的信号,按收件时间升序
    async fn recent_since(&self, since_ms: i64) -> Result<Vec<ParsedSignalEntity>, AppError>;
}

pub struct DbSignalStore {
    model: ParsedSignalModel,
}

impl DbSignalStore {
    pub async fn new() -> Self {
        Self {
            model: ParsedSignalModel::new().await,
        }
    }
}

#[async_trait]
impl SignalStore for DbSignalStore {
    async fn insert_once(&self, signal: &ParsedSignalEntity) -> Result<bool, AppError> {
        self.model
            .insert_once(signal)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }

    async fn get(&self, signal_id: &str) -> Result<Option<ParsedSignalEntity>, AppError> {
        self.model
            .get(signal_id)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }

    async fn recent_since(&self, since_ms: i64) -> Result<Vec<ParsedSignalEntity>, AppError> {
        self.model
            .recent_since(since_ms)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }
}

#[derive(Default)]
pub struct MemorySignalStore {
    signals: DashMap<String, ParsedSignalEntity>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn insert_once(&self, signal: &ParsedSignalEntity) -> Result<bool, AppError> {
        match self.signals.entry(signal.signal_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(signal.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, signal_id: &str) -> Result<Option<ParsedSignalEntity>, AppError> {
        Ok(self.signals.get(signal_id).map(|s| s.clone()))
    }

    async fn recent_since(&self, since_ms: i64) -> Result<Vec<ParsedSignalEntity>, AppError> {
        let mut rows: Vec<ParsedSignalEntity> = self
            .signals
            .iter()
            .filter(|s| s.received_at >= since_ms)
            .map(|s| s.clone())
            .collect();
        rows.sort_by_key(|s| s.received_at);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(signal_id: &str, received_at: i64) -> ParsedSignalEntity {
        ParsedSignalEntity {
            id: None,
            signal_id: signal_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: "long".to_string(),
            received_at,
            content_json: "{}".to_string(),
            raw_content: "做多 BTCUSDT".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_once_dedupes_by_signal_id() {
        let store = MemorySignalStore::new();
        assert!(store.insert_once(&sample("fp-1", 100)).await.unwrap());
        assert!(!store.insert_once(&sample("fp-1", 100)).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_recent_since_sorted_ascending() {
        let store = MemorySignalStore::new();
        store.insert_once(&sample("b", 300)).await.unwrap();
        store.insert_once(&sample("a", 100)).await.unwrap();
        store.insert_once(&sample("c", 200)).await.unwrap();
        let rows = store.recent_since(150).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.signal_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }
}
