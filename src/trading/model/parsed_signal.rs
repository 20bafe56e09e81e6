use rbatis::{crud, impl_select, RBatis};
use serde_json::json;
use tracing::{debug, warn};

use crate::app_config::db;

/// 解析成功的信号,signal_id全局唯一且只写一次
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ParsedSignalEntity {
    pub id: Option<i64>,
    /// 去重指纹: 主题 + 收件时间戳
    pub signal_id: String,
    pub symbol: String,
    /// long/short
    pub direction: String,
    pub received_at: i64,
    /// 结构化意图(入场/加仓/止损价位),JSON文本
    pub content_json: String,
    pub raw_content: String,
}

crud!(ParsedSignalEntity {}, "parsed_signals");
impl_select!(ParsedSignalEntity{select_by_signal_id(signal_id:&str) =>
    "`where signal_id=#{signal_id} limit 1`"},"parsed_signals");
impl_select!(ParsedSignalEntity{select_since(since_ms:i64) =>
    "`where received_at >= #{since_ms} order by received_at asc`"},"parsed_signals");

pub struct ParsedSignalModel {
    db: &'static RBatis,
}

impl ParsedSignalModel {
    pub async fn new() -> ParsedSignalModel {
        Self {
            db: db::get_db_client(),
        }
    }

    /// 幂等写入,已存在时返回false且不报错
    ///
    /// 先查后插,并发下撞唯一索引的插入错误也按重复处理
    pub async fn insert_once(&self, signal: &ParsedSignalEntity) -> anyhow::Result<bool> {
        let existing =
            ParsedSignalEntity::select_by_signal_id(self.db, &signal.signal_id).await?;
        if !existing.is_empty() {
            return Ok(false);
        }
        match ParsedSignalEntity::insert(self.db, signal).await {
            Ok(data) => {
                debug!("insert parsed_signals result = {}", json!(data));
                Ok(true)
            }
            Err(e) => {
                let text = e.to_string();
                if text.contains("Duplicate") || text.contains("UNIQUE") {
                    warn!("信号{}并发重复写入,忽略", signal.signal_id);
                    return Ok(false);
                }
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, signal_id: &str) -> anyhow::Result<Option<ParsedSignalEntity>> {
        let rows = ParsedSignalEntity::select_by_signal_id(self.db, signal_id).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn recent_since(&self, since_ms: i64) -> anyhow::Result<Vec<ParsedSignalEntity>> {
        let rows = ParsedSignalEntity::select_since(self.db, since_ms).await?;
        Ok(rows)
    }
}
