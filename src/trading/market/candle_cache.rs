use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use tracing::warn;

use crate::app_config::redis as app_redis;
use crate::trading::market::candle_window::{CandleWindow, DEFAULT_WINDOW_CAPACITY};
use crate::CandleItem;

fn make_key(symbol: &str, period: &str) -> String {
    format!("{}:{}", symbol, period)
}

/// 全局K线窗口集合,按(symbol, period)分桶,symbol一律用规范写法(如BTCUSDT)
///
/// 内存窗口是指标计算的唯一数据源;最新一根另外写穿到Redis,
/// 给进程外的消费者看,Redis不可用只降级不报错
pub struct CandleArena {
    windows: Arc<DashMap<String, CandleWindow>>,
    capacity: usize,
    share_to_redis: bool,
}

impl CandleArena {
    pub fn new(capacity: usize, share_to_redis: bool) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            capacity,
            share_to_redis,
        }
    }

    /// 推入一根已收盘K线,返回窗口是否接受
    pub fn upsert(&self, symbol: &str, period: &str, candle: CandleItem) -> bool {
        let key = make_key(symbol, period);
        let mut window = self
            .windows
            .entry(key)
            .or_insert_with(|| CandleWindow::new(self.capacity));
        window.push(candle)
    }

    /// 推入并写穿Redis
    pub async fn upsert_and_share(&self, symbol: &str, period: &str, candle: CandleItem) -> bool {
        let accepted = self.upsert(symbol, period, candle.clone());
        if accepted && self.share_to_redis {
            self.share_latest(symbol, period, &candle).await;
        }
        accepted
    }

    pub fn window_snapshot(&self, symbol: &str, period: &str) -> Vec<CandleItem> {
        self.windows
            .get(&make_key(symbol, period))
            .map(|w| w.snapshot())
            .unwrap_or_default()
    }

    pub fn latest(&self, symbol: &str, period: &str) -> Option<CandleItem> {
        self.windows
            .get(&make_key(symbol, period))
            .and_then(|w| w.last().cloned())
    }

    pub fn window_len(&self, symbol: &str, period: &str) -> usize {
        self.windows
            .get(&make_key(symbol, period))
            .map(|w| w.len())
            .unwrap_or(0)
    }

    async fn share_latest(&self, symbol: &str, period: &str, candle: &CandleItem) {
        let payload = match serde_json::to_string(candle) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("serialize latest candle error: {}", e);
                return;
            }
        };
        match app_redis::get_redis_connection().await {
            Ok(mut conn) => {
                let rkey = app_redis::latest_candle_key(symbol, period);
                let ttl = app_redis::latest_candle_ttl_secs();
                let res: redis::RedisResult<()> = conn.set_ex(rkey, payload, ttl).await;
                if let Err(e) = res {
                    warn!("share latest candle to redis error: {}", e);
                }
            }
            Err(e) => {
                warn!("get redis connection error: {}", e);
            }
        }
    }
}

impl Default for CandleArena {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY, true)
    }
}

/// 默认全局窗口集合
pub static DEFAULT_ARENA: Lazy<Arc<CandleArena>> = Lazy::new(|| Arc::new(CandleArena::default()));

pub fn default_arena() -> Arc<CandleArena> {
    Arc::clone(&DEFAULT_ARENA)
}
