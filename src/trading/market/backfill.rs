use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::AppError;
use crate::trading::gateway::okx::to_inst_id;
use crate::trading::gateway::retry::with_read_retry;
use crate::trading::market::candle_cache::CandleArena;
use crate::{CandleItem, CandleItemBuilder};

const DEFAULT_PUBLIC_BASE: &str = "https://www.okx.com";
const PAGE_LIMIT: usize = 300;

#[derive(Debug, Deserialize)]
struct PublicCandleResponse {
    code: String,
    msg: String,
    #[serde(default)]
    data: Vec<Vec<String>>,
}

/// 启动时用公共行情接口回填K线窗口,不需要任何凭证
pub struct CandleBackfill {
    client: reqwest::Client,
    base_url: String,
}

impl CandleBackfill {
    pub fn new() -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: std::env::var("MARKET_PUBLIC_BASE")
                .unwrap_or_else(|_| DEFAULT_PUBLIC_BASE.to_string()),
        })
    }

    /// 拉一页历史K线,after为毫秒时间戳,返回比它更旧的数据,时间降序
    async fn fetch_page(
        &self,
        inst_id: &str,
        period: &str,
        after: Option<i64>,
    ) -> Result<Vec<CandleItem>, AppError> {
        let mut url = format!(
            "{}/api/v5/market/candles?instId={}&bar={}&limit={}",
            self.base_url, inst_id, period, PAGE_LIMIT
        );
        if let Some(after) = after {
            url.push_str(&format!("&after={}", after));
        }
        let client = self.client.clone();
        let body: PublicCandleResponse = with_read_retry("market_candles", || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let resp = client.get(&url).send().await?;
                if resp.status().as_u16() == 429 {
                    return Err(AppError::RateLimited("market candles 429".to_string()));
                }
                Ok(resp.json::<PublicCandleResponse>().await?)
            }
        })
        .await?;

        if body.code != "0" {
            return Err(AppError::ExchangeApi {
                code: body.code,
                msg: body.msg,
            });
        }

        let mut out = Vec::with_capacity(body.data.len());
        for row in &body.data {
            // 末列confirm=0是未收盘的那根,不进窗口
            if row.len() > 8 && row[8] == "0" {
                continue;
            }
            match parse_candle_row(row) {
                Ok(candle) => out.push(candle),
                Err(e) => warn!("skip malformed candle row: {}", e),
            }
        }
        Ok(out)
    }

    /// 回填到target根(或交易所没有更老数据为止),按时间升序灌入窗口。
    /// symbol是规范写法(BTCUSDT),窗口也按规范写法建key
    pub async fn backfill_window(
        &self,
        arena: &CandleArena,
        symbol: &str,
        period: &str,
        target: usize,
    ) -> Result<usize, AppError> {
        let inst_id = to_inst_id(symbol)?;
        let mut collected: Vec<CandleItem> = Vec::new();
        let mut after: Option<i64> = None;
        while collected.len() < target {
            let page = self.fetch_page(&inst_id, period, after).await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|c| c.ts());
            collected.extend(page);
        }
        collected.sort_by_key(|c| c.ts());
        collected.dedup_by_key(|c| c.ts());
        if collected.len() > target {
            let skip = collected.len() - target;
            collected.drain(..skip);
        }
        let mut accepted = 0;
        for candle in collected {
            if arena.upsert(symbol, period, candle) {
                accepted += 1;
            }
        }
        info!(
            "backfill {} {} done, window filled {} candles",
            symbol, period, accepted
        );
        Ok(accepted)
    }
}

/// 公共接口K线行: [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]
pub(crate) fn parse_candle_row(row: &[String]) -> Result<CandleItem, AppError> {
    if row.len() < 6 {
        return Err(AppError::Parse(format!("candle row too short: {:?}", row)));
    }
    let num = |i: usize| -> Result<f64, AppError> {
        row[i]
            .parse::<f64>()
            .map_err(|e| AppError::Parse(format!("candle field {}: {}", i, e)))
    };
    let ts = row[0]
        .parse::<i64>()
        .map_err(|e| AppError::Parse(format!("candle ts: {}", e)))?;
    CandleItemBuilder::new()
        .ts(ts)
        .o(num(1)?)
        .h(num(2)?)
        .l(num(3)?)
        .c(num(4)?)
        .v(num(5)?)
        .build()
        .map_err(|e| AppError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_candle_row() {
        let row: Vec<String> = [
            "1716822000000",
            "68000.1",
            "68100.2",
            "67900.3",
            "68050.5",
            "1234.5",
            "0",
            "0",
            "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let candle = parse_candle_row(&row).unwrap();
        assert_eq!(candle.ts(), 1716822000000);
        assert_eq!(candle.o(), 68000.1);
        assert_eq!(candle.c(), 68050.5);
    }

    #[test]
    fn test_parse_candle_row_rejects_short() {
        let row: Vec<String> = vec!["1".to_string(), "2".to_string()];
        assert!(parse_candle_row(&row).is_err());
    }
}
