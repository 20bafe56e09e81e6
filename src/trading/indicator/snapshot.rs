use serde::{Deserialize, Serialize};

use crate::trading::indicator::macd::{macd_last, MacdValue};
use crate::trading::indicator::rsi::rsi_last;
use crate::trading::indicator::vegas::{PricePosition, VegasChannel, VegasValue};
use crate::CandleItem;

pub const RSI_PERIOD: usize = 14;

/// 单个(symbol,timeframe)窗口上算出来的指标快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// 窗口内最后一根K线的开盘时间戳
    pub ts: i64,
    pub close: f64,
    pub rsi: f64,
    pub macd: Option<MacdValue>,
    pub vegas: Option<VegasValue>,
    pub position: Option<PricePosition>,
}

impl IndicatorSnapshot {
    /// 给决策提示词用的紧凑描述
    pub fn describe(&self) -> String {
        let macd = match &self.macd {
            Some(m) => format!(
                "macd={:.6} signal={:.6} hist={:.6}",
                m.macd, m.signal, m.histogram
            ),
            None => "macd=insufficient".to_string(),
        };
        let vegas = match (&self.vegas, &self.position) {
            (Some(v), Some(p)) => format!(
                "vegas[ema144={:.6} ema169={:.6} pos={:?}]",
                v.fast, v.slow, p
            ),
            _ => "vegas=insufficient".to_string(),
        };
        format!(
            "close={:.6} rsi{}={:.2} {} {}",
            self.close, RSI_PERIOD, self.rsi, macd, vegas
        )
    }
}

/// 在窗口快照上计算指标,窗口为空时返回None
pub fn compute_snapshot(candles: &[CandleItem]) -> Option<IndicatorSnapshot> {
    let last = candles.last()?;
    let closes: Vec<f64> = candles.iter().map(|c| c.c()).collect();

    let rsi = rsi_last(&closes, RSI_PERIOD);
    let macd = macd_last(&closes);

    let mut channel = VegasChannel::new();
    let mut vegas = None;
    for close in &closes {
        if let Some(value) = channel.next(*close) {
            vegas = Some(value);
        }
    }
    let position = vegas
        .as_ref()
        .map(|value| VegasChannel::classify(last.c(), value));

    Some(IndicatorSnapshot {
        ts: last.ts(),
        close: last.c(),
        rsi,
        macd,
        vegas,
        position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandleItemBuilder;

    fn candle(ts: i64, close: f64) -> CandleItem {
        CandleItemBuilder::new()
            .ts(ts)
            .o(close)
            .h(close + 1.0)
            .l(close - 1.0)
            .c(close)
            .v(10.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_snapshot_empty_window() {
        assert!(compute_snapshot(&[]).is_none());
    }

    #[test]
    fn test_snapshot_short_window_degrades() {
        let candles: Vec<CandleItem> = (0..10).map(|i| candle(i, 100.0 + i as f64)).collect();
        let snapshot = compute_snapshot(&candles).unwrap();
        assert_eq!(snapshot.ts, 9);
        assert_eq!(snapshot.rsi, 0.0);
        assert!(snapshot.macd.is_none());
        assert!(snapshot.vegas.is_none());
        assert!(snapshot.position.is_none());
    }

    #[test]
    fn test_snapshot_full_window_uptrend() {
        let candles: Vec<CandleItem> = (0..200).map(|i| candle(i, 100.0 + i as f64)).collect();
        let snapshot = compute_snapshot(&candles).unwrap();
        assert_eq!(snapshot.ts, 199);
        assert_eq!(snapshot.close, 299.0);
        assert_eq!(snapshot.rsi, 100.0);
        assert!(snapshot.macd.unwrap().macd > 0.0);
        let vegas = snapshot.vegas.unwrap();
        assert!(vegas.fast > vegas.slow);
        assert_eq!(snapshot.position, Some(PricePosition::Above));
        assert!(snapshot.describe().contains("pos=Above"));
    }

    /// 指标计算不得在两次调用之间留任何状态,同一窗口算几遍都一个结果
    #[test]
    fn test_snapshot_recompute_identical() {
        let candles: Vec<CandleItem> = (0..200)
            .map(|i| candle(i, 100.0 + (i as f64 * 0.7).sin() * 20.0))
            .collect();
        let first = compute_snapshot(&candles).unwrap();
        let second = compute_snapshot(&candles).unwrap();
        assert_eq!(first, second);
    }
}
