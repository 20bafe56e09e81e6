use crate::trading::indicator::ema::Ema;
use serde::{Deserialize, Serialize};

pub const VEGAS_FAST_PERIOD: usize = 144;
pub const VEGAS_SLOW_PERIOD: usize = 169;

/// 收盘价相对Vegas通道的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricePosition {
    /// 高于两条通道线
    Above,
    /// 低于两条通道线
    Below,
    /// 在通道内或与通道线重合
    Inside,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VegasValue {
    pub fast: f64,
    pub slow: f64,
}

/// Vegas通道: EMA144 + EMA169
#[derive(Debug)]
pub struct VegasChannel {
    ema_fast: Ema,
    ema_slow: Ema,
}

impl VegasChannel {
    pub fn new() -> Self {
        Self {
            ema_fast: Ema::new(VEGAS_FAST_PERIOD),
            ema_slow: Ema::new(VEGAS_SLOW_PERIOD),
        }
    }

    /// 慢线EMA169形成前返回None
    pub fn next(&mut self, close: f64) -> Option<VegasValue> {
        let fast = self.ema_fast.next(close);
        let slow = self.ema_slow.next(close);
        match (fast, slow) {
            (Some(fast), Some(slow)) => Some(VegasValue { fast, slow }),
            _ => None,
        }
    }

    pub fn classify(close: f64, value: &VegasValue) -> PricePosition {
        let upper = value.fast.max(value.slow);
        let lower = value.fast.min(value.slow);
        if close > upper {
            PricePosition::Above
        } else if close < lower {
            PricePosition::Below
        } else {
            PricePosition::Inside
        }
    }
}

impl Default for VegasChannel {
    fn default() -> Self {
        Self::new()
    }
}
