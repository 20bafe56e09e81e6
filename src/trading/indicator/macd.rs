use serde::{Deserialize, Serialize};

use crate::trading::indicator::ema::Ema;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD = EMA(fast) - EMA(slow),信号线是MACD序列已定义部分上的EMA
///
/// 信号线不吃未定义的MACD值,所以首个完整输出出现在 slow + signal - 1 根收盘价之后
#[derive(Debug)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new() -> Self {
        Self::new_with_periods(12, 26, 9)
    }

    pub fn new_with_periods(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    /// 喂入一个收盘价,MACD线与信号线都形成后才输出
    pub fn next(&mut self, price: f64) -> Option<MacdValue> {
        let fast = self.fast.next(price);
        let slow = self.slow.next(price);
        let macd = match (fast, slow) {
            (Some(f), Some(s)) => f - s,
            _ => return None,
        };
        let signal = self.signal.next(macd)?;
        Some(MacdValue {
            macd,
            signal,
            histogram: macd - signal,
        })
    }
}

impl Default for Macd {
    fn default() -> Self {
        Self::new()
    }
}

/// 对一段收盘价序列求最终MACD值
pub fn macd_last(prices: &[f64]) -> Option<MacdValue> {
    let mut macd = Macd::new();
    let mut last = None;
    for price in prices {
        if let Some(value) = macd.next(*price) {
            last = Some(value);
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_macd_defined_after_slow_plus_signal() {
        let mut macd = Macd::new();
        let mut first_defined = None;
        for i in 1..=60 {
            if macd.next(i as f64).is_some() && first_defined.is_none() {
                first_defined = Some(i);
            }
        }
        // MACD线在第26根形成,信号线再吃9个已定义值
        assert_eq!(first_defined, Some(34));
    }

    #[test]
    fn test_macd_flat_series_is_zero() {
        let prices = vec![50.0; 40];
        let value = macd_last(&prices).unwrap();
        assert_relative_eq!(value.macd, 0.0, epsilon = 1e-9);
        assert_relative_eq!(value.signal, 0.0, epsilon = 1e-9);
        assert_relative_eq!(value.histogram, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_macd_uptrend_is_positive() {
        let prices: Vec<f64> = (1..=60).map(|i| i as f64).collect();
        let value = macd_last(&prices).unwrap();
        assert!(value.macd > 0.0);
        assert_relative_eq!(value.histogram, value.macd - value.signal, epsilon = 1e-12);
    }
}
