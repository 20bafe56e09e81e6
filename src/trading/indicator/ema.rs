/// 指数移动平均线,SMA种子版
///
/// 前period根收盘价不产生输出;第period根时输出这period根的简单平均作为种子,
/// 之后按 value * k + prev * (1 - k) 递推,k = 2 / (period + 1)
#[derive(Debug)]
pub struct Ema {
    period: usize,
    k: f64,
    seed: Vec<f64>,
    current: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            seed: Vec::with_capacity(period),
            current: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// 喂入一个收盘价,数据不足时返回None
    pub fn next(&mut self, value: f64) -> Option<f64> {
        if let Some(prev) = self.current {
            let next = value * self.k + prev * (1.0 - self.k);
            self.current = Some(next);
            return Some(next);
        }
        // 种子阶段先用SMA初始化
        self.seed.push(value);
        if self.seed.len() >= self.period {
            let sma = self.seed.iter().sum::<f64>() / self.period as f64;
            self.seed.clear();
            self.current = Some(sma);
            return Some(sma);
        }
        None
    }

    /// 当前EMA值,尚未形成时为None
    pub fn value(&self) -> Option<f64> {
        self.current
    }
}

/// 对一段收盘价序列求最终EMA值
pub fn ema_last(prices: &[f64], period: usize) -> Option<f64> {
    let mut ema = Ema::new(period);
    let mut last = None;
    for price in prices {
        last = ema.next(*price);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ema_undefined_before_period() {
        let mut ema = Ema::new(5);
        for price in [1.0, 2.0, 3.0, 4.0] {
            assert!(ema.next(price).is_none());
        }
        assert!(ema.value().is_none());
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        let mut ema = Ema::new(5);
        let mut out = None;
        for price in [1.0, 2.0, 3.0, 4.0, 5.0] {
            out = ema.next(price);
        }
        // 第5根输出前5根的简单平均
        assert_relative_eq!(out.unwrap(), 3.0);
    }

    #[test]
    fn test_ema_recursion_after_seed() {
        let mut ema = Ema::new(3);
        for price in [2.0, 4.0, 6.0] {
            ema.next(price);
        }
        // seed = 4.0, k = 0.5
        let next = ema.next(8.0).unwrap();
        assert_relative_eq!(next, 8.0 * 0.5 + 4.0 * 0.5);
        let next = ema.next(10.0).unwrap();
        assert_relative_eq!(next, 10.0 * 0.5 + 6.0 * 0.5);
    }

    #[test]
    fn test_ema_last_matches_streaming() {
        let prices: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let mut streaming = Ema::new(12);
        for price in &prices {
            streaming.next(*price);
        }
        assert_relative_eq!(ema_last(&prices, 12).unwrap(), streaming.value().unwrap());
    }
}
