/// Wilder RSI
///
/// 平均涨跌幅先用前period个涨跌的简单平均做种子,之后按
/// avg = (avg * (period - 1) + change) / period 平滑
#[derive(Debug)]
pub struct WilderRsi {
    period: usize,
    prev_price: Option<f64>,
    seed_gains: Vec<f64>,
    seed_losses: Vec<f64>,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl WilderRsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_price: None,
            seed_gains: Vec::with_capacity(period),
            seed_losses: Vec::with_capacity(period),
            avg_gain: None,
            avg_loss: None,
        }
    }

    pub fn next(&mut self, price: f64) -> f64 {
        let prev = match self.prev_price.replace(price) {
            Some(p) => p,
            // 第一根价格只建立基准,无涨跌可言
            None => return 0.0,
        };
        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        if let (Some(avg_gain), Some(avg_loss)) = (self.avg_gain, self.avg_loss) {
            let n = self.period as f64;
            let avg_gain = (avg_gain * (n - 1.0) + gain) / n;
            let avg_loss = (avg_loss * (n - 1.0) + loss) / n;
            self.avg_gain = Some(avg_gain);
            self.avg_loss = Some(avg_loss);
            return Self::ratio_to_rsi(avg_gain, avg_loss);
        }

        self.seed_gains.push(gain);
        self.seed_losses.push(loss);
        if self.seed_gains.len() < self.period {
            // 数据不足,约定返回0.0
            return 0.0;
        }
        let n = self.period as f64;
        let avg_gain = self.seed_gains.iter().sum::<f64>() / n;
        let avg_loss = self.seed_losses.iter().sum::<f64>() / n;
        self.seed_gains.clear();
        self.seed_losses.clear();
        self.avg_gain = Some(avg_gain);
        self.avg_loss = Some(avg_loss);
        Self::ratio_to_rsi(avg_gain, avg_loss)
    }

    fn ratio_to_rsi(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            // 单边上涨
            return 100.0;
        }
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// 对一段收盘价序列求最终RSI,样本不足period+1根时返回0.0
pub fn rsi_last(prices: &[f64], period: usize) -> f64 {
    let mut rsi = WilderRsi::new(period);
    let mut last = 0.0;
    for price in prices {
        last = rsi.next(*price);
    }
    if prices.len() < period + 1 {
        return 0.0;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rsi_insufficient_data_is_zero() {
        let prices: Vec<f64> = (1..=14).map(|i| i as f64).collect();
        // 14根价格只有13个涨跌,不够14周期
        assert_eq!(rsi_last(&prices, 14), 0.0);
    }

    #[test]
    fn test_rsi_all_gains_is_hundred() {
        let prices: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        assert_eq!(rsi_last(&prices, 14), 100.0);
    }

    #[test]
    fn test_rsi_all_losses_is_zero() {
        let prices: Vec<f64> = (1..=20).rev().map(|i| i as f64).collect();
        assert_relative_eq!(rsi_last(&prices, 14), 0.0);
    }

    #[test]
    fn test_rsi_wilder_smoothing() {
        // 交替 +2/-1,14周期种子后再喂一根
        let mut prices = vec![100.0];
        for i in 0..14 {
            let last = *prices.last().unwrap();
            if i % 2 == 0 {
                prices.push(last + 2.0);
            } else {
                prices.push(last - 1.0);
            }
        }
        let seed = rsi_last(&prices, 14);
        // 7个+2和7个-1: avg_gain=1.0, avg_loss=0.5, rs=2 => rsi=66.67
        assert_relative_eq!(seed, 100.0 - 100.0 / 3.0, epsilon = 1e-9);

        let mut rsi = WilderRsi::new(14);
        for price in &prices {
            rsi.next(*price);
        }
        let last = *prices.last().unwrap();
        let next = rsi.next(last + 14.0);
        // avg_gain=(1.0*13+14)/14, avg_loss=(0.5*13)/14
        let avg_gain = (13.0 + 14.0) / 14.0;
        let avg_loss = 6.5 / 14.0;
        let expect = 100.0 - 100.0 / (1.0 + avg_gain / avg_loss);
        assert_relative_eq!(next, expect, epsilon = 1e-9);
    }
}
