use dashmap::DashMap;

use crate::error::AppError;

/// 单个交易对的数量精度规则
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolRule {
    pub qty_step: f64,
    pub qty_decimals: u32,
    pub min_qty: f64,
}

impl SymbolRule {
    /// 从交易所返回的步长字符串构造,如"0.001"
    pub fn from_step_str(step: &str, min_qty: f64) -> Result<Self, AppError> {
        let qty_step = step
            .parse::<f64>()
            .map_err(|e| AppError::Precision(format!("步长解析失败 {}: {}", step, e)))?;
        if qty_step <= 0.0 {
            return Err(AppError::Precision(format!("非法步长: {}", step)));
        }
        let qty_decimals = step
            .split('.')
            .nth(1)
            .map(|frac| frac.trim_end_matches('0').len() as u32)
            .unwrap_or(0);
        Ok(Self {
            qty_step,
            qty_decimals,
            min_qty,
        })
    }

    /// 从小数位数构造,步长取10^-decimals
    pub fn from_decimals(decimals: u32, min_qty: f64) -> Self {
        Self {
            qty_step: 10f64.powi(-(decimals as i32)),
            qty_decimals: decimals,
            min_qty,
        }
    }

    /// 向零截断到步长倍数并按位数渲染,截断后低于最小下单量算精度错误
    pub fn format(&self, qty: f64) -> Result<String, AppError> {
        if !qty.is_finite() || qty <= 0.0 {
            return Err(AppError::Precision(format!("非法数量: {}", qty)));
        }
        // 1e-9补偿浮点除法误差,只会向上补不会越过下一档
        let steps = (qty / self.qty_step + 1e-9).floor();
        let truncated = steps * self.qty_step;
        if truncated < self.min_qty || truncated <= 0.0 {
            return Err(AppError::Precision(format!(
                "数量{}截断后{:.width$}低于最小下单量{}",
                qty,
                truncated,
                self.min_qty,
                width = self.qty_decimals as usize
            )));
        }
        Ok(format!(
            "{:.width$}",
            truncated,
            width = self.qty_decimals as usize
        ))
    }
}

/// 精度规则按symbol缓存,读出即拷贝,规则几乎不变所以不做失效
pub struct RuleCache<R: Clone> {
    map: DashMap<String, R>,
}

impl<R: Clone> RuleCache<R> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<R> {
        self.map.get(symbol).map(|r| r.clone())
    }

    pub fn insert(&self, symbol: &str, rule: R) {
        self.map.insert(symbol.to_string(), rule);
    }
}

impl<R: Clone> Default for RuleCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_from_step_str() {
        let rule = SymbolRule::from_step_str("0.001", 0.001).unwrap();
        assert_eq!(rule.qty_decimals, 3);
        let rule = SymbolRule::from_step_str("1", 1.0).unwrap();
        assert_eq!(rule.qty_decimals, 0);
        // 交易所偶尔给"0.010"这种带尾零的
        let rule = SymbolRule::from_step_str("0.010", 0.01).unwrap();
        assert_eq!(rule.qty_decimals, 2);
        assert!(SymbolRule::from_step_str("abc", 0.0).is_err());
        assert!(SymbolRule::from_step_str("0", 0.0).is_err());
    }

    #[test]
    fn test_format_truncates_toward_zero() {
        let rule = SymbolRule::from_step_str("0.01", 0.01).unwrap();
        assert_eq!(rule.format(0.129).unwrap(), "0.12");
        assert_eq!(rule.format(0.1299999).unwrap(), "0.12");
        assert_eq!(rule.format(5.0).unwrap(), "5.00");

        let rule = SymbolRule::from_step_str("1", 1.0).unwrap();
        assert_eq!(rule.format(3.9).unwrap(), "3");

        let rule = SymbolRule::from_step_str("0.5", 0.5).unwrap();
        assert_eq!(rule.format(1.37).unwrap(), "1.0");
    }

    #[test]
    fn test_format_exact_step_not_eaten_by_epsilon() {
        let rule = SymbolRule::from_step_str("0.001", 0.001).unwrap();
        assert_eq!(rule.format(0.003).unwrap(), "0.003");
        assert_eq!(rule.format(0.1).unwrap(), "0.100");
    }

    #[test]
    fn test_format_below_minimum_is_precision_error() {
        let rule = SymbolRule::from_step_str("0.001", 0.01).unwrap();
        let err = rule.format(0.0042).unwrap_err();
        assert!(matches!(err, AppError::Precision(_)));
        assert!(rule.format(-1.0).is_err());
        assert!(rule.format(f64::NAN).is_err());
    }

    #[test]
    fn test_rule_cache_copy_on_read() {
        let cache: RuleCache<SymbolRule> = RuleCache::new();
        assert!(cache.get("BTCUSDT").is_none());
        cache.insert("BTCUSDT", SymbolRule::from_decimals(3, 0.001));
        let rule = cache.get("BTCUSDT").unwrap();
        assert_eq!(rule.qty_decimals, 3);
    }
}
