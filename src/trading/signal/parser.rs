use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::trading::gateway::types::PositionSide;

/// 从信号邮件文本里解析出来的结构化交易意图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalIntent {
    /// 规范化后的交易对,例如 BTCUSDT
    pub symbol: String,
    pub direction: PositionSide,
    pub entry_price: Option<f64>,
    /// 加仓价位,按出现顺序,可能为空
    pub add_prices: Vec<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

const LONG_KEYS: [&str; 3] = ["做多", "多单", "long"];
const SHORT_KEYS: [&str; 3] = ["做空", "空单", "short"];
const ENTRY_KEYS: [&str; 3] = ["入场", "进场", "entry"];
const ADD_KEYS: [&str; 2] = ["加仓", "add"];
const STOP_KEYS: [&str; 3] = ["止损", "stop", "sl"];
const PROFIT_KEYS: [&str; 3] = ["止盈", "target", "tp"];

/// 所有会切断价位段落的关键词,用于圈定某个关键词之后属于它的数字
const SEGMENT_STOPS: [&str; 15] = [
    "做多", "做空", "多单", "空单", "入场", "进场", "加仓", "止损", "止盈", "entry", "add",
    "stop", "target", "sl", "tp",
];

/// 英文大写词里不可能是币种的那批,抽裸币种时要跳过
const SYMBOL_BLOCKLIST: [&str; 10] = [
    "LONG", "SHORT", "ENTRY", "ADD", "STOP", "TARGET", "USDT", "USDC", "USD", "TP",
];

/// 把主题和正文拼起来解析,主题里常常已经带了方向和币种
pub fn parse_signal(subject: &str, body: &str) -> Result<SignalIntent, AppError> {
    parse_signal_text(&format!("{}\n{}", subject, body))
}

/// 自由文本 -> 交易意图。方向和币种缺一不可,价位都是可选的。
pub fn parse_signal_text(text: &str) -> Result<SignalIntent, AppError> {
    // 中文关键词不受大小写影响,英文关键词统一按小写匹配;
    // 数字和 ASCII 标点在 to_lowercase 下字节数不变,后面按字节位切片是安全的
    let lower = text.to_lowercase();

    let direction = detect_direction(&lower)
        .ok_or_else(|| AppError::Parse("信号未声明做多或做空方向".to_string()))?;
    let symbol = extract_symbol(text)
        .ok_or_else(|| AppError::Parse("信号未包含可识别的交易对".to_string()))?;

    let entry_price = first_number_after(&lower, &ENTRY_KEYS);
    let add_prices = numbers_after(&lower, &ADD_KEYS);
    let stop_loss = first_number_after(&lower, &STOP_KEYS);
    let take_profit = first_number_after(&lower, &PROFIT_KEYS);

    Ok(SignalIntent {
        symbol,
        direction,
        entry_price,
        add_prices,
        stop_loss,
        take_profit,
    })
}

/// 多空都出现时按先出现的算,一个都没有则无方向
fn detect_direction(lower: &str) -> Option<PositionSide> {
    let long_pos = LONG_KEYS.iter().filter_map(|k| lower.find(k)).min();
    let short_pos = SHORT_KEYS.iter().filter_map(|k| lower.find(k)).min();
    match (long_pos, short_pos) {
        (Some(l), Some(s)) => {
            if l <= s {
                Some(PositionSide::Long)
            } else {
                Some(PositionSide::Short)
            }
        }
        (Some(_), None) => Some(PositionSide::Long),
        (None, Some(_)) => Some(PositionSide::Short),
        (None, None) => None,
    }
}

/// 扫出规范化交易对。优先找带 USDT/USDC/USD 后缀的完整写法
/// (允许 BTC/USDT、btc-usdt 这类分隔),没有的话退而求其次,
/// 把第一个像币种代号的裸写法(BTC、SOL)补上 USDT。
fn extract_symbol(text: &str) -> Option<String> {
    let runs = alnum_runs(text);
    for run in &runs {
        let candidate = run
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        for quote in ["USDT", "USDC", "USD"] {
            if let Some(base) = candidate.strip_suffix(quote) {
                if base.len() >= 2 && base.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Some(candidate);
                }
            }
        }
    }
    // 裸币种:2-6 位纯字母,排除英文关键词
    for run in &runs {
        let candidate = run
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        if candidate.len() >= 2
            && candidate.len() <= 6
            && candidate.chars().all(|c| c.is_ascii_alphabetic())
            && !SYMBOL_BLOCKLIST.contains(&candidate.as_str())
        {
            return Some(format!("{}USDT", candidate));
        }
    }
    None
}

/// 把文本切成 ASCII 字母数字连续段,段内允许 / - _ 作为交易对分隔符
fn alnum_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || (!current.is_empty() && matches!(c, '/' | '-' | '_')) {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    // 尾部的分隔符不属于交易对
    runs.iter()
        .map(|r| r.trim_end_matches(['/', '-', '_']).to_string())
        .filter(|r| !r.is_empty())
        .collect()
}

fn first_number_after(lower: &str, keys: &[&str]) -> Option<f64> {
    numbers_after(lower, keys).into_iter().next()
}

/// 关键词之后、下一个关键词之前的所有数字
fn numbers_after(lower: &str, keys: &[&str]) -> Vec<f64> {
    let start = match keys.iter().filter_map(|k| lower.find(k).map(|p| p + k.len())).min() {
        Some(p) => p,
        None => return Vec::new(),
    };
    let tail = &lower[start..];
    let end = SEGMENT_STOPS
        .iter()
        .filter_map(|k| tail.find(k))
        .min()
        .unwrap_or(tail.len());
    extract_numbers(&tail[..end])
}

fn extract_numbers(segment: &str) -> Vec<f64> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for c in segment.chars() {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty() && !current.contains('.')) {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                numbers.push(v);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            numbers.push(v);
        }
    }
    numbers
}
