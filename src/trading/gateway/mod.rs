use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub mod binance;
pub mod bitget;
pub mod credential;
pub mod hyperliquid;
pub mod okx;
pub mod paper;
pub mod retry;
pub mod symbol_rules;
pub mod types;

pub use credential::GatewayCredential;
pub use types::{MarginMode, OrderReceipt, Position, PositionSide};

/// 支持的交易所,新增交易所只加一个变体,策略引擎不感知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Okx,
    Bitget,
    Hyperliquid,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
            Exchange::Bitget => "bitget",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }
}

impl FromStr for Exchange {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            "bitget" => Ok(Exchange::Bitget),
            "hyperliquid" => Ok(Exchange::Hyperliquid),
            other => Err(AppError::BizError(format!("未知交易所: {}", other))),
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交易所能力合约
///
/// symbol统一用BTCUSDT形式,各适配器内部转成交易所自己的标识;
/// 数量统一是币本位数量,format_quantity负责换算成交易所下单接口接受的字符串
#[async_trait]
pub trait TradingGateway: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// 可用USDT保证金
    async fn get_balance(&self) -> Result<f64, AppError>;

    /// 当前全部持仓,交易所是唯一事实来源,本地从不缓存
    async fn get_positions(&self) -> Result<Vec<Position>, AppError>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError>;

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError>;

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError>;

    /// qty为None时平掉整个方向的仓位
    async fn close_long(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError>;

    async fn close_short(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError>;

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), AppError>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError>;

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), AppError>;

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), AppError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError>;

    /// 按交易所精度规则截断(永远向下),返回下单接口可直接使用的字符串
    async fn format_quantity(&self, symbol: &str, qty: f64) -> Result<String, AppError>;
}

/// 按凭证构造对应适配器
pub fn build_gateway(credential: GatewayCredential) -> Result<Arc<dyn TradingGateway>, AppError> {
    credential.validate()?;
    let gateway: Arc<dyn TradingGateway> = match credential.exchange {
        Exchange::Binance => Arc::new(binance::BinanceGateway::new(credential)?),
        Exchange::Okx => Arc::new(okx::OkxGateway::new(credential)?),
        Exchange::Bitget => Arc::new(bitget::BitgetGateway::new(credential)?),
        Exchange::Hyperliquid => Arc::new(hyperliquid::HyperliquidGateway::new(credential)?),
    };
    Ok(gateway)
}

/// 各适配器共用的HTTP客户端参数
pub(crate) fn http_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| AppError::Transport(e.to_string()))
}

/// BTCUSDT形式拆成(base, quote)
pub(crate) fn split_symbol(symbol: &str) -> Result<(&str, &str), AppError> {
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok((base, quote));
            }
        }
    }
    Err(AppError::BizError(format!("无法解析交易对: {}", symbol)))
}

/// 下单携带的客户端订单号,32位hex,各交易所长度限制内
pub(crate) fn client_order_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_from_str() {
        assert_eq!(Exchange::from_str("binance").unwrap(), Exchange::Binance);
        assert_eq!(Exchange::from_str("OKX").unwrap(), Exchange::Okx);
        assert_eq!(Exchange::from_str("Bitget").unwrap(), Exchange::Bitget);
        assert_eq!(
            Exchange::from_str("hyperliquid").unwrap(),
            Exchange::Hyperliquid
        );
        assert!(Exchange::from_str("ftx").is_err());
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("BTCUSDT").unwrap(), ("BTC", "USDT"));
        assert_eq!(split_symbol("ETHUSDC").unwrap(), ("ETH", "USDC"));
        assert!(split_symbol("USDT").is_err());
        assert!(split_symbol("BTC").is_err());
    }

    #[test]
    fn test_client_order_id_shape() {
        let id = client_order_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, client_order_id());
    }
}
