use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use super::symbol_rules::SymbolRule;
use super::types::{MarginMode, OrderReceipt, Position, PositionSide};
use super::{Exchange, TradingGateway};
use crate::error::AppError;

/// 模拟盘网关:不连任何交易所,仓位和余额都在内存里。
/// 干跑模式和测试共用,每次调用都留痕,方便核对引擎到底下了什么单。
pub struct PaperGateway {
    balance: Mutex<f64>,
    marks: DashMap<String, f64>,
    /// key: "{symbol}:{side}"
    positions: DashMap<String, Position>,
    calls: Mutex<Vec<GatewayCall>>,
    /// 注入给下一次订单类调用的错误,模拟交易所拒单
    fail_next_order: Mutex<Option<AppError>>,
    order_seq: AtomicU64,
    rule: SymbolRule,
}

/// 网关调用留痕
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    OpenLong { symbol: String, qty: f64, leverage: u32 },
    OpenShort { symbol: String, qty: f64, leverage: u32 },
    CloseLong { symbol: String, qty: Option<f64> },
    CloseShort { symbol: String, qty: Option<f64> },
    SetLeverage { symbol: String, leverage: u32 },
    SetMarginMode { symbol: String, is_cross: bool },
    SetStopLoss { symbol: String, side: PositionSide, qty: f64, price: f64 },
    SetTakeProfit { symbol: String, side: PositionSide, qty: f64, price: f64 },
    CancelStopLoss { symbol: String },
    CancelTakeProfit { symbol: String },
    CancelAll { symbol: String },
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self {
            balance: Mutex::new(10_000.0),
            marks: DashMap::new(),
            positions: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            fail_next_order: Mutex::new(None),
            order_seq: AtomicU64::new(1),
            rule: SymbolRule::from_decimals(3, 0.001),
        }
    }
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, balance: f64) {
        *self.balance.lock().unwrap_or_else(|e| e.into_inner()) = balance;
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.marks.insert(symbol.to_string(), price);
    }

    /// 模拟人在交易所手上直接平掉仓位
    pub fn remove_position(&self, symbol: &str, side: PositionSide) {
        self.positions.remove(&Self::key(symbol, side));
    }

    pub fn position(&self, symbol: &str, side: PositionSide) -> Option<Position> {
        self.positions.get(&Self::key(symbol, side)).map(|p| p.clone())
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 下一次订单类调用(开/平仓)直接返回注入的错误
    pub fn fail_next_order(&self, error: AppError) {
        *self.fail_next_order.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    fn key(symbol: &str, side: PositionSide) -> String {
        format!("{}:{}", symbol, side.as_str())
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn take_injected_failure(&self) -> Option<AppError> {
        self.fail_next_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn receipt(&self, qty_text: String) -> OrderReceipt {
        OrderReceipt {
            order_id: format!("paper-{}", self.order_seq.fetch_add(1, Ordering::SeqCst)),
            quantity: qty_text,
        }
    }

    fn mark_or_err(&self, symbol: &str) -> Result<f64, AppError> {
        self.marks
            .get(symbol)
            .map(|p| *p)
            .ok_or_else(|| AppError::BizError(format!("模拟盘未设置标记价: {}", symbol)))
    }

    fn apply_open(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        if let Some(e) = self.take_injected_failure() {
            return Err(e);
        }
        let qty_text = self.rule.format(qty)?;
        let filled: f64 = qty_text.parse().unwrap_or(qty);
        let mark = self.mark_or_err(symbol)?;
        let key = Self::key(symbol, side);
        match self.positions.get_mut(&key) {
            Some(mut position) => {
                // 加仓按数量加权摊平均价
                let total = position.quantity + filled;
                position.entry_price =
                    (position.entry_price * position.quantity + mark * filled) / total;
                position.quantity = total;
                position.mark_price = mark;
            }
            None => {
                self.positions.insert(
                    key,
                    Position {
                        symbol: symbol.to_string(),
                        side,
                        quantity: filled,
                        entry_price: mark,
                        mark_price: mark,
                        unrealized_pnl: 0.0,
                        leverage,
                        margin_mode: MarginMode::Cross,
                    },
                );
            }
        }
        info!("模拟盘开仓: {} {} {}", symbol, side.as_str(), qty_text);
        Ok(self.receipt(qty_text))
    }

    fn apply_close(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Option<f64>,
    ) -> Result<OrderReceipt, AppError> {
        if let Some(e) = self.take_injected_failure() {
            return Err(e);
        }
        let key = Self::key(symbol, side);
        let held = self
            .positions
            .get(&key)
            .map(|p| p.quantity)
            .ok_or_else(|| AppError::BizError(format!("模拟盘无仓可平: {}", key)))?;
        let closing = qty.unwrap_or(held).min(held);
        if (held - closing).abs() < 1e-12 {
            self.positions.remove(&key);
        } else if let Some(mut position) = self.positions.get_mut(&key) {
            position.quantity = held - closing;
        }
        let qty_text = self.rule.format(closing)?;
        info!("模拟盘平仓: {} {} {}", symbol, side.as_str(), qty_text);
        Ok(self.receipt(qty_text))
    }
}

#[async_trait]
impl TradingGateway for PaperGateway {
    fn exchange(&self) -> Exchange {
        // 模拟盘没有自己的交易所身份,借用一个占位
        Exchange::Okx
    }

    async fn get_balance(&self) -> Result<f64, AppError> {
        Ok(*self.balance.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AppError> {
        Ok(self
            .positions
            .iter()
            .map(|p| {
                let mut position = p.clone();
                if let Some(mark) = self.marks.get(&position.symbol) {
                    position.mark_price = *mark;
                    let direction = match position.side {
                        PositionSide::Long => 1.0,
                        PositionSide::Short => -1.0,
                    };
                    position.unrealized_pnl =
                        (*mark - position.entry_price) * position.quantity * direction;
                }
                position
            })
            .collect())
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        self.mark_or_err(symbol)
    }

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.record(GatewayCall::OpenLong {
            symbol: symbol.to_string(),
            qty,
            leverage,
        });
        self.apply_open(symbol, PositionSide::Long, qty, leverage)
    }

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.record(GatewayCall::OpenShort {
            symbol: symbol.to_string(),
            qty,
            leverage,
        });
        self.apply_open(symbol, PositionSide::Short, qty, leverage)
    }

    async fn close_long(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        self.record(GatewayCall::CloseLong {
            symbol: symbol.to_string(),
            qty,
        });
        self.apply_close(symbol, PositionSide::Long, qty)
    }

    async fn close_short(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        self.record(GatewayCall::CloseShort {
            symbol: symbol.to_string(),
            qty,
        });
        self.apply_close(symbol, PositionSide::Short, qty)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        self.record(GatewayCall::SetLeverage {
            symbol: symbol.to_string(),
            leverage,
        });
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), AppError> {
        self.record(GatewayCall::SetMarginMode {
            symbol: symbol.to_string(),
            is_cross,
        });
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.record(GatewayCall::SetStopLoss {
            symbol: symbol.to_string(),
            side,
            qty,
            price: trigger_price,
        });
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.record(GatewayCall::SetTakeProfit {
            symbol: symbol.to_string(),
            side,
            qty,
            price: trigger_price,
        });
        Ok(())
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.record(GatewayCall::CancelStopLoss {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.record(GatewayCall::CancelTakeProfit {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.record(GatewayCall::CancelAll {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    async fn format_quantity(&self, symbol: &str, qty: f64) -> Result<String, AppError> {
        let _ = symbol;
        self.rule.format(qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_then_close_round_trip() {
        let paper = PaperGateway::new();
        paper.set_mark_price("BTCUSDT", 60000.0);

        let receipt = paper.open_long("BTCUSDT", 0.5, 10).await.unwrap();
        assert_eq!(receipt.quantity, "0.500");
        let position = paper.position("BTCUSDT", PositionSide::Long).unwrap();
        assert_eq!(position.quantity, 0.5);
        assert_eq!(position.entry_price, 60000.0);

        paper.close_long("BTCUSDT", None).await.unwrap();
        assert!(paper.position("BTCUSDT", PositionSide::Long).is_none());
    }

    #[tokio::test]
    async fn test_add_averages_entry_price() {
        let paper = PaperGateway::new();
        paper.set_mark_price("BTCUSDT", 60000.0);
        paper.open_long("BTCUSDT", 1.0, 10).await.unwrap();
        paper.set_mark_price("BTCUSDT", 58000.0);
        paper.open_long("BTCUSDT", 1.0, 10).await.unwrap();

        let position = paper.position("BTCUSDT", PositionSide::Long).unwrap();
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.entry_price, 59000.0);
    }

    #[tokio::test]
    async fn test_injected_failure_hits_next_order_only() {
        let paper = PaperGateway::new();
        paper.set_mark_price("BTCUSDT", 60000.0);
        paper.fail_next_order(AppError::ExchangeApi {
            code: "51008".to_string(),
            msg: "保证金不足".to_string(),
        });

        let err = paper.open_long("BTCUSDT", 1.0, 10).await.unwrap_err();
        assert!(matches!(err, AppError::ExchangeApi { .. }));
        // 错误只注入一次,下一单恢复正常
        assert!(paper.open_long("BTCUSDT", 1.0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_unrealized_pnl_follows_mark() {
        let paper = PaperGateway::new();
        paper.set_mark_price("BTCUSDT", 60000.0);
        paper.open_short("BTCUSDT", 2.0, 5).await.unwrap();
        paper.set_mark_price("BTCUSDT", 59000.0);

        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].unrealized_pnl, 2000.0);
    }
}
