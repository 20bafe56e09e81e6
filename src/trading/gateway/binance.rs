use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::AppError;
use crate::time_util;
use crate::trading::gateway::retry::with_read_retry;
use crate::trading::gateway::symbol_rules::{RuleCache, SymbolRule};
use crate::trading::gateway::types::{MarginMode, OrderReceipt, Position, PositionSide};
use crate::trading::gateway::{client_order_id, http_client, Exchange, GatewayCredential, TradingGateway};

type HmacSha256 = Hmac<Sha256>;

const MAINNET_BASE: &str = "https://fapi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW: &str = "5000";

/// 币安U本位合约适配器
///
/// 签名: 毫秒时间戳并入query,对整个query串做HMAC-SHA256取hex;
/// 方向编码: side=BUY/SELL + positionSide=LONG/SHORT,按双向持仓模式下单
pub struct BinanceGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rules: RuleCache<BinanceRule>,
    dual_mode_ready: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct BinanceRule {
    qty: SymbolRule,
    price: SymbolRule,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRow {
    asset: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskRow {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    un_realized_profit: String,
    leverage: String,
    margin_type: String,
    position_side: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderRow {
    order_id: i64,
    #[serde(rename = "type")]
    order_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DualSidePosition {
    dual_side_position: bool,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    filters: Vec<ExchangeInfoFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoFilter {
    filter_type: String,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
    #[serde(default)]
    tick_size: Option<String>,
}

fn classify_error(code: i64, msg: String) -> AppError {
    match code {
        // 签名/凭证类,重试无意义
        -1022 | -2014 | -2015 => AppError::Signature(format!("[{}] {}", code, msg)),
        // 精度/数量类
        -1111 | -1013 | -4003 => AppError::Precision(format!("[{}] {}", code, msg)),
        -1003 => AppError::RateLimited(format!("[{}] {}", code, msg)),
        _ => AppError::ExchangeApi {
            code: code.to_string(),
            msg,
        },
    }
}

fn parse_num(value: &str, field: &str) -> Result<f64, AppError> {
    value
        .parse::<f64>()
        .map_err(|e| AppError::Parse(format!("binance字段{}={}: {}", field, value, e)))
}

impl BinanceGateway {
    pub fn new(credential: GatewayCredential) -> Result<Self, AppError> {
        let base_url = if credential.testnet {
            TESTNET_BASE.to_string()
        } else {
            MAINNET_BASE.to_string()
        };
        Ok(Self {
            client: http_client()?,
            base_url,
            api_key: credential.api_key,
            api_secret: credential.api_secret,
            rules: RuleCache::new(),
            dual_mode_ready: AtomicBool::new(false),
        })
    }

    fn sign_query(&self, params: &[(&str, String)]) -> Result<String, AppError> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={}",
            time_util::now_ms(),
            RECV_WINDOW
        ));
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| AppError::Signature(format!("HMAC init: {}", e)))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, AppError> {
        let query = self.sign_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode_response(resp).await
    }

    async fn public_request<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<T, AppError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let resp = self.client.get(&url).send().await?;
        Self::decode_response(resp).await
    }

    async fn decode_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, AppError> {
        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(AppError::RateLimited(format!("binance http {}", status)));
        }
        let text = resp.text().await?;
        if status.is_server_error() {
            return Err(AppError::Transport(format!("binance http {}: {}", status, text)));
        }
        if !status.is_success() {
            return match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => Err(classify_error(body.code, body.msg)),
                Err(_) => Err(AppError::ExchangeApi {
                    code: status.as_u16().to_string(),
                    msg: text,
                }),
            };
        }
        serde_json::from_str::<T>(&text)
            .map_err(|e| AppError::Parse(format!("binance响应解析: {} body={}", e, text)))
    }

    /// 开仓前确保账户是双向持仓模式,已是目标模式的报错码视为成功
    async fn ensure_dual_position_mode(&self) -> Result<(), AppError> {
        if self.dual_mode_ready.load(Ordering::Relaxed) {
            return Ok(());
        }
        let current: DualSidePosition = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/positionSide/dual", &[])
            .await?;
        if !current.dual_side_position {
            let params = [("dualSidePosition", "true".to_string())];
            let res: Result<serde_json::Value, AppError> = self
                .signed_request(reqwest::Method::POST, "/fapi/v1/positionSide/dual", &params)
                .await;
            match res {
                Ok(_) => {}
                // -4059: No need to change position side
                Err(AppError::ExchangeApi { code, .. }) if code == "-4059" => {}
                Err(e) => return Err(e),
            }
            info!("binance已切换为双向持仓模式");
        }
        self.dual_mode_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn rule(&self, symbol: &str) -> Result<BinanceRule, AppError> {
        if let Some(rule) = self.rules.get(symbol) {
            return Ok(rule);
        }
        let info: ExchangeInfo = with_read_retry("binance_exchange_info", || {
            self.public_request("/fapi/v1/exchangeInfo", "")
        })
        .await?;
        for item in &info.symbols {
            let mut qty = None;
            let mut price = None;
            for filter in &item.filters {
                match filter.filter_type.as_str() {
                    "LOT_SIZE" => {
                        if let (Some(step), Some(min)) = (&filter.step_size, &filter.min_qty) {
                            qty = Some(SymbolRule::from_step_str(
                                step,
                                parse_num(min, "minQty")?,
                            )?);
                        }
                    }
                    "PRICE_FILTER" => {
                        if let Some(tick) = &filter.tick_size {
                            price = Some(SymbolRule::from_step_str(tick, 0.0)?);
                        }
                    }
                    _ => {}
                }
            }
            if let (Some(qty), Some(price)) = (qty, price) {
                self.rules.insert(&item.symbol, BinanceRule { qty, price });
            }
        }
        self.rules.get(symbol).ok_or_else(|| {
            AppError::Precision(format!("binance无此交易对精度规则: {}", symbol))
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        position_side: &str,
        qty: f64,
    ) -> Result<OrderReceipt, AppError> {
        let quantity = self.rule(symbol).await?.qty.format(qty)?;
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("positionSide", position_side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.clone()),
            ("newClientOrderId", client_order_id()),
        ];
        let ack: OrderAck = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(OrderReceipt {
            order_id: ack.order_id.to_string(),
            quantity,
        })
    }

    async fn place_trigger_order(
        &self,
        symbol: &str,
        side: PositionSide,
        order_type: &str,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        let rule = self.rule(symbol).await?;
        let quantity = rule.qty.format(qty)?;
        let stop_price = rule.price.format(trigger_price)?;
        // 多头的止损/止盈都是反向SELL
        let order_side = match side {
            PositionSide::Long => "SELL",
            PositionSide::Short => "BUY",
        };
        let position_side = match side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };
        let params = [
            ("symbol", symbol.to_string()),
            ("side", order_side.to_string()),
            ("positionSide", position_side.to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", stop_price),
            ("quantity", quantity),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        let _: OrderAck = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(())
    }

    async fn cancel_orders_of_type(&self, symbol: &str, order_type: &str) -> Result<(), AppError> {
        let params = [("symbol", symbol.to_string())];
        let open_orders: Vec<OpenOrderRow> = with_read_retry("binance_open_orders", || {
            self.signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", &params)
        })
        .await?;
        for order in open_orders.iter().filter(|o| o.order_type == order_type) {
            let params = [
                ("symbol", symbol.to_string()),
                ("orderId", order.order_id.to_string()),
            ];
            let res: Result<serde_json::Value, AppError> = self
                .signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params)
                .await;
            if let Err(e) = res {
                warn!("binance撤销{}单{}失败: {}", order_type, order.order_id, e);
            }
        }
        Ok(())
    }

    async fn position_quantity(&self, symbol: &str, side: PositionSide) -> Result<f64, AppError> {
        let positions = self.get_positions().await?;
        positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.quantity)
            .ok_or_else(|| {
                AppError::BizError(format!("binance无{} {}持仓可平", symbol, side.as_str()))
            })
    }
}

#[async_trait]
impl TradingGateway for BinanceGateway {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_balance(&self) -> Result<f64, AppError> {
        let rows: Vec<BalanceRow> = with_read_retry("binance_balance", || {
            self.signed_request(reqwest::Method::GET, "/fapi/v2/balance", &[])
        })
        .await?;
        let usdt = rows
            .iter()
            .find(|r| r.asset == "USDT")
            .ok_or_else(|| AppError::BizError("binance账户无USDT资产".to_string()))?;
        parse_num(&usdt.available_balance, "availableBalance")
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AppError> {
        let rows: Vec<PositionRiskRow> = with_read_retry("binance_positions", || {
            self.signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", &[])
        })
        .await?;
        let mut out = Vec::new();
        for row in rows {
            let amt = parse_num(&row.position_amt, "positionAmt")?;
            if amt == 0.0 {
                continue;
            }
            let side = match row.position_side.as_str() {
                "LONG" => PositionSide::Long,
                "SHORT" => PositionSide::Short,
                // 单向模式兜底按数量符号判断
                _ => {
                    if amt > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    }
                }
            };
            let margin_mode = if row.margin_type.eq_ignore_ascii_case("cross") {
                MarginMode::Cross
            } else {
                MarginMode::Isolated
            };
            out.push(Position {
                symbol: row.symbol.clone(),
                side,
                quantity: amt.abs(),
                entry_price: parse_num(&row.entry_price, "entryPrice")?,
                mark_price: parse_num(&row.mark_price, "markPrice")?,
                unrealized_pnl: parse_num(&row.un_realized_profit, "unRealizedProfit")?,
                leverage: parse_num(&row.leverage, "leverage")? as u32,
                margin_mode,
            });
        }
        Ok(out)
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        let query = format!("symbol={}", symbol);
        let ticker: TickerPrice = with_read_retry("binance_ticker", || {
            self.public_request("/fapi/v1/ticker/price", &query)
        })
        .await?;
        parse_num(&ticker.price, "price")
    }

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.ensure_dual_position_mode().await?;
        self.set_leverage(symbol, leverage).await?;
        self.place_market_order(symbol, "BUY", "LONG", qty).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.ensure_dual_position_mode().await?;
        self.set_leverage(symbol, leverage).await?;
        self.place_market_order(symbol, "SELL", "SHORT", qty).await
    }

    async fn close_long(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Long).await?,
        };
        self.place_market_order(symbol, "SELL", "LONG", qty).await
    }

    async fn close_short(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Short).await?,
        };
        self.place_market_order(symbol, "BUY", "SHORT", qty).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), AppError> {
        let margin_type = if is_cross { "CROSSED" } else { "ISOLATED" };
        let params = [
            ("symbol", symbol.to_string()),
            ("marginType", margin_type.to_string()),
        ];
        let res: Result<serde_json::Value, AppError> = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await;
        match res {
            Ok(_) => Ok(()),
            // -4046: No need to change margin type
            Err(AppError::ExchangeApi { code, .. }) if code == "-4046" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_trigger_order(symbol, side, "STOP_MARKET", qty, trigger_price)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_trigger_order(symbol, side, "TAKE_PROFIT_MARKET", qty, trigger_price)
            .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_orders_of_type(symbol, "STOP_MARKET").await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_orders_of_type(symbol, "TAKE_PROFIT_MARKET")
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        let params = [("symbol", symbol.to_string())];
        let _: serde_json::Value = self
            .signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        Ok(())
    }

    async fn format_quantity(&self, symbol: &str, qty: f64) -> Result<String, AppError> {
        self.rule(symbol).await?.qty.format(qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_codes() {
        assert!(matches!(
            classify_error(-1022, "sig".into()),
            AppError::Signature(_)
        ));
        assert!(matches!(
            classify_error(-1111, "precision".into()),
            AppError::Precision(_)
        ));
        assert!(matches!(
            classify_error(-1003, "too many".into()),
            AppError::RateLimited(_)
        ));
        match classify_error(-2019, "Margin is insufficient.".into()) {
            AppError::ExchangeApi { code, msg } => {
                assert_eq!(code, "-2019");
                assert_eq!(msg, "Margin is insufficient.");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
