use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::warn;

use crate::error::AppError;
use crate::time_util;
use crate::trading::gateway::retry::with_read_retry;
use crate::trading::gateway::symbol_rules::{RuleCache, SymbolRule};
use crate::trading::gateway::types::{MarginMode, OrderReceipt, Position, PositionSide};
use crate::trading::gateway::{
    client_order_id, http_client, split_symbol, Exchange, GatewayCredential, TradingGateway,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.bitget.com";

/// Bitget U本位合约适配器(mix v1)
///
/// 签名: 毫秒时间戳 + 大写method + 带query的path + body做HMAC-SHA256取base64,带passphrase;
/// 方向编码是合并式: open_long/open_short/close_long/close_short;
/// 模拟盘是独立的productType(sumcbl),交易对和保证金币种都带S前缀
pub struct BitgetGateway {
    client: reqwest::Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    testnet: bool,
    rules: RuleCache<BitgetRule>,
}

#[derive(Debug, Clone, Copy)]
struct BitgetRule {
    qty: SymbolRule,
    price: SymbolRule,
}

#[derive(Debug, Deserialize)]
struct BitgetResponse<T> {
    code: String,
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountRow {
    margin_coin: String,
    #[serde(default)]
    available: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRow {
    symbol: String,
    hold_side: String,
    #[serde(default)]
    total: Value,
    #[serde(default)]
    average_open_price: Value,
    #[serde(default)]
    market_price: Value,
    #[serde(default, rename = "unrealizedPL")]
    unrealized_pl: Value,
    #[serde(default)]
    leverage: Value,
    #[serde(default)]
    margin_mode: String,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(default)]
    last: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    #[serde(default)]
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractRow {
    symbol: String,
    #[serde(default)]
    volume_place: Value,
    #[serde(default)]
    min_trade_num: Value,
    #[serde(default)]
    price_place: Value,
    #[serde(default)]
    price_end_step: Value,
}

fn classify_error(code: &str, msg: String) -> AppError {
    match code {
        "429" | "30007" => AppError::RateLimited(format!("[{}] {}", code, msg)),
        "40009" | "40012" | "40037" | "40002" | "40006" => {
            AppError::Signature(format!("[{}] {}", code, msg))
        }
        "45110" | "45111" | "40753" => AppError::Precision(format!("[{}] {}", code, msg)),
        _ => AppError::ExchangeApi {
            code: code.to_string(),
            msg,
        },
    }
}

/// bitget的数值字段字符串和数字混着来,统一兜住
fn val_num(value: &Value, field: &str) -> Result<f64, AppError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| AppError::Parse(format!("bitget字段{}溢出", field))),
        Value::String(s) if s.is_empty() => Ok(0.0),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| AppError::Parse(format!("bitget字段{}={}: {}", field, s, e))),
        Value::Null => Ok(0.0),
        other => Err(AppError::Parse(format!(
            "bitget字段{}类型异常: {}",
            field, other
        ))),
    }
}

impl BitgetGateway {
    pub fn new(credential: GatewayCredential) -> Result<Self, AppError> {
        let passphrase = credential
            .passphrase
            .clone()
            .ok_or_else(|| AppError::Signature("bitget缺少passphrase".to_string()))?;
        Ok(Self {
            client: http_client()?,
            api_key: credential.api_key,
            api_secret: credential.api_secret,
            passphrase,
            testnet: credential.testnet,
            rules: RuleCache::new(),
        })
    }

    fn product_type(&self) -> &'static str {
        if self.testnet {
            "sumcbl"
        } else {
            "umcbl"
        }
    }

    fn margin_coin(&self) -> &'static str {
        if self.testnet {
            "SUSDT"
        } else {
            "USDT"
        }
    }

    /// BTCUSDT -> BTCUSDT_UMCBL,模拟盘是SBTCSUSDT_SUMCBL
    fn venue_symbol(&self, symbol: &str) -> Result<String, AppError> {
        let (base, quote) = split_symbol(symbol)?;
        if self.testnet {
            Ok(format!("S{}S{}_SUMCBL", base, quote))
        } else {
            Ok(format!("{}{}_UMCBL", base, quote))
        }
    }

    /// BTCUSDT_UMCBL / SBTCSUSDT_SUMCBL -> BTCUSDT
    fn canonical_symbol(&self, venue_symbol: &str) -> String {
        let raw = venue_symbol.split('_').next().unwrap_or(venue_symbol);
        if self.testnet {
            let stripped = raw.strip_prefix('S').unwrap_or(raw);
            stripped.replace("SUSDT", "USDT").replace("SUSDC", "USDC")
        } else {
            raw.to_string()
        }
    }

    fn sign(&self, timestamp: &str, method: &str, request_path: &str, body: &str) -> Result<String, AppError> {
        let prehash = format!("{}{}{}{}", timestamp, method, request_path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| AppError::Signature(format!("HMAC init: {}", e)))?;
        mac.update(prehash.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        request_path: &str,
        body: Option<Value>,
    ) -> Result<T, AppError> {
        let body_text = match &body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        let timestamp = time_util::now_ms().to_string();
        let signature = self.sign(&timestamp, method.as_str(), request_path, &body_text)?;

        let url = format!("{}{}", BASE_URL, request_path);
        let mut req = self
            .client
            .request(method, &url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if !body_text.is_empty() {
            req = req.body(body_text);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("bitget http 429".to_string()));
        }
        let text = resp.text().await?;
        if status.is_server_error() {
            return Err(AppError::Transport(format!(
                "bitget http {}: {}",
                status, text
            )));
        }
        let wrapper: BitgetResponse<T> = serde_json::from_str(&text)
            .map_err(|e| AppError::Parse(format!("bitget响应解析: {} body={}", e, text)))?;
        if wrapper.code != "00000" {
            return Err(classify_error(&wrapper.code, wrapper.msg));
        }
        wrapper
            .data
            .ok_or_else(|| AppError::Parse("bitget响应缺少data".to_string()))
    }

    async fn rule(&self, symbol: &str) -> Result<BitgetRule, AppError> {
        if let Some(rule) = self.rules.get(symbol) {
            return Ok(rule);
        }
        let path = format!(
            "/api/mix/v1/market/contracts?productType={}",
            self.product_type()
        );
        let rows: Vec<ContractRow> = with_read_retry("bitget_contracts", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        for row in &rows {
            let canonical = self.canonical_symbol(&row.symbol);
            let qty_decimals = val_num(&row.volume_place, "volumePlace")? as u32;
            let min_qty = val_num(&row.min_trade_num, "minTradeNum")?;
            let price_place = val_num(&row.price_place, "pricePlace")? as i32;
            let price_step = val_num(&row.price_end_step, "priceEndStep")?.max(1.0);
            let rule = BitgetRule {
                qty: SymbolRule::from_decimals(qty_decimals, min_qty),
                price: SymbolRule {
                    qty_step: price_step * 10f64.powi(-price_place),
                    qty_decimals: price_place as u32,
                    min_qty: 0.0,
                },
            };
            // 顺手缓存全量,规则几乎不变
            self.rules.insert(&canonical, rule);
        }
        self.rules
            .get(symbol)
            .ok_or_else(|| AppError::Precision(format!("bitget无此交易对精度规则: {}", symbol)))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
    ) -> Result<OrderReceipt, AppError> {
        let size = self.rule(symbol).await?.qty.format(qty)?;
        let body = json!({
            "symbol": self.venue_symbol(symbol)?,
            "marginCoin": self.margin_coin(),
            "size": size,
            "side": side,
            "orderType": "market",
            "timeInForceValue": "normal",
            "clientOid": client_order_id(),
        });
        let data: OrderData = self
            .request(
                reqwest::Method::POST,
                "/api/mix/v1/order/placeOrder",
                Some(body),
            )
            .await?;
        Ok(OrderReceipt {
            order_id: data.order_id,
            quantity: size,
        })
    }

    async fn place_plan(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
        plan_type: &str,
    ) -> Result<(), AppError> {
        let rule = self.rule(symbol).await?;
        let size = rule.qty.format(qty)?;
        let trigger = rule.price.format(trigger_price)?;
        let body = json!({
            "symbol": self.venue_symbol(symbol)?,
            "marginCoin": self.margin_coin(),
            "planType": plan_type,
            "triggerPrice": trigger,
            "triggerType": "market_price",
            "holdSide": side.as_str(),
            "size": size,
        });
        let _: Value = self
            .request(
                reqwest::Method::POST,
                "/api/mix/v1/plan/placeTPSL",
                Some(body),
            )
            .await?;
        Ok(())
    }

    async fn cancel_symbol_plan(&self, symbol: &str, plan_type: &str) -> Result<(), AppError> {
        let body = json!({
            "symbol": self.venue_symbol(symbol)?,
            "marginCoin": self.margin_coin(),
            "planType": plan_type,
        });
        let res: Result<Value, AppError> = self
            .request(
                reqwest::Method::POST,
                "/api/mix/v1/plan/cancelSymbolPlan",
                Some(body),
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            // 没有挂着的计划单时接口会报业务错,不算失败
            Err(AppError::ExchangeApi { code, msg }) => {
                warn!("bitget撤销{}计划单: [{}] {}", plan_type, code, msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn position_quantity(&self, symbol: &str, side: PositionSide) -> Result<f64, AppError> {
        let positions = self.get_positions().await?;
        positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.quantity)
            .ok_or_else(|| {
                AppError::BizError(format!("bitget无{} {}持仓可平", symbol, side.as_str()))
            })
    }
}

#[async_trait]
impl TradingGateway for BitgetGateway {
    fn exchange(&self) -> Exchange {
        Exchange::Bitget
    }

    async fn get_balance(&self) -> Result<f64, AppError> {
        let path = format!(
            "/api/mix/v1/account/accounts?productType={}",
            self.product_type()
        );
        let rows: Vec<AccountRow> = with_read_retry("bitget_balance", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        let account = rows
            .iter()
            .find(|r| r.margin_coin == self.margin_coin())
            .ok_or_else(|| AppError::BizError("bitget账户无USDT资产".to_string()))?;
        val_num(&account.available, "available")
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AppError> {
        let path = format!(
            "/api/mix/v1/position/allPosition?productType={}&marginCoin={}",
            self.product_type(),
            self.margin_coin()
        );
        let rows: Vec<PositionRow> = with_read_retry("bitget_positions", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        let mut out = Vec::new();
        for row in rows {
            let quantity = val_num(&row.total, "total")?;
            if quantity == 0.0 {
                continue;
            }
            let symbol = self.canonical_symbol(&row.symbol);
            let side = if row.hold_side == "short" {
                PositionSide::Short
            } else {
                PositionSide::Long
            };
            out.push(Position {
                symbol,
                side,
                quantity: quantity.abs(),
                entry_price: val_num(&row.average_open_price, "averageOpenPrice")?,
                mark_price: val_num(&row.market_price, "marketPrice")?,
                unrealized_pnl: val_num(&row.unrealized_pl, "unrealizedPL")?,
                leverage: val_num(&row.leverage, "leverage")? as u32,
                margin_mode: if row.margin_mode == "fixed" {
                    MarginMode::Isolated
                } else {
                    MarginMode::Cross
                },
            });
        }
        Ok(out)
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        let path = format!(
            "/api/mix/v1/market/ticker?symbol={}",
            self.venue_symbol(symbol)?
        );
        let ticker: TickerData = with_read_retry("bitget_ticker", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        val_num(&ticker.last, "last")
    }

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_order(symbol, "open_long", qty).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_order(symbol, "open_short", qty).await
    }

    async fn close_long(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Long).await?,
        };
        self.place_order(symbol, "close_long", qty).await
    }

    async fn close_short(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Short).await?,
        };
        self.place_order(symbol, "close_short", qty).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        let body = json!({
            "symbol": self.venue_symbol(symbol)?,
            "marginCoin": self.margin_coin(),
            "leverage": leverage.to_string(),
        });
        let _: Value = self
            .request(
                reqwest::Method::POST,
                "/api/mix/v1/account/setLeverage",
                Some(body),
            )
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), AppError> {
        let margin_mode = if is_cross { "crossed" } else { "fixed" };
        let body = json!({
            "symbol": self.venue_symbol(symbol)?,
            "marginCoin": self.margin_coin(),
            "marginMode": margin_mode,
        });
        let _: Value = self
            .request(
                reqwest::Method::POST,
                "/api/mix/v1/account/setMarginMode",
                Some(body),
            )
            .await?;
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_plan(symbol, side, qty, trigger_price, "loss_plan")
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_plan(symbol, side, qty, trigger_price, "profit_plan")
            .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_symbol_plan(symbol, "loss_plan").await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_symbol_plan(symbol, "profit_plan").await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        let body = json!({
            "symbol": self.venue_symbol(symbol)?,
            "marginCoin": self.margin_coin(),
        });
        let res: Result<Value, AppError> = self
            .request(
                reqwest::Method::POST,
                "/api/mix/v1/order/cancel-symbol-orders",
                Some(body),
            )
            .await;
        match res {
            Ok(_) => {}
            Err(AppError::ExchangeApi { code, msg }) => {
                warn!("bitget撤销全部挂单: [{}] {}", code, msg);
            }
            Err(e) => return Err(e),
        }
        self.cancel_symbol_plan(symbol, "loss_plan").await?;
        self.cancel_symbol_plan(symbol, "profit_plan").await
    }

    async fn format_quantity(&self, symbol: &str, qty: f64) -> Result<String, AppError> {
        self.rule(symbol).await?.qty.format(qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(testnet: bool) -> BitgetGateway {
        BitgetGateway::new(GatewayCredential {
            exchange: Exchange::Bitget,
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: Some("p".into()),
            wallet_address: None,
            wallet_private_key: None,
            agent_private_key: None,
            testnet,
        })
        .unwrap()
    }

    #[test]
    fn test_venue_symbol_mainnet_and_demo() {
        assert_eq!(gateway(false).venue_symbol("BTCUSDT").unwrap(), "BTCUSDT_UMCBL");
        assert_eq!(gateway(true).venue_symbol("BTCUSDT").unwrap(), "SBTCSUSDT_SUMCBL");
    }

    #[test]
    fn test_canonical_symbol_round_trip() {
        assert_eq!(gateway(false).canonical_symbol("BTCUSDT_UMCBL"), "BTCUSDT");
        // 主网S开头的币种不能被误剥
        assert_eq!(gateway(false).canonical_symbol("SOLUSDT_UMCBL"), "SOLUSDT");
        assert_eq!(gateway(true).canonical_symbol("SBTCSUSDT_SUMCBL"), "BTCUSDT");
        assert_eq!(gateway(true).canonical_symbol("SSOLSUSDT_SUMCBL"), "SOLUSDT");
    }

    #[test]
    fn test_val_num_mixed_types() {
        assert_eq!(val_num(&json!(20), "leverage").unwrap(), 20.0);
        assert_eq!(val_num(&json!("1.5"), "total").unwrap(), 1.5);
        assert_eq!(val_num(&json!(""), "avg").unwrap(), 0.0);
        assert_eq!(val_num(&Value::Null, "avg").unwrap(), 0.0);
        assert!(val_num(&json!({"x":1}), "avg").is_err());
    }

    #[test]
    fn test_classify_error_codes() {
        assert!(matches!(
            classify_error("40009", "sign".into()),
            AppError::Signature(_)
        ));
        assert!(matches!(
            classify_error("45110", "min amount".into()),
            AppError::Precision(_)
        ));
        match classify_error("40754", "balance insufficient".into()) {
            AppError::ExchangeApi { code, .. } => assert_eq!(code, "40754"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
