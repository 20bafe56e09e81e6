use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::AppError;
use crate::time_util;
use crate::trading::gateway::retry::with_read_retry;
use crate::trading::gateway::symbol_rules::{RuleCache, SymbolRule};
use crate::trading::gateway::types::{MarginMode, OrderReceipt, Position, PositionSide};
use crate::trading::gateway::{
    client_order_id, http_client, split_symbol, Exchange, GatewayCredential, TradingGateway,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";

/// OKX永续合约适配器
///
/// 签名: ISO毫秒时间戳 + method + 带query的path + body做HMAC-SHA256取base64,
/// 凭证多一个passphrase,模拟盘走x-simulated-trading头;
/// 方向编码: side=buy/sell + posSide=long/short;
/// 下单数量单位是张,按ctVal从币数量换算
pub struct OkxGateway {
    client: reqwest::Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    testnet: bool,
    rules: RuleCache<OkxRule>,
    margin_mode: RwLock<MarginMode>,
    position_mode_ready: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct OkxRule {
    /// 张数步长规则
    lot: SymbolRule,
    /// 一张对应的币数量
    ct_val: f64,
    tick: SymbolRule,
}

#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceData {
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    #[serde(default)]
    avail_eq: String,
    #[serde(default)]
    avail_bal: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionData {
    inst_id: String,
    pos_side: String,
    pos: String,
    #[serde(default)]
    avg_px: String,
    #[serde(default)]
    mark_px: String,
    #[serde(default)]
    upl: String,
    #[serde(default)]
    lever: String,
    mgn_mode: String,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    last: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    #[serde(default)]
    ord_id: String,
    #[serde(default)]
    s_code: String,
    #[serde(default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlgoOrderData {
    algo_id: String,
    inst_id: String,
    #[serde(default)]
    sl_trigger_px: String,
    #[serde(default)]
    tp_trigger_px: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrderData {
    ord_id: String,
    inst_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentData {
    lot_sz: String,
    min_sz: String,
    ct_val: String,
    tick_sz: String,
}

fn classify_error(code: &str, msg: String) -> AppError {
    match code {
        "50011" => AppError::RateLimited(format!("[{}] {}", code, msg)),
        "50103" | "50105" | "50111" | "50113" => {
            AppError::Signature(format!("[{}] {}", code, msg))
        }
        "51120" | "51121" => AppError::Precision(format!("[{}] {}", code, msg)),
        _ => AppError::ExchangeApi {
            code: code.to_string(),
            msg,
        },
    }
}

fn parse_num(value: &str, field: &str) -> Result<f64, AppError> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse::<f64>()
        .map_err(|e| AppError::Parse(format!("okx字段{}={}: {}", field, value, e)))
}

/// BTCUSDT -> BTC-USDT-SWAP
pub fn to_inst_id(symbol: &str) -> Result<String, AppError> {
    let (base, quote) = split_symbol(symbol)?;
    Ok(format!("{}-{}-SWAP", base, quote))
}

/// BTC-USDT-SWAP -> BTCUSDT
pub fn from_inst_id(inst_id: &str) -> String {
    inst_id.trim_end_matches("-SWAP").replace('-', "")
}

impl OkxGateway {
    pub fn new(credential: GatewayCredential) -> Result<Self, AppError> {
        let passphrase = credential
            .passphrase
            .clone()
            .ok_or_else(|| AppError::Signature("okx缺少passphrase".to_string()))?;
        Ok(Self {
            client: http_client()?,
            api_key: credential.api_key,
            api_secret: credential.api_secret,
            passphrase,
            testnet: credential.testnet,
            rules: RuleCache::new(),
            margin_mode: RwLock::new(MarginMode::Cross),
            position_mode_ready: AtomicBool::new(false),
        })
    }

    fn td_mode(&self) -> &'static str {
        match *self.margin_mode.read().unwrap_or_else(|e| e.into_inner()) {
            MarginMode::Cross => "cross",
            MarginMode::Isolated => "isolated",
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
        body: Option<serde_json::Value>,
    ) -> Result<Vec<T>, AppError> {
        let body_text = match &body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        let timestamp = time_util::iso_timestamp();
        let signature = self.sign(&timestamp, method.as_str(), request_path, &body_text)?;

        let url = format!("{}{}", BASE_URL, request_path);
        let mut req = self
            .client
            .request(method, &url)
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if self.testnet {
            req = req.header("x-simulated-trading", "1");
        }
        if !body_text.is_empty() {
            req = req.body(body_text);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("okx http 429".to_string()));
        }
        let text = resp.text().await?;
        if status.is_server_error() {
            return Err(AppError::Transport(format!("okx http {}: {}", status, text)));
        }
        let wrapper: OkxResponse<T> = serde_json::from_str(&text)
            .map_err(|e| AppError::Parse(format!("okx响应解析: {} body={}", e, text)))?;
        if wrapper.code != "0" {
            return Err(classify_error(&wrapper.code, wrapper.msg));
        }
        Ok(wrapper.data)
    }

    /// 切到双向持仓模式;已有持仓时交易所会拒绝,这里降级为告警,
    /// 模式真不对的话后续下单会立刻报错
    async fn ensure_position_mode(&self) {
        if self.position_mode_ready.load(Ordering::Relaxed) {
            return;
        }
        let res: Result<Vec<serde_json::Value>, AppError> = self
            .request(
                reqwest::Method::POST,
                "/api/v5/account/set-position-mode",
                Some(json!({"posMode": "long_short_mode"})),
            )
            .await;
        if let Err(e) = res {
            warn!("okx设置双向持仓模式失败: {}", e);
        }
        self.position_mode_ready.store(true, Ordering::Relaxed);
    }

    async fn rule(&self, symbol: &str) -> Result<OkxRule, AppError> {
        if let Some(rule) = self.rules.get(symbol) {
            return Ok(rule);
        }
        let inst_id = to_inst_id(symbol)?;
        let path = format!(
            "/api/v5/public/instruments?instType=SWAP&instId={}",
            inst_id
        );
        let data: Vec<InstrumentData> = with_read_retry("okx_instruments", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        let inst = data
            .first()
            .ok_or_else(|| AppError::Precision(format!("okx无此交易对精度规则: {}", symbol)))?;
        let rule = OkxRule {
            lot: SymbolRule::from_step_str(&inst.lot_sz, parse_num(&inst.min_sz, "minSz")?)?,
            ct_val: parse_num(&inst.ct_val, "ctVal")?,
            tick: SymbolRule::from_step_str(&inst.tick_sz, 0.0)?,
        };
        if rule.ct_val <= 0.0 {
            return Err(AppError::Precision(format!("okx合约面值异常: {}", inst.ct_val)));
        }
        self.rules.insert(symbol, rule);
        Ok(rule)
    }

    /// 币数量换算成张数串
    async fn contracts_for(&self, symbol: &str, qty: f64) -> Result<String, AppError> {
        let rule = self.rule(symbol).await?;
        rule.lot.format(qty / rule.ct_val)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        pos_side: &str,
        qty: f64,
    ) -> Result<OrderReceipt, AppError> {
        let inst_id = to_inst_id(symbol)?;
        let sz = self.contracts_for(symbol, qty).await?;
        let body = json!({
            "instId": inst_id,
            "tdMode": self.td_mode(),
            "side": side,
            "posSide": pos_side,
            "ordType": "market",
            "sz": sz,
            "clOrdId": client_order_id(),
        });
        let data: Vec<OrderData> = self
            .request(reqwest::Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        let order = data
            .first()
            .ok_or_else(|| AppError::Parse("okx下单响应为空".to_string()))?;
        if !order.s_code.is_empty() && order.s_code != "0" {
            return Err(classify_error(&order.s_code, order.s_msg.clone()));
        }
        Ok(OrderReceipt {
            order_id: order.ord_id.clone(),
            quantity: sz,
        })
    }

    async fn place_algo_order(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
        is_stop_loss: bool,
    ) -> Result<(), AppError> {
        let inst_id = to_inst_id(symbol)?;
        let sz = self.contracts_for(symbol, qty).await?;
        let trigger = self.rule(symbol).await?.tick.format(trigger_price)?;
        let (order_side, pos_side) = match side {
            PositionSide::Long => ("sell", "long"),
            PositionSide::Short => ("buy", "short"),
        };
        let mut body = json!({
            "instId": inst_id,
            "tdMode": self.td_mode(),
            "side": order_side,
            "posSide": pos_side,
            "ordType": "conditional",
            "sz": sz,
        });
        if is_stop_loss {
            body["slTriggerPx"] = json!(trigger);
            // -1表示触发后市价抛出
            body["slOrdPx"] = json!("-1");
        } else {
            body["tpTriggerPx"] = json!(trigger);
            body["tpOrdPx"] = json!("-1");
        }
        let data: Vec<OrderData> = self
            .request(reqwest::Method::POST, "/api/v5/trade/order-algo", Some(body))
            .await?;
        if let Some(order) = data.first() {
            if !order.s_code.is_empty() && order.s_code != "0" {
                return Err(classify_error(&order.s_code, order.s_msg.clone()));
            }
        }
        Ok(())
    }

    async fn cancel_algo_orders(&self, symbol: &str, stop_loss: bool) -> Result<(), AppError> {
        let inst_id = to_inst_id(symbol)?;
        let path = format!(
            "/api/v5/trade/orders-algo-pending?ordType=conditional&instId={}",
            inst_id
        );
        let pending: Vec<AlgoOrderData> = with_read_retry("okx_algo_pending", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        let targets: Vec<serde_json::Value> = pending
            .iter()
            .filter(|o| {
                if stop_loss {
                    !o.sl_trigger_px.is_empty()
                } else {
                    !o.tp_trigger_px.is_empty()
                }
            })
            .map(|o| json!({"algoId": o.algo_id, "instId": o.inst_id}))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let _: Vec<serde_json::Value> = self
            .request(
                reqwest::Method::POST,
                "/api/v5/trade/cancel-algos",
                Some(serde_json::Value::Array(targets)),
            )
            .await?;
        Ok(())
    }

    async fn position_quantity(&self, symbol: &str, side: PositionSide) -> Result<f64, AppError> {
        let positions = self.get_positions().await?;
        positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.quantity)
            .ok_or_else(|| {
                AppError::BizError(format!("okx无{} {}持仓可平", symbol, side.as_str()))
            })
    }
}

#[async_trait]
impl TradingGateway for OkxGateway {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn get_balance(&self) -> Result<f64, AppError> {
        let data: Vec<BalanceData> = with_read_retry("okx_balance", || {
            self.request(
                reqwest::Method::GET,
                "/api/v5/account/balance?ccy=USDT",
                None,
            )
        })
        .await?;
        let detail = data
            .first()
            .and_then(|d| d.details.iter().find(|x| x.ccy == "USDT"))
            .ok_or_else(|| AppError::BizError("okx账户无USDT资产".to_string()))?;
        if !detail.avail_eq.is_empty() {
            return parse_num(&detail.avail_eq, "availEq");
        }
        parse_num(&detail.avail_bal, "availBal")
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AppError> {
        let data: Vec<PositionData> = with_read_retry("okx_positions", || {
            self.request(
                reqwest::Method::GET,
                "/api/v5/account/positions?instType=SWAP",
                None,
            )
        })
        .await?;
        let mut out = Vec::new();
        for row in data {
            let contracts = parse_num(&row.pos, "pos")?;
            if contracts == 0.0 {
                continue;
            }
            let symbol = from_inst_id(&row.inst_id);
            let side = match row.pos_side.as_str() {
                "long" => PositionSide::Long,
                "short" => PositionSide::Short,
                _ => {
                    if contracts > 0.0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    }
                }
            };
            let ct_val = self.rule(&symbol).await.map(|r| r.ct_val).unwrap_or(1.0);
            out.push(Position {
                symbol,
                side,
                quantity: contracts.abs() * ct_val,
                entry_price: parse_num(&row.avg_px, "avgPx")?,
                mark_price: parse_num(&row.mark_px, "markPx")?,
                unrealized_pnl: parse_num(&row.upl, "upl")?,
                leverage: parse_num(&row.lever, "lever")? as u32,
                margin_mode: if row.mgn_mode == "isolated" {
                    MarginMode::Isolated
                } else {
                    MarginMode::Cross
                },
            });
        }
        Ok(out)
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        let inst_id = to_inst_id(symbol)?;
        let path = format!("/api/v5/market/ticker?instId={}", inst_id);
        let data: Vec<TickerData> = with_read_retry("okx_ticker", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        let ticker = data
            .first()
            .ok_or_else(|| AppError::Parse("okx行情响应为空".to_string()))?;
        parse_num(&ticker.last, "last")
    }

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.ensure_position_mode().await;
        self.set_leverage(symbol, leverage).await?;
        self.place_market_order(symbol, "buy", "long", qty).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.ensure_position_mode().await;
        self.set_leverage(symbol, leverage).await?;
        self.place_market_order(symbol, "sell", "short", qty).await
    }

    async fn close_long(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Long).await?,
        };
        self.place_market_order(symbol, "sell", "long", qty).await
    }

    async fn close_short(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Short).await?,
        };
        self.place_market_order(symbol, "buy", "short", qty).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        let inst_id = to_inst_id(symbol)?;
        let body = json!({
            "instId": inst_id,
            "lever": leverage.to_string(),
            "mgnMode": self.td_mode(),
        });
        let _: Vec<serde_json::Value> = self
            .request(
                reqwest::Method::POST,
                "/api/v5/account/set-leverage",
                Some(body),
            )
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, is_cross: bool) -> Result<(), AppError> {
        // okx的保证金模式随单指定(tdMode),这里只切换后续下单用的模式
        let mode = if is_cross {
            MarginMode::Cross
        } else {
            MarginMode::Isolated
        };
        *self.margin_mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
        info!("okx后续下单保证金模式: {:?}", mode);
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_algo_order(symbol, side, qty, trigger_price, true)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_algo_order(symbol, side, qty, trigger_price, false)
            .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_algo_orders(symbol, true).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_algo_orders(symbol, false).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        let inst_id = to_inst_id(symbol)?;
        let path = format!("/api/v5/trade/orders-pending?instId={}", inst_id);
        let pending: Vec<PendingOrderData> = with_read_retry("okx_pending_orders", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        // 批量撤单接口单批上限20
        for chunk in pending.chunks(20) {
            let targets: Vec<serde_json::Value> = chunk
                .iter()
                .map(|o| json!({"ordId": o.ord_id, "instId": o.inst_id}))
                .collect();
            let _: Vec<serde_json::Value> = self
                .request(
                    reqwest::Method::POST,
                    "/api/v5/trade/cancel-batch-orders",
                    Some(serde_json::Value::Array(targets)),
                )
                .await?;
        }
        self.cancel_algo_orders(symbol, true).await?;
        self.cancel_algo_orders(symbol, false).await?;
        Ok(())
    }

    async fn format_quantity(&self, symbol: &str, qty: f64) -> Result<String, AppError> {
        self.contracts_for(symbol, qty).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inst_id_round_trip() {
        assert_eq!(to_inst_id("BTCUSDT").unwrap(), "BTC-USDT-SWAP");
        assert_eq!(from_inst_id("BTC-USDT-SWAP"), "BTCUSDT");
        assert_eq!(from_inst_id("ETH-USDC-SWAP"), "ETHUSDC");
    }

    #[test]
    fn test_classify_error_codes() {
        assert!(matches!(
            classify_error("50011", "rate".into()),
            AppError::RateLimited(_)
        ));
        assert!(matches!(
            classify_error("50113", "invalid sign".into()),
            AppError::Signature(_)
        ));
        assert!(matches!(
            classify_error("51121", "lot size".into()),
            AppError::Precision(_)
        ));
        match classify_error("51008", "insufficient balance".into()) {
            AppError::ExchangeApi { code, .. } => assert_eq!(code, "51008"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_num_empty_is_zero() {
        assert_eq!(parse_num("", "avgPx").unwrap(), 0.0);
        assert_eq!(parse_num("1.5", "avgPx").unwrap(), 1.5);
        assert!(parse_num("x", "avgPx").is_err());
    }
}
