use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ethers::core::utils::keccak256;
use ethers::signers::LocalWallet;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::time_util;
use crate::trading::gateway::retry::with_read_retry;
use crate::trading::gateway::symbol_rules::{RuleCache, SymbolRule};
use crate::trading::gateway::types::{MarginMode, OrderReceipt, Position, PositionSide};
use crate::trading::gateway::{http_client, split_symbol, Exchange, GatewayCredential, TradingGateway};

const MAINNET_BASE: &str = "https://api.hyperliquid.xyz";
const TESTNET_BASE: &str = "https://api.hyperliquid-testnet.xyz";

/// 市价单用IOC限价模拟,滑点上限1%
const MARKET_SLIPPAGE: f64 = 0.01;

/// Hyperliquid适配器
///
/// 鉴权不走API key: 每个写操作的action先做msgpack规范化编码,拼上nonce求keccak256
/// 得到connectionId,再对Agent(source, connectionId)做EIP-712签名;
/// 签名私钥优先用代理key(无提币权),没有配置时退回钱包私钥
pub struct HyperliquidGateway {
    client: reqwest::Client,
    base_url: String,
    wallet_address: String,
    signer: LocalWallet,
    /// EIP-712 Agent.source,主网"a"测试网"b"
    source: &'static str,
    assets: RuleCache<AssetInfo>,
    meta_loaded: AtomicBool,
    is_cross: AtomicBool,
}

#[derive(Debug, Clone)]
struct AssetInfo {
    index: u32,
    sz: SymbolRule,
    sz_decimals: u32,
}

#[derive(Debug, Serialize)]
struct OrderAction {
    #[serde(rename = "type")]
    kind: &'static str,
    orders: Vec<OrderSpec>,
    grouping: &'static str,
}

#[derive(Debug, Serialize)]
struct OrderSpec {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderKind,
}

#[derive(Debug, Serialize)]
enum OrderKind {
    #[serde(rename = "limit")]
    Limit { tif: &'static str },
    #[serde(rename = "trigger")]
    Trigger {
        #[serde(rename = "isMarket")]
        is_market: bool,
        #[serde(rename = "triggerPx")]
        trigger_px: String,
        tpsl: &'static str,
    },
}

#[derive(Debug, Serialize)]
struct CancelAction {
    #[serde(rename = "type")]
    kind: &'static str,
    cancels: Vec<CancelSpec>,
}

#[derive(Debug, Serialize)]
struct CancelSpec {
    a: u32,
    o: u64,
}

#[derive(Debug, Serialize)]
struct UpdateLeverageAction {
    #[serde(rename = "type")]
    kind: &'static str,
    asset: u32,
    #[serde(rename = "isCross")]
    is_cross: bool,
    leverage: u32,
}

#[derive(Debug, Deserialize)]
struct MetaResponse {
    universe: Vec<AssetMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetMeta {
    name: String,
    sz_decimals: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearinghouseState {
    #[serde(default)]
    withdrawable: String,
    #[serde(default)]
    asset_positions: Vec<AssetPosition>,
}

#[derive(Debug, Deserialize)]
struct AssetPosition {
    position: RawPosition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    coin: String,
    szi: String,
    #[serde(default)]
    entry_px: Option<String>,
    #[serde(default)]
    unrealized_pnl: String,
    leverage: RawLeverage,
}

#[derive(Debug, Deserialize)]
struct RawLeverage {
    #[serde(rename = "type")]
    kind: String,
    value: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontendOrder {
    coin: String,
    oid: u64,
    #[serde(default)]
    order_type: String,
}

/// u64装进32字节ABI字
fn u256_word(n: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&n.to_be_bytes());
    word
}

fn parse_num(value: &str, field: &str) -> Result<f64, AppError> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse::<f64>()
        .map_err(|e| AppError::Parse(format!("hyperliquid字段{}={}: {}", field, value, e)))
}

/// 永续价格规则: 最多5位有效数字,小数位不超过6-szDecimals,整数总是合法
fn format_price(px: f64, sz_decimals: u32) -> Result<String, AppError> {
    if !px.is_finite() || px <= 0.0 {
        return Err(AppError::Precision(format!("非法价格: {}", px)));
    }
    let max_decimals = (6i32 - sz_decimals as i32).max(0);
    let magnitude = px.log10().floor() as i32;
    let decimals = (4 - magnitude).clamp(0, max_decimals) as usize;
    let mut text = format!("{:.*}", decimals, px);
    if text.contains('.') {
        text = text
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string();
    }
    Ok(text)
}

impl HyperliquidGateway {
    pub fn new(credential: GatewayCredential) -> Result<Self, AppError> {
        let wallet_address = credential
            .wallet_address
            .clone()
            .ok_or_else(|| AppError::Signature("hyperliquid缺少钱包地址".to_string()))?;
        let key = credential
            .signing_key()
            .ok_or_else(|| AppError::Signature("hyperliquid缺少签名私钥".to_string()))?;
        let signer = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| AppError::Signature(format!("hyperliquid私钥非法: {}", e)))?;
        let (base_url, source) = if credential.testnet {
            (TESTNET_BASE.to_string(), "b")
        } else {
            (MAINNET_BASE.to_string(), "a")
        };
        Ok(Self {
            client: http_client()?,
            base_url,
            wallet_address,
            signer,
            source,
            assets: RuleCache::new(),
            meta_loaded: AtomicBool::new(false),
            is_cross: AtomicBool::new(true),
        })
    }

    async fn info_request<T: for<'de> Deserialize<'de>>(
        &self,
        body: Value,
    ) -> Result<T, AppError> {
        let url = format!("{}/info", self.base_url);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("hyperliquid http 429".to_string()));
        }
        let text = resp.text().await?;
        if status.is_server_error() {
            return Err(AppError::Transport(format!(
                "hyperliquid http {}: {}",
                status, text
            )));
        }
        if !status.is_success() {
            return Err(AppError::ExchangeApi {
                code: status.as_u16().to_string(),
                msg: text,
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| AppError::Parse(format!("hyperliquid响应解析: {} body={}", e, text)))
    }

    /// action的msgpack编码 + 8字节大端nonce + 0x00(无vault)
    fn connection_id<A: Serialize>(action: &A, nonce: u64) -> Result<[u8; 32], AppError> {
        let mut bytes = rmp_serde::to_vec_named(action)
            .map_err(|e| AppError::Signature(format!("action编码失败: {}", e)))?;
        bytes.extend_from_slice(&nonce.to_be_bytes());
        bytes.push(0x00);
        Ok(keccak256(&bytes))
    }

    /// EIP-712摘要: 域{name:"Exchange",version:"1",chainId:1337,verifyingContract:0x0},
    /// 结构体Agent(string source,bytes32 connectionId)
    fn agent_digest(&self, connection_id: [u8; 32]) -> H256 {
        let domain_typehash = keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
        );
        let mut enc = Vec::with_capacity(32 * 5);
        enc.extend_from_slice(&domain_typehash);
        enc.extend_from_slice(&keccak256(b"Exchange"));
        enc.extend_from_slice(&keccak256(b"1"));
        enc.extend_from_slice(&u256_word(1337));
        enc.extend_from_slice(&[0u8; 32]);
        let domain_separator = keccak256(&enc);

        let agent_typehash = keccak256(b"Agent(string source,bytes32 connectionId)");
        let mut enc = Vec::with_capacity(32 * 3);
        enc.extend_from_slice(&agent_typehash);
        enc.extend_from_slice(&keccak256(self.source.as_bytes()));
        enc.extend_from_slice(&connection_id);
        let struct_hash = keccak256(&enc);

        let mut msg = Vec::with_capacity(2 + 64);
        msg.extend_from_slice(&[0x19, 0x01]);
        msg.extend_from_slice(&domain_separator);
        msg.extend_from_slice(&struct_hash);
        H256::from(keccak256(&msg))
    }

    async fn exchange_request<A: Serialize>(&self, action: A) -> Result<Value, AppError> {
        let nonce = time_util::now_ms() as u64;
        let connection_id = Self::connection_id(&action, nonce)?;
        let digest = self.agent_digest(connection_id);
        let signature = self
            .signer
            .sign_hash(digest)
            .map_err(|e| AppError::Signature(format!("hyperliquid签名失败: {}", e)))?;

        let payload = json!({
            "action": serde_json::to_value(&action)?,
            "nonce": nonce,
            "signature": {
                "r": format!("0x{:064x}", signature.r),
                "s": format!("0x{:064x}", signature.s),
                "v": signature.v,
            },
        });
        let url = format!("{}/exchange", self.base_url);
        let resp = self.client.post(&url).json(&payload).send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited("hyperliquid http 429".to_string()));
        }
        let text = resp.text().await?;
        if status.is_server_error() {
            return Err(AppError::Transport(format!(
                "hyperliquid http {}: {}",
                status, text
            )));
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| AppError::Parse(format!("hyperliquid响应解析: {} body={}", e, text)))?;
        if body.get("status").and_then(Value::as_str) != Some("ok") {
            return Err(AppError::ExchangeApi {
                code: "hyperliquid".to_string(),
                msg: text,
            });
        }
        // 逐单状态里也可能埋着错误
        if let Some(statuses) = body
            .pointer("/response/data/statuses")
            .and_then(Value::as_array)
        {
            for s in statuses {
                if let Some(err) = s.get("error").and_then(Value::as_str) {
                    return Err(AppError::ExchangeApi {
                        code: "hyperliquid".to_string(),
                        msg: err.to_string(),
                    });
                }
            }
        }
        Ok(body)
    }

    async fn asset(&self, symbol: &str) -> Result<AssetInfo, AppError> {
        let (coin, _) = split_symbol(symbol)?;
        if self.meta_loaded.load(Ordering::Relaxed) {
            if let Some(info) = self.assets.get(coin) {
                return Ok(info);
            }
        }
        let meta: MetaResponse = with_read_retry("hyperliquid_meta", || {
            self.info_request(json!({"type": "meta"}))
        })
        .await?;
        for (index, item) in meta.universe.iter().enumerate() {
            self.assets.insert(
                &item.name,
                AssetInfo {
                    index: index as u32,
                    sz: SymbolRule::from_decimals(item.sz_decimals, 0.0),
                    sz_decimals: item.sz_decimals,
                },
            );
        }
        self.meta_loaded.store(true, Ordering::Relaxed);
        self.assets
            .get(coin)
            .ok_or_else(|| AppError::Precision(format!("hyperliquid无此币种: {}", coin)))
    }

    async fn clearinghouse(&self) -> Result<ClearinghouseState, AppError> {
        let body = json!({"type": "clearinghouseState", "user": self.wallet_address});
        with_read_retry("hyperliquid_clearinghouse", || {
            self.info_request(body.clone())
        })
        .await
    }

    async fn mid_price(&self, coin: &str) -> Result<f64, AppError> {
        let mids: HashMap<String, String> = with_read_retry("hyperliquid_all_mids", || {
            self.info_request(json!({"type": "allMids"}))
        })
        .await?;
        let px = mids
            .get(coin)
            .ok_or_else(|| AppError::BizError(format!("hyperliquid无{}中间价", coin)))?;
        parse_num(px, "mid")
    }

    /// IOC限价当市价用,买单上浮卖单下压
    async fn place_ioc_order(
        &self,
        symbol: &str,
        is_buy: bool,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderReceipt, AppError> {
        let asset = self.asset(symbol).await?;
        let (coin, _) = split_symbol(symbol)?;
        let mid = self.mid_price(coin).await?;
        let px = if is_buy {
            mid * (1.0 + MARKET_SLIPPAGE)
        } else {
            mid * (1.0 - MARKET_SLIPPAGE)
        };
        let size = asset.sz.format(qty)?;
        let action = OrderAction {
            kind: "order",
            orders: vec![OrderSpec {
                a: asset.index,
                b: is_buy,
                p: format_price(px, asset.sz_decimals)?,
                s: size.clone(),
                r: reduce_only,
                t: OrderKind::Limit { tif: "Ioc" },
            }],
            grouping: "na",
        };
        let body = self.exchange_request(action).await?;
        let oid = body
            .pointer("/response/data/statuses/0/filled/oid")
            .or_else(|| body.pointer("/response/data/statuses/0/resting/oid"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(OrderReceipt {
            order_id: oid.to_string(),
            quantity: size,
        })
    }

    async fn place_trigger_order(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
        tpsl: &'static str,
    ) -> Result<(), AppError> {
        let asset = self.asset(symbol).await?;
        let trigger_px = format_price(trigger_price, asset.sz_decimals)?;
        // 平多是卖,平空是买
        let is_buy = matches!(side, PositionSide::Short);
        let action = OrderAction {
            kind: "order",
            orders: vec![OrderSpec {
                a: asset.index,
                b: is_buy,
                p: trigger_px.clone(),
                s: asset.sz.format(qty)?,
                r: true,
                t: OrderKind::Trigger {
                    is_market: true,
                    trigger_px,
                    tpsl,
                },
            }],
            grouping: "na",
        };
        self.exchange_request(action).await?;
        Ok(())
    }

    async fn open_orders_for(&self, coin: &str) -> Result<Vec<FrontendOrder>, AppError> {
        let body = json!({"type": "frontendOpenOrders", "user": self.wallet_address});
        let orders: Vec<FrontendOrder> = with_read_retry("hyperliquid_open_orders", || {
            self.info_request(body.clone())
        })
        .await?;
        Ok(orders.into_iter().filter(|o| o.coin == coin).collect())
    }

    async fn cancel_orders<F: Fn(&FrontendOrder) -> bool>(
        &self,
        symbol: &str,
        should_cancel: F,
    ) -> Result<(), AppError> {
        let asset = self.asset(symbol).await?;
        let (coin, _) = split_symbol(symbol)?;
        let targets: Vec<CancelSpec> = self
            .open_orders_for(coin)
            .await?
            .iter()
            .filter(|o| should_cancel(o))
            .map(|o| CancelSpec {
                a: asset.index,
                o: o.oid,
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let action = CancelAction {
            kind: "cancel",
            cancels: targets,
        };
        self.exchange_request(action).await?;
        Ok(())
    }

    async fn position_quantity(&self, symbol: &str, side: PositionSide) -> Result<f64, AppError> {
        let positions = self.get_positions().await?;
        positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.quantity)
            .ok_or_else(|| {
                AppError::BizError(format!(
                    "hyperliquid无{} {}持仓可平",
                    symbol,
                    side.as_str()
                ))
            })
    }
}

#[async_trait]
impl TradingGateway for HyperliquidGateway {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    async fn get_balance(&self) -> Result<f64, AppError> {
        let state = self.clearinghouse().await?;
        parse_num(&state.withdrawable, "withdrawable")
    }

    async fn get_positions(&self) -> Result<Vec<Position>, AppError> {
        let state = self.clearinghouse().await?;
        let mut out = Vec::new();
        for item in &state.asset_positions {
            let raw = &item.position;
            let szi = parse_num(&raw.szi, "szi")?;
            if szi == 0.0 {
                continue;
            }
            let symbol = format!("{}USDT", raw.coin);
            let mark_price = self.mid_price(&raw.coin).await.unwrap_or(0.0);
            out.push(Position {
                symbol,
                side: if szi > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: szi.abs(),
                entry_price: raw
                    .entry_px
                    .as_deref()
                    .map(|p| parse_num(p, "entryPx"))
                    .transpose()?
                    .unwrap_or(0.0),
                mark_price,
                unrealized_pnl: parse_num(&raw.unrealized_pnl, "unrealizedPnl")?,
                leverage: raw.leverage.value,
                margin_mode: if raw.leverage.kind == "isolated" {
                    MarginMode::Isolated
                } else {
                    MarginMode::Cross
                },
            });
        }
        Ok(out)
    }

    async fn get_market_price(&self, symbol: &str) -> Result<f64, AppError> {
        let (coin, _) = split_symbol(symbol)?;
        self.mid_price(coin).await
    }

    async fn open_long(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_ioc_order(symbol, true, qty, false).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        qty: f64,
        leverage: u32,
    ) -> Result<OrderReceipt, AppError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_ioc_order(symbol, false, qty, false).await
    }

    async fn close_long(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Long).await?,
        };
        self.place_ioc_order(symbol, false, qty, true).await
    }

    async fn close_short(&self, symbol: &str, qty: Option<f64>) -> Result<OrderReceipt, AppError> {
        let qty = match qty {
            Some(q) => q,
            None => self.position_quantity(symbol, PositionSide::Short).await?,
        };
        self.place_ioc_order(symbol, true, qty, true).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), AppError> {
        let asset = self.asset(symbol).await?;
        let action = UpdateLeverageAction {
            kind: "updateLeverage",
            asset: asset.index,
            is_cross: self.is_cross.load(Ordering::Relaxed),
            leverage,
        };
        self.exchange_request(action).await?;
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, is_cross: bool) -> Result<(), AppError> {
        // 保证金模式跟着下一次updateLeverage一起生效
        self.is_cross.store(is_cross, Ordering::Relaxed);
        Ok(())
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_trigger_order(symbol, side, qty, trigger_price, "sl")
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        trigger_price: f64,
    ) -> Result<(), AppError> {
        self.place_trigger_order(symbol, side, qty, trigger_price, "tp")
            .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_orders(symbol, |o| o.order_type.contains("Stop"))
            .await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_orders(symbol, |o| o.order_type.contains("Take Profit"))
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), AppError> {
        self.cancel_orders(symbol, |_| true).await
    }

    async fn format_quantity(&self, symbol: &str, qty: f64) -> Result<String, AppError> {
        let asset = self.asset(symbol).await?;
        asset.sz.format(qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_price_significant_figures() {
        // 5位有效数字
        assert_eq!(format_price(60612.345, 5).unwrap(), "60612");
        assert_eq!(format_price(1.234567, 0).unwrap(), "1.2346");
        // 小数位上限6-szDecimals
        assert_eq!(format_price(0.0012345, 2).unwrap(), "0.0012");
        // 尾零剔除
        assert_eq!(format_price(100.0, 0).unwrap(), "100");
        assert!(format_price(-1.0, 0).is_err());
        assert!(format_price(f64::NAN, 0).is_err());
    }

    #[test]
    fn test_connection_id_changes_with_nonce() {
        let action = CancelAction {
            kind: "cancel",
            cancels: vec![CancelSpec { a: 1, o: 42 }],
        };
        let a = HyperliquidGateway::connection_id(&action, 1).unwrap();
        let b = HyperliquidGateway::connection_id(&action, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_order_action_wire_shape() {
        let action = OrderAction {
            kind: "order",
            orders: vec![OrderSpec {
                a: 0,
                b: true,
                p: "60612".to_string(),
                s: "0.01".to_string(),
                r: false,
                t: OrderKind::Limit { tif: "Ioc" },
            }],
            grouping: "na",
        };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["type"], "order");
        assert_eq!(v["orders"][0]["t"]["limit"]["tif"], "Ioc");
        assert_eq!(v["grouping"], "na");

        let trigger = OrderKind::Trigger {
            is_market: true,
            trigger_px: "59000".to_string(),
            tpsl: "sl",
        };
        let v = serde_json::to_value(&trigger).unwrap();
        assert_eq!(v["trigger"]["isMarket"], true);
        assert_eq!(v["trigger"]["tpsl"], "sl");
    }

    #[test]
    fn test_agent_digest_depends_on_network() {
        let make = |testnet: bool| {
            HyperliquidGateway::new(GatewayCredential {
                exchange: Exchange::Hyperliquid,
                api_key: String::new(),
                api_secret: String::new(),
                passphrase: None,
                wallet_address: Some("0x1234567890123456789012345678901234567890".into()),
                wallet_private_key: Some(
                    "4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f".into(),
                ),
                agent_private_key: None,
                testnet,
            })
            .unwrap()
        };
        let cid = [7u8; 32];
        assert_ne!(make(false).agent_digest(cid), make(true).agent_digest(cid));
    }
}
