use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::oracle::{DecisionOracle, OracleAction};
use super::state::StrategyState;
use super::store::{DecisionStore, StrategyStore};
use crate::error::AppError;
use crate::time_util;
use crate::trading::gateway::retry::with_read_retry;
use crate::trading::gateway::types::{Position, PositionSide};
use crate::trading::gateway::TradingGateway;
use crate::trading::indicator::snapshot::{compute_snapshot, IndicatorSnapshot};
use crate::trading::indicator::vegas::PricePosition;
use crate::trading::market::candle_cache::CandleArena;
use crate::trading::model::decision_record::DecisionRecordEntity;
use crate::trading::model::parsed_signal::ParsedSignalEntity;
use crate::trading::model::strategy_status::StrategyStatusEntity;
use crate::trading::model::trader_config::TraderConfigEntity;
use crate::trading::signal::parser::SignalIntent;
use crate::trading::signal::store::SignalStore;

/// 信号的有效期:超过之后还没入场的策略直接作废
pub const SIGNAL_TTL_MS: i64 = 72 * 3600 * 1000;

/// 加仓/开仓裁决的最低置信度,低于它按等待处理;平仓不设门槛
const MIN_ORACLE_CONFIDENCE: f64 = 0.3;

const DEFAULT_PROMPT_PREAMBLE: &str = "按照趋势跟随的思路管理这个策略:顺势而为,\
优先保护本金,加仓只在趋势延续时考虑,破位坚决离场。";

/// 一次评估用到的交易员配置,从 trader_config 转换而来
#[derive(Debug, Clone)]
pub struct TraderContext {
    pub trader_id: String,
    /// 允许交易的规范交易对
    pub symbols: Vec<String>,
    pub leverage: u32,
    pub is_cross: bool,
    /// 单次开仓占用的保证金(USDT)
    pub order_notional: f64,
    /// 交易员自带的提示词,替换默认开场白
    pub custom_prompt: Option<String>,
}

impl TraderContext {
    pub fn from_config(cfg: &TraderConfigEntity) -> Self {
        Self {
            trader_id: cfg.trader_id.clone(),
            symbols: cfg.symbol_list(),
            leverage: cfg.leverage.max(1) as u32,
            is_cross: cfg.is_cross == 1,
            order_notional: cfg.order_notional,
            custom_prompt: cfg
                .custom_prompt
                .clone()
                .filter(|p| !p.trim().is_empty()),
        }
    }
}

/// 策略评估引擎。每个(trader, strategy)一轮评估固定产出一条决策流水,
/// 状态机只在真实执行成功后前进;同一策略同一时刻只允许一路在评估,
/// 撞上锁的这一轮直接跳过。
pub struct StrategyEngine {
    arena: Arc<CandleArena>,
    strategies: Arc<dyn StrategyStore>,
    decisions: Arc<dyn DecisionStore>,
    signals: Arc<dyn SignalStore>,
    oracle: Arc<dyn DecisionOracle>,
    eval_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StrategyEngine {
    pub fn new(
        arena: Arc<CandleArena>,
        strategies: Arc<dyn StrategyStore>,
        decisions: Arc<dyn DecisionStore>,
        signals: Arc<dyn SignalStore>,
        oracle: Arc<dyn DecisionOracle>,
    ) -> Self {
        Self {
            arena,
            strategies,
            decisions,
            signals,
            oracle,
            eval_locks: DashMap::new(),
        }
    }

    /// 跑一轮完整评估:先管已有策略,再采纳新信号开新策略。
    /// 返回本轮产出的全部决策流水,方便上层打日志。
    pub async fn evaluate_trader(
        &self,
        ctx: &TraderContext,
        gateway: Arc<dyn TradingGateway>,
    ) -> Result<Vec<DecisionRecordEntity>, AppError> {
        // 仓位以交易所为准,一轮只读一次
        let positions = with_read_retry("get_positions", || gateway.get_positions()).await?;

        // 老策略在前:同一轮里先处理持仓管理,再考虑新入场
        let mut queue = self.strategies.active_for_trader(&ctx.trader_id).await?;
        let now = time_util::now_ms();
        let fresh = self.signals.recent_since(now - SIGNAL_TTL_MS).await?;
        for signal in fresh {
            if !ctx.symbols.contains(&signal.symbol) {
                continue;
            }
            if queue.iter().any(|s| s.symbol == signal.symbol) {
                // 同一交易对只允许一个在管策略,先管完手上的,信号留到下轮
                debug!(
                    "{} 已有在管策略,信号 {} 暂不接手",
                    signal.symbol, signal.signal_id
                );
                continue;
            }
            if self
                .strategies
                .get(&ctx.trader_id, &signal.signal_id)
                .await?
                .is_some()
            {
                // 已经被这个trader消费过
                continue;
            }
            queue.push(self.adopt_signal(ctx, &signal).await?);
        }

        let mut records = Vec::with_capacity(queue.len());
        for status in queue {
            let key = format!("{}:{}", status.trader_id, status.strategy_id);
            let lock = self
                .eval_locks
                .entry(key.clone())
                .or_default()
                .clone();
            let guard = match lock.try_lock() {
                Ok(g) => g,
                Err(_) => {
                    debug!("策略 {} 还在上一轮评估中,本轮跳过", key);
                    continue;
                }
            };
            let record = self
                .evaluate_strategy(ctx, gateway.as_ref(), status, &positions)
                .await;
            drop(guard);

            // 流水无条件追加,追加失败只能记日志,不能反过来影响交易
            if let Err(e) = self.decisions.append(&record).await {
                error!("决策流水落库失败: {}", e);
            }
            records.push(record);
        }
        Ok(records)
    }

    /// 新信号被该trader消费:建一条WAITING状态记录,从此按已有策略走
    async fn adopt_signal(
        &self,
        ctx: &TraderContext,
        signal: &ParsedSignalEntity,
    ) -> Result<StrategyStatusEntity, AppError> {
        let status = StrategyStatusEntity {
            id: None,
            trader_id: ctx.trader_id.clone(),
            strategy_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            state: StrategyState::Waiting.as_str().to_string(),
            entry_price: 0.0,
            quantity: 0.0,
            realized_pnl: 0.0,
            updated_at: time_util::now_ms(),
        };
        self.strategies.upsert(&status).await?;
        info!(
            "trader {} 采纳信号 {} ({} {})",
            ctx.trader_id, signal.signal_id, signal.direction, signal.symbol
        );
        Ok(status)
    }

    /// 单个策略的一轮评估,任何出口都会给出一条决策流水
    async fn evaluate_strategy(
        &self,
        ctx: &TraderContext,
        gateway: &dyn TradingGateway,
        mut status: StrategyStatusEntity,
        positions: &[Position],
    ) -> DecisionRecordEntity {
        let now = time_util::now_ms();
        let mut price_levels = "{}".to_string();
        let mut indicator_values = "{}".to_string();
        let mut oracle_prompt = String::new();
        let mut oracle_response = String::new();

        let state = match StrategyState::from_str(&status.state) {
            Ok(s) => s,
            Err(e) => {
                error!("策略 {} 状态非法: {}", status.strategy_id, e);
                return build_record(
                    &status,
                    now,
                    OracleAction::Wait,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    false,
                    Some(e.to_string()),
                );
            }
        };

        // 读不到信号库按瞬时故障处理,绝不因此动状态
        let signal = match self.signals.get(&status.strategy_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!("策略 {} 信号读取失败,本轮跳过: {}", status.strategy_id, e);
                return build_record(
                    &status,
                    now,
                    OracleAction::Wait,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    false,
                    Some(e.to_string()),
                );
            }
        };
        // 信号原文可能已经不在了(过期清理),持仓方向还能从交易所兜回来
        let parsed: Option<SignalIntent> = signal
            .as_ref()
            .and_then(|s| serde_json::from_str(&s.content_json).ok());
        let intent = match parsed {
            Some(i) => i,
            None => match positions.iter().find(|p| p.symbol == status.symbol) {
                Some(p) if state.position_open() => SignalIntent {
                    symbol: status.symbol.clone(),
                    direction: p.side,
                    entry_price: None,
                    add_prices: Vec::new(),
                    stop_loss: None,
                    take_profit: None,
                },
                _ => {
                    warn!(
                        "策略 {} 的信号内容缺失且无持仓,作废",
                        status.strategy_id
                    );
                    let note = self.close_status(&mut status, now, 0.0).await;
                    return build_record(
                        &status,
                        now,
                        OracleAction::Close,
                        &price_levels,
                        &indicator_values,
                        &oracle_prompt,
                        &oracle_response,
                        true,
                        note,
                    );
                }
            },
        };
        price_levels = json!({
            "entry": intent.entry_price,
            "add": intent.add_prices,
            "stop_loss": intent.stop_loss,
            "take_profit": intent.take_profit,
        })
        .to_string();

        let side = intent.direction;
        let live = positions
            .iter()
            .find(|p| p.symbol == status.symbol && p.side == side)
            .cloned();

        // 手动平仓检测:状态机认为有仓,交易所却没有,说明人已出手,
        // 状态收敛到CLOSED并且从此不再动它
        if state.position_open() && live.is_none() {
            warn!(
                "策略 {} 的 {} {} 仓位已在交易所消失,判定为手动平仓",
                status.strategy_id,
                status.symbol,
                side.as_str()
            );
            let note = self.close_status(&mut status, now, 0.0).await;
            return build_record(
                &status,
                now,
                OracleAction::Close,
                &price_levels,
                &indicator_values,
                &oracle_prompt,
                &oracle_response,
                true,
                note,
            );
        }

        // 过了有效期还没入场的信号不再追
        if state == StrategyState::Waiting {
            if let Some(sig) = &signal {
                if now - sig.received_at > SIGNAL_TTL_MS {
                    info!("策略 {} 信号过期,作废", status.strategy_id);
                    let note = self.close_status(&mut status, now, 0.0).await;
                    return build_record(
                        &status,
                        now,
                        OracleAction::Close,
                        &price_levels,
                        &indicator_values,
                        &oracle_prompt,
                        &oracle_response,
                        true,
                        note,
                    );
                }
            }
        }

        let h1 = compute_snapshot(&self.arena.window_snapshot(&status.symbol, "1H"));
        let h4 = compute_snapshot(&self.arena.window_snapshot(&status.symbol, "4H"));
        indicator_values = json!({"1H": h1, "4H": h4}).to_string();
        let (h1, h4) = match (h1, h4) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                warn!(
                    "{} 的1H/4H行情窗口不足,本轮不做任何动作",
                    status.symbol
                );
                return build_record(
                    &status,
                    now,
                    OracleAction::Wait,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    true,
                    None,
                );
            }
        };

        // 入场硬条件:1H和4H的Vegas通道必须同时顺着信号方向,
        // 不满足连决策服务都不问
        if state == StrategyState::Waiting && !vegas_aligned(side, &h1, &h4) {
            debug!(
                "策略 {} 入场硬条件不满足(1H={:?} 4H={:?}),等待",
                status.strategy_id, h1.position, h4.position
            );
            return build_record(
                &status,
                now,
                OracleAction::Wait,
                &price_levels,
                &indicator_values,
                &oracle_prompt,
                &oracle_response,
                true,
                None,
            );
        }

        oracle_prompt = build_prompt(ctx, &status, state, &intent, &h1, &h4, live.as_ref());
        let verdict = match self.oracle.decide(&oracle_prompt).await {
            Ok(v) => {
                oracle_response = serde_json::to_string(&v).unwrap_or_default();
                v
            }
            Err(e) => {
                // 决策服务失败只降级成按兵不动,绝不盲目下单
                warn!("决策服务失败,本轮按兵不动: {}", e);
                return build_record(
                    &status,
                    now,
                    OracleAction::Wait,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    false,
                    Some(e.to_string()),
                );
            }
        };

        if matches!(verdict.action, OracleAction::Open | OracleAction::Add)
            && verdict.confidence < MIN_ORACLE_CONFIDENCE
        {
            info!(
                "裁决 {} 置信度 {:.2} 低于 {:.2},按等待处理",
                verdict.action, verdict.confidence, MIN_ORACLE_CONFIDENCE
            );
            return build_record(
                &status,
                now,
                OracleAction::Wait,
                &price_levels,
                &indicator_values,
                &oracle_prompt,
                &oracle_response,
                true,
                None,
            );
        }

        let admissible = match verdict.action {
            OracleAction::Wait => true,
            OracleAction::Open => state == StrategyState::Waiting,
            OracleAction::Add => state.next_add().is_some(),
            OracleAction::Close => true,
        };
        if !admissible {
            warn!(
                "裁决 {} 在状态 {} 下不可执行,按等待处理",
                verdict.action, state
            );
            return build_record(
                &status,
                now,
                OracleAction::Wait,
                &price_levels,
                &indicator_values,
                &oracle_prompt,
                &oracle_response,
                true,
                None,
            );
        }

        match verdict.action {
            OracleAction::Wait => build_record(
                &status,
                now,
                OracleAction::Wait,
                &price_levels,
                &indicator_values,
                &oracle_prompt,
                &oracle_response,
                true,
                None,
            ),
            OracleAction::Open => {
                let (success, note) = self
                    .execute_open(ctx, gateway, &mut status, &intent, side, now)
                    .await;
                build_record(
                    &status,
                    now,
                    OracleAction::Open,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    success,
                    note,
                )
            }
            OracleAction::Add => {
                let (success, note) = self
                    .execute_add(ctx, gateway, &mut status, &intent, side, state, now)
                    .await;
                build_record(
                    &status,
                    now,
                    OracleAction::Add,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    success,
                    note,
                )
            }
            OracleAction::Close => {
                let (success, note) = self
                    .execute_close(gateway, &mut status, side, state, live.as_ref(), now)
                    .await;
                build_record(
                    &status,
                    now,
                    OracleAction::Close,
                    &price_levels,
                    &indicator_values,
                    &oracle_prompt,
                    &oracle_response,
                    success,
                    note,
                )
            }
        }
    }

    /// 开仓:先定数量,再对齐保证金模式和杠杆,最后市价单进场。
    /// 订单类失败绝不重试,原文留进决策流水。
    async fn execute_open(
        &self,
        ctx: &TraderContext,
        gateway: &dyn TradingGateway,
        status: &mut StrategyStatusEntity,
        intent: &SignalIntent,
        side: PositionSide,
        now: i64,
    ) -> (bool, Option<String>) {
        let price = match with_read_retry("get_market_price", || {
            gateway.get_market_price(&status.symbol)
        })
        .await
        {
            Ok(p) => p,
            Err(e) => return (false, Some(e.raw_text())),
        };

        let raw_qty = ctx.order_notional * ctx.leverage as f64 / price;
        let qty_text = match gateway.format_quantity(&status.symbol, raw_qty).await {
            Ok(q) => q,
            Err(e) => return (false, Some(e.raw_text())),
        };
        let qty: f64 = qty_text.parse().unwrap_or(raw_qty);

        if let Err(e) = gateway.set_margin_mode(&status.symbol, ctx.is_cross).await {
            return (false, Some(e.raw_text()));
        }
        if let Err(e) = gateway.set_leverage(&status.symbol, ctx.leverage).await {
            return (false, Some(e.raw_text()));
        }

        let order = match side {
            PositionSide::Long => gateway.open_long(&status.symbol, qty, ctx.leverage).await,
            PositionSide::Short => gateway.open_short(&status.symbol, qty, ctx.leverage).await,
        };
        let receipt = match order {
            Ok(r) => r,
            Err(e) => {
                error!("开仓失败 {} {}: {}", status.symbol, side.as_str(), e.raw_text());
                return (false, Some(e.raw_text()));
            }
        };
        info!(
            "开仓成功 {} {} qty={} order_id={}",
            status.symbol,
            side.as_str(),
            receipt.quantity,
            receipt.order_id
        );

        status.state = StrategyState::Entry.as_str().to_string();
        status.entry_price = price;
        status.quantity = receipt.quantity.parse().unwrap_or(qty);
        status.updated_at = now;

        let mut notes = Vec::new();
        if let Err(e) = self.commit_status(status).await {
            error!("策略状态落库失败: {}", e);
            notes.push(format!("状态落库失败: {}", e));
        }
        // 止损止盈跟挂,失败不回滚已成交的仓位
        if let Some(sl) = intent.stop_loss {
            if let Err(e) = gateway
                .set_stop_loss(&status.symbol, side, status.quantity, sl)
                .await
            {
                error!("止损挂单失败 {}: {}", status.symbol, e.raw_text());
                notes.push(format!("止损挂单失败: {}", e.raw_text()));
            }
        }
        if let Some(tp) = intent.take_profit {
            if let Err(e) = gateway
                .set_take_profit(&status.symbol, side, status.quantity, tp)
                .await
            {
                error!("止盈挂单失败 {}: {}", status.symbol, e.raw_text());
                notes.push(format!("止盈挂单失败: {}", e.raw_text()));
            }
        }
        (true, join_notes(notes))
    }

    /// 加仓:数量口径与开仓一致,成功后状态进一档,止损按总量重挂
    async fn execute_add(
        &self,
        ctx: &TraderContext,
        gateway: &dyn TradingGateway,
        status: &mut StrategyStatusEntity,
        intent: &SignalIntent,
        side: PositionSide,
        state: StrategyState,
        now: i64,
    ) -> (bool, Option<String>) {
        let next = match state.next_add() {
            Some(n) => n,
            None => return (true, None),
        };

        let price = match with_read_retry("get_market_price", || {
            gateway.get_market_price(&status.symbol)
        })
        .await
        {
            Ok(p) => p,
            Err(e) => return (false, Some(e.raw_text())),
        };
        let raw_qty = ctx.order_notional * ctx.leverage as f64 / price;
        let qty_text = match gateway.format_quantity(&status.symbol, raw_qty).await {
            Ok(q) => q,
            Err(e) => return (false, Some(e.raw_text())),
        };
        let qty: f64 = qty_text.parse().unwrap_or(raw_qty);

        let order = match side {
            PositionSide::Long => gateway.open_long(&status.symbol, qty, ctx.leverage).await,
            PositionSide::Short => gateway.open_short(&status.symbol, qty, ctx.leverage).await,
        };
        let receipt = match order {
            Ok(r) => r,
            Err(e) => {
                error!("加仓失败 {} {}: {}", status.symbol, side.as_str(), e.raw_text());
                return (false, Some(e.raw_text()));
            }
        };
        info!(
            "加仓成功 {} -> {} qty={} order_id={}",
            state, next, receipt.quantity, receipt.order_id
        );

        status.state = next.as_str().to_string();
        status.quantity += receipt.quantity.parse().unwrap_or(qty);
        status.updated_at = now;

        let mut notes = Vec::new();
        if let Err(e) = self.commit_status(status).await {
            error!("策略状态落库失败: {}", e);
            notes.push(format!("状态落库失败: {}", e));
        }
        if let Some(sl) = intent.stop_loss {
            // 总量变了,旧止损单按新数量重挂
            if let Err(e) = gateway.cancel_stop_loss_orders(&status.symbol).await {
                warn!("旧止损撤单失败 {}: {}", status.symbol, e.raw_text());
            }
            if let Err(e) = gateway
                .set_stop_loss(&status.symbol, side, status.quantity, sl)
                .await
            {
                error!("止损重挂失败 {}: {}", status.symbol, e.raw_text());
                notes.push(format!("止损重挂失败: {}", e.raw_text()));
            }
        }
        (true, join_notes(notes))
    }

    /// 平仓:先撤光挂单再全量市价平;WAITING状态下的close是纯作废,不碰交易所
    async fn execute_close(
        &self,
        gateway: &dyn TradingGateway,
        status: &mut StrategyStatusEntity,
        side: PositionSide,
        state: StrategyState,
        live: Option<&Position>,
        now: i64,
    ) -> (bool, Option<String>) {
        if !state.position_open() {
            let note = self.close_status(status, now, 0.0).await;
            return (true, note);
        }

        if let Err(e) = gateway.cancel_all_orders(&status.symbol).await {
            warn!("平仓前撤单失败 {}: {}", status.symbol, e.raw_text());
        }
        let order = match side {
            PositionSide::Long => gateway.close_long(&status.symbol, None).await,
            PositionSide::Short => gateway.close_short(&status.symbol, None).await,
        };
        let receipt = match order {
            Ok(r) => r,
            Err(e) => {
                error!("平仓失败 {} {}: {}", status.symbol, side.as_str(), e.raw_text());
                return (false, Some(e.raw_text()));
            }
        };
        info!(
            "平仓成功 {} {} qty={} order_id={}",
            status.symbol,
            side.as_str(),
            receipt.quantity,
            receipt.order_id
        );

        let realized = live.map(|p| p.unrealized_pnl).unwrap_or(0.0);
        status.quantity = 0.0;
        let note = self.close_status(status, now, realized).await;
        (true, note)
    }

    /// 状态收敛到CLOSED并落库,返回落库失败的备注
    async fn close_status(
        &self,
        status: &mut StrategyStatusEntity,
        now: i64,
        realized_delta: f64,
    ) -> Option<String> {
        status.state = StrategyState::Closed.as_str().to_string();
        status.realized_pnl += realized_delta;
        status.updated_at = now;
        match self.commit_status(status).await {
            Ok(_) => None,
            Err(e) => {
                error!("策略关闭状态落库失败: {}", e);
                Some(format!("状态落库失败: {}", e))
            }
        }
    }

    /// 提交前重读一次:评估期间别的路径可能已把策略关了,CLOSED永远优先
    async fn commit_status(&self, status: &StrategyStatusEntity) -> Result<(), AppError> {
        if let Some(fresh) = self
            .strategies
            .get(&status.trader_id, &status.strategy_id)
            .await?
        {
            if fresh.state == StrategyState::Closed.as_str()
                && status.state != StrategyState::Closed.as_str()
            {
                error!(
                    "策略 {} 在评估期间已被关闭,放弃本次状态覆盖",
                    status.strategy_id
                );
                return Ok(());
            }
        }
        self.strategies.upsert(status).await
    }
}

/// 入场硬条件:两个周期都要顺着信号方向站在通道外侧
fn vegas_aligned(side: PositionSide, h1: &IndicatorSnapshot, h4: &IndicatorSnapshot) -> bool {
    let want = match side {
        PositionSide::Long => PricePosition::Above,
        PositionSide::Short => PricePosition::Below,
    };
    h1.position == Some(want) && h4.position == Some(want)
}

fn allowed_actions(state: StrategyState) -> &'static [&'static str] {
    match state {
        StrategyState::Waiting => &["wait", "open", "close"],
        StrategyState::Entry | StrategyState::Add1 => &["wait", "add", "close"],
        StrategyState::Add2 => &["wait", "close"],
        StrategyState::Closed => &["wait"],
    }
}

fn fmt_price(price: Option<f64>) -> String {
    price
        .map(|v| format!("{}", v))
        .unwrap_or_else(|| "未给出".to_string())
}

fn build_prompt(
    ctx: &TraderContext,
    status: &StrategyStatusEntity,
    state: StrategyState,
    intent: &SignalIntent,
    h1: &IndicatorSnapshot,
    h4: &IndicatorSnapshot,
    live: Option<&Position>,
) -> String {
    let preamble = ctx
        .custom_prompt
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT_PREAMBLE);
    let mut sections = vec![preamble.to_string()];
    sections.push(format!(
        "信号: {} {},入场参考={},加仓参考={:?},止损={},止盈={}",
        intent.direction.as_str(),
        intent.symbol,
        fmt_price(intent.entry_price),
        intent.add_prices,
        fmt_price(intent.stop_loss),
        fmt_price(intent.take_profit),
    ));
    sections.push(format!(
        "当前策略状态: {},持仓数量={},开仓均价={}",
        state, status.quantity, status.entry_price
    ));
    match live {
        Some(p) => sections.push(format!(
            "交易所仓位: 数量={},标记价={},未实现盈亏={:.2}",
            p.quantity, p.mark_price, p.unrealized_pnl
        )),
        None => sections.push("交易所仓位: 无".to_string()),
    }
    sections.push(format!("1H指标: {}", h1.describe()));
    sections.push(format!("4H指标: {}", h4.describe()));
    sections.push(format!("允许动作: {}", allowed_actions(state).join("/")));
    sections.join("\n")
}

fn join_notes(notes: Vec<String>) -> Option<String> {
    if notes.is_empty() {
        None
    } else {
        Some(notes.join("; "))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    status: &StrategyStatusEntity,
    now: i64,
    action: OracleAction,
    price_levels: &str,
    indicator_values: &str,
    oracle_prompt: &str,
    oracle_response: &str,
    execution_success: bool,
    execution_error: Option<String>,
) -> DecisionRecordEntity {
    DecisionRecordEntity {
        id: None,
        trader_id: status.trader_id.clone(),
        strategy_id: status.strategy_id.clone(),
        decision_time: now,
        action: action.as_str().to_string(),
        symbol: status.symbol.clone(),
        price_levels: price_levels.to_string(),
        indicator_values: indicator_values.to_string(),
        oracle_prompt: oracle_prompt.to_string(),
        oracle_response: oracle_response.to_string(),
        execution_success: if execution_success { 1 } else { 0 },
        execution_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::gateway::paper::{GatewayCall, PaperGateway};
    use crate::trading::signal::poller::signal_fingerprint;
    use crate::trading::signal::store::MemorySignalStore;
    use crate::trading::strategy::oracle::{OracleVerdict, ScriptedOracle};
    use crate::trading::strategy::store::{MemoryDecisionStore, MemoryStrategyStore};
    use crate::{CandleItem, CandleItemBuilder};

    const H1_MS: i64 = 3_600_000;

    struct Harness {
        engine: StrategyEngine,
        arena: Arc<CandleArena>,
        strategies: Arc<MemoryStrategyStore>,
        decisions: Arc<MemoryDecisionStore>,
        signals: Arc<MemorySignalStore>,
        oracle: Arc<ScriptedOracle>,
        gateway: Arc<PaperGateway>,
        ctx: TraderContext,
    }

    fn harness() -> Harness {
        let arena = Arc::new(CandleArena::new(200, false));
        let strategies = Arc::new(MemoryStrategyStore::new());
        let decisions = Arc::new(MemoryDecisionStore::new());
        let signals = Arc::new(MemorySignalStore::new());
        let oracle = Arc::new(ScriptedOracle::new());
        let engine = StrategyEngine::new(
            arena.clone(),
            strategies.clone(),
            decisions.clone(),
            signals.clone(),
            oracle.clone(),
        );
        let gateway = Arc::new(PaperGateway::new());
        let ctx = TraderContext {
            trader_id: "t1".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            leverage: 10,
            is_cross: true,
            order_notional: 100.0,
            custom_prompt: None,
        };
        Harness {
            engine,
            arena,
            strategies,
            decisions,
            signals,
            oracle,
            gateway,
            ctx,
        }
    }

    fn candle(ts: i64, close: f64) -> CandleItem {
        CandleItemBuilder::new()
            .ts(ts)
            .o(close)
            .h(close + 5.0)
            .l(close - 5.0)
            .c(close)
            .v(10.0)
            .build()
            .unwrap()
    }

    /// 200根逐步上行的K线,价格站上所有EMA,做多硬条件满足
    fn fill_uptrend(arena: &CandleArena, symbol: &str) {
        for period in ["1H", "4H"] {
            for i in 0..200i64 {
                arena.upsert(symbol, period, candle(i * H1_MS, 50_000.0 + i as f64 * 60.0));
            }
        }
    }

    /// 下行序列,收盘价在通道下方,做多硬条件不满足
    fn fill_downtrend(arena: &CandleArena, symbol: &str) {
        for period in ["1H", "4H"] {
            for i in 0..200i64 {
                arena.upsert(symbol, period, candle(i * H1_MS, 80_000.0 - i as f64 * 60.0));
            }
        }
    }

    async fn seed_signal(h: &Harness, direction: &str, body: &str) -> String {
        let received = time_util::now_ms() - 60_000;
        let intent =
            crate::trading::signal::parser::parse_signal_text(body).unwrap();
        let signal_id = signal_fingerprint(body, received);
        let entity = ParsedSignalEntity {
            id: None,
            signal_id: signal_id.clone(),
            symbol: intent.symbol.clone(),
            direction: direction.to_string(),
            received_at: received,
            content_json: serde_json::to_string(&intent).unwrap(),
            raw_content: body.to_string(),
        };
        h.signals.insert_once(&entity).await.unwrap();
        signal_id
    }

    #[tokio::test]
    async fn test_signal_to_entry_full_path() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000 止损 58000").await;
        h.oracle.push_action(OracleAction::Open);

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "open");
        assert_eq!(records[0].execution_success, 1);
        assert!(records[0].oracle_prompt.contains("1H指标"));

        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "ENTRY");
        assert_eq!(status.entry_price, 62_000.0);
        // 100 USDT保证金 x 10倍 / 62000 ≈ 0.0161,截断到3位小数
        assert!((status.quantity - 0.016).abs() < 1e-9);

        let calls = h.gateway.calls();
        assert!(calls.contains(&GatewayCall::SetMarginMode {
            symbol: "BTCUSDT".to_string(),
            is_cross: true
        }));
        assert!(calls.contains(&GatewayCall::SetLeverage {
            symbol: "BTCUSDT".to_string(),
            leverage: 10
        }));
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::OpenLong { symbol, leverage: 10, .. } if symbol == "BTCUSDT"
        )));
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::SetStopLoss { price, .. } if *price == 58_000.0
        )));
        assert_eq!(h.decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_hard_filter_blocks_entry_without_oracle() {
        let h = harness();
        fill_downtrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;
        h.oracle.push_action(OracleAction::Open);

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "wait");
        assert_eq!(records[0].execution_success, 1);
        // 硬条件不满足,连决策服务都不该被问到
        assert_eq!(h.oracle.call_count(), 0);
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_oracle_failure_degrades_to_wait() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;
        h.oracle
            .push_failure(AppError::Oracle("请求超时".to_string()));

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "wait");
        assert_eq!(records[0].execution_success, 0);
        assert!(records[0]
            .execution_error
            .as_deref()
            .unwrap()
            .contains("请求超时"));
        // 状态原地不动
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "WAITING");
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_open_downgrades_to_wait() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;
        h.oracle.push(OracleVerdict {
            action: OracleAction::Open,
            confidence: 0.1,
            reason: "勉强可以试试".to_string(),
        });

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "wait");
        // 裁决本身是成功的,流水里留着原始应答
        assert_eq!(records[0].execution_success, 1);
        assert!(records[0].oracle_response.contains("0.1"));
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "WAITING");
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_order_keeps_state_and_raw_error() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;
        h.oracle.push_action(OracleAction::Open);
        h.gateway.fail_next_order(AppError::ExchangeApi {
            code: "51008".to_string(),
            msg: "Insufficient balance".to_string(),
        });

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records[0].action, "open");
        assert_eq!(records[0].execution_success, 0);
        // 交易所原文要原样落库
        assert_eq!(
            records[0].execution_error.as_deref().unwrap(),
            "[51008] Insufficient balance"
        );
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "WAITING");
    }

    #[tokio::test]
    async fn test_add_advances_one_level() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000 止损 58000").await;

        h.oracle.push_action(OracleAction::Open);
        h.engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        h.oracle.push_action(OracleAction::Add);
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records[0].action, "add");
        assert_eq!(records[0].execution_success, 1);
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "ADD_1");
        assert!((status.quantity - 0.032).abs() < 1e-9);
        // 止损按总量重挂
        let calls = h.gateway.calls();
        assert!(calls.contains(&GatewayCall::CancelStopLoss {
            symbol: "BTCUSDT".to_string()
        }));
    }

    #[tokio::test]
    async fn test_add_exhausted_treated_as_wait() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;

        for action in [OracleAction::Open, OracleAction::Add, OracleAction::Add] {
            h.oracle.push_action(action);
            h.engine
                .evaluate_trader(&h.ctx, h.gateway.clone())
                .await
                .unwrap();
        }
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "ADD_2");

        // 加仓额度用完,再来的add裁决按wait落地
        h.oracle.push_action(OracleAction::Add);
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(records[0].action, "wait");
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "ADD_2");
    }

    #[tokio::test]
    async fn test_close_cancels_orders_then_market_closes() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;

        h.oracle.push_action(OracleAction::Open);
        h.engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        h.gateway.set_mark_price("BTCUSDT", 65_000.0);
        h.oracle.push_action(OracleAction::Close);
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records[0].action, "close");
        assert_eq!(records[0].execution_success, 1);
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "CLOSED");
        assert_eq!(status.quantity, 0.0);
        // 浮盈按平仓时快照入账: (65000-62000) * 0.016
        assert!((status.realized_pnl - 48.0).abs() < 1e-6);

        let calls = h.gateway.calls();
        let cancel_idx = calls
            .iter()
            .position(|c| matches!(c, GatewayCall::CancelAll { .. }))
            .unwrap();
        let close_idx = calls
            .iter()
            .position(|c| matches!(c, GatewayCall::CloseLong { qty: None, .. }))
            .unwrap();
        assert!(cancel_idx < close_idx);
    }

    #[tokio::test]
    async fn test_manual_close_detected_and_sticky() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        let signal_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;

        h.oracle.push_action(OracleAction::Open);
        h.engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        // 人在交易所手动平掉了仓位
        h.gateway.remove_position("BTCUSDT", PositionSide::Long);
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(records[0].action, "close");
        assert_eq!(records[0].execution_success, 1);
        let status = h.strategies.get("t1", &signal_id).await.unwrap().unwrap();
        assert_eq!(status.state, "CLOSED");
        // 判定手动平仓时不准再下任何单
        assert!(!h
            .gateway
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::CloseLong { .. })));

        // 关闭后策略彻底离开评估队列
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_adoption_consumes_signal_once() {
        let h = harness();
        fill_downtrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;

        let first = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // 第二轮同一个信号不再重复采纳,但策略还在队列里(WAITING)
        let second = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(h.decisions.len(), 2);
    }

    #[tokio::test]
    async fn test_symbol_outside_allowlist_ignored() {
        let h = harness();
        fill_uptrend(&h.arena, "ETHUSDT");
        seed_signal(&h, "long", "做多 ETHUSDT 入场 3200").await;

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(h.decisions.len(), 0);
    }

    #[tokio::test]
    async fn test_active_strategy_evaluated_before_new_signal() {
        let h = harness();
        let mut ctx = h.ctx.clone();
        ctx.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        fill_uptrend(&h.arena, "BTCUSDT");
        fill_uptrend(&h.arena, "ETHUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        h.gateway.set_mark_price("ETHUSDT", 3_200.0);

        // 先造一个已入場的老策略
        let old_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 61000").await;
        h.oracle.push_action(OracleAction::Open);
        h.engine.evaluate_trader(&ctx, h.gateway.clone()).await.unwrap();

        // 别的交易对来了新信号,一轮里老策略要排在新信号前面
        let new_id = seed_signal(&h, "long", "做多 ETHUSDT 入场 3200").await;
        h.oracle.push_action(OracleAction::Wait);
        h.oracle.push_action(OracleAction::Wait);
        let records = h
            .engine
            .evaluate_trader(&ctx, h.gateway.clone())
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].strategy_id, old_id);
        assert_eq!(records[1].strategy_id, new_id);
    }

    /// 同一交易对的新信号在老策略还在管的时候不接手,等老的关掉再说
    #[tokio::test]
    async fn test_same_symbol_signal_deferred_while_active() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);

        let old_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 61000").await;
        h.oracle.push_action(OracleAction::Open);
        h.engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();

        // 老策略持仓中,同交易对的新信号整轮按兵不动
        let new_id = seed_signal(&h, "long", "做多 BTCUSDT 入场 63000 止损 60000").await;
        h.oracle.push_action(OracleAction::Close);
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(records.len(), 1, "新信号不该在老策略在管时被接手");
        assert_eq!(records[0].strategy_id, old_id);
        assert_eq!(records[0].action, "close");
        assert!(
            h.strategies.get("t1", &new_id).await.unwrap().is_none(),
            "被顺延的信号不算消费"
        );

        // 老的关掉之后,下一轮新信号正常接手
        h.oracle.push_action(OracleAction::Wait);
        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].strategy_id, new_id);
        let adopted = h.strategies.get("t1", &new_id).await.unwrap().unwrap();
        assert_eq!(adopted.state, "WAITING");
    }

    #[tokio::test]
    async fn test_missing_candles_noop_wait() {
        let h = harness();
        // 不喂任何K线
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;

        let records = h
            .engine
            .evaluate_trader(&h.ctx, h.gateway.clone())
            .await
            .unwrap();
        assert_eq!(records[0].action, "wait");
        assert_eq!(records[0].execution_success, 1);
        assert_eq!(h.oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_prompt_overrides_preamble() {
        let h = harness();
        fill_uptrend(&h.arena, "BTCUSDT");
        h.gateway.set_mark_price("BTCUSDT", 62_000.0);
        seed_signal(&h, "long", "做多 BTCUSDT 入场 62000").await;
        let mut ctx = h.ctx.clone();
        ctx.custom_prompt = Some("只做超短线,持仓不过夜".to_string());
        h.oracle.push_action(OracleAction::Wait);

        h.engine
            .evaluate_trader(&ctx, h.gateway.clone())
            .await
            .unwrap();

        let prompts = h.oracle.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("只做超短线"));
        assert!(prompts[0].contains("允许动作: wait/open/close"));
    }
}
