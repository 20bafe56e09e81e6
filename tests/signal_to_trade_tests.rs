//! 信号链路端到端测试
//!
//! 从一封原始信号邮件出发,走完 轮询->鉴权->解析->去重->评估->下单 全链路。
//! 交易所用模拟网关,决策服务用预置脚本,不依赖任何外部服务。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use signal_quant::error::AppError;
use signal_quant::time_util;
use signal_quant::trading::gateway::paper::{GatewayCall, PaperGateway};
use signal_quant::trading::market::candle_cache::CandleArena;
use signal_quant::trading::signal::cursor::MemoryCursorStore;
use signal_quant::trading::signal::mailbox::MemoryMailbox;
use signal_quant::trading::signal::poller::SignalPoller;
use signal_quant::trading::signal::security::SecurityGate;
use signal_quant::trading::signal::store::{MemorySignalStore, SignalStore};
use signal_quant::trading::strategy::engine::{StrategyEngine, TraderContext};
use signal_quant::trading::strategy::oracle::{
    DecisionOracle, OracleAction, OracleVerdict, ScriptedOracle,
};
use signal_quant::trading::strategy::state::StrategyState;
use signal_quant::trading::strategy::store::{
    MemoryDecisionStore, MemoryStrategyStore, StrategyStore,
};
use signal_quant::{CandleItem, CandleItemBuilder};

const H1_MS: i64 = 3_600_000;
const TRADER: &str = "trader-e2e";

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

/// 200根逐步上行的K线,两个周期都站上Vegas通道,做多硬条件满足
fn fill_uptrend(arena: &CandleArena, symbol: &str) {
    for period in ["1H", "4H"] {
        for i in 0..200i64 {
            arena.upsert(symbol, period, candle(i * H1_MS, 50_000.0 + i as f64 * 60.0));
        }
    }
}

struct Pipeline {
    mailbox: Arc<MemoryMailbox>,
    poller: SignalPoller,
    rx: mpsc::Receiver<signal_quant::trading::model::parsed_signal::ParsedSignalEntity>,
    signals: Arc<MemorySignalStore>,
    arena: Arc<CandleArena>,
    strategies: Arc<MemoryStrategyStore>,
    decisions: Arc<MemoryDecisionStore>,
    oracle: Arc<ScriptedOracle>,
    gateway: Arc<PaperGateway>,
    engine: StrategyEngine,
    ctx: TraderContext,
}

fn pipeline() -> Pipeline {
    let mailbox = Arc::new(MemoryMailbox::new());
    let signals = Arc::new(MemorySignalStore::new());
    let (tx, rx) = mpsc::channel(8);
    let gate = SecurityGate::new(
        vec!["trader@fund.example".to_string()],
        vec!["做多".to_string(), "做空".to_string()],
        None,
    );
    let poller = SignalPoller::new(
        mailbox.clone(),
        gate,
        Arc::new(MemoryCursorStore::new()),
        signals.clone(),
        tx,
        "inbox-e2e",
    );

    let arena = Arc::new(CandleArena::new(200, false));
    let strategies = Arc::new(MemoryStrategyStore::new());
    let decisions = Arc::new(MemoryDecisionStore::new());
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
        trader_id: TRADER.to_string(),
        symbols: vec!["BTCUSDT".to_string()],
        leverage: 10,
        is_cross: true,
        order_notional: 100.0,
        custom_prompt: None,
    };
    Pipeline {
        mailbox,
        poller,
        rx,
        signals,
        arena,
        strategies,
        decisions,
        oracle,
        gateway,
        engine,
        ctx,
    }
}

/// 一封合法信号邮件最终变成交易所里的一笔多头仓位
#[tokio::test]
async fn test_mail_to_entry_order() {
    let mut p = pipeline();
    fill_uptrend(&p.arena, "BTCUSDT");
    p.gateway.set_mark_price("BTCUSDT", 62_000.0);

    let received = time_util::now_ms() - 60_000;
    p.mailbox.push_mail(
        101,
        "做多 BTCUSDT",
        "trader@fund.example",
        received,
        "做多BTCUSDT 入场62000 止损60500 止盈66000",
    );

    // 轮询:入库一条并发出通知
    let stats = p.poller.run_cycle().await.expect("轮询应该成功");
    assert_eq!(stats.emitted, 1, "应该恰好入库一条信号");
    assert_eq!(stats.rejected, 0);
    let notified = p.rx.try_recv().expect("通道里应该有新信号");
    assert_eq!(notified.symbol, "BTCUSDT");
    assert_eq!(notified.direction, "long");
    assert_eq!(p.mailbox.processed_uids(), vec![101], "邮件应被标记已处理");

    // 评估:预置open裁决,模拟盘成交
    p.oracle.push_action(OracleAction::Open);
    let records = p
        .engine
        .evaluate_trader(&p.ctx, p.gateway.clone())
        .await
        .expect("评估应该成功");
    assert_eq!(records.len(), 1, "一轮评估固定一条决策流水");
    assert_eq!(records[0].action, "open");
    assert_eq!(records[0].execution_success, 1);

    // 状态机推进到ENTRY,仓位与止损止盈都在
    let status = p
        .strategies
        .get(TRADER, &notified.signal_id)
        .await
        .unwrap()
        .expect("策略状态应该存在");
    assert_eq!(status.state, StrategyState::Entry.as_str());
    assert!(status.quantity > 0.0);

    let calls = p.gateway.calls();
    assert!(
        calls.iter().any(|c| matches!(c, GatewayCall::OpenLong { symbol, leverage, .. }
            if symbol == "BTCUSDT" && *leverage == 10)),
        "应该有一笔按配置杠杆的做多开仓: {:?}",
        calls
    );
    assert!(
        calls.iter().any(|c| matches!(c, GatewayCall::SetStopLoss { price, .. } if (*price - 60_500.0).abs() < 1e-9)),
        "止损应按信号价位挂出"
    );
    assert!(
        calls.iter().any(|c| matches!(c, GatewayCall::SetTakeProfit { price, .. } if (*price - 66_000.0).abs() < 1e-9)),
        "止盈应按信号价位挂出"
    );
    assert_eq!(p.decisions.records().len(), 1);
}

/// 正文拉取瞬时失败的邮件顺延,游标回退带来的重扫由指纹去重吸收
#[tokio::test]
async fn test_deferred_mail_retried_and_duplicate_absorbed() {
    let mut p = pipeline();
    let now = time_util::now_ms();
    p.mailbox.push_mail(
        7,
        "做空 ETHUSDT",
        "trader@fund.example",
        now - 120_000,
        "做空ETHUSDT 入场3200 止损3350",
    );
    p.mailbox.push_mail(
        8,
        "做多 BTCUSDT",
        "trader@fund.example",
        now - 60_000,
        "做多BTCUSDT 入场62000",
    );
    // 按时间序,7号先处理且正文拉取这回会失败
    p.mailbox.fail_next_body();

    let first = p.poller.run_cycle().await.unwrap();
    assert_eq!(first.deferred, 1, "故障邮件应顺延到下一轮");
    assert_eq!(first.emitted, 1, "另一封不受影响,正常入库");
    assert_eq!(p.signals.len(), 1);

    // 游标已回退到故障邮件:7号重试成功,8号重扫但被指纹吸收
    let second = p.poller.run_cycle().await.unwrap();
    assert_eq!(second.emitted, 1, "顺延邮件重试后入库");
    assert_eq!(second.duplicates, 1, "已入库那封不重复下发");
    assert_eq!(p.signals.len(), 2);
}

/// 陌生发件人的邮件被静默丢弃,也不会留到下一轮
#[tokio::test]
async fn test_unauthorized_mail_dropped_silently() {
    let mut p = pipeline();
    p.mailbox.push_mail(
        55,
        "做多 BTCUSDT",
        "stranger@phish.example",
        time_util::now_ms() - 30_000,
        "做多BTCUSDT 入场50000",
    );

    let stats = p.poller.run_cycle().await.unwrap();
    assert_eq!(stats.emitted, 0);
    assert!(p.signals.is_empty(), "未授权信号不能入库");
    assert!(p.rx.try_recv().is_err(), "未授权信号不能发往下游");
    assert_eq!(
        p.mailbox.processed_uids(),
        vec![55],
        "被拒邮件同样标记已处理,不再反复扫到"
    );
}

/// 持仓中的策略收到close裁决:撤单、平仓、状态封存
#[tokio::test]
async fn test_close_verdict_flattens_position() {
    let mut p = pipeline();
    fill_uptrend(&p.arena, "BTCUSDT");
    p.gateway.set_mark_price("BTCUSDT", 62_000.0);

    p.mailbox.push_mail(
        31,
        "做多 BTCUSDT",
        "trader@fund.example",
        time_util::now_ms() - 60_000,
        "做多BTCUSDT 入场62000 止损60500",
    );
    p.poller.run_cycle().await.unwrap();
    let signal = p.rx.try_recv().unwrap();

    p.oracle.push_action(OracleAction::Open);
    p.engine
        .evaluate_trader(&p.ctx, p.gateway.clone())
        .await
        .unwrap();

    // 价格走高后裁决离场
    p.gateway.set_mark_price("BTCUSDT", 64_000.0);
    p.oracle.push_action(OracleAction::Close);
    let records = p
        .engine
        .evaluate_trader(&p.ctx, p.gateway.clone())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, "close");
    assert_eq!(records[0].execution_success, 1);

    let status = p
        .strategies
        .get(TRADER, &signal.signal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, StrategyState::Closed.as_str());
    assert!(status.realized_pnl > 0.0, "顺势平仓应有正的已实现盈亏");

    let calls = p.gateway.calls();
    assert!(calls.iter().any(|c| matches!(c, GatewayCall::CancelAll { .. })));
    assert!(calls.iter().any(|c| matches!(c, GatewayCall::CloseLong { .. })));

    // 关闭后的策略不再进入评估队列
    let records = p
        .engine
        .evaluate_trader(&p.ctx, p.gateway.clone())
        .await
        .unwrap();
    assert!(records.is_empty(), "CLOSED策略与已消费信号都不应再评估");
}

/// 放慢响应的决策服务,让评估在持锁状态下真正挂起
struct SlowOracle {
    inner: ScriptedOracle,
    delay: Duration,
}

#[async_trait]
impl DecisionOracle for SlowOracle {
    async fn decide(&self, prompt: &str) -> Result<OracleVerdict, AppError> {
        tokio::time::sleep(self.delay).await;
        self.inner.decide(prompt).await
    }
}

/// 同一策略两路并发评估:持锁的一路下单,撞锁的一路整轮跳过
#[tokio::test]
async fn test_concurrent_cycles_only_one_mutates() {
    let mut p = pipeline();
    fill_uptrend(&p.arena, "BTCUSDT");
    p.gateway.set_mark_price("BTCUSDT", 62_000.0);

    p.mailbox.push_mail(
        41,
        "做多 BTCUSDT",
        "trader@fund.example",
        time_util::now_ms() - 60_000,
        "做多BTCUSDT 入场62000 止损60500 止盈66000",
    );
    p.poller.run_cycle().await.unwrap();
    p.rx.try_recv().unwrap();

    let slow = Arc::new(SlowOracle {
        inner: ScriptedOracle::new(),
        delay: Duration::from_millis(50),
    });
    slow.inner.push_action(OracleAction::Open);
    let engine = StrategyEngine::new(
        p.arena.clone(),
        p.strategies.clone(),
        p.decisions.clone(),
        p.signals.clone(),
        slow.clone(),
    );

    let (a, b) = tokio::join!(
        engine.evaluate_trader(&p.ctx, p.gateway.clone()),
        engine.evaluate_trader(&p.ctx, p.gateway.clone()),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.len() + b.len(), 1, "撞锁的一路不应产出任何流水");
    let record = a.first().or_else(|| b.first()).unwrap();
    assert_eq!(record.action, "open");
    assert_eq!(record.execution_success, 1);

    let opens = p
        .gateway
        .calls()
        .iter()
        .filter(|c| matches!(c, GatewayCall::OpenLong { .. }))
        .count();
    assert_eq!(opens, 1, "并发评估下同一策略只允许一路真正下单");
}
