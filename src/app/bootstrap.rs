use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info, warn};

use crate::app_config::env::{env_is_true, env_or_default};
use crate::job::{SignalPollJob, TraderEvalJob};
use crate::socket::MarketStream;
use crate::trading::gateway::paper::PaperGateway;
use crate::trading::gateway::{build_gateway, TradingGateway};
use crate::trading::market::backfill::CandleBackfill;
use crate::trading::market::candle_cache::{default_arena, CandleArena};
use crate::trading::market::candle_window::DEFAULT_WINDOW_CAPACITY;
use crate::trading::model::parsed_signal::ParsedSignalEntity;
use crate::trading::model::trader_config::{TraderConfigEntity, TraderConfigModel};
use crate::trading::signal::cursor::RedisCursorStore;
use crate::trading::signal::mailbox::ImapMailbox;
use crate::trading::signal::poller::SignalPoller;
use crate::trading::signal::security::SecurityGate;
use crate::trading::signal::store::DbSignalStore;
use crate::trading::strategy::engine::{StrategyEngine, TraderContext};
use crate::trading::strategy::oracle::HttpOracle;
use crate::trading::strategy::store::{DbDecisionStore, DbStrategyStore};

/// 策略评估用的两个周期,入场过滤要1H和4H同向
const SUBSCRIBED_PERIODS: [&str; 2] = ["1H", "4H"];
const SIGNAL_CHANNEL_CAPACITY: usize = 64;
/// 模拟盘标记价从窗口同步的间隔
const PAPER_MARK_SYNC_SECS: u64 = 30;

/// 应用入口总编排。四个环节各有开关(环境变量控制):
/// 历史回填 / 行情长连接 / 信号轮询 / 实盘评估,
/// 全部拉起后托管心跳与优雅关闭。
pub async fn run() -> Result<()> {
    let sync_data = env_is_true("IS_RUN_SYNC_DATA_JOB", false);
    let open_socket = env_is_true("IS_OPEN_SOCKET", false);
    let poll_signals = env_is_true("IS_POLL_SIGNALS", false);
    let run_strategy = env_is_true("IS_RUN_REAL_STRATEGY", false);

    let traders = load_traders().await?;
    if traders.is_empty() {
        warn!("没有启用中的trader");
    }

    let arena = default_arena();
    let symbols = collect_symbols(&traders);

    // 先回填历史,169周期EMA要有足够的种子数据
    if sync_data {
        warm_windows(&arena, &symbols).await;
    }

    let market_handle = if open_socket {
        Some(tokio::spawn(
            MarketStream::new(
                Arc::clone(&arena),
                symbols.clone(),
                SUBSCRIBED_PERIODS.iter().map(|p| p.to_string()).collect(),
            )
            .run(),
        ))
    } else {
        None
    };

    let mut scheduler = JobScheduler::new().await?;
    let mut job_count = 0usize;

    let mut signal_rx: Option<mpsc::Receiver<ParsedSignalEntity>> = None;
    if poll_signals {
        let (tx, rx) = mpsc::channel::<ParsedSignalEntity>(SIGNAL_CHANNEL_CAPACITY);
        signal_rx = Some(rx);
        let poll_job = Arc::new(SignalPollJob::new(build_poller(tx).await?));
        scheduler.add(poll_job.create_job()?).await?;
        job_count += 1;
        info!("信号轮询任务就绪,间隔{:?}", poll_job.interval());
    }

    let mut eval_jobs: Vec<Arc<TraderEvalJob>> = Vec::new();
    if run_strategy {
        let engine = Arc::new(StrategyEngine::new(
            Arc::clone(&arena),
            Arc::new(DbStrategyStore::new().await),
            Arc::new(DbDecisionStore::new().await),
            Arc::new(DbSignalStore::new().await),
            Arc::new(HttpOracle::from_env()?),
        ));

        let paper_mode = env_is_true("PAPER_TRADING", false);
        if paper_mode {
            warn!("PAPER_TRADING=true,全部trader走模拟通道,不会触碰真实交易所");
        }
        for cfg in &traders {
            match build_trader_job(&engine, cfg, paper_mode, &arena) {
                Ok(job) => {
                    let job = Arc::new(job);
                    scheduler.add(job.create_job()?).await?;
                    job_count += 1;
                    eval_jobs.push(job);
                }
                Err(e) => error!("trader {} 初始化失败,本次跳过: {}", cfg.trader_id, e),
            }
        }
    }

    scheduler.start().await?;
    info!("调度器就绪,共 {} 个周期任务", job_count);

    // 新信号入库后马上补一轮评估,不等下个评估周期
    let wake_handle = signal_rx.map(|rx| tokio::spawn(wake_on_signal(rx, eval_jobs.clone())));

    let trader_count = eval_jobs.len();
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            info!("程序运行中, {} 个trader评估任务在岗", trader_count);
        }
    });

    let signal_name = setup_shutdown_signals().await;
    info!("接收到 {} 信号,开始优雅关闭", signal_name);

    heartbeat_handle.abort();
    if let Some(h) = wake_handle {
        h.abort();
    }
    if let Some(h) = market_handle {
        h.abort();
    }

    match tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown()).await {
        Ok(Ok(_)) => info!("调度器已停止"),
        Ok(Err(e)) => error!("调度器关闭失败: {}", e),
        Err(_) => error!("调度器关闭超时(5秒)"),
    }

    info!("应用已优雅退出");
    Ok(())
}

async fn load_traders() -> Result<Vec<TraderConfigEntity>> {
    let traders = TraderConfigModel::new()
        .await
        .list_enabled()
        .await
        .map_err(|e| anyhow!("加载trader配置失败: {}", e))?;
    info!("启用中的trader数量: {}", traders.len());
    Ok(traders)
}

/// 全部trader订阅交易对的并集,行情流与预热共用
fn collect_symbols(traders: &[TraderConfigEntity]) -> Vec<String> {
    let mut symbols: Vec<String> = traders.iter().flat_map(|t| t.symbol_list()).collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// 回填失败只降级:窗口不满时入场过滤自然放弃该symbol,等行情流慢慢补
async fn warm_windows(arena: &Arc<CandleArena>, symbols: &[String]) {
    let backfill = match CandleBackfill::new() {
        Ok(b) => b,
        Err(e) => {
            error!("初始化K线回填失败,跳过预热: {}", e);
            return;
        }
    };
    for symbol in symbols {
        for period in SUBSCRIBED_PERIODS {
            match backfill
                .backfill_window(arena, symbol, period, DEFAULT_WINDOW_CAPACITY)
                .await
            {
                Ok(n) => info!("{} {} 预热完成,窗口{}根", symbol, period, n),
                Err(e) => error!("{} {} 预热失败: {}", symbol, period, e),
            }
        }
    }
}

async fn build_poller(tx: mpsc::Sender<ParsedSignalEntity>) -> Result<Arc<SignalPoller>> {
    let mailbox = ImapMailbox::from_env()?;
    let account = env_or_default("IMAP_USERNAME", "");
    let poller = SignalPoller::new(
        Arc::new(mailbox),
        SecurityGate::from_env(),
        Arc::new(RedisCursorStore),
        Arc::new(DbSignalStore::new().await),
        tx,
        &account,
    );
    Ok(Arc::new(poller))
}

fn build_trader_job(
    engine: &Arc<StrategyEngine>,
    cfg: &TraderConfigEntity,
    paper_mode: bool,
    arena: &Arc<CandleArena>,
) -> Result<TraderEvalJob> {
    let gateway: Arc<dyn TradingGateway> = if paper_mode {
        let paper = Arc::new(PaperGateway::new());
        spawn_paper_mark_sync(Arc::clone(&paper), Arc::clone(arena), cfg.symbol_list());
        paper
    } else {
        build_gateway(cfg.credential()?)?
    };
    let ctx = TraderContext::from_config(cfg);
    spawn_push_defaults(Arc::clone(&gateway), ctx.clone());
    Ok(TraderEvalJob::new(
        Arc::clone(engine),
        ctx,
        gateway,
        cfg.scan_interval_secs,
    ))
}

/// 启动时把杠杆和保证金模式推到交易所,失败只告警,
/// 开仓前引擎还会再对齐一次
fn spawn_push_defaults(gateway: Arc<dyn TradingGateway>, ctx: TraderContext) {
    tokio::spawn(async move {
        for symbol in &ctx.symbols {
            if let Err(e) = gateway.set_margin_mode(symbol, ctx.is_cross).await {
                warn!("trader {} {} 保证金模式预设失败: {}", ctx.trader_id, symbol, e);
            }
            if let Err(e) = gateway.set_leverage(symbol, ctx.leverage).await {
                warn!("trader {} {} 杠杆预设失败: {}", ctx.trader_id, symbol, e);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
}

/// 模拟盘的标记价跟随最近一根1H收盘,周期性同步
fn spawn_paper_mark_sync(paper: Arc<PaperGateway>, arena: Arc<CandleArena>, symbols: Vec<String>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(PAPER_MARK_SYNC_SECS));
        loop {
            interval.tick().await;
            for symbol in &symbols {
                if let Some(candle) = arena.latest(symbol, "1H") {
                    paper.set_mark_price(symbol, candle.c());
                }
            }
        }
    });
}

async fn wake_on_signal(
    mut rx: mpsc::Receiver<ParsedSignalEntity>,
    jobs: Vec<Arc<TraderEvalJob>>,
) {
    while let Some(signal) = rx.recv().await {
        info!(
            "新信号到达: {} {},立即补一轮评估",
            signal.symbol, signal.direction
        );
        for job in &jobs {
            job.run_once().await;
        }
    }
}

/// 设置多种退出信号处理
async fn setup_shutdown_signals() -> &'static str {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");
        let mut sigquit = signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("Failed to register SIGQUIT handler");

        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sigquit.recv() => "SIGQUIT",
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c");
        "CTRL+C"
    }
}
