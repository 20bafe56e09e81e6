use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_cron_scheduler::Job;
use tracing::{error, info};

use crate::trading::gateway::TradingGateway;
use crate::trading::strategy::engine::{StrategyEngine, TraderContext};

const MIN_SCAN_INTERVAL_SECS: u64 = 5;

/// 单个trader的周期评估任务
///
/// 新信号到达时bootstrap会额外触发一次run_once,
/// 引擎内的评估锁保证同一策略不会被并发评估两遍
pub struct TraderEvalJob {
    engine: Arc<StrategyEngine>,
    ctx: TraderContext,
    gateway: Arc<dyn TradingGateway>,
    interval: Duration,
}

impl TraderEvalJob {
    pub fn new(
        engine: Arc<StrategyEngine>,
        ctx: TraderContext,
        gateway: Arc<dyn TradingGateway>,
        scan_interval_secs: i64,
    ) -> Self {
        let secs = (scan_interval_secs.max(0) as u64).max(MIN_SCAN_INTERVAL_SECS);
        Self {
            engine,
            ctx,
            gateway,
            interval: Duration::from_secs(secs),
        }
    }

    pub fn trader_id(&self) -> &str {
        &self.ctx.trader_id
    }

    pub async fn run_once(&self) {
        match self
            .engine
            .evaluate_trader(&self.ctx, Arc::clone(&self.gateway))
            .await
        {
            Ok(records) => {
                let executed = records
                    .iter()
                    .filter(|r| r.execution_success == 1 && r.action != "wait")
                    .count();
                if executed > 0 {
                    info!(
                        "trader {} 本轮产出 {} 条决策,其中 {} 条已执行",
                        self.ctx.trader_id,
                        records.len(),
                        executed
                    );
                }
            }
            Err(e) => error!("trader {} 评估失败: {}", self.ctx.trader_id, e),
        }
    }

    pub fn create_job(self: &Arc<Self>) -> Result<Job> {
        let this = Arc::clone(self);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.run_once().await;
            })
        })?;
        Ok(job)
    }
}
