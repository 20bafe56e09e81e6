use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_cron_scheduler::Job;
use tracing::{error, info};

use crate::app_config::env::env_u64;
use crate::trading::signal::poller::SignalPoller;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const MIN_POLL_INTERVAL_SECS: u64 = 10;

/// 邮箱轮询定时任务,按固定间隔驱动一轮信号抓取
pub struct SignalPollJob {
    poller: Arc<SignalPoller>,
    interval: Duration,
}

impl SignalPollJob {
    pub fn new(poller: Arc<SignalPoller>) -> Self {
        let secs = env_u64("SIGNAL_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)
            .max(MIN_POLL_INTERVAL_SECS);
        Self {
            poller,
            interval: Duration::from_secs(secs),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 跑一轮,错误只记日志,下一轮照常触发
    pub async fn run_once(&self) {
        match self.poller.run_cycle().await {
            Ok(stats) => {
                if stats.scanned > 0 || stats.deferred > 0 {
                    info!(
                        "信号轮询: 候选{} 入库{} 重复{} 拒绝{} 顺延{}",
                        stats.scanned,
                        stats.emitted,
                        stats.duplicates,
                        stats.rejected,
                        stats.deferred
                    );
                }
            }
            Err(e) => error!("信号轮询失败: {}", e),
        }
    }

    /// 组装给调度器的重复任务
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
