use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::cursor::{CursorStore, FIRST_LOOKBACK_MS};
use super::mailbox::{MailEnvelope, MailTransport};
use super::parser;
use super::security::SecurityGate;
use super::store::SignalStore;
use crate::error::AppError;
use crate::time_util;
use crate::trading::model::parsed_signal::ParsedSignalEntity;

pub const DEFAULT_BATCH_LIMIT: usize = 50;
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 一轮轮询的统计,打日志和测试断言用
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    /// 信封粗筛后的候选数
    pub scanned: usize,
    /// 新入库并发往下游的信号数
    pub emitted: usize,
    /// 指纹重复被吸收的
    pub duplicates: usize,
    /// 鉴权或解析不过、静默丢弃的
    pub rejected: usize,
    /// 瞬时故障、留待下轮重试的
    pub deferred: usize,
}

/// 信号邮箱轮询器。每轮:装游标 -> 拉信封 -> 粗筛 -> 逐封
/// 拉正文、鉴权、解析、落库去重 -> 发往有界通道 -> 最后才标记已处理。
/// 游标只在整轮成功后推进,有瞬时失败的邮件会把游标按住不动。
pub struct SignalPoller {
    transport: Arc<dyn MailTransport>,
    gate: SecurityGate,
    cursor: Arc<dyn CursorStore>,
    signals: Arc<dyn SignalStore>,
    tx: mpsc::Sender<ParsedSignalEntity>,
    /// 邮箱账号,游标按它区分
    account: String,
    cycle_timeout: Duration,
    batch_limit: usize,
}

impl SignalPoller {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        gate: SecurityGate,
        cursor: Arc<dyn CursorStore>,
        signals: Arc<dyn SignalStore>,
        tx: mpsc::Sender<ParsedSignalEntity>,
        account: &str,
    ) -> Self {
        Self {
            transport,
            gate,
            cursor,
            signals,
            tx,
            account: account.to_string(),
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// 跑一轮,整轮有硬超时,超时按失败处理、游标不动
    pub async fn run_cycle(&self) -> Result<CycleStats, AppError> {
        match tokio::time::timeout(self.cycle_timeout, self.cycle_inner()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Mail(format!(
                "轮询超过 {:?} 未完成,放弃本轮",
                self.cycle_timeout
            ))),
        }
    }

    async fn cycle_inner(&self) -> Result<CycleStats, AppError> {
        let cycle_start = time_util::now_ms();
        let since = match self.cursor.load(&self.account).await? {
            Some(ms) => ms,
            None => cycle_start - FIRST_LOOKBACK_MS,
        };

        let envelopes = self.transport.fetch_envelopes(since).await?;
        // SINCE 是天级的,这里按毫秒再筛一遍,然后过信封粗筛
        let mut candidates: Vec<MailEnvelope> = envelopes
            .into_iter()
            .filter(|e| e.received_ms >= since)
            .filter(|e| self.gate.envelope_allows(e))
            .collect();
        candidates.sort_by_key(|e| e.received_ms);
        candidates.truncate(self.batch_limit);

        let mut stats = CycleStats {
            scanned: candidates.len(),
            ..CycleStats::default()
        };
        // 有邮件没处理完时,游标退到它那里,保证下轮还能扫到
        let mut earliest_retry: Option<i64> = None;

        for envelope in candidates {
            let fingerprint = signal_fingerprint(&envelope.subject, envelope.received_ms);
            if self.signals.get(&fingerprint).await?.is_some() {
                stats.duplicates += 1;
                self.mark_best_effort(envelope.uid).await;
                continue;
            }

            let body = match self.transport.fetch_body(envelope.uid).await {
                Ok(b) => b,
                Err(e) => {
                    // 不标记已处理,留给下一轮
                    warn!("邮件 {} 正文拉取失败,下轮重试: {}", envelope.uid, e);
                    stats.deferred += 1;
                    earliest_retry = Some(
                        earliest_retry
                            .map_or(envelope.received_ms, |v| v.min(envelope.received_ms)),
                    );
                    continue;
                }
            };

            if !self.gate.authorize(&envelope, &body) {
                // 静默丢弃,但要标记,免得每轮重扫
                stats.rejected += 1;
                self.mark_best_effort(envelope.uid).await;
                continue;
            }

            let intent = match parser::parse_signal(&envelope.subject, &body) {
                Ok(i) => i,
                Err(e) => {
                    warn!("邮件 {} 不是有效信号: {}", envelope.uid, e);
                    stats.rejected += 1;
                    self.mark_best_effort(envelope.uid).await;
                    continue;
                }
            };

            let entity = ParsedSignalEntity {
                id: None,
                signal_id: fingerprint.clone(),
                symbol: intent.symbol.clone(),
                direction: intent.direction.as_str().to_string(),
                received_at: envelope.received_ms,
                content_json: serde_json::to_string(&intent)?,
                raw_content: body,
            };

            if !self.signals.insert_once(&entity).await? {
                stats.duplicates += 1;
                self.mark_best_effort(envelope.uid).await;
                continue;
            }

            // 通道满了只告警:信号已落库,评估侧扫库也能捡到
            if let Err(e) = self.tx.try_send(entity) {
                warn!("信号通道投递失败(已落库): {}", e);
            }
            stats.emitted += 1;

            // 标记放在最后:之前任何一步失败,这封下轮还会被扫到,
            // 由指纹去重兜底,不会重复下发
            self.mark_best_effort(envelope.uid).await;
        }

        let next_cursor = earliest_retry.unwrap_or(cycle_start);
        self.cursor.save(&self.account, next_cursor).await?;
        info!(
            "信号轮询完成: 候选{} 新发{} 重复{} 丢弃{} 待重试{}",
            stats.scanned, stats.emitted, stats.duplicates, stats.rejected, stats.deferred
        );
        Ok(stats)
    }

    async fn mark_best_effort(&self, uid: u32) {
        if let Err(e) = self.transport.mark_processed(uid).await {
            // 标记失败可以容忍,重复拉取由指纹去重吸收
            warn!("邮件 {} 标记已处理失败: {}", uid, e);
        }
    }
}

/// 去重指纹:主题 + 收件毫秒时间戳,哈希成定长串方便建唯一索引
pub fn signal_fingerprint(subject: &str, received_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(b"|");
    hasher.update(received_ms.to_be_bytes());
    hex::encode(hasher.finalize())
}
