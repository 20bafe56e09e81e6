use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AppError;
use crate::trading::model::decision_record::{DecisionRecordEntity, DecisionRecordModel};
use crate::trading::model::strategy_status::{StrategyStatusEntity, StrategyStatusModel};

/// 策略状态的存取抽象,引擎只认这个口子,落库还是内存由装配决定
#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn get(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<Option<StrategyStatusEntity>, AppError>;
    /// 该交易员所有未关闭的策略
    async fn active_for_trader(
        &self,
        trader_id: &str,
    ) -> Result<Vec<StrategyStatusEntity>, AppError>;
    /// 该交易员全部策略(含CLOSED),新鲜的在前,报表层的查询口
    async fn list_for_trader(
        &self,
        trader_id: &str,
    ) -> Result<Vec<StrategyStatusEntity>, AppError>;
    async fn upsert(&self, status: &StrategyStatusEntity) -> Result<(), AppError>;
}

/// 决策流水只进不改,每轮评估固定追加一条
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn append(&self, record: &DecisionRecordEntity) -> Result<(), AppError>;
    /// 该交易员最近limit条流水,新鲜的在前,报表层的查询口
    async fn recent_for_trader(
        &self,
        trader_id: &str,
        limit: i64,
    ) -> Result<Vec<DecisionRecordEntity>, AppError>;
}

pub struct DbStrategyStore {
    model: StrategyStatusModel,
}

impl DbStrategyStore {
    pub async fn new() -> Self {
        Self {
            model: StrategyStatusModel::new().await,
        }
    }
}

#[async_trait]
impl StrategyStore for DbStrategyStore {
    async fn get(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<Option<StrategyStatusEntity>, AppError> {
        self.model
            .get(trader_id, strategy_id)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }

    async fn active_for_trader(
        &self,
        trader_id: &str,
    ) -> Result<Vec<StrategyStatusEntity>, AppError> {
        self.model
            .active_for_trader(trader_id)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }

    async fn list_for_trader(
        &self,
        trader_id: &str,
    ) -> Result<Vec<StrategyStatusEntity>, AppError> {
        self.model
            .list_by_trader(trader_id)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }

    async fn upsert(&self, status: &StrategyStatusEntity) -> Result<(), AppError> {
        self.model
            .upsert(status)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }
}

pub struct DbDecisionStore {
    model: DecisionRecordModel,
}

impl DbDecisionStore {
    pub async fn new() -> Self {
        Self {
            model: DecisionRecordModel::new().await,
        }
    }
}

#[async_trait]
impl DecisionStore for DbDecisionStore {
    async fn append(&self, record: &DecisionRecordEntity) -> Result<(), AppError> {
        self.model
            .append(record)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }

    async fn recent_for_trader(
        &self,
        trader_id: &str,
        limit: i64,
    ) -> Result<Vec<DecisionRecordEntity>, AppError> {
        self.model
            .recent_by_trader(trader_id, limit)
            .await
            .map_err(|e| AppError::DbError(e.to_string()))
    }
}

/// 内存实现,测试用
#[derive(Default)]
pub struct MemoryStrategyStore {
    rows: DashMap<String, StrategyStatusEntity>,
}

impl MemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(trader_id: &str, strategy_id: &str) -> String {
        format!("{}:{}", trader_id, strategy_id)
    }
}

#[async_trait]
impl StrategyStore for MemoryStrategyStore {
    async fn get(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> Result<Option<StrategyStatusEntity>, AppError> {
        Ok(self
            .rows
            .get(&Self::key(trader_id, strategy_id))
            .map(|r| r.clone()))
    }

    async fn active_for_trader(
        &self,
        trader_id: &str,
    ) -> Result<Vec<StrategyStatusEntity>, AppError> {
        let prefix = format!("{}:", trader_id);
        let mut rows: Vec<StrategyStatusEntity> = self
            .rows
            .iter()
            .filter(|r| r.key().starts_with(&prefix) && r.state != "CLOSED")
            .map(|r| r.clone())
            .collect();
        rows.sort_by_key(|r| r.updated_at);
        Ok(rows)
    }

    async fn list_for_trader(
        &self,
        trader_id: &str,
    ) -> Result<Vec<StrategyStatusEntity>, AppError> {
        let prefix = format!("{}:", trader_id);
        let mut rows: Vec<StrategyStatusEntity> = self
            .rows
            .iter()
            .filter(|r| r.key().starts_with(&prefix))
            .map(|r| r.clone())
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.updated_at));
        Ok(rows)
    }

    async fn upsert(&self, status: &StrategyStatusEntity) -> Result<(), AppError> {
        self.rows.insert(
            Self::key(&status.trader_id, &status.strategy_id),
            status.clone(),
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDecisionStore {
    records: Mutex<Vec<DecisionRecordEntity>>,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecisionRecordEntity> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DecisionStore for MemoryDecisionStore {
    async fn append(&self, record: &DecisionRecordEntity) -> Result<(), AppError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn recent_for_trader(
        &self,
        trader_id: &str,
        limit: i64,
    ) -> Result<Vec<DecisionRecordEntity>, AppError> {
        let mut rows: Vec<DecisionRecordEntity> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.trader_id == trader_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.decision_time));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
