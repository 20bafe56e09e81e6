use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, impl_select, impl_update, RBatis};
use serde_json::json;
use tracing::debug;

use crate::app_config::db;

/// 策略状态行,(trader_id, strategy_id)唯一,只由策略引擎的评估循环改写
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StrategyStatusEntity {
    pub id: Option<i64>,
    pub trader_id: String,
    pub strategy_id: String,
    pub symbol: String,
    /// WAITING/ENTRY/ADD_1/ADD_2/CLOSED
    pub state: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub updated_at: i64,
}

crud!(StrategyStatusEntity {}, "strategy_status");
impl_select!(StrategyStatusEntity{select_by_trader_strategy(trader_id:&str,strategy_id:&str) =>
    "`where trader_id=#{trader_id} and strategy_id=#{strategy_id} limit 1`"},"strategy_status");
impl_select!(StrategyStatusEntity{select_active_by_trader(trader_id:&str) =>
    "`where trader_id=#{trader_id} and state != 'CLOSED'`"},"strategy_status");
impl_select!(StrategyStatusEntity{select_by_trader(trader_id:&str) =>
    "`where trader_id=#{trader_id} order by updated_at desc`"},"strategy_status");
impl_update!(StrategyStatusEntity{update_by_trader_strategy(trader_id:&str,strategy_id:&str) =>
    "`where trader_id=#{trader_id} and strategy_id=#{strategy_id}`"},"strategy_status");

pub struct StrategyStatusModel {
    db: &'static RBatis,
}

impl StrategyStatusModel {
    pub async fn new() -> StrategyStatusModel {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn get(
        &self,
        trader_id: &str,
        strategy_id: &str,
    ) -> anyhow::Result<Option<StrategyStatusEntity>> {
        let rows =
            StrategyStatusEntity::select_by_trader_strategy(self.db, trader_id, strategy_id)
                .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn active_for_trader(
        &self,
        trader_id: &str,
    ) -> anyhow::Result<Vec<StrategyStatusEntity>> {
        let rows = StrategyStatusEntity::select_active_by_trader(self.db, trader_id).await?;
        Ok(rows)
    }

    /// 该交易员全部策略(含CLOSED),新鲜的在前,给报表层用
    pub async fn list_by_trader(
        &self,
        trader_id: &str,
    ) -> anyhow::Result<Vec<StrategyStatusEntity>> {
        let rows = StrategyStatusEntity::select_by_trader(self.db, trader_id).await?;
        Ok(rows)
    }

    /// (trader_id, strategy_id)存在则整行覆盖,不存在则插入
    pub async fn upsert(&self, status: &StrategyStatusEntity) -> anyhow::Result<()> {
        let existing = self.get(&status.trader_id, &status.strategy_id).await?;
        if existing.is_some() {
            let data = StrategyStatusEntity::update_by_trader_strategy(
                self.db,
                status,
                &status.trader_id,
                &status.strategy_id,
            )
            .await?;
            debug!("update strategy_status result = {}", json!(data));
        } else {
            let data: ExecResult = StrategyStatusEntity::insert(self.db, status).await?;
            debug!("insert strategy_status result = {}", json!(data));
        }
        Ok(())
    }
}
