use rbatis::{crud, impl_select, RBatis};
use serde_json::json;
use tracing::debug;

use crate::app_config::db;

/// 决策审计行,只追加,每个评估周期固定落一条(WAIT也算)
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DecisionRecordEntity {
    pub id: Option<i64>,
    pub trader_id: String,
    pub strategy_id: String,
    pub decision_time: i64,
    /// wait/open/add/close
    pub action: String,
    pub symbol: String,
    /// 入场/加仓/止损等价位,JSON文本
    pub price_levels: String,
    /// 决策时刻的指标快照,JSON文本
    pub indicator_values: String,
    pub oracle_prompt: String,
    pub oracle_response: String,
    pub execution_success: i32,
    pub execution_error: Option<String>,
}

crud!(DecisionRecordEntity {}, "decision_history");
impl_select!(DecisionRecordEntity{select_recent_by_trader(trader_id:&str,limit:i64) =>
    "`where trader_id=#{trader_id} order by decision_time desc limit #{limit}`"},"decision_history");

pub struct DecisionRecordModel {
    db: &'static RBatis,
}

impl DecisionRecordModel {
    pub async fn new() -> DecisionRecordModel {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn append(&self, record: &DecisionRecordEntity) -> anyhow::Result<()> {
        let data = DecisionRecordEntity::insert(self.db, record).await?;
        debug!("insert decision_history result = {}", json!(data));
        Ok(())
    }

    /// 该交易员最近的决策流水,新鲜的在前,给报表层用
    pub async fn recent_by_trader(
        &self,
        trader_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<DecisionRecordEntity>> {
        let rows = DecisionRecordEntity::select_recent_by_trader(self.db, trader_id, limit).await?;
        Ok(rows)
    }
}
