use rbatis::{crud, impl_select, RBatis};

use crate::app_config::db;
use crate::error::AppError;
use crate::trading::gateway::GatewayCredential;

/// 每个trader的运行配置,归外部账户子系统管,这里只读
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TraderConfigEntity {
    pub id: Option<i64>,
    pub trader_id: String,
    pub exchange: String,
    /// GatewayCredential的JSON
    pub credentials_json: String,
    /// 逗号分隔,如"BTCUSDT,ETHUSDT"
    pub symbols: String,
    pub leverage: i32,
    pub is_cross: i32,
    /// 单次开仓占用的保证金(USDT)
    pub order_notional: f64,
    pub custom_prompt: Option<String>,
    pub scan_interval_secs: i64,
    pub enabled: i32,
}

crud!(TraderConfigEntity {}, "trader_config");
impl_select!(TraderConfigEntity{select_enabled() => "`where enabled=1`"},"trader_config");

impl TraderConfigEntity {
    pub fn symbol_list(&self) -> Vec<String> {
        self.symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn credential(&self) -> Result<GatewayCredential, AppError> {
        GatewayCredential::from_json(&self.credentials_json)
    }
}

pub struct TraderConfigModel {
    db: &'static RBatis,
}

impl TraderConfigModel {
    pub async fn new() -> TraderConfigModel {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn list_enabled(&self) -> anyhow::Result<Vec<TraderConfigEntity>> {
        let rows = TraderConfigEntity::select_enabled(self.db).await?;
        Ok(rows)
    }
}
