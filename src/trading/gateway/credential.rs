use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::trading::gateway::Exchange;

/// 交易所凭证,由外部配置提供,随调用传入,进程内不落盘
///
/// 中心化交易所走api_key + api_secret(部分交易所另加passphrase);
/// 去中心化交易所走钱包地址 + 代理签名私钥,代理key未配置时退回钱包私钥
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCredential {
    pub exchange: Exchange,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub wallet_private_key: Option<String>,
    #[serde(default)]
    pub agent_private_key: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl GatewayCredential {
    pub fn validate(&self) -> Result<(), AppError> {
        match self.exchange {
            Exchange::Binance => {
                if self.api_key.is_empty() || self.api_secret.is_empty() {
                    return Err(AppError::Signature("binance缺少api_key/api_secret".into()));
                }
            }
            Exchange::Okx | Exchange::Bitget => {
                if self.api_key.is_empty() || self.api_secret.is_empty() {
                    return Err(AppError::Signature(format!(
                        "{}缺少api_key/api_secret",
                        self.exchange
                    )));
                }
                if self.passphrase.as_deref().unwrap_or("").is_empty() {
                    return Err(AppError::Signature(format!(
                        "{}缺少passphrase",
                        self.exchange
                    )));
                }
            }
            Exchange::Hyperliquid => {
                if self.wallet_address.as_deref().unwrap_or("").is_empty() {
                    return Err(AppError::Signature("hyperliquid缺少钱包地址".into()));
                }
                if self.signing_key().is_none() {
                    return Err(AppError::Signature("hyperliquid缺少签名私钥".into()));
                }
            }
        }
        Ok(())
    }

    /// 实际用来签单的私钥
    pub fn signing_key(&self) -> Option<&str> {
        self.agent_private_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.wallet_private_key
                    .as_deref()
                    .filter(|k| !k.is_empty())
            })
    }

    /// 从trader_config里的JSON凭证列解析
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::BizError(format!("凭证JSON解析失败: {}", e)))
    }
}
