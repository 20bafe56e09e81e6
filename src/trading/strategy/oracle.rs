use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::AppError;

/// 裁决动作,和策略状态机的迁移一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleAction {
    Wait,
    Open,
    Add,
    Close,
}

impl OracleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleAction::Wait => "wait",
            OracleAction::Open => "open",
            OracleAction::Add => "add",
            OracleAction::Close => "close",
        }
    }
}

impl fmt::Display for OracleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OracleAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wait" | "hold" => Ok(OracleAction::Wait),
            "open" | "entry" => Ok(OracleAction::Open),
            "add" => Ok(OracleAction::Add),
            "close" | "exit" => Ok(OracleAction::Close),
            other => Err(AppError::Oracle(format!("未知裁决动作: {}", other))),
        }
    }
}

/// 决策服务给出的裁决
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub action: OracleAction,
    /// 0~1 的置信度,缺省 0
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

impl OracleVerdict {
    pub fn wait(reason: &str) -> Self {
        Self {
            action: OracleAction::Wait,
            confidence: 0.0,
            reason: reason.to_string(),
        }
    }
}

/// 外部决策服务的抽象。裁决失败不是致命错误,
/// 调用侧会把这一轮降级成 wait,并在决策流水里标记执行失败。
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, prompt: &str) -> Result<OracleVerdict, AppError>;
}

pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(20);

const SYSTEM_PROMPT: &str = "你是一个合约交易决策助手。根据给定的信号内容、持仓状态和指标快照,\
从允许的动作里选择一个。只输出一个JSON对象,不要输出任何其他文字,格式:\
{\"action\":\"wait|open|add|close\",\"confidence\":0到1的小数,\"reason\":\"一句话理由\"}";

/// 走 OpenAI 兼容接口 (POST {base}/chat/completions) 的决策服务
pub struct HttpOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpOracle {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
        }
    }

    /// 从环境变量装配:ORACLE_BASE_URL / ORACLE_API_KEY / ORACLE_MODEL / ORACLE_TIMEOUT_SECS
    pub fn from_env() -> Result<Self, AppError> {
        let base_url = std::env::var("ORACLE_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("ORACLE_API_KEY")
            .map_err(|_| AppError::Oracle("缺少环境变量 ORACLE_API_KEY".to_string()))?;
        let model = std::env::var("ORACLE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let timeout = std::env::var("ORACLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ORACLE_TIMEOUT);
        Ok(Self::new(&base_url, &api_key, &model, timeout))
    }
}

#[async_trait]
impl DecisionOracle for HttpOracle {
    async fn decide(&self, prompt: &str) -> Result<OracleVerdict, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
        });

        // reqwest 自身有超时,这里再包一层硬上限,防止决策拖垮整轮评估
        let send = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| AppError::Oracle(format!("决策请求超过 {:?} 未返回", self.timeout)))?
            .map_err(|e| AppError::Oracle(format!("决策请求失败: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::Oracle(format!("决策响应读取失败: {}", e)))?;
        if !status.is_success() {
            return Err(AppError::Oracle(format!(
                "决策服务返回 {}: {}",
                status, text
            )));
        }

        let content = extract_message_content(&text)?;
        debug!("决策服务原文: {}", content);
        parse_verdict(&content)
    }
}

/// chat/completions 响应里抠出第一个choice的文本
fn extract_message_content(raw: &str) -> Result<String, AppError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| AppError::Oracle(format!("决策响应不是JSON: {}", e)))?;
    value
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::Oracle(format!("决策响应缺少choices: {}", raw)))
}

/// 模型输出里解析裁决 JSON,容忍markdown代码块和前后废话
pub fn parse_verdict(content: &str) -> Result<OracleVerdict, AppError> {
    let trimmed = content.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| AppError::Oracle(format!("裁决输出里找不到JSON: {}", trimmed)))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| AppError::Oracle(format!("裁决输出里找不到JSON: {}", trimmed)))?;
    if end < start {
        return Err(AppError::Oracle(format!("裁决输出格式错乱: {}", trimmed)));
    }

    #[derive(Deserialize)]
    struct RawVerdict {
        action: String,
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        reason: String,
    }

    let raw: RawVerdict = serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| AppError::Oracle(format!("裁决JSON解析失败: {}", e)))?;
    Ok(OracleVerdict {
        action: raw.action.parse()?,
        confidence: raw.confidence.clamp(0.0, 1.0),
        reason: raw.reason,
    })
}

/// 预置应答的决策服务,测试用:按顺序吐出脚本里的裁决,
/// 脚本耗尽后一律 wait;同时记下收到的每个提示词
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<OracleVerdict, AppError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, verdict: OracleVerdict) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(verdict));
    }

    pub fn push_action(&self, action: OracleAction) {
        self.push(OracleVerdict {
            action,
            confidence: 0.9,
            reason: "scripted".to_string(),
        });
    }

    pub fn push_failure(&self, error: AppError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(&self, prompt: &str) -> Result<OracleVerdict, AppError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(OracleVerdict::wait("脚本耗尽")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let verdict = parse_verdict(r#"{"action":"open","confidence":0.8,"reason":"趋势向上"}"#)
            .unwrap();
        assert_eq!(verdict.action, OracleAction::Open);
        assert_eq!(verdict.confidence, 0.8);
        assert_eq!(verdict.reason, "趋势向上");
    }

    #[test]
    fn test_parse_markdown_fenced_json() {
        let content = "```json\n{\"action\":\"close\",\"reason\":\"破位\"}\n```";
        let verdict = parse_verdict(content).unwrap();
        assert_eq!(verdict.action, OracleAction::Close);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn test_parse_action_case_insensitive() {
        let verdict = parse_verdict(r#"{"action":"WAIT"}"#).unwrap();
        assert_eq!(verdict.action, OracleAction::Wait);
    }

    #[test]
    fn test_parse_unknown_action_is_oracle_error() {
        let err = parse_verdict(r#"{"action":"yolo"}"#).unwrap_err();
        assert!(matches!(err, AppError::Oracle(_)));
    }

    #[test]
    fn test_parse_without_json_is_error() {
        assert!(parse_verdict("看多但是没有格式").is_err());
    }

    #[test]
    fn test_confidence_clamped() {
        let verdict = parse_verdict(r#"{"action":"open","confidence":1.7}"#).unwrap();
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn test_extract_chat_completion_content() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"action\":\"wait\"}"}}]}"#;
        let content = extract_message_content(raw).unwrap();
        assert_eq!(parse_verdict(&content).unwrap().action, OracleAction::Wait);
    }

    #[tokio::test]
    async fn test_scripted_oracle_replays_then_waits() {
        let oracle = ScriptedOracle::new();
        oracle.push_action(OracleAction::Open);
        assert_eq!(
            oracle.decide("p1").await.unwrap().action,
            OracleAction::Open
        );
        assert_eq!(
            oracle.decide("p2").await.unwrap().action,
            OracleAction::Wait
        );
        assert_eq!(oracle.prompts(), vec!["p1", "p2"]);
    }
}
