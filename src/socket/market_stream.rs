use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::trading::gateway::okx::{from_inst_id, to_inst_id};
use crate::trading::market::backfill::parse_candle_row;
use crate::trading::market::candle_cache::CandleArena;
use crate::CandleItem;

const DEFAULT_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";
/// 服务端30秒无活动断开,留足余量
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_BACKOFF_SECS: u64 = 60;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 连接生命周期显式建模,避免重连逻辑散落在各个错误分支里
enum StreamState {
    Disconnected,
    Connecting,
    Connected(Box<WsStream>),
    Backoff,
}

#[derive(Debug, Deserialize)]
struct CandleArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct CandleWsMessage {
    arg: CandleArg,
    #[serde(default)]
    data: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WsEvent {
    event: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
}

/// 公共行情长连接:订阅各(symbol, period)的K线频道,
/// 已收盘的K线灌进共享窗口。断线按指数退避重连,重连后重新订阅。
pub struct MarketStream {
    arena: Arc<CandleArena>,
    symbols: Vec<String>,
    periods: Vec<String>,
    url: String,
}

impl MarketStream {
    pub fn new(arena: Arc<CandleArena>, symbols: Vec<String>, periods: Vec<String>) -> Self {
        Self {
            arena,
            symbols,
            periods,
            url: std::env::var("MARKET_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string()),
        }
    }

    /// 常驻任务,只会因进程退出而结束
    pub async fn run(self) {
        let mut state = StreamState::Disconnected;
        let mut attempt: u32 = 0;
        loop {
            state = match state {
                StreamState::Disconnected => StreamState::Connecting,
                StreamState::Connecting => match self.connect_and_subscribe().await {
                    Ok(stream) => {
                        info!(
                            "行情连接就绪: {} ({}个频道)",
                            self.url,
                            self.symbols.len() * self.periods.len()
                        );
                        attempt = 0;
                        StreamState::Connected(Box::new(stream))
                    }
                    Err(e) => {
                        error!("行情连接失败: {}", e);
                        StreamState::Backoff
                    }
                },
                StreamState::Connected(stream) => {
                    let reason = self.serve(*stream).await;
                    warn!("行情连接断开: {}", reason);
                    StreamState::Backoff
                }
                StreamState::Backoff => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff_delay(attempt);
                    info!("{}秒后重连行情(第{}次)", delay.as_secs(), attempt);
                    tokio::time::sleep(delay).await;
                    StreamState::Connecting
                }
            };
        }
    }

    async fn connect_and_subscribe(&self) -> Result<WsStream, AppError> {
        let (mut stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| AppError::Transport(format!("ws连接 {} 失败: {}", self.url, e)))?;

        let mut args = Vec::with_capacity(self.symbols.len() * self.periods.len());
        for symbol in &self.symbols {
            for period in &self.periods {
                args.push(json!({
                    "channel": format!("candle{}", period),
                    "instId": to_inst_id(symbol)?,
                }));
            }
        }
        let sub = json!({"op": "subscribe", "args": args});
        stream
            .send(Message::Text(sub.to_string()))
            .await
            .map_err(|e| AppError::Transport(format!("订阅发送失败: {}", e)))?;
        Ok(stream)
    }

    /// 读帧直到连接不可用,返回断开原因
    async fn serve(&self, mut stream: WsStream) -> String {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = stream.send(Message::Text("ping".to_string())).await {
                        return format!("ping发送失败: {}", e);
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => return format!("对端关闭: {:?}", frame),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("读帧失败: {}", e),
                    None => return "流结束".to_string(),
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        if text == "pong" {
            return;
        }
        if let Ok(msg) = serde_json::from_str::<CandleWsMessage>(text) {
            if !msg.arg.channel.starts_with("candle") || msg.data.is_empty() {
                return;
            }
            for (symbol, period, candle) in closed_candles(&msg) {
                let accepted = self.arena.upsert_and_share(&symbol, &period, candle).await;
                if accepted {
                    debug!("{} {} K线收盘入窗", symbol, period);
                }
            }
            return;
        }
        if let Ok(event) = serde_json::from_str::<WsEvent>(text) {
            if event.event == "error" {
                error!("行情订阅错误 code={}: {}", event.code, event.msg);
            } else {
                debug!("行情事件: {}", event.event);
            }
        }
    }
}

/// 推送里只留已收盘的K线(confirm=1),映射回规范symbol
fn closed_candles(msg: &CandleWsMessage) -> Vec<(String, String, CandleItem)> {
    let period = msg.arg.channel.trim_start_matches("candle").to_string();
    let symbol = from_inst_id(&msg.arg.inst_id);
    let mut out = Vec::new();
    for row in &msg.data {
        if row.len() > 8 && row[8] == "0" {
            continue;
        }
        match parse_candle_row(row) {
            Ok(candle) => out.push((symbol.clone(), period.clone(), candle)),
            Err(e) => warn!("丢弃畸形K线推送: {}", e),
        }
    }
    out
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_candles_skips_unconfirmed() {
        let raw = r#"{
            "arg": {"channel": "candle1H", "instId": "BTC-USDT-SWAP"},
            "data": [
                ["1716822000000","68000","68100","67900","68050","1234.5","0","0","1"],
                ["1716825600000","68050","68200","68000","68150","321.0","0","0","0"]
            ]
        }"#;
        let msg: CandleWsMessage = serde_json::from_str(raw).unwrap();
        let candles = closed_candles(&msg);
        assert_eq!(candles.len(), 1);
        let (symbol, period, candle) = &candles[0];
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(period, "1H");
        assert_eq!(candle.ts(), 1716822000000);
        assert_eq!(candle.c(), 68050.0);
    }

    #[test]
    fn test_subscribe_ack_parses_as_event() {
        let raw = r#"{"event":"subscribe","arg":{"channel":"candle1H","instId":"BTC-USDT-SWAP"},"connId":"abc"}"#;
        // 候选K线结构里data为空,按事件处理
        assert!(serde_json::from_str::<WsEvent>(raw).is_ok());
        let as_candle = serde_json::from_str::<CandleWsMessage>(raw).unwrap();
        assert!(as_candle.data.is_empty());
    }

    #[test]
    fn test_error_event_carries_code() {
        let raw = r#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
        let event: WsEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event, "error");
        assert_eq!(event.code, "60012");
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
    }
}
