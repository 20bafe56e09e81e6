pub mod ema;
pub mod macd;
pub mod rsi;
pub mod snapshot;
pub mod vegas;
