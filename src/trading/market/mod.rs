pub mod backfill;
pub mod candle_cache;
pub mod candle_window;
