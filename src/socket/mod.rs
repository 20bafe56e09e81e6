pub mod market_stream;

pub use market_stream::MarketStream;
