pub mod fanout;
pub mod ingestor;

pub use fanout::{SubscriptionId, TickerFanout};
pub use ingestor::{pump_score, tx_boost, MarketIngestor};
