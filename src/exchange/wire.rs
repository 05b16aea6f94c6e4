//! Wire types for the exchange protocol surfaces
use serde::{Deserialize, Serialize};

use crate::types::{BookTicker, DepthLevel, Side};

/// One tick of the market-summary channel, normalized.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryTick {
    #[serde(rename = "pair")]
    pub pair_id: String,
    #[serde(rename = "last")]
    pub price: f64,
    #[serde(rename = "buy")]
    pub best_bid: f64,
    #[serde(rename = "sell")]
    pub best_ask: f64,
    #[serde(rename = "vol_idr")]
    pub volume_idr: f64,
    /// Cumulative 24h transaction count reported by the exchange; the
    /// ingestor tracks per-window deltas against it.
    #[serde(rename = "trx", default)]
    pub trx_count: u64,
    #[serde(rename = "ts", default)]
    pub at_ms: i64,
}

/// Raw order-book frame: `[price, quote_volume, base_volume]` rows.
#[derive(Debug, Clone, Deserialize)]
pub struct BookFrame {
    #[serde(rename = "pair")]
    pub pair_id: String,
    pub bids: Vec<[f64; 3]>,
    pub asks: Vec<[f64; 3]>,
    #[serde(rename = "ts", default)]
    pub at_ms: i64,
}

impl BookFrame {
    pub fn into_ticker(self) -> BookTicker {
        let level = |row: &[f64; 3]| DepthLevel {
            price: row[0],
            quote_volume: row[1],
            base_volume: row[2],
        };
        BookTicker {
            pair_id: self.pair_id,
            best_bid: self.bids.first().map(|r| r[0]).unwrap_or(0.0),
            best_ask: self.asks.first().map(|r| r[0]).unwrap_or(0.0),
            bids: self.bids.iter().map(level).collect(),
            asks: self.asks.iter().map(level).collect(),
            at_ms: self.at_ms,
        }
    }
}

/// Everything the public socket can deliver.
#[derive(Debug, Clone)]
pub enum PublicMessage {
    Summary(SummaryTick),
    Book(BookTicker),
}

/// Status tokens of the private order-event stream. The exchange emits
/// them in unstable casing, and a completely filled order may produce
/// both `FILL` and `DONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventStatus {
    Open,
    Fill,
    Done,
    Cancelled,
}

impl OrderEventStatus {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "open" => Some(OrderEventStatus::Open),
            "fill" => Some(OrderEventStatus::Fill),
            "done" => Some(OrderEventStatus::Done),
            "cancelled" | "canceled" => Some(OrderEventStatus::Cancelled),
            _ => None,
        }
    }

    /// Lowercase token written back onto the stored order record.
    pub fn as_str(&self) -> &str {
        match self {
            OrderEventStatus::Open => "open",
            OrderEventStatus::Fill => "fill",
            OrderEventStatus::Done => "done",
            OrderEventStatus::Cancelled => "cancelled",
        }
    }
}

/// One order event from the private stream.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    /// Exchange-assigned id; may wrap a numeric id as
    /// `{pair}-{type}-{numeric}` for market orders.
    pub exchange_order_id: String,
    /// Our client order id, echoed back verbatim.
    pub client_order_id: String,
    pub pair: String,
    pub side: Side,
    pub status: OrderEventStatus,
    pub original_qty: f64,
    pub executed_qty: f64,
    pub remaining_qty: f64,
    pub avg_price: f64,
    pub at_ms: i64,
}

/// Raw private-stream frame before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderEventFrame {
    #[serde(rename = "order_id")]
    pub exchange_order_id: String,
    #[serde(rename = "client_order_id", default)]
    pub client_order_id: String,
    pub pair: String,
    pub side: String,
    pub status: String,
    #[serde(rename = "orig_qty")]
    pub original_qty: f64,
    #[serde(rename = "executed_qty")]
    pub executed_qty: f64,
    #[serde(rename = "remaining_qty")]
    pub remaining_qty: f64,
    #[serde(rename = "avg_price", default)]
    pub avg_price: f64,
    #[serde(rename = "transaction_time", default)]
    pub at_ms: i64,
}

impl OrderEventFrame {
    pub fn normalize(self) -> Option<OrderEvent> {
        let status = OrderEventStatus::parse(&self.status)?;
        let side = match self.side.to_lowercase().as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => return None,
        };
        Some(OrderEvent {
            exchange_order_id: self.exchange_order_id,
            client_order_id: self.client_order_id,
            pair: self.pair,
            side,
            status,
            original_qty: self.original_qty,
            executed_qty: self.executed_qty,
            remaining_qty: self.remaining_qty,
            avg_price: self.avg_price,
            at_ms: self.at_ms,
        })
    }
}

/// Frames sent on either socket.
#[derive(Debug, Serialize)]
pub struct ChannelFrame {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ChannelFrame {
    pub fn subscribe(channel: String) -> Self {
        ChannelFrame { event: "subscribe", channel: Some(channel), token: None }
    }

    pub fn unsubscribe(channel: String) -> Self {
        ChannelFrame { event: "unsubscribe", channel: Some(channel), token: None }
    }

    pub fn auth(token: String) -> Self {
        ChannelFrame { event: "auth", channel: None, token: Some(token) }
    }
}

pub const SUMMARY_CHANNEL: &str = "market:summary-24h";

pub fn book_channel(pair_id: &str) -> String {
    format!("market:order-book-{}", pair_id)
}

pub fn orders_channel(user_id: u64) -> String {
    format!("orders:{}", user_id)
}

/// Client order id for bot-issued orders:
/// `bot{botId}-{pair}-{side}-{unixMillis}`.
pub fn bot_client_order_id(bot_id: u64, pair: &str, side: Side, unix_millis: i64) -> String {
    format!("bot{}-{}-{}-{}", bot_id, pair, side.as_str(), unix_millis)
}

/// Client order id for protective stop-loss sells:
/// `copilot-{pair}-stoploss-{unixMillis}`.
pub fn stoploss_client_order_id(pair: &str, unix_millis: i64) -> String {
    format!("copilot-{}-stoploss-{}", pair, unix_millis)
}

/// Extract the numeric suffix of a `{pair}-{type}-{numeric}` exchange
/// order id. Used as the fallback match key when the exchange did not
/// echo our client order id.
pub fn numeric_order_suffix(exchange_order_id: &str) -> Option<u64> {
    exchange_order_id.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_case_insensitive() {
        assert_eq!(OrderEventStatus::parse("FILL"), Some(OrderEventStatus::Fill));
        assert_eq!(OrderEventStatus::parse("done"), Some(OrderEventStatus::Done));
        assert_eq!(OrderEventStatus::parse("Cancelled"), Some(OrderEventStatus::Cancelled));
        assert_eq!(OrderEventStatus::parse("CANCELED"), Some(OrderEventStatus::Cancelled));
        assert_eq!(OrderEventStatus::parse("bogus"), None);
    }

    #[test]
    fn test_client_order_id_format() {
        let id = bot_client_order_id(12, "btcidr", Side::Buy, 1_700_000_000_000);
        assert_eq!(id, "bot12-btcidr-buy-1700000000000");

        let sl = stoploss_client_order_id("ethidr", 1_700_000_000_000);
        assert_eq!(sl, "copilot-ethidr-stoploss-1700000000000");
    }

    #[test]
    fn test_numeric_order_suffix() {
        assert_eq!(numeric_order_suffix("btcidr-market-99123"), Some(99123));
        assert_eq!(numeric_order_suffix("plain"), None);
    }

    #[test]
    fn test_book_frame_normalization() {
        let frame = BookFrame {
            pair_id: "btcidr".to_string(),
            bids: vec![[1_000_000.0, 50_000.0, 0.05], [999_000.0, 30_000.0, 0.03]],
            asks: vec![[1_002_000.0, 20_000.0, 0.02]],
            at_ms: 7,
        };
        let ticker = frame.into_ticker();
        assert_eq!(ticker.best_bid, 1_000_000.0);
        assert_eq!(ticker.best_ask, 1_002_000.0);
        assert_eq!(ticker.bids.len(), 2);
        assert_eq!(ticker.asks[0].quote_volume, 20_000.0);
    }

    #[test]
    fn test_order_event_normalize_rejects_unknown() {
        let frame = OrderEventFrame {
            exchange_order_id: "1".to_string(),
            client_order_id: "c".to_string(),
            pair: "btcidr".to_string(),
            side: "hold".to_string(),
            status: "OPEN".to_string(),
            original_qty: 1.0,
            executed_qty: 0.0,
            remaining_qty: 1.0,
            avg_price: 0.0,
            at_ms: 0,
        };
        assert!(frame.normalize().is_none());
    }
}
