//! Trade execution seam: live exchange or paper matcher
pub mod factory;
pub mod live;
pub mod paper;

pub use factory::ExecutorFactory;
pub use live::LiveExecutor;
pub use paper::PaperExecutor;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::exchange::RemoteOrder;
use crate::types::{OrderType, Side};

/// One order placement. `amount` is the base amount, except for market
/// buys where it is the quote amount to spend (the exchange's own
/// convention, preserved by both executors).
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub amount: f64,
    /// Preserved verbatim so the reconciler can match the resulting
    /// private-stream events.
    pub client_order_id: String,
}

#[async_trait]
pub trait TradeExecutor: Send + Sync {
    async fn account_info(&self) -> Result<HashMap<String, f64>>;

    /// Returns the exchange-assigned order id.
    async fn place_order(&self, order: &PlaceOrder) -> Result<String>;

    async fn cancel_order(&self, pair: &str, exchange_order_id: &str, side: Side) -> Result<()>;

    async fn fetch_order(&self, pair: &str, exchange_order_id: &str) -> Result<RemoteOrder>;
}
