//! Live executor: thin shim over the signed REST surface
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{PlaceOrder, TradeExecutor};
use crate::error::Result;
use crate::exchange::{ApiCredentials, RemoteOrder, RestClient};
use crate::types::Side;

pub struct LiveExecutor {
    rest: Arc<RestClient>,
    creds: ApiCredentials,
}

impl LiveExecutor {
    pub fn new(rest: Arc<RestClient>, creds: ApiCredentials) -> Self {
        LiveExecutor { rest, creds }
    }
}

#[async_trait]
impl TradeExecutor for LiveExecutor {
    async fn account_info(&self) -> Result<HashMap<String, f64>> {
        self.rest.account_info(&self.creds).await
    }

    async fn place_order(&self, order: &PlaceOrder) -> Result<String> {
        self.rest
            .place_order(
                &self.creds,
                &order.pair,
                order.side,
                order.order_type,
                order.price,
                order.amount,
                &order.client_order_id,
            )
            .await
    }

    async fn cancel_order(&self, pair: &str, exchange_order_id: &str, side: Side) -> Result<()> {
        self.rest.cancel_order(&self.creds, pair, exchange_order_id, side).await
    }

    async fn fetch_order(&self, pair: &str, exchange_order_id: &str) -> Result<RemoteOrder> {
        self.rest.get_order(&self.creds, pair, exchange_order_id).await
    }
}
