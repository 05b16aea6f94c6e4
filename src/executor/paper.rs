//! Paper executor: in-memory matcher with an artificial fill delay
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use super::{PlaceOrder, TradeExecutor};
use crate::error::{EngineError, Result};
use crate::exchange::wire::{OrderEvent, OrderEventStatus};
use crate::exchange::RemoteOrder;
use crate::types::{OrderType, Side};

/// Simulated exchange for one user. Every placement schedules a
/// complete fill at the supplied limit price after a fixed short delay;
/// the resulting order event is injected into the same reconciler path
/// live fills arrive on.
pub struct PaperExecutor {
    user_id: u64,
    fill_delay: Duration,
    balances: Arc<RwLock<HashMap<String, f64>>>,
    orders: Arc<RwLock<HashMap<String, RemoteOrder>>>,
    next_id: AtomicU64,
    event_sink: mpsc::UnboundedSender<(u64, OrderEvent)>,
}

impl PaperExecutor {
    pub fn new(
        user_id: u64,
        initial_balances: HashMap<String, f64>,
        fill_delay: Duration,
        event_sink: mpsc::UnboundedSender<(u64, OrderEvent)>,
    ) -> Self {
        PaperExecutor {
            user_id,
            fill_delay,
            balances: Arc::new(RwLock::new(initial_balances)),
            orders: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            event_sink,
        }
    }

    /// Base quantity a fill delivers. Market buys are sized by the quote
    /// amount to spend, everything else by base amount.
    fn fill_quantity(order: &PlaceOrder) -> f64 {
        if order.side == Side::Buy && order.order_type == OrderType::Market && order.price > 0.0 {
            order.amount / order.price
        } else {
            order.amount
        }
    }
}

#[async_trait]
impl TradeExecutor for PaperExecutor {
    async fn account_info(&self) -> Result<HashMap<String, f64>> {
        Ok(self.balances.read().await.clone())
    }

    async fn place_order(&self, order: &PlaceOrder) -> Result<String> {
        if order.price <= 0.0 || order.amount <= 0.0 {
            return Err(EngineError::InvalidParameter(format!(
                "paper order rejected: price={} amount={}",
                order.price, order.amount
            )));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exchange_order_id = format!("paper-{}-{}", self.user_id, seq);
        let quantity = Self::fill_quantity(order);

        {
            let mut orders = self.orders.write().await;
            orders.insert(
                exchange_order_id.clone(),
                RemoteOrder {
                    status: "open".to_string(),
                    price: order.price,
                    original_amount: quantity,
                    remaining_amount: quantity,
                },
            );
        }

        info!(
            "📝 [PAPER] {} {} {} @ {} (fills in {:?})",
            order.side.as_str(),
            quantity,
            order.pair,
            order.price,
            self.fill_delay
        );

        let user_id = self.user_id;
        let fill_delay = self.fill_delay;
        let orders = Arc::clone(&self.orders);
        let event_sink = self.event_sink.clone();
        let event = OrderEvent {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            pair: order.pair.clone(),
            side: order.side,
            status: OrderEventStatus::Done,
            original_qty: quantity,
            executed_qty: quantity,
            remaining_qty: 0.0,
            avg_price: order.price,
            at_ms: chrono::Utc::now().timestamp_millis(),
        };

        tokio::spawn(async move {
            tokio::time::sleep(fill_delay).await;
            let still_open = {
                let mut orders = orders.write().await;
                match orders.get_mut(&event.exchange_order_id) {
                    Some(remote) if remote.is_open() => {
                        remote.status = "filled".to_string();
                        remote.remaining_amount = 0.0;
                        true
                    }
                    _ => false,
                }
            };
            // A cancel that landed before the artificial delay wins.
            if still_open {
                let _ = event_sink.send((user_id, event));
            }
        });

        Ok(exchange_order_id)
    }

    /// Cancellation of a simulated order always succeeds.
    async fn cancel_order(&self, _pair: &str, exchange_order_id: &str, _side: Side) -> Result<()> {
        let mut orders = self.orders.write().await;
        if let Some(remote) = orders.get_mut(exchange_order_id) {
            if remote.is_open() {
                remote.status = "cancelled".to_string();
            }
        }
        Ok(())
    }

    async fn fetch_order(&self, _pair: &str, exchange_order_id: &str) -> Result<RemoteOrder> {
        let orders = self.orders.read().await;
        orders
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| EngineError::OrderMissing(exchange_order_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QUOTE_CURRENCY;

    fn executor(
        fill_delay: Duration,
    ) -> (PaperExecutor, mpsc::UnboundedReceiver<(u64, OrderEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut balances = HashMap::new();
        balances.insert(QUOTE_CURRENCY.to_string(), 10_000_000.0);
        (PaperExecutor::new(1, balances, fill_delay, tx), rx)
    }

    #[tokio::test]
    async fn test_paper_fill_arrives_after_delay() {
        tokio::time::pause();
        let (executor, mut rx) = executor(Duration::from_secs(5));

        let order = PlaceOrder {
            pair: "btcidr".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: 1_000_000.0,
            amount: 0.1,
            client_order_id: "bot1-btcidr-buy-1".to_string(),
        };
        let id = executor.place_order(&order).await.unwrap();

        assert!(rx.try_recv().is_err());
        tokio::time::advance(Duration::from_secs(6)).await;

        let (user_id, event) = rx.recv().await.unwrap();
        assert_eq!(user_id, 1);
        assert_eq!(event.exchange_order_id, id);
        // Client order id preserved verbatim.
        assert_eq!(event.client_order_id, "bot1-btcidr-buy-1");
        assert_eq!(event.status, OrderEventStatus::Done);
        assert_eq!(event.executed_qty, 0.1);
        assert_eq!(event.avg_price, 1_000_000.0);

        let remote = executor.fetch_order("btcidr", &id).await.unwrap();
        assert!(remote.is_filled());
    }

    #[tokio::test]
    async fn test_market_buy_sized_by_quote_amount() {
        tokio::time::pause();
        let (executor, mut rx) = executor(Duration::from_secs(5));

        let order = PlaceOrder {
            pair: "btcidr".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            price: 1_000_000.0,
            amount: 100_000.0,
            client_order_id: "bot1-btcidr-buy-2".to_string(),
        };
        executor.place_order(&order).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let (_, event) = rx.recv().await.unwrap();
        assert!((event.executed_qty - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_cancel_is_noop_success() {
        let (executor, _rx) = executor(Duration::from_secs(60));

        let order = PlaceOrder {
            pair: "btcidr".to_string(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: 1_000_000.0,
            amount: 0.1,
            client_order_id: "bot1-btcidr-sell-3".to_string(),
        };
        let id = executor.place_order(&order).await.unwrap();

        executor.cancel_order("btcidr", &id, Side::Sell).await.unwrap();
        let remote = executor.fetch_order("btcidr", &id).await.unwrap();
        assert!(remote.is_cancelled());

        // Cancelling something unknown still succeeds.
        executor.cancel_order("btcidr", "paper-9-9", Side::Sell).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_delay_suppresses_fill() {
        tokio::time::pause();
        let (executor, mut rx) = executor(Duration::from_secs(5));

        let order = PlaceOrder {
            pair: "btcidr".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: 1_000_000.0,
            amount: 0.1,
            client_order_id: "bot1-btcidr-buy-4".to_string(),
        };
        let id = executor.place_order(&order).await.unwrap();
        executor.cancel_order("btcidr", &id, Side::Buy).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        let remote = executor.fetch_order("btcidr", &id).await.unwrap();
        assert!(remote.is_cancelled());
    }

    #[tokio::test]
    async fn test_account_info_serializes_balances() {
        let (executor, _rx) = executor(Duration::from_secs(5));
        let balances = executor.account_info().await.unwrap();
        assert_eq!(balances[QUOTE_CURRENCY], 10_000_000.0);
    }
}
