//! Assisted one-shot trades: lifecycle handlers fed by the reconciler
//!
//! The assisted-trade runtime itself lives outside the core; the core
//! keeps its entity moving through the state machine when the private
//! stream reports its buy or sell leg done, and hands Filled trades to
//! the stop-loss watcher.
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::exchange::wire::OrderEvent;
use crate::notify::NotificationBus;
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::types::{AssistedTrade, BotOrder, Side, TradeStatus};
use crate::watcher::StopLossWatcher;

pub struct AssistedTrades {
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    watcher: Arc<StopLossWatcher>,
}

impl AssistedTrades {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        watcher: Arc<StopLossWatcher>,
    ) -> Self {
        AssistedTrades { store, keys, bus, watcher }
    }

    pub async fn get(&self, trade_id: u64) -> Result<Option<AssistedTrade>> {
        self.store.get_json(&self.keys.trade(trade_id)).await
    }

    async fn save(&self, trade: &mut AssistedTrade) -> Result<()> {
        trade.updated_at = Utc::now();
        self.store.set_json(&self.keys.trade(trade.id), trade).await?;
        self.store.sadd(&self.keys.trades(), &trade.id.to_string()).await
    }

    /// A leg of the trade filled completely.
    pub async fn handle_order_filled(&self, order: &BotOrder, event: &OrderEvent) -> Result<()> {
        let Some(mut trade) = self.get(order.parent_id).await? else {
            warn!("Fill for unknown trade {} skipped", order.parent_id);
            return Ok(());
        };

        match order.side {
            Side::Buy => {
                if trade.status != TradeStatus::Pending {
                    return Ok(());
                }
                trade.status = TradeStatus::Filled;
                if event.avg_price > 0.0 {
                    trade.buy_price = event.avg_price;
                }
                info!("Trade {} buy leg filled at {}", trade.id, trade.buy_price);
                self.save(&mut trade).await?;
                self.watcher.register(trade.clone()).await;
            }
            Side::Sell => {
                trade.status = if trade.stop_triggered {
                    TradeStatus::Stopped
                } else {
                    TradeStatus::Completed
                };
                if event.avg_price > 0.0 {
                    trade.sell_price = event.avg_price;
                }
                info!(
                    "Trade {} sell leg filled at {} ({})",
                    trade.id,
                    trade.sell_price,
                    trade.status.as_str()
                );
                self.save(&mut trade).await?;
                self.watcher.deregister(trade.id).await;
            }
        }

        self.bus.notify_user(trade.user_id, "trade_update", &trade).await;
        Ok(())
    }

    /// A leg of the trade was cancelled on the exchange.
    pub async fn handle_order_cancelled(&self, order: &BotOrder, _event: &OrderEvent) -> Result<()> {
        let Some(mut trade) = self.get(order.parent_id).await? else {
            warn!("Cancel for unknown trade {} skipped", order.parent_id);
            return Ok(());
        };

        match order.side {
            Side::Buy => {
                if trade.status == TradeStatus::Pending {
                    trade.status = TradeStatus::Cancelled;
                    self.save(&mut trade).await?;
                    self.watcher.deregister(trade.id).await;
                }
            }
            Side::Sell => {
                // The resting sell going away does not end the trade;
                // the stop-loss path replaces it with its own sell.
                if !trade.stop_triggered && trade.sell_order_id == order.id {
                    trade.sell_order_id = String::new();
                    self.save(&mut trade).await?;
                }
            }
        }

        self.bus.notify_user(trade.user_id, "trade_update", &trade).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::exchange::wire::OrderEventStatus;
    use crate::exchange::{PublicWs, RestClient};
    use crate::executor::ExecutorFactory;
    use crate::market::{MarketIngestor, TickerFanout};
    use crate::orders::{new_order, OrderRepo};
    use crate::store::InMemoryStore;
    use crate::types::{OrderType, ParentKind};
    use tokio::sync::mpsc;

    async fn fixture() -> (AssistedTrades, Arc<InMemoryStore>, Keys, Arc<StopLossWatcher>) {
        let settings = Arc::new(Settings::default());
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::new("test");
        let bus = Arc::new(NotificationBus::new(store.clone(), keys.clone()));
        let (ws, _rx) = PublicWs::spawn("wss://invalid.test/ws".to_string());
        let fanout = Arc::new(TickerFanout::new(ws));
        let ingestor = Arc::new(MarketIngestor::new(
            settings.clone(),
            store.clone(),
            keys.clone(),
            bus.clone(),
            fanout,
        ));
        let rest = Arc::new(RestClient::new(&settings));
        let (paper_tx, _paper_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(ExecutorFactory::new(
            settings,
            rest,
            store.clone(),
            keys.clone(),
            paper_tx,
        ));
        let orders = Arc::new(OrderRepo::new(store.clone(), keys.clone()));
        let watcher = Arc::new(StopLossWatcher::new(
            store.clone(),
            keys.clone(),
            bus.clone(),
            ingestor,
            factory,
            orders,
        ));
        let trades = AssistedTrades::new(store.clone(), keys.clone(), bus, watcher.clone());
        (trades, store, keys, watcher)
    }

    fn trade(id: u64) -> AssistedTrade {
        AssistedTrade {
            id,
            user_id: 1,
            pair: "btcidr".to_string(),
            status: TradeStatus::Pending,
            buy_order_id: "buy-1".to_string(),
            buy_price: 1_000_000.0,
            amount: 0.1,
            sell_order_id: String::new(),
            sell_price: 0.0,
            target_profit_pct: 2.0,
            stop_loss_pct: 5.0,
            stop_triggered: false,
            paper: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event(side: Side, avg_price: f64) -> OrderEvent {
        OrderEvent {
            exchange_order_id: "x-1".to_string(),
            client_order_id: "c-1".to_string(),
            pair: "btcidr".to_string(),
            side,
            status: OrderEventStatus::Done,
            original_qty: 0.1,
            executed_qty: 0.1,
            remaining_qty: 0.0,
            avg_price,
            at_ms: 1,
        }
    }

    fn leg(side: Side, trade_id: u64) -> crate::types::BotOrder {
        new_order(
            1,
            ParentKind::Trade,
            trade_id,
            "c-1".to_string(),
            "btcidr".to_string(),
            side,
            OrderType::Limit,
            1_000_000.0,
            0.1,
            true,
        )
    }

    #[tokio::test]
    async fn test_buy_fill_moves_to_filled_and_registers_watch() {
        let (trades, store, keys, watcher) = fixture().await;
        store.set_json(&keys.trade(1), &trade(1)).await.unwrap();

        trades
            .handle_order_filled(&leg(Side::Buy, 1), &event(Side::Buy, 1_005_000.0))
            .await
            .unwrap();

        let stored: AssistedTrade = store.get_json(&keys.trade(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Filled);
        assert_eq!(stored.buy_price, 1_005_000.0);
        assert_eq!(watcher.watched_count().await, 1);
    }

    #[tokio::test]
    async fn test_sell_fill_completes_and_deregisters() {
        let (trades, store, keys, watcher) = fixture().await;
        let mut t = trade(1);
        t.status = TradeStatus::Filled;
        store.set_json(&keys.trade(1), &t).await.unwrap();
        watcher.register(t).await;

        trades
            .handle_order_filled(&leg(Side::Sell, 1), &event(Side::Sell, 1_020_000.0))
            .await
            .unwrap();

        let stored: AssistedTrade = store.get_json(&keys.trade(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Completed);
        assert_eq!(stored.sell_price, 1_020_000.0);
        assert_eq!(watcher.watched_count().await, 0);
    }

    #[tokio::test]
    async fn test_buy_cancel_cancels_trade() {
        let (trades, store, keys, _) = fixture().await;
        store.set_json(&keys.trade(1), &trade(1)).await.unwrap();

        trades
            .handle_order_cancelled(&leg(Side::Buy, 1), &event(Side::Buy, 0.0))
            .await
            .unwrap();

        let stored: AssistedTrade = store.get_json(&keys.trade(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Cancelled);
    }
}
