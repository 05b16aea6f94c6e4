//! Stop-loss watcher for filled assisted trades
//!
//! Once per second every watched trade's pair price is checked; when it
//! breaches the trade's stop level the resting sell is cancelled and a
//! protective market sell goes out well under the current price so it
//! fills immediately.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::exchange::stoploss_client_order_id;
use crate::executor::{ExecutorFactory, PlaceOrder};
use crate::market::MarketIngestor;
use crate::notify::NotificationBus;
use crate::orders::{new_order, OrderRepo};
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::types::{AssistedTrade, OrderType, PairInfo, ParentKind, Side, TradeStatus};
use crate::utils::align_price;

/// Price undercut factor of the protective sell.
const STOP_SELL_DISCOUNT: f64 = 0.90;

/// True once the price reaches the stop level. The boundary itself
/// triggers.
pub fn should_trigger(trade: &AssistedTrade, price: f64) -> bool {
    price <= trade.buy_price * (1.0 - trade.stop_loss_pct / 100.0)
}

pub struct StopLossWatcher {
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    ingestor: Arc<MarketIngestor>,
    factory: Arc<ExecutorFactory>,
    orders: Arc<OrderRepo>,
    watched: RwLock<HashMap<u64, AssistedTrade>>,
}

impl StopLossWatcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        ingestor: Arc<MarketIngestor>,
        factory: Arc<ExecutorFactory>,
        orders: Arc<OrderRepo>,
    ) -> Self {
        StopLossWatcher {
            store,
            keys,
            bus,
            ingestor,
            factory,
            orders,
            watched: RwLock::new(HashMap::new()),
        }
    }

    /// Watch a trade whose buy leg just filled.
    pub async fn register(&self, trade: AssistedTrade) {
        if trade.stop_loss_pct <= 0.0 {
            return;
        }
        info!(
            "👁 Watching trade {} on {} (stop at -{}%)",
            trade.id, trade.pair, trade.stop_loss_pct
        );
        let mut watched = self.watched.write().await;
        watched.insert(trade.id, trade);
    }

    pub async fn deregister(&self, trade_id: u64) {
        let mut watched = self.watched.write().await;
        watched.remove(&trade_id);
    }

    pub async fn watched_count(&self) -> usize {
        self.watched.read().await.len()
    }

    /// Re-register every Filled trade found in the store.
    pub async fn restore(&self) -> Result<()> {
        let ids = self.store.smembers(&self.keys.trades()).await?;
        for id in ids {
            let Ok(trade_id) = id.parse::<u64>() else { continue };
            let trade: Option<AssistedTrade> =
                self.store.get_json(&self.keys.trade(trade_id)).await?;
            if let Some(trade) = trade {
                if trade.status == TradeStatus::Filled && !trade.stop_triggered {
                    self.register(trade).await;
                }
            }
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tick.tick().await;
                self.scan().await;
            }
        });
    }

    pub async fn scan(&self) {
        let snapshot: Vec<AssistedTrade> = {
            let watched = self.watched.read().await;
            watched.values().cloned().collect()
        };

        for trade in snapshot {
            let Some(price) = self.ingestor.price_of(&trade.pair).await else { continue };
            if !should_trigger(&trade, price) {
                continue;
            }
            if let Err(e) = self.trigger(trade.id, price).await {
                error!("Stop-loss trigger for trade {} failed: {}", trade.id, e);
            }
        }
    }

    /// Protective exit: cancel the resting sell, market-sell the coins,
    /// mark the trade Stopped and drop it from the watch list.
    async fn trigger(&self, trade_id: u64, current_price: f64) -> Result<()> {
        let Some(mut trade) = self.watched.write().await.remove(&trade_id) else {
            return Ok(());
        };

        warn!(
            "🛑 Stop loss hit for trade {} on {}: {} <= {} - {}%",
            trade.id, trade.pair, current_price, trade.buy_price, trade.stop_loss_pct
        );

        let executor = self.factory.for_user(trade.user_id, trade.paper).await?;

        if !trade.sell_order_id.is_empty() {
            if let Some(sell) = self.orders.get(&trade.sell_order_id).await? {
                if !sell.exchange_order_id.is_empty() {
                    match executor
                        .cancel_order(&sell.pair, &sell.exchange_order_id, Side::Sell)
                        .await
                    {
                        Ok(()) => {}
                        Err(e) if e.is_order_missing() => {
                            // Already finished on the exchange side.
                        }
                        Err(e) => warn!("Cancel of resting sell {} failed: {}", sell.id, e),
                    }
                }
            }
        }

        let pair_info: Option<PairInfo> =
            self.store.get_json(&self.keys.pair(&trade.pair)).await?;
        let raw_price = current_price * STOP_SELL_DISCOUNT;
        let price = match &pair_info {
            Some(info) => align_price(raw_price, info),
            None => raw_price,
        };

        let client_order_id =
            stoploss_client_order_id(&trade.pair, Utc::now().timestamp_millis());
        let mut order = new_order(
            trade.user_id,
            ParentKind::Trade,
            trade.id,
            client_order_id.clone(),
            trade.pair.clone(),
            Side::Sell,
            OrderType::Market,
            price,
            trade.amount,
            trade.paper,
        );
        self.orders.insert(&order).await?;

        let exchange_order_id = executor
            .place_order(&PlaceOrder {
                pair: trade.pair.clone(),
                side: Side::Sell,
                order_type: OrderType::Market,
                price,
                amount: trade.amount,
                client_order_id,
            })
            .await?;
        order.exchange_order_id = exchange_order_id.clone();
        order.status = crate::types::OrderStatus::Open;
        self.orders.update(&mut order).await?;
        self.orders.alias(&exchange_order_id, &order.id).await?;

        trade.stop_triggered = true;
        trade.status = TradeStatus::Stopped;
        trade.sell_order_id = order.id.clone();
        trade.updated_at = Utc::now();
        self.store.set_json(&self.keys.trade(trade.id), &trade).await?;

        self.bus.notify_user(trade.user_id, "trade_update", &trade).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::exchange::{PublicWs, RestClient, SummaryTick};
    use crate::market::TickerFanout;
    use crate::store::InMemoryStore;
    use tokio::sync::mpsc;

    fn trade(buy_price: f64, stop_loss_pct: f64) -> AssistedTrade {
        AssistedTrade {
            id: 1,
            user_id: 1,
            pair: "btcidr".to_string(),
            status: TradeStatus::Filled,
            buy_order_id: "buy-1".to_string(),
            buy_price,
            amount: 0.1,
            sell_order_id: String::new(),
            sell_price: 0.0,
            target_profit_pct: 2.0,
            stop_loss_pct,
            stop_triggered: false,
            paper: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_trigger_boundary_is_inclusive() {
        let trade = trade(1_000_000.0, 5.0);
        // Exactly buyPrice * (1 - sl/100).
        assert!(should_trigger(&trade, 950_000.0));
        assert!(should_trigger(&trade, 949_999.0));
        assert!(!should_trigger(&trade, 950_001.0));
    }

    async fn watcher_fixture() -> (Arc<StopLossWatcher>, Arc<InMemoryStore>, Keys, Arc<MarketIngestor>) {
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
            settings.clone(),
            rest,
            store.clone(),
            keys.clone(),
            paper_tx,
        ));
        let orders = Arc::new(OrderRepo::new(store.clone(), keys.clone()));
        let watcher = Arc::new(StopLossWatcher::new(
            store.clone(),
            keys.clone(),
            bus,
            ingestor.clone(),
            factory,
            orders,
        ));
        (watcher, store, keys, ingestor)
    }

    #[tokio::test]
    async fn test_scan_triggers_and_stops_trade() {
        let (watcher, store, keys, ingestor) = watcher_fixture().await;

        let t = trade(1_000_000.0, 5.0);
        store.set_json(&keys.trade(t.id), &t).await.unwrap();
        store.sadd(&keys.trades(), "1").await.unwrap();
        watcher.register(t).await;
        assert_eq!(watcher.watched_count().await, 1);

        // Price above the stop: nothing happens.
        ingestor
            .handle_summary(SummaryTick {
                pair_id: "btcidr".to_string(),
                price: 980_000.0,
                best_bid: 979_000.0,
                best_ask: 981_000.0,
                volume_idr: 1e9,
                trx_count: 1,
                at_ms: 1_000,
            })
            .await
            .unwrap();
        watcher.scan().await;
        assert_eq!(watcher.watched_count().await, 1);

        // Price through the stop: trade is stopped and deregistered.
        ingestor
            .handle_summary(SummaryTick {
                pair_id: "btcidr".to_string(),
                price: 940_000.0,
                best_bid: 939_000.0,
                best_ask: 941_000.0,
                volume_idr: 1e9,
                trx_count: 2,
                at_ms: 2_000,
            })
            .await
            .unwrap();
        watcher.scan().await;
        assert_eq!(watcher.watched_count().await, 0);

        let stored: AssistedTrade = store.get_json(&keys.trade(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Stopped);
        assert!(stored.stop_triggered);
        assert!(!stored.sell_order_id.is_empty());
    }

    #[tokio::test]
    async fn test_restore_only_watches_filled_untriggered() {
        let (watcher, store, keys, _) = watcher_fixture().await;

        let filled = trade(1_000_000.0, 5.0);
        store.set_json(&keys.trade(1), &filled).await.unwrap();
        store.sadd(&keys.trades(), "1").await.unwrap();

        let mut stopped = trade(1_000_000.0, 5.0);
        stopped.id = 2;
        stopped.status = TradeStatus::Stopped;
        stopped.stop_triggered = true;
        store.set_json(&keys.trade(2), &stopped).await.unwrap();
        store.sadd(&keys.trades(), "2").await.unwrap();

        watcher.restore().await.unwrap();
        assert_eq!(watcher.watched_count().await, 1);
    }
}
