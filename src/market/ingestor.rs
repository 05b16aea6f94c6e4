//! Market-data ingestor: public stream in, per-pair coins out
//!
//! Owns every `Coin`. Each summary tick updates the top-of-book fields,
//! rolls the {1m, 5m, 15m, 30m} windows, recomputes the pump score and
//! the rank sorted sets, then fans the snapshot out to subscribers.
//! Broadcast market updates are batched on a flush tick so the
//! broadcast channel carries one message per interval, not per tick.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};

use super::fanout::TickerFanout;
use crate::config::Settings;
use crate::error::Result;
use crate::exchange::{PublicMessage, SummaryTick};
use crate::notify::NotificationBus;
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::types::{Coin, Timeframe};

/// Transaction-count amplification: monotone in `trx`, diminishing
/// returns through the log, hard-capped.
pub fn tx_boost(trx: u64, divisor: f64, cap: f64) -> f64 {
    (1.0 + (1.0 + trx as f64).ln() / divisor).min(cap)
}

/// Composite pump score: per-timeframe percent change, amplified by the
/// window's transaction count and weighted by timeframe length.
pub fn pump_score(coin: &Coin, divisor: f64, cap: f64) -> f64 {
    Timeframe::ALL
        .iter()
        .map(|tf| {
            let window = coin.window(*tf);
            window.change_pct() * tx_boost(window.trx_count, divisor, cap) * tf.weight()
        })
        .sum()
}

pub struct MarketIngestor {
    settings: Arc<Settings>,
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    fanout: Arc<TickerFanout>,
    coins: RwLock<HashMap<String, Coin>>,
    /// Last cumulative transaction count seen per pair, for deltas.
    last_trx: RwLock<HashMap<String, u64>>,
    /// Latest snapshot per pair since the last broadcast flush.
    pending_broadcast: RwLock<HashMap<String, Coin>>,
}

impl MarketIngestor {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        fanout: Arc<TickerFanout>,
    ) -> Self {
        MarketIngestor {
            settings,
            store,
            keys,
            bus,
            fanout,
            coins: RwLock::new(HashMap::new()),
            last_trx: RwLock::new(HashMap::new()),
            pending_broadcast: RwLock::new(HashMap::new()),
        }
    }

    /// Start the stream consumer and the broadcast flush tick.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PublicMessage>) {
        let consumer = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    PublicMessage::Summary(tick) => {
                        if let Err(e) = consumer.handle_summary(tick).await {
                            error!("Ingestor tick failed: {}", e);
                        }
                    }
                    PublicMessage::Book(ticker) => {
                        consumer.fanout.publish_book(&ticker).await;
                    }
                }
            }
            info!("Ingestor stream ended");
        });

        let flusher = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                flusher.settings.market_broadcast_interval_secs,
            ));
            loop {
                tick.tick().await;
                flusher.flush_broadcast().await;
            }
        });
    }

    /// Read-only snapshot for consumers outside the ingestor.
    pub async fn coin(&self, pair_id: &str) -> Option<Coin> {
        let coins = self.coins.read().await;
        coins.get(pair_id).cloned()
    }

    pub async fn price_of(&self, pair_id: &str) -> Option<f64> {
        self.coin(pair_id).await.map(|c| c.price)
    }

    pub async fn handle_summary(&self, tick: SummaryTick) -> Result<()> {
        let now_ms = if tick.at_ms > 0 {
            tick.at_ms
        } else {
            chrono::Utc::now().timestamp_millis()
        };

        let trx_delta = {
            let mut last = self.last_trx.write().await;
            let previous = last.insert(tick.pair_id.clone(), tick.trx_count);
            match previous {
                Some(prev) => tick.trx_count.saturating_sub(prev),
                None => 0,
            }
        };

        let snapshot = {
            let mut coins = self.coins.write().await;
            let coin = coins.entry(tick.pair_id.clone()).or_insert_with(|| Coin {
                pair_id: tick.pair_id.clone(),
                ..Default::default()
            });

            coin.price = tick.price;
            coin.best_bid = tick.best_bid;
            coin.best_ask = tick.best_ask;
            coin.volume_idr = tick.volume_idr;
            coin.gap_pct = if tick.best_bid > 0.0 {
                (tick.best_ask - tick.best_bid) / tick.best_bid * 100.0
            } else {
                0.0
            };

            for tf in Timeframe::ALL {
                let window = coin.window_mut(tf);
                if window.window_start_ms == 0 {
                    // First tick ever seen for the pair defines the open.
                    window.open = tick.price;
                    window.close = tick.price;
                    window.trx_count = trx_delta;
                    window.window_start_ms = now_ms;
                } else if now_ms >= window.window_start_ms + tf.duration_secs() * 1000 {
                    window.open = window.close;
                    window.close = tick.price;
                    window.trx_count = trx_delta;
                    window.window_start_ms = now_ms;
                } else {
                    window.close = tick.price;
                    window.trx_count += trx_delta;
                }
            }

            coin.volatility_1m = if coin.tf_1m.open > 0.0 {
                (coin.tf_1m.close - coin.tf_1m.open).abs() / coin.tf_1m.open * 100.0
            } else {
                0.0
            };
            coin.pump_score = pump_score(
                coin,
                self.settings.pump_trx_divisor,
                self.settings.pump_trx_boost_cap,
            );
            coin.updated_at_ms = now_ms;
            coin.clone()
        };

        self.store
            .set_json(&self.keys.coin(&snapshot.pair_id), &snapshot)
            .await?;
        self.store
            .zadd(&self.keys.pump_score_rank(), &snapshot.pair_id, snapshot.pump_score)
            .await?;
        self.store
            .zadd(&self.keys.gap_rank(), &snapshot.pair_id, snapshot.gap_pct)
            .await?;

        self.fanout.publish_coin(&snapshot).await;

        {
            let mut pending = self.pending_broadcast.write().await;
            pending.insert(snapshot.pair_id.clone(), snapshot);
        }

        Ok(())
    }

    /// One broadcast per flush, carrying the freshest snapshot per pair.
    pub async fn flush_broadcast(&self) {
        let batch: Vec<Coin> = {
            let mut pending = self.pending_broadcast.write().await;
            if pending.is_empty() {
                return;
            }
            pending.drain().map(|(_, coin)| coin).collect()
        };
        self.bus.broadcast("market_update", &batch).await;
    }
}
