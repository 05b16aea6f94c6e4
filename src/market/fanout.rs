//! Reference-counted fan-out of ticker channels to bot runtimes
//!
//! Delivery is non-blocking: a subscriber whose inbound buffer is full
//! loses that update, and runtimes drain to the freshest entry anyway.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::exchange::PublicWs;
use crate::types::{BookTicker, Coin};

pub type SubscriptionId = u64;

struct BookSubscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<BookTicker>,
}

struct CoinSubscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Coin>,
}

pub struct TickerFanout {
    public_ws: Arc<PublicWs>,
    books: RwLock<HashMap<String, Vec<BookSubscriber>>>,
    coins: RwLock<Vec<CoinSubscriber>>,
    next_id: AtomicU64,
}

impl TickerFanout {
    pub fn new(public_ws: Arc<PublicWs>) -> Self {
        TickerFanout {
            public_ws,
            books: RwLock::new(HashMap::new()),
            coins: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to per-pair order-book tickers. The upstream channel is
    /// activated for the first subscriber only.
    pub async fn subscribe_book(
        &self,
        pair: &str,
        tx: mpsc::Sender<BookTicker>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut books = self.books.write().await;
            let subs = books.entry(pair.to_string()).or_default();
            subs.push(BookSubscriber { id, tx });
            subs.len() == 1
        };
        if first {
            info!("📡 First subscriber for {}, opening book channel", pair);
            self.public_ws.subscribe_book(pair).await;
        }
        id
    }

    /// Remove a book subscription; tears the upstream channel down on
    /// the last release.
    pub async fn unsubscribe_book(&self, pair: &str, id: SubscriptionId) {
        let empty = {
            let mut books = self.books.write().await;
            let Some(subs) = books.get_mut(pair) else { return };
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                books.remove(pair);
                true
            } else {
                false
            }
        };
        if empty {
            info!("📡 Last subscriber for {} gone, closing book channel", pair);
            self.public_ws.unsubscribe_book(pair).await;
        }
    }

    /// Subscribe to every coin update (whole-market scanners).
    pub async fn subscribe_coins(&self, tx: mpsc::Sender<Coin>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut coins = self.coins.write().await;
        coins.push(CoinSubscriber { id, tx });
        id
    }

    pub async fn unsubscribe_coins(&self, id: SubscriptionId) {
        let mut coins = self.coins.write().await;
        coins.retain(|s| s.id != id);
    }

    pub async fn publish_book(&self, ticker: &BookTicker) {
        let books = self.books.read().await;
        if let Some(subs) = books.get(&ticker.pair_id) {
            for sub in subs {
                if sub.tx.try_send(ticker.clone()).is_err() {
                    debug!("Book subscriber {} full, dropping update", sub.id);
                }
            }
        }
    }

    pub async fn publish_coin(&self, coin: &Coin) {
        let coins = self.coins.read().await;
        for sub in coins.iter() {
            if sub.tx.try_send(coin.clone()).is_err() {
                debug!("Coin subscriber {} full, dropping update", sub.id);
            }
        }
    }
}
