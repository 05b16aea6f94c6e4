//! Private order reconciler: one authenticated session per user
//!
//! Routes every order event through the registered generic handlers
//! (bot runtimes), then to the assisted-trade handlers when the order
//! belongs to a trade, then writes the event status back onto the
//! stored order and publishes a per-user order-update notification.
//! Events for orders we never issued are external activity and skipped.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::exchange::wire::{OrderEvent, OrderEventStatus};
use crate::exchange::{PrivateSession, RestClient};
use crate::notify::NotificationBus;
use crate::orders::OrderRepo;
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::trades::AssistedTrades;
use crate::types::{OrderStatus, ParentKind, User};

pub type GenericHandler =
    Arc<dyn Fn(u64, OrderEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Map an event status onto the stored order status.
pub fn map_event_status(event: &OrderEvent) -> OrderStatus {
    match event.status {
        OrderEventStatus::Open => OrderStatus::Open,
        OrderEventStatus::Fill => {
            if event.remaining_qty > 0.0 {
                OrderStatus::Open
            } else {
                OrderStatus::Filled
            }
        }
        OrderEventStatus::Done => OrderStatus::Filled,
        OrderEventStatus::Cancelled => {
            if event.executed_qty > 0.0 {
                OrderStatus::Partial
            } else {
                OrderStatus::Cancelled
            }
        }
    }
}

pub struct OrderReconciler {
    settings: Arc<Settings>,
    rest: Arc<RestClient>,
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    orders: Arc<OrderRepo>,
    trades: Arc<AssistedTrades>,
    sessions: RwLock<HashMap<u64, Arc<PrivateSession>>>,
    handlers: RwLock<Vec<GenericHandler>>,
}

impl OrderReconciler {
    pub fn new(
        settings: Arc<Settings>,
        rest: Arc<RestClient>,
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        orders: Arc<OrderRepo>,
        trades: Arc<AssistedTrades>,
    ) -> Self {
        OrderReconciler {
            settings,
            rest,
            store,
            keys,
            bus,
            orders,
            trades,
            sessions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Bot runtimes register here to see every event for their user.
    pub async fn register_handler(&self, handler: GenericHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// True only after the user's authenticated subscription was
    /// confirmed. Live bot starts must refuse otherwise.
    pub async fn is_subscribed(&self, user_id: u64) -> bool {
        let sessions = self.sessions.read().await;
        sessions.get(&user_id).map(|s| s.is_subscribed()).unwrap_or(false)
    }

    /// Open the private stream for one user. Idempotent: an existing
    /// session is left untouched.
    pub async fn subscribe_user(self: &Arc<Self>, user_id: u64) -> Result<()> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(&user_id) {
                return Ok(());
            }
        }

        let user: User = self
            .store
            .get_json(&self.keys.user(user_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", user_id)))?;
        if !user.key_valid {
            return Err(EngineError::Credential(format!(
                "user {} has no valid exchange key",
                user_id
            )));
        }

        let (session, mut events) = PrivateSession::spawn(
            user_id,
            crate::exchange::ApiCredentials { key: user.api_key, secret: user.api_secret },
            Arc::clone(&self.rest),
            self.settings.private_ws_url.clone(),
        );

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(user_id, Arc::clone(&session));
        }

        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                reconciler.handle_event(user_id, event).await;
            }
            warn!("Order-event pump for user {} ended", user_id);
        });

        session
            .wait_subscribed(Duration::from_secs(self.settings.subscribe_verify_timeout_secs))
            .await
    }

    /// Boot: subscribe every user with a valid key. Failures are logged
    /// and never block boot; the session keeps reconnecting behind the
    /// scenes.
    pub async fn subscribe_all_users(self: &Arc<Self>) {
        let ids = match self.store.smembers(&self.keys.users()).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Cannot enumerate users for private streams: {}", e);
                return;
            }
        };

        for raw_id in ids {
            let Ok(user_id) = raw_id.parse::<u64>() else { continue };
            let reconciler = Arc::clone(self);
            tokio::spawn(async move {
                match reconciler.subscribe_user(user_id).await {
                    Ok(()) => info!("📬 Private stream live for user {}", user_id),
                    Err(e) => warn!("Private stream for user {} not verified: {}", user_id, e),
                }
            });
        }
    }

    /// Paper fills are injected through the same path live events take.
    pub fn spawn_paper_pump(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(u64, OrderEvent)>,
    ) {
        tokio::spawn(async move {
            while let Some((user_id, event)) = rx.recv().await {
                self.handle_event(user_id, event).await;
            }
        });
    }

    pub async fn handle_event(&self, user_id: u64, event: OrderEvent) {
        debug!(
            "Order event for user {}: {} {} {:?}",
            user_id, event.exchange_order_id, event.client_order_id, event.status
        );

        // 1. Generic handlers: bot runtimes reconcile their own state.
        let handlers = {
            let handlers = self.handlers.read().await;
            handlers.clone()
        };
        for handler in handlers {
            handler(user_id, event.clone()).await;
        }

        // 2. Resolve our order record; unknown ids are external activity.
        let order = match self
            .orders
            .find_by_event_keys(&event.client_order_id, &event.exchange_order_id)
            .await
        {
            Ok(Some(order)) => order,
            Ok(None) => {
                debug!("Skipping event for unknown order {}", event.exchange_order_id);
                return;
            }
            Err(e) => {
                error!("Order lookup failed for {}: {}", event.exchange_order_id, e);
                return;
            }
        };

        // 3. Assisted trades get their lifecycle-specific handlers.
        if order.parent_kind == ParentKind::Trade {
            let result = match event.status {
                OrderEventStatus::Fill | OrderEventStatus::Done if event.remaining_qty <= 0.0 => {
                    self.trades.handle_order_filled(&order, &event).await
                }
                OrderEventStatus::Cancelled => {
                    self.trades.handle_order_cancelled(&order, &event).await
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                error!("Assisted-trade handler failed for order {}: {}", order.id, e);
            }
        }

        // 4. Write the event outcome back onto the stored order. The
        //    record is re-read so runtime-handler updates survive.
        let mut stored = match self.orders.get(&order.id).await {
            Ok(Some(stored)) => stored,
            _ => order,
        };
        stored.status = map_event_status(&event);
        if stored.status == OrderStatus::Filled && stored.filled_at.is_none() {
            stored.filled_at = Some(Utc::now());
        }
        if event.executed_qty > stored.filled_amount {
            stored.filled_amount = event.executed_qty;
        }
        if let Err(e) = self.orders.update(&mut stored).await {
            error!("Order status write-back failed for {}: {}", stored.id, e);
            return;
        }

        // 5. Per-user order-update notification.
        self.bus.notify_order_update(user_id, &stored).await;
    }
}
