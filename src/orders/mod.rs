//! Persistence of bot-issued orders and their lookup indexes
use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::exchange::numeric_order_suffix;
use crate::store::{Keys, KvOp, KvStore, KvStoreExt};
use crate::types::{BotOrder, OrderStatus, ParentKind};

/// Typed access to order records. Every order is a JSON blob under
/// `order:{id}`, indexed by parent in a timestamp-scored sorted set, by
/// `(user, parent kind)` for reverse lookup, and by every key the
/// private stream may match it with.
pub struct OrderRepo {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl OrderRepo {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        OrderRepo { store, keys }
    }

    fn parent_index_key(&self, order: &BotOrder) -> String {
        match order.parent_kind {
            ParentKind::Position => self.keys.position_orders(order.parent_id),
            _ => self.keys.bot_orders(order.parent_id),
        }
    }

    /// Persist a new order with all of its indexes in one batch.
    pub async fn insert(&self, order: &BotOrder) -> Result<()> {
        let raw = serde_json::to_string(order)?;
        let ts = order.created_at.timestamp_millis() as f64;
        self.store
            .pipeline(vec![
                KvOp::Set { key: self.keys.order(&order.id), value: raw },
                KvOp::ZAdd {
                    key: self.parent_index_key(order),
                    member: order.id.clone(),
                    score: ts,
                },
                KvOp::ZAdd {
                    key: self.keys.user_orders(order.user_id, order.parent_kind.as_str()),
                    member: order.id.clone(),
                    score: ts,
                },
                KvOp::Set {
                    key: self.keys.order_by_client_id(&order.client_order_id),
                    value: order.id.clone(),
                },
            ])
            .await
    }

    /// Register an additional exchange-side id for an already-stored
    /// order, so stream events carrying it still resolve.
    pub async fn alias(&self, match_key: &str, order_id: &str) -> Result<()> {
        self.store
            .set(&self.keys.order_by_client_id(match_key), order_id)
            .await
    }

    pub async fn update(&self, order: &mut BotOrder) -> Result<()> {
        order.updated_at = Utc::now();
        self.store.set_json(&self.keys.order(&order.id), order).await
    }

    pub async fn get(&self, order_id: &str) -> Result<Option<BotOrder>> {
        self.store.get_json(&self.keys.order(order_id)).await
    }

    async fn resolve_key(&self, match_key: &str) -> Result<Option<BotOrder>> {
        let Some(order_id) = self.store.get(&self.keys.order_by_client_id(match_key)).await? else {
            return Ok(None);
        };
        self.get(&order_id).await
    }

    /// Resolve a private-stream event to our order record: direct match
    /// on the echoed client order id, then on the raw exchange id, then
    /// on its numeric suffix.
    pub async fn find_by_event_keys(
        &self,
        client_order_id: &str,
        exchange_order_id: &str,
    ) -> Result<Option<BotOrder>> {
        if !client_order_id.is_empty() {
            if let Some(order) = self.resolve_key(client_order_id).await? {
                return Ok(Some(order));
            }
        }
        if let Some(order) = self.resolve_key(exchange_order_id).await? {
            return Ok(Some(order));
        }
        if let Some(numeric) = numeric_order_suffix(exchange_order_id) {
            if let Some(order) = self.resolve_key(&numeric.to_string()).await? {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    /// All orders of a bot, newest first.
    pub async fn orders_for_bot(&self, bot_id: u64) -> Result<Vec<BotOrder>> {
        let ids = self.store.zrevrange(&self.keys.bot_orders(bot_id), 0, -1).await?;
        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(order) = self.get(&id).await? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    /// Non-terminal orders of a bot, newest first.
    pub async fn open_orders_for_bot(&self, bot_id: u64) -> Result<Vec<BotOrder>> {
        Ok(self
            .orders_for_bot(bot_id)
            .await?
            .into_iter()
            .filter(|o| !o.status.is_terminal())
            .collect())
    }

    pub async fn latest_order_for_bot(&self, bot_id: u64) -> Result<Option<BotOrder>> {
        let ids = self.store.zrevrange(&self.keys.bot_orders(bot_id), 0, 0).await?;
        match ids.first() {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }
}

/// Build a fresh order record in `pending` state.
#[allow(clippy::too_many_arguments)]
pub fn new_order(
    user_id: u64,
    parent_kind: ParentKind,
    parent_id: u64,
    client_order_id: String,
    pair: String,
    side: crate::types::Side,
    order_type: crate::types::OrderType,
    price: f64,
    amount: f64,
    paper: bool,
) -> BotOrder {
    let now = Utc::now();
    BotOrder {
        id: uuid::Uuid::new_v4().to_string(),
        user_id,
        parent_kind,
        parent_id,
        client_order_id,
        exchange_order_id: String::new(),
        pair,
        side,
        order_type,
        status: OrderStatus::Pending,
        price,
        amount,
        filled_amount: 0.0,
        paper,
        created_at: now,
        updated_at: now,
        filled_at: None,
    }
}
