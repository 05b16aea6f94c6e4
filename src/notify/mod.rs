//! Notification bus: bot/order/position/market deltas onto pub/sub
//!
//! Payloads land on per-user channels or the broadcast channel; a
//! push-to-client bridge outside the core drains them.
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::store::{Keys, KvStore};
use crate::types::{BotOrder, Position};

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    at_ms: i64,
    data: &'a T,
}

pub struct NotificationBus {
    store: Arc<dyn KvStore>,
    keys: Keys,
}

impl NotificationBus {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys) -> Self {
        NotificationBus { store, keys }
    }

    fn envelope<T: Serialize>(kind: &str, data: &T) -> Option<String> {
        let envelope = Envelope {
            kind,
            at_ms: chrono::Utc::now().timestamp_millis(),
            data,
        };
        match serde_json::to_string(&envelope) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Failed to serialize {} notification: {}", kind, e);
                None
            }
        }
    }

    /// Notification failures never propagate into trading paths.
    pub async fn notify_user<T: Serialize>(&self, user_id: u64, kind: &str, data: &T) {
        let Some(payload) = Self::envelope(kind, data) else { return };
        if let Err(e) = self.store.publish(&self.keys.ws_user(user_id), &payload).await {
            warn!("Dropping {} notification for user {}: {}", kind, user_id, e);
        }
    }

    pub async fn broadcast<T: Serialize>(&self, kind: &str, data: &T) {
        let Some(payload) = Self::envelope(kind, data) else { return };
        if let Err(e) = self.store.publish(&self.keys.ws_broadcast(), &payload).await {
            warn!("Dropping {} broadcast: {}", kind, e);
        }
    }

    pub async fn notify_order_update(&self, user_id: u64, order: &BotOrder) {
        self.notify_user(user_id, "order_update", order).await;
    }

    pub async fn notify_bot_update<T: Serialize>(&self, user_id: u64, update: &T) {
        self.notify_user(user_id, "bot_update", update).await;
    }

    pub async fn notify_position_update(&self, user_id: u64, position: &Position) {
        self.notify_user(user_id, "position_update", position).await;
    }

    pub async fn notify_pump_signal<T: Serialize>(&self, user_id: u64, signal: &T) {
        self.notify_user(user_id, "pump_signal", signal).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_notify_user_publishes_envelope() {
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::new("test");
        let bus = NotificationBus::new(store.clone(), keys.clone());

        let mut rx = store.subscribe(&keys.ws_user(5)).await.unwrap();
        bus.notify_user(5, "bot_update", &serde_json::json!({"bot_id": 3})).await;

        let (_, payload) = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "bot_update");
        assert_eq!(value["data"]["bot_id"], 3);
        assert!(value["at_ms"].is_i64());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_broadcast_channel() {
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::new("test");
        let bus = NotificationBus::new(store.clone(), keys.clone());

        let mut rx = store.subscribe(&keys.ws_broadcast()).await.unwrap();
        bus.broadcast("market_update", &serde_json::json!([{"pair": "btcidr"}])).await;

        let (_, payload) = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "market_update");
    }
}
