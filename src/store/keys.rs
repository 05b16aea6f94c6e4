//! Centralized key construction so naming never spreads across components
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Keys { prefix: prefix.into() }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub fn user(&self, id: u64) -> String {
        self.key(&format!("user:{}", id))
    }

    pub fn user_by_username(&self, name: &str) -> String {
        self.key(&format!("user:by-username:{}", name))
    }

    /// Set of every known user id.
    pub fn users(&self) -> String {
        self.key("users")
    }

    pub fn order(&self, id: &str) -> String {
        self.key(&format!("order:{}", id))
    }

    /// Reverse index from our client order id to the internal order id.
    pub fn order_by_client_id(&self, client_order_id: &str) -> String {
        self.key(&format!("order:by-client:{}", client_order_id))
    }

    pub fn position(&self, id: u64) -> String {
        self.key(&format!("position:{}", id))
    }

    /// Sorted set of order ids belonging to a position, scored by timestamp.
    pub fn position_orders(&self, id: u64) -> String {
        self.key(&format!("position:{}:orders", id))
    }

    /// Set of active position ids per bot.
    pub fn bot_positions(&self, bot_id: u64) -> String {
        self.key(&format!("bot:{}:positions", bot_id))
    }

    pub fn bot(&self, id: u64) -> String {
        self.key(&format!("bot:{}", id))
    }

    /// Sorted set of order ids belonging to a bot, scored by timestamp.
    pub fn bot_orders(&self, id: u64) -> String {
        self.key(&format!("bot:{}:orders", id))
    }

    /// Set of every known bot id.
    pub fn bots(&self) -> String {
        self.key("bots")
    }

    /// Reverse lookup of orders per user and parent kind.
    pub fn user_orders(&self, user_id: u64, parent_kind: &str) -> String {
        self.key(&format!("user:{}:orders:{}", user_id, parent_kind))
    }

    pub fn trade(&self, id: u64) -> String {
        self.key(&format!("trade:{}", id))
    }

    /// Set of every known assisted-trade id.
    pub fn trades(&self) -> String {
        self.key("trades")
    }

    pub fn coin(&self, pair_id: &str) -> String {
        self.key(&format!("coin:{}", pair_id))
    }

    pub fn pair(&self, pair_id: &str) -> String {
        self.key(&format!("pair:{}", pair_id))
    }

    pub fn pairs(&self) -> String {
        self.key("pairs")
    }

    pub fn pump_score_rank(&self) -> String {
        self.key("pump-score:rank")
    }

    pub fn gap_rank(&self) -> String {
        self.key("gap:rank")
    }

    pub fn ws_user(&self, user_id: u64) -> String {
        self.key(&format!("ws:user:{}", user_id))
    }

    pub fn ws_broadcast(&self) -> String {
        self.key("ws:broadcast")
    }

    /// Monotonic id counter per entity kind.
    pub fn id_counter(&self, entity: &str) -> String {
        self.key(&format!("id:{}", entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let keys = Keys::new("idrbot");
        assert_eq!(keys.bot(7), "idrbot:bot:7");
        assert_eq!(keys.bot_orders(7), "idrbot:bot:7:orders");
        assert_eq!(keys.coin("btcidr"), "idrbot:coin:btcidr");
        assert_eq!(keys.pump_score_rank(), "idrbot:pump-score:rank");
        assert_eq!(keys.ws_user(3), "idrbot:ws:user:3");
        assert_eq!(keys.ws_broadcast(), "idrbot:ws:broadcast");
        assert_eq!(keys.user_by_username("alice"), "idrbot:user:by-username:alice");
    }
}
