//! Builds the right executor for a bot or trade
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{LiveExecutor, PaperExecutor, TradeExecutor};
use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::exchange::wire::OrderEvent;
use crate::exchange::{ApiCredentials, RestClient};
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::types::{BotConfig, User};

pub struct ExecutorFactory {
    settings: Arc<Settings>,
    rest: Arc<RestClient>,
    store: Arc<dyn KvStore>,
    keys: Keys,
    /// Simulated fills are injected into the reconciler through here.
    paper_sink: mpsc::UnboundedSender<(u64, OrderEvent)>,
}

impl ExecutorFactory {
    pub fn new(
        settings: Arc<Settings>,
        rest: Arc<RestClient>,
        store: Arc<dyn KvStore>,
        keys: Keys,
        paper_sink: mpsc::UnboundedSender<(u64, OrderEvent)>,
    ) -> Self {
        ExecutorFactory { settings, rest, store, keys, paper_sink }
    }

    pub async fn credentials_for_user(&self, user_id: u64) -> Result<ApiCredentials> {
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
        Ok(ApiCredentials { key: user.api_key, secret: user.api_secret })
    }

    pub async fn live_for_user(&self, user_id: u64) -> Result<Arc<dyn TradeExecutor>> {
        let creds = self.credentials_for_user(user_id).await?;
        Ok(Arc::new(LiveExecutor::new(Arc::clone(&self.rest), creds)))
    }

    pub fn paper_for_user(
        &self,
        user_id: u64,
        initial_balances: HashMap<String, f64>,
    ) -> Arc<dyn TradeExecutor> {
        Arc::new(PaperExecutor::new(
            user_id,
            initial_balances,
            Duration::from_secs(self.settings.paper_fill_delay_secs),
            self.paper_sink.clone(),
        ))
    }

    pub async fn for_bot(&self, bot: &BotConfig) -> Result<Arc<dyn TradeExecutor>> {
        if bot.paper {
            Ok(self.paper_for_user(bot.user_id, bot.balances.clone()))
        } else {
            self.live_for_user(bot.user_id).await
        }
    }

    pub async fn for_user(&self, user_id: u64, paper: bool) -> Result<Arc<dyn TradeExecutor>> {
        if paper {
            Ok(self.paper_for_user(user_id, HashMap::new()))
        } else {
            self.live_for_user(user_id).await
        }
    }
}
