//! Bot lifecycle: create / update / delete / start / stop
//!
//! The registry write-lock is held only across map mutation. Long work
//! (exchange reconciliation on start, order cancellation on stop) runs
//! outside it, and stop never waits on network I/O: cleanup goes into a
//! background task with a bounded timeout.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};

use super::momentum::MomentumHunterBot;
use super::spread::SpreadMakerBot;
use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::executor::ExecutorFactory;
use crate::market::{SubscriptionId, TickerFanout};
use crate::notify::NotificationBus;
use crate::orders::OrderRepo;
use crate::reconciler::OrderReconciler;
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::types::{
    BotConfig, BotKind, BotRules, BotStats, BotStatus, CostBasis, PairInfo, QUOTE_CURRENCY,
};

/// Everything a caller supplies to create a bot.
#[derive(Debug, Clone)]
pub struct CreateBot {
    pub user_id: u64,
    pub name: String,
    pub kind: BotKind,
    pub pair: String,
    pub paper: bool,
    pub initial_balance_idr: f64,
    pub max_loss_idr: f64,
    pub rules: BotRules,
}

enum BotInstance {
    Spread {
        bot: Arc<SpreadMakerBot>,
        stop: Arc<watch::Sender<bool>>,
        subscription: SubscriptionId,
        pair: String,
    },
    Momentum {
        bot: Arc<MomentumHunterBot>,
        stop: Arc<watch::Sender<bool>>,
        subscription: SubscriptionId,
    },
}

pub struct BotManager {
    settings: Arc<Settings>,
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    orders: Arc<OrderRepo>,
    factory: Arc<ExecutorFactory>,
    reconciler: Arc<OrderReconciler>,
    fanout: Arc<TickerFanout>,
    instances: RwLock<HashMap<u64, BotInstance>>,
}

impl BotManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        orders: Arc<OrderRepo>,
        factory: Arc<ExecutorFactory>,
        reconciler: Arc<OrderReconciler>,
        fanout: Arc<TickerFanout>,
    ) -> Self {
        BotManager {
            settings,
            store,
            keys,
            bus,
            orders,
            factory,
            reconciler,
            fanout,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Route every private-stream event to the running instances.
    pub async fn register_with_reconciler(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.reconciler
            .register_handler(Arc::new(move |user_id, event| {
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    let instances = manager.instances.read().await;
                    for instance in instances.values() {
                        match instance {
                            BotInstance::Spread { bot, .. } => {
                                bot.on_order_event(user_id, &event).await;
                            }
                            BotInstance::Momentum { bot, .. } => {
                                bot.on_order_event(user_id, &event).await;
                            }
                        }
                    }
                })
            }))
            .await;
    }

    pub async fn get_bot(&self, bot_id: u64) -> Result<BotConfig> {
        self.store
            .get_json(&self.keys.bot(bot_id))
            .await?
            .ok_or_else(|| EngineError::BotNotFound(bot_id.to_string()))
    }

    async fn save_bot(&self, bot: &mut BotConfig) -> Result<()> {
        bot.updated_at = Utc::now();
        self.store.set_json(&self.keys.bot(bot.id), bot).await?;
        self.store.sadd(&self.keys.bots(), &bot.id.to_string()).await
    }

    async fn all_bots(&self) -> Result<Vec<BotConfig>> {
        let ids = self.store.smembers(&self.keys.bots()).await?;
        let mut bots = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(bot_id) = id.parse::<u64>() else { continue };
            if let Some(bot) = self.store.get_json(&self.keys.bot(bot_id)).await? {
                bots.push(bot);
            }
        }
        Ok(bots)
    }

    pub async fn create_bot(&self, req: CreateBot) -> Result<BotConfig> {
        if req.initial_balance_idr <= 0.0 {
            return Err(EngineError::InvalidParameter(
                "initial allocation must be positive".to_string(),
            ));
        }
        let kind_matches_rules = matches!(
            (&req.kind, &req.rules),
            (BotKind::SpreadMaker, BotRules::Spread(_))
                | (BotKind::MomentumHunter, BotRules::Momentum(_))
        );
        if !kind_matches_rules {
            return Err(EngineError::InvalidParameter(
                "rule bundle does not match bot kind".to_string(),
            ));
        }
        if req.kind == BotKind::SpreadMaker {
            let pair: Option<PairInfo> = self.store.get_json(&self.keys.pair(&req.pair)).await?;
            if pair.is_none() {
                return Err(EngineError::UnknownPair(req.pair.clone()));
            }
        }

        // At most one bot per (owner, kind, pair, paper).
        for existing in self.all_bots().await? {
            if existing.user_id == req.user_id
                && existing.kind == req.kind
                && existing.pair == req.pair
                && existing.paper == req.paper
            {
                return Err(EngineError::DuplicateBot(format!(
                    "user {} already has a {} bot on {}",
                    req.user_id,
                    req.kind.as_str(),
                    req.pair
                )));
            }
        }

        let id = self.store.incr(&self.keys.id_counter("bot")).await?;
        let mut balances = HashMap::new();
        balances.insert(QUOTE_CURRENCY.to_string(), req.initial_balance_idr);

        let now = Utc::now();
        let mut bot = BotConfig {
            id,
            user_id: req.user_id,
            name: req.name,
            kind: req.kind,
            pair: req.pair,
            paper: req.paper,
            initial_balance_idr: req.initial_balance_idr,
            balances,
            status: BotStatus::Stopped,
            max_loss_idr: req.max_loss_idr,
            rules: req.rules,
            stats: BotStats::default(),
            cost_basis: CostBasis::default(),
            created_at: now,
            updated_at: now,
        };
        self.save_bot(&mut bot).await?;

        info!("Created {} bot {} for user {}", bot.kind.as_str(), bot.id, bot.user_id);
        self.bus.notify_bot_update(bot.user_id, &bot).await;
        Ok(bot)
    }

    pub async fn update_bot(
        &self,
        bot_id: u64,
        name: Option<String>,
        max_loss_idr: Option<f64>,
        rules: Option<BotRules>,
    ) -> Result<BotConfig> {
        let mut bot = self.get_bot(bot_id).await?;
        if bot.status == BotStatus::Running {
            return Err(EngineError::BotRunning(bot_id.to_string()));
        }
        if let Some(name) = name {
            bot.name = name;
        }
        if let Some(max_loss) = max_loss_idr {
            bot.max_loss_idr = max_loss;
        }
        if let Some(rules) = rules {
            let matches_kind = matches!(
                (&bot.kind, &rules),
                (BotKind::SpreadMaker, BotRules::Spread(_))
                    | (BotKind::MomentumHunter, BotRules::Momentum(_))
            );
            if !matches_kind {
                return Err(EngineError::InvalidParameter(
                    "rule bundle does not match bot kind".to_string(),
                ));
            }
            bot.rules = rules;
        }
        self.save_bot(&mut bot).await?;
        self.bus.notify_bot_update(bot.user_id, &bot).await;
        Ok(bot)
    }

    pub async fn delete_bot(&self, bot_id: u64) -> Result<()> {
        let bot = self.get_bot(bot_id).await?;
        if bot.status == BotStatus::Running {
            return Err(EngineError::BotRunning(bot_id.to_string()));
        }
        self.store.del(&self.keys.bot(bot_id)).await?;
        self.store.srem(&self.keys.bots(), &bot_id.to_string()).await?;
        info!("Deleted bot {}", bot_id);
        Ok(())
    }

    pub async fn start_bot(self: &Arc<Self>, bot_id: u64) -> Result<()> {
        let mut bot = self.get_bot(bot_id).await?;
        {
            let instances = self.instances.read().await;
            if instances.contains_key(&bot_id) {
                return Err(EngineError::BotRunning(bot_id.to_string()));
            }
        }
        if bot.status == BotStatus::Running {
            return Err(EngineError::BotRunning(bot_id.to_string()));
        }

        // Live trading is gated on a verified private-stream session.
        if !bot.paper {
            let _ = self.reconciler.subscribe_user(bot.user_id).await;
            if !self.reconciler.is_subscribed(bot.user_id).await {
                return Err(EngineError::NotSubscribed(format!(
                    "user {} order stream not confirmed",
                    bot.user_id
                )));
            }
        }

        bot.status = BotStatus::Running;
        self.save_bot(&mut bot).await?;
        self.bus.notify_bot_update(bot.user_id, &bot).await;

        if let Err(e) = self.spawn_instance(bot.clone()).await {
            // Roll the status back so the bot is not stranded Running.
            bot.status = BotStatus::Error;
            self.save_bot(&mut bot).await?;
            return Err(e);
        }
        info!("▶ Bot {} started", bot_id);
        Ok(())
    }

    /// Build and register the runtime. All slow work happens before the
    /// registry lock is taken.
    async fn spawn_instance(self: &Arc<Self>, bot: BotConfig) -> Result<()> {
        let executor = self.factory.for_bot(&bot).await?;
        let stop = Arc::new(watch::channel(false).0);
        let bot_id = bot.id;

        let instance = match bot.kind {
            BotKind::SpreadMaker => {
                let pair_info: PairInfo = self
                    .store
                    .get_json(&self.keys.pair(&bot.pair))
                    .await?
                    .ok_or_else(|| EngineError::UnknownPair(bot.pair.clone()))?;
                let pair = pair_info.id.clone();

                let runtime = Arc::new(SpreadMakerBot::new(
                    Arc::clone(&self.settings),
                    Arc::clone(&self.store),
                    self.keys.clone(),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.orders),
                    executor,
                    pair_info,
                    bot,
                    Arc::clone(&stop),
                ));
                runtime.restore().await?;

                let (ticker_tx, ticker_rx) = mpsc::channel(10);
                let subscription = self.fanout.subscribe_book(&pair, ticker_tx).await;
                Arc::clone(&runtime).spawn(ticker_rx);

                BotInstance::Spread { bot: runtime, stop, subscription, pair }
            }
            BotKind::MomentumHunter => {
                let mut pairs = HashMap::new();
                for pair_id in self.store.smembers(&self.keys.pairs()).await? {
                    if let Some(info) = self.store.get_json(&self.keys.pair(&pair_id)).await? {
                        pairs.insert(pair_id, info);
                    }
                }

                let runtime = Arc::new(MomentumHunterBot::new(
                    Arc::clone(&self.settings),
                    Arc::clone(&self.store),
                    self.keys.clone(),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.orders),
                    executor,
                    pairs,
                    bot,
                    Arc::clone(&stop),
                ));
                runtime.restore().await?;

                let (coin_tx, coin_rx) = mpsc::channel(256);
                let subscription = self.fanout.subscribe_coins(coin_tx).await;
                Arc::clone(&runtime).spawn(coin_rx);

                BotInstance::Momentum { bot: runtime, stop, subscription }
            }
        };

        let mut instances = self.instances.write().await;
        instances.insert(bot_id, instance);
        Ok(())
    }

    /// Idempotent, never blocks on network I/O. Cleanup (cancelling the
    /// working orders, restoring funds, unsubscribing) runs in a
    /// background task bounded by the configured timeout.
    pub async fn stop_bot(&self, bot_id: u64) -> Result<()> {
        let instance = {
            let mut instances = self.instances.write().await;
            instances.remove(&bot_id)
        };

        let Some(instance) = instance else {
            // No runtime: double-stop, or operator cleanup of a bot left
            // Running by an unclean shutdown.
            if let Ok(mut bot) = self.get_bot(bot_id).await {
                if bot.status == BotStatus::Running {
                    bot.status = BotStatus::Stopped;
                    self.save_bot(&mut bot).await?;
                }
            }
            return Ok(());
        };

        let timeout = std::time::Duration::from_secs(self.settings.stop_cleanup_timeout_secs);
        let fanout = Arc::clone(&self.fanout);
        match instance {
            BotInstance::Spread { bot, stop, subscription, pair } => {
                stop.send_replace(true);
                tokio::spawn(async move {
                    if tokio::time::timeout(timeout, bot.shutdown()).await.is_err() {
                        warn!("Bot {} cleanup timed out", bot_id);
                    }
                    fanout.unsubscribe_book(&pair, subscription).await;
                });
            }
            BotInstance::Momentum { bot, stop, subscription } => {
                stop.send_replace(true);
                tokio::spawn(async move {
                    if tokio::time::timeout(timeout, bot.shutdown()).await.is_err() {
                        warn!("Bot {} cleanup timed out", bot_id);
                    }
                    fanout.unsubscribe_coins(subscription).await;
                });
            }
        }

        info!("⏹ Bot {} stopped", bot_id);
        Ok(())
    }

    pub async fn is_running(&self, bot_id: u64) -> bool {
        let instances = self.instances.read().await;
        instances.contains_key(&bot_id)
    }

    /// Boot: bring every bot persisted as Running back up.
    pub async fn resume_running_bots(self: &Arc<Self>) {
        let bots = match self.all_bots().await {
            Ok(bots) => bots,
            Err(e) => {
                error!("Cannot enumerate bots for resume: {}", e);
                return;
            }
        };
        for bot in bots {
            if bot.status != BotStatus::Running {
                continue;
            }
            if self.is_running(bot.id).await {
                continue;
            }
            info!("Resuming bot {} ({})", bot.id, bot.kind.as_str());
            if let Err(e) = self.spawn_instance(bot.clone()).await {
                error!("Resume of bot {} failed: {}", bot.id, e);
                let mut bot = bot;
                bot.status = BotStatus::Error;
                let _ = self.save_bot(&mut bot).await;
            }
        }
    }

    /// Background sweeper: walks Spread Maker order books for stale or
    /// duplicate open orders, and prunes registry entries whose bot
    /// stopped itself (bounded loss, credential failure).
    pub fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                self.settings.sweeper_interval_secs,
            ));
            loop {
                tick.tick().await;
                self.sweep_once().await;
            }
        });
    }

    pub async fn sweep_once(&self) {
        let spread_bots: Vec<(u64, Arc<SpreadMakerBot>)> = {
            let instances = self.instances.read().await;
            instances
                .iter()
                .filter_map(|(id, instance)| match instance {
                    BotInstance::Spread { bot, .. } => Some((*id, Arc::clone(bot))),
                    _ => None,
                })
                .collect()
        };
        for (bot_id, bot) in spread_bots {
            if let Err(e) = bot.sweep().await {
                error!("Sweep for bot {} failed: {}", bot_id, e);
            }
        }

        // Self-stopped runtimes leave the registry here.
        let ids: Vec<u64> = {
            let instances = self.instances.read().await;
            instances.keys().copied().collect()
        };
        for bot_id in ids {
            match self.get_bot(bot_id).await {
                Ok(bot) if bot.status != BotStatus::Running => {
                    let _ = self.stop_bot(bot_id).await;
                }
                Err(_) => {
                    let _ = self.stop_bot(bot_id).await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PublicWs, RestClient};
    use crate::market::MarketIngestor;
    use crate::store::InMemoryStore;
    use crate::trades::AssistedTrades;
    use crate::types::SpreadRules;
    use crate::watcher::StopLossWatcher;

    async fn manager() -> (Arc<BotManager>, Arc<InMemoryStore>, Keys) {
        let settings = Arc::new(Settings::default());
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::new("test");
        let bus = Arc::new(NotificationBus::new(store.clone(), keys.clone()));
        let rest = Arc::new(RestClient::new(&settings));
        let orders = Arc::new(OrderRepo::new(store.clone(), keys.clone()));
        let (ws, _rx) = PublicWs::spawn("wss://invalid.test/ws".to_string());
        let fanout = Arc::new(TickerFanout::new(ws));
        let ingestor = Arc::new(MarketIngestor::new(
            settings.clone(),
            store.clone(),
            keys.clone(),
            bus.clone(),
            Arc::clone(&fanout),
        ));
        let (paper_tx, paper_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(ExecutorFactory::new(
            settings.clone(),
            rest.clone(),
            store.clone(),
            keys.clone(),
            paper_tx,
        ));
        let watcher = Arc::new(StopLossWatcher::new(
            store.clone(),
            keys.clone(),
            bus.clone(),
            ingestor,
            Arc::clone(&factory),
            orders.clone(),
        ));
        let trades = Arc::new(AssistedTrades::new(
            store.clone(),
            keys.clone(),
            bus.clone(),
            watcher,
        ));
        let reconciler = Arc::new(OrderReconciler::new(
            settings.clone(),
            rest,
            store.clone(),
            keys.clone(),
            bus.clone(),
            orders.clone(),
            trades,
        ));
        Arc::clone(&reconciler).spawn_paper_pump(paper_rx);

        let manager = Arc::new(BotManager::new(
            settings,
            store.clone(),
            keys.clone(),
            bus,
            orders,
            factory,
            reconciler,
            fanout,
        ));
        manager.register_with_reconciler().await;

        // Seed pair metadata.
        let pair = PairInfo {
            id: "btcidr".to_string(),
            base: "btc".to_string(),
            quote: "idr".to_string(),
            volume_precision: 8,
            price_precision: 0,
            min_base_amount: 0.0001,
            min_quote_amount: 10_000.0,
            tick_size: 1000.0,
        };
        store.set_json(&keys.pair("btcidr"), &pair).await.unwrap();
        store.sadd(&keys.pairs(), "btcidr").await.unwrap();

        (manager, store, keys)
    }

    fn spread_request(paper: bool) -> CreateBot {
        CreateBot {
            user_id: 1,
            name: "maker".to_string(),
            kind: BotKind::SpreadMaker,
            pair: "btcidr".to_string(),
            paper,
            initial_balance_idr: 10_000_000.0,
            max_loss_idr: 1_000_000.0,
            rules: BotRules::Spread(SpreadRules { min_gap_pct: 0.2, order_size_idr: 100_000.0 }),
        }
    }

    #[tokio::test]
    async fn test_create_enforces_uniqueness() {
        let (manager, _, _) = manager().await;

        manager.create_bot(spread_request(true)).await.unwrap();
        let duplicate = manager.create_bot(spread_request(true)).await;
        assert!(matches!(duplicate, Err(EngineError::DuplicateBot(_))));

        // Same everything but live instead of paper: allowed.
        manager.create_bot(spread_request(false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_pair_and_mismatched_rules() {
        let (manager, _, _) = manager().await;

        let mut req = spread_request(true);
        req.pair = "dogeidr".to_string();
        assert!(matches!(
            manager.create_bot(req).await,
            Err(EngineError::UnknownPair(_))
        ));

        let mut req = spread_request(true);
        req.kind = BotKind::MomentumHunter;
        req.pair = crate::types::ALL_PAIRS.to_string();
        // Spread rules on a momentum bot.
        assert!(matches!(
            manager.create_bot(req).await,
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_start_stop_round_trip_preserves_balance() {
        let (manager, store, keys) = manager().await;

        let bot = manager.create_bot(spread_request(true)).await.unwrap();
        manager.start_bot(bot.id).await.unwrap();
        assert!(manager.is_running(bot.id).await);

        let running: BotConfig = store.get_json(&keys.bot(bot.id)).await.unwrap().unwrap();
        assert_eq!(running.status, BotStatus::Running);

        // Double start refused.
        assert!(matches!(
            manager.start_bot(bot.id).await,
            Err(EngineError::BotRunning(_))
        ));

        manager.stop_bot(bot.id).await.unwrap();
        assert!(!manager.is_running(bot.id).await);
        // Stop is idempotent.
        manager.stop_bot(bot.id).await.unwrap();

        // Give the async cleanup a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stopped: BotConfig = store.get_json(&keys.bot(bot.id)).await.unwrap().unwrap();
        assert_eq!(stopped.status, BotStatus::Stopped);
        // No tickers ever arrived: balance equals the initial allocation.
        assert_eq!(stopped.balances[QUOTE_CURRENCY], 10_000_000.0);
    }

    #[tokio::test]
    async fn test_live_start_refused_without_subscription() {
        let (manager, store, keys) = manager().await;

        // User exists but the key was never validated.
        let user = crate::types::User {
            id: 1,
            username: "alice".to_string(),
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            key_valid: false,
        };
        store.set_json(&keys.user(1), &user).await.unwrap();

        let bot = manager.create_bot(spread_request(false)).await.unwrap();
        let result = manager.start_bot(bot.id).await;
        assert!(matches!(result, Err(EngineError::NotSubscribed(_))));

        let stored: BotConfig = store.get_json(&keys.bot(bot.id)).await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Stopped);
    }

    #[tokio::test]
    async fn test_update_and_delete_refused_while_running() {
        let (manager, _, _) = manager().await;

        let bot = manager.create_bot(spread_request(true)).await.unwrap();
        manager.start_bot(bot.id).await.unwrap();

        assert!(matches!(
            manager.update_bot(bot.id, Some("renamed".to_string()), None, None).await,
            Err(EngineError::BotRunning(_))
        ));
        assert!(matches!(
            manager.delete_bot(bot.id).await,
            Err(EngineError::BotRunning(_))
        ));

        manager.stop_bot(bot.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        manager.update_bot(bot.id, Some("renamed".to_string()), None, None).await.unwrap();
        manager.delete_bot(bot.id).await.unwrap();
        assert!(matches!(
            manager.get_bot(bot.id).await,
            Err(EngineError::BotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_running_bots() {
        let (manager, store, keys) = manager().await;

        let bot = manager.create_bot(spread_request(true)).await.unwrap();
        // Simulate a bot left Running in the store by a previous run.
        let mut stored: BotConfig = store.get_json(&keys.bot(bot.id)).await.unwrap().unwrap();
        stored.status = BotStatus::Running;
        store.set_json(&keys.bot(bot.id), &stored).await.unwrap();

        manager.resume_running_bots().await;
        assert!(manager.is_running(bot.id).await);
    }

    #[tokio::test]
    async fn test_sweeper_prunes_self_stopped_instances() {
        let (manager, store, keys) = manager().await;

        let bot = manager.create_bot(spread_request(true)).await.unwrap();
        manager.start_bot(bot.id).await.unwrap();

        // Runtime stopped itself (bounded loss): DB says Stopped.
        let mut stored: BotConfig = store.get_json(&keys.bot(bot.id)).await.unwrap().unwrap();
        stored.status = BotStatus::Stopped;
        store.set_json(&keys.bot(bot.id), &stored).await.unwrap();

        manager.sweep_once().await;
        assert!(!manager.is_running(bot.id).await);
    }
}
