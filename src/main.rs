//! Engine entry point: wire the core together and run until signalled
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use idrbot::bots::BotManager;
use idrbot::config::load_settings;
use idrbot::error::Result;
use idrbot::exchange::{PublicWs, RestClient};
use idrbot::executor::ExecutorFactory;
use idrbot::market::{MarketIngestor, TickerFanout};
use idrbot::notify::NotificationBus;
use idrbot::orders::OrderRepo;
use idrbot::reconciler::OrderReconciler;
use idrbot::store::{Keys, KvStore, KvStoreExt, RedisStore};
use idrbot::trades::AssistedTrades;
use idrbot::watcher::StopLossWatcher;

/// Fetch pair metadata and persist it under the pair keys. Runs at boot
/// and then periodically; the market does add pairs.
async fn refresh_pairs(rest: &RestClient, store: &Arc<dyn KvStore>, keys: &Keys) -> Result<usize> {
    let pairs = rest.pairs().await?;
    for pair in &pairs {
        store.set_json(&keys.pair(&pair.id), pair).await?;
        store.sadd(&keys.pairs(), &pair.id).await?;
    }
    Ok(pairs.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let settings = Arc::new(load_settings(&config_path)?);

    tracing_subscriber::fmt()
        .with_env_filter(format!("idrbot={}", settings.log_level))
        .init();

    info!("🚀 Starting trading engine...");

    let store: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&settings.redis_url).await?);
    let keys = Keys::new(settings.key_prefix.clone());
    info!("✅ Store connected at {}", settings.redis_url);

    let bus = Arc::new(NotificationBus::new(Arc::clone(&store), keys.clone()));
    let rest = Arc::new(RestClient::new(&settings));
    let orders = Arc::new(OrderRepo::new(Arc::clone(&store), keys.clone()));

    match refresh_pairs(&rest, &store, &keys).await {
        Ok(count) => info!("✅ Pair metadata refreshed ({} pairs)", count),
        Err(e) => warn!("⚠️  Pair metadata refresh failed: {} - using stored data", e),
    }
    {
        let rest = Arc::clone(&rest);
        let store = Arc::clone(&store);
        let keys = keys.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = refresh_pairs(&rest, &store, &keys).await {
                    warn!("Periodic pair refresh failed: {}", e);
                }
            }
        });
    }

    // Market data: public stream -> ingestor -> fan-out.
    let (public_ws, public_rx) = PublicWs::spawn(settings.public_ws_url.clone());
    let fanout = Arc::new(TickerFanout::new(public_ws));
    let ingestor = Arc::new(MarketIngestor::new(
        Arc::clone(&settings),
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&bus),
        Arc::clone(&fanout),
    ));
    Arc::clone(&ingestor).spawn(public_rx);
    info!("✅ Market ingestor running");

    // Execution: paper fills feed the reconciler like live events do.
    let (paper_tx, paper_rx) = mpsc::unbounded_channel();
    let factory = Arc::new(ExecutorFactory::new(
        Arc::clone(&settings),
        Arc::clone(&rest),
        Arc::clone(&store),
        keys.clone(),
        paper_tx,
    ));

    let watcher = Arc::new(StopLossWatcher::new(
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&bus),
        Arc::clone(&ingestor),
        Arc::clone(&factory),
        Arc::clone(&orders),
    ));
    let trades = Arc::new(AssistedTrades::new(
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&bus),
        Arc::clone(&watcher),
    ));

    let reconciler = Arc::new(OrderReconciler::new(
        Arc::clone(&settings),
        Arc::clone(&rest),
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&bus),
        Arc::clone(&orders),
        Arc::clone(&trades),
    ));
    Arc::clone(&reconciler).spawn_paper_pump(paper_rx);
    reconciler.subscribe_all_users().await;
    info!("✅ Order reconciler booted");

    if let Err(e) = watcher.restore().await {
        error!("Stop-loss watcher restore failed: {}", e);
    }
    Arc::clone(&watcher).spawn();
    info!("✅ Stop-loss watcher running");

    let manager = Arc::new(BotManager::new(
        Arc::clone(&settings),
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&bus),
        Arc::clone(&orders),
        Arc::clone(&factory),
        Arc::clone(&reconciler),
        Arc::clone(&fanout),
    ));
    manager.register_with_reconciler().await;
    manager.resume_running_bots().await;
    Arc::clone(&manager).spawn_sweeper();
    info!("✅ Bot manager ready");

    tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    info!("🛑 Shutdown signal received");

    // Runtime state is persisted on every mutation; bots left Running
    // stay Running in the store and resume on the next boot.
    info!("👋 Goodbye!");
    Ok(())
}
