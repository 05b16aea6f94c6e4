//! Momentum Hunter runtime: many concurrent positions across the market
//!
//! Coin updates stream in from the ingestor; candidates that pass every
//! entry rule are buffered for one second and opened best-score-first.
//! Open positions are walked every ten seconds, and any exit reason has
//! to survive two consecutive one-minute checks before it fires.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::exchange::bot_client_order_id;
use crate::exchange::wire::{OrderEvent, OrderEventStatus};
use crate::executor::{PlaceOrder, TradeExecutor};
use crate::notify::NotificationBus;
use crate::orders::{new_order, OrderRepo};
use crate::store::{Keys, KvStore, KvStoreExt};
use crate::types::{
    BotConfig, BotStatus, Coin, MomentumRules, OrderStatus, OrderType, PairInfo, ParentKind,
    Position, PositionStatus, Side, QUOTE_CURRENCY,
};
use crate::utils::{align_price, floor_to_precision, validate_order_amount};

/// Exit reasons in priority order, highest first.
const REASON_STOP_LOSS: &str = "stop_loss";
const REASON_MAX_HOLD: &str = "max_hold";
const REASON_TAKE_PROFIT: &str = "take_profit";
const REASON_TRAILING: &str = "trailing_stop";
const REASON_SCORE_DROP: &str = "pump_score_drop";
const REASON_ATH_DECLINE: &str = "ath_decline";

#[derive(Debug, Clone)]
struct Signal {
    coin: Coin,
    score: f64,
}

struct MomentumState {
    bot: BotConfig,
    /// Positions whose entry order is still working.
    pending: HashMap<u64, Position>,
    /// Open and Selling positions.
    open: HashMap<u64, Position>,
    /// Best candidate per pair inside the current 1 s window.
    signals: HashMap<String, Signal>,
    daily_loss_idr: f64,
    last_loss_at: Option<DateTime<Utc>>,
}

pub struct MomentumHunterBot {
    settings: Arc<Settings>,
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    orders: Arc<OrderRepo>,
    executor: Arc<dyn TradeExecutor>,
    pairs: HashMap<String, PairInfo>,
    state: RwLock<MomentumState>,
    stop: Arc<watch::Sender<bool>>,
}

impl MomentumHunterBot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        orders: Arc<OrderRepo>,
        executor: Arc<dyn TradeExecutor>,
        pairs: HashMap<String, PairInfo>,
        bot: BotConfig,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        MomentumHunterBot {
            settings,
            store,
            keys,
            bus,
            orders,
            executor,
            pairs,
            state: RwLock::new(MomentumState {
                bot,
                pending: HashMap::new(),
                open: HashMap::new(),
                signals: HashMap::new(),
                daily_loss_idr: 0.0,
                last_loss_at: None,
            }),
            stop,
        }
    }

    pub async fn bot_id(&self) -> u64 {
        self.state.read().await.bot.id
    }

    pub async fn user_id(&self) -> u64 {
        self.state.read().await.bot.user_id
    }

    fn rules(bot: &BotConfig) -> MomentumRules {
        bot.momentum_rules().cloned().unwrap_or(MomentumRules {
            min_pump_score: 50.0,
            min_volume_idr: 0.0,
            min_price: 0.0,
            min_positive_timeframes: 0,
            max_concurrent_positions: 1,
            max_position_size_idr: 0.0,
            min_balance_reserve_idr: 0.0,
            target_profit_pct: 5.0,
            stop_loss_pct: 2.0,
            trailing_stop_pct: 2.0,
            max_hold_minutes: 240,
            exit_on_pump_score_drop: false,
            daily_loss_limit_idr: 0.0,
            loss_cooldown_minutes: 0,
            excluded_pairs: Vec::new(),
            allowed_pairs: Vec::new(),
        })
    }

    /// Event loop: coin ingress plus the four periodic tickers.
    pub fn spawn(self: Arc<Self>, mut coin_rx: mpsc::Receiver<Coin>) {
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut signal_tick = tokio::time::interval(std::time::Duration::from_secs(
                self.settings.signal_interval_secs,
            ));
            let mut exit_tick = tokio::time::interval(std::time::Duration::from_secs(
                self.settings.exit_check_interval_secs,
            ));
            let mut pending_tick = tokio::time::interval(std::time::Duration::from_secs(
                self.settings.exit_check_interval_secs,
            ));
            let mut breaker_tick = tokio::time::interval(std::time::Duration::from_secs(
                self.settings.loss_breaker_interval_secs,
            ));

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    coin = coin_rx.recv() => {
                        let Some(coin) = coin else { break };
                        self.on_coin_update(coin).await;
                    }
                    _ = signal_tick.tick() => {
                        if let Err(e) = self.process_signals().await {
                            error!("Momentum signal processing failed: {}", e);
                        }
                    }
                    _ = exit_tick.tick() => {
                        if let Err(e) = self.monitor_exits().await {
                            error!("Momentum exit monitoring failed: {}", e);
                        }
                    }
                    _ = pending_tick.tick() => {
                        if let Err(e) = self.monitor_pending().await {
                            error!("Momentum pending monitoring failed: {}", e);
                        }
                    }
                    _ = breaker_tick.tick() => {
                        if let Err(e) = self.check_loss_breaker().await {
                            error!("Momentum loss breaker failed: {}", e);
                        }
                    }
                }
            }
            debug!("Momentum bot event loop ended");
        });
    }

    fn in_cooldown(state: &MomentumState, rules: &MomentumRules, now: DateTime<Utc>) -> bool {
        match state.last_loss_at {
            Some(at) if rules.loss_cooldown_minutes > 0 => {
                now - at < ChronoDuration::minutes(rules.loss_cooldown_minutes)
            }
            _ => false,
        }
    }

    fn active_position_count(state: &MomentumState) -> usize {
        state.pending.len()
            + state
                .open
                .values()
                .filter(|p| p.status.holds_entry_slot())
                .count()
    }

    fn has_position_for_pair(state: &MomentumState, pair: &str) -> bool {
        state.pending.values().any(|p| p.pair == pair)
            || state
                .open
                .values()
                .any(|p| p.pair == pair && p.status == PositionStatus::Open)
    }

    /// The ten entry rules. Every one must hold.
    fn entry_conditions(
        state: &mut MomentumState,
        rules: &MomentumRules,
        coin: &Coin,
        now: DateTime<Utc>,
    ) -> bool {
        // Daily loss resets a day after the last loss.
        if let Some(at) = state.last_loss_at {
            if now - at > ChronoDuration::hours(24) {
                state.daily_loss_idr = 0.0;
            }
        }

        if rules.daily_loss_limit_idr > 0.0 {
            if state.bot.stats.total_profit_idr <= -rules.daily_loss_limit_idr {
                return false;
            }
            if state.daily_loss_idr >= rules.daily_loss_limit_idr {
                return false;
            }
        }
        if Self::active_position_count(state) >= rules.max_concurrent_positions {
            return false;
        }
        if Self::in_cooldown(state, rules, now) {
            return false;
        }
        if rules.excluded_pairs.iter().any(|p| p == &coin.pair_id) {
            return false;
        }
        if !rules.allowed_pairs.is_empty()
            && !rules.allowed_pairs.iter().any(|p| p == &coin.pair_id)
        {
            return false;
        }
        if Self::has_position_for_pair(state, &coin.pair_id) {
            return false;
        }
        if coin.pump_score < rules.min_pump_score {
            return false;
        }
        if coin.volume_idr < rules.min_volume_idr {
            return false;
        }
        if coin.price < rules.min_price {
            return false;
        }
        if coin.positive_timeframes() < rules.min_positive_timeframes {
            return false;
        }
        true
    }

    /// Ingress: buffer passing candidates, best score per pair wins.
    pub async fn on_coin_update(&self, coin: Coin) {
        let mut state = self.state.write().await;
        if state.bot.status != BotStatus::Running {
            return;
        }
        let rules = Self::rules(&state.bot);
        let now = Utc::now();

        if Self::in_cooldown(&state, &rules, now) {
            return;
        }
        if !Self::entry_conditions(&mut state, &rules, &coin, now) {
            return;
        }

        let score = coin.pump_score;
        let entry = state.signals.entry(coin.pair_id.clone());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if score > slot.get().score {
                    slot.insert(Signal { coin, score });
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Signal { coin, score });
            }
        }
    }

    /// 1 Hz: drain the buffer best-first and open what still qualifies.
    pub async fn process_signals(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.bot.status != BotStatus::Running {
            return Ok(());
        }

        let mut candidates: Vec<Signal> = state.signals.drain().map(|(_, s)| s).collect();
        if candidates.is_empty() {
            return Ok(());
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let rules = Self::rules(&state.bot);
        let now = Utc::now();
        for signal in candidates {
            // Slots may have filled since the candidate was buffered.
            if !Self::entry_conditions(&mut state, &rules, &signal.coin, now) {
                continue;
            }
            if let Err(e) = self.open_position(&mut state, &rules, &signal.coin).await {
                if e.is_credential() && !state.bot.paper {
                    self.fail_bot(&mut state, &e.to_string()).await?;
                    return Ok(());
                }
                warn!("Opening position on {} failed: {}", signal.coin.pair_id, e);
            }
        }
        Ok(())
    }

    async fn open_position(
        &self,
        state: &mut MomentumState,
        rules: &MomentumRules,
        coin: &Coin,
    ) -> Result<()> {
        let Some(pair_info) = self.pairs.get(&coin.pair_id) else {
            debug!("No pair metadata for {}, skipping", coin.pair_id);
            return Ok(());
        };

        let quote_balance = state.bot.balances.get(QUOTE_CURRENCY).copied().unwrap_or(0.0);
        let available = quote_balance - rules.min_balance_reserve_idr;
        let size_idr = rules.max_position_size_idr.min(available);
        if size_idr < pair_info.min_quote_amount {
            debug!("Bot {} cannot size entry on {}", state.bot.id, coin.pair_id);
            return Ok(());
        }

        let gap_pct = if coin.best_bid > 0.0 {
            (coin.best_ask - coin.best_bid) / coin.best_bid * 100.0
        } else {
            0.0
        };

        // Tight book: take liquidity with a market buy sized in quote.
        // Wide book: outbid the best bid by one tick with a limit buy.
        let (order_type, price, amount, committed_idr) =
            if gap_pct < self.settings.market_buy_gap_pct {
                (OrderType::Market, coin.price, size_idr, size_idr)
            } else {
                let tick = if pair_info.tick_size > 0.0 {
                    pair_info.tick_size
                } else {
                    10f64.powi(-(pair_info.price_precision as i32))
                };
                let price = align_price(coin.best_bid + tick, pair_info);
                let amount = validate_order_amount(
                    size_idr / price,
                    price,
                    pair_info,
                    self.settings.max_reasonable_coin_amount,
                )?;
                (OrderType::Limit, price, amount, price * amount)
            };

        let position_id = self.store.incr(&self.keys.id_counter("position")).await?;
        let now = Utc::now();
        let client_order_id =
            bot_client_order_id(state.bot.id, &coin.pair_id, Side::Buy, now.timestamp_millis());

        let mut order = new_order(
            state.bot.user_id,
            ParentKind::Position,
            position_id,
            client_order_id.clone(),
            coin.pair_id.clone(),
            Side::Buy,
            order_type,
            price,
            amount,
            state.bot.paper,
        );
        self.orders.insert(&order).await?;

        let placed = self
            .executor
            .place_order(&PlaceOrder {
                pair: coin.pair_id.clone(),
                side: Side::Buy,
                order_type,
                price,
                amount,
                client_order_id,
            })
            .await;
        let exchange_order_id = match placed {
            Ok(id) => id,
            Err(e) => {
                order.status = OrderStatus::Cancelled;
                self.orders.update(&mut order).await?;
                return Err(e);
            }
        };

        order.exchange_order_id = exchange_order_id.clone();
        order.status = OrderStatus::Open;
        self.orders.update(&mut order).await?;
        self.orders.alias(&exchange_order_id, &order.id).await?;

        *state.bot.balances.entry(QUOTE_CURRENCY.to_string()).or_insert(0.0) -= committed_idr;
        self.persist_bot(state).await?;

        let entry_quantity = if order_type == OrderType::Market && price > 0.0 {
            size_idr / price
        } else {
            amount
        };
        let position = Position {
            id: position_id,
            bot_id: state.bot.id,
            pair: coin.pair_id.clone(),
            status: PositionStatus::Pending,
            entry_price: price,
            entry_quantity,
            entry_idr: committed_idr,
            entry_order_id: order.id.clone(),
            entry_pump_score: coin.pump_score,
            entry_trx_count_1m: coin.tf_1m.trx_count,
            entry_order_type: order_type,
            order_placed_at: now,
            highest_price: 0.0,
            lowest_price: 0.0,
            last_price_check: now,
            minutes_below_ath: 0,
            exit_reason: String::new(),
            exit_confirm_count: 0,
            exit_order_id: String::new(),
            close_reason: String::new(),
            exit_price: 0.0,
            exit_quantity: 0.0,
            exit_idr: 0.0,
            profit_idr: 0.0,
            profit_pct: 0.0,
            paper: state.bot.paper,
            created_at: now,
            closed_at: None,
        };
        self.persist_position(&position).await?;
        state.pending.insert(position_id, position.clone());

        info!(
            "🚀 Bot {} entering {} with {} IDR ({:?} @ {}, score {:.1})",
            state.bot.id, coin.pair_id, committed_idr, order_type, price, coin.pump_score
        );
        self.bus.notify_position_update(state.bot.user_id, &position).await;
        self.bus
            .notify_pump_signal(state.bot.user_id, &serde_json::json!({
                "pair": coin.pair_id,
                "score": coin.pump_score,
                "position_id": position_id,
            }))
            .await;

        Ok(())
    }

    async fn persist_bot(&self, state: &mut MomentumState) -> Result<()> {
        state.bot.updated_at = Utc::now();
        self.store.set_json(&self.keys.bot(state.bot.id), &state.bot).await
    }

    async fn persist_position(&self, position: &Position) -> Result<()> {
        self.store.set_json(&self.keys.position(position.id), position).await?;
        self.store
            .sadd(&self.keys.bot_positions(position.bot_id), &position.id.to_string())
            .await
    }

    async fn delete_position(&self, position: &Position) -> Result<()> {
        self.store.del(&self.keys.position(position.id)).await?;
        self.store
            .srem(&self.keys.bot_positions(position.bot_id), &position.id.to_string())
            .await
    }

    /// 10 s cadence: false-pump detection and entry repositioning for
    /// orders that have not filled yet.
    pub async fn monitor_pending(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.bot.status != BotStatus::Running {
            return Ok(());
        }
        let rules = Self::rules(&state.bot);
        let now = Utc::now();

        let pending: Vec<Position> = state.pending.values().cloned().collect();
        for position in pending {
            let age_secs = (now - position.order_placed_at).num_seconds();
            if age_secs < self.settings.pending_debounce_secs {
                continue;
            }

            let coin: Option<Coin> = self.store.get_json(&self.keys.coin(&position.pair)).await?;
            let Some(coin) = coin else { continue };

            if coin.pump_score < rules.min_pump_score {
                info!(
                    "❌ Bot {} false pump on {} (score {:.1} < {:.1})",
                    state.bot.id, position.pair, coin.pump_score, rules.min_pump_score
                );
                self.cancel_pending(&mut state, &position).await?;
                continue;
            }

            if age_secs > self.settings.pending_timeout_secs
                && coin.pump_score < rules.min_pump_score
            {
                self.cancel_pending(&mut state, &position).await?;
                continue;
            }

            // Recompute what we would place right now; a drifted price
            // means cancel-and-replace at the same quantity.
            let Some(pair_info) = self.pairs.get(&position.pair) else { continue };
            let gap_pct = if coin.best_bid > 0.0 {
                (coin.best_ask - coin.best_bid) / coin.best_bid * 100.0
            } else {
                0.0
            };
            let (intended_type, intended_price) = if gap_pct < self.settings.market_buy_gap_pct {
                (OrderType::Market, coin.price)
            } else {
                let tick = if pair_info.tick_size > 0.0 {
                    pair_info.tick_size
                } else {
                    10f64.powi(-(pair_info.price_precision as i32))
                };
                (OrderType::Limit, align_price(coin.best_bid + tick, pair_info))
            };

            let drifted = intended_type != position.entry_order_type
                || (intended_price - position.entry_price).abs()
                    > self.settings.reposition_tolerance;
            if drifted && position.entry_order_type == OrderType::Limit {
                if let Err(e) = self
                    .reposition_pending(&mut state, &position, intended_type, intended_price)
                    .await
                {
                    warn!("Repositioning entry on {} failed: {}", position.pair, e);
                }
            }
        }
        Ok(())
    }

    async fn cancel_pending(&self, state: &mut MomentumState, position: &Position) -> Result<()> {
        if let Some(mut order) = self.orders.get(&position.entry_order_id).await? {
            if position.entry_order_type == OrderType::Limit
                && !order.exchange_order_id.is_empty()
            {
                match self
                    .executor
                    .cancel_order(&position.pair, &order.exchange_order_id, Side::Buy)
                    .await
                {
                    Ok(()) | Err(crate::error::EngineError::OrderMissing(_)) => {}
                    Err(e) => {
                        warn!("Cancel of entry order {} failed: {}", order.id, e);
                        return Ok(());
                    }
                }
            }
            if !order.status.is_terminal() {
                order.status = OrderStatus::Cancelled;
                self.orders.update(&mut order).await?;
            }
        }

        // The committed quote comes back in full; nothing filled.
        *state.bot.balances.entry(QUOTE_CURRENCY.to_string()).or_insert(0.0) +=
            position.entry_idr;
        self.persist_bot(state).await?;

        state.pending.remove(&position.id);
        self.delete_position(position).await?;

        let mut gone = position.clone();
        gone.status = PositionStatus::Closed;
        gone.close_reason = "false_pump".to_string();
        self.bus.notify_position_update(state.bot.user_id, &gone).await;
        Ok(())
    }

    async fn reposition_pending(
        &self,
        state: &mut MomentumState,
        position: &Position,
        order_type: OrderType,
        price: f64,
    ) -> Result<()> {
        let Some(mut old_order) = self.orders.get(&position.entry_order_id).await? else {
            return Ok(());
        };
        if !old_order.exchange_order_id.is_empty() {
            match self
                .executor
                .cancel_order(&position.pair, &old_order.exchange_order_id, Side::Buy)
                .await
            {
                Ok(()) | Err(crate::error::EngineError::OrderMissing(_)) => {}
                Err(e) => {
                    warn!("Reposition cancel failed for {}: {}", old_order.id, e);
                    return Ok(());
                }
            }
        }
        old_order.status = OrderStatus::Cancelled;
        self.orders.update(&mut old_order).await?;

        let now = Utc::now();
        let client_order_id =
            bot_client_order_id(state.bot.id, &position.pair, Side::Buy, now.timestamp_millis());
        let amount = match order_type {
            OrderType::Market => position.entry_idr,
            OrderType::Limit => position.entry_quantity,
        };
        let mut order = new_order(
            state.bot.user_id,
            ParentKind::Position,
            position.id,
            client_order_id.clone(),
            position.pair.clone(),
            Side::Buy,
            order_type,
            price,
            amount,
            state.bot.paper,
        );
        self.orders.insert(&order).await?;

        let exchange_order_id = self
            .executor
            .place_order(&PlaceOrder {
                pair: position.pair.clone(),
                side: Side::Buy,
                order_type,
                price,
                amount,
                client_order_id,
            })
            .await?;
        order.exchange_order_id = exchange_order_id.clone();
        order.status = OrderStatus::Open;
        self.orders.update(&mut order).await?;
        self.orders.alias(&exchange_order_id, &order.id).await?;

        if let Some(stored) = state.pending.get_mut(&position.id) {
            stored.entry_order_id = order.id.clone();
            stored.entry_order_type = order_type;
            stored.entry_price = price;
            stored.order_placed_at = now;
            let snapshot = stored.clone();
            self.persist_position(&snapshot).await?;
            info!(
                "↔ Bot {} repositioned entry on {} to {} ({:?})",
                state.bot.id, position.pair, price, order_type
            );
        }
        Ok(())
    }

    /// Entry order filled completely: the position opens and the sell
    /// strategy is chosen off the configured target.
    async fn on_entry_filled(
        self: &Arc<Self>,
        state: &mut MomentumState,
        position_id: u64,
        event: &OrderEvent,
    ) -> Result<()> {
        let Some(mut position) = state.pending.remove(&position_id) else { return Ok(()) };

        let fill_price = if event.avg_price > 0.0 { event.avg_price } else { position.entry_price };
        position.entry_price = fill_price;
        position.entry_quantity = event.executed_qty;
        position.entry_idr = fill_price * event.executed_qty;
        position.status = PositionStatus::Open;
        position.highest_price = fill_price;
        position.lowest_price = fill_price;
        position.last_price_check = Utc::now();
        position.minutes_below_ath = 0;

        self.persist_position(&position).await?;
        state.open.insert(position_id, position.clone());
        self.bus.notify_position_update(state.bot.user_id, &position).await;

        info!(
            "✅ Bot {} opened {} x{} @ {}",
            state.bot.id, position.pair, position.entry_quantity, position.entry_price
        );

        let rules = Self::rules(&state.bot);
        if rules.target_profit_pct > 1.0 {
            // Give the exchange a moment to credit the coins, then rest
            // the take-profit sell.
            let bot = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(
                    bot.settings.sell_settle_delay_secs,
                ))
                .await;
                if let Err(e) = bot.place_take_profit_sell(position_id).await {
                    error!("Take-profit sell for position {} failed: {}", position_id, e);
                }
            });
        }
        Ok(())
    }

    /// Rest a limit sell at `entry * (1 + target/100)`.
    pub async fn place_take_profit_sell(self: &Arc<Self>, position_id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(position) = state.open.get(&position_id).cloned() else { return Ok(()) };
        if position.status != PositionStatus::Open {
            return Ok(());
        }
        let rules = Self::rules(&state.bot);
        let Some(pair_info) = self.pairs.get(&position.pair) else { return Ok(()) };

        let target_price = align_price(
            position.entry_price * (1.0 + rules.target_profit_pct / 100.0),
            pair_info,
        );
        let amount = floor_to_precision(position.entry_quantity, pair_info.volume_precision);
        if amount <= 0.0 {
            return Ok(());
        }

        let now = Utc::now();
        let client_order_id =
            bot_client_order_id(state.bot.id, &position.pair, Side::Sell, now.timestamp_millis());
        let mut order = new_order(
            state.bot.user_id,
            ParentKind::Position,
            position.id,
            client_order_id.clone(),
            position.pair.clone(),
            Side::Sell,
            OrderType::Limit,
            target_price,
            amount,
            state.bot.paper,
        );
        self.orders.insert(&order).await?;

        let placed = self
            .executor
            .place_order(&PlaceOrder {
                pair: position.pair.clone(),
                side: Side::Sell,
                order_type: OrderType::Limit,
                price: target_price,
                amount,
                client_order_id,
            })
            .await;

        match placed {
            Ok(exchange_order_id) => {
                order.exchange_order_id = exchange_order_id.clone();
                order.status = OrderStatus::Open;
                self.orders.update(&mut order).await?;
                self.orders.alias(&exchange_order_id, &order.id).await?;

                if let Some(stored) = state.open.get_mut(&position_id) {
                    stored.status = PositionStatus::Selling;
                    stored.exit_order_id = order.id.clone();
                    let snapshot = stored.clone();
                    self.persist_position(&snapshot).await?;
                    self.bus.notify_position_update(state.bot.user_id, &snapshot).await;
                }
                info!(
                    "🎯 Bot {} resting take-profit on {} @ {}",
                    state.bot.id, position.pair, target_price
                );
            }
            Err(e) => {
                order.status = OrderStatus::Cancelled;
                self.orders.update(&mut order).await?;
                if matches!(e, crate::error::EngineError::InsufficientBalance(_)) {
                    // Coins not credited or partially eaten; bail out of
                    // the position at market instead of stranding it.
                    warn!(
                        "Insufficient balance resting take-profit on {}, closing at market",
                        position.pair
                    );
                    self.close_position(&mut state, position_id, "tp_unplaceable").await?;
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// 10 s cadence over Open positions: ATH tracking plus the
    /// 1-minute exit evaluation with two-check confirmation.
    pub async fn monitor_exits(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.bot.status != BotStatus::Running {
            return Ok(());
        }
        let rules = Self::rules(&state.bot);
        let now = Utc::now();

        let ids: Vec<u64> = state
            .open
            .iter()
            .filter(|(_, p)| p.status == PositionStatus::Open)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let coin: Option<Coin> = {
                let position = state.open.get(&id).unwrap();
                self.store.get_json(&self.keys.coin(&position.pair)).await?
            };
            let Some(coin) = coin else { continue };
            let price = coin.price;
            if price <= 0.0 {
                continue;
            }

            let mut changed = false;
            let mut fire: Option<String> = None;
            {
                let position = state.open.get_mut(&id).unwrap();

                if price >= position.highest_price {
                    if price > position.highest_price {
                        position.highest_price = price;
                    }
                    // At or above the ATH: the decline streak is over.
                    if position.minutes_below_ath != 0 {
                        position.minutes_below_ath = 0;
                        changed = true;
                    }
                }
                if position.lowest_price == 0.0 || price < position.lowest_price {
                    position.lowest_price = price;
                }

                if (now - position.last_price_check) >= ChronoDuration::minutes(1) {
                    position.last_price_check = now;

                    if price < position.highest_price {
                        position.minutes_below_ath += 1;
                    } else {
                        position.minutes_below_ath = 0;
                    }

                    let profit_pct = if position.entry_price > 0.0 {
                        (price - position.entry_price) / position.entry_price * 100.0
                    } else {
                        0.0
                    };
                    let held_minutes = (now - position.created_at).num_minutes();
                    let ath_drop_pct = if position.highest_price > 0.0 {
                        (position.highest_price - price) / position.highest_price * 100.0
                    } else {
                        0.0
                    };

                    let reason = if profit_pct <= -rules.stop_loss_pct {
                        Some(REASON_STOP_LOSS)
                    } else if held_minutes >= rules.max_hold_minutes {
                        Some(REASON_MAX_HOLD)
                    } else if rules.target_profit_pct > 1.0 && profit_pct >= rules.target_profit_pct
                    {
                        // Fallback only; the resting limit normally wins.
                        Some(REASON_TAKE_PROFIT)
                    } else if ath_drop_pct >= rules.trailing_stop_pct {
                        Some(REASON_TRAILING)
                    } else if rules.exit_on_pump_score_drop
                        && coin.pump_score < rules.min_pump_score
                    {
                        Some(REASON_SCORE_DROP)
                    } else if (rules.target_profit_pct - 1.0).abs() < f64::EPSILON
                        && position.minutes_below_ath >= 2
                    {
                        Some(REASON_ATH_DECLINE)
                    } else {
                        None
                    };

                    match reason {
                        Some(REASON_ATH_DECLINE) => {
                            // Its own counter already spans two minutes.
                            position.exit_reason = REASON_ATH_DECLINE.to_string();
                            fire = Some(REASON_ATH_DECLINE.to_string());
                            changed = true;
                        }
                        Some(reason) => {
                            if position.exit_reason == reason {
                                position.exit_confirm_count += 1;
                                if position.exit_confirm_count >= 2 {
                                    fire = Some(reason.to_string());
                                }
                            } else {
                                position.exit_reason = reason.to_string();
                                position.exit_confirm_count = 1;
                            }
                            changed = true;
                        }
                        None => {
                            if !position.exit_reason.is_empty() {
                                position.exit_reason.clear();
                                position.exit_confirm_count = 0;
                                changed = true;
                            }
                        }
                    }
                }
            }

            if changed {
                let snapshot = state.open.get(&id).unwrap().clone();
                self.persist_position(&snapshot).await?;
                self.bus.notify_position_update(state.bot.user_id, &snapshot).await;
            }

            if let Some(reason) = fire {
                self.close_position(&mut state, id, &reason).await?;
            }
        }
        Ok(())
    }

    /// Confirmed exit: market-sell the entry quantity. The reconciler's
    /// fill event finalizes the close.
    async fn close_position(
        &self,
        state: &mut MomentumState,
        position_id: u64,
        reason: &str,
    ) -> Result<()> {
        let Some(position) = state.open.get(&position_id).cloned() else { return Ok(()) };
        if position.status != PositionStatus::Open {
            return Ok(());
        }
        let Some(pair_info) = self.pairs.get(&position.pair) else { return Ok(()) };

        // An old resting sell has to go first.
        if !position.exit_order_id.is_empty() {
            if let Some(old) = self.orders.get(&position.exit_order_id).await? {
                if !old.status.is_terminal() && !old.exchange_order_id.is_empty() {
                    let _ = self
                        .executor
                        .cancel_order(&position.pair, &old.exchange_order_id, Side::Sell)
                        .await;
                }
            }
        }

        let amount = floor_to_precision(position.entry_quantity, pair_info.volume_precision);
        if amount <= 0.0 {
            return Ok(());
        }

        let coin: Option<Coin> = self.store.get_json(&self.keys.coin(&position.pair)).await?;
        let market_price = coin.map(|c| c.price).unwrap_or(position.entry_price);

        let now = Utc::now();
        let client_order_id =
            bot_client_order_id(state.bot.id, &position.pair, Side::Sell, now.timestamp_millis());
        let mut order = new_order(
            state.bot.user_id,
            ParentKind::Position,
            position.id,
            client_order_id.clone(),
            position.pair.clone(),
            Side::Sell,
            OrderType::Market,
            market_price,
            amount,
            state.bot.paper,
        );
        self.orders.insert(&order).await?;

        let exchange_order_id = self
            .executor
            .place_order(&PlaceOrder {
                pair: position.pair.clone(),
                side: Side::Sell,
                order_type: OrderType::Market,
                price: market_price,
                amount,
                client_order_id,
            })
            .await?;
        order.exchange_order_id = exchange_order_id.clone();
        order.status = OrderStatus::Open;
        self.orders.update(&mut order).await?;
        self.orders.alias(&exchange_order_id, &order.id).await?;

        if let Some(stored) = state.open.get_mut(&position_id) {
            stored.status = PositionStatus::Selling;
            stored.exit_order_id = order.id.clone();
            stored.close_reason = reason.to_string();
            let snapshot = stored.clone();
            self.persist_position(&snapshot).await?;
            self.bus.notify_position_update(state.bot.user_id, &snapshot).await;
        }

        info!(
            "🚪 Bot {} closing {} ({}): market sell {} @ ~{}",
            state.bot.id, position.pair, reason, amount, market_price
        );
        Ok(())
    }

    /// Exit sell filled: realize the result and release the slot.
    async fn on_exit_filled(
        &self,
        state: &mut MomentumState,
        position_id: u64,
        event: &OrderEvent,
    ) -> Result<()> {
        let Some(mut position) = state.open.remove(&position_id) else { return Ok(()) };

        let exit_price = if event.avg_price > 0.0 { event.avg_price } else { position.entry_price };
        position.exit_price = exit_price;
        position.exit_quantity = event.executed_qty;
        position.exit_idr = exit_price * event.executed_qty;
        position.profit_idr = position.exit_idr - position.entry_idr;
        position.profit_pct = if position.entry_idr > 0.0 {
            position.profit_idr / position.entry_idr * 100.0
        } else {
            0.0
        };
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());

        *state.bot.balances.entry(QUOTE_CURRENCY.to_string()).or_insert(0.0) +=
            position.exit_idr;
        state.bot.stats.total_trades += 1;
        if position.profit_idr > 0.0 {
            state.bot.stats.winning_trades += 1;
        }
        state.bot.stats.total_profit_idr += position.profit_idr;
        if position.profit_idr < 0.0 {
            state.daily_loss_idr += -position.profit_idr;
            state.last_loss_at = Some(Utc::now());
        }

        self.persist_position(&position).await?;
        self.persist_bot(state).await?;
        self.bus.notify_position_update(state.bot.user_id, &position).await;

        info!(
            "💰 Bot {} closed {} for {:+.0} IDR ({:+.2}%) [{}]",
            state.bot.id,
            position.pair,
            position.profit_idr,
            position.profit_pct,
            position.close_reason
        );

        let rules = Self::rules(&state.bot);
        if rules.daily_loss_limit_idr > 0.0
            && state.bot.stats.total_profit_idr <= -rules.daily_loss_limit_idr
        {
            self.stop_bot(state, "daily loss limit").await?;
        }
        Ok(())
    }

    /// 5 s cadence: cumulative-loss circuit breaker.
    pub async fn check_loss_breaker(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.bot.status != BotStatus::Running {
            return Ok(());
        }
        let rules = Self::rules(&state.bot);
        if rules.daily_loss_limit_idr > 0.0
            && state.bot.stats.total_profit_idr <= -rules.daily_loss_limit_idr
        {
            self.stop_bot(&mut state, "daily loss limit").await?;
        }
        Ok(())
    }

    async fn stop_bot(&self, state: &mut MomentumState, reason: &str) -> Result<()> {
        warn!("Bot {} stopping: {}", state.bot.id, reason);
        state.bot.status = BotStatus::Stopped;
        self.persist_bot(state).await?;
        self.stop.send_replace(true);
        Ok(())
    }

    async fn fail_bot(&self, state: &mut MomentumState, message: &str) -> Result<()> {
        error!("Bot {} stopping with error: {}", state.bot.id, message);
        state.bot.status = BotStatus::Error;
        self.persist_bot(state).await?;
        self.stop.send_replace(true);
        Ok(())
    }

    /// Reconciler entry point.
    pub async fn on_order_event(self: &Arc<Self>, user_id: u64, event: &OrderEvent) {
        let mut state = self.state.write().await;
        if state.bot.user_id != user_id {
            return;
        }

        let order = match self
            .orders
            .find_by_event_keys(&event.client_order_id, &event.exchange_order_id)
            .await
        {
            Ok(Some(order)) => order,
            _ => return,
        };
        if order.parent_kind != ParentKind::Position {
            return;
        }
        let position_id = order.parent_id;

        let is_entry = state
            .pending
            .get(&position_id)
            .map(|p| p.entry_order_id == order.id)
            .unwrap_or(false);
        let is_exit = state
            .open
            .get(&position_id)
            .map(|p| p.exit_order_id == order.id)
            .unwrap_or(false);

        let result = match event.status {
            OrderEventStatus::Fill | OrderEventStatus::Done
                if event.remaining_qty <= 0.0 && event.executed_qty > 0.0 =>
            {
                if is_entry {
                    self.on_entry_filled(&mut state, position_id, event).await
                } else if is_exit {
                    self.on_exit_filled(&mut state, position_id, event).await
                } else {
                    Ok(())
                }
            }
            OrderEventStatus::Cancelled => {
                if is_entry {
                    let position = state.pending.get(&position_id).cloned();
                    match position {
                        Some(position) => self.cancel_pending(&mut state, &position).await,
                        None => Ok(()),
                    }
                } else if is_exit {
                    self.on_exit_cancelled(&mut state, position_id).await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("Momentum event handling failed: {}", e);
        }
    }

    /// The exchange killed our sell: fall back to Open and let the
    /// monitoring (or a fresh take-profit) pick the position back up.
    async fn on_exit_cancelled(
        self: &Arc<Self>,
        state: &mut MomentumState,
        position_id: u64,
    ) -> Result<()> {
        let rules = Self::rules(&state.bot);
        let Some(position) = state.open.get_mut(&position_id) else { return Ok(()) };
        if position.status != PositionStatus::Selling {
            return Ok(());
        }
        position.status = PositionStatus::Open;
        position.exit_order_id = String::new();
        let snapshot = position.clone();
        self.persist_position(&snapshot).await?;
        self.bus.notify_position_update(state.bot.user_id, &snapshot).await;

        if rules.target_profit_pct > 1.0 {
            let bot = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = bot.place_take_profit_sell(position_id).await {
                    error!("Replacing take-profit for {} failed: {}", position_id, e);
                }
            });
        }
        Ok(())
    }

    /// Restart: pick persisted positions back up where they were.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let bot_id = self.bot_id().await;
        let ids = self.store.smembers(&self.keys.bot_positions(bot_id)).await?;
        let rules = {
            let state = self.state.read().await;
            Self::rules(&state.bot)
        };

        for raw_id in ids {
            let Ok(position_id) = raw_id.parse::<u64>() else { continue };
            let position: Option<Position> =
                self.store.get_json(&self.keys.position(position_id)).await?;
            let Some(mut position) = position else { continue };

            match position.status {
                PositionStatus::Pending | PositionStatus::Buying => {
                    let mut state = self.state.write().await;
                    let stale = (Utc::now() - position.order_placed_at).num_seconds()
                        > self.settings.paper_stale_order_secs;
                    if position.paper && stale {
                        state.pending.insert(position.id, position.clone());
                        self.cancel_pending(&mut state, &position).await?;
                        continue;
                    }
                    if position.paper {
                        state.pending.insert(position.id, position.clone());
                        continue;
                    }
                    drop(state);
                    self.restore_live_pending(position).await?;
                }
                PositionStatus::Open => {
                    if position.highest_price <= 0.0 {
                        position.highest_price = position.entry_price;
                        position.lowest_price = position.entry_price;
                        position.last_price_check = Utc::now();
                        self.persist_position(&position).await?;
                    }
                    let needs_sell =
                        rules.target_profit_pct > 1.0 && position.exit_order_id.is_empty();
                    let id = position.id;
                    {
                        let mut state = self.state.write().await;
                        state.open.insert(id, position);
                    }
                    if needs_sell {
                        // Config may have changed across the restart.
                        self.place_take_profit_sell(id).await?;
                    }
                }
                PositionStatus::Selling => {
                    self.restore_selling(position, &rules).await?;
                }
                PositionStatus::Closed => {}
            }
        }
        Ok(())
    }

    async fn restore_live_pending(self: &Arc<Self>, position: Position) -> Result<()> {
        let Some(order) = self.orders.get(&position.entry_order_id).await? else {
            return Ok(());
        };
        if order.exchange_order_id.is_empty() {
            let mut state = self.state.write().await;
            state.pending.insert(position.id, position.clone());
            return self.cancel_pending(&mut state, &position).await;
        }

        match self.executor.fetch_order(&position.pair, &order.exchange_order_id).await {
            Ok(remote) if remote.is_filled() => {
                let mut state = self.state.write().await;
                state.pending.insert(position.id, position.clone());
                let synthetic = OrderEvent {
                    exchange_order_id: order.exchange_order_id.clone(),
                    client_order_id: order.client_order_id.clone(),
                    pair: position.pair.clone(),
                    side: Side::Buy,
                    status: OrderEventStatus::Done,
                    original_qty: remote.original_amount,
                    executed_qty: remote.original_amount,
                    remaining_qty: 0.0,
                    avg_price: remote.price,
                    at_ms: Utc::now().timestamp_millis(),
                };
                self.on_entry_filled(&mut state, position.id, &synthetic).await
            }
            Ok(remote) if remote.is_cancelled() => {
                let mut state = self.state.write().await;
                state.pending.insert(position.id, position.clone());
                self.cancel_pending(&mut state, &position).await
            }
            Ok(_) => {
                let mut state = self.state.write().await;
                state.pending.insert(position.id, position);
                Ok(())
            }
            Err(e) => {
                warn!("Restore query for position {} failed: {}", position.id, e);
                let mut state = self.state.write().await;
                state.pending.insert(position.id, position);
                Ok(())
            }
        }
    }

    async fn restore_selling(self: &Arc<Self>, position: Position, rules: &MomentumRules) -> Result<()> {
        let sell = if position.exit_order_id.is_empty() {
            None
        } else {
            self.orders.get(&position.exit_order_id).await?
        };

        let remote = match &sell {
            Some(order) if !order.exchange_order_id.is_empty() && !position.paper => self
                .executor
                .fetch_order(&position.pair, &order.exchange_order_id)
                .await
                .ok(),
            _ => None,
        };

        if let (Some(order), Some(remote)) = (&sell, &remote) {
            if remote.is_filled() {
                let mut state = self.state.write().await;
                state.open.insert(position.id, position.clone());
                let synthetic = OrderEvent {
                    exchange_order_id: order.exchange_order_id.clone(),
                    client_order_id: order.client_order_id.clone(),
                    pair: position.pair.clone(),
                    side: Side::Sell,
                    status: OrderEventStatus::Done,
                    original_qty: remote.original_amount,
                    executed_qty: remote.original_amount,
                    remaining_qty: 0.0,
                    avg_price: remote.price,
                    at_ms: Utc::now().timestamp_millis(),
                };
                return self.on_exit_filled(&mut state, position.id, &synthetic).await;
            }
            if remote.is_open() {
                let mut state = self.state.write().await;
                state.open.insert(position.id, position);
                return Ok(());
            }
        } else if sell.is_some() && position.paper {
            // Paper sell still simulated as resting.
            let mut state = self.state.write().await;
            state.open.insert(position.id, position);
            return Ok(());
        }

        // Sell vanished or was cancelled: back to Open, then either a
        // fresh take-profit or plain ATH monitoring.
        let id = position.id;
        {
            let mut state = self.state.write().await;
            let mut position = position;
            position.status = PositionStatus::Open;
            position.exit_order_id = String::new();
            self.persist_position(&position).await?;
            state.open.insert(id, position);
        }
        if rules.target_profit_pct > 1.0 {
            self.place_take_profit_sell(id).await?;
        }
        Ok(())
    }

    /// Stop-side cleanup: persist status; working entry orders are
    /// cancelled so no orphaned buys keep filling while stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let pending: Vec<Position> = state.pending.values().cloned().collect();
        for position in pending {
            if let Err(e) = self.cancel_pending(&mut state, &position).await {
                warn!("Shutdown cancel of position {} failed: {}", position.id, e);
            }
        }
        if state.bot.status == BotStatus::Running {
            state.bot.status = BotStatus::Stopped;
        }
        self.persist_bot(&mut state).await?;
        Ok(())
    }

    #[cfg(test)]
    async fn snapshot(&self) -> (BotConfig, Vec<Position>, Vec<Position>) {
        let state = self.state.read().await;
        (
            state.bot.clone(),
            state.pending.values().cloned().collect(),
            state.open.values().cloned().collect(),
        )
    }
}
