//! Spread Maker runtime: one live limit order, kept at the top of book
//!
//! The instance owns its virtual balances, the single active order and
//! the cached pair metadata. Tickers and order events serialize on the
//! same state lock, so fill credits never interleave with placement
//! debits. The placeholder-before-call protocol keeps the "at most one
//! active order" invariant even while a placement is in flight.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
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
    BookTicker, BotConfig, BotOrder, BotStatus, Coin, OrderStatus, OrderType, PairInfo,
    ParentKind, Side, SpreadRules, QUOTE_CURRENCY,
};
use crate::utils::{align_price, floor_to_precision, normalize_balances, validate_order_amount};

#[derive(Debug, Serialize)]
struct SpreadBotUpdate {
    bot_id: u64,
    status: &'static str,
    pair: String,
    best_bid: f64,
    best_ask: f64,
    spread_pct: f64,
    balances: std::collections::HashMap<String, f64>,
    stats: crate::types::BotStats,
    avg_buy_price: Option<f64>,
}

struct SpreadState {
    bot: BotConfig,
    active_order: Option<BotOrder>,
    last_action_at: DateTime<Utc>,
    /// Realized profit accumulated across the active order's fills.
    active_order_profit: f64,
}

pub struct SpreadMakerBot {
    settings: Arc<Settings>,
    store: Arc<dyn KvStore>,
    keys: Keys,
    bus: Arc<NotificationBus>,
    orders: Arc<OrderRepo>,
    executor: Arc<dyn TradeExecutor>,
    pair_info: PairInfo,
    state: RwLock<SpreadState>,
    /// Shared with the manager; either side may signal. Sending twice
    /// is harmless, which is what makes double-stop safe.
    stop: Arc<watch::Sender<bool>>,
}

impl SpreadMakerBot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn KvStore>,
        keys: Keys,
        bus: Arc<NotificationBus>,
        orders: Arc<OrderRepo>,
        executor: Arc<dyn TradeExecutor>,
        pair_info: PairInfo,
        bot: BotConfig,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        SpreadMakerBot {
            settings,
            store,
            keys,
            bus,
            orders,
            executor,
            pair_info,
            state: RwLock::new(SpreadState {
                bot,
                active_order: None,
                last_action_at: DateTime::<Utc>::MIN_UTC,
                active_order_profit: 0.0,
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

    pub fn pair(&self) -> &str {
        &self.pair_info.id
    }

    /// Event loop: stop signal or next ticker. Queued tickers collapse
    /// to the freshest one.
    pub fn spawn(self: Arc<Self>, mut ticker_rx: mpsc::Receiver<BookTicker>) {
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    ticker = ticker_rx.recv() => {
                        let Some(mut ticker) = ticker else { break };
                        while let Ok(newer) = ticker_rx.try_recv() {
                            ticker = newer;
                        }
                        if let Err(e) = self.handle_ticker(&ticker).await {
                            error!("Spread bot ticker handling failed: {}", e);
                        }
                    }
                }
            }
            debug!("Spread bot event loop ended");
        });
    }

    fn rules(bot: &BotConfig) -> SpreadRules {
        bot.spread_rules().cloned().unwrap_or(SpreadRules {
            min_gap_pct: 0.2,
            order_size_idr: 0.0,
        })
    }

    fn price_tick(&self) -> f64 {
        if self.pair_info.tick_size > 0.0 {
            self.pair_info.tick_size
        } else {
            10f64.powi(-(self.pair_info.price_precision as i32))
        }
    }

    async fn persist_bot(&self, bot: &mut BotConfig) -> Result<()> {
        bot.updated_at = Utc::now();
        self.store.set_json(&self.keys.bot(bot.id), bot).await
    }

    async fn publish_bot_update(&self, state: &SpreadState, ticker: &BookTicker) {
        let update = SpreadBotUpdate {
            bot_id: state.bot.id,
            status: state.bot.status.as_str(),
            pair: self.pair_info.id.clone(),
            best_bid: ticker.best_bid,
            best_ask: ticker.best_ask,
            spread_pct: ticker.spread_pct(),
            balances: state.bot.balances.clone(),
            stats: state.bot.stats,
            avg_buy_price: state.bot.cost_basis.avg_buy_price(),
        };
        self.bus.notify_bot_update(state.bot.user_id, &update).await;
    }

    pub async fn handle_ticker(&self, ticker: &BookTicker) -> Result<()> {
        let mut state = self.state.write().await;
        if state.bot.status != BotStatus::Running {
            return Ok(());
        }

        let base = self.pair_info.base.clone();
        let initial_balance_idr = state.bot.initial_balance_idr;
        let repaired = normalize_balances(
            &mut state.bot.balances,
            QUOTE_CURRENCY,
            &[QUOTE_CURRENCY, base.as_str()],
            initial_balance_idr,
            self.settings.max_reasonable_balance_idr,
            self.settings.max_reasonable_coin_amount,
        );
        if repaired {
            warn!("Bot {} balances were repaired", state.bot.id);
            let mut bot = state.bot.clone();
            self.persist_bot(&mut bot).await?;
            state.bot = bot;
        }

        self.publish_bot_update(&state, ticker).await;

        if state.active_order.is_some() {
            return self.check_reposition(&mut state, ticker).await;
        }

        let rules = Self::rules(&state.bot);
        if ticker.spread_pct() < rules.min_gap_pct {
            return Ok(());
        }

        if self.volatility_blocks_sell(&state, ticker).await? {
            debug!("Bot {} skipping ticker: volatile and underwater", state.bot.id);
            return Ok(());
        }

        self.place_new_order(&mut state, ticker).await
    }

    /// High 1-minute volatility while holding inventory that could only
    /// be sold at a loss is a bad time to quote.
    async fn volatility_blocks_sell(&self, state: &SpreadState, ticker: &BookTicker) -> Result<bool> {
        let coin: Option<Coin> = self.store.get_json(&self.keys.coin(&self.pair_info.id)).await?;
        let Some(coin) = coin else { return Ok(false) };
        if coin.volatility_1m <= self.settings.volatility_skip_pct {
            return Ok(false);
        }

        let base_balance = floor_to_precision(
            state.bot.balances.get(&self.pair_info.base).copied().unwrap_or(0.0),
            self.pair_info.volume_precision,
        );
        if base_balance < self.pair_info.min_base_amount {
            return Ok(false);
        }

        let Some(avg) = state.bot.cost_basis.avg_buy_price() else { return Ok(false) };
        let sell_price = self.competitive_price(Side::Sell, ticker, None);
        Ok(sell_price < avg)
    }

    /// Competitive quote: match the best level when it is ours or the
    /// only one, otherwise improve it by one tick.
    fn competitive_price(&self, side: Side, ticker: &BookTicker, our_remaining: Option<f64>) -> f64 {
        let tick = self.price_tick();
        let raw = match side {
            Side::Buy => {
                let top_is_ours = our_remaining
                    .zip(ticker.bids.first())
                    .map(|(remaining, top)| (top.base_volume - remaining).abs() < 1e-9)
                    .unwrap_or(false);
                if ticker.bids.len() <= 1 || top_is_ours {
                    ticker.best_bid
                } else {
                    ticker.best_bid + tick
                }
            }
            Side::Sell => {
                let top_is_ours = our_remaining
                    .zip(ticker.asks.first())
                    .map(|(remaining, top)| (top.base_volume - remaining).abs() < 1e-9)
                    .unwrap_or(false);
                if ticker.asks.len() <= 1 || top_is_ours {
                    ticker.best_ask
                } else {
                    ticker.best_ask - tick
                }
            }
        };
        align_price(raw, &self.pair_info)
    }

    /// Depth guard: enough levels, enough resting volume, and for buys
    /// no thin-market cliff right under the top bid.
    fn depth_sufficient(&self, side: Side, ticker: &BookTicker, order_size_idr: f64) -> bool {
        let levels = match side {
            Side::Buy => &ticker.bids,
            Side::Sell => &ticker.asks,
        };
        if levels.len() < self.settings.depth_min_levels {
            return false;
        }
        let total_quote: f64 = levels.iter().map(|l| l.quote_volume).sum();
        if total_quote < self.settings.depth_volume_multiple * order_size_idr {
            return false;
        }
        if side == Side::Buy {
            let top = levels[0].price;
            let second = levels[1].price;
            if second > 0.0 {
                let bid_gap_pct = (top - second) / second * 100.0;
                if bid_gap_pct >= self.settings.thin_bid_gap_pct {
                    return false;
                }
            }
        }
        true
    }

    fn debounced(&self, state: &SpreadState) -> bool {
        (Utc::now() - state.last_action_at).num_seconds() < self.settings.order_debounce_secs
    }

    async fn place_new_order(&self, state: &mut SpreadState, ticker: &BookTicker) -> Result<()> {
        if self.debounced(state) {
            return Ok(());
        }

        let rules = Self::rules(&state.bot);
        let base_balance = floor_to_precision(
            state.bot.balances.get(&self.pair_info.base).copied().unwrap_or(0.0),
            self.pair_info.volume_precision,
        );
        let quote_balance = state.bot.balances.get(QUOTE_CURRENCY).copied().unwrap_or(0.0);

        let side = if base_balance >= self.pair_info.min_base_amount {
            Side::Sell
        } else if quote_balance >= rules.order_size_idr && rules.order_size_idr > 0.0 {
            Side::Buy
        } else {
            return Ok(());
        };

        let price = self.competitive_price(side, ticker, None);
        if price <= 0.0 {
            return Ok(());
        }

        let order_size_idr = match side {
            Side::Buy => rules.order_size_idr,
            Side::Sell => base_balance * price,
        };
        if !self.depth_sufficient(side, ticker, order_size_idr) {
            debug!("Bot {} skipping: book too thin for {}", state.bot.id, side.as_str());
            return Ok(());
        }

        if side == Side::Sell {
            if let Some(avg) = state.bot.cost_basis.avg_buy_price() {
                let min_profitable = avg * (1.0 + rules.min_gap_pct / 100.0);
                let max_loss_floor = avg * (1.0 - self.settings.max_sell_loss_pct / 100.0);
                if price < min_profitable || price < max_loss_floor {
                    debug!(
                        "Bot {} holding sell: {} under guard (avg {})",
                        state.bot.id, price, avg
                    );
                    return Ok(());
                }
            }
        }

        let raw_amount = match side {
            Side::Buy => rules.order_size_idr / price,
            Side::Sell => base_balance,
        };
        let amount = match validate_order_amount(
            raw_amount,
            price,
            &self.pair_info,
            self.settings.max_reasonable_coin_amount,
        ) {
            Ok(amount) => amount,
            Err(e) => {
                debug!("Bot {} order amount rejected: {}", state.bot.id, e);
                return Ok(());
            }
        };

        let now = Utc::now();
        let client_order_id =
            bot_client_order_id(state.bot.id, &self.pair_info.id, side, now.timestamp_millis());
        let mut order = new_order(
            state.bot.user_id,
            ParentKind::Bot,
            state.bot.id,
            client_order_id.clone(),
            self.pair_info.id.clone(),
            side,
            OrderType::Limit,
            price,
            amount,
            state.bot.paper,
        );

        // Placeholder goes in before the call so a concurrent ticker
        // sees an active order and cannot double-place.
        state.active_order = Some(order.clone());
        state.active_order_profit = 0.0;
        state.last_action_at = now;
        self.orders.insert(&order).await?;

        let placed = self
            .executor
            .place_order(&PlaceOrder {
                pair: self.pair_info.id.clone(),
                side,
                order_type: OrderType::Limit,
                price,
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

                // The full committed amount is locked immediately.
                match side {
                    Side::Buy => {
                        *state.bot.balances.entry(QUOTE_CURRENCY.to_string()).or_insert(0.0) -=
                            price * amount;
                    }
                    Side::Sell => {
                        *state.bot.balances.entry(self.pair_info.base.clone()).or_insert(0.0) -=
                            amount;
                    }
                }
                state.active_order = Some(order.clone());
                let mut bot = state.bot.clone();
                self.persist_bot(&mut bot).await?;
                state.bot = bot;

                info!(
                    "📌 Bot {} placed {} {} {} @ {}",
                    state.bot.id,
                    side.as_str(),
                    amount,
                    self.pair_info.id,
                    price
                );
                self.bus.notify_order_update(state.bot.user_id, &order).await;
                self.publish_bot_update(state, ticker).await;
            }
            Err(e) => {
                order.status = OrderStatus::Cancelled;
                self.orders.update(&mut order).await?;
                state.active_order = None;

                if e.is_rate_limited() {
                    warn!("Bot {} rate limited on place, backing off", state.bot.id);
                } else if e.is_credential() && !state.bot.paper {
                    self.fail_bot(state, &e.to_string()).await?;
                } else {
                    error!("Bot {} order placement failed: {}", state.bot.id, e);
                }
            }
        }

        Ok(())
    }

    async fn check_reposition(&self, state: &mut SpreadState, ticker: &BookTicker) -> Result<()> {
        let Some(order) = state.active_order.clone() else { return Ok(()) };

        // Pending means a placement is in flight, pending-confirmation
        // means the stream owns the outcome. Neither is ours to touch.
        if matches!(order.status, OrderStatus::Pending | OrderStatus::PendingConfirmation) {
            return Ok(());
        }
        if self.debounced(state) {
            return Ok(());
        }

        let rules = Self::rules(&state.bot);
        let remaining = order.amount - order.filled_amount;

        if ticker.spread_pct() < rules.min_gap_pct {
            match order.side {
                Side::Buy => {
                    // Market tightened under our feet; a fill here could
                    // not be sold at the configured gap.
                    return self.cancel_active(state, "spread below minimum").await;
                }
                Side::Sell => {
                    if let Some(avg) = state.bot.cost_basis.avg_buy_price() {
                        if order.price >= avg * (1.0 + rules.min_gap_pct / 100.0) {
                            return Ok(());
                        }
                    }
                    return self.cancel_active(state, "spread below minimum").await;
                }
            }
        }

        let competitive = self.competitive_price(order.side, ticker, Some(remaining));
        if (order.price - competitive).abs() > self.settings.reposition_tolerance {
            return self.cancel_active(state, "repositioning").await;
        }

        if order.side == Side::Buy
            && !self.depth_sufficient(Side::Buy, ticker, order.price * remaining)
        {
            return self.cancel_active(state, "depth dried up").await;
        }

        Ok(())
    }

    /// Cancel the active order. On success funds are restored right
    /// away; a later stream echo finds the record terminal and becomes
    /// a no-op. Replacement waits for the next ticker so we never race
    /// a cancel against a place on the exchange.
    async fn cancel_active(&self, state: &mut SpreadState, reason: &str) -> Result<()> {
        let Some(mut order) = state.active_order.clone() else { return Ok(()) };
        state.last_action_at = Utc::now();

        info!("Bot {} cancelling order {}: {}", state.bot.id, order.id, reason);

        match self
            .executor
            .cancel_order(&self.pair_info.id, &order.exchange_order_id, order.side)
            .await
        {
            Ok(()) => {
                let filled_amount = order.filled_amount;
                self.apply_cancel(state, &mut order, filled_amount).await?;
                state.active_order = None;
            }
            Err(e) if e.is_order_missing() => {
                // Already terminal on the exchange; the private stream
                // reports which way it went.
                order.status = OrderStatus::PendingConfirmation;
                self.orders.update(&mut order).await?;
                state.active_order = Some(order);
            }
            Err(e) if e.is_rate_limited() => {
                warn!("Bot {} rate limited on cancel, retrying next tick", state.bot.id);
            }
            Err(e) => {
                error!("Bot {} cancel failed: {}", state.bot.id, e);
            }
        }

        Ok(())
    }

    /// Credit a fill delta and track cost basis and realized profit.
    fn apply_fill_delta(
        &self,
        state: &mut SpreadState,
        order: &mut BotOrder,
        delta: f64,
        price: f64,
    ) {
        match order.side {
            Side::Buy => {
                *state.bot.balances.entry(self.pair_info.base.clone()).or_insert(0.0) += delta;
                state.bot.cost_basis.add_buy(delta, price);
            }
            Side::Sell => {
                *state.bot.balances.entry(QUOTE_CURRENCY.to_string()).or_insert(0.0) +=
                    delta * price;
                if let Some(avg) = state.bot.cost_basis.avg_buy_price() {
                    let gross = (price - avg) * delta;
                    let fee = self.settings.fee_rate_pct / 100.0 * price * delta;
                    let realized = gross - fee;
                    state.bot.stats.total_profit_idr += realized;
                    state.active_order_profit += realized;
                }
                state.bot.cost_basis.reduce_sell(delta);
            }
        }
        order.filled_amount += delta;
    }

    /// Restore the unfilled lock of a cancelled order and record the
    /// terminal status. `executed_qty` is the exchange's cumulative
    /// count at cancel time; any unseen fill delta is credited first.
    async fn apply_cancel(
        &self,
        state: &mut SpreadState,
        order: &mut BotOrder,
        executed_qty: f64,
    ) -> Result<()> {
        if order.status.is_terminal() {
            return Ok(());
        }

        let catch_up = executed_qty - order.filled_amount;
        if catch_up > 0.0 {
            self.apply_fill_delta(state, order, catch_up, order.price);
        }

        let unfilled = (order.amount - order.filled_amount).max(0.0);
        match order.side {
            Side::Buy => {
                *state.bot.balances.entry(QUOTE_CURRENCY.to_string()).or_insert(0.0) +=
                    unfilled * order.price;
            }
            Side::Sell => {
                *state.bot.balances.entry(self.pair_info.base.clone()).or_insert(0.0) += unfilled;
            }
        }

        order.status = if order.filled_amount > 0.0 {
            OrderStatus::Partial
        } else {
            OrderStatus::Cancelled
        };
        self.orders.update(order).await?;

        let mut bot = state.bot.clone();
        self.persist_bot(&mut bot).await?;
        state.bot = bot;

        self.bus.notify_order_update(state.bot.user_id, order).await;
        Ok(())
    }

    /// Credential failures stop a live bot hard.
    async fn fail_bot(&self, state: &mut SpreadState, message: &str) -> Result<()> {
        error!("Bot {} stopping with error: {}", state.bot.id, message);
        state.bot.status = BotStatus::Error;
        let mut bot = state.bot.clone();
        self.persist_bot(&mut bot).await?;
        state.bot = bot;
        self.stop.send_replace(true);
        Ok(())
    }

    async fn stop_with_bounded_loss(&self, state: &mut SpreadState) -> Result<()> {
        warn!(
            "Bot {} hit bounded loss ({} <= -{})",
            state.bot.id, state.bot.stats.total_profit_idr, state.bot.max_loss_idr
        );
        state.bot.status = BotStatus::Stopped;
        let mut bot = state.bot.clone();
        self.persist_bot(&mut bot).await?;
        state.bot = bot;
        self.stop.send_replace(true);
        Ok(())
    }

    /// Reconciler entry point: an order event for this bot's user.
    pub async fn on_order_event(&self, user_id: u64, event: &OrderEvent) {
        let mut state = self.state.write().await;
        if state.bot.user_id != user_id {
            return;
        }

        let matches_active = state
            .active_order
            .as_ref()
            .map(|o| {
                o.client_order_id == event.client_order_id
                    || (!o.exchange_order_id.is_empty()
                        && o.exchange_order_id == event.exchange_order_id)
            })
            .unwrap_or(false);

        if matches_active {
            let order = state.active_order.clone().unwrap();
            if let Err(e) = self.process_event_for_order(&mut state, order, event, true).await {
                error!("Bot {} event processing failed: {}", state.bot.id, e);
            }
            return;
        }

        // Not the active order: pending-confirmation outcomes and
        // sweeper leftovers still resolve through here.
        match self
            .orders
            .find_by_event_keys(&event.client_order_id, &event.exchange_order_id)
            .await
        {
            Ok(Some(order)) => {
                if order.parent_kind == ParentKind::Bot
                    && order.parent_id == state.bot.id
                    && !order.status.is_terminal()
                {
                    if let Err(e) =
                        self.process_event_for_order(&mut state, order, event, false).await
                    {
                        error!("Bot {} stray-event processing failed: {}", state.bot.id, e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => error!("Bot {} order lookup failed: {}", state.bot.id, e),
        }
    }

    async fn process_event_for_order(
        &self,
        state: &mut SpreadState,
        mut order: BotOrder,
        event: &OrderEvent,
        is_active: bool,
    ) -> Result<()> {
        match event.status {
            OrderEventStatus::Open => {
                if order.status == OrderStatus::Pending {
                    order.status = OrderStatus::Open;
                    self.orders.update(&mut order).await?;
                    if is_active {
                        state.active_order = Some(order);
                    }
                }
            }
            OrderEventStatus::Fill | OrderEventStatus::Done => {
                let price = if event.avg_price > 0.0 { event.avg_price } else { order.price };
                let delta = event.executed_qty - order.filled_amount;
                if delta > 0.0 {
                    self.apply_fill_delta(state, &mut order, delta, price);
                }

                let complete = event.remaining_qty <= 0.0
                    || event.executed_qty >= order.amount - 1e-12;
                if complete {
                    if order.status != OrderStatus::Filled {
                        order.status = OrderStatus::Filled;
                        order.filled_at = Some(Utc::now());
                        state.bot.stats.total_trades += 1;
                        if order.side == Side::Sell && state.active_order_profit > 0.0 {
                            state.bot.stats.winning_trades += 1;
                        }
                    }
                    if is_active {
                        state.active_order = None;
                        state.active_order_profit = 0.0;
                    }
                } else if is_active {
                    // Partially executed and still resting: keep it
                    // active so repositioning manages the remainder.
                    order.status = OrderStatus::Open;
                    state.active_order = Some(order.clone());
                }

                self.orders.update(&mut order).await?;
                let mut bot = state.bot.clone();
                self.persist_bot(&mut bot).await?;
                state.bot = bot;

                self.bus.notify_order_update(state.bot.user_id, &order).await;

                if complete
                    && state.bot.max_loss_idr > 0.0
                    && state.bot.stats.total_profit_idr <= -state.bot.max_loss_idr
                {
                    self.stop_with_bounded_loss(state).await?;
                }
            }
            OrderEventStatus::Cancelled => {
                self.apply_cancel(state, &mut order, event.executed_qty).await?;
                if is_active {
                    state.active_order = None;
                }
            }
        }
        Ok(())
    }

    /// Reconcile the most recent stored order on bot start.
    pub async fn restore(&self) -> Result<()> {
        let Some(order) = self.orders.latest_order_for_bot(self.bot_id().await).await? else {
            return Ok(());
        };
        if order.status.is_terminal() {
            return Ok(());
        }
        let mut order = order;
        let mut state = self.state.write().await;

        if state.bot.paper {
            let age = (Utc::now() - order.created_at).num_seconds();
            if age > self.settings.paper_stale_order_secs {
                info!("Bot {} discarding stale paper order {}", state.bot.id, order.id);
                let filled_amount = order.filled_amount;
                return self.apply_cancel(&mut state, &mut order, filled_amount).await;
            }
            state.active_order = Some(order);
            return Ok(());
        }

        if order.exchange_order_id.is_empty() {
            // Never confirmed by the exchange; treat as unplaced.
            let filled_amount = order.filled_amount;
            return self.apply_cancel(&mut state, &mut order, filled_amount).await;
        }

        match self
            .executor
            .fetch_order(&self.pair_info.id, &order.exchange_order_id)
            .await
        {
            Ok(remote) if remote.is_filled() => {
                let delta = remote.original_amount - order.filled_amount;
                if delta > 0.0 {
                    self.apply_fill_delta(&mut state, &mut order, delta, remote.price);
                }
                order.status = OrderStatus::Filled;
                order.filled_at = Some(Utc::now());
                state.bot.stats.total_trades += 1;
                self.orders.update(&mut order).await?;
                let mut bot = state.bot.clone();
                self.persist_bot(&mut bot).await?;
                state.bot = bot;
            }
            Ok(remote) if remote.is_cancelled() => {
                self.apply_cancel(&mut state, &mut order, remote.executed_amount()).await?;
            }
            Ok(remote) => {
                // Still open: catch up any executed delta and adopt it.
                let delta = remote.executed_amount() - order.filled_amount;
                if delta > 0.0 {
                    self.apply_fill_delta(&mut state, &mut order, delta, remote.price);
                    let mut bot = state.bot.clone();
                    self.persist_bot(&mut bot).await?;
                    state.bot = bot;
                }
                order.status = OrderStatus::Open;
                self.orders.update(&mut order).await?;
                state.active_order = Some(order);
            }
            Err(e) if e.is_order_missing() => {
                order.status = OrderStatus::PendingConfirmation;
                self.orders.update(&mut order).await?;
                state.active_order = Some(order);
            }
            Err(e) => {
                warn!("Bot {} restore query failed: {}", state.bot.id, e);
            }
        }

        Ok(())
    }

    /// Background sweep: one open order may exist. Older duplicates are
    /// cancelled, and even the newest goes once it exceeds the stale
    /// age. Restoration rules apply to every cancelled portion.
    pub async fn sweep(&self) -> Result<()> {
        let bot_id = self.bot_id().await;
        let open = self.orders.open_orders_for_bot(bot_id).await?;
        if open.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        for (index, order) in open.into_iter().enumerate() {
            let age = (Utc::now() - order.created_at).num_seconds();
            let newest = index == 0;
            if newest && age <= self.settings.stale_order_max_age_secs {
                continue;
            }

            let mut order = order;
            info!(
                "🧹 Bot {} sweeping order {} ({}, {}s old)",
                state.bot.id,
                order.id,
                if newest { "stale" } else { "duplicate" },
                age
            );

            if !order.exchange_order_id.is_empty() {
                match self
                    .executor
                    .cancel_order(&self.pair_info.id, &order.exchange_order_id, order.side)
                    .await
                {
                    Ok(()) | Err(crate::error::EngineError::OrderMissing(_)) => {}
                    Err(e) => {
                        warn!("Bot {} sweep cancel failed for {}: {}", state.bot.id, order.id, e);
                        continue;
                    }
                }
            }

            let filled_amount = order.filled_amount;
            self.apply_cancel(&mut state, &mut order, filled_amount).await?;
            let is_active = state
                .active_order
                .as_ref()
                .map(|o| o.id == order.id)
                .unwrap_or(false);
            if is_active {
                state.active_order = None;
            }
        }

        Ok(())
    }

    /// Stop-side cleanup: cancel the active order and restore its lock.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(mut order) = state.active_order.take() {
            if !order.exchange_order_id.is_empty() {
                match self
                    .executor
                    .cancel_order(&self.pair_info.id, &order.exchange_order_id, order.side)
                    .await
                {
                    Ok(()) | Err(crate::error::EngineError::OrderMissing(_)) => {}
                    Err(e) => warn!("Bot {} shutdown cancel failed: {}", state.bot.id, e),
                }
            }
            let filled_amount = order.filled_amount;
            self.apply_cancel(&mut state, &mut order, filled_amount).await?;
        }
        if state.bot.status == BotStatus::Running {
            state.bot.status = BotStatus::Stopped;
        }
        let mut bot = state.bot.clone();
        self.persist_bot(&mut bot).await?;
        state.bot = bot;
        Ok(())
    }

    #[cfg(test)]
    async fn snapshot(&self) -> (BotConfig, Option<BotOrder>) {
        let state = self.state.read().await;
        (state.bot.clone(), state.active_order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PaperExecutor;
    use crate::store::InMemoryStore;
    use crate::types::{BotKind, BotRules, BotStats, CostBasis, DepthLevel};
    use std::collections::HashMap;
    use std::time::Duration;

    fn pair(tick: f64) -> PairInfo {
        PairInfo {
            id: "btcidr".to_string(),
            base: "btc".to_string(),
            quote: "idr".to_string(),
            volume_precision: 8,
            price_precision: 0,
            min_base_amount: 0.0001,
            min_quote_amount: 10_000.0,
            tick_size: tick,
        }
    }

    fn settings(debounce_secs: i64, fee_rate_pct: f64) -> Settings {
        toml::from_str(&format!(
            r#"
            rest_base_url = "https://exchange.test"
            public_ws_url = "wss://exchange.test/public"
            private_ws_url = "wss://exchange.test/private"
            order_debounce_secs = {}
            fee_rate_pct = {}
            "#,
            debounce_secs, fee_rate_pct
        ))
        .unwrap()
    }

    fn bot_config(initial: f64, order_size: f64, min_gap: f64) -> BotConfig {
        let mut balances = HashMap::new();
        balances.insert(QUOTE_CURRENCY.to_string(), initial);
        balances.insert("btc".to_string(), 0.0);
        BotConfig {
            id: 1,
            user_id: 1,
            name: "maker".to_string(),
            kind: BotKind::SpreadMaker,
            pair: "btcidr".to_string(),
            paper: true,
            initial_balance_idr: initial,
            balances,
            status: BotStatus::Running,
            max_loss_idr: 1_000_000.0,
            rules: BotRules::Spread(SpreadRules { min_gap_pct: min_gap, order_size_idr: order_size }),
            stats: BotStats::default(),
            cost_basis: CostBasis::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn deep_ticker(bid: f64, ask: f64) -> BookTicker {
        let level = |price: f64| DepthLevel { price, quote_volume: 300_000.0, base_volume: 0.3 };
        BookTicker {
            pair_id: "btcidr".to_string(),
            best_bid: bid,
            best_ask: ask,
            bids: vec![level(bid), level(bid - 1_000.0), level(bid - 2_000.0)],
            asks: vec![level(ask), level(ask + 1_000.0), level(ask + 2_000.0)],
            at_ms: 1,
        }
    }

    struct Fixture {
        bot: Arc<SpreadMakerBot>,
        paper_rx: mpsc::UnboundedReceiver<(u64, OrderEvent)>,
        store: Arc<InMemoryStore>,
        keys: Keys,
    }

    async fn fixture_with(settings: Settings, config: BotConfig, pair_info: PairInfo) -> Fixture {
        let settings = Arc::new(settings);
        let store = Arc::new(InMemoryStore::new());
        let keys = Keys::new("test");
        let bus = Arc::new(NotificationBus::new(store.clone(), keys.clone()));
        let orders = Arc::new(OrderRepo::new(store.clone(), keys.clone()));
        let (paper_tx, paper_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(PaperExecutor::new(
            config.user_id,
            config.balances.clone(),
            Duration::from_secs(settings.paper_fill_delay_secs),
            paper_tx,
        ));
        let (stop_tx, _stop_rx) = watch::channel(false);
        store.set_json(&keys.bot(config.id), &config).await.unwrap();
        let bot = Arc::new(SpreadMakerBot::new(
            settings,
            store.clone(),
            keys.clone(),
            bus,
            orders,
            executor,
            pair_info,
            config,
            Arc::new(stop_tx),
        ));
        Fixture { bot, paper_rx, store, keys }
    }

    #[tokio::test]
    async fn test_scenario_buy_placement_and_paper_fill() {
        tokio::time::pause();
        let mut f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        // bid 1,000,000 / ask 1,002,500 -> spread 0.25% >= 0.2%.
        let ticker = deep_ticker(1_000_000.0, 1_002_500.0);
        f.bot.handle_ticker(&ticker).await.unwrap();

        let (bot, active) = f.bot.snapshot().await;
        let order = active.expect("buy order placed");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, OrderStatus::Open);
        // Outbid: best bid plus one tick.
        assert_eq!(order.price, 1_001_000.0);

        // ~100k locked immediately (modulo amount flooring).
        let quote = bot.balances[QUOTE_CURRENCY];
        assert!((10_000_000.0 - quote - 100_000.0).abs() < 5.0, "quote = {}", quote);

        // Paper fill arrives after the artificial delay.
        tokio::time::advance(Duration::from_secs(6)).await;
        let (user_id, event) = f.paper_rx.recv().await.unwrap();
        f.bot.on_order_event(user_id, &event).await;

        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        let base = bot.balances["btc"];
        assert!((base - 0.0999).abs() < 1e-4, "base = {}", base);
        // Quote untouched by the fill itself.
        assert!((10_000_000.0 - bot.balances[QUOTE_CURRENCY] - 100_000.0).abs() < 5.0);
        assert_eq!(bot.stats.total_trades, 1);
        let avg = bot.cost_basis.avg_buy_price().unwrap();
        assert!((avg - 1_001_000.0).abs() < 1e-6, "avg = {}", avg);
    }

    #[tokio::test]
    async fn test_scenario_profitable_sell_with_stats() {
        tokio::time::pause();
        let mut config = bot_config(10_000_000.0, 100_000.0, 0.2);
        config.balances.insert("btc".to_string(), 0.1);
        config.cost_basis = CostBasis { total_coin: 0.1, total_cost_idr: 100_000.0 };
        let mut f = fixture_with(settings(0, 0.0), config, pair(500.0)).await;

        // bid 1,005,000 / ask 1,005,500: sell undercuts the ask by one
        // tick to 1,005,000.
        let ticker = deep_ticker(1_005_000.0, 1_005_500.0);
        f.bot.handle_ticker(&ticker).await.unwrap();

        let (bot, active) = f.bot.snapshot().await;
        let order = active.expect("sell order placed");
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.price, 1_005_000.0);
        assert_eq!(order.amount, 0.1);
        // Base locked in full.
        assert_eq!(bot.balances["btc"], 0.0);

        tokio::time::advance(Duration::from_secs(6)).await;
        let (user_id, event) = f.paper_rx.recv().await.unwrap();
        f.bot.on_order_event(user_id, &event).await;

        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        assert!((bot.balances[QUOTE_CURRENCY] - 10_100_500.0).abs() < 1e-6);
        assert_eq!(bot.stats.total_trades, 1);
        assert_eq!(bot.stats.winning_trades, 1);
        assert!((bot.stats.total_profit_idr - 500.0).abs() < 1e-6);
        assert_eq!(bot.cost_basis.avg_buy_price(), None);
    }

    #[tokio::test]
    async fn test_fee_deduction_on_realized_profit() {
        tokio::time::pause();
        let mut config = bot_config(10_000_000.0, 100_000.0, 0.2);
        config.balances.insert("btc".to_string(), 0.1);
        config.cost_basis = CostBasis { total_coin: 0.1, total_cost_idr: 100_000.0 };
        let mut f = fixture_with(settings(0, 0.2), config, pair(500.0)).await;

        f.bot.handle_ticker(&deep_ticker(1_005_000.0, 1_005_500.0)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let (user_id, event) = f.paper_rx.recv().await.unwrap();
        f.bot.on_order_event(user_id, &event).await;

        let (bot, _) = f.bot.snapshot().await;
        // 500 gross minus 0.2% of 100,500 proceeds.
        let expected = 500.0 - 0.002 * 1_005_000.0 * 0.1;
        assert!((bot.stats.total_profit_idr - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_spread_below_min_gap_skipped_at_boundary() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        // Exactly 0.2%: proceeds.
        let at_boundary = deep_ticker(1_000_000.0, 1_002_000.0);
        f.bot.handle_ticker(&at_boundary).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn test_spread_strictly_below_min_gap_skips() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        let below = deep_ticker(1_000_000.0, 1_001_900.0);
        f.bot.handle_ticker(&below).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        assert!(active.is_none());
    }

    #[tokio::test]
    async fn test_placeholder_blocks_second_placement() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        let ticker = deep_ticker(1_000_000.0, 1_002_500.0);
        f.bot.handle_ticker(&ticker).await.unwrap();
        let (bot_after_first, first) = f.bot.snapshot().await;
        let first = first.unwrap();

        // Second ticker while the first order is active: repositioning
        // logic runs, no duplicate placement.
        f.bot.handle_ticker(&ticker).await.unwrap();
        let (bot_after_second, second) = f.bot.snapshot().await;
        let second = second.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            bot_after_first.balances[QUOTE_CURRENCY],
            bot_after_second.balances[QUOTE_CURRENCY]
        );
    }

    #[tokio::test]
    async fn test_thin_book_rejected() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        // Only two bid levels.
        let mut ticker = deep_ticker(1_000_000.0, 1_002_500.0);
        ticker.bids.truncate(2);
        f.bot.handle_ticker(&ticker).await.unwrap();
        assert!(f.bot.snapshot().await.1.is_none());

        // Three levels but top-two bid gap of 1% on a buy.
        let mut ticker = deep_ticker(1_000_000.0, 1_002_500.0);
        ticker.bids[1].price = 990_000.0;
        f.bot.handle_ticker(&ticker).await.unwrap();
        assert!(f.bot.snapshot().await.1.is_none());

        // Enough levels, not enough volume.
        let mut ticker = deep_ticker(1_000_000.0, 1_002_500.0);
        for level in ticker.bids.iter_mut() {
            level.quote_volume = 50_000.0;
        }
        f.bot.handle_ticker(&ticker).await.unwrap();
        assert!(f.bot.snapshot().await.1.is_none());
    }

    #[tokio::test]
    async fn test_sell_profit_guard_holds_unprofitable_sell() {
        let mut config = bot_config(10_000_000.0, 100_000.0, 0.2);
        config.balances.insert("btc".to_string(), 0.1);
        // Bought at 1,010,000; competitive sell would realize a loss.
        config.cost_basis = CostBasis { total_coin: 0.1, total_cost_idr: 101_000.0 };
        let f = fixture_with(settings(0, 0.0), config, pair(500.0)).await;

        f.bot.handle_ticker(&deep_ticker(1_005_000.0, 1_005_500.0)).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        assert!(active.is_none());
    }

    #[tokio::test]
    async fn test_partial_fill_then_done_then_duplicate() {
        tokio::time::pause();
        let mut f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.handle_ticker(&deep_ticker(1_000_000.0, 1_002_500.0)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let (_, fill) = f.paper_rx.recv().await.unwrap();
        let amount = fill.original_qty;
        let price = fill.avg_price;

        // Synthesize FILL at half, then DONE, then a duplicate DONE.
        let half = OrderEvent {
            status: OrderEventStatus::Fill,
            executed_qty: amount / 2.0,
            remaining_qty: amount / 2.0,
            ..fill.clone()
        };
        f.bot.on_order_event(1, &half).await;

        let (bot, active) = f.bot.snapshot().await;
        let order = active.expect("still active after partial");
        assert!((order.filled_amount - amount / 2.0).abs() < 1e-12);
        assert!((bot.balances["btc"] - amount / 2.0).abs() < 1e-12);

        let done = OrderEvent {
            status: OrderEventStatus::Done,
            executed_qty: amount,
            remaining_qty: 0.0,
            ..fill.clone()
        };
        f.bot.on_order_event(1, &done).await;

        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        assert!((bot.balances["btc"] - amount).abs() < 1e-12);
        assert_eq!(bot.stats.total_trades, 1);
        let quote_after = bot.balances[QUOTE_CURRENCY];

        // Duplicate DONE is a strict no-op.
        f.bot.on_order_event(1, &done).await;
        let (bot, _) = f.bot.snapshot().await;
        assert!((bot.balances["btc"] - amount).abs() < 1e-12);
        assert_eq!(bot.balances[QUOTE_CURRENCY], quote_after);
        assert_eq!(bot.stats.total_trades, 1);
        let _ = price;
    }

    #[tokio::test]
    async fn test_cancel_event_restores_exact_unfilled_lock() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.handle_ticker(&deep_ticker(1_000_000.0, 1_002_500.0)).await.unwrap();
        let (bot, active) = f.bot.snapshot().await;
        let order = active.unwrap();
        let locked = 10_000_000.0 - bot.balances[QUOTE_CURRENCY];
        assert!(locked > 0.0);

        let cancel = OrderEvent {
            exchange_order_id: order.exchange_order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            pair: "btcidr".to_string(),
            side: Side::Buy,
            status: OrderEventStatus::Cancelled,
            original_qty: order.amount,
            executed_qty: 0.0,
            remaining_qty: order.amount,
            avg_price: 0.0,
            at_ms: 2,
        };
        f.bot.on_order_event(1, &cancel).await;

        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        // Zero-fill cancel restores the balance to the idr before place.
        assert!((bot.balances[QUOTE_CURRENCY] - 10_000_000.0).abs() < 1e-6);

        let stored = f
            .store
            .get_json::<BotOrder>(&f.keys.order(&order.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_partial_cancel_keeps_partial_status() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.handle_ticker(&deep_ticker(1_000_000.0, 1_002_500.0)).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        let order = active.unwrap();

        let cancel = OrderEvent {
            exchange_order_id: order.exchange_order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            pair: "btcidr".to_string(),
            side: Side::Buy,
            status: OrderEventStatus::Cancelled,
            original_qty: order.amount,
            executed_qty: order.amount / 2.0,
            remaining_qty: order.amount / 2.0,
            avg_price: order.price,
            at_ms: 2,
        };
        f.bot.on_order_event(1, &cancel).await;

        let (bot, _) = f.bot.snapshot().await;
        assert!((bot.balances["btc"] - order.amount / 2.0).abs() < 1e-12);

        let stored = f
            .store
            .get_json::<BotOrder>(&f.keys.order(&order.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OrderStatus::Partial);
    }

    #[tokio::test]
    async fn test_reposition_cancels_when_outbid() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.handle_ticker(&deep_ticker(1_000_000.0, 1_002_500.0)).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        assert_eq!(active.unwrap().price, 1_001_000.0);

        // Someone bid 1,002,000; our 1,001,000 is no longer competitive.
        f.bot.handle_ticker(&deep_ticker(1_002_000.0, 1_004_600.0)).await.unwrap();
        let (bot, active) = f.bot.snapshot().await;
        // Cancelled and restored; replacement waits for the next ticker.
        assert!(active.is_none());
        assert!((bot.balances[QUOTE_CURRENCY] - 10_000_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_tightened_spread_cancels_open_buy() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.handle_ticker(&deep_ticker(1_000_000.0, 1_002_500.0)).await.unwrap();
        assert!(f.bot.snapshot().await.1.is_some());

        // Spread collapses below min gap: the buy goes away.
        f.bot.handle_ticker(&deep_ticker(1_001_000.0, 1_001_500.0)).await.unwrap();
        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        assert!((bot.balances[QUOTE_CURRENCY] - 10_000_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_tightened_spread_keeps_profitable_sell() {
        let mut config = bot_config(10_000_000.0, 100_000.0, 0.2);
        config.balances.insert("btc".to_string(), 0.1);
        config.cost_basis = CostBasis { total_coin: 0.1, total_cost_idr: 100_000.0 };
        let f = fixture_with(settings(0, 0.0), config, pair(500.0)).await;

        f.bot.handle_ticker(&deep_ticker(1_005_000.0, 1_005_500.0)).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        let placed = active.unwrap();
        assert_eq!(placed.side, Side::Sell);

        // Spread collapses, but the resting sell still locks in the
        // configured profit over the average buy price: hold it.
        f.bot.handle_ticker(&deep_ticker(1_004_900.0, 1_005_050.0)).await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        assert_eq!(active.unwrap().id, placed.id);
    }

    #[tokio::test]
    async fn test_debounce_blocks_rapid_actions() {
        let f = fixture_with(
            settings(2, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.handle_ticker(&deep_ticker(1_000_000.0, 1_002_500.0)).await.unwrap();
        let (_, first) = f.bot.snapshot().await;
        let first = first.unwrap();

        // Better bid arrives immediately: repositioning is debounced.
        f.bot.handle_ticker(&deep_ticker(1_002_000.0, 1_004_600.0)).await.unwrap();
        let (_, second) = f.bot.snapshot().await;
        assert_eq!(second.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_bounded_loss_stops_bot() {
        tokio::time::pause();
        let mut config = bot_config(10_000_000.0, 100_000.0, 0.2);
        config.balances.insert("btc".to_string(), 0.1);
        // Deep underwater cost basis, tiny loss bound.
        config.cost_basis = CostBasis { total_coin: 0.1, total_cost_idr: 110_000.0 };
        config.max_loss_idr = 100.0;
        let mut f = fixture_with(settings(0, 0.0), config, pair(500.0)).await;

        // Force a losing sell by injecting the fill directly.
        f.bot.handle_ticker(&deep_ticker(1_005_000.0, 1_005_500.0)).await.unwrap();
        // Guard held the sell; relax by injecting a synthetic order fill
        // path instead: place at a price the guard allows is impossible,
        // so emulate a restored active order.
        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        assert_eq!(bot.status, BotStatus::Running);

        // Manually install an active sell below cost to exercise the
        // bounded-loss circuit on fill.
        {
            let mut state = f.bot.state.write().await;
            let order = new_order(
                1,
                ParentKind::Bot,
                1,
                "bot1-btcidr-sell-99".to_string(),
                "btcidr".to_string(),
                Side::Sell,
                OrderType::Limit,
                1_000_000.0,
                0.1,
                true,
            );
            f.bot.orders.insert(&order).await.unwrap();
            state.active_order = Some(order);
            state.active_order_profit = 0.0;
        }

        let fill = OrderEvent {
            exchange_order_id: String::new(),
            client_order_id: "bot1-btcidr-sell-99".to_string(),
            pair: "btcidr".to_string(),
            side: Side::Sell,
            status: OrderEventStatus::Done,
            original_qty: 0.1,
            executed_qty: 0.1,
            remaining_qty: 0.0,
            avg_price: 1_000_000.0,
            at_ms: 3,
        };
        f.bot.on_order_event(1, &fill).await;

        let (bot, _) = f.bot.snapshot().await;
        // Loss of 10,000 breaches the 100 bound.
        assert!(bot.stats.total_profit_idr <= -100.0);
        assert_eq!(bot.status, BotStatus::Stopped);
        assert!(*f.bot.stop.subscribe().borrow());
        let _ = &mut f.paper_rx;
    }

    #[tokio::test]
    async fn test_restore_discards_stale_paper_order() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        // A two-hour-old open paper order left from a previous run.
        let mut order = new_order(
            1,
            ParentKind::Bot,
            1,
            "bot1-btcidr-buy-old".to_string(),
            "btcidr".to_string(),
            Side::Buy,
            OrderType::Limit,
            1_000_000.0,
            0.1,
            true,
        );
        order.status = OrderStatus::Open;
        order.created_at = Utc::now() - chrono::Duration::hours(2);
        f.bot.orders.insert(&order).await.unwrap();

        f.bot.restore().await.unwrap();

        let (_, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        let stored = f
            .store
            .get_json::<BotOrder>(&f.keys.order(&order.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_restore_adopts_fresh_paper_order() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        let mut order = new_order(
            1,
            ParentKind::Bot,
            1,
            "bot1-btcidr-buy-fresh".to_string(),
            "btcidr".to_string(),
            Side::Buy,
            OrderType::Limit,
            1_000_000.0,
            0.1,
            true,
        );
        order.status = OrderStatus::Open;
        f.bot.orders.insert(&order).await.unwrap();

        f.bot.restore().await.unwrap();
        let (_, active) = f.bot.snapshot().await;
        assert_eq!(active.unwrap().id, order.id);
    }

    #[tokio::test]
    async fn test_sweep_cancels_duplicates_keeps_newest() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        let mut old = new_order(
            1,
            ParentKind::Bot,
            1,
            "bot1-btcidr-buy-a".to_string(),
            "btcidr".to_string(),
            Side::Buy,
            OrderType::Limit,
            1_000_000.0,
            0.05,
            true,
        );
        old.status = OrderStatus::Open;
        old.created_at = Utc::now() - chrono::Duration::minutes(10);
        f.bot.orders.insert(&old).await.unwrap();

        let mut newest = new_order(
            1,
            ParentKind::Bot,
            1,
            "bot1-btcidr-buy-b".to_string(),
            "btcidr".to_string(),
            Side::Buy,
            OrderType::Limit,
            1_001_000.0,
            0.05,
            true,
        );
        newest.status = OrderStatus::Open;
        f.bot.orders.insert(&newest).await.unwrap();

        f.bot.sweep().await.unwrap();

        let old_stored = f
            .store
            .get_json::<BotOrder>(&f.keys.order(&old.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old_stored.status, OrderStatus::Cancelled);

        let newest_stored = f
            .store
            .get_json::<BotOrder>(&f.keys.order(&newest.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newest_stored.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_start_stop_without_tickers_preserves_balance() {
        let f = fixture_with(
            settings(0, 0.0),
            bot_config(10_000_000.0, 100_000.0, 0.2),
            pair(1_000.0),
        )
        .await;

        f.bot.shutdown().await.unwrap();

        let (bot, active) = f.bot.snapshot().await;
        assert!(active.is_none());
        assert_eq!(bot.balances[QUOTE_CURRENCY], 10_000_000.0);
        assert_eq!(bot.status, BotStatus::Stopped);
    }
}
