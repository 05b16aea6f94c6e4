//! Core type definitions for the trading engine
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quote currency for every tradable pair on the exchange.
pub const QUOTE_CURRENCY: &str = "idr";

/// Sentinel pair for bots that scan the whole market.
pub const ALL_PAIRS: &str = "ALL";

/// Pair metadata, refreshed from the exchange on boot and periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairInfo {
    /// Canonical id, base + quote concatenated (e.g. `btcidr`).
    pub id: String,
    pub base: String,
    pub quote: String,
    /// Decimal places for coin amounts.
    pub volume_precision: u32,
    /// Decimal places for prices; 0 for integer-priced pairs.
    pub price_precision: u32,
    pub min_base_amount: f64,
    pub min_quote_amount: f64,
    /// Smallest allowed price increment.
    pub tick_size: f64,
}

/// Rolling OHLC window timeframes tracked per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::M30];

    pub fn as_str(&self) -> &str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1800,
        }
    }

    /// Pump-score weight, increasing with timeframe length.
    pub fn weight(&self) -> f64 {
        match self {
            Timeframe::M1 => 1.0,
            Timeframe::M5 => 2.0,
            Timeframe::M15 => 3.0,
            Timeframe::M30 => 4.0,
        }
    }
}

/// One rolling window of a `Coin`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeframeWindow {
    /// Price carried forward when the window last rolled.
    pub open: f64,
    /// Last price observed inside the window.
    pub close: f64,
    /// Transactions counted inside the window.
    pub trx_count: u64,
    pub window_start_ms: i64,
}

impl TimeframeWindow {
    /// Percent change of the window, 0 when no open is known yet.
    pub fn change_pct(&self) -> f64 {
        if self.open > 0.0 {
            (self.close - self.open) / self.open * 100.0
        } else {
            0.0
        }
    }
}

/// Live per-pair market snapshot, owned and mutated by the ingestor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Coin {
    pub pair_id: String,
    pub price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    /// 24-hour traded volume in quote currency.
    pub volume_idr: f64,
    /// `(ask - bid) / bid * 100`.
    pub gap_pct: f64,
    pub tf_1m: TimeframeWindow,
    pub tf_5m: TimeframeWindow,
    pub tf_15m: TimeframeWindow,
    pub tf_30m: TimeframeWindow,
    pub pump_score: f64,
    /// 1-minute price range as a percentage of the window open.
    pub volatility_1m: f64,
    pub updated_at_ms: i64,
}

impl Coin {
    pub fn window(&self, tf: Timeframe) -> &TimeframeWindow {
        match tf {
            Timeframe::M1 => &self.tf_1m,
            Timeframe::M5 => &self.tf_5m,
            Timeframe::M15 => &self.tf_15m,
            Timeframe::M30 => &self.tf_30m,
        }
    }

    pub fn window_mut(&mut self, tf: Timeframe) -> &mut TimeframeWindow {
        match tf {
            Timeframe::M1 => &mut self.tf_1m,
            Timeframe::M5 => &mut self.tf_5m,
            Timeframe::M15 => &mut self.tf_15m,
            Timeframe::M30 => &mut self.tf_30m,
        }
    }

    /// Number of timeframes currently trading above their window open.
    pub fn positive_timeframes(&self) -> usize {
        Timeframe::ALL
            .iter()
            .filter(|tf| {
                let w = self.window(**tf);
                w.open > 0.0 && w.close > w.open
            })
            .count()
    }
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

/// Bot-issued order status.
///
/// `Partial` means the order was cancelled after executing a non-zero
/// amount less than the original. `PendingConfirmation` means the REST
/// response and the private stream transiently disagree and the final
/// outcome comes from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    Pending,
    Open,
    PendingConfirmation,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PendingConfirmation => "pending-confirmation",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Partial | OrderStatus::Filled | OrderStatus::Cancelled
        )
    }
}

/// What a bot-issued order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentKind {
    Bot,
    Position,
    Trade,
}

impl ParentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ParentKind::Bot => "bot",
            ParentKind::Position => "position",
            ParentKind::Trade => "trade",
        }
    }
}

/// Internal record of an order we placed on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotOrder {
    pub id: String,
    pub user_id: u64,
    pub parent_kind: ParentKind,
    pub parent_id: u64,
    /// Our generated client order id, the primary match key for
    /// private-stream events.
    pub client_order_id: String,
    /// Id the exchange answered placement with; empty while pending.
    /// Cancel and single-order queries go through this.
    #[serde(default)]
    pub exchange_order_id: String,
    pub pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: f64,
    pub amount: f64,
    pub filled_amount: f64,
    pub paper: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Bot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    SpreadMaker,
    MomentumHunter,
}

impl BotKind {
    pub fn as_str(&self) -> &str {
        match self {
            BotKind::SpreadMaker => "spread_maker",
            BotKind::MomentumHunter => "momentum_hunter",
        }
    }
}

/// Bot lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotStatus {
    Stopped,
    Running,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Stopped => "Stopped",
            BotStatus::Running => "Running",
            BotStatus::Error => "Error",
        }
    }
}

/// Spread Maker rule bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadRules {
    /// Skip tickers whose spread is below this percentage.
    pub min_gap_pct: f64,
    /// Quote-currency size of each buy order.
    pub order_size_idr: f64,
}

/// Momentum Hunter rule bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumRules {
    pub min_pump_score: f64,
    pub min_volume_idr: f64,
    pub min_price: f64,
    /// Timeframes that must be trading above their window open.
    pub min_positive_timeframes: usize,
    pub max_concurrent_positions: usize,
    pub max_position_size_idr: f64,
    /// Quote balance kept untouched when sizing entries.
    pub min_balance_reserve_idr: f64,
    pub target_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub max_hold_minutes: i64,
    pub exit_on_pump_score_drop: bool,
    pub daily_loss_limit_idr: f64,
    /// Entry pause after a realized loss.
    pub loss_cooldown_minutes: i64,
    #[serde(default)]
    pub excluded_pairs: Vec<String>,
    /// Empty means every pair is allowed.
    #[serde(default)]
    pub allowed_pairs: Vec<String>,
}

/// Kind-specific rule bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BotRules {
    Spread(SpreadRules),
    Momentum(MomentumRules),
}

/// Aggregate bot statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BotStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_profit_idr: f64,
}

/// Accumulated cost basis of the held base-currency inventory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostBasis {
    pub total_coin: f64,
    pub total_cost_idr: f64,
}

impl CostBasis {
    /// Weighted-average buy price, `None` until any coin was bought.
    pub fn avg_buy_price(&self) -> Option<f64> {
        if self.total_coin > 0.0 {
            Some(self.total_cost_idr / self.total_coin)
        } else {
            None
        }
    }

    pub fn add_buy(&mut self, amount: f64, price: f64) {
        self.total_coin += amount;
        self.total_cost_idr += amount * price;
    }

    /// Reduce the accumulators proportionally after selling `amount` coins.
    pub fn reduce_sell(&mut self, amount: f64) {
        if self.total_coin <= 0.0 {
            return;
        }
        let fraction = (amount / self.total_coin).min(1.0);
        self.total_cost_idr *= 1.0 - fraction;
        self.total_coin -= amount;
        if self.total_coin <= 0.0 {
            self.total_coin = 0.0;
            self.total_cost_idr = 0.0;
        }
    }
}

/// Persisted bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub kind: BotKind,
    /// Concrete pair for a Spread Maker, `ALL` for a Momentum Hunter.
    pub pair: String,
    pub paper: bool,
    pub initial_balance_idr: f64,
    /// Virtual balances, quote currency always present.
    pub balances: HashMap<String, f64>,
    pub status: BotStatus,
    /// Cumulative-loss bound; the bot stops when breached.
    pub max_loss_idr: f64,
    pub rules: BotRules,
    pub stats: BotStats,
    pub cost_basis: CostBasis,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotConfig {
    pub fn spread_rules(&self) -> Option<&SpreadRules> {
        match &self.rules {
            BotRules::Spread(r) => Some(r),
            _ => None,
        }
    }

    pub fn momentum_rules(&self) -> Option<&MomentumRules> {
        match &self.rules {
            BotRules::Momentum(r) => Some(r),
            _ => None,
        }
    }
}

/// Momentum position lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Buying,
    Open,
    Selling,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PositionStatus::Pending => "Pending",
            PositionStatus::Buying => "Buying",
            PositionStatus::Open => "Open",
            PositionStatus::Selling => "Selling",
            PositionStatus::Closed => "Closed",
        }
    }

    /// Counts against the concurrent-position limit. Selling does not:
    /// its capital is already committed to the exit.
    pub fn holds_entry_slot(&self) -> bool {
        matches!(
            self,
            PositionStatus::Pending | PositionStatus::Buying | PositionStatus::Open
        )
    }
}

/// A Momentum Hunter's tracked holding from one entry to its exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub bot_id: u64,
    pub pair: String,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub entry_quantity: f64,
    pub entry_idr: f64,
    pub entry_order_id: String,
    pub entry_pump_score: f64,
    pub entry_trx_count_1m: u64,
    pub entry_order_type: OrderType,
    /// When the entry order was placed, for pending-order monitoring.
    pub order_placed_at: DateTime<Utc>,
    /// All-time high observed since entry.
    pub highest_price: f64,
    pub lowest_price: f64,
    pub last_price_check: DateTime<Utc>,
    /// Consecutive 1-minute checks strictly below the ATH. Persisted so
    /// the ATH-decline exit survives restarts.
    pub minutes_below_ath: u32,
    /// Current exit-signal reason, empty when none.
    pub exit_reason: String,
    /// Consecutive 1-minute checks the reason has held (0-2).
    pub exit_confirm_count: u8,
    pub exit_order_id: String,
    pub close_reason: String,
    pub exit_price: f64,
    pub exit_quantity: f64,
    pub exit_idr: f64,
    pub profit_idr: f64,
    pub profit_pct: f64,
    pub paper: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Assisted one-shot trade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Filled,
    Completed,
    Cancelled,
    Stopped,
    Error,
}

impl TradeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TradeStatus::Pending => "Pending",
            TradeStatus::Filled => "Filled",
            TradeStatus::Completed => "Completed",
            TradeStatus::Cancelled => "Cancelled",
            TradeStatus::Stopped => "Stopped",
            TradeStatus::Error => "Error",
        }
    }
}

/// Assisted one-shot trade: buy leg then a resting sell leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistedTrade {
    pub id: u64,
    pub user_id: u64,
    pub pair: String,
    pub status: TradeStatus,
    pub buy_order_id: String,
    pub buy_price: f64,
    pub amount: f64,
    pub sell_order_id: String,
    pub sell_price: f64,
    pub target_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub stop_triggered: bool,
    pub paper: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exchange credential holder. Authentication and key CRUD live outside
/// the core; the engine only consumes this contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub api_key: String,
    pub api_secret: String,
    /// False until the key passed a verification round-trip.
    pub key_valid: bool,
}

/// One price level of a per-pair order-book ticker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    /// Cumulative quote-currency volume at this level.
    pub quote_volume: f64,
    /// Cumulative base-currency volume at this level.
    pub base_volume: f64,
}

/// Normalized top-of-book ticker delivered to Spread Maker runtimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookTicker {
    pub pair_id: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub at_ms: i64,
}

impl BookTicker {
    /// Spread as a percentage of the bid, 0 when the book is empty.
    pub fn spread_pct(&self) -> f64 {
        if self.best_bid > 0.0 {
            (self.best_ask - self.best_bid) / self.best_bid * 100.0
        } else {
            0.0
        }
    }
}
