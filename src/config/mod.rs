//! Engine configuration loaded from a TOML file
use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Storage
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    // Exchange endpoints
    pub rest_base_url: String,
    pub public_ws_url: String,
    pub private_ws_url: String,

    // Rate limits (token buckets)
    #[serde(default = "default_rate_limit_place")]
    pub rate_limit_place_per_sec: u32,
    #[serde(default = "default_rate_limit_cancel")]
    pub rate_limit_cancel_per_sec: u32,
    #[serde(default = "default_rate_limit_public")]
    pub rate_limit_public_per_min: u32,

    // Order action discipline
    #[serde(default = "default_order_debounce_secs")]
    pub order_debounce_secs: i64,
    /// Price comparison tolerance, in quote units, when deciding whether
    /// an open order still sits at the competitive price.
    #[serde(default = "default_reposition_tolerance")]
    pub reposition_tolerance: f64,

    // Paper execution
    #[serde(default = "default_paper_fill_delay_secs")]
    pub paper_fill_delay_secs: u64,
    /// Stale cutoff for paper orders found on restart.
    #[serde(default = "default_paper_stale_order_secs")]
    pub paper_stale_order_secs: i64,

    // Momentum sell placement
    /// Wait for the exchange to credit coins before resting the
    /// take-profit sell.
    #[serde(default = "default_sell_settle_delay_secs")]
    pub sell_settle_delay_secs: u64,
    /// Spread threshold under which entries go in as market buys.
    #[serde(default = "default_market_buy_gap_pct")]
    pub market_buy_gap_pct: f64,
    #[serde(default = "default_pending_debounce_secs")]
    pub pending_debounce_secs: i64,
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: i64,

    // Fees
    /// Round-trip fee approximation applied when computing realized
    /// profit at close time.
    #[serde(default = "default_fee_rate_pct")]
    pub fee_rate_pct: f64,

    // Market data
    #[serde(default = "default_market_broadcast_interval_secs")]
    pub market_broadcast_interval_secs: u64,
    /// Divisor of the transaction-count boost curve.
    #[serde(default = "default_pump_trx_divisor")]
    pub pump_trx_divisor: f64,
    /// Hard cap of the transaction-count boost.
    #[serde(default = "default_pump_trx_boost_cap")]
    pub pump_trx_boost_cap: f64,

    // Spread Maker safety
    #[serde(default = "default_volatility_skip_pct")]
    pub volatility_skip_pct: f64,
    #[serde(default = "default_depth_min_levels")]
    pub depth_min_levels: usize,
    /// Required book volume as a multiple of the order size.
    #[serde(default = "default_depth_volume_multiple")]
    pub depth_volume_multiple: f64,
    /// Maximum gap between the top two bids before a buy is rejected
    /// as a thin market.
    #[serde(default = "default_thin_bid_gap_pct")]
    pub thin_bid_gap_pct: f64,
    /// Largest tolerated loss on a guarded sell.
    #[serde(default = "default_max_sell_loss_pct")]
    pub max_sell_loss_pct: f64,

    // Background sweeper
    #[serde(default = "default_sweeper_interval_secs")]
    pub sweeper_interval_secs: u64,
    #[serde(default = "default_stale_order_max_age_secs")]
    pub stale_order_max_age_secs: i64,

    // Momentum tickers
    #[serde(default = "default_signal_interval_secs")]
    pub signal_interval_secs: u64,
    #[serde(default = "default_exit_check_interval_secs")]
    pub exit_check_interval_secs: u64,
    #[serde(default = "default_loss_breaker_interval_secs")]
    pub loss_breaker_interval_secs: u64,

    // Reconciler
    #[serde(default = "default_subscribe_verify_timeout_secs")]
    pub subscribe_verify_timeout_secs: u64,
    #[serde(default = "default_stop_cleanup_timeout_secs")]
    pub stop_cleanup_timeout_secs: u64,

    // Sanity caps
    #[serde(default = "default_max_reasonable_balance_idr")]
    pub max_reasonable_balance_idr: f64,
    #[serde(default = "default_max_reasonable_coin_amount")]
    pub max_reasonable_coin_amount: f64,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "idrbot".to_string()
}
fn default_rate_limit_place() -> u32 {
    20
}
fn default_rate_limit_cancel() -> u32 {
    30
}
fn default_rate_limit_public() -> u32 {
    180
}
fn default_order_debounce_secs() -> i64 {
    2
}
fn default_reposition_tolerance() -> f64 {
    0.01
}
fn default_paper_fill_delay_secs() -> u64 {
    5
}
fn default_paper_stale_order_secs() -> i64 {
    3600
}
fn default_sell_settle_delay_secs() -> u64 {
    5
}
fn default_market_buy_gap_pct() -> f64 {
    1.0
}
fn default_pending_debounce_secs() -> i64 {
    10
}
fn default_pending_timeout_secs() -> i64 {
    120
}
fn default_fee_rate_pct() -> f64 {
    0.2
}
fn default_market_broadcast_interval_secs() -> u64 {
    2
}
fn default_pump_trx_divisor() -> f64 {
    8.0
}
fn default_pump_trx_boost_cap() -> f64 {
    3.0
}
fn default_volatility_skip_pct() -> f64 {
    1.0
}
fn default_depth_min_levels() -> usize {
    3
}
fn default_depth_volume_multiple() -> f64 {
    2.0
}
fn default_thin_bid_gap_pct() -> f64 {
    0.5
}
fn default_max_sell_loss_pct() -> f64 {
    5.0
}
fn default_sweeper_interval_secs() -> u64 {
    60
}
fn default_stale_order_max_age_secs() -> i64 {
    300
}
fn default_signal_interval_secs() -> u64 {
    1
}
fn default_exit_check_interval_secs() -> u64 {
    10
}
fn default_loss_breaker_interval_secs() -> u64 {
    5
}
fn default_subscribe_verify_timeout_secs() -> u64 {
    5
}
fn default_stop_cleanup_timeout_secs() -> u64 {
    30
}
fn default_max_reasonable_balance_idr() -> f64 {
    100_000_000_000.0
}
fn default_max_reasonable_coin_amount() -> f64 {
    1_000_000_000.0
}
fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

    let settings: Settings = toml::from_str(&content)
        .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

    validate_settings(&settings)?;

    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.rest_base_url.is_empty() {
        return Err(EngineError::Config("rest_base_url is empty".to_string()));
    }
    if settings.public_ws_url.is_empty() || settings.private_ws_url.is_empty() {
        return Err(EngineError::Config("websocket urls must be set".to_string()));
    }
    if settings.fee_rate_pct < 0.0 || settings.fee_rate_pct > 5.0 {
        return Err(EngineError::Config(format!(
            "Invalid fee_rate_pct: {}",
            settings.fee_rate_pct
        )));
    }
    if settings.pump_trx_divisor <= 0.0 {
        return Err(EngineError::Config(
            "pump_trx_divisor must be positive".to_string(),
        ));
    }
    if settings.pump_trx_boost_cap < 1.0 {
        return Err(EngineError::Config(
            "pump_trx_boost_cap must be >= 1".to_string(),
        ));
    }
    if settings.depth_min_levels == 0 {
        return Err(EngineError::Config(
            "depth_min_levels must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
impl Default for Settings {
    /// Test settings: every tunable at its documented default.
    fn default() -> Self {
        toml::from_str(
            r#"
            rest_base_url = "https://exchange.test"
            public_ws_url = "wss://exchange.test/public"
            private_ws_url = "wss://exchange.test/private"
            "#,
        )
        .expect("default settings parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::default();
        assert_eq!(settings.rate_limit_place_per_sec, 20);
        assert_eq!(settings.rate_limit_cancel_per_sec, 30);
        assert_eq!(settings.rate_limit_public_per_min, 180);
        assert_eq!(settings.order_debounce_secs, 2);
        assert_eq!(settings.fee_rate_pct, 0.2);
        assert_eq!(settings.market_broadcast_interval_secs, 2);
    }

    #[test]
    fn test_validate_rejects_bad_fee() {
        let mut settings = Settings::default();
        settings.fee_rate_pct = 50.0;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_divisor() {
        let mut settings = Settings::default();
        settings.pump_trx_divisor = 0.0;
        assert!(validate_settings(&settings).is_err());
    }
}
