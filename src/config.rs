//! Engine configuration, assembled once at startup from the environment.
//!
//! Mirrors the teacher's `env()` / `env_decimal()` / `env_u32()` loader shape:
//! a single `Config` record, validated eagerly, with every option enumerated
//! here rather than discovered via duck-typed access at call sites.

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

use crate::error::EngineError;

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env(key, &default.to_string()).parse().unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env(key, &default.to_string()).parse().unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    let v = env(key, if default { "true" } else { "false" });
    v.eq_ignore_ascii_case("true") || v == "1"
}

fn clamp01(v: Decimal) -> Decimal {
    v.max(Decimal::ZERO).min(Decimal::ONE)
}

/// Strategy parameters from spec.md §4.4.1, each independently configurable.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyParams {
    pub entry_trigger: Decimal,
    pub dca_drop_1: Decimal,
    pub dca_drop_2: Decimal,
    pub clip_size: Decimal,
    pub unwind_trigger: Decimal,
    pub tp_price: Decimal,
    pub high_scalp_entry: Decimal,
    pub max_completed_cycles: u32,
    pub max_high_scalps: u32,
    pub min_entry_time_left: i64,
    pub force_unwind_time_left: i64,
    pub force_exit_time_left: i64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            entry_trigger: dec!(0.34),
            dca_drop_1: dec!(0.24),
            dca_drop_2: dec!(0.38),
            clip_size: dec!(10),
            unwind_trigger: dec!(0.60),
            tp_price: dec!(0.88),
            high_scalp_entry: dec!(0.90),
            max_completed_cycles: 3,
            max_high_scalps: 4,
            min_entry_time_left: 420,
            force_unwind_time_left: 300,
            force_exit_time_left: 180,
        }
    }
}

impl StrategyParams {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            entry_trigger: clamp01(env_decimal("STRATEGY_ENTRY_TRIGGER", d.entry_trigger)),
            dca_drop_1: clamp01(env_decimal("STRATEGY_DCA_DROP_1", d.dca_drop_1)),
            dca_drop_2: clamp01(env_decimal("STRATEGY_DCA_DROP_2", d.dca_drop_2)),
            clip_size: env_decimal("STRATEGY_CLIP_SIZE", d.clip_size),
            unwind_trigger: clamp01(env_decimal("STRATEGY_UNWIND_TRIGGER", d.unwind_trigger)),
            tp_price: clamp01(env_decimal("STRATEGY_TP_PRICE", d.tp_price)),
            high_scalp_entry: clamp01(env_decimal("STRATEGY_HIGH_SCALP_ENTRY", d.high_scalp_entry)),
            max_completed_cycles: env_u32("STRATEGY_MAX_COMPLETED_CYCLES", d.max_completed_cycles),
            max_high_scalps: env_u32("STRATEGY_MAX_HIGH_SCALPS", d.max_high_scalps),
            min_entry_time_left: env_u64("STRATEGY_MIN_ENTRY_TIME_LEFT", d.min_entry_time_left as u64) as i64,
            force_unwind_time_left: env_u64(
                "STRATEGY_FORCE_UNWIND_TIME_LEFT",
                d.force_unwind_time_left as u64,
            ) as i64,
            force_exit_time_left: env_u64(
                "STRATEGY_FORCE_EXIT_TIME_LEFT",
                d.force_exit_time_left as u64,
            ) as i64,
        }
    }
}

/// Top-level engine configuration (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Gates real order placement; dry-run when false.
    pub trading_enabled: bool,
    /// Upper bound on concurrently active markets.
    pub max_concurrent_markets: usize,
    /// Realized PnL threshold (negative) past which the engine halts new entries.
    pub daily_loss_limit: Decimal,
    pub strategy: StrategyParams,
    /// Engine tick period in milliseconds (spec.md §4.6: 200ms).
    pub tick_ms: u64,
    /// Grace period after end_time before a market is retired (spec.md §3: 600s).
    pub retirement_grace_secs: i64,
    /// Venue call timeout (spec.md §5: default 5s).
    pub order_timeout_ms: u64,
    pub venue_rest_base: String,
    pub venue_ws_url: String,
    pub session_log_enabled: bool,
    pub session_log_dir: String,
    /// Independent underlying-asset spot feed URLs (spec.md §4.1: typically
    /// a primary plus a backup). Empty disables the Spot Price Tracker.
    pub spot_feed_urls: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading_enabled: false,
            max_concurrent_markets: 20,
            daily_loss_limit: dec!(-500),
            strategy: StrategyParams::default(),
            tick_ms: 200,
            retirement_grace_secs: 600,
            order_timeout_ms: 5000,
            venue_rest_base: "https://clob.example-venue.com".to_string(),
            venue_ws_url: "wss://ws.example-venue.com/market".to_string(),
            session_log_enabled: true,
            session_log_dir: "logs".to_string(),
            spot_feed_urls: Vec::new(),
        }
    }
}

/// Load configuration from the environment, validating eagerly.
pub fn load_config() -> Result<Config> {
    let d = Config::default();
    let config = Config {
        trading_enabled: env_bool("ENGINE_TRADING_ENABLED", d.trading_enabled),
        max_concurrent_markets: env_u32("ENGINE_MAX_CONCURRENT_MARKETS", d.max_concurrent_markets as u32)
            as usize,
        daily_loss_limit: env_decimal("ENGINE_DAILY_LOSS_LIMIT", d.daily_loss_limit),
        strategy: StrategyParams::from_env(),
        tick_ms: env_u64("ENGINE_TICK_MS", d.tick_ms).clamp(50, 5000),
        retirement_grace_secs: env_u64("ENGINE_RETIREMENT_GRACE_SECS", d.retirement_grace_secs as u64) as i64,
        order_timeout_ms: env_u64("ENGINE_ORDER_TIMEOUT_MS", d.order_timeout_ms),
        venue_rest_base: env("VENUE_REST_BASE", &d.venue_rest_base),
        venue_ws_url: env("VENUE_WS_URL", &d.venue_ws_url),
        session_log_enabled: env_bool("ENGINE_SESSION_LOG_ENABLED", d.session_log_enabled),
        session_log_dir: env("ENGINE_SESSION_LOG_DIR", &d.session_log_dir),
        spot_feed_urls: env("ENGINE_SPOT_FEED_URLS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };

    if config.max_concurrent_markets == 0 {
        return Err(EngineError::InvalidConfig(
            "ENGINE_MAX_CONCURRENT_MARKETS must be positive".into(),
        )
        .into());
    }
    if config.strategy.entry_trigger >= config.strategy.high_scalp_entry {
        return Err(EngineError::InvalidConfig(
            "STRATEGY_ENTRY_TRIGGER must be below STRATEGY_HIGH_SCALP_ENTRY".into(),
        )
        .into());
    }
    if config.strategy.force_exit_time_left > config.strategy.force_unwind_time_left {
        return Err(EngineError::InvalidConfig(
            "STRATEGY_FORCE_EXIT_TIME_LEFT must not exceed STRATEGY_FORCE_UNWIND_TIME_LEFT".into(),
        )
        .into());
    }
    if config.strategy.force_unwind_time_left > config.strategy.min_entry_time_left {
        return Err(EngineError::InvalidConfig(
            "STRATEGY_FORCE_UNWIND_TIME_LEFT must not exceed STRATEGY_MIN_ENTRY_TIME_LEFT".into(),
        )
        .into());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let p = StrategyParams::default();
        assert_eq!(p.entry_trigger, dec!(0.34));
        assert_eq!(p.dca_drop_1, dec!(0.24));
        assert_eq!(p.dca_drop_2, dec!(0.38));
        assert_eq!(p.clip_size, dec!(10));
        assert_eq!(p.unwind_trigger, dec!(0.60));
        assert_eq!(p.tp_price, dec!(0.88));
        assert_eq!(p.high_scalp_entry, dec!(0.90));
        assert_eq!(p.max_completed_cycles, 3);
        assert_eq!(p.max_high_scalps, 4);
        assert_eq!(p.min_entry_time_left, 420);
        assert_eq!(p.force_unwind_time_left, 300);
        assert_eq!(p.force_exit_time_left, 180);
    }

    #[test]
    fn clamp01_bounds_prices() {
        assert_eq!(clamp01(dec!(1.5)), dec!(1));
        assert_eq!(clamp01(dec!(-0.2)), dec!(0));
        assert_eq!(clamp01(dec!(0.42)), dec!(0.42));
    }
}
