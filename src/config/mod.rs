//! Configuration management for the CLOB trader.
//!
//! Loads settings from an optional `config` file and `CLOB__*` environment
//! variables. The resulting value is validated once and then threaded into
//! component constructors; nothing reads configuration after startup.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Capital pool ceilings
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Strategy A (reactive front-running) parameters
    #[serde(default)]
    pub front_running: FrontRunningConfig,
    /// Strategy B (multi-market quoting) parameters
    #[serde(default)]
    pub market_making: MarketMakingConfig,
    /// Risk thresholds
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Heartbeat and supervision timing
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Total operator capital in USD
    #[serde(default = "default_total_capital")]
    pub total: Decimal,
    /// Ceiling for strategy A (front-running)
    #[serde(default = "default_max_allocation_a")]
    pub max_allocation_a: Decimal,
    /// Ceiling for strategy B (market making)
    #[serde(default = "default_max_allocation_b")]
    pub max_allocation_b: Decimal,
}

/// How exit targets react to volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    /// Profit/stop/trailing targets widen with the live volatility score
    Dynamic,
    /// Profit/stop/trailing targets at their configured values
    Hybrid,
    /// Only the maximum hold time closes positions
    Fixed,
}

/// Exit rules shared by both strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Take profit at this gain (percent, e.g. 2.0 = 2%)
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: Decimal,
    /// Cut losses at this drawdown from entry (percent)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Minimum trailing drawdown from the high-water mark (percent)
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: Decimal,
    /// Trailing threshold grows to `peak_profit_pct * ratio` once in profit
    #[serde(default = "default_trailing_profit_ratio")]
    pub trailing_profit_ratio: Decimal,
    /// Close the position after this many seconds regardless of PnL
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
    /// Suppress every exit before this many seconds
    #[serde(default = "default_min_hold_secs")]
    pub min_hold_secs: u64,
    #[serde(default = "default_exit_mode")]
    pub exit_mode: ExitMode,
    /// Targets are multiplied by `1 + volatility_score * factor`
    #[serde(default = "default_volatility_widen_factor")]
    pub volatility_widen_factor: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontRunningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Percent of locked capital spent per trade
    #[serde(default = "default_fr_trade_size_pct")]
    pub trade_size_pct: Decimal,
    /// Triggers for the same token inside this window are dropped
    #[serde(default = "default_trigger_cooldown_secs")]
    pub trigger_cooldown_secs: u64,
    /// Order books younger than this are reused instead of refetched
    #[serde(default = "default_book_cache_ttl_ms")]
    pub book_cache_ttl_ms: u64,
    /// Entry size is capped to what fills within this slippage (percent)
    #[serde(default = "default_max_entry_slippage_pct")]
    pub max_entry_slippage_pct: Decimal,
    /// Trades below this notional (USD) are skipped
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// How long a tick waits for an entry/exit order to settle
    #[serde(default = "default_order_wait_timeout_ms")]
    pub order_wait_timeout_ms: u64,
    #[serde(default)]
    pub exits: ExitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMakingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Capital locked for quoting (must not exceed `capital.max_allocation_b`)
    #[serde(default = "default_max_exposure")]
    pub max_exposure: Decimal,
    /// Percent of locked capital per quote
    #[serde(default = "default_mm_trade_size_pct")]
    pub trade_size_pct: Decimal,
    /// Base quoted spread as a fraction of mid (0.02 = 2%)
    #[serde(default = "default_base_spread")]
    pub base_spread: Decimal,
    #[serde(default = "default_min_spread")]
    pub min_spread: Decimal,
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,
    /// Spread multiplier reached at a volatility score of 1.0
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: Decimal,
    /// Maximum inventory shift as a fraction of mid
    #[serde(default = "default_inventory_skew_max")]
    pub inventory_skew_max: Decimal,
    /// Price shift per unit of top-of-book imbalance
    #[serde(default = "default_imbalance_factor")]
    pub imbalance_factor: Decimal,
    /// Relative deviation that forces a cancel-and-replace
    #[serde(default = "default_reprice_threshold")]
    pub reprice_threshold: Decimal,
    #[serde(default = "default_max_markets")]
    pub max_markets: usize,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Discovery interval cap when a market scorer is attached
    #[serde(default = "default_scored_discovery_interval_secs")]
    pub scored_discovery_interval_secs: u64,
    /// Quote size is capped to what fills within this slippage (percent)
    #[serde(default = "default_quote_slippage_pct")]
    pub quote_slippage_pct: Decimal,
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Lowest quotable price
    #[serde(default = "default_min_price")]
    pub min_price: Decimal,
    /// Highest quotable price
    #[serde(default = "default_max_price")]
    pub max_price: Decimal,
    /// How long an exit waits for its order to settle
    #[serde(default = "default_order_wait_timeout_ms")]
    pub order_wait_timeout_ms: u64,
    #[serde(default = "default_mm_exits")]
    pub exits: ExitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Realized loss (percent of total capital) that trips the kill switch
    #[serde(default = "default_kill_switch_threshold_pct")]
    pub kill_switch_threshold_pct: Decimal,
    /// Rolling window for the volatility filter
    #[serde(default = "default_volatility_window_secs")]
    pub volatility_window_secs: u64,
    /// Price move (percent) inside the window considered unsafe
    #[serde(default = "default_volatility_threshold_pct")]
    pub volatility_threshold_pct: Decimal,
    /// Cap applied to the normalised volatility score
    #[serde(default = "default_max_volatility_score")]
    pub max_volatility_score: Decimal,
}

/// Paper-trading simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_latency_min_ms")]
    pub latency_min_ms: u64,
    #[serde(default = "default_latency_max_ms")]
    pub latency_max_ms: u64,
    /// Probability (0-1) that an order fills at all
    #[serde(default = "default_fill_probability")]
    pub fill_probability: f64,
    /// Probability (0-1) that a fill is partial
    #[serde(default = "default_partial_fill_probability")]
    pub partial_fill_probability: f64,
    /// Smallest fraction of the requested size a partial fill keeps
    #[serde(default = "default_partial_fill_min_ratio")]
    pub partial_fill_min_ratio: f64,
    /// Fixed slippage applied to every fill (fraction)
    #[serde(default = "default_base_slippage")]
    pub base_slippage: Decimal,
    /// Slippage per unit of `size / visible_depth`
    #[serde(default = "default_size_impact_factor")]
    pub size_impact_factor: Decimal,
    /// Symmetric uniform noise amplitude (fraction)
    #[serde(default = "default_slippage_noise")]
    pub slippage_noise: Decimal,
    #[serde(default)]
    pub min_slippage: Decimal,
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    /// Fixed RNG seed for reproducible simulations
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Simulate fills locally instead of calling the venue
    #[serde(default = "default_true")]
    pub paper_trading: bool,
    /// Token bucket capacity for outbound orders
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: f64,
    /// Tokens refilled per second
    #[serde(default = "default_rate_limit_refill_per_sec")]
    pub rate_limit_refill_per_sec: f64,
    /// Queue depth that starts producing warnings
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,
    /// Queue depth at which new submissions are refused
    #[serde(default = "default_queue_max_depth")]
    pub queue_max_depth: usize,
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Upper bound for a single strategy tick
    #[serde(default = "default_max_tick_timeout_secs")]
    pub max_tick_timeout_secs: u64,
    /// Missing heartbeats for this long trip the kill switch
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_total_capital() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_max_allocation_a() -> Decimal {
    Decimal::new(300, 0)
}

fn default_max_allocation_b() -> Decimal {
    Decimal::new(500, 0)
}

fn default_profit_target_pct() -> Decimal {
    Decimal::new(20, 1) // 2.0%
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(10, 1) // 1.0%
}

fn default_trailing_stop_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_trailing_profit_ratio() -> Decimal {
    Decimal::new(3, 1) // 0.3
}

fn default_max_hold_secs() -> u64 {
    120
}

fn default_min_hold_secs() -> u64 {
    5
}

fn default_exit_mode() -> ExitMode {
    ExitMode::Dynamic
}

fn default_volatility_widen_factor() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_fr_trade_size_pct() -> Decimal {
    Decimal::new(10, 0)
}

fn default_trigger_cooldown_secs() -> u64 {
    5
}

fn default_book_cache_ttl_ms() -> u64 {
    150
}

fn default_max_entry_slippage_pct() -> Decimal {
    Decimal::ONE
}

fn default_min_notional() -> Decimal {
    Decimal::ONE
}

fn default_order_wait_timeout_ms() -> u64 {
    1_500
}

fn default_max_exposure() -> Decimal {
    Decimal::new(500, 0)
}

fn default_mm_trade_size_pct() -> Decimal {
    Decimal::new(2, 0)
}

fn default_base_spread() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_min_spread() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_spread() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_volatility_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_inventory_skew_max() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_imbalance_factor() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_reprice_threshold() -> Decimal {
    Decimal::new(5, 3) // 0.5%
}

fn default_max_markets() -> usize {
    50
}

fn default_discovery_interval_secs() -> u64 {
    30
}

fn default_scored_discovery_interval_secs() -> u64 {
    10
}

fn default_quote_slippage_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_min_price() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_max_price() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_mm_exits() -> ExitConfig {
    ExitConfig {
        profit_target_pct: Decimal::new(30, 1),
        stop_loss_pct: Decimal::new(20, 1),
        trailing_stop_pct: Decimal::ONE,
        max_hold_secs: 1_800,
        min_hold_secs: 10,
        ..ExitConfig::default()
    }
}

fn default_kill_switch_threshold_pct() -> Decimal {
    Decimal::new(10, 0)
}

fn default_volatility_window_secs() -> u64 {
    60
}

fn default_volatility_threshold_pct() -> Decimal {
    Decimal::new(2, 0)
}

fn default_max_volatility_score() -> Decimal {
    Decimal::new(2, 0)
}

fn default_latency_min_ms() -> u64 {
    50
}

fn default_latency_max_ms() -> u64 {
    200
}

fn default_fill_probability() -> f64 {
    0.95
}

fn default_partial_fill_probability() -> f64 {
    0.10
}

fn default_partial_fill_min_ratio() -> f64 {
    0.5
}

fn default_base_slippage() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_size_impact_factor() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_slippage_noise() -> Decimal {
    Decimal::new(5, 4) // 0.05%
}

fn default_max_slippage() -> Decimal {
    Decimal::new(2, 2) // 2%
}

fn default_rate_limit_capacity() -> f64 {
    10.0
}

fn default_rate_limit_refill_per_sec() -> f64 {
    5.0
}

fn default_queue_warn_depth() -> usize {
    50
}

fn default_queue_max_depth() -> usize {
    500
}

fn default_heartbeat_interval_secs() -> u64 {
    1
}

fn default_max_tick_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CLOB"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let capital = &self.capital;
        anyhow::ensure!(capital.total > Decimal::ZERO, "capital.total must be positive");
        anyhow::ensure!(
            capital.max_allocation_a >= Decimal::ZERO && capital.max_allocation_b >= Decimal::ZERO,
            "capital allocations must not be negative"
        );
        anyhow::ensure!(
            capital.max_allocation_a + capital.max_allocation_b <= capital.total,
            "max_allocation_a + max_allocation_b must not exceed capital.total"
        );

        let mm = &self.market_making;
        anyhow::ensure!(
            mm.max_exposure > Decimal::ZERO && mm.max_exposure <= capital.max_allocation_b,
            "market_making.max_exposure must be positive and within max_allocation_b"
        );
        anyhow::ensure!(
            mm.min_spread > Decimal::ZERO && mm.min_spread <= mm.max_spread,
            "market_making spread bounds must satisfy 0 < min_spread <= max_spread"
        );
        anyhow::ensure!(
            mm.min_price > Decimal::ZERO && mm.min_price < mm.max_price,
            "market_making price bounds must satisfy 0 < min_price < max_price"
        );
        anyhow::ensure!(mm.max_markets > 0, "market_making.max_markets must be positive");

        for (name, pct) in [
            ("front_running.trade_size_pct", self.front_running.trade_size_pct),
            ("market_making.trade_size_pct", mm.trade_size_pct),
        ] {
            anyhow::ensure!(
                pct > Decimal::ZERO && pct <= Decimal::ONE_HUNDRED,
                "{name} must be between 0 and 100"
            );
        }

        for exits in [&self.front_running.exits, &mm.exits] {
            anyhow::ensure!(
                exits.profit_target_pct > Decimal::ZERO
                    && exits.stop_loss_pct > Decimal::ZERO
                    && exits.trailing_stop_pct > Decimal::ZERO,
                "exit percentages must be positive"
            );
            anyhow::ensure!(
                exits.min_hold_secs <= exits.max_hold_secs,
                "min_hold_secs must not exceed max_hold_secs"
            );
        }

        anyhow::ensure!(
            self.risk.kill_switch_threshold_pct > Decimal::ZERO
                && self.risk.kill_switch_threshold_pct <= Decimal::ONE_HUNDRED,
            "risk.kill_switch_threshold_pct must be between 0 and 100"
        );
        anyhow::ensure!(
            self.risk.volatility_threshold_pct > Decimal::ZERO,
            "risk.volatility_threshold_pct must be positive"
        );

        let exec = &self.execution;
        anyhow::ensure!(
            exec.rate_limit_capacity >= 1.0 && exec.rate_limit_refill_per_sec > 0.0,
            "rate limiter needs capacity >= 1 and a positive refill rate"
        );
        anyhow::ensure!(
            exec.queue_warn_depth <= exec.queue_max_depth,
            "queue_warn_depth must not exceed queue_max_depth"
        );
        let paper = &exec.paper;
        anyhow::ensure!(
            (0.0..=1.0).contains(&paper.fill_probability)
                && (0.0..=1.0).contains(&paper.partial_fill_probability)
                && paper.partial_fill_min_ratio > 0.0
                && paper.partial_fill_min_ratio <= 1.0,
            "paper probabilities must lie in [0, 1]"
        );
        anyhow::ensure!(
            paper.latency_min_ms <= paper.latency_max_ms,
            "paper.latency_min_ms must not exceed latency_max_ms"
        );
        anyhow::ensure!(
            paper.min_slippage <= paper.max_slippage,
            "paper.min_slippage must not exceed max_slippage"
        );

        anyhow::ensure!(
            self.engine.heartbeat_interval_secs > 0,
            "engine.heartbeat_interval_secs must be positive"
        );
        let tick_budget = self.engine.tick_timeout();
        for (name, wait_ms) in [
            ("front_running.order_wait_timeout_ms", self.front_running.order_wait_timeout_ms),
            ("market_making.order_wait_timeout_ms", mm.order_wait_timeout_ms),
        ] {
            anyhow::ensure!(
                Duration::from_millis(wait_ms) < tick_budget,
                "{name} must be shorter than the {}ms tick budget",
                tick_budget.as_millis()
            );
        }

        Ok(())
    }
}

impl EngineConfig {
    /// Strategy tick budget: the shorter of two heartbeats and the configured cap.
    pub fn tick_timeout(&self) -> Duration {
        let two_beats = self.heartbeat_interval_secs.max(1) * 2;
        Duration::from_secs(two_beats.min(self.max_tick_timeout_secs.max(1)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capital: CapitalConfig::default(),
            front_running: FrontRunningConfig::default(),
            market_making: MarketMakingConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total: default_total_capital(),
            max_allocation_a: default_max_allocation_a(),
            max_allocation_b: default_max_allocation_b(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            profit_target_pct: default_profit_target_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            trailing_stop_pct: default_trailing_stop_pct(),
            trailing_profit_ratio: default_trailing_profit_ratio(),
            max_hold_secs: default_max_hold_secs(),
            min_hold_secs: default_min_hold_secs(),
            exit_mode: default_exit_mode(),
            volatility_widen_factor: default_volatility_widen_factor(),
        }
    }
}

impl Default for FrontRunningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trade_size_pct: default_fr_trade_size_pct(),
            trigger_cooldown_secs: default_trigger_cooldown_secs(),
            book_cache_ttl_ms: default_book_cache_ttl_ms(),
            max_entry_slippage_pct: default_max_entry_slippage_pct(),
            min_notional: default_min_notional(),
            order_wait_timeout_ms: default_order_wait_timeout_ms(),
            exits: ExitConfig::default(),
        }
    }
}

impl Default for MarketMakingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_exposure: default_max_exposure(),
            trade_size_pct: default_mm_trade_size_pct(),
            base_spread: default_base_spread(),
            min_spread: default_min_spread(),
            max_spread: default_max_spread(),
            volatility_multiplier: default_volatility_multiplier(),
            inventory_skew_max: default_inventory_skew_max(),
            imbalance_factor: default_imbalance_factor(),
            reprice_threshold: default_reprice_threshold(),
            max_markets: default_max_markets(),
            discovery_interval_secs: default_discovery_interval_secs(),
            scored_discovery_interval_secs: default_scored_discovery_interval_secs(),
            quote_slippage_pct: default_quote_slippage_pct(),
            min_notional: default_min_notional(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            order_wait_timeout_ms: default_order_wait_timeout_ms(),
            exits: default_mm_exits(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            kill_switch_threshold_pct: default_kill_switch_threshold_pct(),
            volatility_window_secs: default_volatility_window_secs(),
            volatility_threshold_pct: default_volatility_threshold_pct(),
            max_volatility_score: default_max_volatility_score(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            latency_min_ms: default_latency_min_ms(),
            latency_max_ms: default_latency_max_ms(),
            fill_probability: default_fill_probability(),
            partial_fill_probability: default_partial_fill_probability(),
            partial_fill_min_ratio: default_partial_fill_min_ratio(),
            base_slippage: default_base_slippage(),
            size_impact_factor: default_size_impact_factor(),
            slippage_noise: default_slippage_noise(),
            min_slippage: Decimal::ZERO,
            max_slippage: default_max_slippage(),
            seed: None,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            paper_trading: true,
            rate_limit_capacity: default_rate_limit_capacity(),
            rate_limit_refill_per_sec: default_rate_limit_refill_per_sec(),
            queue_warn_depth: default_queue_warn_depth(),
            queue_max_depth: default_queue_max_depth(),
            paper: PaperConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_tick_timeout_secs: default_max_tick_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.front_running.exits.trailing_profit_ratio, dec!(0.3));
        assert_eq!(config.market_making.min_price, dec!(0.01));
    }

    #[test]
    fn test_allocations_must_fit_total() {
        let mut config = Config::default();
        config.capital.max_allocation_a = dec!(800);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exposure_within_pool_b() {
        let mut config = Config::default();
        config.market_making.max_exposure = dec!(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paper_probability_bounds() {
        let mut config = Config::default();
        config.execution.paper.fill_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_order_waits_fit_inside_tick_budget() {
        let mut config = Config::default();
        assert_eq!(config.engine.tick_timeout(), Duration::from_secs(2));

        config.front_running.order_wait_timeout_ms = 5_000;
        assert!(config.validate().is_err());

        config.engine.heartbeat_interval_secs = 5;
        assert_eq!(config.engine.tick_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());

        config.market_making.order_wait_timeout_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_take_defaults() {
        let json = r#"{ "capital": { "total": "2000" }, "market_making": { "enabled": false } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.capital.total, dec!(2000));
        assert_eq!(config.capital.max_allocation_a, dec!(300));
        assert!(!config.market_making.enabled);
        assert_eq!(config.market_making.exits.max_hold_secs, 1_800);
        assert_eq!(config.front_running.exits.exit_mode, ExitMode::Dynamic);
    }
}
