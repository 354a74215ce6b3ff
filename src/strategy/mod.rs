//! Trading strategies.
//!
//! Contains:
//! - The [`Strategy`] trait the orchestrator drives every heartbeat
//! - Reactive front-running on external triggers
//! - Multi-market quoting with inventory skew
//! - Shared exit rules (profit target, stop loss, trailing stop, timeout)

pub mod exit;
mod front_running;
mod market_making;

pub use front_running::{EntryPosition, FrontRunningStrategy};
pub use market_making::{
    compute_quotes, needs_reprice, BookEvent, MarketMakingStrategy, MarketState, QuoteInputs,
    Quotes,
};

use crate::audit::SharedAudit;
use crate::config::Config;
use crate::error::EngineResult;
use crate::exchange::OrderBookSource;
use crate::execution::{ExecutionEngine, Order, OrderId};
use crate::market::VolatilityFilter;
use crate::risk::{CapitalManager, CapitalPool, PolicyAction, PolicyLayer};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// The two strategies the bot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FrontRunning,
    MarketMaking,
}

impl StrategyKind {
    /// Capital pool backing this strategy.
    pub fn pool(self) -> CapitalPool {
        match self {
            StrategyKind::FrontRunning => CapitalPool::A,
            StrategyKind::MarketMaking => CapitalPool::B,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::FrontRunning => "front_running",
            StrategyKind::MarketMaking => "market_making",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// `Inactive -> Activating -> Active -> {Deactivating -> Inactive | Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyState {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Error,
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyState::Inactive => "INACTIVE",
            StrategyState::Activating => "ACTIVATING",
            StrategyState::Active => "ACTIVE",
            StrategyState::Deactivating => "DEACTIVATING",
            StrategyState::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot exposed to status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatus {
    pub name: String,
    pub state: StrategyState,
    pub locked_capital: Decimal,
    pub position_count: usize,
    pub last_action: Option<String>,
    pub error_message: Option<String>,
}

impl StrategyStatus {
    fn new(kind: StrategyKind) -> Self {
        Self {
            name: kind.name().to_string(),
            state: StrategyState::Inactive,
            locked_capital: Decimal::ZERO,
            position_count: 0,
            last_action: None,
            error_message: None,
        }
    }
}

/// Closed-trade aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub trade_count: u64,
    pub winning_trades: u64,
    /// Percent of closed trades with positive PnL
    pub win_rate: f64,
    pub realized_pnl: Decimal,
}

impl PerformanceStats {
    pub fn record_trade(&mut self, pnl: Decimal) {
        self.trade_count += 1;
        if pnl > Decimal::ZERO {
            self.winning_trades += 1;
        }
        self.realized_pnl += pnl;
        self.win_rate = self.winning_trades as f64 / self.trade_count as f64 * 100.0;
    }
}

/// An exit order whose fill has not been folded into the position yet.
#[derive(Debug, Clone)]
pub struct PendingExit {
    pub order_id: OrderId,
    pub reason: exit::ExitReason,
}

/// Where a tracked order stands once a strategy stops waiting on it.
#[derive(Debug)]
pub(crate) enum Settlement {
    /// No further fill can land
    Done(Order),
    /// Cancel requested but a venue call is still running
    InFlight,
    Unknown,
}

/// Uniform surface the orchestrator drives.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Lock capital and start trading. `false` leaves the strategy inactive
    /// (or in `Error` if it got as far as a failure).
    async fn activate(&self) -> bool;

    /// Cancel outstanding orders, release capital and go inactive.
    async fn deactivate(&self);

    /// One heartbeat worth of work.
    async fn process_tick(&self) -> EngineResult<()>;

    /// Non-blocking emergency stop: records cancel intent, releases capital
    /// and clears in-memory state.
    fn abort(&self);

    fn status(&self) -> StrategyStatus;

    fn performance(&self) -> PerformanceStats;
}

/// Collaborators shared by both strategies.
#[derive(Clone)]
pub struct StrategyContext {
    pub config: Arc<Config>,
    pub capital: Arc<CapitalManager>,
    pub policy: Arc<PolicyLayer>,
    pub engine: ExecutionEngine,
    pub volatility: Arc<VolatilityFilter>,
    pub books: Arc<dyn OrderBookSource>,
    pub audit: SharedAudit,
}

impl StrategyContext {
    /// Policy-approved lock of the strategy's whole ceiling.
    ///
    /// Returns the reason on refusal. A refused lock is never retried here.
    fn lock_ceiling(&self, kind: StrategyKind, amount: Decimal) -> Result<(), String> {
        let decision = self.policy.validate(&PolicyAction::ActivateStrategy(kind));
        if !decision.allowed {
            return Err(decision.reason);
        }

        let pool = kind.pool();
        let decision = self.policy.validate(&PolicyAction::LockCapital { pool, amount });
        if !decision.allowed {
            return Err(decision.reason);
        }

        if !self.capital.lock(pool, amount) {
            return Err(format!("capital lock of {} in pool {} refused", amount, pool));
        }
        Ok(())
    }

    /// Release everything the strategy holds in its pool.
    fn release_ceiling(&self, kind: StrategyKind) -> Decimal {
        let released = self.capital.release_all(kind.pool());
        if released.is_zero() {
            warn!(strategy = %kind, "No capital to release");
        }
        released
    }

    /// Cancel a tracked order if it is still open and report whether its
    /// fill is final.
    fn settle_order(&self, order_id: &str) -> Settlement {
        match self.engine.order(order_id) {
            Some(order) if order.is_settled() => return Settlement::Done(order),
            Some(_) => {
                self.engine.cancel(order_id);
            }
            None => return Settlement::Unknown,
        }
        match self.engine.order(order_id) {
            Some(order) if order.is_settled() => Settlement::Done(order),
            Some(_) => Settlement::InFlight,
            None => Settlement::Unknown,
        }
    }

    fn place_order_allowed(&self, kind: StrategyKind, token_id: &str, notional: Decimal) -> bool {
        self.policy
            .validate(&PolicyAction::PlaceOrder {
                strategy: kind,
                token_id: token_id.to_string(),
                notional,
            })
            .allowed
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::{ExecutionConfig, PaperConfig};
    use crate::exchange::StaticBookSource;
    use crate::execution::ExecutionMode;
    use crate::risk::{BotState, KillSwitch};

    /// Zero-latency, always-filling, zero-slippage paper engine.
    pub fn exact_execution() -> ExecutionConfig {
        ExecutionConfig {
            paper: PaperConfig {
                latency_min_ms: 0,
                latency_max_ms: 0,
                fill_probability: 1.0,
                partial_fill_probability: 0.0,
                base_slippage: Decimal::ZERO,
                size_impact_factor: Decimal::ZERO,
                slippage_noise: Decimal::ZERO,
                seed: Some(7),
                ..PaperConfig::default()
            },
            ..ExecutionConfig::default()
        }
    }

    pub struct Harness {
        pub ctx: StrategyContext,
        pub books: Arc<StaticBookSource>,
        pub kill_switch: Arc<KillSwitch>,
        pub sink: Arc<MemoryAuditSink>,
    }

    /// Running bot with a started engine and an empty static book source.
    pub fn harness(config: Config) -> Harness {
        harness_with(config, None)
    }

    /// Like [`harness`] with a custom paper engine instead of the exact one.
    pub fn harness_with(mut config: Config, execution: Option<ExecutionConfig>) -> Harness {
        config.execution = execution.unwrap_or_else(exact_execution);
        let config = Arc::new(config);
        let sink = Arc::new(MemoryAuditSink::new());
        let audit: SharedAudit = sink.clone();

        let capital = Arc::new(CapitalManager::new(&config.capital, audit.clone()));
        let kill_switch = Arc::new(KillSwitch::new(capital.clone(), audit.clone()));
        let policy = Arc::new(PolicyLayer::new(kill_switch.clone(), capital.clone(), audit.clone()));
        policy.set_config(config.clone());
        policy.set_bot_state(BotState::Running);

        let engine = ExecutionEngine::new(&config.execution, ExecutionMode::Paper, audit.clone());
        engine.start();
        engine.enable();

        let books = Arc::new(StaticBookSource::new());
        let ctx = StrategyContext {
            volatility: Arc::new(VolatilityFilter::new(&config.risk, audit.clone())),
            config,
            capital,
            policy,
            engine,
            books: books.clone(),
            audit,
        };
        Harness {
            ctx,
            books,
            kill_switch,
            sink,
        }
    }
}
