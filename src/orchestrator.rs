//! Top-level coordination.
//!
//! The orchestrator owns the bot state machine (`IDLE -> RUNNING <-> PAUSED`,
//! any state `-> KILLED` through the kill switch), builds every component
//! from a loaded configuration and drives the heartbeat that ticks the
//! active strategies.
//!
//! Capital, the kill switch and the policy layer live as long as the
//! orchestrator. The execution engine, volatility filter and strategies are
//! rebuilt on every configuration load.

use crate::audit::{self, AuditEvent, SharedAudit};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::exchange::{
    CredentialsProvider, MarketDiscovery, MarketScorer, OrderBookSource, TriggerFeed, VenueClient,
};
use crate::execution::{ExecutionEngine, ExecutionMode, ExecutionStats};
use crate::market::VolatilityFilter;
use crate::risk::{
    BotState, CapitalManager, CapitalSnapshot, KillCallback, KillSwitch, KillSwitchStatus,
    KillTrigger, PolicyAction, PolicyLayer,
};
use crate::strategy::{
    FrontRunningStrategy, MarketMakingStrategy, PerformanceStats, Strategy, StrategyContext,
    StrategyKind, StrategyState, StrategyStatus,
};
use crate::utils::{Observers, Subscriber};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Collaborators supplied by the embedding application.
#[derive(Clone)]
pub struct ExternalDeps {
    pub books: Arc<dyn OrderBookSource>,
    pub discovery: Arc<dyn MarketDiscovery>,
    pub scorer: Option<Arc<dyn MarketScorer>>,
    pub triggers: Option<Arc<dyn TriggerFeed>>,
    /// Required for live trading only
    pub venue: Option<Arc<dyn VenueClient>>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub audit: SharedAudit,
}

/// Everything rebuilt from a configuration.
struct Components {
    config: Arc<Config>,
    engine: ExecutionEngine,
    volatility: Arc<VolatilityFilter>,
    strategies: Vec<Arc<dyn Strategy>>,
}

impl Components {
    fn is_live(&self) -> bool {
        !self.engine.is_paper()
    }
}

struct Shared {
    deps: ExternalDeps,
    capital: Arc<CapitalManager>,
    kill_switch: Arc<KillSwitch>,
    policy: Arc<PolicyLayer>,
    state: RwLock<BotState>,
    components: RwLock<Option<Arc<Components>>>,
    last_heartbeat: Mutex<Option<Instant>>,
    observers: Observers<BotState>,
    /// Serializes operator calls
    operations: tokio::sync::Mutex<()>,
}

/// Handle to the running bot. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(deps: ExternalDeps) -> Self {
        let audit = deps.audit.clone();
        let capital = Arc::new(CapitalManager::unconfigured(audit.clone()));
        let kill_switch = Arc::new(KillSwitch::new(capital.clone(), audit.clone()));
        let policy = Arc::new(PolicyLayer::new(kill_switch.clone(), capital.clone(), audit));

        let shared = Arc::new(Shared {
            deps,
            capital,
            kill_switch,
            policy,
            state: RwLock::new(BotState::Idle),
            components: RwLock::new(None),
            last_heartbeat: Mutex::new(None),
            observers: Observers::new("bot_state"),
            operations: tokio::sync::Mutex::new(()),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let on_kill: KillCallback = Arc::new(move |status: &KillSwitchStatus| -> anyhow::Result<()> {
            if let Some(shared) = weak.upgrade() {
                shared.on_kill_switch(status);
            }
            Ok(())
        });
        shared.kill_switch.set_on_triggered(on_kill);

        Self { shared }
    }

    /// Validate `config` and rebuild every component from it.
    ///
    /// Only allowed while idle, or after a kill once the switch has been
    /// reset. Capital ceilings frozen by the kill switch are restored here.
    pub async fn load_config(&self, config: Config) -> EngineResult<()> {
        let shared = &self.shared;
        let _op = shared.operations.lock().await;

        let state = shared.state();
        let allowed = match state {
            BotState::Idle => true,
            BotState::Killed => !shared.kill_switch.is_active(),
            BotState::Running | BotState::Paused => false,
        };
        if !allowed {
            let reason = match state {
                BotState::Killed => "kill switch must be reset before loading a configuration".to_string(),
                other => format!("configuration can only be loaded while idle (current: {})", other),
            };
            return Err(shared.reject("LOAD_CONFIG", reason));
        }

        if let Err(e) = config.validate() {
            audit::log(
                shared.deps.audit.as_ref(),
                AuditEvent::OperatorAction {
                    action: "CONFIG_LOAD_FAILED".to_string(),
                    detail: json!({ "error": e.to_string() }),
                },
            );
            return Err(EngineError::Config(e.to_string()));
        }

        let config = Arc::new(config);
        let components = Arc::new(shared.build(config.clone())?);

        let previous = shared.write_components(Some(components));
        if let Some(previous) = previous {
            previous.engine.shutdown();
        }
        shared.capital.reconfigure(&config.capital);
        shared.policy.set_config(config.clone());
        if state == BotState::Killed {
            shared.set_state(BotState::Idle);
        }

        info!(
            paper = config.execution.paper_trading,
            total = %config.capital.total,
            "Configuration loaded"
        );
        audit::log(
            shared.deps.audit.as_ref(),
            AuditEvent::OperatorAction {
                action: "CONFIG_LOADED".to_string(),
                detail: json!({
                    "paper_trading": config.execution.paper_trading,
                    "total_capital": config.capital.total,
                }),
            },
        );
        Ok(())
    }

    /// Start trading: enable the engine and activate enabled strategies.
    pub async fn launch(&self) -> EngineResult<()> {
        let shared = &self.shared;
        let _op = shared.operations.lock().await;

        let Some(components) = shared.components() else {
            return Err(shared.reject("LAUNCH_BOT", "no configuration loaded".to_string()));
        };
        if components.is_live() && shared.deps.credentials.credentials().is_none() {
            warn!("Launch refused: live trading requires unlocked credentials");
            audit::log(
                shared.deps.audit.as_ref(),
                AuditEvent::PolicyViolation {
                    action: "LAUNCH_BOT".to_string(),
                    reason: "credentials are locked".to_string(),
                },
            );
            return Err(EngineError::CredentialsLocked);
        }

        let decision = shared.policy.validate(&PolicyAction::LaunchBot);
        if !decision.allowed {
            return Err(EngineError::Rejected(decision.reason));
        }

        shared.set_state(BotState::Running);
        shared.touch_heartbeat();
        components.engine.start();
        components.engine.enable();

        let mut activated = Vec::new();
        for strategy in &components.strategies {
            if strategy.activate().await {
                activated.push(strategy.name());
            }
        }

        info!(?activated, live = components.is_live(), "Bot launched");
        audit::log(
            shared.deps.audit.as_ref(),
            AuditEvent::OperatorAction {
                action: "BOT_LAUNCHED".to_string(),
                detail: json!({ "strategies": activated, "live": components.is_live() }),
            },
        );
        Ok(())
    }

    /// Stop placing new orders. Open orders and positions are left alone.
    pub async fn pause(&self) -> EngineResult<()> {
        self.transition(PolicyAction::PauseBot, BotState::Paused, "BOT_PAUSED")
            .await
    }

    pub async fn resume(&self) -> EngineResult<()> {
        self.transition(PolicyAction::ResumeBot, BotState::Running, "BOT_RESUMED")
            .await?;
        self.shared.touch_heartbeat();
        Ok(())
    }

    async fn transition(&self, action: PolicyAction, to: BotState, audit_action: &str) -> EngineResult<()> {
        let shared = &self.shared;
        let _op = shared.operations.lock().await;

        let decision = shared.policy.validate(&action);
        if !decision.allowed {
            return Err(EngineError::Rejected(decision.reason));
        }
        shared.set_state(to);
        audit::log(
            shared.deps.audit.as_ref(),
            AuditEvent::OperatorAction {
                action: audit_action.to_string(),
                detail: serde_json::Value::Null,
            },
        );
        Ok(())
    }

    /// Trip the kill switch by operator request. Returns `false` if it was
    /// already armed.
    pub fn emergency_stop(&self) -> bool {
        let shared = &self.shared;
        shared.policy.validate(&PolicyAction::EmergencyStop);
        if shared.kill_switch.is_active() {
            return false;
        }
        shared
            .kill_switch
            .trigger(KillTrigger::OperatorManual, "operator emergency stop");
        true
    }

    /// Disarm the kill switch. The bot stays `KILLED` until a configuration
    /// is loaded again.
    pub fn reset_kill_switch(&self, operator: &str) -> bool {
        self.shared.kill_switch.reset(operator)
    }

    /// Graceful stop: deactivate strategies, stop the engine and drop
    /// credentials.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let _op = shared.operations.lock().await;

        if let Some(components) = shared.components() {
            for strategy in &components.strategies {
                strategy.deactivate().await;
            }
            components.engine.shutdown();
        }
        shared.deps.credentials.destroy();

        if matches!(shared.state(), BotState::Running | BotState::Paused) {
            shared.set_state(BotState::Idle);
        }
        info!("Orchestrator shut down");
        audit::log(
            shared.deps.audit.as_ref(),
            AuditEvent::OperatorAction {
                action: "SYSTEM_SHUTDOWN".to_string(),
                detail: serde_json::Value::Null,
            },
        );
    }

    /// Heartbeat loop. Ticks every `heartbeat_interval_secs` until `shutdown`
    /// resolves, with a watchdog checking for stalled heartbeats alongside.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Some(components) = self.shared.components() else {
            warn!("Heartbeat loop started without configuration");
            return;
        };
        let period = Duration::from_secs(components.config.engine.heartbeat_interval_secs.max(1));

        let watchdog = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    this.check_heartbeat();
                }
            })
        };

        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "Heartbeat loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = heartbeat.tick() => {
                    self.tick_once().await;
                }
            }
        }

        watchdog.abort();
        self.shutdown().await;
    }

    /// One heartbeat: tick every active strategy under the tick timeout,
    /// then check realized losses against the kill threshold.
    pub async fn tick_once(&self) {
        let shared = &self.shared;
        if shared.state() != BotState::Running {
            return;
        }
        let Some(components) = shared.components() else {
            return;
        };
        shared.touch_heartbeat();

        let timeout = components.config.engine.tick_timeout();
        let active: Vec<&Arc<dyn Strategy>> = components
            .strategies
            .iter()
            .filter(|s| s.status().state == StrategyState::Active)
            .collect();

        let results = join_all(
            active
                .iter()
                .map(|s| tokio::time::timeout(timeout, s.process_tick())),
        )
        .await;

        for (strategy, result) in active.iter().zip(results) {
            let message = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => EngineError::Timeout {
                    operation: format!("{} tick", strategy.name()),
                    millis: timeout.as_millis() as u64,
                }
                .to_string(),
            };
            warn!(strategy = strategy.name(), error = %message, "Strategy tick failed");
            audit::log(
                shared.deps.audit.as_ref(),
                AuditEvent::Error {
                    context: "STRATEGY_TICK".to_string(),
                    message: format!("{}: {}", strategy.name(), message),
                },
            );
        }

        shared.check_capital_breach(&components);
    }

    /// Watchdog check. Trips the kill switch when a running bot has not
    /// completed a heartbeat within `heartbeat_timeout_secs`.
    pub fn check_heartbeat(&self) -> bool {
        let shared = &self.shared;
        if shared.state() != BotState::Running {
            return false;
        }
        let Some(components) = shared.components() else {
            return false;
        };
        let limit = Duration::from_secs(components.config.engine.heartbeat_timeout_secs);
        let last = *shared
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(last) = last else {
            return false;
        };

        let stalled = last.elapsed();
        if stalled <= limit {
            return false;
        }
        error!(stalled_secs = stalled.as_secs(), "Heartbeat stalled");
        shared.kill_switch.check_heartbeat_timeout();
        true
    }

    pub fn state(&self) -> BotState {
        self.shared.state()
    }

    pub fn config(&self) -> Option<Arc<Config>> {
        self.shared.components().map(|c| c.config.clone())
    }

    pub fn capital(&self) -> CapitalSnapshot {
        self.shared.capital.snapshot()
    }

    pub fn kill_switch_status(&self) -> KillSwitchStatus {
        self.shared.kill_switch.status()
    }

    pub fn strategy_statuses(&self) -> Vec<StrategyStatus> {
        self.shared
            .components()
            .map(|c| c.strategies.iter().map(|s| s.status()).collect())
            .unwrap_or_default()
    }

    pub fn performance(&self) -> Vec<(StrategyKind, PerformanceStats)> {
        self.shared
            .components()
            .map(|c| c.strategies.iter().map(|s| (s.kind(), s.performance())).collect())
            .unwrap_or_default()
    }

    pub fn execution_stats(&self) -> Option<ExecutionStats> {
        self.shared.components().map(|c| c.engine.stats())
    }

    /// Engine of the current configuration, if one is loaded.
    pub fn engine(&self) -> Option<ExecutionEngine> {
        self.shared.components().map(|c| c.engine.clone())
    }

    pub fn subscribe_state(&self, subscriber: Subscriber<BotState>) {
        self.shared.observers.subscribe(subscriber);
    }
}

impl Shared {
    fn state(&self) -> BotState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, to: BotState) {
        let from = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, to)
        };
        self.policy.set_bot_state(to);
        if from == to {
            return;
        }

        info!(%from, %to, "Bot state changed");
        audit::log(
            self.deps.audit.as_ref(),
            AuditEvent::StateTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
        );
        self.observers.notify(&to);
    }

    fn components(&self) -> Option<Arc<Components>> {
        self.components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn write_components(&self, components: Option<Arc<Components>>) -> Option<Arc<Components>> {
        let mut slot = self.components.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, components)
    }

    fn touch_heartbeat(&self) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn reject(&self, action: &str, reason: String) -> EngineError {
        warn!(%action, %reason, "Operator action rejected");
        audit::log(
            self.deps.audit.as_ref(),
            AuditEvent::PolicyViolation {
                action: action.to_string(),
                reason: reason.clone(),
            },
        );
        EngineError::Rejected(reason)
    }

    fn build(&self, config: Arc<Config>) -> EngineResult<Components> {
        let audit = self.deps.audit.clone();
        let mode = if config.execution.paper_trading {
            ExecutionMode::Paper
        } else {
            let Some(client) = self.deps.venue.clone() else {
                return Err(EngineError::Config(
                    "live trading requires a venue client".to_string(),
                ));
            };
            ExecutionMode::Live {
                client,
                credentials: self.deps.credentials.clone(),
            }
        };

        let engine = ExecutionEngine::new(&config.execution, mode, audit.clone());
        let volatility = Arc::new(VolatilityFilter::new(&config.risk, audit.clone()));
        let ctx = StrategyContext {
            config: config.clone(),
            capital: self.capital.clone(),
            policy: self.policy.clone(),
            engine: engine.clone(),
            volatility: volatility.clone(),
            books: self.deps.books.clone(),
            audit,
        };

        let strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(FrontRunningStrategy::new(ctx.clone(), self.deps.triggers.clone())),
            Arc::new(MarketMakingStrategy::new(
                ctx,
                self.deps.discovery.clone(),
                self.deps.scorer.clone(),
            )),
        ];

        Ok(Components {
            config,
            engine,
            volatility,
            strategies,
        })
    }

    /// Loss as a percentage of total capital, from realized PnL only.
    fn check_capital_breach(&self, components: &Components) {
        let total = self.capital.total();
        if total <= Decimal::ZERO {
            return;
        }
        let loss_pct = -components.engine.total_realized_pnl() / total * dec!(100);
        if loss_pct <= Decimal::ZERO {
            return;
        }
        debug!(loss_pct = %loss_pct.round_dp(4), "Capital loss check");
        self.kill_switch
            .check_capital_breach(loss_pct, components.config.risk.kill_switch_threshold_pct);
    }

    /// Kill switch callback. Runs synchronously inside `KillSwitch::trigger`,
    /// after capital has been frozen.
    fn on_kill_switch(&self, status: &KillSwitchStatus) {
        self.set_state(BotState::Killed);

        let mut cancelled = 0;
        if let Some(components) = self.components() {
            cancelled = components.engine.cancel_all();
            components.engine.disable();
            for strategy in &components.strategies {
                strategy.abort();
            }
            components.volatility.reset();
        }
        self.deps.credentials.destroy();

        error!(
            trigger = ?status.trigger,
            reason = %status.reason,
            cancelled,
            "Trading halted by kill switch"
        );
        audit::log(
            self.deps.audit.as_ref(),
            AuditEvent::OperatorAction {
                action: "KILL_SWITCH_CALLBACK".to_string(),
                detail: json!({ "cancelled_orders": cancelled }),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::exchange::{
        Credentials, InMemoryCredentials, MockVenueClient, OrderKind, Side, StaticBookSource,
    };
    use crate::execution::OrderRequest;
    use crate::strategy::test_support::exact_execution;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    // ===== Test Helpers =====

    struct Fixture {
        orchestrator: Orchestrator,
        books: Arc<StaticBookSource>,
        credentials: Arc<InMemoryCredentials>,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture_with(discovery: Option<Arc<dyn MarketDiscovery>>, venue: Option<Arc<dyn VenueClient>>) -> Fixture {
        let books = Arc::new(StaticBookSource::new());
        let credentials = Arc::new(InMemoryCredentials::new(Credentials::new("key", "secret", "pass", "wallet")));
        let sink = Arc::new(MemoryAuditSink::new());
        let deps = ExternalDeps {
            books: books.clone(),
            discovery: discovery.unwrap_or_else(|| books.clone()),
            scorer: None,
            triggers: None,
            venue,
            credentials: credentials.clone(),
            audit: sink.clone(),
        };
        Fixture {
            orchestrator: Orchestrator::new(deps),
            books,
            credentials,
            sink,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None, None)
    }

    fn paper_config() -> Config {
        Config {
            execution: exact_execution(),
            ..Config::default()
        }
    }

    fn idle_strategies_config() -> Config {
        let mut config = paper_config();
        config.front_running.enabled = false;
        config.market_making.enabled = false;
        config
    }

    /// Discovery that never answers.
    struct HangingDiscovery;

    #[async_trait]
    impl MarketDiscovery for HangingDiscovery {
        async fn discover(&self, _limit: usize) -> EngineResult<Vec<String>> {
            std::future::pending().await
        }
    }

    // ===== Lifecycle =====

    #[tokio::test]
    async fn test_launch_requires_configuration() {
        let f = fixture();
        let err = f.orchestrator.launch().await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
        assert_eq!(f.orchestrator.state(), BotState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_refused() {
        let f = fixture();
        let mut config = paper_config();
        config.capital.max_allocation_a = dec!(900);
        assert!(matches!(
            f.orchestrator.load_config(config).await,
            Err(EngineError::Config(_))
        ));
        assert!(f.orchestrator.config().is_none());
    }

    #[tokio::test]
    async fn test_launch_activates_strategies_and_locks_capital() {
        let f = fixture();
        f.orchestrator.load_config(paper_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();

        assert_eq!(f.orchestrator.state(), BotState::Running);
        let capital = f.orchestrator.capital();
        assert_eq!(capital.locked_a, dec!(300));
        assert_eq!(capital.locked_b, dec!(500));
        assert_eq!(capital.free, dec!(200));
        assert!(f
            .orchestrator
            .strategy_statuses()
            .iter()
            .all(|s| s.state == StrategyState::Active));

        // Loading again while running is refused
        assert_err!(f.orchestrator.load_config(paper_config()).await);
    }

    #[tokio::test]
    async fn test_pause_stops_ticks_and_resume_restarts_them() {
        let f = fixture();
        f.books
            .set_book("T1", &[(dec!(0.49), dec!(100))], &[(dec!(0.51), dec!(100))])
            .await;
        f.orchestrator.load_config(paper_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();

        f.orchestrator.pause().await.unwrap();
        assert_eq!(f.orchestrator.state(), BotState::Paused);
        f.orchestrator.tick_once().await;
        assert_eq!(f.books.fetch_count(), 0);

        // Pausing twice is not a valid transition
        assert_err!(f.orchestrator.pause().await);

        f.orchestrator.resume().await.unwrap();
        f.orchestrator.tick_once().await;
        assert!(f.books.fetch_count() > 0);
        assert!(f.orchestrator.execution_stats().unwrap().submitted >= 1);
    }

    #[tokio::test]
    async fn test_state_subscribers_see_transitions() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.orchestrator
            .subscribe_state(Arc::new(move |state: &BotState| -> anyhow::Result<()> {
                sink.lock().unwrap().push(*state);
                Ok(())
            }));

        f.orchestrator.load_config(idle_strategies_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();
        f.orchestrator.pause().await.unwrap();
        f.orchestrator.shutdown().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![BotState::Running, BotState::Paused, BotState::Idle]
        );
        // Credentials are dropped on shutdown
        assert!(f.credentials.credentials().is_none());
    }

    // ===== Live Mode =====

    #[tokio::test]
    async fn test_live_mode_needs_venue_and_credentials() {
        let mut live = idle_strategies_config();
        live.execution.paper_trading = false;

        let f = fixture();
        assert!(matches!(
            f.orchestrator.load_config(live.clone()).await,
            Err(EngineError::Config(_))
        ));

        let venue: Arc<dyn VenueClient> = Arc::new(MockVenueClient::new());
        let f = fixture_with(None, Some(venue));
        f.orchestrator.load_config(live).await.unwrap();
        f.credentials.destroy();

        assert!(matches!(
            f.orchestrator.launch().await,
            Err(EngineError::CredentialsLocked)
        ));
        assert_eq!(f.orchestrator.state(), BotState::Idle);
    }

    // ===== Kill Switch =====

    #[tokio::test]
    async fn test_emergency_stop_halts_everything() {
        let f = fixture();
        f.orchestrator.load_config(paper_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();

        assert!(f.orchestrator.emergency_stop());
        assert!(!f.orchestrator.emergency_stop());

        assert_eq!(f.orchestrator.state(), BotState::Killed);
        let capital = f.orchestrator.capital();
        assert_eq!(capital.locked_a, Decimal::ZERO);
        assert_eq!(capital.locked_b, Decimal::ZERO);
        assert_eq!(capital.max_a, Decimal::ZERO);
        assert!(!f.orchestrator.engine().unwrap().is_enabled());
        assert!(f.credentials.credentials().is_none());
        assert!(f
            .orchestrator
            .strategy_statuses()
            .iter()
            .all(|s| s.state == StrategyState::Inactive));
        assert_eq!(
            f.sink.count(|e| matches!(e, AuditEvent::KillSwitchTriggered { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_recovery_needs_reset_and_fresh_configuration() {
        let f = fixture();
        f.orchestrator.load_config(idle_strategies_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();
        f.orchestrator.emergency_stop();

        // Still armed
        assert_err!(f.orchestrator.load_config(idle_strategies_config()).await);
        assert_err!(f.orchestrator.launch().await);

        assert!(f.orchestrator.reset_kill_switch("operator"));
        assert_eq!(f.orchestrator.state(), BotState::Killed);
        assert_eq!(f.orchestrator.capital().max_b, Decimal::ZERO);

        assert_ok!(f.orchestrator.load_config(idle_strategies_config()).await);
        assert_eq!(f.orchestrator.state(), BotState::Idle);
        assert_eq!(f.orchestrator.capital().max_b, dec!(500));

        assert_ok!(f.orchestrator.launch().await);
        assert_eq!(f.orchestrator.state(), BotState::Running);
    }

    #[tokio::test]
    async fn test_realized_loss_past_threshold_trips_kill_switch() {
        let f = fixture();
        let mut config = idle_strategies_config();
        config.risk.kill_switch_threshold_pct = dec!(0.5);
        f.orchestrator.load_config(config).await.unwrap();
        f.orchestrator.launch().await.unwrap();

        let engine = f.orchestrator.engine().unwrap();
        let buy = engine
            .submit("test", OrderRequest::new("T1", Side::Buy, OrderKind::Gtc, dec!(0.50), dec!(100)))
            .unwrap();
        engine.wait_for(&buy, Duration::from_secs(1)).await;
        let sell = engine
            .submit("test", OrderRequest::new("T1", Side::Sell, OrderKind::Gtc, dec!(0.45), dec!(100)))
            .unwrap();
        engine.wait_for(&sell, Duration::from_secs(1)).await;
        // 100 x -0.05 = -5 on 1000 total: 0.5%
        assert_eq!(engine.total_realized_pnl(), dec!(-5));

        f.orchestrator.tick_once().await;

        let status = f.orchestrator.kill_switch_status();
        assert!(status.active);
        assert_eq!(status.trigger, Some(KillTrigger::CapitalBreach));
        assert_eq!(f.orchestrator.state(), BotState::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_heartbeat_trips_watchdog() {
        let f = fixture();
        f.orchestrator.load_config(idle_strategies_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();
        assert!(!f.orchestrator.check_heartbeat());

        tokio::time::advance(Duration::from_secs(20)).await;
        f.orchestrator.tick_once().await;
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!f.orchestrator.check_heartbeat());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(f.orchestrator.check_heartbeat());
        assert_eq!(
            f.orchestrator.kill_switch_status().trigger,
            Some(KillTrigger::HeartbeatTimeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_strategy_tick_times_out() {
        let discovery: Arc<dyn MarketDiscovery> = Arc::new(HangingDiscovery);
        let f = fixture_with(Some(discovery), None);
        let mut config = paper_config();
        config.front_running.enabled = false;
        f.orchestrator.load_config(config).await.unwrap();
        f.orchestrator.launch().await.unwrap();

        let started = Instant::now();
        f.orchestrator.tick_once().await;

        // min(2 x 1s heartbeat, 10s)
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(
            f.sink.count(|e| matches!(e, AuditEvent::Error { context, .. } if context == "STRATEGY_TICK")),
            1
        );
        assert_eq!(f.orchestrator.state(), BotState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_signal() {
        let f = fixture();
        f.orchestrator.load_config(idle_strategies_config()).await.unwrap();
        f.orchestrator.launch().await.unwrap();

        f.orchestrator
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        assert_eq!(f.orchestrator.state(), BotState::Idle);
        assert!(!f.orchestrator.kill_switch_status().active);
        assert_eq!(f.orchestrator.capital().locked_a, Decimal::ZERO);
    }
}
