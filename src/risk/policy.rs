//! Policy gate for every state-changing action.
//!
//! `validate` is advisory: it never mutates capital or bot state. Callers
//! perform the action themselves after an approval.

use super::capital::{CapitalManager, CapitalPool};
use super::kill_switch::KillSwitch;
use crate::audit::{self, AuditEvent, SharedAudit};
use crate::config::Config;
use crate::strategy::StrategyKind;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Lifecycle of the whole bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BotState {
    Idle,
    Running,
    Paused,
    Killed,
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BotState::Idle => "IDLE",
            BotState::Running => "RUNNING",
            BotState::Paused => "PAUSED",
            BotState::Killed => "KILLED",
        };
        write!(f, "{}", name)
    }
}

/// Actions that require approval.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    LaunchBot,
    PauseBot,
    ResumeBot,
    EmergencyStop,
    ActivateStrategy(StrategyKind),
    DeactivateStrategy(StrategyKind),
    LockCapital { pool: CapitalPool, amount: Decimal },
    PlaceOrder {
        strategy: StrategyKind,
        token_id: String,
        notional: Decimal,
    },
}

impl PolicyAction {
    pub fn name(&self) -> String {
        match self {
            PolicyAction::LaunchBot => "LAUNCH_BOT".to_string(),
            PolicyAction::PauseBot => "PAUSE_BOT".to_string(),
            PolicyAction::ResumeBot => "RESUME_BOT".to_string(),
            PolicyAction::EmergencyStop => "EMERGENCY_STOP".to_string(),
            PolicyAction::ActivateStrategy(kind) => format!("ACTIVATE_STRATEGY_{}", kind.pool()),
            PolicyAction::DeactivateStrategy(kind) => {
                format!("DEACTIVATE_STRATEGY_{}", kind.pool())
            }
            PolicyAction::LockCapital { pool, .. } => format!("LOCK_CAPITAL_{}", pool),
            PolicyAction::PlaceOrder { .. } => "PLACE_ORDER".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Approves or rejects actions from bot state, kill-switch state and config.
pub struct PolicyLayer {
    bot_state: RwLock<BotState>,
    config: RwLock<Option<Arc<Config>>>,
    kill_switch: Arc<KillSwitch>,
    capital: Arc<CapitalManager>,
    audit: SharedAudit,
}

impl PolicyLayer {
    pub fn new(kill_switch: Arc<KillSwitch>, capital: Arc<CapitalManager>, audit: SharedAudit) -> Self {
        Self {
            bot_state: RwLock::new(BotState::Idle),
            config: RwLock::new(None),
            kill_switch,
            capital,
            audit,
        }
    }

    pub fn validate(&self, action: &PolicyAction) -> PolicyDecision {
        let decision = if self.kill_switch.is_active() && *action != PolicyAction::EmergencyStop {
            PolicyDecision::deny("kill switch is active - no actions permitted")
        } else {
            self.evaluate(action)
        };

        if decision.allowed {
            debug!(action = %action.name(), "Policy approved");
        } else {
            audit::log(
                self.audit.as_ref(),
                AuditEvent::PolicyViolation {
                    action: action.name(),
                    reason: decision.reason.clone(),
                },
            );
        }
        decision
    }

    fn evaluate(&self, action: &PolicyAction) -> PolicyDecision {
        let state = self.bot_state();
        let config = self.config();

        match action {
            PolicyAction::LaunchBot => {
                if state != BotState::Idle {
                    PolicyDecision::deny(format!("bot not in IDLE state (current: {})", state))
                } else if config.is_none() {
                    PolicyDecision::deny("no configuration loaded")
                } else {
                    PolicyDecision::allow("launch permitted")
                }
            }
            PolicyAction::PauseBot => match state {
                BotState::Running => PolicyDecision::allow("pause permitted"),
                _ => PolicyDecision::deny(format!("bot not running (current: {})", state)),
            },
            PolicyAction::ResumeBot => match state {
                BotState::Paused => PolicyDecision::allow("resume permitted"),
                _ => PolicyDecision::deny(format!("bot not paused (current: {})", state)),
            },
            PolicyAction::EmergencyStop => PolicyDecision::allow("emergency stop always permitted"),
            PolicyAction::ActivateStrategy(kind) => {
                let enabled = config.as_ref().is_some_and(|c| match kind {
                    StrategyKind::FrontRunning => c.front_running.enabled,
                    StrategyKind::MarketMaking => c.market_making.enabled,
                });
                if !enabled {
                    PolicyDecision::deny(format!("{} is disabled in configuration", kind))
                } else if state != BotState::Running {
                    PolicyDecision::deny("bot must be running to activate a strategy")
                } else {
                    PolicyDecision::allow(format!("{} activation permitted", kind))
                }
            }
            PolicyAction::DeactivateStrategy(kind) => {
                PolicyDecision::allow(format!("{} deactivation permitted", kind))
            }
            PolicyAction::LockCapital { pool, amount } => {
                let Some(config) = config else {
                    return PolicyDecision::deny("no configuration loaded");
                };
                let max = match pool {
                    CapitalPool::A => config.capital.max_allocation_a,
                    CapitalPool::B => config.capital.max_allocation_b,
                };
                let free = self.capital.free();
                if *amount <= Decimal::ZERO {
                    PolicyDecision::deny("lock amount must be positive")
                } else if *amount > max {
                    PolicyDecision::deny(format!("amount {} exceeds max allocation {}", amount, max))
                } else if *amount > free {
                    PolicyDecision::deny(format!("insufficient free capital: {} > {}", amount, free))
                } else {
                    PolicyDecision::allow(format!("capital lock for pool {} permitted", pool))
                }
            }
            PolicyAction::PlaceOrder { notional, .. } => {
                if state != BotState::Running {
                    PolicyDecision::deny("bot must be running to place orders")
                } else if *notional <= Decimal::ZERO {
                    PolicyDecision::deny("order notional must be positive")
                } else {
                    PolicyDecision::allow("order placement permitted")
                }
            }
        }
    }

    pub fn bot_state(&self) -> BotState {
        *self.bot_state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Only the orchestrator updates the tracked state.
    pub(crate) fn set_bot_state(&self, state: BotState) {
        *self.bot_state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn config(&self) -> Option<Arc<Config>> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Some(config);
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::risk::KillTrigger;
    use rust_decimal_macros::dec;

    // ===== Test Helpers =====

    fn setup(config: Option<Config>) -> (PolicyLayer, Arc<KillSwitch>, Arc<CapitalManager>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let cfg = config.clone().unwrap_or_default();
        let capital = Arc::new(CapitalManager::new(&cfg.capital, sink.clone()));
        let kill_switch = Arc::new(KillSwitch::new(capital.clone(), sink.clone()));
        let policy = PolicyLayer::new(kill_switch.clone(), capital.clone(), sink.clone());
        if let Some(config) = config {
            policy.set_config(Arc::new(config));
        }
        (policy, kill_switch, capital, sink)
    }

    // ===== Bot Lifecycle =====

    #[test]
    fn test_launch_requires_idle_and_config() {
        let (policy, _, _, _) = setup(None);
        assert!(!policy.validate(&PolicyAction::LaunchBot).allowed);

        let (policy, _, _, _) = setup(Some(Config::default()));
        assert!(policy.validate(&PolicyAction::LaunchBot).allowed);

        policy.set_bot_state(BotState::Running);
        let decision = policy.validate(&PolicyAction::LaunchBot);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("RUNNING"));
    }

    #[test]
    fn test_pause_and_resume_rules() {
        let (policy, _, _, _) = setup(Some(Config::default()));
        assert!(!policy.validate(&PolicyAction::PauseBot).allowed);
        assert!(!policy.validate(&PolicyAction::ResumeBot).allowed);

        policy.set_bot_state(BotState::Running);
        assert!(policy.validate(&PolicyAction::PauseBot).allowed);

        policy.set_bot_state(BotState::Paused);
        assert!(policy.validate(&PolicyAction::ResumeBot).allowed);
    }

    #[test]
    fn test_kill_switch_denies_everything_but_emergency_stop() {
        let (policy, kill_switch, _, sink) = setup(Some(Config::default()));
        policy.set_bot_state(BotState::Running);
        kill_switch.trigger(KillTrigger::OperatorManual, "test");

        let place = PolicyAction::PlaceOrder {
            strategy: StrategyKind::FrontRunning,
            token_id: "T1".to_string(),
            notional: dec!(10),
        };
        assert!(!policy.validate(&place).allowed);
        assert!(!policy.validate(&PolicyAction::PauseBot).allowed);
        assert!(!policy.validate(&PolicyAction::DeactivateStrategy(StrategyKind::MarketMaking)).allowed);
        assert!(policy.validate(&PolicyAction::EmergencyStop).allowed);
        assert_eq!(
            sink.count(|e| matches!(e, AuditEvent::PolicyViolation { reason, .. } if reason.contains("kill switch"))),
            3
        );
    }

    // ===== Strategies & Orders =====

    #[test]
    fn test_activation_requires_enabled_and_running() {
        let mut config = Config::default();
        config.market_making.enabled = false;
        let (policy, _, _, _) = setup(Some(config));

        let activate_a = PolicyAction::ActivateStrategy(StrategyKind::FrontRunning);
        let activate_b = PolicyAction::ActivateStrategy(StrategyKind::MarketMaking);
        assert!(!policy.validate(&activate_a).allowed);

        policy.set_bot_state(BotState::Running);
        assert!(policy.validate(&activate_a).allowed);
        let decision = policy.validate(&activate_b);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("disabled"));
    }

    #[test]
    fn test_place_order_requires_running() {
        let (policy, _, _, _) = setup(Some(Config::default()));
        let place = PolicyAction::PlaceOrder {
            strategy: StrategyKind::MarketMaking,
            token_id: "T1".to_string(),
            notional: dec!(5),
        };
        assert!(!policy.validate(&place).allowed);
        policy.set_bot_state(BotState::Running);
        assert!(policy.validate(&place).allowed);
        policy.set_bot_state(BotState::Paused);
        assert!(!policy.validate(&place).allowed);
    }

    // ===== Capital =====

    #[test]
    fn test_lock_capital_rules_do_not_mutate() {
        let (policy, _, capital, _) = setup(Some(Config::default()));
        let lock = |pool, amount| PolicyAction::LockCapital { pool, amount };

        assert!(!policy.validate(&lock(CapitalPool::A, dec!(0))).allowed);
        assert!(!policy.validate(&lock(CapitalPool::A, dec!(301))).allowed);
        assert!(policy.validate(&lock(CapitalPool::A, dec!(300))).allowed);
        assert_eq!(capital.free(), dec!(1000));

        assert!(capital.lock(CapitalPool::B, dec!(500)));
        assert!(capital.lock(CapitalPool::A, dec!(300)));
        // 200 free left
        assert!(!policy.validate(&lock(CapitalPool::B, dec!(250))).allowed);
    }
}
