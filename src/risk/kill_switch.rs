//! One-way emergency stop.
//!
//! `Disarmed -> Armed` happens on the first trigger from any source and is
//! sticky until an operator reset. Resetting does not restore the frozen
//! capital ceilings; a fresh configuration load does.

use super::capital::CapitalManager;
use crate::audit::{self, AuditEvent, SharedAudit};
use crate::utils::{Observers, Subscriber};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Who tripped the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillTrigger {
    OperatorManual,
    CapitalBreach,
    PolicyViolation,
    HeartbeatTimeout,
    ExternalWatchdog,
    SystemError,
}

impl fmt::Display for KillTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KillTrigger::OperatorManual => "OPERATOR_MANUAL",
            KillTrigger::CapitalBreach => "CAPITAL_BREACH",
            KillTrigger::PolicyViolation => "POLICY_VIOLATION",
            KillTrigger::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            KillTrigger::ExternalWatchdog => "EXTERNAL_WATCHDOG",
            KillTrigger::SystemError => "SYSTEM_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Externally visible kill switch state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillSwitchStatus {
    pub active: bool,
    pub trigger: Option<KillTrigger>,
    pub reason: String,
    pub triggered_at: Option<DateTime<Utc>>,
}

pub type KillCallback = Arc<dyn Fn(&KillSwitchStatus) -> anyhow::Result<()> + Send + Sync>;

pub struct KillSwitch {
    state: Mutex<KillSwitchStatus>,
    capital: Arc<CapitalManager>,
    on_triggered: Mutex<Option<KillCallback>>,
    observers: Observers<KillSwitchStatus>,
    audit: SharedAudit,
}

impl KillSwitch {
    pub fn new(capital: Arc<CapitalManager>, audit: SharedAudit) -> Self {
        Self {
            state: Mutex::new(KillSwitchStatus {
                active: false,
                trigger: None,
                reason: String::new(),
                triggered_at: None,
            }),
            capital,
            on_triggered: Mutex::new(None),
            observers: Observers::new("kill_switch"),
            audit,
        }
    }

    /// Install the callback run once per trip (cancel orders, abort
    /// strategies, destroy credentials).
    pub fn set_on_triggered(&self, callback: KillCallback) {
        *self.on_triggered.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Trip the switch. A trigger while already armed is a no-op.
    pub fn trigger(&self, source: KillTrigger, reason: &str) {
        let status = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.active {
                return;
            }
            state.active = true;
            state.trigger = Some(source);
            state.reason = reason.to_string();
            state.triggered_at = Some(Utc::now());
            state.clone()
        };

        error!(%source, %reason, "KILL SWITCH TRIGGERED");
        audit::log(
            self.audit.as_ref(),
            AuditEvent::KillSwitchTriggered {
                source: source.to_string(),
                reason: reason.to_string(),
            },
        );

        self.capital.freeze_all();

        let callback = self
            .on_triggered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            if let Err(e) = callback(&status) {
                warn!(error = %e, "Kill switch callback failed");
                audit::log(
                    self.audit.as_ref(),
                    AuditEvent::Error {
                        context: "KILL_SWITCH_CALLBACK".to_string(),
                        message: e.to_string(),
                    },
                );
            }
        }

        self.observers.notify(&status);
    }

    /// Operator reset. Returns `false` if the switch was not armed.
    pub fn reset(&self, operator: &str) -> bool {
        let (previous, status) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.active {
                return false;
            }
            let previous = state.clone();
            state.active = false;
            state.trigger = None;
            state.reason.clear();
            state.triggered_at = None;
            (previous, state.clone())
        };

        info!(
            %operator,
            previous_trigger = ?previous.trigger,
            previous_reason = %previous.reason,
            "Kill switch reset; reload configuration before resuming"
        );
        audit::log(
            self.audit.as_ref(),
            AuditEvent::KillSwitchReset {
                operator: operator.to_string(),
            },
        );
        self.observers.notify(&status);
        true
    }

    /// Trip on `loss_pct >= threshold_pct`.
    pub fn check_capital_breach(&self, loss_pct: Decimal, threshold_pct: Decimal) -> bool {
        if loss_pct >= threshold_pct {
            self.trigger(
                KillTrigger::CapitalBreach,
                &format!(
                    "loss {}% >= threshold {}%",
                    loss_pct.round_dp(2),
                    threshold_pct.round_dp(2)
                ),
            );
            return true;
        }
        false
    }

    /// Trip because the orchestrator heartbeat stalled.
    pub fn check_heartbeat_timeout(&self) {
        self.trigger(KillTrigger::HeartbeatTimeout, "orchestrator heartbeat timeout");
    }

    pub fn subscribe(&self, subscriber: Subscriber<KillSwitchStatus>) {
        self.observers.subscribe(subscriber);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn status(&self) -> KillSwitchStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
