//! Capital pools and exclusive locking.
//!
//! The manager is the single writer of pool state. Every check-then-act
//! sequence runs inside one mutex section so the two strategies can never
//! race on free capital.

use crate::audit::{self, AuditEvent, SharedAudit};
use crate::config::CapitalConfig;
use crate::utils::{Observers, Subscriber};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

/// Strategy capital pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CapitalPool {
    /// Front-running
    A,
    /// Market making
    B,
}

impl fmt::Display for CapitalPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapitalPool::A => write!(f, "A"),
            CapitalPool::B => write!(f, "B"),
        }
    }
}

/// Point-in-time view of the pools.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapitalSnapshot {
    pub total: Decimal,
    pub locked_a: Decimal,
    pub locked_b: Decimal,
    pub max_a: Decimal,
    pub max_b: Decimal,
    pub free: Decimal,
}

#[derive(Debug)]
struct PoolState {
    total: Decimal,
    locked_a: Decimal,
    locked_b: Decimal,
    max_a: Decimal,
    max_b: Decimal,
}

impl PoolState {
    fn free(&self) -> Decimal {
        self.total - self.locked_a - self.locked_b
    }

    fn locked(&self, pool: CapitalPool) -> Decimal {
        match pool {
            CapitalPool::A => self.locked_a,
            CapitalPool::B => self.locked_b,
        }
    }

    fn locked_mut(&mut self, pool: CapitalPool) -> &mut Decimal {
        match pool {
            CapitalPool::A => &mut self.locked_a,
            CapitalPool::B => &mut self.locked_b,
        }
    }

    fn max(&self, pool: CapitalPool) -> Decimal {
        match pool {
            CapitalPool::A => self.max_a,
            CapitalPool::B => self.max_b,
        }
    }

    fn snapshot(&self) -> CapitalSnapshot {
        CapitalSnapshot {
            total: self.total,
            locked_a: self.locked_a,
            locked_b: self.locked_b,
            max_a: self.max_a,
            max_b: self.max_b,
            free: self.free(),
        }
    }
}

/// Source of truth for capital allocation.
pub struct CapitalManager {
    state: Mutex<PoolState>,
    observers: Observers<CapitalSnapshot>,
    audit: SharedAudit,
}

impl CapitalManager {
    pub fn new(config: &CapitalConfig, audit: SharedAudit) -> Self {
        Self {
            state: Mutex::new(PoolState {
                total: config.total,
                locked_a: Decimal::ZERO,
                locked_b: Decimal::ZERO,
                max_a: config.max_allocation_a,
                max_b: config.max_allocation_b,
            }),
            observers: Observers::new("capital"),
            audit,
        }
    }

    /// Manager with no capital until a configuration is loaded.
    pub fn unconfigured(audit: SharedAudit) -> Self {
        Self::new(
            &CapitalConfig {
                total: Decimal::ZERO,
                max_allocation_a: Decimal::ZERO,
                max_allocation_b: Decimal::ZERO,
            },
            audit,
        )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock `amount` for `pool`.
    ///
    /// Returns `false` without mutating anything when the amount is not
    /// positive, exceeds the pool ceiling or exceeds free capital.
    pub fn lock(&self, pool: CapitalPool, amount: Decimal) -> bool {
        let result = {
            let mut state = self.state();
            let max = state.max(pool);
            let new_locked = state.locked(pool) + amount;
            let free = state.free();

            let rejection = if amount <= Decimal::ZERO {
                Some(format!("lock amount must be positive (got {})", amount))
            } else if amount > max {
                Some(format!("amount {} exceeds pool {} max {}", amount, pool, max))
            } else if new_locked > max {
                Some(format!(
                    "locking {} would bring pool {} to {} above max {}",
                    amount, pool, new_locked, max
                ))
            } else if amount > free {
                Some(format!("insufficient free capital: {} > {}", amount, free))
            } else {
                None
            };

            match rejection {
                Some(reason) => Err(reason),
                None => {
                    *state.locked_mut(pool) = new_locked;
                    Ok(state.snapshot())
                }
            }
        };

        match result {
            Ok(snapshot) => {
                info!(%pool, %amount, free = %snapshot.free, "Capital locked");
                self.record_change("LOCK", Some(pool), amount, &snapshot);
                self.observers.notify(&snapshot);
                true
            }
            Err(reason) => {
                warn!(%pool, %amount, %reason, "Capital lock rejected");
                audit::log(
                    self.audit.as_ref(),
                    AuditEvent::PolicyViolation {
                        action: format!("LOCK_CAPITAL_{}", pool),
                        reason,
                    },
                );
                false
            }
        }
    }

    /// Return `amount` from `pool` to free capital.
    ///
    /// Returns `false` when the amount is not positive or exceeds what the
    /// pool holds.
    pub fn release(&self, pool: CapitalPool, amount: Decimal) -> bool {
        let result = {
            let mut state = self.state();
            let locked = state.locked(pool);
            if amount <= Decimal::ZERO || amount > locked {
                Err(locked)
            } else {
                *state.locked_mut(pool) = locked - amount;
                Ok(state.snapshot())
            }
        };

        match result {
            Ok(snapshot) => {
                info!(%pool, %amount, free = %snapshot.free, "Capital released");
                self.record_change("RELEASE", Some(pool), amount, &snapshot);
                self.observers.notify(&snapshot);
                true
            }
            Err(locked) => {
                warn!(%pool, %amount, %locked, "Capital release rejected");
                audit::log(
                    self.audit.as_ref(),
                    AuditEvent::PolicyViolation {
                        action: format!("RELEASE_CAPITAL_{}", pool),
                        reason: format!("cannot release {} from {} locked", amount, locked),
                    },
                );
                false
            }
        }
    }

    /// Release everything held by `pool`, returning the amount released.
    pub fn release_all(&self, pool: CapitalPool) -> Decimal {
        let (released, snapshot) = {
            let mut state = self.state();
            let released = state.locked(pool);
            *state.locked_mut(pool) = Decimal::ZERO;
            (released, state.snapshot())
        };

        if released > Decimal::ZERO {
            info!(%pool, %released, "Released all pool capital");
            self.record_change("RELEASE_ALL", Some(pool), released, &snapshot);
            self.observers.notify(&snapshot);
        }
        released
    }

    /// Set both pool ceilings to zero. Locked amounts stay tracked.
    pub fn freeze_all(&self) {
        let snapshot = {
            let mut state = self.state();
            state.max_a = Decimal::ZERO;
            state.max_b = Decimal::ZERO;
            state.snapshot()
        };

        warn!(
            locked_a = %snapshot.locked_a,
            locked_b = %snapshot.locked_b,
            "Capital frozen"
        );
        self.record_change("FREEZE_ALL", None, Decimal::ZERO, &snapshot);
        self.observers.notify(&snapshot);
    }

    /// Apply freshly loaded limits. Locked amounts are preserved and a total
    /// below them is raised to the locked sum.
    pub fn reconfigure(&self, config: &CapitalConfig) {
        let snapshot = {
            let mut state = self.state();
            let locked = state.locked_a + state.locked_b;
            if config.total < locked {
                warn!(requested = %config.total, %locked, "Configured total below locked capital, clamping");
            }
            state.total = config.total.max(locked);
            state.max_a = config.max_allocation_a;
            state.max_b = config.max_allocation_b;
            state.snapshot()
        };

        info!(total = %snapshot.total, max_a = %snapshot.max_a, max_b = %snapshot.max_b, "Capital limits loaded");
        self.record_change("RECONFIGURE", None, snapshot.total, &snapshot);
        self.observers.notify(&snapshot);
    }

    pub fn free(&self) -> Decimal {
        self.state().free()
    }

    pub fn locked(&self, pool: CapitalPool) -> Decimal {
        self.state().locked(pool)
    }

    pub fn max(&self, pool: CapitalPool) -> Decimal {
        self.state().max(pool)
    }

    pub fn total(&self) -> Decimal {
        self.state().total
    }

    pub fn is_frozen(&self) -> bool {
        let state = self.state();
        state.max_a.is_zero() && state.max_b.is_zero()
    }

    pub fn snapshot(&self) -> CapitalSnapshot {
        self.state().snapshot()
    }

    /// Register a callback for every successful mutation.
    pub fn subscribe(&self, subscriber: Subscriber<CapitalSnapshot>) {
        self.observers.subscribe(subscriber);
    }

    fn record_change(
        &self,
        action: &str,
        pool: Option<CapitalPool>,
        amount: Decimal,
        snapshot: &CapitalSnapshot,
    ) {
        audit::log(
            self.audit.as_ref(),
            AuditEvent::CapitalChange {
                action: action.to_string(),
                pool: pool.map(|p| p.to_string()),
                amount,
                locked_a: snapshot.locked_a,
                locked_b: snapshot.locked_b,
                free: snapshot.free,
            },
        );
    }
}
