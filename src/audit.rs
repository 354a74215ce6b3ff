//! Structured audit trail.
//!
//! Every capital mutation, policy denial, kill-switch transition and order
//! lifecycle event is recorded as an [`AuditRecord`]. Formatting and rotation
//! of the persistent log are left to whichever [`AuditSink`] is installed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Severity used when mirroring an audit record into the tracing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    CapitalChange {
        action: String,
        pool: Option<String>,
        amount: Decimal,
        locked_a: Decimal,
        locked_b: Decimal,
        free: Decimal,
    },
    PolicyViolation {
        action: String,
        reason: String,
    },
    KillSwitchTriggered {
        source: String,
        reason: String,
    },
    KillSwitchReset {
        operator: String,
    },
    StateTransition {
        from: String,
        to: String,
    },
    OrderEvent {
        order_id: String,
        strategy: String,
        event: String,
        detail: Option<String>,
    },
    StrategyEvent {
        strategy: String,
        event: String,
        detail: serde_json::Value,
    },
    OperatorAction {
        action: String,
        detail: serde_json::Value,
    },
    Error {
        context: String,
        message: String,
    },
}

impl AuditEvent {
    pub fn severity(&self) -> AuditSeverity {
        match self {
            AuditEvent::KillSwitchTriggered { .. } => AuditSeverity::Critical,
            AuditEvent::PolicyViolation { .. } | AuditEvent::Error { .. } => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        }
    }
}

/// A timestamped audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    /// Emit as a structured JSON log line on the `audit` target.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.event.severity() {
            AuditSeverity::Info => info!(target: "audit", "AUDIT: {}", json),
            AuditSeverity::Warning => warn!(target: "audit", "AUDIT: {}", json),
            AuditSeverity::Critical => error!(target: "audit", "AUDIT: {}", json),
        }
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Shared handle used by every component.
pub type SharedAudit = Arc<dyn AuditSink>;

/// Timestamps `event` and hands it to `sink`.
pub fn log(sink: &dyn AuditSink, event: AuditEvent) {
    sink.record(&AuditRecord::new(event));
}

/// Mirrors audit records into the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        record.emit();
    }
}

/// Keeps records in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of records matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&AuditEvent) -> bool) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| predicate(&r.event))
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        record.emit();
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_with_type_tag() {
        let record = AuditRecord::new(AuditEvent::PolicyViolation {
            action: "LOCK_CAPITAL_A".to_string(),
            reason: "amount exceeds free capital".to_string(),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "policy_violation");
        assert_eq!(json["action"], "LOCK_CAPITAL_A");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemoryAuditSink::new();
        log(
            &sink,
            AuditEvent::KillSwitchReset {
                operator: "ops".to_string(),
            },
        );
        log(
            &sink,
            AuditEvent::Error {
                context: "tick".to_string(),
                message: "boom".to_string(),
            },
        );
        assert_eq!(sink.records().len(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, AuditEvent::KillSwitchReset { .. })),
            1
        );
    }

    #[test]
    fn test_kill_switch_events_are_critical() {
        let event = AuditEvent::KillSwitchTriggered {
            source: "OPERATOR_MANUAL".to_string(),
            reason: "test".to_string(),
        };
        assert_eq!(event.severity(), AuditSeverity::Critical);
    }
}
