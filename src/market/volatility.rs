//! Rolling-window price velocity filter.

use crate::audit::{self, AuditEvent, SharedAudit};
use crate::config::RiskConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Tracks recent prices per token and flags flash moves.
pub struct VolatilityFilter {
    window: Duration,
    threshold_pct: Decimal,
    max_score: Decimal,
    history: Mutex<HashMap<String, VecDeque<(Instant, Decimal)>>>,
    audit: SharedAudit,
}

impl VolatilityFilter {
    pub fn new(config: &RiskConfig, audit: SharedAudit) -> Self {
        Self {
            window: Duration::from_secs(config.volatility_window_secs),
            threshold_pct: config.volatility_threshold_pct,
            max_score: config.max_volatility_score,
            history: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Record an observed price and drop samples older than the window.
    pub fn update_price(&self, token_id: &str, price: Decimal) {
        self.record_at(token_id, price, Instant::now());
    }

    fn record_at(&self, token_id: &str, price: Decimal, at: Instant) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let samples = history.entry(token_id.to_string()).or_default();
        samples.push_back((at, price));
        while let Some((ts, _)) = samples.front() {
            if at.saturating_duration_since(*ts) > self.window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Max-to-min move inside the window, in percent.
    pub fn move_pct(&self, token_id: &str) -> Decimal {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let Some(samples) = history.get(token_id) else {
            return Decimal::ZERO;
        };
        if samples.len() < 2 {
            return Decimal::ZERO;
        }

        let min = samples.iter().map(|(_, p)| *p).min().unwrap_or_default();
        let max = samples.iter().map(|(_, p)| *p).max().unwrap_or_default();
        if min.is_zero() {
            return Decimal::ZERO;
        }
        (max - min) / min * dec!(100)
    }

    /// `false` when the windowed move exceeds the threshold.
    pub fn is_safe(&self, token_id: &str) -> bool {
        let move_pct = self.move_pct(token_id);
        if move_pct > self.threshold_pct {
            warn!(%token_id, move_pct = %move_pct.round_dp(2), "Volatility filter tripped");
            audit::log(
                self.audit.as_ref(),
                AuditEvent::PolicyViolation {
                    action: "VOLATILITY_FILTER_TRIGGER".to_string(),
                    reason: format!(
                        "token {} moved {}% (threshold {}%)",
                        token_id,
                        move_pct.round_dp(2),
                        self.threshold_pct
                    ),
                },
            );
            return false;
        }
        true
    }

    /// Windowed move relative to the threshold, capped at the configured maximum.
    pub fn score(&self, token_id: &str) -> Decimal {
        if self.threshold_pct.is_zero() {
            return Decimal::ZERO;
        }
        (self.move_pct(token_id) / self.threshold_pct).min(self.max_score)
    }

    pub fn reset(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::sync::Arc;

    fn filter() -> (VolatilityFilter, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (VolatilityFilter::new(&RiskConfig::default(), sink.clone()), sink)
    }

    #[test]
    fn test_single_sample_is_safe() {
        let (filter, _) = filter();
        filter.update_price("T1", dec!(0.50));
        assert!(filter.is_safe("T1"));
        assert!(filter.is_safe("unknown"));
        assert_eq!(filter.score("T1"), Decimal::ZERO);
    }

    #[test]
    fn test_flash_move_is_unsafe_and_audited() {
        let (filter, sink) = filter();
        filter.update_price("T1", dec!(0.50));
        filter.update_price("T1", dec!(0.52)); // 4% > 2%

        assert!(!filter.is_safe("T1"));
        assert_eq!(filter.score("T1"), dec!(2));
        assert_eq!(
            sink.count(|e| matches!(e, AuditEvent::PolicyViolation { .. })),
            1
        );
    }

    #[test]
    fn test_score_scales_with_move() {
        let (filter, _) = filter();
        filter.update_price("T1", dec!(1.00));
        filter.update_price("T1", dec!(1.01)); // 1% of a 2% threshold
        assert!(filter.is_safe("T1"));
        assert_eq!(filter.score("T1"), dec!(0.5));
    }

    #[test]
    fn test_old_samples_leave_window() {
        let (filter, _) = filter();
        let start = Instant::now();
        filter.record_at("T1", dec!(0.40), start);
        filter.record_at("T1", dec!(0.50), start + Duration::from_secs(61));
        filter.record_at("T1", dec!(0.50), start + Duration::from_secs(62));
        assert!(filter.is_safe("T1"));

        filter.reset();
        assert_eq!(filter.move_pct("T1"), Decimal::ZERO);
    }
}
