//! Exit rules shared by both strategies.
//!
//! Conditions are checked in priority order: profit target, stop loss,
//! trailing stop, then timeout. Nothing exits before the minimum hold time.

use crate::config::{ExitConfig, ExitMode};
use crate::utils::decimal::pct_change;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ExitRules {
    pub profit_target_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub trailing_stop_pct: Decimal,
    /// Share of the peak profit the trailing stop gives back
    pub trailing_profit_ratio: Decimal,
    pub max_hold: Duration,
    pub min_hold: Duration,
    pub mode: ExitMode,
    pub volatility_widen_factor: Decimal,
}

impl From<&ExitConfig> for ExitRules {
    fn from(config: &ExitConfig) -> Self {
        Self {
            profit_target_pct: config.profit_target_pct,
            stop_loss_pct: config.stop_loss_pct,
            trailing_stop_pct: config.trailing_stop_pct,
            trailing_profit_ratio: config.trailing_profit_ratio,
            max_hold: Duration::from_secs(config.max_hold_secs),
            min_hold: Duration::from_secs(config.min_hold_secs),
            mode: config.exit_mode,
            volatility_widen_factor: config.volatility_widen_factor,
        }
    }
}

/// Price marks of one open position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionMarks {
    pub entry_price: Decimal,
    /// High-water mark since entry
    pub highest_price: Decimal,
    pub current_price: Decimal,
    pub held: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    ProfitTarget { pnl_pct: Decimal, target_pct: Decimal },
    StopLoss { pnl_pct: Decimal, limit_pct: Decimal },
    TrailingStop { drawdown_pct: Decimal, peak_profit_pct: Decimal },
    Timeout { held: Duration },
}

impl ExitReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExitReason::ProfitTarget { .. } => "PROFIT_TARGET",
            ExitReason::StopLoss { .. } => "STOP_LOSS",
            ExitReason::TrailingStop { .. } => "TRAILING_STOP",
            ExitReason::Timeout { .. } => "TIMEOUT",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::ProfitTarget {
                pnl_pct,
                target_pct,
            } => write!(
                f,
                "PROFIT_TARGET ({}% >= {}%)",
                pnl_pct.round_dp(2),
                target_pct.round_dp(2)
            ),
            ExitReason::StopLoss { pnl_pct, limit_pct } => write!(
                f,
                "STOP_LOSS ({}% <= -{}%)",
                pnl_pct.round_dp(2),
                limit_pct.round_dp(2)
            ),
            ExitReason::TrailingStop {
                drawdown_pct,
                peak_profit_pct,
            } => write!(
                f,
                "TRAILING_STOP ({}% from high, peak profit {}%)",
                drawdown_pct.round_dp(2),
                peak_profit_pct.round_dp(2)
            ),
            ExitReason::Timeout { held } => write!(f, "TIMEOUT ({}s)", held.as_secs()),
        }
    }
}

/// Percent retracement from the high-water mark.
pub fn drawdown_from_high(highest: Decimal, current: Decimal) -> Decimal {
    if highest <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (highest - current) / highest * dec!(100)
}

/// First exit condition that matches, if any.
///
/// In `Dynamic` mode the profit and stop targets are widened by
/// `1 + volatility_score * volatility_widen_factor`. `Fixed` mode only
/// applies the timeout.
pub fn evaluate(rules: &ExitRules, marks: &PositionMarks, volatility_score: Decimal) -> Option<ExitReason> {
    if marks.held < rules.min_hold || marks.entry_price <= Decimal::ZERO {
        return None;
    }

    let price_exit = match rules.mode {
        ExitMode::Fixed => None,
        ExitMode::Dynamic | ExitMode::Hybrid => {
            let widen = if rules.mode == ExitMode::Dynamic {
                Decimal::ONE + volatility_score * rules.volatility_widen_factor
            } else {
                Decimal::ONE
            };
            price_exit(rules, marks, widen)
        }
    };

    price_exit.or_else(|| {
        (marks.held >= rules.max_hold).then_some(ExitReason::Timeout { held: marks.held })
    })
}

fn price_exit(rules: &ExitRules, marks: &PositionMarks, widen: Decimal) -> Option<ExitReason> {
    let pnl_pct = pct_change(marks.entry_price, marks.current_price);
    let target_pct = rules.profit_target_pct * widen;
    let limit_pct = rules.stop_loss_pct * widen;

    if pnl_pct >= target_pct {
        return Some(ExitReason::ProfitTarget { pnl_pct, target_pct });
    }
    if pnl_pct <= -limit_pct {
        return Some(ExitReason::StopLoss { pnl_pct, limit_pct });
    }

    // Trail only once the position has been in profit
    if marks.highest_price > marks.entry_price {
        let peak_profit_pct = pct_change(marks.entry_price, marks.highest_price);
        let drawdown_pct = drawdown_from_high(marks.highest_price, marks.current_price);
        let threshold = rules
            .trailing_stop_pct
            .max(peak_profit_pct * rules.trailing_profit_ratio);
        if drawdown_pct >= threshold && marks.current_price > marks.entry_price {
            return Some(ExitReason::TrailingStop {
                drawdown_pct,
                peak_profit_pct,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExitRules {
        ExitRules {
            profit_target_pct: dec!(20),
            stop_loss_pct: dec!(5),
            trailing_stop_pct: dec!(0.5),
            trailing_profit_ratio: dec!(0.3),
            max_hold: Duration::from_secs(120),
            min_hold: Duration::from_secs(5),
            mode: ExitMode::Dynamic,
            volatility_widen_factor: dec!(0.5),
        }
    }

    fn marks(entry: Decimal, high: Decimal, current: Decimal, held_secs: u64) -> PositionMarks {
        PositionMarks {
            entry_price: entry,
            highest_price: high,
            current_price: current,
            held: Duration::from_secs(held_secs),
        }
    }

    #[test]
    fn test_drawdown_measured_from_high() {
        let drawdown = drawdown_from_high(dec!(1.10), dec!(1.07));
        assert_eq!(drawdown.round_dp(2), dec!(2.73));
        // Entry price plays no part
        assert_eq!(drawdown, drawdown_from_high(dec!(1.10), dec!(1.07)));
    }

    #[test]
    fn test_trailing_threshold_scales_with_peak_profit() {
        let position = marks(dec!(1.00), dec!(1.10), dec!(1.07), 30);

        // Peak profit 10% x 0.3 = 3% threshold, drawdown 2.73% holds
        assert_eq!(evaluate(&rules(), &position, Decimal::ZERO), None);

        let tighter = ExitRules {
            trailing_profit_ratio: dec!(0.2),
            ..rules()
        };
        match evaluate(&tighter, &position, Decimal::ZERO) {
            Some(ExitReason::TrailingStop {
                drawdown_pct,
                peak_profit_pct,
            }) => {
                assert_eq!(drawdown_pct.round_dp(2), dec!(2.73));
                assert_eq!(peak_profit_pct, dec!(10));
            }
            other => panic!("expected trailing stop, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_stop_needs_price_above_entry() {
        let tighter = ExitRules {
            trailing_profit_ratio: dec!(0.1),
            ..rules()
        };
        // Fell back below entry: stop loss territory, not trailing
        let position = marks(dec!(1.00), dec!(1.10), dec!(0.99), 30);
        assert_eq!(evaluate(&tighter, &position, Decimal::ZERO), None);
    }

    #[test]
    fn test_priority_and_min_hold() {
        let r = ExitRules {
            profit_target_pct: dec!(2),
            ..rules()
        };
        // Profit target beats timeout
        let hit = evaluate(&r, &marks(dec!(0.50), dec!(0.52), dec!(0.52), 500), Decimal::ZERO);
        assert_eq!(hit.map(|e| e.code()), Some("PROFIT_TARGET"));

        // Too early to exit at all
        assert_eq!(evaluate(&r, &marks(dec!(0.50), dec!(0.60), dec!(0.60), 1), Decimal::ZERO), None);

        let stop = evaluate(&r, &marks(dec!(0.50), dec!(0.50), dec!(0.47), 10), Decimal::ZERO);
        assert_eq!(stop.map(|e| e.code()), Some("STOP_LOSS"));
    }

    #[test]
    fn test_volatility_widens_targets_in_dynamic_mode() {
        let r = ExitRules {
            profit_target_pct: dec!(2),
            ..rules()
        };
        let position = marks(dec!(1.00), dec!(1.03), dec!(1.03), 10);

        assert!(evaluate(&r, &position, Decimal::ZERO).is_some());
        // Score 2 widens the 2% target to 4%
        assert_eq!(evaluate(&r, &position, dec!(2)), None);

        let hybrid = ExitRules {
            mode: ExitMode::Hybrid,
            ..r
        };
        assert!(evaluate(&hybrid, &position, dec!(2)).is_some());
    }

    #[test]
    fn test_fixed_mode_only_times_out() {
        let r = ExitRules {
            mode: ExitMode::Fixed,
            ..rules()
        };
        assert_eq!(evaluate(&r, &marks(dec!(1.00), dec!(1.50), dec!(1.50), 60), Decimal::ZERO), None);

        let timeout = evaluate(&r, &marks(dec!(1.00), dec!(1.00), dec!(0.50), 120), Decimal::ZERO);
        assert_eq!(
            timeout,
            Some(ExitReason::Timeout {
                held: Duration::from_secs(120)
            })
        );
    }
}
