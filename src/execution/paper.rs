//! Paper-trading fill simulator.
//!
//! Models network latency, a fill-probability roll, depth- and
//! size-dependent slippage and partial fills. All parameters come from
//! [`PaperConfig`]; a fixed seed makes a run reproducible.

use crate::config::PaperConfig;
use crate::exchange::Side;
use crate::utils::decimal::from_f64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::time::Duration;

/// Result of one simulated execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaperOutcome {
    NotFilled,
    Filled {
        price: Decimal,
        size: Decimal,
        slippage: Decimal,
    },
}

pub struct PaperSimulator {
    config: PaperConfig,
    rng: Mutex<StdRng>,
}

impl PaperSimulator {
    pub fn new(config: PaperConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Uniform latency in the configured range.
    pub fn latency(&self) -> Duration {
        let (min, max) = (self.config.latency_min_ms, self.config.latency_max_ms);
        if max <= min {
            return Duration::from_millis(min);
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Duration::from_millis(rng.random_range(min..=max))
    }

    /// Roll fill, slippage and partial fill for an order.
    ///
    /// Slippage is `base + impact * size / depth + noise`, clamped to
    /// `[min_slippage, max_slippage]`. An unknown depth is treated as equal
    /// to the order size.
    pub fn simulate(
        &self,
        side: Side,
        price: Decimal,
        size: Decimal,
        reference_depth: Option<Decimal>,
    ) -> PaperOutcome {
        let cfg = &self.config;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        if rng.random::<f64>() >= cfg.fill_probability {
            return PaperOutcome::NotFilled;
        }

        let depth = reference_depth.filter(|d| *d > Decimal::ZERO).unwrap_or(size);
        let size_ratio = if depth.is_zero() { Decimal::ONE } else { size / depth };
        let noise = cfg.slippage_noise * from_f64(rng.random_range(-1.0..=1.0));
        let slippage = (cfg.base_slippage + cfg.size_impact_factor * size_ratio + noise)
            .clamp(cfg.min_slippage, cfg.max_slippage);

        let fill_price = match side {
            Side::Buy => price * (Decimal::ONE + slippage),
            Side::Sell => price * (Decimal::ONE - slippage),
        }
        .round_dp(6);

        let mut fill_size = size;
        if rng.random::<f64>() < cfg.partial_fill_probability {
            let ratio = if cfg.partial_fill_min_ratio >= 1.0 {
                1.0
            } else {
                rng.random_range(cfg.partial_fill_min_ratio..1.0)
            };
            fill_size = (size * from_f64(ratio)).round_dp(6);
            if fill_size <= Decimal::ZERO {
                return PaperOutcome::NotFilled;
            }
        }

        PaperOutcome::Filled {
            price: fill_price,
            size: fill_size,
            slippage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exact_config() -> PaperConfig {
        PaperConfig {
            latency_min_ms: 0,
            latency_max_ms: 0,
            fill_probability: 1.0,
            partial_fill_probability: 0.0,
            base_slippage: Decimal::ZERO,
            size_impact_factor: Decimal::ZERO,
            slippage_noise: Decimal::ZERO,
            seed: Some(42),
            ..PaperConfig::default()
        }
    }

    #[test]
    fn test_exact_fill_without_slippage() {
        let sim = PaperSimulator::new(exact_config());
        assert_eq!(sim.latency(), Duration::ZERO);
        assert_eq!(
            sim.simulate(Side::Buy, dec!(0.50), dec!(10), Some(dec!(100))),
            PaperOutcome::Filled {
                price: dec!(0.50),
                size: dec!(10),
                slippage: Decimal::ZERO
            }
        );
    }

    #[test]
    fn test_zero_fill_probability_never_fills() {
        let sim = PaperSimulator::new(PaperConfig {
            fill_probability: 0.0,
            ..exact_config()
        });
        for _ in 0..20 {
            assert_eq!(
                sim.simulate(Side::Sell, dec!(0.5), dec!(1), None),
                PaperOutcome::NotFilled
            );
        }
    }

    #[test]
    fn test_slippage_moves_price_against_taker() {
        let sim = PaperSimulator::new(PaperConfig {
            base_slippage: dec!(0.01),
            size_impact_factor: dec!(0.02),
            ..exact_config()
        });

        // size/depth = 0.5 -> 0.01 + 0.01 = 2%
        let buy = sim.simulate(Side::Buy, dec!(0.50), dec!(50), Some(dec!(100)));
        assert_eq!(
            buy,
            PaperOutcome::Filled {
                price: dec!(0.51),
                size: dec!(50),
                slippage: dec!(0.02)
            }
        );
        let sell = sim.simulate(Side::Sell, dec!(0.50), dec!(50), Some(dec!(100)));
        assert!(matches!(sell, PaperOutcome::Filled { price, .. } if price == dec!(0.49)));
    }

    #[test]
    fn test_slippage_clamped_to_max() {
        let sim = PaperSimulator::new(PaperConfig {
            size_impact_factor: dec!(1),
            max_slippage: dec!(0.03),
            ..exact_config()
        });
        let outcome = sim.simulate(Side::Buy, dec!(1), dec!(100), Some(dec!(10)));
        assert!(matches!(outcome, PaperOutcome::Filled { slippage, .. } if slippage == dec!(0.03)));
    }

    #[test]
    fn test_partial_fills_stay_within_bounds() {
        let sim = PaperSimulator::new(PaperConfig {
            partial_fill_probability: 1.0,
            partial_fill_min_ratio: 0.5,
            ..exact_config()
        });
        for _ in 0..50 {
            match sim.simulate(Side::Buy, dec!(0.5), dec!(10), None) {
                PaperOutcome::Filled { size, .. } => {
                    assert!(size >= dec!(5) && size <= dec!(10));
                }
                PaperOutcome::NotFilled => panic!("fill probability is 1.0"),
            }
        }
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let config = PaperConfig {
            seed: Some(9),
            ..PaperConfig::default()
        };
        let a = PaperSimulator::new(config.clone());
        let b = PaperSimulator::new(config);
        for _ in 0..10 {
            assert_eq!(
                a.simulate(Side::Buy, dec!(0.5), dec!(10), Some(dec!(40))),
                b.simulate(Side::Buy, dec!(0.5), dec!(10), Some(dec!(40)))
            );
        }
    }
}
