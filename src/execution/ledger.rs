//! FIFO position ledger.
//!
//! Buys append lots; sells consume the oldest lots first. A partially
//! consumed lot keeps its price with a reduced size.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lot {
    pub price: Decimal,
    pub size: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Result of booking a sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SellOutcome {
    pub realized_pnl: Decimal,
    pub matched_size: Decimal,
    /// Sell size with no open lot to match (ignored)
    pub unmatched_size: Decimal,
}

/// Open lots for one strategy in one market.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPosition {
    pub strategy: String,
    pub token_id: String,
    pub size: Decimal,
    pub average_price: Decimal,
    pub lots: Vec<Lot>,
}

type PositionKey = (String, String);

#[derive(Debug, Default)]
pub struct PositionLedger {
    lots: HashMap<PositionKey, VecDeque<Lot>>,
    realized: HashMap<PositionKey, Decimal>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(strategy: &str, token_id: &str) -> PositionKey {
        (strategy.to_string(), token_id.to_string())
    }

    pub fn record_buy(&mut self, strategy: &str, token_id: &str, price: Decimal, size: Decimal) {
        if size <= Decimal::ZERO {
            return;
        }
        self.lots
            .entry(Self::key(strategy, token_id))
            .or_default()
            .push_back(Lot {
                price,
                size,
                opened_at: Utc::now(),
            });
    }

    /// Match `size` against open lots oldest-first and book the PnL.
    pub fn record_sell(
        &mut self,
        strategy: &str,
        token_id: &str,
        price: Decimal,
        size: Decimal,
    ) -> SellOutcome {
        let key = Self::key(strategy, token_id);
        let mut remaining = size.max(Decimal::ZERO);
        let mut realized = Decimal::ZERO;

        if let Some(lots) = self.lots.get_mut(&key) {
            while remaining > Decimal::ZERO {
                let Some(lot) = lots.front_mut() else {
                    break;
                };
                let matched = remaining.min(lot.size);
                realized += (price - lot.price) * matched;
                lot.size -= matched;
                remaining -= matched;
                if lot.size.is_zero() {
                    lots.pop_front();
                }
            }
            if lots.is_empty() {
                self.lots.remove(&key);
            }
        }

        if remaining > Decimal::ZERO {
            warn!(%strategy, %token_id, unmatched = %remaining, "Sell exceeds open lots");
        }

        *self.realized.entry(key).or_default() += realized;
        SellOutcome {
            realized_pnl: realized,
            matched_size: size.max(Decimal::ZERO) - remaining,
            unmatched_size: remaining,
        }
    }

    pub fn open_size(&self, strategy: &str, token_id: &str) -> Decimal {
        self.lots
            .get(&Self::key(strategy, token_id))
            .map(|lots| lots.iter().map(|l| l.size).sum())
            .unwrap_or_default()
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        let mut positions: Vec<OpenPosition> = self
            .lots
            .iter()
            .map(|((strategy, token_id), lots)| {
                let size: Decimal = lots.iter().map(|l| l.size).sum();
                let cost: Decimal = lots.iter().map(|l| l.price * l.size).sum();
                OpenPosition {
                    strategy: strategy.clone(),
                    token_id: token_id.clone(),
                    size,
                    average_price: if size.is_zero() { Decimal::ZERO } else { cost / size },
                    lots: lots.iter().cloned().collect(),
                }
            })
            .collect();
        positions.sort_by(|a, b| (&a.strategy, &a.token_id).cmp(&(&b.strategy, &b.token_id)));
        positions
    }

    /// Realized PnL for `token_id` across strategies.
    pub fn realized_pnl(&self, token_id: &str) -> Decimal {
        self.realized
            .iter()
            .filter(|((_, token), _)| token == token_id)
            .map(|(_, pnl)| *pnl)
            .sum()
    }

    pub fn realized_pnl_for_strategy(&self, strategy: &str) -> Decimal {
        self.realized
            .iter()
            .filter(|((s, _), _)| s == strategy)
            .map(|(_, pnl)| *pnl)
            .sum()
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.realized.values().copied().sum()
    }

    /// Mark open lots to `prices`; tokens without a price are skipped.
    pub fn unrealized_pnl(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.lots
            .iter()
            .filter_map(|((_, token_id), lots)| {
                prices.get(token_id).map(|mark| {
                    lots.iter()
                        .map(|l| (*mark - l.price) * l.size)
                        .sum::<Decimal>()
                })
            })
            .sum()
    }
}
