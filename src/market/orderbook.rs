//! Per-market order book reconstructed from snapshots and deltas.

use crate::error::{EngineError, EngineResult};
use crate::exchange::{BookLevel, OrderBookData, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

/// Live price -> size maps for one market.
///
/// Owned by exactly one consumer; there is no cross-market sharing.
#[derive(Debug, Clone)]
pub struct LiveOrderBook {
    token_id: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    updated_at: DateTime<Utc>,
}

impl LiveOrderBook {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Replace both sides with `data`.
    ///
    /// The book is left untouched if any level is malformed.
    pub fn apply_snapshot(&mut self, data: &OrderBookData) -> EngineResult<()> {
        for level in data.bids.iter().chain(data.asks.iter()) {
            self.validate_level(level.price, level.size)?;
        }

        self.bids = collect_side(&data.bids);
        self.asks = collect_side(&data.asks);
        self.updated_at = data.timestamp;
        Ok(())
    }

    /// Set one level. `size == 0` removes the level.
    pub fn apply_delta(&mut self, side: Side, price: Decimal, size: Decimal) -> EngineResult<()> {
        self.validate_level(price, size)?;

        let book_side = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if size.is_zero() {
            book_side.remove(&price);
        } else {
            book_side.insert(price, size);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Materialize sorted levels (bids descending, asks ascending).
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            token_id: self.token_id.clone(),
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(p, s)| BookLevel::new(*p, *s))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(p, s)| BookLevel::new(*p, *s))
                .collect(),
            timestamp: self.updated_at,
        }
    }

    fn validate_level(&self, price: Decimal, size: Decimal) -> EngineResult<()> {
        if price <= Decimal::ZERO || size < Decimal::ZERO {
            return Err(EngineError::MalformedBook {
                token_id: self.token_id.clone(),
                reason: format!("invalid level price={} size={}", price, size),
            });
        }
        Ok(())
    }
}

fn collect_side(levels: &[BookLevel]) -> BTreeMap<Decimal, Decimal> {
    levels
        .iter()
        .filter(|l| !l.size.is_zero())
        .map(|l| (l.price, l.size))
        .collect()
}

/// Frozen, sorted view of an order book.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    pub token_id: String,
    /// Sorted by price descending
    pub bids: Vec<BookLevel>,
    /// Sorted by price ascending
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl BookSnapshot {
    /// Build a sorted snapshot from raw venue data.
    pub fn from_data(data: &OrderBookData) -> EngineResult<Self> {
        let mut book = LiveOrderBook::new(data.token_id.clone());
        book.apply_snapshot(data)?;
        Ok(book.snapshot())
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Average of the touch; falls back to whichever side exists.
    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / dec!(2)),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }

    /// Absolute spread; zero when either side is empty.
    pub fn spread(&self) -> Decimal {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask - bid,
            _ => Decimal::ZERO,
        }
    }

    /// Spread as a percent of midpoint.
    pub fn spread_pct(&self) -> Decimal {
        match self.midpoint() {
            Some(mid) if !mid.is_zero() => self.spread() / mid * dec!(100),
            _ => Decimal::ZERO,
        }
    }

    /// Total size on the top `levels` levels of `side`.
    pub fn depth(&self, side: Side, levels: usize) -> Decimal {
        let book_side = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        book_side.iter().take(levels).map(|l| l.size).sum()
    }

    /// `(bid_volume - ask_volume) / total` over the top `levels` levels, in [-1, 1].
    pub fn imbalance(&self, levels: usize) -> Decimal {
        let bid_vol = self.depth(Side::Buy, levels);
        let ask_vol = self.depth(Side::Sell, levels);
        let total = bid_vol + ask_vol;
        if total.is_zero() {
            Decimal::ZERO
        } else {
            (bid_vol - ask_vol) / total
        }
    }

    /// Size executable by an order on `side` without trading through
    /// `slippage_pct` percent of the top of book.
    ///
    /// A BUY walks the asks, a SELL walks the bids.
    pub fn max_executable_size(&self, side: Side, slippage_pct: Decimal) -> Decimal {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let Some(best) = levels.first().map(|l| l.price) else {
            return Decimal::ZERO;
        };

        let band = slippage_pct / dec!(100);
        let within = |price: Decimal| match side {
            Side::Buy => price <= best * (Decimal::ONE + band),
            Side::Sell => price >= best * (Decimal::ONE - band),
        };

        levels
            .iter()
            .take_while(|l| within(l.price))
            .map(|l| l.size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_data(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> OrderBookData {
        OrderBookData {
            token_id: "T1".to_string(),
            bids: bids.iter().map(|(p, s)| BookLevel::new(*p, *s)).collect(),
            asks: asks.iter().map(|(p, s)| BookLevel::new(*p, *s)).collect(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_sorts_sides() {
        let data = book_data(
            &[(dec!(0.40), dec!(10)), (dec!(0.45), dec!(5)), (dec!(0.42), dec!(7))],
            &[(dec!(0.55), dec!(3)), (dec!(0.50), dec!(8))],
        );
        let snap = BookSnapshot::from_data(&data).unwrap();

        let bid_prices: Vec<_> = snap.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<_> = snap.asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(0.45), dec!(0.42), dec!(0.40)]);
        assert_eq!(ask_prices, vec![dec!(0.50), dec!(0.55)]);
        assert_eq!(snap.midpoint(), Some(dec!(0.475)));
        assert_eq!(snap.spread(), dec!(0.05));
    }

    #[test]
    fn test_snapshot_then_no_deltas_is_unchanged() {
        let data = book_data(
            &[(dec!(0.40), dec!(10)), (dec!(0.39), dec!(20))],
            &[(dec!(0.41), dec!(15))],
        );
        let mut book = LiveOrderBook::new("T1");
        book.apply_snapshot(&data).unwrap();
        let before = book.snapshot();

        let deltas: Vec<(Side, Decimal, Decimal)> = Vec::new();
        for (side, price, size) in deltas {
            book.apply_delta(side, price, size).unwrap();
        }

        assert_eq!(book.snapshot(), before);
        assert_eq!(before, BookSnapshot::from_data(&data).unwrap());
    }

    #[test]
    fn test_zero_size_delta_removes_level() {
        let mut book = LiveOrderBook::new("T1");
        book.apply_snapshot(&book_data(
            &[(dec!(0.40), dec!(10)), (dec!(0.39), dec!(20))],
            &[(dec!(0.41), dec!(15))],
        ))
        .unwrap();

        book.apply_delta(Side::Buy, dec!(0.40), Decimal::ZERO).unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.39)));

        book.apply_delta(Side::Sell, dec!(0.41), Decimal::ZERO).unwrap();
        assert_eq!(book.best_ask(), None);

        // Removing a missing level is a no-op
        book.apply_delta(Side::Sell, dec!(0.70), Decimal::ZERO).unwrap();
        assert!(book.snapshot().asks.is_empty());
    }

    #[test]
    fn test_delta_upserts_level() {
        let mut book = LiveOrderBook::new("T1");
        book.apply_delta(Side::Buy, dec!(0.30), dec!(5)).unwrap();
        book.apply_delta(Side::Buy, dec!(0.30), dec!(9)).unwrap();
        assert_eq!(book.snapshot().bids, vec![BookLevel::new(dec!(0.30), dec!(9))]);
    }

    #[test]
    fn test_malformed_snapshot_leaves_book_intact() {
        let mut book = LiveOrderBook::new("T1");
        book.apply_snapshot(&book_data(&[(dec!(0.40), dec!(10))], &[])).unwrap();

        let bad = book_data(&[(dec!(0.41), dec!(-1))], &[]);
        assert!(matches!(
            book.apply_snapshot(&bad),
            Err(EngineError::MalformedBook { .. })
        ));
        assert_eq!(book.best_bid(), Some(dec!(0.40)));
    }

    #[test]
    fn test_one_sided_midpoint() {
        let snap = BookSnapshot::from_data(&book_data(&[], &[(dec!(0.60), dec!(1))])).unwrap();
        assert_eq!(snap.midpoint(), Some(dec!(0.60)));
        assert_eq!(snap.spread(), Decimal::ZERO);
        assert_eq!(snap.best_bid(), None);
    }

    #[test]
    fn test_max_executable_size_walks_band() {
        let snap = BookSnapshot::from_data(&book_data(
            &[(dec!(0.50), dec!(10)), (dec!(0.496), dec!(20)), (dec!(0.40), dec!(100))],
            &[(dec!(0.50), dec!(10)), (dec!(0.505), dec!(20)), (dec!(0.60), dec!(100))],
        ))
        .unwrap();

        // 1% band: asks up to 0.505, bids down to 0.495
        assert_eq!(snap.max_executable_size(Side::Buy, dec!(1)), dec!(30));
        assert_eq!(snap.max_executable_size(Side::Sell, dec!(1)), dec!(30));
        assert_eq!(snap.max_executable_size(Side::Buy, dec!(0)), dec!(10));
    }

    #[test]
    fn test_imbalance_top_levels() {
        let snap = BookSnapshot::from_data(&book_data(
            &[(dec!(0.50), dec!(30))],
            &[(dec!(0.51), dec!(10))],
        ))
        .unwrap();
        assert_eq!(snap.imbalance(5), dec!(0.5));
    }
}
