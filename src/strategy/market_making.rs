//! Continuous multi-market quoting.
//!
//! Every tick refreshes the books of all subscribed markets concurrently and
//! reconciles each market's bid and ask. Quotes are only cancelled and
//! replaced when the new target drifts past the reprice threshold. A second
//! phase runs the shared exit rules over any inventory the quotes built up.
//!
//! A cancelled quote or exit stays tracked until the engine reports it
//! settled, so fills that land after a cancel still reach the inventory.

use super::exit::{self, ExitReason, ExitRules, PositionMarks};
use super::{
    PendingExit, PerformanceStats, Settlement, Strategy, StrategyContext, StrategyKind, StrategyState,
    StrategyStatus,
};
use crate::audit::{self, AuditEvent};
use crate::config::MarketMakingConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::{MarketDiscovery, MarketScorer, OrderBookData, OrderKind, Side};
use crate::execution::{OrderId, OrderRequest};
use crate::market::{BookSnapshot, LiveOrderBook};
use crate::risk::PolicyAction;
use crate::utils::decimal::{relative_deviation, round_to_tick, safe_div, weighted_average};
use async_trait::async_trait;
use futures_util::future::join_all;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const KIND: StrategyKind = StrategyKind::MarketMaking;
const IMBALANCE_LEVELS: usize = 5;
const PRICE_TICK: Decimal = dec!(0.0001);

/// Inputs to the quote formula for one market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteInputs {
    pub mid: Decimal,
    /// Top-of-book volume imbalance in [-1, 1]
    pub imbalance: Decimal,
    pub volatility_score: Decimal,
    /// Current inventory valued at mid
    pub position_notional: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quotes {
    pub bid: Decimal,
    pub ask: Decimal,
    /// Dynamic spread as a fraction of mid
    pub spread: Decimal,
}

/// Bid/ask targets for one market.
///
/// `spread = clamp(max(base, min) * (1 + score * (multiplier - 1)), min, max)`.
/// Quotes are shifted down by inventory (discouraging more buying) and
/// towards the heavier side of the book, rounded to the price tick and
/// clamped to the valid price range.
pub fn compute_quotes(config: &MarketMakingConfig, inputs: &QuoteInputs) -> Quotes {
    let mid = inputs.mid;
    let vol_factor = Decimal::ONE + inputs.volatility_score * (config.volatility_multiplier - Decimal::ONE);
    let spread = (config.base_spread.max(config.min_spread) * vol_factor)
        .max(config.min_spread)
        .min(config.max_spread);

    let inventory_ratio = safe_div(inputs.position_notional, config.max_exposure);
    let inventory_shift = -(inventory_ratio * config.inventory_skew_max) * mid;
    let imbalance_shift = inputs.imbalance * config.imbalance_factor;
    let half = spread / dec!(2);

    let bid = mid * (Decimal::ONE - half + imbalance_shift) + inventory_shift;
    let ask = mid * (Decimal::ONE + half + imbalance_shift) + inventory_shift;

    Quotes {
        bid: round_to_tick(bid, PRICE_TICK).max(config.min_price).min(config.max_price),
        ask: round_to_tick(ask, PRICE_TICK).max(config.min_price).min(config.max_price),
        spread,
    }
}

/// `true` when `desired` deviates from `current` by more than `threshold`
/// (a fraction), or there is no usable current price.
pub fn needs_reprice(current: Decimal, desired: Decimal, threshold: Decimal) -> bool {
    if current <= Decimal::ZERO {
        return true;
    }
    relative_deviation(desired, current) > threshold
}

/// Streaming order book input.
#[derive(Debug, Clone)]
pub enum BookEvent {
    Snapshot(OrderBookData),
    Delta {
        token_id: String,
        side: Side,
        price: Decimal,
        size: Decimal,
    },
}

/// Quote and inventory tracking for one market.
#[derive(Debug, Clone)]
pub struct MarketState {
    pub token_id: String,
    pub bid_order: Option<OrderId>,
    pub bid_price: Decimal,
    bid_applied: Decimal,
    pub ask_order: Option<OrderId>,
    pub ask_price: Decimal,
    ask_applied: Decimal,
    pub position: Decimal,
    /// Weighted-average entry
    pub entry_price: Decimal,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    pub entered_at: Option<Instant>,
    pub realized_pnl: Decimal,
    pub trade_count: u64,
    pub volatility_score: Decimal,
    pub current_spread: Decimal,
    pub last_update: Option<Instant>,
    pub pending_exit: Option<PendingExit>,
}

impl MarketState {
    fn new(token_id: &str) -> Self {
        Self {
            token_id: token_id.to_string(),
            bid_order: None,
            bid_price: Decimal::ZERO,
            bid_applied: Decimal::ZERO,
            ask_order: None,
            ask_price: Decimal::ZERO,
            ask_applied: Decimal::ZERO,
            position: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            highest_price: Decimal::ZERO,
            lowest_price: Decimal::ZERO,
            entered_at: None,
            realized_pnl: Decimal::ZERO,
            trade_count: 0,
            volatility_score: Decimal::ZERO,
            current_spread: Decimal::ZERO,
            last_update: None,
            pending_exit: None,
        }
    }

    /// Fold a fill into the inventory. Buys move the weighted-average entry;
    /// sells keep it and reset every tracking field once flat.
    pub fn apply_fill(&mut self, side: Side, price: Decimal, size: Decimal, realized: Decimal) {
        match side {
            Side::Buy => {
                if self.position <= Decimal::ZERO {
                    self.position = Decimal::ZERO;
                    self.highest_price = price;
                    self.lowest_price = price;
                    self.entered_at = Some(Instant::now());
                }
                self.entry_price = weighted_average(&[(self.entry_price, self.position), (price, size)]);
                self.position += size;
            }
            Side::Sell => {
                self.position -= size;
                self.realized_pnl += realized;
                self.trade_count += 1;
                if self.position <= Decimal::ZERO {
                    self.reset_position();
                }
            }
        }
    }

    fn reset_position(&mut self) {
        self.position = Decimal::ZERO;
        self.entry_price = Decimal::ZERO;
        self.highest_price = Decimal::ZERO;
        self.lowest_price = Decimal::ZERO;
        self.entered_at = None;
    }

    fn quote(&self, side: Side) -> (Option<&OrderId>, Decimal) {
        match side {
            Side::Buy => (self.bid_order.as_ref(), self.bid_price),
            Side::Sell => (self.ask_order.as_ref(), self.ask_price),
        }
    }

    fn set_quote(&mut self, side: Side, order: Option<OrderId>, price: Decimal) {
        match side {
            Side::Buy => {
                self.bid_order = order;
                self.bid_price = price;
                self.bid_applied = Decimal::ZERO;
            }
            Side::Sell => {
                self.ask_order = order;
                self.ask_price = price;
                self.ask_applied = Decimal::ZERO;
            }
        }
    }

    fn applied_mut(&mut self, side: Side) -> &mut Decimal {
        match side {
            Side::Buy => &mut self.bid_applied,
            Side::Sell => &mut self.ask_applied,
        }
    }
}

struct Inner {
    ctx: StrategyContext,
    config: MarketMakingConfig,
    rules: ExitRules,
    discovery: Arc<dyn MarketDiscovery>,
    scorer: Option<Arc<dyn MarketScorer>>,
    status: Mutex<StrategyStatus>,
    performance: Mutex<PerformanceStats>,
    books: Mutex<HashMap<String, LiveOrderBook>>,
    markets: Mutex<HashMap<String, MarketState>>,
    last_discovery: Mutex<Option<Instant>>,
}

/// Strategy B: quotes both sides of many markets at once.
pub struct MarketMakingStrategy {
    inner: Arc<Inner>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MarketMakingStrategy {
    pub fn new(
        ctx: StrategyContext,
        discovery: Arc<dyn MarketDiscovery>,
        scorer: Option<Arc<dyn MarketScorer>>,
    ) -> Self {
        let config = ctx.config.market_making.clone();
        let rules = ExitRules::from(&config.exits);
        Self {
            inner: Arc::new(Inner {
                ctx,
                config,
                rules,
                discovery,
                scorer,
                status: Mutex::new(StrategyStatus::new(KIND)),
                performance: Mutex::new(PerformanceStats::default()),
                books: Mutex::new(HashMap::new()),
                markets: Mutex::new(HashMap::new()),
                last_discovery: Mutex::new(None),
            }),
        }
    }

    /// Apply a streamed snapshot or delta to a subscribed market's book.
    /// Events for markets that are not subscribed are ignored.
    pub fn on_book_event(&self, event: BookEvent) -> EngineResult<()> {
        let mut books = guard(&self.inner.books);
        let result = match &event {
            BookEvent::Snapshot(data) => match books.get_mut(&data.token_id) {
                Some(book) => book.apply_snapshot(data),
                None => return Ok(()),
            },
            BookEvent::Delta {
                token_id,
                side,
                price,
                size,
            } => match books.get_mut(token_id) {
                Some(book) => book.apply_delta(*side, *price, *size),
                None => return Ok(()),
            },
        };
        if let Err(e) = &result {
            warn!(error = %e, "Rejected book event");
        }
        result
    }

    pub fn market_count(&self) -> usize {
        guard(&self.inner.markets).len()
    }

    pub fn market_state(&self, token_id: &str) -> Option<MarketState> {
        guard(&self.inner.markets).get(token_id).cloned()
    }

    pub fn book(&self, token_id: &str) -> Option<BookSnapshot> {
        guard(&self.inner.books).get(token_id).map(|b| b.snapshot())
    }

    pub fn active_quote_count(&self) -> usize {
        guard(&self.inner.markets)
            .values()
            .map(|m| m.bid_order.is_some() as usize + m.ask_order.is_some() as usize)
            .sum()
    }

    /// Inventory across markets valued at entry.
    pub fn current_exposure(&self) -> Decimal {
        guard(&self.inner.markets)
            .values()
            .map(|m| m.position * m.entry_price)
            .sum()
    }
}

impl Inner {
    fn state(&self) -> StrategyState {
        guard(&self.status).state
    }

    fn set_state(&self, state: StrategyState, action: &str) {
        let mut status = guard(&self.status);
        status.state = state;
        status.last_action = Some(action.to_string());
        if state != StrategyState::Error {
            status.error_message = None;
        }
    }

    fn set_last_action(&self, action: String) {
        guard(&self.status).last_action = Some(action);
    }

    fn locked_capital(&self) -> Decimal {
        guard(&self.status).locked_capital
    }

    fn event(&self, event: &str, detail: serde_json::Value) {
        audit::log(
            self.ctx.audit.as_ref(),
            AuditEvent::StrategyEvent {
                strategy: KIND.name().to_string(),
                event: event.to_string(),
                detail,
            },
        );
    }

    fn discovery_interval(&self) -> Duration {
        let secs = match self.scorer {
            Some(_) => self
                .config
                .discovery_interval_secs
                .min(self.config.scored_discovery_interval_secs),
            None => self.config.discovery_interval_secs,
        };
        Duration::from_secs(secs)
    }

    async fn discover_if_due(&self) {
        let due = guard(&self.last_discovery).map_or(true, |at| at.elapsed() >= self.discovery_interval());
        if !due {
            return;
        }

        let max_markets = self.config.max_markets;
        let mut targets = self
            .scorer
            .as_ref()
            .map(|s| s.top_markets(max_markets))
            .unwrap_or_default();
        if targets.is_empty() {
            match self.discovery.discover(max_markets).await {
                Ok(tokens) => targets = tokens,
                Err(e) => {
                    warn!(error = %e, "Market discovery failed");
                    audit::log(
                        self.ctx.audit.as_ref(),
                        AuditEvent::Error {
                            context: "MARKET_MAKING_DISCOVERY".to_string(),
                            message: e.to_string(),
                        },
                    );
                    return;
                }
            }
        }

        let mut added = Vec::new();
        {
            let mut markets = guard(&self.markets);
            let mut books = guard(&self.books);
            for token_id in targets {
                if markets.len() >= max_markets {
                    break;
                }
                if markets.contains_key(&token_id) {
                    continue;
                }
                books.insert(token_id.clone(), LiveOrderBook::new(token_id.clone()));
                markets.insert(token_id.clone(), MarketState::new(&token_id));
                added.push(token_id);
            }
        }

        for token_id in &added {
            debug!(%token_id, "Market subscribed");
            self.event("MARKET_SUBSCRIBED", json!({ "token_id": token_id }));
        }
        *guard(&self.last_discovery) = Some(Instant::now());
        self.event(
            "DISCOVERY_COMPLETE",
            json!({ "markets_active": guard(&self.markets).len(), "new_subscriptions": added.len() }),
        );
    }

    async fn reconcile_all(&self) {
        let tokens: Vec<String> = guard(&self.markets).keys().cloned().collect();
        let results = join_all(tokens.iter().map(|t| self.reconcile_market(t))).await;

        for (token_id, result) in tokens.iter().zip(results) {
            if let Err(e) = result {
                warn!(%token_id, error = %e, "Market reconciliation failed");
                audit::log(
                    self.ctx.audit.as_ref(),
                    AuditEvent::Error {
                        context: "MARKET_MAKING_RECONCILE".to_string(),
                        message: format!("{}: {}", token_id, e),
                    },
                );
            }
        }
    }

    async fn reconcile_market(&self, token_id: &str) -> EngineResult<()> {
        let fetched = self.ctx.books.get_orderbook(token_id).await?;

        let snapshot = {
            let mut books = guard(&self.books);
            let Some(book) = books.get_mut(token_id) else {
                return Ok(());
            };
            if let Some(data) = &fetched {
                book.apply_snapshot(data)?;
            }
            book.snapshot()
        };
        let Some(mid) = snapshot.midpoint().filter(|m| *m > Decimal::ZERO) else {
            return Ok(());
        };

        self.ctx.volatility.update_price(token_id, mid);
        let score = self.ctx.volatility.score(token_id);
        self.sync_fills(token_id);

        let position = match guard(&self.markets).get(token_id) {
            Some(state) => state.position,
            None => return Ok(()),
        };
        let quotes = compute_quotes(
            &self.config,
            &QuoteInputs {
                mid,
                imbalance: snapshot.imbalance(IMBALANCE_LEVELS),
                volatility_score: score,
                position_notional: position * mid,
            },
        );

        self.reconcile_side(token_id, Side::Buy, quotes.bid, &snapshot, mid)?;
        self.reconcile_side(token_id, Side::Sell, quotes.ask, &snapshot, mid)?;

        if let Some(state) = guard(&self.markets).get_mut(token_id) {
            state.volatility_score = score;
            state.current_spread = quotes.spread;
            state.last_update = Some(Instant::now());
        }
        Ok(())
    }

    /// Fold newly observed fills of the tracked quotes into the inventory and
    /// drop quotes that are finished.
    fn sync_fills(&self, token_id: &str) {
        for side in [Side::Buy, Side::Sell] {
            let order_id = match guard(&self.markets).get(token_id) {
                Some(state) => state.quote(side).0.cloned(),
                None => return,
            };
            let Some(order) = order_id.and_then(|id| self.ctx.engine.order(&id)) else {
                continue;
            };

            let mut markets = guard(&self.markets);
            let Some(state) = markets.get_mut(token_id) else {
                return;
            };
            let applied = *state.applied_mut(side);
            let delta = order.filled_size - applied;
            if delta > Decimal::ZERO {
                let price = order.fill_price.unwrap_or(order.price);
                state.apply_fill(side, price, delta, order.realized_pnl);
                *state.applied_mut(side) = order.filled_size;
                if side == Side::Sell {
                    guard(&self.performance).record_trade(order.realized_pnl);
                }
                debug!(%token_id, %side, %price, size = %delta, position = %state.position, "Quote filled");
            }

            if order.is_settled() {
                state.set_quote(side, None, Decimal::ZERO);
            }
        }
    }

    fn reconcile_side(
        &self,
        token_id: &str,
        side: Side,
        desired: Decimal,
        book: &BookSnapshot,
        mid: Decimal,
    ) -> EngineResult<()> {
        let (current_order, current_price) = match guard(&self.markets).get(token_id) {
            Some(state) => {
                let (order, price) = state.quote(side);
                (order.cloned(), price)
            }
            None => return Ok(()),
        };

        if let Some(order_id) = &current_order {
            if !needs_reprice(current_price, desired, self.config.reprice_threshold) {
                return Ok(());
            }
            debug!(%token_id, %side, from = %current_price, to = %desired, "Repricing quote");
            self.ctx.engine.cancel(order_id);
            self.sync_fills(token_id);
        }

        // A cancelled quote that is still executing is replaced once it settles
        let position = match guard(&self.markets).get(token_id) {
            Some(state) if state.quote(side).0.is_none() => state.position,
            _ => return Ok(()),
        };

        let size = self.quote_size(side, desired, book, position, mid);
        let notional = size * desired;
        if notional < self.config.min_notional {
            return Ok(());
        }
        if !self.ctx.place_order_allowed(KIND, token_id, notional) {
            return Ok(());
        }

        let request = OrderRequest::new(token_id, side, OrderKind::Gtc, desired, size)
            .with_depth(book.depth(side.opposite(), IMBALANCE_LEVELS));
        let Some(order_id) = self.ctx.engine.submit(KIND.name(), request) else {
            return Err(EngineError::InvalidOrder(format!(
                "{} quote for {} refused by execution engine",
                side, token_id
            )));
        };

        if let Some(state) = guard(&self.markets).get_mut(token_id) {
            state.set_quote(side, Some(order_id), desired);
        }
        self.set_last_action(format!("QUOTE: {} @{}", side, desired));
        Ok(())
    }

    /// Shares per quote: a slice of locked capital, capped by book liquidity.
    /// Asks never exceed inventory; bids never push inventory past the
    /// locked capital.
    fn quote_size(&self, side: Side, price: Decimal, book: &BookSnapshot, position: Decimal, mid: Decimal) -> Decimal {
        let locked = self.locked_capital();
        let budget = locked * self.config.trade_size_pct / dec!(100);
        let liquidity = book.max_executable_size(side, self.config.quote_slippage_pct);
        let mut shares = safe_div(budget, price).min(liquidity);

        match side {
            Side::Buy => {
                let room = (locked - position * mid).max(Decimal::ZERO);
                shares = shares.min(safe_div(room, price));
            }
            Side::Sell => shares = shares.min(position),
        }
        shares.round_dp_with_strategy(2, RoundingStrategy::ToZero)
    }

    async fn manage_exits(&self) {
        let tracked: Vec<String> = guard(&self.markets)
            .values()
            .filter(|m| m.pending_exit.is_some())
            .map(|m| m.token_id.clone())
            .collect();
        for token_id in &tracked {
            self.settle_exit(token_id);
        }

        let held: Vec<String> = guard(&self.markets)
            .values()
            .filter(|m| m.position > Decimal::ZERO && m.pending_exit.is_none())
            .map(|m| m.token_id.clone())
            .collect();
        if held.is_empty() {
            return;
        }

        let exits: Vec<(String, ExitReason, Decimal)> = {
            let books = guard(&self.books);
            let mut markets = guard(&self.markets);
            held.iter()
                .filter_map(|token_id| {
                    let bid = books.get(token_id)?.best_bid()?;
                    let state = markets.get_mut(token_id)?;
                    state.highest_price = state.highest_price.max(bid);
                    state.lowest_price = state.lowest_price.min(bid);
                    let marks = PositionMarks {
                        entry_price: state.entry_price,
                        highest_price: state.highest_price,
                        current_price: bid,
                        held: state.entered_at.map(|t| t.elapsed()).unwrap_or_default(),
                    };
                    let score = self.ctx.volatility.score(token_id);
                    exit::evaluate(&self.rules, &marks, score).map(|r| (token_id.clone(), r, bid))
                })
                .collect()
        };

        join_all(
            exits
                .iter()
                .map(|(token_id, reason, bid)| self.exit_market(token_id, reason, *bid)),
        )
        .await;
    }

    async fn exit_market(&self, token_id: &str, reason: &ExitReason, bid: Decimal) {
        let depth = guard(&self.books)
            .get(token_id)
            .map(|b| b.snapshot().depth(Side::Buy, IMBALANCE_LEVELS));

        // Fold quote fills in before pulling the quotes
        self.sync_fills(token_id);
        let quotes = match guard(&self.markets).get(token_id) {
            Some(state) => [state.bid_order.clone(), state.ask_order.clone()],
            None => return,
        };
        for order_id in quotes.iter().flatten() {
            self.ctx.engine.cancel(order_id);
        }
        self.sync_fills(token_id);

        let (position, quoting) = match guard(&self.markets).get(token_id) {
            Some(state) => (
                state.position,
                state.bid_order.is_some() || state.ask_order.is_some(),
            ),
            None => return,
        };
        if quoting {
            debug!(%token_id, "Exit deferred until cancelled quotes settle");
            return;
        }

        let size = self.ctx.engine.open_size(KIND.name(), token_id);
        if size != position {
            warn!(%token_id, tracked = %position, ledger = %size, "Inventory differs from ledger, using ledger");
            if let Some(state) = guard(&self.markets).get_mut(token_id) {
                state.position = size;
                if size <= Decimal::ZERO {
                    state.reset_position();
                }
            }
        }
        if size <= Decimal::ZERO {
            return;
        }

        if !self.ctx.place_order_allowed(KIND, token_id, size * bid) {
            return;
        }
        let mut request = OrderRequest::new(token_id, Side::Sell, OrderKind::Market, bid, size);
        if let Some(depth) = depth {
            request = request.with_depth(depth);
        }
        let Some(order_id) = self.ctx.engine.submit(KIND.name(), request) else {
            warn!(%token_id, "Exit order refused by execution engine");
            return;
        };
        if let Some(state) = guard(&self.markets).get_mut(token_id) {
            state.pending_exit = Some(PendingExit {
                order_id: order_id.clone(),
                reason: reason.clone(),
            });
        }

        let wait = Duration::from_millis(self.config.order_wait_timeout_ms);
        self.ctx.engine.wait_for(&order_id, wait).await;
        self.settle_exit(token_id);
    }

    /// Fold a finished exit order into the market's inventory. `false` while
    /// the order may still fill.
    fn settle_exit(&self, token_id: &str) -> bool {
        let pending = match guard(&self.markets).get(token_id) {
            Some(state) => state.pending_exit.clone(),
            None => return true,
        };
        let Some(pending) = pending else {
            return true;
        };

        let order = match self.ctx.settle_order(&pending.order_id) {
            Settlement::Done(order) => order,
            Settlement::InFlight => {
                debug!(%token_id, order_id = %pending.order_id, "Exit order still executing");
                return false;
            }
            Settlement::Unknown => {
                if let Some(state) = guard(&self.markets).get_mut(token_id) {
                    state.pending_exit = None;
                }
                return true;
            }
        };

        let pnl = order.realized_pnl;
        let remaining = {
            let mut markets = guard(&self.markets);
            match markets.get_mut(token_id) {
                Some(state) => {
                    state.pending_exit = None;
                    if order.is_filled() {
                        let price = order.fill_price.unwrap_or(order.price);
                        state.apply_fill(Side::Sell, price, order.filled_size, pnl);
                    }
                    state.position
                }
                None => Decimal::ZERO,
            }
        };

        let reason = &pending.reason;
        if !order.is_filled() {
            warn!(%token_id, order_id = %order.id, reason = %reason, "Exit order not filled, will retry");
            return true;
        }
        guard(&self.performance).record_trade(pnl);

        info!(%token_id, reason = %reason, %pnl, %remaining, "Market-making position exited");
        self.event(
            "POSITION_CLOSED",
            json!({
                "token_id": token_id,
                "reason": reason.to_string(),
                "exit_price": order.fill_price,
                "size": order.filled_size,
                "pnl": pnl.round_dp(4),
            }),
        );
        self.set_last_action(format!("EXIT: {}", reason.code()));
        true
    }

    fn clear(&self) {
        guard(&self.markets).clear();
        guard(&self.books).clear();
        *guard(&self.last_discovery) = None;
    }
}

#[async_trait]
impl Strategy for MarketMakingStrategy {
    fn kind(&self) -> StrategyKind {
        KIND
    }

    async fn activate(&self) -> bool {
        let inner = &self.inner;
        if !inner.config.enabled {
            return false;
        }
        if !matches!(inner.state(), StrategyState::Inactive | StrategyState::Error) {
            return false;
        }
        inner.set_state(StrategyState::Activating, "ACTIVATING");

        let ceiling = inner.config.max_exposure;
        if let Err(reason) = inner.ctx.lock_ceiling(KIND, ceiling) {
            warn!(strategy = %KIND, %reason, "Activation refused");
            {
                let mut status = guard(&inner.status);
                status.state = StrategyState::Error;
                status.error_message = Some(reason.clone());
            }
            inner.event("ACTIVATION_FAILED", json!({ "reason": reason }));
            return false;
        }
        guard(&inner.status).locked_capital = ceiling;

        inner.set_state(StrategyState::Active, "ACTIVE");
        info!(strategy = %KIND, locked = %ceiling, "Strategy activated");
        inner.event("ACTIVATED", json!({ "locked_capital": ceiling }));
        true
    }

    async fn deactivate(&self) {
        let inner = &self.inner;
        if !matches!(inner.state(), StrategyState::Active | StrategyState::Error) {
            return;
        }
        let decision = inner.ctx.policy.validate(&PolicyAction::DeactivateStrategy(KIND));
        if !decision.allowed {
            warn!(strategy = %KIND, reason = %decision.reason, "Deactivation refused");
            return;
        }
        inner.set_state(StrategyState::Deactivating, "DEACTIVATING");

        let cancelled = inner.ctx.engine.cancel_for_strategy(KIND.name());
        let released = inner.ctx.release_ceiling(KIND);
        guard(&inner.status).locked_capital = Decimal::ZERO;
        inner.clear();

        inner.set_state(StrategyState::Inactive, "DEACTIVATED");
        info!(strategy = %KIND, %released, cancelled, "Strategy deactivated");
        inner.event("DEACTIVATED", json!({ "released": released, "cancelled_orders": cancelled }));
    }

    async fn process_tick(&self) -> EngineResult<()> {
        let inner = &self.inner;
        if inner.state() != StrategyState::Active {
            return Ok(());
        }
        inner.discover_if_due().await;
        inner.reconcile_all().await;
        inner.manage_exits().await;
        Ok(())
    }

    fn abort(&self) {
        let inner = &self.inner;
        let cancelled = inner.ctx.engine.cancel_for_strategy(KIND.name());
        let released = inner.ctx.capital.release_all(KIND.pool());
        guard(&inner.status).locked_capital = Decimal::ZERO;
        inner.clear();
        inner.set_state(StrategyState::Inactive, "ABORTED");
        warn!(strategy = %KIND, %released, cancelled, "Strategy aborted");
        inner.event("ABORTED", json!({ "released": released, "cancelled_orders": cancelled }));
    }

    fn status(&self) -> StrategyStatus {
        let mut status = guard(&self.inner.status).clone();
        status.position_count = guard(&self.inner.markets)
            .values()
            .filter(|m| m.position > Decimal::ZERO)
            .count();
        status
    }

    fn performance(&self) -> PerformanceStats {
        guard(&self.inner.performance).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ExecutionConfig};
    use crate::exchange::{OrderBookSource, StaticBookSource};
    use crate::execution::OrderStatus;
    use crate::risk::{CapitalPool, KillTrigger};
    use crate::strategy::test_support::{exact_execution, harness_with, Harness};

    // ===== Test Helpers =====

    fn mm_config() -> MarketMakingConfig {
        MarketMakingConfig::default()
    }

    fn inputs(mid: Decimal) -> QuoteInputs {
        QuoteInputs {
            mid,
            imbalance: Decimal::ZERO,
            volatility_score: Decimal::ZERO,
            position_notional: Decimal::ZERO,
        }
    }

    fn setup_with(config: Config, execution: Option<ExecutionConfig>) -> (MarketMakingStrategy, Harness) {
        let h = harness_with(config, execution);
        let discovery: Arc<dyn MarketDiscovery> = h.books.clone();
        (MarketMakingStrategy::new(h.ctx.clone(), discovery, None), h)
    }

    fn setup() -> (MarketMakingStrategy, Harness) {
        setup_with(Config::default(), None)
    }

    fn slow_execution(latency_ms: u64) -> ExecutionConfig {
        let mut slow = exact_execution();
        slow.paper.latency_min_ms = latency_ms;
        slow.paper.latency_max_ms = latency_ms;
        slow
    }

    async fn set_book(books: &StaticBookSource, token: &str, bid: Decimal, ask: Decimal) {
        books
            .set_book(token, &[(bid, dec!(1000))], &[(ask, dec!(1000))])
            .await;
    }

    // ===== Quote Computation =====

    #[test]
    fn test_quotes_at_base_spread() {
        let quotes = compute_quotes(&mm_config(), &inputs(dec!(0.50)));
        assert_eq!(quotes.spread, dec!(0.02));
        assert_eq!(quotes.bid, dec!(0.495));
        assert_eq!(quotes.ask, dec!(0.505));
    }

    #[test]
    fn test_volatility_widens_spread_within_bounds() {
        let widened = compute_quotes(
            &mm_config(),
            &QuoteInputs {
                volatility_score: dec!(2),
                ..inputs(dec!(0.50))
            },
        );
        // 1 + 2 x (1.5 - 1) = 2x base
        assert_eq!(widened.spread, dec!(0.04));
        assert_eq!(widened.bid, dec!(0.49));
        assert_eq!(widened.ask, dec!(0.51));

        let capped = compute_quotes(
            &mm_config(),
            &QuoteInputs {
                volatility_score: dec!(10),
                ..inputs(dec!(0.50))
            },
        );
        assert_eq!(capped.spread, dec!(0.10));
        assert_eq!(capped.bid, dec!(0.475));
    }

    #[test]
    fn test_inventory_skew_lowers_both_quotes() {
        let quotes = compute_quotes(
            &mm_config(),
            &QuoteInputs {
                position_notional: dec!(100),
                ..inputs(dec!(0.50))
            },
        );
        // 100 / 500 x 0.005 x 0.50 = 0.0005
        assert_eq!(quotes.bid, dec!(0.4945));
        assert_eq!(quotes.ask, dec!(0.5045));
    }

    #[test]
    fn test_imbalance_shifts_towards_heavier_side() {
        let quotes = compute_quotes(
            &mm_config(),
            &QuoteInputs {
                imbalance: dec!(0.5),
                ..inputs(dec!(0.40))
            },
        );
        assert_eq!(quotes.bid, dec!(0.3962));
        assert_eq!(quotes.ask, dec!(0.4042));
    }

    #[test]
    fn test_quotes_clamped_to_price_range() {
        let quotes = compute_quotes(&mm_config(), &inputs(dec!(0.995)));
        assert_eq!(quotes.ask, dec!(0.99));
        let low = compute_quotes(&mm_config(), &inputs(dec!(0.01)));
        assert_eq!(low.bid, dec!(0.01));
    }

    #[test]
    fn test_reprice_threshold() {
        let threshold = dec!(0.005);
        assert!(!needs_reprice(dec!(0.50), dec!(0.502), threshold));
        assert!(!needs_reprice(dec!(0.50), dec!(0.5025), threshold));
        assert!(needs_reprice(dec!(0.50), dec!(0.503), threshold));
        assert!(needs_reprice(dec!(0.50), dec!(0.497), threshold));
        assert!(needs_reprice(Decimal::ZERO, dec!(0.50), threshold));
    }

    #[test]
    fn test_fills_update_weighted_entry_and_reset_when_flat() {
        let mut state = MarketState::new("T1");
        state.apply_fill(Side::Buy, dec!(0.40), dec!(10), Decimal::ZERO);
        state.apply_fill(Side::Buy, dec!(0.50), dec!(10), Decimal::ZERO);
        assert_eq!(state.position, dec!(20));
        assert_eq!(state.entry_price, dec!(0.45));
        assert_eq!(state.highest_price, dec!(0.40));

        state.apply_fill(Side::Sell, dec!(0.55), dec!(5), dec!(0.75));
        assert_eq!(state.position, dec!(15));
        assert_eq!(state.entry_price, dec!(0.45));

        state.apply_fill(Side::Sell, dec!(0.55), dec!(15), dec!(1.25));
        assert_eq!(state.position, Decimal::ZERO);
        assert_eq!(state.entry_price, Decimal::ZERO);
        assert!(state.entered_at.is_none());
        assert_eq!(state.realized_pnl, dec!(2.00));
        assert_eq!(state.trade_count, 2);
    }

    // ===== Strategy =====

    #[tokio::test]
    async fn test_activation_locks_max_exposure() {
        let (strategy, h) = setup();
        assert!(strategy.activate().await);
        assert_eq!(h.ctx.capital.locked(CapitalPool::B), dec!(500));

        strategy.abort();
        assert_eq!(h.ctx.capital.locked(CapitalPool::B), Decimal::ZERO);
        assert_eq!(strategy.status().state, StrategyState::Inactive);
    }

    #[tokio::test]
    async fn test_deactivation_refused_while_kill_switch_armed() {
        let (strategy, h) = setup();
        strategy.activate().await;
        h.kill_switch.trigger(KillTrigger::OperatorManual, "test");

        strategy.deactivate().await;
        assert_eq!(strategy.status().state, StrategyState::Active);
        assert!(h.sink.count(|e| matches!(e, AuditEvent::PolicyViolation { action, .. } if action.contains("DEACTIVATE"))) >= 1);
    }

    #[tokio::test]
    async fn test_tick_discovers_and_quotes_markets() {
        let mut config = Config::default();
        config.market_making.max_markets = 2;
        let (strategy, h) = setup_with(config, None);
        for token in ["T1", "T2", "T3"] {
            set_book(&h.books, token, dec!(0.49), dec!(0.51)).await;
        }
        strategy.activate().await;

        strategy.process_tick().await.unwrap();

        assert_eq!(strategy.market_count(), 2);
        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.bid_price, dec!(0.495));
        assert_eq!(state.current_spread, dec!(0.02));
        // Nothing to sell yet
        assert!(state.ask_order.is_none());
        assert!(strategy.market_state("T3").is_none());
    }

    #[tokio::test]
    async fn test_one_bad_market_does_not_stop_the_tick() {
        let (strategy, h) = setup();
        set_book(&h.books, "T1", dec!(0.49), dec!(0.51)).await;
        set_book(&h.books, "T2", dec!(0.49), dec!(0.51)).await;
        strategy.activate().await;

        // Discovery sees both, then T1 starts failing
        strategy.inner.discover_if_due().await;
        h.books.fail_token("T1").await;
        strategy.process_tick().await.unwrap();

        assert!(strategy.market_state("T2").unwrap().bid_order.is_some());
        assert!(strategy.market_state("T1").unwrap().bid_order.is_none());
        assert!(h.sink.count(|e| matches!(e, AuditEvent::Error { context, .. } if context == "MARKET_MAKING_RECONCILE")) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quote_within_threshold_is_not_replaced() {
        let (strategy, h) = setup_with(Config::default(), Some(slow_execution(60_000)));
        set_book(&h.books, "T1", dec!(0.49), dec!(0.51)).await;
        strategy.activate().await;

        // Occupy the worker so quotes stay queued
        let blocker = OrderRequest::new("X", Side::Buy, OrderKind::Fok, dec!(0.5), dec!(1));
        h.ctx.engine.submit("other", blocker).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        strategy.process_tick().await.unwrap();
        let first = strategy.market_state("T1").unwrap().bid_order.unwrap();

        // Mid 0.50 -> 0.501 moves the bid well inside 0.5%
        set_book(&h.books, "T1", dec!(0.491), dec!(0.511)).await;
        strategy.process_tick().await.unwrap();
        assert_eq!(strategy.market_state("T1").unwrap().bid_order, Some(first.clone()));
        assert_eq!(h.ctx.engine.stats().submitted, 2);

        // Mid 0.52 is far outside the threshold
        set_book(&h.books, "T1", dec!(0.51), dec!(0.53)).await;
        strategy.process_tick().await.unwrap();
        let replaced = strategy.market_state("T1").unwrap().bid_order.unwrap();
        assert_ne!(replaced, first);
        assert_eq!(h.ctx.engine.order(&first).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(h.ctx.engine.stats().submitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executing_quote_is_replaced_once_settled() {
        let (strategy, h) = setup_with(Config::default(), Some(slow_execution(5_000)));
        set_book(&h.books, "T1", dec!(0.49), dec!(0.51)).await;
        strategy.activate().await;

        strategy.process_tick().await.unwrap();
        let first = strategy.market_state("T1").unwrap().bid_order.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.ctx.engine.order(&first).unwrap().status, OrderStatus::Executing);

        // Cancel lands mid-execution: the quote stays tracked
        set_book(&h.books, "T1", dec!(0.51), dec!(0.53)).await;
        strategy.process_tick().await.unwrap();
        assert_eq!(strategy.market_state("T1").unwrap().bid_order, Some(first.clone()));
        assert_eq!(h.ctx.engine.stats().submitted, 1);

        // The late fill is folded in before the replacement goes out
        tokio::time::sleep(Duration::from_secs(6)).await;
        strategy.process_tick().await.unwrap();
        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.position, dec!(20.20));
        assert_eq!(state.position, h.ctx.engine.open_size("market_making", "T1"));
        assert_ne!(state.bid_order, Some(first));
    }

    #[tokio::test]
    async fn test_book_events_only_for_subscribed_markets() {
        let (strategy, h) = setup();
        set_book(&h.books, "T1", dec!(0.49), dec!(0.51)).await;
        strategy.activate().await;
        strategy.inner.discover_if_due().await;

        let snapshot = h.books.get_orderbook("T1").await.unwrap().unwrap();
        strategy.on_book_event(BookEvent::Snapshot(snapshot)).unwrap();
        strategy
            .on_book_event(BookEvent::Delta {
                token_id: "T1".to_string(),
                side: Side::Buy,
                price: dec!(0.495),
                size: dec!(25),
            })
            .unwrap();
        assert_eq!(strategy.book("T1").unwrap().best_bid(), Some(dec!(0.495)));

        strategy
            .on_book_event(BookEvent::Delta {
                token_id: "T1".to_string(),
                side: Side::Buy,
                price: dec!(0.495),
                size: Decimal::ZERO,
            })
            .unwrap();
        assert_eq!(strategy.book("T1").unwrap().best_bid(), Some(dec!(0.49)));

        // Unknown market is ignored, malformed level is rejected
        assert!(strategy
            .on_book_event(BookEvent::Delta {
                token_id: "T9".to_string(),
                side: Side::Sell,
                price: dec!(0.5),
                size: dec!(1),
            })
            .is_ok());
        assert!(strategy
            .on_book_event(BookEvent::Delta {
                token_id: "T1".to_string(),
                side: Side::Sell,
                price: dec!(-1),
                size: dec!(1),
            })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quote_fills_drive_skew_and_exit() {
        let (strategy, h) = setup();
        set_book(&h.books, "T1", dec!(0.49), dec!(0.51)).await;
        strategy.activate().await;

        strategy.process_tick().await.unwrap();
        let bid = strategy.market_state("T1").unwrap().bid_order.unwrap();
        h.ctx.engine.wait_for(&bid, Duration::from_secs(1)).await;

        // 10 USDC at 0.495 -> 20.20 shares; quotes skew down by 0.0000505
        strategy.process_tick().await.unwrap();
        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.position, dec!(20.20));
        assert_eq!(state.entry_price, dec!(0.495));
        assert_eq!(state.bid_price, dec!(0.4949));
        assert_eq!(state.ask_price, dec!(0.5049));
        for id in [state.bid_order.unwrap(), state.ask_order.unwrap()] {
            h.ctx.engine.wait_for(&id, Duration::from_secs(1)).await;
        }

        set_book(&h.books, "T1", dec!(0.60), dec!(0.61)).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        strategy.process_tick().await.unwrap();

        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.position, Decimal::ZERO);
        assert!(state.pending_exit.is_none());
        assert_eq!(strategy.active_quote_count(), 0);
        assert_eq!(h.ctx.engine.open_size("market_making", "T1"), Decimal::ZERO);

        let perf = strategy.performance();
        assert!(perf.trade_count >= 2);
        assert!(perf.realized_pnl > Decimal::ZERO);
        assert_eq!(perf.realized_pnl, h.ctx.engine.realized_pnl_for_strategy("market_making"));
        assert!(strategy.status().last_action.unwrap().contains("PROFIT_TARGET"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_folds_unsynced_quote_fills_first() {
        let (strategy, h) = setup();
        set_book(&h.books, "T1", dec!(0.49), dec!(0.51)).await;
        strategy.activate().await;
        strategy.inner.discover_if_due().await;

        let buy = OrderRequest::new("T1", Side::Buy, OrderKind::Gtc, dec!(0.40), dec!(20));
        let id = h.ctx.engine.submit("market_making", buy).unwrap();
        h.ctx.engine.wait_for(&id, Duration::from_secs(1)).await;
        guard(&strategy.inner.markets)
            .get_mut("T1")
            .unwrap()
            .apply_fill(Side::Buy, dec!(0.40), dec!(20), Decimal::ZERO);

        // Both quotes fill before anything syncs them
        strategy.inner.reconcile_all().await;
        let state = strategy.market_state("T1").unwrap();
        for id in [state.bid_order.unwrap(), state.ask_order.unwrap()] {
            h.ctx.engine.wait_for(&id, Duration::from_secs(1)).await;
        }
        assert_eq!(strategy.market_state("T1").unwrap().position, dec!(20));

        tokio::time::advance(Duration::from_secs(30)).await;
        strategy.inner.manage_exits().await;

        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.position, Decimal::ZERO);
        assert_eq!(h.ctx.engine.open_size("market_making", "T1"), Decimal::ZERO);
        // Ask quote plus the exit itself
        assert_eq!(strategy.performance().trade_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_executing_past_wait_is_not_resubmitted() {
        let (strategy, h) = setup_with(Config::default(), Some(slow_execution(6_000)));
        set_book(&h.books, "T1", dec!(0.60), dec!(0.61)).await;
        strategy.activate().await;
        strategy.inner.discover_if_due().await;
        let snapshot = h.books.get_orderbook("T1").await.unwrap().unwrap();
        strategy.on_book_event(BookEvent::Snapshot(snapshot)).unwrap();

        let buy = OrderRequest::new("T1", Side::Buy, OrderKind::Gtc, dec!(0.50), dec!(20));
        let id = h.ctx.engine.submit("market_making", buy).unwrap();
        h.ctx.engine.wait_for(&id, Duration::from_secs(10)).await;
        guard(&strategy.inner.markets)
            .get_mut("T1")
            .unwrap()
            .apply_fill(Side::Buy, dec!(0.50), dec!(20), Decimal::ZERO);

        tokio::time::advance(Duration::from_secs(30)).await;
        strategy.inner.manage_exits().await;
        let exit_id = strategy
            .market_state("T1")
            .unwrap()
            .pending_exit
            .map(|p| p.order_id)
            .unwrap();

        strategy.inner.manage_exits().await;
        assert_eq!(h.ctx.engine.stats().submitted, 2);
        assert_eq!(strategy.market_state("T1").unwrap().position, dec!(20));

        tokio::time::sleep(Duration::from_secs(10)).await;
        strategy.inner.manage_exits().await;

        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.position, Decimal::ZERO);
        assert!(state.pending_exit.is_none());
        assert_eq!(h.ctx.engine.stats().submitted, 2);
        assert_eq!(h.ctx.engine.open_size("market_making", "T1"), Decimal::ZERO);
        assert_eq!(strategy.performance().realized_pnl, dec!(2.00));

        let exit = h.ctx.engine.order(&exit_id).unwrap();
        assert_eq!(exit.status, OrderStatus::Cancelled);
        assert_eq!(exit.filled_size, dec!(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_phase_sells_inventory_and_resets_tracking() {
        let (strategy, h) = setup();
        set_book(&h.books, "T1", dec!(0.60), dec!(0.61)).await;
        strategy.activate().await;
        strategy.inner.discover_if_due().await;
        let snapshot = h.books.get_orderbook("T1").await.unwrap().unwrap();
        strategy.on_book_event(BookEvent::Snapshot(snapshot)).unwrap();

        let buy = OrderRequest::new("T1", Side::Buy, OrderKind::Gtc, dec!(0.50), dec!(20));
        let id = h.ctx.engine.submit("market_making", buy).unwrap();
        h.ctx.engine.wait_for(&id, Duration::from_secs(5)).await;
        {
            let mut markets = guard(&strategy.inner.markets);
            let state = markets.get_mut("T1").unwrap();
            state.apply_fill(Side::Buy, dec!(0.50), dec!(20), Decimal::ZERO);
        }
        assert_eq!(strategy.status().position_count, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        strategy.inner.manage_exits().await;

        let state = strategy.market_state("T1").unwrap();
        assert_eq!(state.position, Decimal::ZERO);
        assert_eq!(state.entry_price, Decimal::ZERO);
        assert_eq!(state.highest_price, Decimal::ZERO);
        let perf = strategy.performance();
        assert_eq!(perf.trade_count, 1);
        // 20 x (0.60 - 0.50)
        assert_eq!(perf.realized_pnl, dec!(2.00));
        assert!(strategy.status().last_action.unwrap().contains("PROFIT_TARGET"));
    }
}
