//! Reactive front-running on external triggers.
//!
//! Triggers arrive on the feed's stack and are only queued there; each tick
//! drains the queue in arrival order. A per-token async lock guarantees at
//! most one entry decision per token at a time.
//!
//! Entry and exit orders are tracked by id until they settle. A tick that is
//! cut off while waiting leaves the order tracked, and the next tick folds
//! whatever it filled into the position.

use super::exit::{self, ExitReason, ExitRules, PositionMarks};
use super::{
    PendingExit, PerformanceStats, Settlement, Strategy, StrategyContext, StrategyKind, StrategyState,
    StrategyStatus,
};
use crate::audit::{self, AuditEvent};
use crate::config::FrontRunningConfig;
use crate::error::EngineResult;
use crate::exchange::{FeedTrigger, OrderKind, Side, TriggerFeed, TriggerHandler, TriggerType};
use crate::execution::{Order, OrderId, OrderRequest};
use crate::market::BookSnapshot;
use crate::risk::PolicyAction;
use async_trait::async_trait;
use futures_util::future::join_all;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const KIND: StrategyKind = StrategyKind::FrontRunning;
const DEPTH_LEVELS: usize = 5;

/// An open single-shot position.
#[derive(Debug, Clone)]
pub struct EntryPosition {
    pub token_id: String,
    pub order_id: OrderId,
    pub trigger_type: TriggerType,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    pub current_price: Decimal,
    pub entered_at: Instant,
    pub pending_exit: Option<PendingExit>,
}

impl EntryPosition {
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.entry_price) * self.size
    }
}

/// Entry order submitted but not yet folded into a position.
#[derive(Debug, Clone)]
struct PendingEntry {
    order_id: OrderId,
    trigger: FeedTrigger,
    limit_price: Decimal,
}

struct Inner {
    ctx: StrategyContext,
    config: FrontRunningConfig,
    rules: ExitRules,
    feed: Option<Arc<dyn TriggerFeed>>,
    subscribed: AtomicBool,
    status: Mutex<StrategyStatus>,
    performance: Mutex<PerformanceStats>,
    last_trigger: Mutex<HashMap<String, Instant>>,
    queue: Mutex<VecDeque<FeedTrigger>>,
    token_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    book_cache: Mutex<HashMap<String, (Instant, BookSnapshot)>>,
    positions: Mutex<HashMap<String, EntryPosition>>,
    pending_entries: Mutex<HashMap<String, PendingEntry>>,
}

/// Strategy A: enters on triggers, exits on profit/stop/trailing/timeout.
pub struct FrontRunningStrategy {
    inner: Arc<Inner>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FrontRunningStrategy {
    pub fn new(ctx: StrategyContext, feed: Option<Arc<dyn TriggerFeed>>) -> Self {
        let config = ctx.config.front_running.clone();
        let rules = ExitRules::from(&config.exits);
        Self {
            inner: Arc::new(Inner {
                ctx,
                config,
                rules,
                feed,
                subscribed: AtomicBool::new(false),
                status: Mutex::new(StrategyStatus::new(KIND)),
                performance: Mutex::new(PerformanceStats::default()),
                last_trigger: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                token_locks: Mutex::new(HashMap::new()),
                book_cache: Mutex::new(HashMap::new()),
                positions: Mutex::new(HashMap::new()),
                pending_entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Deduplicate and enqueue a trigger. `false` if it was dropped.
    pub fn on_trigger(&self, trigger: FeedTrigger) -> bool {
        self.inner.on_trigger(trigger)
    }

    pub fn positions(&self) -> Vec<EntryPosition> {
        let mut positions: Vec<_> = guard(&self.inner.positions).values().cloned().collect();
        positions.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        positions
    }

    pub fn queued_triggers(&self) -> usize {
        guard(&self.inner.queue).len()
    }

    /// Entry orders still waiting to be folded into a position.
    pub fn pending_entries(&self) -> usize {
        guard(&self.inner.pending_entries).len()
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

    fn on_trigger(&self, trigger: FeedTrigger) -> bool {
        if self.state() != StrategyState::Active {
            return false;
        }

        let now = Instant::now();
        let cooldown = Duration::from_secs(self.config.trigger_cooldown_secs);
        {
            let mut last = guard(&self.last_trigger);
            if let Some(previous) = last.get(&trigger.token_id) {
                let elapsed = now.duration_since(*previous);
                if elapsed < cooldown {
                    drop(last);
                    self.event(
                        "TRIGGER_DEDUPLICATED",
                        json!({
                            "token_id": trigger.token_id,
                            "cooldown_remaining_secs": (cooldown - elapsed).as_secs_f64(),
                        }),
                    );
                    return false;
                }
            }
            last.insert(trigger.token_id.clone(), now);
        }

        debug!(token_id = %trigger.token_id, trigger_type = ?trigger.trigger_type, "Trigger queued");
        self.event(
            "TRIGGER_QUEUED",
            json!({ "token_id": trigger.token_id, "trigger_type": trigger.trigger_type }),
        );
        guard(&self.queue).push_back(trigger);
        true
    }

    fn token_lock(&self, token_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.token_locks)
            .entry(token_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Order book with a short TTL cache; fresh fetches feed the volatility filter.
    async fn cached_book(&self, token_id: &str) -> EngineResult<Option<BookSnapshot>> {
        let ttl = Duration::from_millis(self.config.book_cache_ttl_ms);
        let cached = guard(&self.book_cache)
            .get(token_id)
            .filter(|(fetched_at, _)| fetched_at.elapsed() < ttl)
            .map(|(_, book)| book.clone());
        if cached.is_some() {
            return Ok(cached);
        }

        let Some(data) = self.ctx.books.get_orderbook(token_id).await? else {
            return Ok(None);
        };
        let book = BookSnapshot::from_data(&data)?;
        if let Some(mid) = book.midpoint() {
            self.ctx.volatility.update_price(token_id, mid);
        }
        guard(&self.book_cache).insert(token_id.to_string(), (Instant::now(), book.clone()));
        Ok(Some(book))
    }

    /// Entry decision for one trigger. `true` if a position was opened.
    async fn execute_trigger(&self, trigger: FeedTrigger) -> EngineResult<bool> {
        let token = trigger.token_id.clone();
        let token_id = token.as_str();
        let lock = self.token_lock(token_id);
        let _held = lock.lock().await;

        // Re-check under the token lock
        if guard(&self.positions).contains_key(token_id)
            || guard(&self.pending_entries).contains_key(token_id)
        {
            debug!(%token_id, "Position already open, skipping trigger");
            return Ok(false);
        }

        let Some(book) = self.cached_book(token_id).await? else {
            debug!(%token_id, "No order book, skipping trigger");
            return Ok(false);
        };

        if !self.ctx.volatility.is_safe(token_id) {
            self.event("SKIP_VOLATILE", json!({ "token_id": token_id }));
            return Ok(false);
        }

        let Some(best_ask) = book.best_ask() else {
            self.event("SKIP_NO_ASKS", json!({ "token_id": token_id }));
            return Ok(false);
        };

        let size = self.entry_size(&book, best_ask, token_id);
        let notional = size * best_ask;
        if notional < self.config.min_notional {
            self.event(
                "SKIP_INSUFFICIENT_LIQUIDITY",
                json!({ "token_id": token_id, "size": size, "notional": notional }),
            );
            return Ok(false);
        }

        if !self.ctx.place_order_allowed(KIND, token_id, notional) {
            return Ok(false);
        }

        let request = OrderRequest::new(token_id, Side::Buy, OrderKind::Fok, best_ask, size)
            .with_depth(book.depth(Side::Sell, DEPTH_LEVELS));
        let Some(order_id) = self.ctx.engine.submit(KIND.name(), request) else {
            warn!(%token_id, "Entry order refused by execution engine");
            return Ok(false);
        };

        guard(&self.pending_entries).insert(
            token_id.to_string(),
            PendingEntry {
                order_id: order_id.clone(),
                trigger,
                limit_price: best_ask,
            },
        );

        self.ctx.engine.wait_for(&order_id, self.order_wait()).await;
        Ok(self.settle_entry(token_id))
    }

    fn order_wait(&self) -> Duration {
        Duration::from_millis(self.config.order_wait_timeout_ms)
    }

    /// Resolve the tracked entry for `token_id`, cancelling it if it is still
    /// open. `true` if it filled and became a position.
    fn settle_entry(&self, token_id: &str) -> bool {
        let pending = guard(&self.pending_entries).get(token_id).cloned();
        let Some(pending) = pending else {
            return false;
        };
        let order = match self.ctx.settle_order(&pending.order_id) {
            Settlement::Done(order) => order,
            Settlement::InFlight => {
                debug!(%token_id, order_id = %pending.order_id, "Entry order still executing");
                return false;
            }
            Settlement::Unknown => {
                guard(&self.pending_entries).remove(token_id);
                return false;
            }
        };
        guard(&self.pending_entries).remove(token_id);

        if !order.is_filled() {
            info!(%token_id, order_id = %order.id, status = %order.status, "Entry order not filled");
            self.set_last_action(format!("ENTRY_UNFILLED: {}", token_id));
            return false;
        }
        self.open_position(pending, &order);
        true
    }

    fn open_position(&self, pending: PendingEntry, order: &Order) {
        let token_id = order.token_id.as_str();
        let trigger = pending.trigger;
        let fill_price = order.fill_price.unwrap_or(pending.limit_price);
        let position = EntryPosition {
            token_id: token_id.to_string(),
            order_id: order.id.clone(),
            trigger_type: trigger.trigger_type,
            entry_price: fill_price,
            size: order.filled_size,
            highest_price: fill_price,
            lowest_price: fill_price,
            current_price: fill_price,
            entered_at: Instant::now(),
            pending_exit: None,
        };
        guard(&self.positions).insert(token_id.to_string(), position);

        info!(
            %token_id,
            order_id = %order.id,
            price = %fill_price,
            size = %order.filled_size,
            trigger_type = ?trigger.trigger_type,
            "Front-run position opened"
        );
        self.event(
            "POSITION_OPENED",
            json!({
                "token_id": token_id,
                "order_id": order.id,
                "entry_price": fill_price,
                "size": order.filled_size,
                "trigger_type": trigger.trigger_type,
                "confidence": trigger.confidence,
            }),
        );
        self.set_last_action(format!("FRONT-RUN: {:?}", trigger.trigger_type));
    }

    /// Fold entries left behind by an interrupted tick into positions.
    async fn reconcile_entries(&self) {
        let tokens: Vec<String> = guard(&self.pending_entries).keys().cloned().collect();
        for token_id in tokens {
            let lock = self.token_lock(&token_id);
            let _held = lock.lock().await;
            if self.settle_entry(&token_id) {
                self.event("ENTRY_RECONCILED", json!({ "token_id": token_id }));
            }
        }
    }

    /// Shares to buy: a slice of locked capital, shrunk by volatility and
    /// capped by what the book absorbs within the slippage bound.
    fn entry_size(&self, book: &BookSnapshot, best_ask: Decimal, token_id: &str) -> Decimal {
        let locked = guard(&self.status).locked_capital;
        let score = self.ctx.volatility.score(token_id);
        let budget = locked * self.config.trade_size_pct / dec!(100) / (Decimal::ONE + score);
        let shares = budget / best_ask;
        let liquidity = book.max_executable_size(Side::Buy, self.config.max_entry_slippage_pct);
        shares
            .min(liquidity)
            .round_dp_with_strategy(2, RoundingStrategy::ToZero)
    }

    async fn drain_triggers(&self) {
        loop {
            let next = guard(&self.queue).pop_front();
            let Some(trigger) = next else {
                break;
            };
            let token_id = trigger.token_id.clone();
            if let Err(e) = self.execute_trigger(trigger).await {
                warn!(%token_id, error = %e, "Trigger execution failed");
                self.event("TRIGGER_FAILED", json!({ "token_id": token_id, "error": e.to_string() }));
            }
        }
    }

    async fn manage_exits(&self) {
        let tracked: Vec<String> = guard(&self.positions)
            .values()
            .filter(|p| p.pending_exit.is_some())
            .map(|p| p.token_id.clone())
            .collect();
        for token_id in &tracked {
            self.settle_exit(token_id);
        }

        let tokens: Vec<String> = guard(&self.positions)
            .values()
            .filter(|p| p.pending_exit.is_none())
            .map(|p| p.token_id.clone())
            .collect();
        if tokens.is_empty() {
            return;
        }

        let books = join_all(tokens.iter().map(|t| self.ctx.books.get_orderbook(t))).await;
        let mut exits: Vec<(String, ExitReason, Decimal)> = Vec::new();

        for (token_id, fetched) in tokens.iter().zip(books) {
            let book = match fetched {
                Ok(Some(data)) => match BookSnapshot::from_data(&data) {
                    Ok(book) => book,
                    Err(e) => {
                        warn!(%token_id, error = %e, "Malformed book during exit check");
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(e) => {
                    warn!(%token_id, error = %e, "Book fetch failed during exit check");
                    continue;
                }
            };
            let Some(bid) = book.best_bid() else {
                continue;
            };
            if let Some(mid) = book.midpoint() {
                self.ctx.volatility.update_price(token_id, mid);
            }

            let marks = {
                let mut positions = guard(&self.positions);
                let Some(pos) = positions.get_mut(token_id) else {
                    continue;
                };
                pos.current_price = bid;
                pos.highest_price = pos.highest_price.max(bid);
                pos.lowest_price = pos.lowest_price.min(bid);
                PositionMarks {
                    entry_price: pos.entry_price,
                    highest_price: pos.highest_price,
                    current_price: bid,
                    held: pos.entered_at.elapsed(),
                }
            };

            let score = self.ctx.volatility.score(token_id);
            if let Some(reason) = exit::evaluate(&self.rules, &marks, score) {
                exits.push((token_id.clone(), reason, bid));
            }
        }

        for (token_id, reason, bid) in exits {
            self.exit_position(&token_id, &reason, bid).await;
        }
    }

    async fn exit_position(&self, token_id: &str, reason: &ExitReason, bid: Decimal) {
        let position = guard(&self.positions).get(token_id).cloned();
        let Some(position) = position else {
            return;
        };
        if position.pending_exit.is_some() {
            return;
        }

        let held = self.ctx.engine.open_size(KIND.name(), token_id);
        let size = position.size.min(held);
        if size <= Decimal::ZERO {
            warn!(%token_id, tracked = %position.size, "No inventory left in the ledger, dropping position");
            guard(&self.positions).remove(token_id);
            return;
        }
        if !self.ctx.place_order_allowed(KIND, token_id, size * bid) {
            return;
        }

        let request = OrderRequest::new(token_id, Side::Sell, OrderKind::Fok, bid, size);
        let Some(order_id) = self.ctx.engine.submit(KIND.name(), request) else {
            warn!(%token_id, "Exit order refused by execution engine");
            return;
        };
        if let Some(pos) = guard(&self.positions).get_mut(token_id) {
            pos.pending_exit = Some(PendingExit {
                order_id: order_id.clone(),
                reason: reason.clone(),
            });
        }

        self.ctx.engine.wait_for(&order_id, self.order_wait()).await;
        self.settle_exit(token_id);
    }

    /// Fold a finished exit order into its position. `false` while the
    /// order may still fill.
    fn settle_exit(&self, token_id: &str) -> bool {
        let (pending, entry_price, highest_price, entered_at) = match guard(&self.positions).get(token_id) {
            Some(pos) => match &pos.pending_exit {
                Some(pending) => (pending.clone(), pos.entry_price, pos.highest_price, pos.entered_at),
                None => return true,
            },
            None => return true,
        };
        let reason = &pending.reason;

        let order = match self.ctx.settle_order(&pending.order_id) {
            Settlement::Done(order) => order,
            Settlement::InFlight => {
                debug!(%token_id, order_id = %pending.order_id, "Exit order still executing");
                return false;
            }
            Settlement::Unknown => {
                if let Some(pos) = guard(&self.positions).get_mut(token_id) {
                    pos.pending_exit = None;
                }
                return true;
            }
        };

        let remaining = {
            let mut positions = guard(&self.positions);
            let remaining = match positions.get_mut(token_id) {
                Some(pos) => {
                    pos.pending_exit = None;
                    pos.size -= order.filled_size;
                    pos.size
                }
                None => Decimal::ZERO,
            };
            if remaining <= Decimal::ZERO {
                positions.remove(token_id);
            }
            remaining
        };

        if !order.is_filled() {
            warn!(%token_id, order_id = %order.id, reason = %reason, "Exit order not filled, will retry");
            return true;
        }

        let pnl = order.realized_pnl;
        guard(&self.performance).record_trade(pnl);

        info!(
            %token_id,
            reason = %reason,
            entry = %entry_price,
            exit = ?order.fill_price,
            %pnl,
            remaining = %remaining.max(Decimal::ZERO),
            "Front-run position exited"
        );
        self.event(
            "POSITION_CLOSED",
            json!({
                "token_id": token_id,
                "reason": reason.to_string(),
                "entry_price": entry_price,
                "exit_price": order.fill_price,
                "pnl": pnl.round_dp(4),
                "hold_time_secs": entered_at.elapsed().as_secs_f64(),
                "highest_price": highest_price,
                "total_pnl": guard(&self.performance).realized_pnl.round_dp(4),
            }),
        );
        self.set_last_action(format!("EXIT: {}", reason.code()));
        true
    }

    fn clear(&self) {
        guard(&self.queue).clear();
        guard(&self.positions).clear();
        guard(&self.pending_entries).clear();
        guard(&self.book_cache).clear();
        guard(&self.last_trigger).clear();
    }
}

#[async_trait]
impl Strategy for FrontRunningStrategy {
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

        let ceiling = inner.ctx.config.capital.max_allocation_a;
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

        if let Some(feed) = &inner.feed {
            if !inner.subscribed.swap(true, Ordering::SeqCst) {
                let weak: Weak<Inner> = Arc::downgrade(inner);
                let handler: TriggerHandler = Arc::new(move |trigger: FeedTrigger| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_trigger(trigger);
                    }
                });
                feed.subscribe(handler);
            }
        }

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
        inner.reconcile_entries().await;
        inner.drain_triggers().await;
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
        status.position_count = guard(&self.inner.positions).len();
        status
    }

    fn performance(&self) -> PerformanceStats {
        guard(&self.inner.performance).clone()
    }
}
