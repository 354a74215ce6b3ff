//! Order queue, single execution worker and position accounting.
//!
//! Strategies hand [`OrderRequest`]s to [`ExecutionEngine::submit`] and get
//! back an order id. One background worker drains the FIFO queue, so
//! venue-facing calls happen strictly in submission order. Live calls take a
//! rate-limiter token and run on the blocking pool; paper orders go through
//! the [`PaperSimulator`]. Every fill is booked into the FIFO ledger.

use super::ledger::{OpenPosition, PositionLedger};
use super::order::{Order, OrderId, OrderRequest, OrderStatus};
use super::paper::{PaperOutcome, PaperSimulator};
use super::rate_limiter::RateLimiter;
use crate::audit::{self, AuditEvent, SharedAudit};
use crate::config::ExecutionConfig;
use crate::exchange::{CredentialsProvider, Side, VenueClient, VenueOrderArgs};
use crate::utils::{Observers, Subscriber};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where orders are executed.
#[derive(Clone)]
pub enum ExecutionMode {
    Paper,
    Live {
        client: Arc<dyn VenueClient>,
        credentials: Arc<dyn CredentialsProvider>,
    },
}

/// Execution success statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// `completed / (completed + failed)` in percent
    pub success_rate: f64,
}

#[derive(Default)]
struct OrderTable {
    orders: HashMap<OrderId, Order>,
    waiters: HashMap<OrderId, Vec<oneshot::Sender<Order>>>,
    counter: u64,
    stats: ExecutionStats,
}

impl OrderTable {
    fn take_waiters(&mut self, id: &str) -> Vec<oneshot::Sender<Order>> {
        self.waiters.remove(id).unwrap_or_default()
    }
}

enum ExecOutcome {
    Filled {
        price: Decimal,
        size: Decimal,
        venue_order_id: Option<String>,
    },
    Rejected(String),
}

struct EngineInner {
    mode: ExecutionMode,
    paper: PaperSimulator,
    rate_limiter: RateLimiter,
    table: Mutex<OrderTable>,
    ledger: Mutex<PositionLedger>,
    queue_tx: mpsc::UnboundedSender<OrderId>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<OrderId>>>,
    queue_depth: AtomicUsize,
    queue_warn_depth: usize,
    queue_max_depth: usize,
    enabled: AtomicBool,
    observers: Observers<Order>,
    worker: Mutex<Option<JoinHandle<()>>>,
    audit: SharedAudit,
}

/// Cheaply cloneable handle to the engine.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Create a disabled engine. Call [`start`](Self::start) and
    /// [`enable`](Self::enable) before submitting.
    pub fn new(config: &ExecutionConfig, mode: ExecutionMode, audit: SharedAudit) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineInner {
                mode,
                paper: PaperSimulator::new(config.paper.clone()),
                rate_limiter: RateLimiter::new(
                    config.rate_limit_capacity,
                    config.rate_limit_refill_per_sec,
                ),
                table: Mutex::new(OrderTable::default()),
                ledger: Mutex::new(PositionLedger::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                queue_depth: AtomicUsize::new(0),
                queue_warn_depth: config.queue_warn_depth,
                queue_max_depth: config.queue_max_depth,
                enabled: AtomicBool::new(false),
                observers: Observers::new("order_status"),
                worker: Mutex::new(None),
                audit,
            }),
        }
    }

    /// Spawn the queue worker. Calling it twice is a no-op.
    pub fn start(&self) {
        let rx = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return;
        };

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(order_id) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.queue_depth.fetch_sub(1, Ordering::SeqCst);
                inner.process(&order_id).await;
            }
            debug!("Execution worker stopped");
        });
        *self.inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(paper = self.is_paper(), "Execution engine started");
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
        info!("Execution engine enabled");
    }

    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        info!("Execution engine disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_paper(&self) -> bool {
        matches!(self.inner.mode, ExecutionMode::Paper)
    }

    /// Queue an order. `None` if the engine is disabled, the request is
    /// invalid or the queue is full.
    pub fn submit(&self, strategy: &str, request: OrderRequest) -> Option<OrderId> {
        let inner = &self.inner;
        if !self.is_enabled() {
            audit::log(
                inner.audit.as_ref(),
                AuditEvent::PolicyViolation {
                    action: "SUBMIT_ORDER".to_string(),
                    reason: "execution engine is disabled".to_string(),
                },
            );
            return None;
        }

        if request.price <= Decimal::ZERO || request.size <= Decimal::ZERO {
            warn!(%strategy, token_id = %request.token_id, price = %request.price, size = %request.size, "Rejecting invalid order");
            return None;
        }

        let depth = inner.queue_depth.load(Ordering::SeqCst);
        if depth >= inner.queue_max_depth {
            error!(%strategy, depth, "Order queue full, refusing submission");
            audit::log(
                inner.audit.as_ref(),
                AuditEvent::PolicyViolation {
                    action: "SUBMIT_ORDER".to_string(),
                    reason: format!("order queue full ({} pending)", depth),
                },
            );
            return None;
        }
        if depth >= inner.queue_warn_depth {
            warn!(%strategy, depth, "Order queue backing up");
        }

        let order = {
            let mut table = inner.table();
            table.counter += 1;
            let id = format!("ORD-{:06}", table.counter);
            let order = Order::new(id.clone(), strategy, request);
            table.orders.insert(id, order.clone());
            table.stats.submitted += 1;
            order
        };

        info!(
            order_id = %order.id,
            %strategy,
            token_id = %order.token_id,
            side = %order.side,
            kind = %order.kind,
            price = %order.price,
            size = %order.size,
            "Order submitted"
        );
        inner.record_order_event(&order, "SUBMITTED", None);

        inner.queue_depth.fetch_add(1, Ordering::SeqCst);
        if inner.queue_tx.send(order.id.clone()).is_err() {
            inner.queue_depth.fetch_sub(1, Ordering::SeqCst);
            inner.finish(&order.id, ExecOutcome::Rejected("execution worker stopped".to_string()));
        }
        Some(order.id)
    }

    /// Cancel a pending or executing order.
    ///
    /// Records intent only; a venue call already in flight may still fill,
    /// in which case the fill is booked but the status stays `Cancelled`.
    pub fn cancel(&self, order_id: &str) -> bool {
        let inner = &self.inner;
        let (order, waiters) = {
            let mut table = inner.table();
            let Some(order) = table.orders.get_mut(order_id) else {
                return false;
            };
            if !order.status.is_cancellable() {
                return false;
            }
            order.set_status(OrderStatus::Cancelled);
            let order = order.clone();
            table.stats.cancelled += 1;
            (order, table.take_waiters(order_id))
        };

        debug!(%order_id, "Order cancelled");
        inner.record_order_event(&order, "CANCELLED", None);
        inner.publish(&order, waiters);
        true
    }

    /// Cancel every pending/executing order.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.cancel_matching(|_| true);
        if cancelled > 0 {
            audit::log(
                self.inner.audit.as_ref(),
                AuditEvent::OperatorAction {
                    action: "CANCEL_ALL_ORDERS".to_string(),
                    detail: serde_json::json!({ "cancelled_count": cancelled }),
                },
            );
        }
        cancelled
    }

    /// Cancel every pending/executing order of one strategy.
    pub fn cancel_for_strategy(&self, strategy: &str) -> usize {
        self.cancel_matching(|o| o.strategy == strategy)
    }

    fn cancel_matching(&self, predicate: impl Fn(&Order) -> bool) -> usize {
        let ids: Vec<OrderId> = self
            .inner
            .table()
            .orders
            .values()
            .filter(|o| o.status.is_cancellable() && predicate(o))
            .map(|o| o.id.clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.inner.table().orders.get(order_id).cloned()
    }

    /// Wait until the order is terminal or `timeout` elapses, returning its
    /// latest state.
    pub async fn wait_for(&self, order_id: &str, timeout: Duration) -> Option<Order> {
        let rx = {
            let mut table = self.inner.table();
            let order = table.orders.get(order_id)?;
            if order.status.is_terminal() {
                return Some(order.clone());
            }
            let (tx, rx) = oneshot::channel();
            table.waiters.entry(order_id.to_string()).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(order)) => Some(order),
            _ => self.order(order_id),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .table()
            .orders
            .values()
            .filter(|o| o.status.is_cancellable())
            .count()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth.load(Ordering::SeqCst)
    }

    /// Observe every order status change.
    pub fn subscribe_status(&self, subscriber: Subscriber<Order>) {
        self.inner.observers.subscribe(subscriber);
    }

    // ===== Aggregates =====

    pub fn realized_pnl(&self, token_id: &str) -> Decimal {
        self.inner.ledger().realized_pnl(token_id)
    }

    pub fn realized_pnl_for_strategy(&self, strategy: &str) -> Decimal {
        self.inner.ledger().realized_pnl_for_strategy(strategy)
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.inner.ledger().total_realized_pnl()
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.inner.ledger().open_positions()
    }

    pub fn open_size(&self, strategy: &str, token_id: &str) -> Decimal {
        self.inner.ledger().open_size(strategy, token_id)
    }

    pub fn unrealized_pnl(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.inner.ledger().unrealized_pnl(prices)
    }

    pub fn stats(&self) -> ExecutionStats {
        let mut stats = self.inner.table().stats;
        let attempted = stats.completed + stats.failed;
        stats.success_rate = if attempted == 0 {
            0.0
        } else {
            stats.completed as f64 / attempted as f64 * 100.0
        };
        stats
    }

    /// Stop the worker task.
    pub fn shutdown(&self) {
        self.disable();
        if let Some(handle) = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl EngineInner {
    fn table(&self) -> MutexGuard<'_, OrderTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ledger(&self) -> MutexGuard<'_, PositionLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn process(&self, order_id: &str) {
        let order = {
            let mut table = self.table();
            let Some(order) = table.orders.get_mut(order_id) else {
                return;
            };
            if order.status != OrderStatus::Pending {
                return;
            }
            if !self.enabled.load(Ordering::SeqCst) {
                order.set_status(OrderStatus::Cancelled);
                order.error = Some("execution engine disabled".to_string());
                let order = order.clone();
                table.stats.cancelled += 1;
                let waiters = table.take_waiters(order_id);
                drop(table);
                self.record_order_event(&order, "CANCELLED", order.error.clone());
                self.publish(&order, waiters);
                return;
            }
            order.set_status(OrderStatus::Executing);
            order.in_flight = true;
            order.clone()
        };

        self.record_order_event(&order, "EXECUTING", None);
        self.observers.notify(&order);

        let outcome = match &self.mode {
            ExecutionMode::Paper => self.execute_paper(&order).await,
            ExecutionMode::Live {
                client,
                credentials,
            } => self.execute_live(&order, client.clone(), credentials.clone()).await,
        };
        self.finish(order_id, outcome);
    }

    async fn execute_paper(&self, order: &Order) -> ExecOutcome {
        let latency = self.paper.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self
            .paper
            .simulate(order.side, order.price, order.size, order.reference_depth)
        {
            PaperOutcome::NotFilled => ExecOutcome::Rejected("not filled".to_string()),
            PaperOutcome::Filled {
                price,
                size,
                slippage,
            } => {
                debug!(order_id = %order.id, %price, %size, %slippage, "Paper fill");
                ExecOutcome::Filled {
                    price,
                    size,
                    venue_order_id: None,
                }
            }
        }
    }

    async fn execute_live(
        &self,
        order: &Order,
        client: Arc<dyn VenueClient>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> ExecOutcome {
        self.rate_limiter.acquire(1.0).await;

        let Some(creds) = credentials.credentials() else {
            return ExecOutcome::Rejected("credentials are locked".to_string());
        };
        let args = VenueOrderArgs {
            token_id: order.token_id.clone(),
            side: order.side,
            kind: order.kind,
            price: order.price,
            size: order.size,
        };

        match tokio::task::spawn_blocking(move || client.submit_order(&args, &creds)).await {
            Ok(Ok(receipt)) if receipt.filled_size <= Decimal::ZERO => {
                debug!(order_id = %order.id, venue_order_id = %receipt.venue_order_id, "Venue accepted order without a fill");
                ExecOutcome::Rejected("not filled".to_string())
            }
            Ok(Ok(receipt)) => ExecOutcome::Filled {
                price: receipt.avg_price,
                size: receipt.filled_size,
                venue_order_id: Some(receipt.venue_order_id),
            },
            Ok(Err(e)) => ExecOutcome::Rejected(e.to_string()),
            Err(e) => ExecOutcome::Rejected(format!("venue call panicked: {}", e)),
        }
    }

    /// Apply an execution outcome, book fills and wake waiters.
    fn finish(&self, order_id: &str, outcome: ExecOutcome) {
        let (order, waiters, late_fill) = {
            let mut table = self.table();
            let Some(order) = table.orders.get_mut(order_id) else {
                return;
            };
            let was_cancelled = order.status == OrderStatus::Cancelled;
            let mut late_fill = false;
            order.in_flight = false;

            match outcome {
                ExecOutcome::Filled {
                    price,
                    size,
                    venue_order_id,
                } => {
                    order.venue_order_id = venue_order_id;
                    if size > Decimal::ZERO {
                        order.filled_size = size;
                        order.fill_price = Some(price);
                        let mut ledger = self.ledger();
                        match order.side {
                            Side::Buy => {
                                ledger.record_buy(&order.strategy, &order.token_id, price, size)
                            }
                            Side::Sell => {
                                order.realized_pnl = ledger
                                    .record_sell(&order.strategy, &order.token_id, price, size)
                                    .realized_pnl;
                            }
                        }
                        late_fill = was_cancelled;
                    }
                    if !was_cancelled {
                        order.set_status(OrderStatus::Completed);
                    }
                }
                ExecOutcome::Rejected(reason) => {
                    order.error = Some(reason);
                    if !was_cancelled {
                        order.set_status(OrderStatus::Failed);
                    }
                }
            }

            let order = order.clone();
            if !was_cancelled {
                match order.status {
                    OrderStatus::Completed => table.stats.completed += 1,
                    OrderStatus::Failed => table.stats.failed += 1,
                    _ => {}
                }
            }
            (order, table.take_waiters(order_id), late_fill)
        };

        match order.status {
            OrderStatus::Completed => info!(
                order_id = %order.id,
                filled = %order.filled_size,
                price = ?order.fill_price,
                realized = %order.realized_pnl,
                "Order completed"
            ),
            OrderStatus::Failed => warn!(
                order_id = %order.id,
                error = order.error.as_deref().unwrap_or(""),
                "Order failed"
            ),
            _ => {}
        }
        if late_fill {
            warn!(order_id = %order.id, filled = %order.filled_size, "Fill arrived after cancellation; booked");
        }

        let event = if late_fill {
            "FILLED_AFTER_CANCEL"
        } else {
            match order.status {
                OrderStatus::Completed => "COMPLETED",
                OrderStatus::Failed => "FAILED",
                _ => "CANCELLED",
            }
        };
        self.record_order_event(&order, event, order.error.clone());
        self.publish(&order, waiters);
    }

    fn publish(&self, order: &Order, waiters: Vec<oneshot::Sender<Order>>) {
        for waiter in waiters {
            let _ = waiter.send(order.clone());
        }
        self.observers.notify(order);
    }

    fn record_order_event(&self, order: &Order, event: &str, detail: Option<String>) {
        audit::log(
            self.audit.as_ref(),
            AuditEvent::OrderEvent {
                order_id: order.id.clone(),
                strategy: order.strategy.clone(),
                event: event.to_string(),
                detail,
            },
        );
    }
}
