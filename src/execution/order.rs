//! Order records owned by the execution engine.

use crate::exchange::{OrderKind, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Engine-assigned order id (`ORD-000001`).
pub type OrderId = String;

/// Order lifecycle.
///
/// `Pending -> Executing -> {Completed | Failed}`, or
/// `Pending/Executing -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    pub fn is_cancellable(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Executing)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Executing => "EXECUTING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", name)
    }
}

/// What a strategy asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Decimal,
    /// Size in shares
    pub size: Decimal,
    /// Visible size on the side being taken, used by the paper simulator
    pub reference_depth: Option<Decimal>,
}

impl OrderRequest {
    pub fn new(
        token_id: impl Into<String>,
        side: Side,
        kind: OrderKind,
        price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            side,
            kind,
            price,
            size,
            reference_depth: None,
        }
    }

    pub fn with_depth(mut self, depth: Decimal) -> Self {
        self.reference_depth = Some(depth);
        self
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub strategy: String,
    pub token_id: String,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Decimal,
    pub size: Decimal,
    #[serde(skip)]
    pub reference_depth: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    /// Average execution price, once filled
    pub fill_price: Option<Decimal>,
    /// FIFO realized PnL booked by this order's fill (sells only)
    pub realized_pnl: Decimal,
    pub venue_order_id: Option<String>,
    pub error: Option<String>,
    /// Set while the worker is executing the order
    #[serde(skip)]
    pub(crate) in_flight: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub(crate) fn new(id: OrderId, strategy: &str, request: OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            strategy: strategy.to_string(),
            token_id: request.token_id,
            side: request.side,
            kind: request.kind,
            price: request.price,
            size: request.size,
            reference_depth: request.reference_depth,
            status: OrderStatus::Pending,
            filled_size: Decimal::ZERO,
            fill_price: None,
            realized_pnl: Decimal::ZERO,
            venue_order_id: None,
            error: None,
            in_flight: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_size >= self.size
    }

    /// Terminal with no venue call outstanding, so `filled_size` is final.
    ///
    /// An order cancelled mid-execution is terminal but not settled until
    /// the venue outcome has been applied.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && !self.in_flight
    }

    pub(crate) fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
