//! Order execution: queueing, rate limiting, paper simulation and FIFO
//! position accounting.

mod engine;
mod ledger;
mod order;
mod paper;
mod rate_limiter;

pub use engine::{ExecutionEngine, ExecutionMode, ExecutionStats};
pub use ledger::{Lot, OpenPosition, PositionLedger, SellOutcome};
pub use order::{Order, OrderId, OrderRequest, OrderStatus};
pub use paper::{PaperOutcome, PaperSimulator};
pub use rate_limiter::RateLimiter;
