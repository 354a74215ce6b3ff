//! Market data state: live order books and the volatility filter.

mod orderbook;
mod volatility;

pub use orderbook::{BookSnapshot, LiveOrderBook};
pub use volatility::VolatilityFilter;
