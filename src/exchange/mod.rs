//! Venue integration surface.
//!
//! The core talks to the outside world only through the traits in
//! [`traits`]: order book fetches, blocking order submission, credential
//! access, trigger feeds and market discovery. [`mock`] provides a
//! random-walk venue for paper trading and fixed books for tests.

pub mod mock;
mod traits;
mod types;

pub use mock::{SimulatedVenue, StaticBookSource};
pub use traits::*;
pub use types::*;
