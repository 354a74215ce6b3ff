//! Shared utilities.

pub mod decimal;
mod observer;

pub use observer::{Observers, Subscriber};
