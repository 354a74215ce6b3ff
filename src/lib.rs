//! # CLOB Trader
//!
//! An unattended trading engine for binary-outcome CLOB markets, running
//! two strategies side by side under shared capital and risk controls.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue-facing types and collaborator traits, plus a simulated venue
//! - `market`: Live order books and the volatility filter
//! - `risk`: Capital pools, policy gate and kill switch
//! - `execution`: Order queue, paper simulator and FIFO position ledger
//! - `strategy`: Front-running and market-making strategies with shared exit rules
//! - `orchestrator`: Bot state machine and heartbeat loop
//! - `audit`: Structured audit trail
//! - `utils`: Shared utilities and decimal arithmetic

pub mod audit;
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod market;
pub mod orchestrator;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use orchestrator::{ExternalDeps, Orchestrator};
