//! Interfaces to the collaborators around the trading core.
//!
//! Transport clients, credential vaults, signal feeds and market discovery
//! live outside this crate; the core only sees these traits.

use super::types::{Credentials, FeedTrigger, OrderBookData, VenueOrderArgs, VenueReceipt};
use crate::error::{EngineResult, VenueError};
use async_trait::async_trait;
use std::sync::Arc;

/// Bounded-latency order book fetch.
#[async_trait]
pub trait OrderBookSource: Send + Sync {
    /// Returns `Ok(None)` when the venue has no book for `token_id`.
    async fn get_orderbook(&self, token_id: &str) -> EngineResult<Option<OrderBookData>>;
}

/// Blocking order submission.
///
/// Only the execution engine's live path calls this, from a blocking task.
#[cfg_attr(test, mockall::automock)]
pub trait VenueClient: Send + Sync {
    fn submit_order(
        &self,
        args: &VenueOrderArgs,
        credentials: &Credentials,
    ) -> Result<VenueReceipt, VenueError>;
}

/// Accessor for decrypted credentials.
pub trait CredentialsProvider: Send + Sync {
    /// `None` while the vault is locked.
    fn credentials(&self) -> Option<Credentials>;

    /// Drop any decrypted secrets held in memory.
    fn destroy(&self);
}

pub type TriggerHandler = Arc<dyn Fn(FeedTrigger) + Send + Sync>;

/// Source of front-running triggers.
pub trait TriggerFeed: Send + Sync {
    fn subscribe(&self, handler: TriggerHandler);
}

/// Supplies tradable markets for quoting.
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    async fn discover(&self, limit: usize) -> EngineResult<Vec<String>>;
}

/// Optional ranking of markets by opportunity.
pub trait MarketScorer: Send + Sync {
    fn top_markets(&self, limit: usize) -> Vec<String>;
}

/// Credentials held in memory until destroyed.
#[derive(Default)]
pub struct InMemoryCredentials {
    inner: std::sync::Mutex<Option<Credentials>>,
}

impl InMemoryCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: std::sync::Mutex::new(Some(credentials)),
        }
    }

    pub fn locked() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for InMemoryCredentials {
    fn credentials(&self) -> Option<Credentials> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn destroy(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_locks_credentials() {
        let vault = InMemoryCredentials::new(Credentials::new("k", "s", "p", "w"));
        assert!(vault.credentials().is_some());
        vault.destroy();
        assert!(vault.credentials().is_none());
        assert!(InMemoryCredentials::locked().credentials().is_none());
    }
}
