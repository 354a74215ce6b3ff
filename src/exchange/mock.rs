//! Simulated venue for paper trading and tests.

use super::traits::{MarketDiscovery, OrderBookSource, TriggerFeed, TriggerHandler, VenueClient};
use super::types::*;
use crate::error::{EngineError, EngineResult, VenueError};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

const BOOK_DEPTH: usize = 5;
const TICK: Decimal = dec!(0.01);

/// Random-walk market simulator.
///
/// Serves order books for a fixed universe of tokens, emits synthetic
/// triggers on demand and fills every submitted order at its limit price.
pub struct SimulatedVenue {
    tokens: Vec<String>,
    mids: RwLock<HashMap<String, Decimal>>,
    rng: Mutex<StdRng>,
    handlers: Mutex<Vec<TriggerHandler>>,
    order_id_counter: AtomicU64,
    trigger_counter: AtomicU64,
}

impl SimulatedVenue {
    /// Create a venue with `token_count` markets.
    pub fn new(token_count: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let tokens: Vec<String> = (0..token_count).map(|i| format!("SIM-{:04}", i)).collect();
        let mids = tokens
            .iter()
            .map(|t| {
                let mid = Decimal::from_f64(rng.random_range(0.30..0.70))
                    .unwrap_or(dec!(0.5))
                    .round_dp(2);
                (t.clone(), mid)
            })
            .collect();

        Self {
            tokens,
            mids: RwLock::new(mids),
            rng: Mutex::new(rng),
            handlers: Mutex::new(Vec::new()),
            order_id_counter: AtomicU64::new(1),
            trigger_counter: AtomicU64::new(1),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Move every midpoint by a random step of up to one tick.
    pub async fn step(&self) {
        let mut mids = self.mids.write().await;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        for mid in mids.values_mut() {
            let ticks: i64 = rng.random_range(-1..=1);
            *mid = (*mid + TICK * Decimal::from(ticks)).clamp(dec!(0.05), dec!(0.95));
        }
    }

    /// Emit a BUY trigger for a random token to every subscriber.
    pub fn emit_random_trigger(&self) -> Option<FeedTrigger> {
        if self.tokens.is_empty() {
            return None;
        }
        let (token_id, confidence) = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            let idx = rng.random_range(0..self.tokens.len());
            (self.tokens[idx].clone(), rng.random_range(0.5..1.0))
        };

        let n = self.trigger_counter.fetch_add(1, Ordering::SeqCst);
        let mut trigger = FeedTrigger::new(format!("SIM-TRG-{}", n), token_id);
        trigger.confidence = confidence;
        trigger.source = "simulator".to_string();
        self.emit(trigger.clone());
        Some(trigger)
    }

    /// Deliver `trigger` to every subscriber.
    pub fn emit(&self, trigger: FeedTrigger) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler(trigger.clone());
        }
    }

    fn build_book(&self, token_id: &str, mid: Decimal) -> OrderBookData {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mut level = |price: Decimal| {
            let size = Decimal::from(rng.random_range(50u32..500));
            BookLevel::new(price, size)
        };

        let bids = (1..=BOOK_DEPTH)
            .map(|i| mid - TICK * Decimal::from(i))
            .filter(|p| *p > Decimal::ZERO)
            .map(&mut level)
            .collect();
        let asks = (1..=BOOK_DEPTH)
            .map(|i| mid + TICK * Decimal::from(i))
            .filter(|p| *p < Decimal::ONE)
            .map(&mut level)
            .collect();

        OrderBookData {
            token_id: token_id.to_string(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl OrderBookSource for SimulatedVenue {
    async fn get_orderbook(&self, token_id: &str) -> EngineResult<Option<OrderBookData>> {
        let mid = self.mids.read().await.get(token_id).copied();
        Ok(mid.map(|mid| self.build_book(token_id, mid)))
    }
}

#[async_trait]
impl MarketDiscovery for SimulatedVenue {
    async fn discover(&self, limit: usize) -> EngineResult<Vec<String>> {
        Ok(self.tokens.iter().take(limit).cloned().collect())
    }
}

impl TriggerFeed for SimulatedVenue {
    fn subscribe(&self, handler: TriggerHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }
}

impl VenueClient for SimulatedVenue {
    fn submit_order(
        &self,
        args: &VenueOrderArgs,
        _credentials: &Credentials,
    ) -> Result<VenueReceipt, VenueError> {
        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        debug!(token_id = %args.token_id, side = %args.side, size = %args.size, "Simulated venue fill");
        Ok(VenueReceipt {
            venue_order_id: format!("SIM-{}", id),
            filled_size: args.size,
            avg_price: args.price,
        })
    }
}

/// Order book source backed by books set explicitly.
#[derive(Default)]
pub struct StaticBookSource {
    books: RwLock<HashMap<String, OrderBookData>>,
    failing: RwLock<HashSet<String>>,
    fetches: AtomicUsize,
}

impl StaticBookSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a book with the given `(price, size)` levels.
    pub async fn set_book(&self, token_id: &str, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) {
        let to_levels = |levels: &[(Decimal, Decimal)]| {
            levels
                .iter()
                .map(|(p, s)| BookLevel::new(*p, *s))
                .collect::<Vec<_>>()
        };
        let book = OrderBookData {
            token_id: token_id.to_string(),
            bids: to_levels(bids),
            asks: to_levels(asks),
            timestamp: Utc::now(),
        };
        self.books.write().await.insert(token_id.to_string(), book);
    }

    pub async fn remove_book(&self, token_id: &str) {
        self.books.write().await.remove(token_id);
    }

    /// Make fetches for `token_id` fail with a transport error.
    pub async fn fail_token(&self, token_id: &str) {
        self.failing.write().await.insert(token_id.to_string());
    }

    /// Number of `get_orderbook` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderBookSource for StaticBookSource {
    async fn get_orderbook(&self, token_id: &str) -> EngineResult<Option<OrderBookData>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.read().await.contains(token_id) {
            return Err(EngineError::Venue(VenueError::Transport(format!(
                "book fetch failed for {}",
                token_id
            ))));
        }
        Ok(self.books.read().await.get(token_id).cloned())
    }
}

#[async_trait]
impl MarketDiscovery for StaticBookSource {
    async fn discover(&self, limit: usize) -> EngineResult<Vec<String>> {
        let mut tokens: Vec<String> = self.books.read().await.keys().cloned().collect();
        tokens.sort();
        tokens.truncate(limit);
        Ok(tokens)
    }
}
