//! Venue-facing data types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order time-in-force as understood by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    /// Fill-or-kill: fills immediately in full or not at all
    Fok,
    /// Good-till-cancelled resting quote
    Gtc,
    /// Aggressive marketable order used for exits
    Market,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Fok => write!(f, "FOK"),
            OrderKind::Gtc => write!(f, "GTC"),
            OrderKind::Market => write!(f, "MARKET"),
        }
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Raw order book as returned by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookData {
    pub token_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

/// Arguments handed to the venue's blocking submit call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VenueOrderArgs {
    pub token_id: String,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Decimal,
    pub size: Decimal,
}

/// Venue acknowledgement for a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueReceipt {
    pub venue_order_id: String,
    /// Size filled at submission time (zero for a resting quote)
    pub filled_size: Decimal,
    pub avg_price: Decimal,
}

/// Decrypted venue credentials.
///
/// Fields are private and `Debug` is redacted so secrets never reach logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
    api_passphrase: String,
    wallet_key: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        api_passphrase: impl Into<String>,
        wallet_key: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            api_passphrase: api_passphrase.into(),
            wallet_key: wallet_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    pub fn api_passphrase(&self) -> &str {
        &self.api_passphrase
    }

    pub fn wallet_key(&self) -> &str {
        &self.wallet_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("api_passphrase", &"<redacted>")
            .field("wallet_key", &"<redacted>")
            .finish()
    }
}

/// Signal category reported by a trigger feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    PriceSpikeUp,
    PriceSpikeDown,
    PriceBreakout,
    VolumeSpike,
    LargeOrder,
    ScoreUpdate,
    NewsEvent,
    SocialSpike,
    SpreadCompression,
    ImbalanceShift,
}

/// External event that may justify a front-running entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedTrigger {
    pub trigger_id: String,
    pub token_id: String,
    pub trigger_type: TriggerType,
    /// Recommended side
    pub direction: Side,
    /// 0.0 to 1.0
    pub confidence: f64,
    /// 0.0 to 1.0
    pub urgency: f64,
    pub expected_move_pct: f64,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl FeedTrigger {
    /// Minimal BUY trigger for `token_id`.
    pub fn new(trigger_id: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            token_id: token_id.into(),
            trigger_type: TriggerType::PriceSpikeUp,
            direction: Side::Buy,
            confidence: 1.0,
            urgency: 1.0,
            expected_move_pct: 0.0,
            source: "manual".to_string(),
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("key-123", "secret-456", "pass-789", "0xwallet");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("key-123"));
        assert!(!printed.contains("secret-456"));
        assert!(!printed.contains("0xwallet"));
        assert_eq!(creds.api_key(), "key-123");
    }

    #[test]
    fn test_side_wire_format() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(OrderKind::Fok.to_string(), "FOK");
    }
}
