//! Shared domain types
//!
//! Identifiers, amounts and the small enums that cross module boundaries.

use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monetary amount in minor currency units
pub type Amount = u64;

/// Price in integer minor units of the quote currency
pub type Price = u64;

pub type AccountId = String;
pub type WagerId = String;
pub type RoomId = String;
pub type ReservationId = String;

const MAX_ACCOUNT_ID_LEN: usize = 64;

/// Reject empty or oversized account identifiers and key separators
pub fn validate_account_id(account_id: &str) -> EngineResult<()> {
    if account_id.is_empty() {
        return Err(EngineError::invalid("account id must not be empty"));
    }
    if account_id.len() > MAX_ACCOUNT_ID_LEN {
        return Err(EngineError::invalid(format!(
            "account id longer than {} bytes",
            MAX_ACCOUNT_ID_LEN
        )));
    }
    if account_id.contains(|c: char| c == '|' || c.is_control()) {
        return Err(EngineError::invalid("account id contains a reserved character"));
    }
    Ok(())
}

/// Coin symbols are upper-cased ASCII alphanumerics ("BTC", "TON")
pub fn normalize_coin(symbol: &str) -> EngineResult<String> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() || trimmed.len() > 16 || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::invalid(format!("unsupported coin symbol '{}'", symbol)));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Predicted price direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Up wins on a flat or rising price, Down only on a strictly falling one
    pub fn wins(self, entry: Price, outcome: Price) -> bool {
        match self {
            Direction::Up => outcome >= entry,
            Direction::Down => outcome < entry,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Evaluation window of a prediction bet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Horizon {
    pub hours: u32,
}

impl Horizon {
    pub fn hours(hours: u32) -> Self {
        Self { hours }
    }

    pub fn duration(&self) -> Duration {
        Duration::hours(i64::from(self.hours))
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.hours)
    }
}

/// Game played in a room; gameplay itself is resolved outside the engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    #[default]
    Blackjack,
    Dice,
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKind::Blackjack => write!(f, "blackjack"),
            RoomKind::Dice => write!(f, "dice"),
        }
    }
}

/// External market price for a coin at a timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceSample {
    pub coin: String,
    pub price: Price,
    pub at: DateTime<Utc>,
}

/// Multiply an amount by a basis-point factor, rejecting overflow
pub fn apply_bps(amount: Amount, bps: u64) -> EngineResult<Amount> {
    let scaled = u128::from(amount) * u128::from(bps) / 10_000;
    Amount::try_from(scaled).map_err(|_| EngineError::invalid("payout overflows the amount range"))
}
