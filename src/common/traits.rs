//! Shared traits and interfaces
//!
//! Seams for the collaborators the engine does not own: wall-clock time, the
//! market price feed and the game-result source.

use crate::common::types::{Price, RoomId};
use crate::errors::{EngineError, EntityKind};
use crate::rooms::RoomOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use thiserror::Error;

/// Time source; swapped for `ManualClock` in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Price feed failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// The feed has never quoted this coin
    #[error("Unknown coin: {0}")]
    UnknownCoin(String),

    #[error("Price feed unavailable: {0}")]
    Unavailable(String),
}

impl From<FeedError> for EngineError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::UnknownCoin(coin) => EngineError::unknown(EntityKind::Coin, coin),
            // An unreachable feed is retried like any other transient I/O failure
            FeedError::Unavailable(msg) => EngineError::TransientStorageFailure(format!("price feed: {}", msg)),
        }
    }
}

/// Authoritative market prices
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Latest price at or before `at`, used as a wager's entry price
    async fn spot(&self, coin: &str, at: DateTime<Utc>) -> Result<Option<Price>, FeedError>;

    /// Price in effect at `at`, or `None` while the window is still open
    async fn price_at(&self, coin: &str, at: DateTime<Utc>) -> Result<Option<Price>, FeedError>;
}

/// Source of resolved room games
#[async_trait]
pub trait GameResultSource: Send + Sync {
    /// Outcome for a room whose game has finished, `None` while still playing
    async fn resolved(&self, room_id: &RoomId) -> Result<Option<RoomOutcome>, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_moves_only_on_demand() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::hours(6));
        assert_eq!(clock.now(), start + Duration::hours(6));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
