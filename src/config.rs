//! Configuration with defaults
//!
//! Every section has a `Default` so a missing TOML table falls back to the
//! production values below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeroomConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub wagers: WagerConfig,
    pub rooms: RoomConfig,
    pub referrals: ReferralConfig,
    pub lottery: LotteryConfig,
    pub settlement: SettlementConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Required by every operator endpoint; without it they all reject
    pub admin_api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
            admin_api_key: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Rocksdb,
    Memory,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_directory: String,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Rocksdb,
            data_directory: "./DB/stakeroom".to_string(),
            clear_on_start: false,
        }
    }
}

/// Bounded backoff for transient storage failures
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 25,
            max_backoff_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Prediction bet product configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WagerConfig {
    /// Allowed evaluation windows
    pub horizons_hours: Vec<u32>,
    /// Payout on a win as basis points of the stake (20_000 = 2x)
    pub payout_multiplier_bps: u64,
    pub min_stake: u64,
    pub max_stake: Option<u64>,
}

impl Default for WagerConfig {
    fn default() -> Self {
        Self {
            horizons_hours: vec![6, 12, 24, 48],
            payout_multiplier_bps: 20_000,
            min_stake: 1,
            max_stake: None,
        }
    }
}

impl WagerConfig {
    pub fn max_horizon_hours(&self) -> u32 {
        self.horizons_hours.iter().copied().max().unwrap_or(0)
    }
}

/// Multiplayer room configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub name_max_chars: usize,
    pub default_capacity: usize,
    pub max_capacity: usize,
    pub min_reward: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name_max_chars: 20,
            default_capacity: 2,
            max_capacity: 8,
            min_reward: 1,
        }
    }
}

/// Referral bonus accrual on confirmed deposits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    /// Share of the amount passed one level up, in basis points (250 = 2.5%)
    pub reward_bps: u64,
    /// Accrual stops once a level's bonus falls below this
    pub min_bonus: u64,
    /// Referrer levels paid per deposit
    pub max_depth: usize,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            reward_bps: 250,
            min_bonus: 5,
            max_depth: 8,
        }
    }
}

/// Lottery pot
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LotteryConfig {
    pub min_stake: u64,
    /// Entries returned by the top listing
    pub top_limit: usize,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            min_stake: 1,
            top_limit: 10,
        }
    }
}

/// Settlement engine scheduling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub scan_interval_ms: u64,
    pub batch_limit: usize,
    /// Due wagers still without an outcome price this long after their deadline are voided
    pub void_after_secs: i64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 1_000,
            batch_limit: 256,
            void_after_secs: 86_400,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "stakeroom=info,tower_http=info".to_string(),
        }
    }
}

impl StakeroomConfig {
    /// In-memory configuration for tests and local experiments
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.storage.backend = StorageBackend::Memory;
        config.retry.base_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        config.settlement.scan_interval_ms = 50;
        config
    }
}
