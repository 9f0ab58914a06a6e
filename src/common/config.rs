//! Configuration loading for the stakeroom engine
//!
//! TOML file, then `STAKEROOM_*` environment overrides, then validation.

use crate::config::{
    LoggingConfig, LotteryConfig, ReferralConfig, RetryConfig, RoomConfig, ServerConfig, SettlementConfig,
    StakeroomConfig, StorageBackend, StorageConfig, WagerConfig,
};
use crate::errors::{ConfigurationError, EngineResult};
use std::env;
use std::path::Path;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> EngineResult<StakeroomConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            StakeroomConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<StakeroomConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut StakeroomConfig) -> EngineResult<()> {
        if let Ok(host) = env::var("STAKEROOM_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("STAKEROOM_PORT") {
            config.server.port = port.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "STAKEROOM_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(key) = env::var("STAKEROOM_ADMIN_API_KEY") {
            config.server.admin_api_key = Some(key);
        }

        if let Ok(data_dir) = env::var("STAKEROOM_DATA_DIR") {
            config.storage.data_directory = data_dir;
        }
        if let Ok(backend) = env::var("STAKEROOM_STORAGE_BACKEND") {
            config.storage.backend = match backend.to_lowercase().as_str() {
                "rocksdb" => StorageBackend::Rocksdb,
                "memory" => StorageBackend::Memory,
                _ => {
                    return Err(ConfigurationError::InvalidValue {
                        field: "STAKEROOM_STORAGE_BACKEND".to_string(),
                        value: backend,
                        reason: "Expected 'rocksdb' or 'memory'".to_string(),
                    }
                    .into())
                }
            };
        }

        if let Ok(filter) = env::var("STAKEROOM_LOG") {
            config.logging.filter = filter;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &StakeroomConfig) -> EngineResult<()> {
        fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
            ConfigurationError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
                reason: reason.to_string(),
            }
        }

        if config.server.port == 0 {
            return Err(invalid("server.port", 0, "Port cannot be zero").into());
        }
        if config.server.request_timeout_secs == 0 {
            return Err(invalid("server.request_timeout_secs", 0, "Timeout cannot be zero").into());
        }

        if config.storage.backend == StorageBackend::Rocksdb && config.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()).into());
        }

        if config.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", 0, "At least one attempt is required").into());
        }

        let wagers = &config.wagers;
        if wagers.horizons_hours.is_empty() {
            return Err(ConfigurationError::MissingRequired("wagers.horizons_hours".to_string()).into());
        }
        if wagers.horizons_hours.contains(&0) {
            return Err(invalid("wagers.horizons_hours", 0, "Horizon cannot be zero").into());
        }
        if wagers.payout_multiplier_bps < 10_000 {
            return Err(invalid(
                "wagers.payout_multiplier_bps",
                wagers.payout_multiplier_bps,
                "A win must return at least the stake",
            )
            .into());
        }
        if wagers.min_stake == 0 {
            return Err(invalid("wagers.min_stake", 0, "Minimum stake must be positive").into());
        }
        if let Some(max) = wagers.max_stake {
            if max < wagers.min_stake {
                return Err(invalid("wagers.max_stake", max, "Must be >= wagers.min_stake").into());
            }
        }

        let rooms = &config.rooms;
        if rooms.name_max_chars == 0 {
            return Err(invalid("rooms.name_max_chars", 0, "Name limit cannot be zero").into());
        }
        if rooms.default_capacity < 2 {
            return Err(invalid("rooms.default_capacity", rooms.default_capacity, "A room needs two seats").into());
        }
        if rooms.max_capacity < rooms.default_capacity {
            return Err(invalid(
                "rooms.max_capacity",
                rooms.max_capacity,
                "Must be >= rooms.default_capacity",
            )
            .into());
        }
        if rooms.min_reward == 0 {
            return Err(invalid("rooms.min_reward", 0, "Reward must be positive").into());
        }

        let referrals = &config.referrals;
        if referrals.reward_bps >= 10_000 {
            return Err(invalid(
                "referrals.reward_bps",
                referrals.reward_bps,
                "Each level must earn less than the level below",
            )
            .into());
        }
        if referrals.min_bonus == 0 {
            return Err(invalid("referrals.min_bonus", 0, "Minimum bonus must be positive").into());
        }

        if config.lottery.min_stake == 0 {
            return Err(invalid("lottery.min_stake", 0, "Minimum stake must be positive").into());
        }
        if config.lottery.top_limit == 0 {
            return Err(invalid("lottery.top_limit", 0, "Top listing cannot be empty").into());
        }

        if config.settlement.scan_interval_ms == 0 {
            return Err(invalid("settlement.scan_interval_ms", 0, "Scan interval cannot be zero").into());
        }
        if config.settlement.batch_limit == 0 {
            return Err(invalid("settlement.batch_limit", 0, "Batch limit cannot be zero").into());
        }
        if config.settlement.void_after_secs <= 0 {
            return Err(invalid(
                "settlement.void_after_secs",
                config.settlement.void_after_secs,
                "Void delay must be positive",
            )
            .into());
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &StakeroomConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder pattern for creating configurations
pub struct ConfigBuilder {
    config: StakeroomConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StakeroomConfig::default(),
        }
    }

    pub fn server(mut self, server: ServerConfig) -> Self {
        self.config.server = server;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn wagers(mut self, wagers: WagerConfig) -> Self {
        self.config.wagers = wagers;
        self
    }

    pub fn rooms(mut self, rooms: RoomConfig) -> Self {
        self.config.rooms = rooms;
        self
    }

    pub fn referrals(mut self, referrals: ReferralConfig) -> Self {
        self.config.referrals = referrals;
        self
    }

    pub fn lottery(mut self, lottery: LotteryConfig) -> Self {
        self.config.lottery = lottery;
        self
    }

    pub fn settlement(mut self, settlement: SettlementConfig) -> Self {
        self.config.settlement = settlement;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn build(self) -> StakeroomConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> EngineResult<()> {
    ConfigLoader::new().save(&StakeroomConfig::default(), path)
}
