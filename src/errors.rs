//! Error types for the stakeroom engine
//!
//! One root enum carries the request-level taxonomy. Storage and configuration
//! failures keep their own enums so callers can tell a rejected request from a
//! system fault.

use thiserror::Error;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Available balance (balance minus held reservations) is below the request
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },

    /// Malformed amount, reward, name, deadline or identifier
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Room {0} is full")]
    RoomFull(String),

    #[error("Room {0} is not open")]
    RoomNotOpen(String),

    /// An open wager already exists for the same account, subject and deadline
    #[error("Duplicate wager: {0} is already open on this window")]
    DuplicateWager(String),

    #[error("Unknown {kind}: {id}")]
    UnknownEntity { kind: EntityKind, id: String },

    /// Terminal transition already applied; retried settlement treats this as success
    #[error("{0} is already settled")]
    AlreadySettled(String),

    /// Transition not allowed from the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transient storage failure: {0}")]
    TransientStorageFailure(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Entity kinds referenced by `UnknownEntity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Account,
    Reservation,
    Wager,
    Room,
    Coin,
    Deposit,
    Lottery,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Account => "account",
            EntityKind::Reservation => "reservation",
            EntityKind::Wager => "wager",
            EntityKind::Room => "room",
            EntityKind::Coin => "coin",
            EntityKind::Deposit => "deposit",
            EntityKind::Lottery => "lottery round",
        };
        f.write_str(name)
    }
}

/// Storage system errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Backend temporarily unable to serve the request
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database open failed: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::WriteFailed(_))
    }
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

impl EngineError {
    pub fn unknown(kind: EntityKind, id: impl Into<String>) -> Self {
        EngineError::UnknownEntity { kind, id: id.into() }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    /// Only transient storage failures are retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStorageFailure(_))
    }

    /// Rejected request rather than a system fault
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientFunds { .. }
                | EngineError::InvalidInput(_)
                | EngineError::RoomFull(_)
                | EngineError::RoomNotOpen(_)
                | EngineError::DuplicateWager(_)
                | EngineError::UnknownEntity { .. }
                | EngineError::InvalidState(_)
        )
    }

    /// Stable machine-readable code used in API responses and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::RoomFull(_) => "ROOM_FULL",
            EngineError::RoomNotOpen(_) => "ROOM_NOT_OPEN",
            EngineError::DuplicateWager(_) => "DUPLICATE_WAGER",
            EngineError::UnknownEntity { .. } => "UNKNOWN_ENTITY",
            EngineError::AlreadySettled(_) => "ALREADY_SETTLED",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::TransientStorageFailure(_) => "TRANSIENT_STORAGE_FAILURE",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            EngineError::TransientStorageFailure(e.to_string())
        } else {
            EngineError::Storage(e)
        }
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupted(e.to_string())
    }
}

// Convenience type alias for Results
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::InsufficientFunds {
            requested: 50,
            available: 10,
        };
        assert!(err.to_string().contains("requested 50"));
        assert!(err.to_string().contains("available 10"));

        let err = EngineError::unknown(EntityKind::Room, "r-1");
        assert_eq!(err.to_string(), "Unknown room: r-1");
    }

    #[test]
    fn test_transient_storage_maps_to_retryable() {
        let err: EngineError = StorageError::Unavailable("busy".to_string()).into();
        assert!(err.is_retryable());
        assert!(!err.is_rejection());

        let err: EngineError = StorageError::Corrupted("bad json".to_string()).into();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "STORAGE_ERROR");
    }

    #[test]
    fn test_validation_errors_are_rejections() {
        assert!(EngineError::invalid("bad").is_rejection());
        assert!(EngineError::RoomFull("r".to_string()).is_rejection());
        assert!(!EngineError::AlreadySettled("w".to_string()).is_rejection());
        assert!(!EngineError::RoomFull("r".to_string()).is_retryable());
    }

    #[test]
    fn test_configuration_error_conversion() {
        let err: EngineError = ConfigurationError::MissingRequired("storage.data_directory".to_string()).into();
        match err {
            EngineError::Configuration(_) => {}
            _ => panic!("Expected configuration error"),
        }
    }
}
