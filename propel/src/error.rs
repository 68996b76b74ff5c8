use propel_execution::{AccountId, PositionId};
use thiserror::Error;

/// Top-level errors raised while building or running the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("data feed error: {0}")]
    Data(#[from] propel_data::error::DataError),

    #[error("socket error: {0}")]
    Socket(#[from] propel_integration::error::SocketError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("account {0} is poisoned pending admin review")]
    AccountPoisoned(AccountId),

    #[error("invariant violated for position {position}: {detail}")]
    InvariantViolated {
        position: PositionId,
        detail: String,
    },
}

/// Store-of-record errors. Timeouts and IO surface as `Transient` so callers can distinguish
/// retryable failures from constraint violations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store timeout after {0}ms")]
    Timeout(u64),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("row not found: {0}")]
    NotFound(String),
}

impl PersistError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistError::Timeout(_) | PersistError::Transient(_))
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => PersistError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PersistError::UniqueViolation(db.to_string())
            }
            sqlx::Error::PoolTimedOut => PersistError::Timeout(2_000),
            other => PersistError::Transient(other.to_string()),
        }
    }
}

/// Shared-cache errors. Every cache failure is treated as an availability problem: callers
/// fall back to local state and reconverge when the cache returns.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache timeout after {0}ms")]
    Timeout(u64),

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_timeout() {
            CacheError::Timeout(1_000)
        } else {
            CacheError::Unavailable(error.to_string())
        }
    }
}
