use thiserror::Error;

/// Main error type for the fleet runtime
#[derive(Error, Debug)]
pub enum FleetError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Lock store errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lock store error: {0}")]
    LockStore(String),

    #[error("Malformed lease for {lock}: {lease_ms}ms")]
    MalformedLease { lock: String, lease_ms: i64 },

    #[error("Lock store call timed out: {op} on {lock}")]
    LockTimeout { op: &'static str, lock: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Collaborator errors
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Reflection failed: {0}")]
    Reflection(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timed out after {elapsed_ms}ms: {what}")]
    Timeout { what: String, elapsed_ms: u64 },

    // Risk management errors
    #[error("Circuit breaker triggered for {entity}: {reason}")]
    CircuitBreakerTriggered { entity: String, reason: String },

    // Batch writer errors
    #[error("Batch writer closed: {0}")]
    WriterClosed(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    /// Whether the error is an infrastructure hiccup that the next scheduled
    /// tick will retry naturally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::Redis(_)
                | FleetError::LockStore(_)
                | FleetError::LockTimeout { .. }
                | FleetError::Database(_)
                | FleetError::Exchange(_)
                | FleetError::Timeout { .. }
                | FleetError::Persistence(_)
        )
    }
}

/// Result type alias for FleetError
pub type Result<T> = std::result::Result<T, FleetError>;
