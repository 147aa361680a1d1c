use thiserror::Error;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum QuorumError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Bus / store reachability
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Ledger unavailable after {attempts} attempts: {reason}")]
    LedgerUnavailable { attempts: u32, reason: String },

    #[error("Bus closed: {0}")]
    BusClosed(String),

    // Message errors
    #[error("Malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    // Aggregation errors
    #[error("Quorum not met: {reported} of {required} producers reported")]
    QuorumNotMet { reported: usize, required: usize },

    #[error("Cycle timeout: {0}")]
    CycleTimeout(String),

    // Order execution errors
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order timeout: {0}")]
    OrderTimeout(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Version conflict on {entity}: expected {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: i64,
        found: i64,
    },

    // Collaborator errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl QuorumError {
    /// Failures worth retrying with backoff (store or bus momentarily unreachable)
    pub fn is_transient(&self) -> bool {
        match self {
            QuorumError::TransientIo(_) => true,
            QuorumError::Database(e) => {
                matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
            }
            _ => false,
        }
    }

    /// Failures after which an agent must stop acting on ledger state
    pub fn is_fatal(&self) -> bool {
        matches!(self, QuorumError::LedgerUnavailable { .. })
    }
}

/// Result type alias for QuorumError
pub type Result<T> = std::result::Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(QuorumError::TransientIo("broker down".into()).is_transient());
        assert!(QuorumError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!QuorumError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!QuorumError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_fatal_only_for_exhausted_ledger() {
        let fatal = QuorumError::LedgerUnavailable {
            attempts: 5,
            reason: "connection refused".into(),
        };
        assert!(fatal.is_fatal());
        assert!(!QuorumError::QuorumNotMet {
            reported: 1,
            required: 3
        }
        .is_fatal());
    }
}
