//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every account is disabled, blocked, cooling down or out of quota.
    #[error("no available account")]
    NoAvailableAccount,

    #[error("account already exists: {0}")]
    DuplicateName(String),

    #[error("account store I/O error: {0}")]
    Io(String),

    #[error("account record parse error: {0}")]
    Parse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
