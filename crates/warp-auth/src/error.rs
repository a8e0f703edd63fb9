//! Error types for identity operations
//!
//! The variants double as the account-scoped fault classification the
//! dispatcher consumes: `Blocked`/`RateLimited` mark the account, `Transient`
//! never mutates account state.

/// Errors from identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Upstream returned 403; the account is banned until manual action.
    #[error("account blocked (403): {0}")]
    Blocked(String),

    /// Upstream returned 429; the account re-enters the pool after the
    /// configured retry interval.
    #[error("rate limited (429): {0}")]
    RateLimited(String),

    /// Timeout or connect failure; account state must not change.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Any other non-success upstream reply.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The reply was 2xx but not in the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Fold a reqwest transport error into the taxonomy. Timeouts and
    /// connection failures are transient; everything else is an upstream
    /// fault.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Transient(err.to_string())
        } else {
            Error::Upstream(err.to_string())
        }
    }

    /// Map a non-success HTTP status plus body to the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            403 => Error::Blocked(body),
            429 => Error::RateLimited(body),
            _ => Error::Upstream(format!("HTTP {status}: {body}")),
        }
    }
}

/// Result alias for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_403_maps_to_blocked() {
        assert!(matches!(
            Error::from_status(403, "forbidden".into()),
            Error::Blocked(_)
        ));
    }

    #[test]
    fn status_429_maps_to_rate_limited() {
        assert!(matches!(
            Error::from_status(429, "slow down".into()),
            Error::RateLimited(_)
        ));
    }

    #[test]
    fn other_statuses_map_to_upstream() {
        assert!(matches!(
            Error::from_status(500, "boom".into()),
            Error::Upstream(_)
        ));
        assert!(matches!(
            Error::from_status(400, "bad".into()),
            Error::Upstream(_)
        ));
    }
}
