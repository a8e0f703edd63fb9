//! Retry/failover controller
//!
//! Retry decisions ride on explicit result tags, not exceptions: every inner
//! step returns a [`StepError`] and the loop in [`dispatch_chat`] is an
//! ordinary bounded loop — at most three attempts, one selection per
//! attempt. Only account-scoped faults (403/429/quota/prepare failure) and
//! transient network errors are retried; anything else surfaces immediately.

use tracing::{info, warn};

use warp_pool::{Pool, SharedAccount};

use crate::client::{ChatTurn, UpstreamClient};
use crate::metrics;

/// Maximum upstream attempts per client request, across distinct accounts.
pub const MAX_ATTEMPTS: usize = 3;

/// Quota-exhaustion phrases in upstream error bodies.
pub const QUOTA_PHRASES: &[&str] = &["No remaining quota", "No AI requests remaining"];

/// Outcome tag of one dispatch step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Timeout or connection fault; account state untouched.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Upstream 403; the account was marked Blocked.
    #[error("account blocked: {0}")]
    Blocked(String),

    /// Upstream 429; the account was marked RateLimited.
    #[error("account rate limited: {0}")]
    RateLimited(String),

    /// Quota phrases in the body; the account was marked QuotaExhausted.
    #[error("account quota exhausted: {0}")]
    QuotaExhausted(String),

    /// The account could not be made ready (refresh/login failure that is
    /// not a 403/429).
    #[error("account preparation failed: {0}")]
    Prepare(String),

    /// Not account-scoped; retrying another account would not help.
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    /// Whether the fault was pinned on the account that served it.
    pub fn account_scoped(&self) -> bool {
        matches!(
            self,
            StepError::Blocked(_)
                | StepError::RateLimited(_)
                | StepError::QuotaExhausted(_)
                | StepError::Prepare(_)
        )
    }

    /// Whether another attempt may succeed.
    pub fn retryable(&self) -> bool {
        self.account_scoped() || matches!(self, StepError::Transient(_))
    }

    /// Metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Transient(_) => "transient",
            StepError::Blocked(_) => "blocked",
            StepError::RateLimited(_) => "rate_limited",
            StepError::QuotaExhausted(_) => "quota_exhausted",
            StepError::Prepare(_) => "prepare",
            StepError::Fatal(_) => "fatal",
        }
    }
}

/// Classify a non-200 AI response. 403 and 429 map directly; quota phrases
/// in any body mark quota exhaustion; everything else is worth retrying but
/// carries no account mark.
pub fn classify_upstream_failure(status: u16, body: &str) -> StepError {
    match status {
        403 => StepError::Blocked(body.to_string()),
        429 => StepError::RateLimited(body.to_string()),
        _ if QUOTA_PHRASES.iter().any(|p| body.contains(p)) => {
            StepError::QuotaExhausted(body.to_string())
        }
        _ => StepError::Transient(format!("HTTP {status}: {body}")),
    }
}

/// Terminal dispatch outcome, mapped to an HTTP status by the handlers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No eligible account — HTTP 503.
    #[error("no available account")]
    NoAccount,

    /// All attempts failed — HTTP 500.
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Select → prepare → send, retrying across accounts on retryable faults.
/// Returns the chosen account together with the live 200 response.
pub async fn dispatch_chat(
    pool: &Pool,
    upstream: &UpstreamClient,
    turn: &ChatTurn<'_>,
) -> Result<(SharedAccount, reqwest::Response), DispatchError> {
    let mut last_error: Option<StepError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        let account = match pool.select().await {
            Ok(account) => account,
            Err(_) => {
                return Err(match last_error {
                    Some(e) => DispatchError::Upstream(e.to_string()),
                    None => DispatchError::NoAccount,
                });
            }
        };

        if attempt > 0 {
            metrics::record_failover();
            let account_name = account.read().await.name.clone();
            info!(
                account = %account_name,
                attempt = attempt + 1,
                "retrying with another account"
            );
        }

        match upstream.chat(pool, &account, turn).await {
            Ok(response) => return Ok((account, response)),
            Err(e) => {
                metrics::record_upstream_error(e.kind());
                if e.retryable() {
                    let account_name = account.read().await.name.clone();
                    warn!(
                        account = %account_name,
                        error = %e,
                        attempt = attempt + 1,
                        "attempt failed, will try another account"
                    );
                    last_error = Some(e);
                    continue;
                }
                return Err(DispatchError::Upstream(e.to_string()));
            }
        }
    }

    Err(DispatchError::Upstream(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "all attempts failed".to_string()),
    ))
}
