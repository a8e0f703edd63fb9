//! Account record and health state machine
//!
//! An account is one upstream credential plus its health and quota state.
//! Durable fields round-trip through [`DurableRecord`]; everything else is
//! volatile and discarded on restart.
//!
//! Status transitions:
//! - None → RateLimited on upstream 429 (request or token refresh)
//! - None → Blocked on upstream 403
//! - None → QuotaExhausted on quota phrases or used ≥ limit
//! - RateLimited → None once the retry interval has elapsed (lazy, at query)
//! - QuotaExhausted → None at the first instant of the next month (lazy)
//! - Blocked only clears via admin deletion or manual re-enable

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeDelta, TimeZone};
use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Minutes of safety buffer before JWT expiry at which a refresh is due.
pub const JWT_REFRESH_BUFFER_MINUTES: i64 = 10;

/// Upstream HTTP call timeout.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// An account shared between the selector and in-flight dispatcher tasks.
pub type SharedAccount = Arc<tokio::sync::RwLock<Account>>;

/// Persisted status tag. The closed set mirrors what lands in the account
/// file: `"403"`, `"429"` or `"quota_exceeded"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Blocked,
    RateLimited,
    QuotaExhausted,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Blocked => "403",
            AccountStatus::RateLimited => "429",
            AccountStatus::QuotaExhausted => "quota_exceeded",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "403" => Some(AccountStatus::Blocked),
            "429" => Some(AccountStatus::RateLimited),
            "quota_exceeded" => Some(AccountStatus::QuotaExhausted),
            _ => None,
        }
    }
}

/// The durable subset of an account, exactly as written to its JSON file.
/// Optional fields are omitted when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableRecord {
    pub name: String,
    pub refresh_token: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<String>,
}

/// One upstream credential plus its health and quota state.
pub struct Account {
    // Durable
    pub name: String,
    pub refresh_token: Option<Secret<String>>,
    pub enabled: bool,
    pub status_code: Option<AccountStatus>,
    pub last_refreshed: Option<DateTime<Local>>,
    pub last_attempt: Option<DateTime<Local>>,

    // Volatile (memory only)
    pub jwt_token: Option<String>,
    pub jwt_expires_at: Option<DateTime<Local>>,
    pub is_logged_in: bool,
    pub quota_limit: u64,
    pub quota_used: u64,
    pub quota_reset_date: Option<DateTime<Local>>,
    pub last_used: Option<DateTime<Local>>,
    pub request_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub active_task_id: Option<String>,

    /// Minutes after a 429 mark before the account re-enters the pool.
    pub retry_429_interval: i64,

    session_http: Option<reqwest::Client>,
}

impl Account {
    pub fn new(name: String, refresh_token: Option<String>, retry_429_interval: i64) -> Self {
        Self {
            name,
            refresh_token: refresh_token.map(Secret::new),
            enabled: true,
            status_code: None,
            last_refreshed: None,
            last_attempt: None,
            jwt_token: None,
            jwt_expires_at: None,
            is_logged_in: false,
            quota_limit: 0,
            quota_used: 0,
            quota_reset_date: None,
            last_used: None,
            request_count: 0,
            error_count: 0,
            last_error: None,
            active_task_id: None,
            retry_429_interval,
            session_http: None,
        }
    }

    /// Rebuild an account from its durable record. JWT state always starts
    /// empty; a persisted 429 keeps its `last_attempt` so the retry window
    /// survives restarts.
    pub fn from_record(record: DurableRecord, retry_429_interval: i64) -> Self {
        let mut account = Self::new(record.name, record.refresh_token, retry_429_interval);
        account.enabled = record.enabled;
        account.status_code = record.status_code.as_deref().and_then(AccountStatus::parse);
        account.last_refreshed = record.last_refreshed.as_deref().and_then(parse_timestamp);
        account.last_attempt = record.last_attempt.as_deref().and_then(parse_timestamp);
        if account.status_code == Some(AccountStatus::QuotaExhausted) {
            account.quota_reset_date = Some(first_of_next_month(Local::now()));
        }
        account
    }

    /// The durable subset for persistence.
    pub fn to_record(&self) -> DurableRecord {
        DurableRecord {
            name: self.name.clone(),
            refresh_token: self.refresh_token.as_ref().map(|s| s.expose().clone()),
            enabled: self.enabled,
            status_code: self.status_code.map(|s| s.as_str().to_string()),
            last_refreshed: self.last_refreshed.map(|t| t.to_rfc3339()),
            last_attempt: self.last_attempt.map(|t| t.to_rfc3339()),
        }
    }

    /// Whether the JWT is missing, expired, or expiring within the buffer.
    pub fn jwt_expired(&self, buffer_minutes: i64) -> bool {
        match (&self.jwt_token, self.jwt_expires_at) {
            (Some(_), Some(expires)) => Local::now() + TimeDelta::minutes(buffer_minutes) >= expires,
            _ => true,
        }
    }

    /// Whether a token refresh is due: no valid JWT, or one expiring within
    /// the 10-minute buffer. Disabled accounts are never refreshed.
    pub fn should_refresh_token(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.jwt_expired(JWT_REFRESH_BUFFER_MINUTES)
    }

    /// The sole predicate the selector consults. Lazy recovery: a 429 mark
    /// clears once the retry interval has elapsed, a quota mark clears (and
    /// zeroes `quota_used`) once the monthly reset instant has passed.
    pub fn is_available(&mut self) -> bool {
        self.is_available_at(Local::now())
    }

    pub fn is_available_at(&mut self, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }

        if self.status_code == Some(AccountStatus::QuotaExhausted)
            && let Some(reset) = self.quota_reset_date
            && now >= reset
        {
            info!(account = %self.name, "monthly quota reset reached, clearing quota status");
            self.status_code = None;
            self.quota_used = 0;
            self.quota_reset_date = None;
        }

        match self.status_code {
            None => true,
            Some(AccountStatus::Blocked) => false,
            Some(AccountStatus::QuotaExhausted) => false,
            Some(AccountStatus::RateLimited) => match self.last_attempt {
                Some(attempt) => {
                    let elapsed = now.signed_duration_since(attempt);
                    if elapsed >= TimeDelta::minutes(self.retry_429_interval) {
                        info!(
                            account = %self.name,
                            interval_min = self.retry_429_interval,
                            "429 retry interval elapsed, allowing retry"
                        );
                        self.status_code = None;
                        self.last_attempt = None;
                        true
                    } else {
                        false
                    }
                }
                // A 429 tag without a timestamp cannot age out; allow a retry.
                None => {
                    self.status_code = None;
                    true
                }
            },
        }
    }

    pub fn quota_remaining(&self) -> u64 {
        self.quota_limit.saturating_sub(self.quota_used)
    }

    /// Record a successful upstream POST.
    pub fn mark_used(&mut self) {
        self.last_used = Some(Local::now());
        self.request_count += 1;
        self.quota_used += 1;
    }

    pub fn mark_error(&mut self, error: &str) {
        self.error_count += 1;
        self.last_error = Some(error.to_string());
        warn!(account = %self.name, error, "account error");
    }

    /// Tag the account after an upstream 403 or 429. `last_attempt` feeds
    /// the 429 recovery window.
    pub fn mark_status(&mut self, status: AccountStatus, description: &str) {
        self.status_code = Some(status);
        self.last_error = Some(format!("{} {description}", status.as_str()));
        self.last_attempt = Some(Local::now());
        warn!(account = %self.name, status = status.as_str(), description, "account marked");
    }

    /// Tag the account quota-exhausted until the first instant of the next
    /// calendar month.
    pub fn mark_quota_exceeded(&mut self) {
        let now = Local::now();
        let reset = first_of_next_month(now);
        self.status_code = Some(AccountStatus::QuotaExhausted);
        self.quota_reset_date = Some(reset);
        warn!(
            account = %self.name,
            reset = %reset.format("%Y-%m-%d"),
            "quota exceeded, will reset at start of next month"
        );
    }

    pub fn mark_token_refreshed(&mut self) {
        self.last_refreshed = Some(Local::now());
    }

    /// Install a freshly issued JWT and optionally a rotated refresh token.
    pub fn install_token(&mut self, jwt: String, expires_in_secs: u64, rotated_refresh: Option<String>) {
        self.jwt_token = Some(jwt);
        self.jwt_expires_at = Some(Local::now() + TimeDelta::seconds(expires_in_secs as i64));
        if let Some(rotated) = rotated_refresh {
            self.refresh_token = Some(Secret::new(rotated));
        }
        self.mark_token_refreshed();
    }

    /// The per-account HTTP handle used for login and AI streaming. Built
    /// lazily with a cookie store (login cookies must ride on AI calls) and
    /// HTTP/1.1 only — h2 flow control buffers small SSE events. Connect and
    /// idle-read are bounded; there is no whole-request deadline, so a long
    /// stream is never cut off mid-response.
    pub fn session_client(&mut self, insecure_tls: bool) -> reqwest::Result<reqwest::Client> {
        if let Some(client) = &self.session_http {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .http1_only()
            .cookie_store(true)
            .connect_timeout(UPSTREAM_TIMEOUT)
            .read_timeout(UPSTREAM_TIMEOUT)
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;
        self.session_http = Some(client.clone());
        Ok(client)
    }

    /// Drop the session handle and cookies; the next call rebuilds them.
    pub fn reset_session(&mut self) {
        self.session_http = None;
        self.is_logged_in = false;
    }

    /// Status snapshot for `/stats`. Never exposes tokens.
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "enabled": self.enabled,
            "status_code": self.status_code.map(|s| s.as_str()),
            "is_logged_in": self.is_logged_in,
            "quota_limit": self.quota_limit,
            "quota_used": self.quota_used,
            "quota_remaining": self.quota_remaining(),
            "quota_reset_date": self.quota_reset_date.map(|t| t.to_rfc3339()),
            "request_count": self.request_count,
            "error_count": self.error_count,
            "last_used": self.last_used.map(|t| t.to_rfc3339()),
            "last_error": self.last_error,
            "jwt_expired": self.jwt_expired(JWT_REFRESH_BUFFER_MINUTES),
            "last_refreshed": self.last_refreshed.map(|t| t.to_rfc3339()),
            "last_attempt": self.last_attempt.map(|t| t.to_rfc3339()),
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Local))
        .ok()
}

/// First instant of the calendar month after `now`, local time.
pub fn first_of_next_month(now: DateTime<Local>) -> DateTime<Local> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Local
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .earliest()
        .unwrap_or_else(|| now + TimeDelta::days(31))
}
