//! Serial token refresh
//!
//! Refreshes every account whose JWT is due, one at a time with a sleep
//! between calls — parallel hits on the identity endpoint trip its rate
//! limiting. Used at startup, on admin reload, and by the batch refresh
//! endpoint.

use std::time::Duration;

use tracing::{info, warn};

use crate::account::AccountStatus;
use crate::pool::Pool;

/// Refresh all accounts that need it. Returns `(succeeded, attempted)`.
pub async fn refresh_all_tokens(
    pool: &Pool,
    client: &reqwest::Client,
    delay_between_requests: Duration,
) -> (usize, usize) {
    let mut due = Vec::new();
    for account in pool.accounts().await {
        if account.read().await.should_refresh_token() {
            due.push(account);
        }
    }

    if due.is_empty() {
        info!("no accounts need token refresh");
        return (0, 0);
    }

    let total = due.len();
    info!(
        count = total,
        delay_secs = delay_between_requests.as_secs_f64(),
        "refreshing tokens serially"
    );

    let mut succeeded = 0usize;
    for (idx, account) in due.iter().enumerate() {
        let (name, refresh_token) = {
            let acc = account.read().await;
            (
                acc.name.clone(),
                acc.refresh_token.as_ref().map(|s| s.expose().clone()),
            )
        };

        match refresh_token {
            None => {
                // The gateway never invents credentials; an account without a
                // refresh token just sits out until one is supplied.
                account
                    .write()
                    .await
                    .mark_error("no refresh token configured");
            }
            Some(token) => match warp_auth::refresh_access_token(client, &token).await {
                Ok(response) => {
                    let jwt = response.bearer().unwrap_or_default().to_string();
                    account
                        .write()
                        .await
                        .install_token(jwt, response.expires_in, response.refresh_token);
                    pool.persist(account).await;
                    succeeded += 1;
                    info!(account = %name, index = idx + 1, total, "token refreshed");
                }
                Err(warp_auth::Error::Blocked(msg)) => {
                    warn!(account = %name, error = %msg, "refresh rejected, marking blocked");
                    account
                        .write()
                        .await
                        .mark_status(AccountStatus::Blocked, "Blocked");
                    pool.persist(account).await;
                }
                Err(warp_auth::Error::RateLimited(msg)) => {
                    warn!(account = %name, error = %msg, "refresh rate limited");
                    account
                        .write()
                        .await
                        .mark_status(AccountStatus::RateLimited, "Too Many Requests");
                    pool.persist(account).await;
                }
                Err(e) => {
                    warn!(account = %name, error = %e, "token refresh failed");
                    account.write().await.mark_error(&e.to_string());
                }
            },
        }

        if idx + 1 < total {
            tokio::time::sleep(delay_between_requests).await;
        }
    }

    info!(succeeded, total, "token refresh completed");
    (succeeded, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::pool::PoolPolicy;
    use crate::store::AccountStore;
    use chrono::{Local, TimeDelta};

    #[tokio::test]
    async fn fresh_tokens_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut account = Account::new("a".into(), Some("rt_a".into()), 60);
        account.jwt_token = Some("jwt".into());
        account.jwt_expires_at = Some(Local::now() + TimeDelta::hours(1));

        let pool = Pool::new(
            vec![account],
            AccountStore::new(dir.path()),
            PoolPolicy::default(),
        );
        let (succeeded, attempted) =
            refresh_all_tokens(&pool, &reqwest::Client::new(), Duration::from_millis(1)).await;
        assert_eq!((succeeded, attempted), (0, 0));
    }

    #[tokio::test]
    async fn missing_refresh_token_counts_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(
            vec![Account::new("a".into(), None, 60)],
            AccountStore::new(dir.path()),
            PoolPolicy::default(),
        );
        let (succeeded, attempted) =
            refresh_all_tokens(&pool, &reqwest::Client::new(), Duration::from_millis(1)).await;
        assert_eq!(succeeded, 0);
        assert_eq!(attempted, 1);

        let account = pool.get("a").await.unwrap();
        assert_eq!(account.read().await.error_count, 1);
    }
}
