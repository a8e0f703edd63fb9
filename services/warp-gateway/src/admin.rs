//! Admin and info endpoints
//!
//! - GET  /models, /v1/models      — static list of supported model ids
//! - GET  /health                  — healthy|degraded + account counts
//! - GET  /stats                   — totals and per-account snapshots
//! - GET  /metrics                 — Prometheus text exposition
//! - POST /accounts/reload         — re-read settings + accounts directory
//! - POST /accounts/add            — append and persist one account
//! - POST /accounts/refresh        — serial refresh of due tokens
//! - POST /accounts/delete-blocked — drop every 403-marked account

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use warp_pool::{AccountStore, refresh_all_tokens};

use crate::AppState;
use crate::config::Settings;

/// Model ids the gateway advertises. The upstream resolves anything else to
/// its automatic tier.
pub const SUPPORTED_MODELS: &[&str] = &[
    "claude-4.5-opus",
    "claude-4.5-sonnet",
    "claude-4.1-opus",
    "claude-4-opus",
    "claude-4-sonnet",
    "gpt-5",
    "gpt-4o",
    "o3",
    "gemini-2.5-pro",
    "auto",
];

/// GET /models and /v1/models
pub async fn models() -> impl IntoResponse {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let data: Vec<_> = SUPPORTED_MODELS
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "warp",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// GET /health — degraded iff no account is available.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (available, total) = state.pool.health_counts().await;
    let status = if available == 0 { "degraded" } else { "healthy" };
    Json(json!({
        "status": status,
        "available": available,
        "total": total,
    }))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.stats().await)
}

/// GET /metrics
pub async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// POST /accounts/reload — re-read settings and the accounts directory,
/// then rebuild the pool.
pub async fn reload_accounts(State(state): State<AppState>) -> Response {
    let settings = match Settings::load(&state.config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "failed to reload settings");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("failed to reload settings: {e}")})),
            )
                .into_response();
        }
    };

    let store = AccountStore::new(&settings.accounts_dir);
    let accounts = match store.load_directory(settings.retry_429_interval).await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!(error = %e, "failed to reload accounts directory");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("failed to reload accounts: {e}")})),
            )
                .into_response();
        }
    };

    let count = accounts.len();
    state.pool.reload(accounts, settings.policy()).await;
    *state.settings.write().await = settings;
    info!(accounts = count, "configuration and pool reloaded");
    Json(json!({"status": "reloaded", "accounts": count})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub refresh_token: String,
}

/// POST /accounts/add — append and persist one account.
pub async fn add_account(
    State(state): State<AppState>,
    Json(body): Json<AddAccountRequest>,
) -> Response {
    if body.refresh_token.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "refresh_token must not be empty"})),
        )
            .into_response();
    }

    let name = body.name.unwrap_or_else(|| {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("warp-{timestamp}")
    });

    match state.pool.add_account(name.clone(), body.refresh_token).await {
        Ok(_) => {
            info!(account = %name, "account added via admin API");
            Json(json!({"name": name, "status": "added"})).into_response()
        }
        Err(warp_pool::Error::DuplicateName(name)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("account already exists: {name}")})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// POST /accounts/refresh — serial refresh of every token that needs it.
pub async fn refresh_accounts(State(state): State<AppState>) -> impl IntoResponse {
    let delay = Duration::from_secs(state.settings.read().await.refresh_delay_secs);
    let (refreshed, attempted) =
        refresh_all_tokens(&state.pool, state.upstream.identity(), delay).await;
    Json(json!({"refreshed": refreshed, "attempted": attempted}))
}

/// POST /accounts/delete-blocked — remove every 403-marked account from
/// memory and disk.
pub async fn delete_blocked(State(state): State<AppState>) -> impl IntoResponse {
    let removed = state.pool.delete_blocked().await;
    Json(json!({"removed": removed.len(), "accounts": removed}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_models_include_the_default_tier() {
        assert!(SUPPORTED_MODELS.contains(&"auto"));
        assert!(SUPPORTED_MODELS.contains(&"claude-4.5-sonnet"));
    }
}
