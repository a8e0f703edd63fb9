//! Per-account upstream session engine
//!
//! Everything between "the selector picked an account" and "bytes are
//! streaming back": making sure the account holds a live JWT and session
//! cookies (`ensure_ready`), POSTing the binary request to the AI endpoint,
//! the seed-session handshake that captures an initial task id, and the
//! split-tool-result mode that sends one request per result.
//!
//! The identity endpoints share one HTTP/2 client; login and AI streaming go
//! through the account's own cookie-carrying HTTP/1.1 client.

use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use warp_auth::{AI_ENDPOINT, CLIENT_ID, CLIENT_VERSION, OS_CATEGORY, OS_NAME, OS_VERSION};
use warp_pool::account::UPSTREAM_TIMEOUT;
use warp_pool::{AccountStatus, Pool, SharedAccount};
use warp_wire::builder::RequestSpec;
use warp_wire::{
    ChatMessage, EventNormalizer, HistoryLimits, SseDecoder, StreamEvent, ToolDef, TurnPlan,
    build_request,
};

use crate::config::Settings;
use crate::dispatch::{StepError, classify_upstream_failure};

/// Per-request knobs snapshotted from the settings.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub disable_warp_tools: bool,
    pub split_toolcall_result: bool,
    pub limits: HistoryLimits,
}

impl ChatOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            disable_warp_tools: settings.disable_warp_tools,
            split_toolcall_result: settings.split_toolcall_result,
            limits: settings.limits(),
        }
    }
}

/// One client turn, ready for dispatch.
pub struct ChatTurn<'a> {
    pub plan: &'a TurnPlan,
    pub model: &'a str,
    pub tools: &'a [ToolDef],
    pub options: ChatOptions,
}

/// Shared upstream plumbing.
pub struct UpstreamClient {
    identity: reqwest::Client,
    insecure_tls: bool,
    show_login_info: bool,
}

/// `WARP_INSECURE_TLS` / `WARP_SHOW_LOGIN_INFO` style boolean flags.
fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl UpstreamClient {
    /// Build from the environment (`WARP_INSECURE_TLS`,
    /// `WARP_SHOW_LOGIN_INFO`).
    pub fn from_env() -> reqwest::Result<Self> {
        let insecure_tls = env_flag("WARP_INSECURE_TLS", false);
        if insecure_tls {
            warn!("TLS verification disabled via WARP_INSECURE_TLS");
        }
        Self::new(insecure_tls, env_flag("WARP_SHOW_LOGIN_INFO", false))
    }

    pub fn new(insecure_tls: bool, show_login_info: bool) -> reqwest::Result<Self> {
        let identity = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;
        Ok(Self {
            identity,
            insecure_tls,
            show_login_info,
        })
    }

    /// The shared identity-endpoint client (token refresh, usage queries).
    pub fn identity(&self) -> &reqwest::Client {
        &self.identity
    }

    /// Refresh the JWT if due, then log in if not logged in. Persistent
    /// failures mark the account so the dispatcher re-selects.
    pub async fn ensure_ready(
        &self,
        pool: &Pool,
        account: &SharedAccount,
    ) -> Result<(), StepError> {
        let (needs_refresh, refresh_token, name) = {
            let acc = account.read().await;
            (
                acc.should_refresh_token(),
                acc.refresh_token.as_ref().map(|s| s.expose().clone()),
                acc.name.clone(),
            )
        };

        if needs_refresh {
            let Some(token) = refresh_token else {
                account
                    .write()
                    .await
                    .mark_error("no refresh token configured");
                return Err(StepError::Prepare(format!(
                    "account '{name}' has no refresh token"
                )));
            };
            match warp_auth::refresh_access_token(&self.identity, &token).await {
                Ok(response) => {
                    let jwt = response.bearer().unwrap_or_default().to_string();
                    let expires_in = response.expires_in;
                    account
                        .write()
                        .await
                        .install_token(jwt, expires_in, response.refresh_token);
                    pool.persist(account).await;
                    info!(account = %name, expires_in, "token refreshed");
                }
                Err(e) => return Err(self.auth_fault(pool, account, e, "token refresh").await),
            }
        }

        if !account.read().await.is_logged_in {
            let (client, jwt) = {
                let mut acc = account.write().await;
                let client = acc
                    .session_client(self.insecure_tls)
                    .map_err(|e| StepError::Prepare(format!("building session client: {e}")))?;
                (client, acc.jwt_token.clone().unwrap_or_default())
            };
            let experiment = warp_auth::generate_experiment_params();
            match warp_auth::client_login(&client, &jwt, &experiment).await {
                Ok(()) => {
                    account.write().await.is_logged_in = true;
                    info!(account = %name, "client login succeeded");
                    if self.show_login_info {
                        self.log_usage(pool, account, &jwt).await;
                    }
                }
                Err(e) => return Err(self.auth_fault(pool, account, e, "login").await),
            }
        }

        Ok(())
    }

    /// Map an identity-plane failure onto the step taxonomy, marking and
    /// persisting the account where the fault is account-scoped.
    async fn auth_fault(
        &self,
        pool: &Pool,
        account: &SharedAccount,
        error: warp_auth::Error,
        operation: &str,
    ) -> StepError {
        match error {
            warp_auth::Error::Blocked(msg) => {
                {
                    let mut acc = account.write().await;
                    acc.mark_status(AccountStatus::Blocked, "Blocked");
                    acc.reset_session();
                }
                pool.persist(account).await;
                StepError::Blocked(format!("{operation}: {msg}"))
            }
            warp_auth::Error::RateLimited(msg) => {
                {
                    let mut acc = account.write().await;
                    acc.mark_status(AccountStatus::RateLimited, "Too Many Requests");
                    acc.reset_session();
                }
                pool.persist(account).await;
                StepError::RateLimited(format!("{operation}: {msg}"))
            }
            warp_auth::Error::Transient(msg) => {
                // Network flake: account state untouched.
                StepError::Transient(format!("{operation}: {msg}"))
            }
            other => {
                account.write().await.mark_error(&other.to_string());
                StepError::Prepare(format!("{operation}: {other}"))
            }
        }
    }

    /// Fetch and record the account's request limits (post-login info).
    async fn log_usage(&self, pool: &Pool, account: &SharedAccount, jwt: &str) {
        match warp_auth::fetch_request_limits(&self.identity, jwt).await {
            Ok(limits) => {
                let mut acc = account.write().await;
                acc.quota_limit = limits.request_limit;
                acc.quota_used = limits.requests_used_since_last_refresh;
                info!(
                    account = %acc.name,
                    limit = limits.request_limit,
                    used = limits.requests_used_since_last_refresh,
                    unlimited = limits.is_unlimited,
                    "request limit info"
                );
                if !limits.is_unlimited && acc.quota_limit > 0 && acc.quota_used >= acc.quota_limit
                {
                    acc.mark_quota_exceeded();
                    drop(acc);
                    pool.persist(account).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch request limit info"),
        }
    }

    /// POST the binary request to the AI endpoint. Non-200 replies are
    /// classified, the account marked and persisted, and the tag returned to
    /// the retry loop. On 200 the account's counters advance and the live
    /// response streams back.
    pub async fn send_ai_request(
        &self,
        pool: &Pool,
        account: &SharedAccount,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, StepError> {
        let (client, jwt) = {
            let mut acc = account.write().await;
            let client = acc
                .session_client(self.insecure_tls)
                .map_err(|e| StepError::Prepare(format!("building session client: {e}")))?;
            (client, acc.jwt_token.clone().unwrap_or_default())
        };

        let response = client
            .post(AI_ENDPOINT)
            .header("x-warp-client-id", CLIENT_ID)
            .header("x-warp-client-version", CLIENT_VERSION)
            .header("x-warp-os-category", OS_CATEGORY)
            .header("x-warp-os-name", OS_NAME)
            .header("x-warp-os-version", OS_VERSION)
            .header("authorization", format!("Bearer {jwt}"))
            .header("accept", "text/event-stream")
            .header("content-type", "application/x-protobuf")
            // Compression buffers small SSE events; ask for identity bytes.
            .header("accept-encoding", "identity")
            .body(body)
            .send()
            .await
            .map_err(|e| StepError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 {
            let text = response.text().await.unwrap_or_default();
            let error = classify_upstream_failure(status.as_u16(), &text);
            self.apply_request_fault(pool, account, &error).await;
            return Err(error);
        }

        account.write().await.mark_used();
        Ok(response)
    }

    async fn apply_request_fault(&self, pool: &Pool, account: &SharedAccount, error: &StepError) {
        match error {
            StepError::Blocked(_) => {
                account
                    .write()
                    .await
                    .mark_status(AccountStatus::Blocked, "Blocked");
                pool.persist(account).await;
            }
            StepError::RateLimited(_) => {
                account
                    .write()
                    .await
                    .mark_status(AccountStatus::RateLimited, "Too Many Requests");
                pool.persist(account).await;
            }
            StepError::QuotaExhausted(_) => {
                account.write().await.mark_quota_exceeded();
                pool.persist(account).await;
            }
            other => {
                account.write().await.mark_error(&other.to_string());
            }
        }
    }

    /// Build and send the upstream request(s) for one turn, returning the
    /// response whose stream is forwarded to the client.
    pub async fn chat(
        &self,
        pool: &Pool,
        account: &SharedAccount,
        turn: &ChatTurn<'_>,
    ) -> Result<reqwest::Response, StepError> {
        self.ensure_ready(pool, account).await?;

        if turn.options.split_toolcall_result && turn.plan.tool_results.len() > 1 {
            return self.chat_split_tool_results(pool, account, turn).await;
        }

        let task_id = account.read().await.active_task_id.clone();
        let spec = RequestSpec {
            user_message: &turn.plan.user_message,
            model: turn.model,
            disable_warp_tools: turn.options.disable_warp_tools,
            history: &turn.plan.history,
            tool_results: &turn.plan.tool_results,
            task_id: task_id.as_deref(),
            tools: turn.tools,
            limits: turn.options.limits,
        };
        let bytes = build_request(&spec).map_err(|e| StepError::Fatal(e.to_string()))?;
        debug!(size = bytes.len(), "sending chat request");
        self.send_ai_request(pool, account, bytes).await
    }

    /// Split mode: one upstream request per tool result, each carrying
    /// progressively more history. Intermediate responses are drained (their
    /// init events advance the task id); only the final response is returned
    /// for forwarding.
    async fn chat_split_tool_results(
        &self,
        pool: &Pool,
        account: &SharedAccount,
        turn: &ChatTurn<'_>,
    ) -> Result<reqwest::Response, StepError> {
        let results = &turn.plan.tool_results;
        let start = results.len().saturating_sub(turn.options.limits.max_tool_results);
        let results = &results[start..];
        info!(
            count = results.len(),
            "sending tool results as separate requests"
        );

        let mut history = turn.plan.history.to_vec();
        for (idx, result) in results.iter().enumerate() {
            let is_last = idx + 1 == results.len();
            history.push(ChatMessage::tool(
                result.tool_call_id.clone(),
                result.content.clone(),
            ));

            let task_id = account.read().await.active_task_id.clone();
            let spec = RequestSpec {
                user_message: if is_last { &turn.plan.user_message } else { "" },
                model: turn.model,
                disable_warp_tools: turn.options.disable_warp_tools,
                history: &history,
                tool_results: &[],
                task_id: task_id.as_deref(),
                tools: turn.tools,
                limits: turn.options.limits,
            };
            let bytes = build_request(&spec).map_err(|e| StepError::Fatal(e.to_string()))?;
            let response = self.send_ai_request(pool, account, bytes).await?;

            if is_last {
                return Ok(response);
            }
            debug!(index = idx + 1, total = results.len(), "draining intermediate tool-result response");
            self.drain_response(account, response).await;
        }

        Err(StepError::Fatal("no tool results to send".into()))
    }

    /// Consume a response stream without forwarding it, applying init events
    /// to the account's task id.
    pub async fn drain_response(&self, account: &SharedAccount, response: reqwest::Response) {
        let mut decoder = SseDecoder::new();
        let mut normalizer = EventNormalizer::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "upstream stream error while draining");
                    break;
                }
            };
            for event in decoder.push(&chunk) {
                for normalized in normalizer.normalize(&event) {
                    if let StreamEvent::Init { conversation_id } = normalized {
                        account.write().await.active_task_id = Some(conversation_id);
                    }
                }
            }
            if decoder.is_done() {
                break;
            }
        }
        if let Some(event) = decoder.finish() {
            for normalized in normalizer.normalize(&event) {
                if let StreamEvent::Init { conversation_id } = normalized {
                    account.write().await.active_task_id = Some(conversation_id);
                }
            }
        }
    }

    /// Seed-session handshake: a one-off "Hello" chat whose first init event
    /// provides the account's task id.
    pub async fn initialize_session(
        &self,
        pool: &Pool,
        account: &SharedAccount,
    ) -> Result<bool, StepError> {
        if account.read().await.active_task_id.is_some() {
            return Ok(true);
        }
        self.ensure_ready(pool, account).await?;

        let spec = RequestSpec {
            user_message: "Hello",
            model: "auto",
            disable_warp_tools: false,
            history: &[],
            tool_results: &[],
            task_id: None,
            tools: &[],
            limits: HistoryLimits::default(),
        };
        let bytes = build_request(&spec).map_err(|e| StepError::Fatal(e.to_string()))?;
        let response = self.send_ai_request(pool, account, bytes).await?;
        self.drain_response(account, response).await;

        Ok(account.read().await.active_task_id.is_some())
    }

    /// Serial session initialization for every enabled account without a
    /// task id, spaced out like the serial refresh.
    pub async fn initialize_all_sessions(&self, pool: &Pool, delay: Duration) {
        let mut pending = Vec::new();
        for account in pool.accounts().await {
            let acc = account.read().await;
            if acc.enabled && acc.active_task_id.is_none() {
                drop(acc);
                pending.push(account);
            }
        }
        if pending.is_empty() {
            info!("no accounts need session initialization");
            return;
        }

        let total = pending.len();
        info!(count = total, "initializing sessions serially");
        let mut succeeded = 0usize;
        for (idx, account) in pending.iter().enumerate() {
            let name = account.read().await.name.clone();
            match self.initialize_session(pool, account).await {
                Ok(true) => {
                    succeeded += 1;
                    info!(account = %name, index = idx + 1, total, "session initialized");
                }
                Ok(false) => warn!(account = %name, "no task id captured during session init"),
                Err(e) => warn!(account = %name, error = %e, "session initialization failed"),
            }
            if idx + 1 < total {
                tokio::time::sleep(delay).await;
            }
        }
        info!(succeeded, total, "session initialization completed");
    }
}
