//! Chat-completion routes
//!
//! `/v1/chat/completions` (OpenAI shape) and `/v1/messages` (Anthropic
//! shape), streaming and unary. A dispatched upstream response is bridged
//! into the client's SSE dialect by a spawned translation task feeding an
//! mpsc channel; dropping the client side of the channel tears the whole
//! chain down, including the upstream body read.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use warp_adapters::anthropic::{self, AnthropicMessagesRequest, AnthropicStreamAdapter};
use warp_adapters::openai::{self, OpenAiChatRequest, OpenAiStreamAdapter};
use warp_adapters::{anthropic_error_body, openai_error_body};
use warp_pool::SharedAccount;
use warp_wire::{EventNormalizer, SseDecoder, StreamEvent, TurnPlan};

use crate::client::{ChatOptions, ChatTurn};
use crate::dispatch::{DispatchError, dispatch_chat};
use crate::metrics;
use crate::AppState;

fn openai_error(status: StatusCode, message: &str, error_type: &str) -> Response {
    metrics::record_request("openai", status.as_u16());
    (
        status,
        Json(openai_error_body(message, error_type, status.as_str())),
    )
        .into_response()
}

fn anthropic_error(status: StatusCode, message: &str) -> Response {
    metrics::record_request("anthropic", status.as_u16());
    (status, Json(anthropic_error_body(message))).into_response()
}

/// POST /v1/chat/completions (and /warp/v1/chat/completions)
#[axum::debug_handler]
pub async fn openai_chat(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request: OpenAiChatRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request: {e}"),
                "invalid_request_error",
            );
        }
    };

    let messages = request.chat_messages();
    let plan = match TurnPlan::from_messages(&messages) {
        Ok(plan) => plan,
        Err(e) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                &e.to_string(),
                "invalid_request_error",
            );
        }
    };
    let tools = request.tool_defs();
    let options = ChatOptions::from_settings(&*state.settings.read().await);
    let turn = ChatTurn {
        plan: &plan,
        model: &request.model,
        tools: &tools,
        options,
    };

    match dispatch_chat(&state.pool, &state.upstream, &turn).await {
        Ok((account, response)) => {
            metrics::record_request("openai", 200);
            if request.stream {
                sse_response(account, response, OpenAiTranslator::new(&request.model))
            } else {
                let events = collect_events(&account, response).await;
                Json(openai::collect_completion(&events, &request.model)).into_response()
            }
        }
        Err(DispatchError::NoAccount) => openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no available account",
            "service_unavailable",
        ),
        Err(DispatchError::Upstream(message)) => {
            openai_error(StatusCode::INTERNAL_SERVER_ERROR, &message, "api_error")
        }
    }
}

/// POST /v1/messages (and /anthropic/v1/messages)
#[axum::debug_handler]
pub async fn anthropic_messages(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request: AnthropicMessagesRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return anthropic_error(StatusCode::BAD_REQUEST, &format!("invalid request: {e}"));
        }
    };

    let messages = request.chat_messages();
    let plan = match TurnPlan::from_messages(&messages) {
        Ok(plan) => plan,
        Err(e) => return anthropic_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let tools = request.tool_defs();
    let options = ChatOptions::from_settings(&*state.settings.read().await);
    let turn = ChatTurn {
        plan: &plan,
        model: &request.model,
        tools: &tools,
        options,
    };
    let input_tokens = estimate_input_tokens(&plan);

    match dispatch_chat(&state.pool, &state.upstream, &turn).await {
        Ok((account, response)) => {
            metrics::record_request("anthropic", 200);
            if request.stream {
                sse_response(
                    account,
                    response,
                    AnthropicTranslator::new(&request.model, input_tokens),
                )
            } else {
                let events = collect_events(&account, response).await;
                Json(anthropic::collect_message(&events, &request.model)).into_response()
            }
        }
        Err(DispatchError::NoAccount) => {
            anthropic_error(StatusCode::SERVICE_UNAVAILABLE, "no available account")
        }
        Err(DispatchError::Upstream(message)) => {
            anthropic_error(StatusCode::INTERNAL_SERVER_ERROR, &message)
        }
    }
}

/// Rough prompt-token estimate for `message_start` when the upstream hasn't
/// reported usage yet.
fn estimate_input_tokens(plan: &TurnPlan) -> u64 {
    let mut chars = plan.user_message.len();
    for msg in &plan.history {
        chars += msg.content.as_deref().map(str::len).unwrap_or(0);
    }
    for result in &plan.tool_results {
        chars += result.content.len();
    }
    (chars / 4) as u64
}

/// A client-dialect stream translator. Both adapters expose the same
/// lifecycle: optional prelude frames, per-event frames, and best-effort
/// terminal frames when the upstream ends without a finish event.
trait StreamTranslator: Send + 'static {
    fn prelude(&self) -> Vec<String>;
    fn translate(&mut self, event: &StreamEvent) -> Vec<String>;
    fn finish(&mut self) -> Vec<String>;
    fn is_finished(&self) -> bool;
}

struct OpenAiTranslator(OpenAiStreamAdapter);

impl OpenAiTranslator {
    fn new(model: &str) -> Self {
        Self(OpenAiStreamAdapter::new(model))
    }
}

impl StreamTranslator for OpenAiTranslator {
    fn prelude(&self) -> Vec<String> {
        Vec::new()
    }
    fn translate(&mut self, event: &StreamEvent) -> Vec<String> {
        self.0.frames(event)
    }
    fn finish(&mut self) -> Vec<String> {
        self.0.finish()
    }
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

struct AnthropicTranslator(AnthropicStreamAdapter);

impl AnthropicTranslator {
    fn new(model: &str, input_tokens: u64) -> Self {
        Self(AnthropicStreamAdapter::new(model, input_tokens))
    }
}

impl StreamTranslator for AnthropicTranslator {
    fn prelude(&self) -> Vec<String> {
        vec![self.0.start()]
    }
    fn translate(&mut self, event: &StreamEvent) -> Vec<String> {
        self.0.frames(event)
    }
    fn finish(&mut self) -> Vec<String> {
        self.0.finish()
    }
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

/// Bridge the upstream SSE body into the client's dialect. The translation
/// task owns the upstream response; when the client disconnects the channel
/// send fails and the task drops the response, abandoning the upstream read.
fn sse_response<T: StreamTranslator>(
    account: SharedAccount,
    upstream: reqwest::Response,
    mut translator: T,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        for frame in translator.prelude() {
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                return;
            }
        }

        let mut decoder = SseDecoder::new();
        let mut normalizer = EventNormalizer::new();
        let mut stream = upstream.bytes_stream();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "upstream stream error mid-response");
                    break;
                }
            };
            for event in decoder.push(&chunk) {
                for normalized in normalizer.normalize(&event) {
                    if let StreamEvent::Init { conversation_id } = &normalized {
                        account.write().await.active_task_id = Some(conversation_id.clone());
                    }
                    for frame in translator.translate(&normalized) {
                        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            break 'read;
                        }
                    }
                }
            }
            if decoder.is_done() || translator.is_finished() {
                break;
            }
        }

        if !translator.is_finished() {
            if let Some(event) = decoder.finish() {
                for normalized in normalizer.normalize(&event) {
                    for frame in translator.translate(&normalized) {
                        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            return;
                        }
                    }
                }
            }
            // Upstream ended without a finish event: close the stream
            // cleanly rather than cutting the connection.
            for frame in translator.finish() {
                if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    return;
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

/// Drain the whole upstream stream into normalized events (unary mode),
/// applying init events to the account's task id.
async fn collect_events(account: &SharedAccount, response: reqwest::Response) -> Vec<StreamEvent> {
    let mut decoder = SseDecoder::new();
    let mut normalizer = EventNormalizer::new();
    let mut events = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "upstream stream error while collecting");
                break;
            }
        };
        for event in decoder.push(&chunk) {
            events.extend(normalizer.normalize(&event));
        }
        if decoder.is_done() {
            break;
        }
    }
    if let Some(event) = decoder.finish() {
        events.extend(normalizer.normalize(&event));
    }

    for event in &events {
        if let StreamEvent::Init { conversation_id } = event {
            account.write().await.active_task_id = Some(conversation_id.clone());
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_wire::ChatMessage;

    #[test]
    fn input_token_estimate_counts_all_parts() {
        let plan = TurnPlan {
            user_message: "12345678".into(), // 8 chars
            history: vec![ChatMessage::user("abcd")], // 4 chars
            tool_results: vec![warp_wire::ToolResult {
                tool_call_id: "c".into(),
                content: "efgh".into(), // 4 chars
            }],
        };
        assert_eq!(estimate_input_tokens(&plan), 4);
    }
}
