use axum::Json;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::accounts::{AccountDirectory, AccountKind, AccountRecord, ApiCredential, is_token_expired};
use crate::caller_config::CallerConfigStore;
use crate::claude::{MessagesRequest, SystemPromptOverride, Usage};
use crate::config::RelayConfig;
use crate::convert::{StreamState, convert_chunk, decode_response, encode_request};
use crate::error::{AppError, AppResult};
use crate::scheduler::{Selection, UnifiedScheduler};
use crate::session::session_hash;
use crate::sse::ChunkFramer;
use crate::upstream::{GeminiClient, sanitize_for_api_key};
use crate::usage::UsageSink;

/// Relay path for accounts in the claude family. The scheduler hands those
/// out from the same pool; serving them is not this gateway's translation
/// concern, so the whole call is delegated.
#[async_trait::async_trait]
pub trait ClaudeFamilyRelay: Send + Sync {
    async fn relay(
        &self,
        credential: &ApiCredential,
        selection: &Selection,
        body: &Value,
    ) -> AppResult<Response>;
}

/// Deployment without a claude-family backend configured.
pub struct NoClaudeFamilyRelay;

#[async_trait::async_trait]
impl ClaudeFamilyRelay for NoClaudeFamilyRelay {
    async fn relay(
        &self,
        _credential: &ApiCredential,
        selection: &Selection,
        _body: &Value,
    ) -> AppResult<Response> {
        Err(AppError::internal(format!(
            "no relay configured for {} accounts",
            selection.kind.as_str()
        )))
    }
}

/// Drives one inbound request end to end: model resolution, conversion,
/// account selection, the upstream call with bounded retry, and response or
/// stream conversion back to the Claude wire format.
pub struct RelayService {
    pub scheduler: Arc<UnifiedScheduler>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub caller_config: Arc<dyn CallerConfigStore>,
    pub usage: Arc<dyn UsageSink>,
    pub claude_relay: Arc<dyn ClaudeFamilyRelay>,
    pub client: GeminiClient,
    pub config: RelayConfig,
}

impl RelayService {
    pub async fn handle_messages(
        &self,
        credential: &ApiCredential,
        body: Value,
    ) -> AppResult<Response> {
        let request: MessagesRequest = serde_json::from_value(body.clone())
            .map_err(|e| AppError::bad_request(format!("invalid messages request: {e}")))?;
        let stream = request.stream.unwrap_or(false);

        let target_model = self.resolve_target_model(credential, &request.model).await;
        let system_override = self.resolve_system_override(credential).await;
        let gemini_body = encode_request(
            &request,
            system_override.as_ref(),
            &target_model,
            &self.config.capabilities,
        );
        let session = session_hash(&body);

        metrics::counter!("gembridge_requests_total", "model" => target_model.clone())
            .increment(1);
        tracing::info!(
            model = request.model,
            target = target_model,
            stream,
            "relaying messages request"
        );

        let mut last_error: Option<AppError> = None;
        for attempt in 0..self.config.max_retries {
            let selection = match self
                .scheduler
                .select_account(credential, session.as_deref(), Some(&target_model))
                .await
            {
                Ok(selection) => selection,
                Err(err) => {
                    // Zero capacity up front is not a transient condition;
                    // surface it without burning the retry budget.
                    metrics::counter!("gembridge_no_capacity_total").increment(1);
                    return Err(last_error.unwrap_or(err));
                }
            };

            if selection.kind.is_claude_family() {
                return self.claude_relay.relay(credential, &selection, &body).await;
            }

            match self
                .call_gemini(
                    credential,
                    &selection,
                    &gemini_body,
                    &target_model,
                    &request.model,
                    stream,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        account = selection.account_id,
                        error = %err,
                        "upstream attempt failed"
                    );
                    // Only a rate-limit/overload rejection benches the
                    // account; a timeout retries against a fresh selection
                    // without taking the account out of rotation.
                    if err.is_rate_limit_signal() {
                        self.scheduler
                            .mark_rate_limited(
                                &selection.account_id,
                                selection.kind,
                                session.as_deref(),
                            )
                            .await;
                    }
                    if err.is_retryable() {
                        metrics::counter!("gembridge_retries_total").increment(1);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::internal("retries exhausted")))
    }

    /// Token counting piggybacks on the same conversion and scheduling
    /// machinery. Any failure degrades to a zero count so callers that probe
    /// token usage never see the conversation fail.
    pub async fn count_tokens(&self, credential: &ApiCredential, body: Value) -> Json<Value> {
        let Ok(request) = serde_json::from_value::<MessagesRequest>(body.clone()) else {
            return Json(json!({ "input_tokens": 0 }));
        };
        let target_model = self.resolve_target_model(credential, &request.model).await;
        let system_override = self.resolve_system_override(credential).await;
        let gemini_body = encode_request(
            &request,
            system_override.as_ref(),
            &target_model,
            &self.config.capabilities,
        );
        let session = session_hash(&body);

        let Ok(selection) = self
            .scheduler
            .select_account(credential, session.as_deref(), Some(&target_model))
            .await
        else {
            return Json(json!({ "input_tokens": 0 }));
        };
        if selection.kind.is_claude_family() {
            return Json(json!({ "input_tokens": 0 }));
        }

        let result = async {
            let account = self.load_account(&selection).await?;
            match selection.kind {
                AccountKind::GeminiApi => {
                    self.client
                        .count_tokens_with_key(
                            account.base_url.as_deref(),
                            account.api_key.as_deref().unwrap_or(""),
                            &target_model,
                            &sanitize_for_api_key(&gemini_body),
                        )
                        .await
                }
                _ => {
                    self.client
                        .count_tokens_with_oauth(
                            account.access_token.as_deref().unwrap_or(""),
                            &target_model,
                            &gemini_body,
                        )
                        .await
                }
            }
        }
        .await;

        match result {
            Ok(counted) => {
                let total = counted
                    .get("totalTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                Json(json!({ "input_tokens": total }))
            }
            Err(err) => {
                tracing::warn!(error = %err, "countTokens failed, returning zero");
                Json(json!({ "input_tokens": 0 }))
            }
        }
    }

    /// Mapping precedence: already-native names pass through, then
    /// per-caller mapping, then the global dynamic mapping, then static
    /// config, then the configured default.
    async fn resolve_target_model(&self, credential: &ApiCredential, model: &str) -> String {
        if RelayConfig::is_native_model(model) {
            return model.to_string();
        }
        if let Some(mapped) = self
            .caller_config
            .caller_model_mapping(&credential.id, model)
            .await
        {
            return mapped;
        }
        if let Some(mapped) = self.caller_config.global_model_mapping(model).await {
            return mapped;
        }
        if let Some(mapped) = self.config.model_mapping.get(model) {
            return mapped.clone();
        }
        self.config.default_target_model.clone()
    }

    async fn resolve_system_override(
        &self,
        credential: &ApiCredential,
    ) -> Option<SystemPromptOverride> {
        match self.caller_config.caller_system_prompt(&credential.id).await {
            Some(prompt) => Some(prompt),
            None => self.caller_config.global_system_prompt().await,
        }
    }

    async fn load_account(&self, selection: &Selection) -> AppResult<AccountRecord> {
        let mut account = self
            .accounts
            .get_account(&selection.account_id, selection.kind)
            .await
            .ok_or_else(|| AppError::internal("selected account not found"))?;

        if selection.kind == AccountKind::GeminiOauth && is_token_expired(&account) {
            tracing::info!(account = %account.name, "access token expired, refreshing");
            let fresh = self
                .accounts
                .refresh_token(&selection.account_id, selection.kind)
                .await?;
            account.access_token = Some(fresh);
        }
        Ok(account)
    }

    async fn call_gemini(
        &self,
        credential: &ApiCredential,
        selection: &Selection,
        gemini_body: &Value,
        target_model: &str,
        original_model: &str,
        stream: bool,
    ) -> AppResult<Response> {
        let account = self.load_account(selection).await?;

        let upstream = match selection.kind {
            AccountKind::GeminiApi => {
                self.client
                    .generate_with_key(
                        account.base_url.as_deref(),
                        account.api_key.as_deref().unwrap_or(""),
                        target_model,
                        &sanitize_for_api_key(gemini_body),
                        stream,
                    )
                    .await?
            }
            _ => {
                self.client
                    .generate_with_oauth(
                        account.access_token.as_deref().unwrap_or(""),
                        target_model,
                        gemini_body,
                        stream,
                    )
                    .await?
            }
        };

        self.accounts
            .adjust_concurrency(&selection.account_id, 1)
            .await;

        if stream {
            return Ok(self
                .stream_response(credential, selection, upstream, original_model)
                .await);
        }

        // Decrement before inspecting the parse result; an unreadable body
        // must not hold a concurrency slot.
        let parsed: Result<Value, reqwest::Error> = upstream.json().await;
        self.accounts
            .adjust_concurrency(&selection.account_id, -1)
            .await;
        let gemini_response = parsed
            .map_err(|e| AppError::internal(format!("unreadable upstream response: {e}")))?;
        let claude_response = decode_response(&gemini_response, original_model);
        if let Ok(usage) = serde_json::from_value::<Usage>(claude_response["usage"].clone()) {
            self.usage
                .record(
                    &credential.id,
                    &usage,
                    original_model,
                    &selection.account_id,
                    selection.kind,
                )
                .await;
        }
        Ok(Json(claude_response).into_response())
    }

    /// Bridges the upstream SSE byte stream to a downstream Claude event
    /// stream. The pump task owns the framer and stream state; a heartbeat
    /// ping goes out whenever the upstream stays quiet for the configured
    /// interval. A failed downstream send means the client went away, so the
    /// upstream read is abandoned.
    async fn stream_response(
        &self,
        credential: &ApiCredential,
        selection: &Selection,
        upstream: reqwest::Response,
        original_model: &str,
    ) -> Response {
        let (tx, rx) = mpsc::channel::<Event>(64);
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        let usage_sink = Arc::clone(&self.usage);
        let accounts = Arc::clone(&self.accounts);
        let credential_id = credential.id.clone();
        let selection = selection.clone();
        let model = original_model.to_string();

        tokio::spawn(async move {
            let mut body = upstream.bytes_stream();
            let mut framer = ChunkFramer::new();
            let mut state = StreamState::new();
            let mut final_usage = Usage::default();
            let mut terminal_seen = false;
            let mut client_gone = false;

            let message_start = json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", Uuid::new_v4()),
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            });
            if send_event(&tx, &message_start).await.is_err() {
                client_gone = true;
            }

            while !client_gone {
                let chunk = tokio::select! {
                    chunk = body.next() => chunk,
                    _ = tokio::time::sleep(heartbeat) => {
                        if tx.send(Event::default().event("ping").data("{}")).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                let Some(chunk) = chunk else { break };
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        tracing::warn!(%error, "upstream stream read failed");
                        let failure = AppError::internal("stream interrupted").envelope();
                        let _ = tx
                            .send(Event::default().event("error").data(failure.to_string()))
                            .await;
                        client_gone = true;
                        break;
                    }
                };

                for event in framer.feed(&bytes) {
                    track_usage(&event, &mut final_usage);
                    for claude_event in convert_chunk(&event, &mut state) {
                        if claude_event["type"] == "message_stop" {
                            terminal_seen = true;
                        }
                        if send_event(&tx, &claude_event).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    if client_gone {
                        break;
                    }
                }
            }

            if !client_gone {
                if let Some(event) = framer.finish() {
                    track_usage(&event, &mut final_usage);
                    for claude_event in convert_chunk(&event, &mut state) {
                        if claude_event["type"] == "message_stop" {
                            terminal_seen = true;
                        }
                        if send_event(&tx, &claude_event).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                }
            }

            // Some upstreams end the byte stream without a finishReason
            // chunk; the client still needs a well-formed ending.
            if !client_gone && !terminal_seen {
                let stop_reason = if state.has_tool_use() {
                    "tool_use"
                } else {
                    "end_turn"
                };
                let delta = json!({
                    "type": "message_delta",
                    "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                    "usage": { "output_tokens": final_usage.output_tokens }
                });
                let _ = send_event(&tx, &delta).await;
                let _ = send_event(&tx, &json!({ "type": "message_stop" })).await;
            }

            accounts.adjust_concurrency(&selection.account_id, -1).await;
            usage_sink
                .record(
                    &credential_id,
                    &final_usage,
                    &model,
                    &selection.account_id,
                    selection.kind,
                )
                .await;
        });

        Sse::new(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>)).into_response()
    }
}

async fn send_event(tx: &mpsc::Sender<Event>, payload: &Value) -> Result<(), ()> {
    let name = payload["type"].as_str().unwrap_or("message");
    tx.send(Event::default().event(name).data(payload.to_string()))
        .await
        .map_err(|_| ())
}

fn track_usage(chunk: &Value, usage: &mut Usage) {
    let meta = chunk
        .pointer("/response/usageMetadata")
        .or_else(|| chunk.get("usageMetadata"));
    let Some(meta) = meta else { return };
    if let Some(n) = meta.get("promptTokenCount").and_then(|v| v.as_u64()) {
        usage.input_tokens = n;
    }
    if let Some(n) = meta.get("candidatesTokenCount").and_then(|v| v.as_u64()) {
        usage.output_tokens = n;
    }
    if let Some(n) = meta.get("cachedContentTokenCount").and_then(|v| v.as_u64()) {
        usage.cache_read_input_tokens = n;
    }
}
