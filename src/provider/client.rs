//! Chat-completions HTTP client with rate-limit-aware retry.
//!
//! One [`HttpChatClient`] is shared by every call; the provider to talk
//! to arrives per call as a [`ResolvedCall`]. Only rate-limit/overload
//! statuses (429, 529) are retried, with exponential backoff; every other
//! failure is returned immediately and left to the queue-level retry
//! policy. The cancellation token is honored both around the request and
//! during backoff sleeps.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{CallError, KindredError, Result};
use crate::provider::account::ResolvedCall;

/// Message author role, serialized the way chat-completions APIs expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Inserted before an assistant-first history; strict-alternation
/// providers reject histories that open with the assistant.
pub const CONVERSATION_START: &str = "(conversation start)";

/// A fully hydrated request: prompts are final text at this point.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    /// Prior conversation turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub user: String,
    pub temperature: f64,
}

impl ChatRequest {
    /// The normalized message list: system, history, then the user text,
    /// with `(conversation start)` inserted when the history would
    /// otherwise open with the assistant.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 3);
        if !self.system.is_empty() {
            messages.push(ChatMessage::system(&self.system));
        }
        if let Some(first) = self.history.first()
            && first.role == Role::Assistant
        {
            messages.push(ChatMessage::user(CONVERSATION_START));
        }
        messages.extend(self.history.iter().cloned());
        if !self.user.is_empty() {
            messages.push(ChatMessage::user(&self.user));
        }
        messages
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop (end of response).
    Stop,
    /// Hit the max token limit; structured output is unusable.
    Length,
    /// Provider-specific or unknown reason.
    Other,
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        _ => FinishReason::Other,
    }
}

/// A completed (non-streamed) model response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub finish: FinishReason,
}

/// The seam for issuing a completion call. Production uses
/// [`HttpChatClient`]; tests substitute doubles.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(
        &self,
        call: &ResolvedCall,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Completion, CallError>;
}

/// In-call retry policy for rate-limit/overload statuses.
#[derive(Debug, Clone, Copy)]
pub struct CallRetryPolicy {
    /// Additional attempts after the first call.
    pub max_retries: u32,
    /// Base backoff; retry N sleeps `initial_backoff_ms * 2^N`.
    pub initial_backoff_ms: u64,
}

impl Default for CallRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
        }
    }
}

/// Shared HTTP client for every provider.
#[derive(Debug, Clone)]
pub struct HttpChatClient {
    http: reqwest::Client,
    retry: CallRetryPolicy,
}

impl HttpChatClient {
    /// Build a client with the given connect and whole-request timeouts.
    ///
    /// # Errors
    /// Returns [`KindredError::Config`] if the underlying client cannot
    /// be constructed.
    pub fn new(
        request_timeout: Duration,
        connect_timeout: Duration,
        retry: CallRetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| KindredError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, retry })
    }

    async fn send_once(
        &self,
        call: &ResolvedCall,
        request: &ChatRequest,
    ) -> std::result::Result<Completion, CallError> {
        let messages = request.messages();
        if messages.is_empty() {
            return Err(CallError::Config(
                "work item produced no messages".into(),
            ));
        }

        let url = chat_completions_url(&call.base_url);
        let body = serde_json::json!({
            "model": call.model,
            "messages": messages,
            "temperature": request.temperature,
        });

        let mut req = self.http.post(&url).json(&body);
        if !call.api_key.is_empty() {
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", call.api_key),
            );
        }
        for (name, value) in &call.extra_headers {
            req = req.header(name, value);
        }

        let response = req.send().await.map_err(|e| {
            CallError::Request(format!("request to '{}' failed: {e}", call.provider))
        })?;

        let status = response.status().as_u16();
        if status == 429 || status == 529 {
            let message = snippet(&response.text().await.unwrap_or_default());
            return Err(CallError::RateLimited { status, message });
        }
        if !(200..300).contains(&status) {
            let message = snippet(&response.text().await.unwrap_or_default());
            return Err(CallError::Provider { status, message });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::Request(format!("invalid response body: {e}")))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let finish = payload["choices"][0]["finish_reason"]
            .as_str()
            .map_or(FinishReason::Other, map_finish_reason);

        Ok(Completion { content, finish })
    }
}

#[async_trait]
impl CompletionApi for HttpChatClient {
    async fn complete(
        &self,
        call: &ResolvedCall,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Completion, CallError> {
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                outcome = self.send_once(call, request) => outcome,
            };
            match outcome {
                Err(CallError::RateLimited { status, message })
                    if attempt < self.retry.max_retries =>
                {
                    let delay_ms = self
                        .retry
                        .initial_backoff_ms
                        .saturating_mul(1u64 << attempt.min(20));
                    warn!(
                        provider = %call.provider,
                        status,
                        attempt,
                        delay_ms,
                        message = %message,
                        "rate limited, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CallError::Cancelled),
                        () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// `{base}/chat/completions`, tolerating a trailing slash on the base.
fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

/// Bounded error-body excerpt for logs and error messages.
fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn request_with_history(history: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            system: "You are Rowan.".into(),
            history,
            user: "How was your day?".into(),
            temperature: 0.7,
        }
    }

    #[test]
    fn messages_follow_system_history_user_order() {
        let req = request_with_history(vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello!"),
        ]);
        let messages = req.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].content, "How was your day?");
    }

    #[test]
    fn assistant_first_history_gets_conversation_start() {
        let req = request_with_history(vec![ChatMessage::assistant("welcome back")]);
        let messages = req.messages();
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, CONVERSATION_START);
        assert_eq!(messages[2].role, Role::Assistant);
    }

    #[test]
    fn user_first_history_needs_no_normalization() {
        let req = request_with_history(vec![ChatMessage::user("hi")]);
        let messages = req.messages();
        assert!(messages.iter().all(|m| m.content != CONVERSATION_START));
    }

    #[test]
    fn empty_system_is_omitted() {
        let mut req = request_with_history(vec![]);
        req.system = String::new();
        let messages = req.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn body_carries_the_configured_temperature_exactly() {
        // 0.7 must reach the wire as 0.7, not f32-widened 0.699999988079071.
        let req = request_with_history(vec![]);
        let body = serde_json::json!({ "temperature": req.temperature });
        assert_eq!(body.to_string(), r#"{"temperature":0.7}"#);
    }

    #[test]
    fn url_tolerates_trailing_slash() {
        assert_eq!(
            chat_completions_url("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:11434/v1"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), FinishReason::Stop);
        assert_eq!(map_finish_reason("length"), FinishReason::Length);
        assert_eq!(map_finish_reason("tool_calls"), FinishReason::Other);
    }

    #[test]
    fn role_serializes_lowercase() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], serde_json::json!("assistant"));
    }
}
