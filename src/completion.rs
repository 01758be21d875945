//! Remote chat-completion client.
//!
//! The orchestrator talks to the remote agent through the [`CompletionClient`]
//! trait so tests can script replies; [`HttpCompletionClient`] is the real
//! implementation. All wire fields are `camelCase`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ChatError;

/// Replaces the content of non-text turns before transmission, so large or
/// opaque structured payloads are never echoed back to the remote agent.
pub const OPAQUE_CONTENT_PLACEHOLDER: &str = "[structured message]";

/// Response code signalling success.
pub const CODE_OK: u16 = 200;

// ─── Wire types ───────────────────────────────────────────────────────────────

/// One turn of conversation context in the outbound payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionTurn {
    /// `"user"` | `"assistant"`
    pub role: String,
    pub content: String,
    pub message_id: String,
    pub result_kind: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub messages: Vec<CompletionTurn>,
    /// BCP-47 tag, e.g. `"en"`.
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    /// `200` is success; any other value is a failure.
    pub code: u16,
    /// The agent's reply content.
    pub data: String,
    pub result_kind: String,
}

// ─── Client seam ──────────────────────────────────────────────────────────────

/// Interface to the remote chat-completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Issue one completion call. Implementations classify deadline
    /// overruns as [`ChatError::TransportTimeout`] and everything else as
    /// [`ChatError::Transport`].
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ChatError>;
}

/// HTTP implementation with an explicit per-request deadline.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpCompletionClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ChatError::Transport(format!("failed to build HTTP client: {e:#}")))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ChatError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::TransportTimeout(self.timeout.as_secs())
                } else {
                    ChatError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChatError::Transport(format!(
                "completion endpoint returned {status}"
            )));
        }

        resp.json::<CompletionResponse>()
            .await
            .map_err(|e| ChatError::Transport(format!("bad completion response: {e}")))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
