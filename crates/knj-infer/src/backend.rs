// SPDX-License-Identifier: MIT OR Apache-2.0
//! Model backends: the trait, the local-HTTP implementation, and the
//! deterministic mock used throughout the test suites.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use knj_config::ModelEndpoint;
use knj_core::sha256_hex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// What the orchestrator asks a backend for.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// System prompt (the cacheable prefix).
    pub system_prompt: String,
    /// User prompt.
    pub prompt: String,
    /// Retrieval context lines prepended to the prompt.
    pub context: Vec<String>,
    /// Optional image payload for vision calls.
    pub image: Option<(Vec<u8>, String)>,
    /// Generation cap.
    pub max_tokens: u32,
}

/// Token usage accounting returned with every reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens processed.
    pub prompt_tokens: u64,
    /// Completion tokens generated.
    pub completion_tokens: u64,
    /// Whether the system-prompt prefix was already resident.
    pub cached_prefix: bool,
}

/// A completed (non-streaming) reply.
#[derive(Debug, Clone)]
pub struct BackendReply {
    /// Generated text.
    pub text: String,
    /// Usage accounting.
    pub usage: Usage,
}

/// One element of a token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// One generated token.
    Token(String),
    /// Generation finished; final usage attached.
    Done(Usage),
    /// The call was cancelled mid-generation.
    Cancelled,
}

/// Errors a backend may report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend did not answer in time. Retryable once.
    #[error("backend timeout")]
    Timeout,
    /// The model stalled mid-generation. Retryable once.
    #[error("backend stalled: {0}")]
    Stalled(String),
    /// Transport-level failure. Retryable once.
    #[error("backend transport: {0}")]
    Transport(String),
    /// Anything else; not retryable.
    #[error("backend failed: {0}")]
    Failed(String),
}

impl BackendError {
    /// Transient errors get exactly one retry with jittered backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout | BackendError::Stalled(_) | BackendError::Transport(_)
        )
    }
}

/// A long-lived model process reachable over local HTTP.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifier recorded in usage logs and audit events.
    fn id(&self) -> String;

    /// Cheap liveness probe (used after a swap).
    async fn probe(&self) -> Result<(), BackendError>;

    /// Run to completion.
    async fn complete(&self, req: &BackendRequest) -> Result<BackendReply, BackendError>;

    /// Stream tokens into `tx`, observing `cancel` between tokens.
    ///
    /// Implementations yield after every token so concurrent streams
    /// interleave fairly on the single model process.
    async fn stream(
        &self,
        req: &BackendRequest,
        tx: mpsc::Sender<TokenEvent>,
        cancel: &CancelToken,
    ) -> Result<Usage, BackendError>;
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// OpenAI-style completion API served by the local model host.
pub struct HttpModel {
    endpoint: ModelEndpoint,
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl HttpModel {
    /// Build a backend for the given endpoint.
    #[must_use]
    pub fn new(endpoint: ModelEndpoint, request_timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            request_timeout,
        }
    }

    fn combined_prompt(req: &BackendRequest) -> String {
        if req.context.is_empty() {
            req.prompt.clone()
        } else {
            format!("{}\n\n{}", req.context.join("\n"), req.prompt)
        }
    }

    async fn post_completion(
        &self,
        req: &BackendRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        use base64::Engine as _;

        let prompt = Self::combined_prompt(req);
        // Vision calls carry the image as an OpenAI-style data URL part.
        let user_content = match &req.image {
            None => serde_json::json!(prompt),
            Some((bytes, media_type)) => serde_json::json!([
                { "type": "text", "text": prompt },
                { "type": "image_url", "image_url": { "url": format!(
                    "data:{media_type};base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(bytes)
                ) } }
            ]),
        };
        let body = serde_json::json!({
            "model": self.endpoint.model_id,
            "messages": [
                { "role": "system", "content": req.system_prompt },
                { "role": "user", "content": user_content },
            ],
            "max_tokens": req.max_tokens,
            "stream": stream,
        });
        let url = format!("{}/v1/chat/completions", self.endpoint.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(BackendError::Failed(format!(
                "status {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for HttpModel {
    fn id(&self) -> String {
        self.endpoint.model_id.clone()
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let req = BackendRequest {
            system_prompt: String::new(),
            prompt: "ping".into(),
            context: vec![],
            image: None,
            max_tokens: 1,
        };
        self.complete(&req).await.map(|_| ())
    }

    async fn complete(&self, req: &BackendRequest) -> Result<BackendReply, BackendError> {
        let response = self.post_completion(req, false).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Failed(format!("bad completion body: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BackendError::Failed("no choices".into()))?;
        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                cached_prefix: false,
            })
            .unwrap_or_default();
        Ok(BackendReply { text, usage })
    }

    async fn stream(
        &self,
        req: &BackendRequest,
        tx: mpsc::Sender<TokenEvent>,
        cancel: &CancelToken,
    ) -> Result<Usage, BackendError> {
        use futures::StreamExt;

        let response = self.post_completion(req, true).await?;
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut completion_tokens = 0u64;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = tx.send(TokenEvent::Cancelled).await;
                    return Err(BackendError::Stalled("cancelled".into()));
                }
                chunk = body.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk.map_err(|e| BackendError::Transport(e.to_string()))?;
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    // SSE frames are separated by a blank line.
                    while let Some(pos) = buffer.find("\n\n") {
                        let frame = buffer[..pos].to_string();
                        buffer.drain(..pos + 2);
                        for line in frame.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            if data == "[DONE]" {
                                continue;
                            }
                            if let Ok(value) = serde_json::from_str::<serde_json::Value>(data)
                                && let Some(delta) = value
                                    .pointer("/choices/0/delta/content")
                                    .and_then(|v| v.as_str())
                                && !delta.is_empty()
                            {
                                completion_tokens += 1;
                                if tx.send(TokenEvent::Token(delta.to_string())).await.is_err() {
                                    return Err(BackendError::Stalled("receiver dropped".into()));
                                }
                                // Yield between tokens for fair interleaving.
                                tokio::task::yield_now().await;
                            }
                        }
                    }
                }
            }
        }

        let usage = Usage {
            prompt_tokens: crate::budget::estimate_tokens(&Self::combined_prompt(req)),
            completion_tokens,
            cached_prefix: false,
        };
        let _ = tx.send(TokenEvent::Done(usage.clone())).await;
        Ok(usage)
    }
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Deterministic in-process backend for tests and offline development.
///
/// Replies are a pure function of the prompt hash, so replayed traces
/// reproduce bit-identical pipeline decisions.
pub struct MockModel {
    id: String,
    /// Optional canned reply keyed by a substring of the prompt.
    canned: Vec<(String, String)>,
}

impl MockModel {
    /// A mock with the given id and no canned replies.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            canned: Vec::new(),
        }
    }

    /// Add a canned reply for prompts containing `needle`.
    #[must_use]
    pub fn with_reply(mut self, needle: &str, reply: &str) -> Self {
        self.canned.push((needle.to_string(), reply.to_string()));
        self
    }

    fn reply_for(&self, req: &BackendRequest) -> String {
        for (needle, reply) in &self.canned {
            if req.prompt.contains(needle.as_str()) {
                return reply.clone();
            }
        }
        format!(
            "{{\"echo\":\"{}\"}}",
            &sha256_hex(req.prompt.as_bytes())[..16]
        )
    }
}

#[async_trait]
impl ModelBackend for MockModel {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn probe(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn complete(&self, req: &BackendRequest) -> Result<BackendReply, BackendError> {
        let text = self.reply_for(req);
        debug!(backend = %self.id, "mock completion");
        Ok(BackendReply {
            usage: Usage {
                prompt_tokens: crate::budget::estimate_tokens(&req.prompt),
                completion_tokens: crate::budget::estimate_tokens(&text),
                cached_prefix: false,
            },
            text,
        })
    }

    async fn stream(
        &self,
        req: &BackendRequest,
        tx: mpsc::Sender<TokenEvent>,
        cancel: &CancelToken,
    ) -> Result<Usage, BackendError> {
        let text = self.reply_for(req);
        let mut completion_tokens = 0u64;
        for word in text.split_inclusive(' ') {
            if cancel.is_cancelled() {
                let _ = tx.send(TokenEvent::Cancelled).await;
                return Err(BackendError::Stalled("cancelled".into()));
            }
            if tx.send(TokenEvent::Token(word.to_string())).await.is_err() {
                return Err(BackendError::Stalled("receiver dropped".into()));
            }
            completion_tokens += 1;
            tokio::task::yield_now().await;
        }
        let usage = Usage {
            prompt_tokens: crate::budget::estimate_tokens(&req.prompt),
            completion_tokens,
            cached_prefix: false,
        };
        let _ = tx.send(TokenEvent::Done(usage.clone())).await;
        Ok(usage)
    }
}
