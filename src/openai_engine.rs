// ABOUTME: Inference engine adapter for OpenAI-compatible local servers over HTTP
// ABOUTME: Verifies the model on load and decodes SSE chat-completion chunks into StreamChunks
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::{EngineLoader, InferenceEngine, LoadProgress, MonotonicProgress, ProgressCallback};
use crate::types::{
    ChatMessage, ChatStream, CompletionParams, CompletionResult, KilnError, StreamChunk,
    TokenUsage,
};

/// Connect timeout for every request (10 seconds)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Service label used in error messages
const SERVICE: &str = "openai-compatible engine";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct CompletionRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct CompletionResponseBody {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelsBody {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

// ============================================================================
// SSE decoding
// ============================================================================

/// One decoded server-sent-events line
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A completion chunk
    Chunk(StreamChunk),
    /// The `[DONE]` terminator
    Done,
    /// Comments, keep-alives, and non-data fields
    Skip,
}

/// Decode a single SSE line from a streaming chat completion
///
/// # Errors
///
/// Returns `MalformedResponse` when a `data:` payload is not a valid chunk.
pub fn parse_sse_line(line: &str) -> Result<SseEvent, KilnError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }

    let body: ChunkBody = serde_json::from_str(data)
        .map_err(|e| KilnError::malformed_response(format!("Invalid SSE chunk: {e}")))?;
    let (delta, finish_reason) = body
        .choices
        .into_iter()
        .next()
        .map(|c| (c.delta.content.unwrap_or_default(), c.finish_reason))
        .unwrap_or_default();

    Ok(SseEvent::Chunk(StreamChunk {
        delta,
        usage: body.usage,
        finish_reason,
    }))
}

/// Splits a byte stream into lines, holding partial lines between reads
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\n', '\r']).to_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Engine bound to one model on an OpenAI-compatible server
pub struct OpenAiEngine {
    client: reqwest::Client,
    config: EngineConfig,
    model_id: String,
}

impl OpenAiEngine {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request(&self, body: &CompletionRequestBody<'_>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

async fn error_from_status(response: reqwest::Response) -> KilnError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    KilnError::bridge_call(format!("{SERVICE} returned {status}: {body}"))
}

#[async_trait]
impl InferenceEngine for OpenAiEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<CompletionResult, KilnError> {
        let body = CompletionRequestBody {
            model: &self.model_id,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: false,
            stream_options: None,
        };

        let response = self
            .request(&body)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| KilnError::bridge_call(format!("{SERVICE} request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }

        let parsed: CompletionResponseBody = response
            .json()
            .await
            .map_err(|e| KilnError::malformed_response(format!("Invalid completion body: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        debug!(model = %self.model_id, len = content.len(), "Completion received");
        Ok(CompletionResult {
            content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatStream, KilnError> {
        let body = CompletionRequestBody {
            model: &self.model_id,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        let response =
            self.request(&body).send().await.map_err(|e| {
                KilnError::bridge_call(format!("{SERVICE} stream request failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, LineBuffer::default(), VecDeque::new(), false);

        let chunks = stream::unfold(state, |(mut bytes, mut lines, mut ready, mut done)| async move {
            loop {
                if let Some(item) = ready.pop_front() {
                    return Some((item, (bytes, lines, ready, done)));
                }
                if done {
                    return None;
                }
                let decoded = match bytes.next().await {
                    Some(Ok(buf)) => lines.push(&buf),
                    Some(Err(e)) => {
                        ready.push_back(Err(KilnError::bridge_call(format!(
                            "Error reading {SERVICE} stream: {e}"
                        ))));
                        done = true;
                        Vec::new()
                    }
                    None => {
                        done = true;
                        lines.finish().into_iter().collect()
                    }
                };
                for line in decoded {
                    if done && !ready.is_empty() {
                        break;
                    }
                    match parse_sse_line(&line) {
                        Ok(SseEvent::Chunk(chunk)) => ready.push_back(Ok(chunk)),
                        Ok(SseEvent::Done) => {
                            done = true;
                            break;
                        }
                        Ok(SseEvent::Skip) => {}
                        Err(e) => {
                            ready.push_back(Err(e));
                            done = true;
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Creates [`OpenAiEngine`]s after checking the server actually serves the model
pub struct OpenAiEngineLoader {
    client: reqwest::Client,
    config: EngineConfig,
}

impl OpenAiEngineLoader {
    /// Create a loader for the configured server
    ///
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be built.
    pub fn new(config: EngineConfig) -> Result<Self, KilnError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| KilnError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn served_models(&self) -> Result<Vec<String>, String> {
        let url = format!("{}/v1/models", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.get(url).timeout(self.config.timeout);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("model listing returned {}", response.status()));
        }
        let body: ModelsBody = response.json().await.map_err(|e| e.to_string())?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl EngineLoader for OpenAiEngineLoader {
    async fn create_engine(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<dyn InferenceEngine>, KilnError> {
        let progress = MonotonicProgress::new(on_progress);
        progress.report(LoadProgress::new(0.0, format!("Connecting to {}", self.config.base_url)));

        let served = self
            .served_models()
            .await
            .map_err(|e| KilnError::model_load(model_id, e))?;
        progress.report(LoadProgress::new(0.5, "Model list received"));

        // Some servers host exactly one model and list nothing useful
        if !served.is_empty() && !served.iter().any(|id| id == model_id) {
            return Err(KilnError::model_load(
                model_id,
                format!("not served by {} (available: {})", self.config.base_url, served.join(", ")),
            ));
        }

        progress.report(LoadProgress::new(1.0, "Model ready"));
        info!(model = model_id, base_url = %self.config.base_url, "Engine created");

        Ok(Arc::new(OpenAiEngine {
            client: self.client.clone(),
            config: self.config.clone(),
            model_id: model_id.to_owned(),
        }))
    }
}
