// ABOUTME: Cross-runtime bridge exposing engine completions to the Lua session as host functions
// ABOUTME: JSON text wire format, streaming chunk forwarding, and single-use callback leases
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Cross-Runtime Bridge
//!
//! Three host functions are installed into the runtime's globals:
//!
//! | Global | Arguments | Returns |
//! |---|---|---|
//! | `host_complete_once` | messages JSON | response JSON |
//! | `host_complete_streaming` | messages JSON, chunk callback | response JSON |
//! | `host_emit_event` | hook name, payload JSON | nothing |
//!
//! Only JSON text crosses the boundary. A request is an array of
//! `{role, content}` objects; a response is
//! `{content, usage: {prompt_tokens, completion_tokens, total_tokens}}`.

use std::sync::Arc;

use mlua::Function;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::engine::InferenceEngine;
use crate::hooks::{HookRegistry, HookType};
use crate::runtime::{map_lua_error, RuntimeHandle};
use crate::types::{ChatMessage, ChatStream, CompletionParams, CompletionResult, KilnError, TokenUsage};

/// Global name of the single-shot completion function
pub const HOST_COMPLETE_ONCE: &str = "host_complete_once";

/// Global name of the streaming completion function
pub const HOST_COMPLETE_STREAMING: &str = "host_complete_streaming";

/// Global name of the hook dispatch function
pub const HOST_EMIT_EVENT: &str = "host_emit_event";

// ============================================================================
// Wire format
// ============================================================================

/// Encode a message list as request JSON
///
/// # Errors
///
/// Returns an internal error if serialization fails.
pub fn encode_messages(messages: &[ChatMessage]) -> Result<String, KilnError> {
    serde_json::to_string(messages)
        .map_err(|e| KilnError::internal(format!("Failed to encode messages: {e}")))
}

/// Decode request JSON into a message list
///
/// # Errors
///
/// Returns `MalformedResponse` for invalid JSON, unknown roles, or missing fields.
pub fn decode_messages(json: &str) -> Result<Vec<ChatMessage>, KilnError> {
    serde_json::from_str(json)
        .map_err(|e| KilnError::malformed_response(format!("Invalid message list: {e}")))
}

/// Encode a completion result as response JSON
///
/// # Errors
///
/// Returns an internal error if serialization fails.
pub fn encode_response(result: &CompletionResult) -> Result<String, KilnError> {
    serde_json::to_string(result)
        .map_err(|e| KilnError::internal(format!("Failed to encode response: {e}")))
}

/// Decode response JSON into a completion result
///
/// # Errors
///
/// Returns `MalformedResponse` for invalid JSON or a missing `content` field.
pub fn decode_response(json: &str) -> Result<CompletionResult, KilnError> {
    serde_json::from_str(json)
        .map_err(|e| KilnError::malformed_response(format!("Invalid completion response: {e}")))
}

/// Drain a completion stream, forwarding every non-empty delta in order
///
/// Content is the concatenation of all deltas. Usage comes from the last chunk
/// that carried one and is zero if none did.
///
/// # Errors
///
/// Returns the first stream error or the first error raised by `on_delta`.
pub async fn drain_stream<F>(mut stream: ChatStream, mut on_delta: F) -> Result<CompletionResult, KilnError>
where
    F: FnMut(&str) -> Result<(), KilnError> + Send,
{
    let mut content = String::new();
    let mut usage: Option<TokenUsage> = None;
    let mut chunks = 0_usize;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        if !chunk.delta.is_empty() {
            on_delta(&chunk.delta)?;
            content.push_str(&chunk.delta);
            chunks += 1;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    debug!(chunks, len = content.len(), has_usage = usage.is_some(), "Stream drained");
    Ok(CompletionResult {
        content,
        usage: usage.unwrap_or_default(),
    })
}

// ============================================================================
// Callback lease
// ============================================================================

/// Holds a runtime callback for the duration of one streaming call
///
/// The callback is released when the lease is dropped, on success and on
/// every error path, so the runtime never keeps a dangling proxy alive.
pub struct CallbackLease {
    callback: Option<Function>,
}

impl CallbackLease {
    /// Take ownership of a callback
    #[must_use]
    pub const fn new(callback: Function) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// Invoke the callback with one delta
    ///
    /// # Errors
    ///
    /// Returns the callback's error (kind preserved when it originated on the
    /// host), or an internal error if the lease was already released.
    pub fn invoke(&self, delta: &str) -> Result<(), KilnError> {
        let Some(callback) = &self.callback else {
            return Err(KilnError::internal("Chunk callback used after release"));
        };
        callback
            .call::<()>(delta)
            .map_err(|e| map_lua_error(&e, |m| KilnError::bridge_call(format!("Chunk callback failed: {m}"))))
    }

    /// Whether the callback is still held
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.callback.is_some()
    }

    /// Release the callback early
    pub fn release(&mut self) {
        if self.callback.take().is_some() {
            debug!("Chunk callback released");
        }
    }
}

impl Drop for CallbackLease {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Host side of the bridge: one engine plus the hook registry
pub struct CompletionBridge {
    engine: Arc<dyn InferenceEngine>,
    params: CompletionParams,
    hooks: Arc<HookRegistry>,
}

impl CompletionBridge {
    /// Create a bridge over an engine
    pub fn new(engine: Arc<dyn InferenceEngine>, params: CompletionParams, hooks: Arc<HookRegistry>) -> Self {
        Self {
            engine,
            params,
            hooks,
        }
    }

    /// Single-shot completion: request JSON in, response JSON out
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` for bad request JSON and the engine's error otherwise.
    pub async fn complete_once(&self, messages_json: &str) -> Result<String, KilnError> {
        let messages = decode_messages(messages_json)?;
        debug!(model = self.engine.model_id(), messages = messages.len(), "Bridge complete_once");
        let result = self.engine.complete(&messages, &self.params).await?;
        encode_response(&result)
    }

    /// Streaming completion forwarding each non-empty delta to `on_delta`
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` for bad request JSON, the engine's error, or
    /// the error raised by `on_delta`.
    pub async fn complete_streaming<F>(&self, messages_json: &str, on_delta: F) -> Result<String, KilnError>
    where
        F: FnMut(&str) -> Result<(), KilnError> + Send,
    {
        let messages = decode_messages(messages_json)?;
        debug!(model = self.engine.model_id(), messages = messages.len(), "Bridge complete_streaming");
        let stream = self.engine.complete_stream(&messages, &self.params).await?;
        let result = drain_stream(stream, on_delta).await?;
        encode_response(&result)
    }

    /// Dispatch a hook event emitted by the session
    ///
    /// Unknown hook names are ignored.
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if the payload is not valid JSON.
    pub fn emit_event(&self, name: &str, payload_json: Option<&str>) -> Result<(), KilnError> {
        let Some(hook) = HookType::parse(name) else {
            warn!(hook = name, "Ignoring unknown hook event");
            return Ok(());
        };
        let payload = match payload_json {
            Some(text) => serde_json::from_str(text)
                .map_err(|e| KilnError::malformed_response(format!("Invalid {name} payload: {e}")))?,
            None => serde_json::Value::Null,
        };
        self.hooks.emit(hook, &payload);
        Ok(())
    }

    /// Install the three host functions into the runtime
    ///
    /// # Errors
    ///
    /// Returns an internal error if a function cannot be created or defined.
    pub fn register(self: Arc<Self>, runtime: &RuntimeHandle) -> Result<(), KilnError> {
        let lua = runtime.lua();
        let create_failed = |name: &str, e: mlua::Error| KilnError::internal(format!("Failed to create {name}: {e}"));

        let bridge = Arc::clone(&self);
        let once = lua
            .create_async_function(move |_, messages_json: String| {
                let bridge = Arc::clone(&bridge);
                async move {
                    bridge
                        .complete_once(&messages_json)
                        .await
                        .map_err(mlua::Error::external)
                }
            })
            .map_err(|e| create_failed(HOST_COMPLETE_ONCE, e))?;
        runtime.define_host_function(HOST_COMPLETE_ONCE, once)?;

        let bridge = Arc::clone(&self);
        let streaming = lua
            .create_async_function(move |_, (messages_json, callback): (String, Function)| {
                let bridge = Arc::clone(&bridge);
                async move {
                    let lease = CallbackLease::new(callback);
                    bridge
                        .complete_streaming(&messages_json, move |delta| lease.invoke(delta))
                        .await
                        .map_err(mlua::Error::external)
                }
            })
            .map_err(|e| create_failed(HOST_COMPLETE_STREAMING, e))?;
        runtime.define_host_function(HOST_COMPLETE_STREAMING, streaming)?;

        let bridge = self;
        let emit = lua
            .create_function(move |_, (name, payload): (String, Option<String>)| {
                bridge
                    .emit_event(&name, payload.as_deref())
                    .map_err(mlua::Error::external)
            })
            .map_err(|e| create_failed(HOST_EMIT_EVENT, e))?;
        runtime.define_host_function(HOST_EMIT_EVENT, emit)?;

        debug!("Bridge host functions registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::types::{ErrorKind, StreamChunk};

    struct ScriptedEngine {
        chunks: Vec<Result<StreamChunk, KilnError>>,
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<CompletionResult, KilnError> {
            Ok(CompletionResult {
                content: format!("{} messages", messages.len()),
                usage: TokenUsage::new(4, 2),
            })
        }

        async fn complete_stream(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<ChatStream, KilnError> {
            Ok(Box::pin(tokio_stream::iter(self.chunks.clone())))
        }
    }

    fn bridge(chunks: Vec<Result<StreamChunk, KilnError>>) -> Arc<CompletionBridge> {
        Arc::new(CompletionBridge::new(
            Arc::new(ScriptedEngine { chunks }),
            CompletionParams::default(),
            Arc::new(HookRegistry::new()),
        ))
    }

    // ========================================================================
    // Wire format
    // ========================================================================

    #[test]
    fn messages_survive_the_wire_unchanged() {
        let messages = vec![
            ChatMessage::system(""),
            ChatMessage::user("say \"hi\"\nthen {stop}"),
            ChatMessage::assistant("naïve 🔥 \\ backslash"),
        ];
        let json = encode_messages(&messages).unwrap();
        assert_eq!(decode_messages(&json).unwrap(), messages);
    }

    #[test]
    fn response_keys_are_snake_case() {
        let result = CompletionResult {
            content: "ok".to_owned(),
            usage: TokenUsage::new(3, 1),
        };
        let value: serde_json::Value = serde_json::from_str(&encode_response(&result).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "content": "ok",
                "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 }
            })
        );
    }

    #[test]
    fn malformed_json_is_reported_as_such() {
        assert_eq!(decode_response("{").unwrap_err().kind, ErrorKind::MalformedResponse);
        assert_eq!(
            decode_messages(r#"[{"role":"tool","content":"x"}]"#).unwrap_err().kind,
            ErrorKind::MalformedResponse
        );
    }

    // ========================================================================
    // Stream draining
    // ========================================================================

    #[tokio::test]
    async fn deltas_are_forwarded_in_order_and_accumulated() {
        let chunks = vec![
            Ok(StreamChunk::delta("Hel")),
            Ok(StreamChunk::delta("")),
            Ok(StreamChunk::delta("lo")),
            Ok(StreamChunk::finish(TokenUsage::new(5, 2))),
        ];
        let seen = Mutex::new(Vec::new());
        let result = drain_stream(Box::pin(tokio_stream::iter(chunks)), |d| {
            seen.lock().unwrap().push(d.to_owned());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["Hel", "lo"]);
        assert_eq!(result.content, "Hello");
        assert_eq!(result.usage.completion_tokens, 2);
    }

    #[tokio::test]
    async fn empty_stream_yields_empty_content_and_zero_usage() {
        let calls = Mutex::new(0);
        let result = drain_stream(Box::pin(tokio_stream::iter(Vec::new())), |_| {
            *calls.lock().unwrap() += 1;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(result, CompletionResult::default());
    }

    #[test]
    fn lease_releases_once() {
        let lua = mlua::Lua::new();
        let callback = lua.create_function(|_, _: String| Ok(())).unwrap();
        let mut lease = CallbackLease::new(callback);
        assert!(lease.invoke("x").is_ok());
        lease.release();
        assert!(!lease.is_held());
        assert_eq!(lease.invoke("x").unwrap_err().kind, ErrorKind::Internal);
    }

    // ========================================================================
    // Through the runtime
    // ========================================================================

    #[tokio::test]
    async fn lua_callback_receives_chunks_from_streaming_call() {
        let runtime = RuntimeHandle::new().unwrap();
        bridge(vec![
            Ok(StreamChunk::delta("a")),
            Ok(StreamChunk::delta("b")),
            Ok(StreamChunk::finish(TokenUsage::new(1, 2))),
        ])
        .register(&runtime)
        .unwrap();

        let value = runtime
            .run_script_async(
                r#"
                local json = require("json")
                local seen = {}
                local raw = host_complete_streaming(
                    json.encode({ { role = "user", content = "hi" } }),
                    function(delta) seen[#seen + 1] = delta end
                )
                local response = json.decode(raw)
                return { table.concat(seen, ","), response.content, response.usage.total_tokens }
                "#,
            )
            .await
            .unwrap();
        assert_eq!(value, json!(["a,b", "ab", 3]));
    }

    #[tokio::test]
    async fn engine_errors_surface_in_lua_with_their_kind() {
        let runtime = RuntimeHandle::new().unwrap();
        bridge(vec![
            Ok(StreamChunk::delta("partial")),
            Err(KilnError::bridge_call("engine crashed")),
        ])
        .register(&runtime)
        .unwrap();

        let err = runtime
            .run_script_async(
                r#"return host_complete_streaming('[{"role":"user","content":"hi"}]', function() end)"#,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BridgeCall);
        assert_eq!(err.message, "engine crashed");
    }

    #[tokio::test]
    async fn malformed_request_from_lua_is_rejected() {
        let runtime = RuntimeHandle::new().unwrap();
        bridge(Vec::new()).register(&runtime).unwrap();
        let err = runtime
            .run_script_async("return host_complete_once('not json')")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn emitted_events_reach_registered_hooks() {
        let hooks = Arc::new(HookRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hooks.register(
            HookType::BeforeCompletion,
            Arc::new(move |payload: &serde_json::Value| sink.lock().unwrap().push(payload.clone())),
        );
        let runtime = RuntimeHandle::new().unwrap();
        Arc::new(CompletionBridge::new(
            Arc::new(ScriptedEngine { chunks: Vec::new() }),
            CompletionParams::default(),
            hooks,
        ))
        .register(&runtime)
        .unwrap();

        runtime
            .run_script(r#"host_emit_event("before_completion", '{"prompt":"hi"}'); host_emit_event("mystery")"#)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!({ "prompt": "hi" })]);
    }
}
