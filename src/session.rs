// ABOUTME: Host-side handle to the Lua session controller and its versioned entry points
// ABOUTME: Builds a revocable per-turn chunk sink so streamed deltas reach the host in order
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mlua::{Function, Lua, LuaSerdeExt, SerializeOptions, Table};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::bridge::{decode_response, HOST_COMPLETE_ONCE, HOST_COMPLETE_STREAMING};
use crate::config::SessionOptions;
use crate::runtime::{map_lua_error, RuntimeHandle, SESSION_MODULE};
use crate::types::{ChatMessage, CompletionResult, KilnError, MessageRole};

/// Session module version this host speaks
pub const SESSION_VERSION: i64 = 1;

/// Revokes a chunk sink when the turn it belongs to resolves
struct SinkRevoker(Arc<AtomicBool>);

impl Drop for SinkRevoker {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn chunk_sink(lua: &Lua, tx: UnboundedSender<String>) -> Result<(Function, SinkRevoker), KilnError> {
    let revoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&revoked);
    let sink = lua
        .create_function(move |_, delta: String| {
            if flag.load(Ordering::Acquire) {
                return Err(mlua::Error::external(KilnError::internal(
                    "Chunk sink called after its turn ended",
                )));
            }
            // A closed receiver means nobody is rendering; the turn still completes
            let _ = tx.send(delta);
            Ok(())
        })
        .map_err(|e| KilnError::internal(format!("Failed to create chunk sink: {e}")))?;
    Ok((sink, SinkRevoker(revoked)))
}

/// Handle to the initialized session controller
///
/// History and the system prompt live inside the runtime; this handle only
/// calls the module's entry points.
pub struct SessionHandle {
    runtime: Arc<RuntimeHandle>,
    module: Table,
    model_id: String,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Load the session module and initialize it for a model
    ///
    /// The bridge must already be registered in the runtime.
    ///
    /// # Errors
    ///
    /// Returns a session-init error if the bridge is missing, the module
    /// cannot be loaded, its version differs, or `initialize` fails.
    pub fn initialize(
        runtime: Arc<RuntimeHandle>,
        model_id: &str,
        options: &SessionOptions,
    ) -> Result<Self, KilnError> {
        for name in [HOST_COMPLETE_ONCE, HOST_COMPLETE_STREAMING] {
            if !runtime.has_global(name) {
                return Err(KilnError::session_init(format!(
                    "Bridge function {name} is not registered"
                )));
            }
        }

        let module = runtime.require(SESSION_MODULE)?;
        let version: i64 = module
            .get("VERSION")
            .map_err(|e| KilnError::session_init(format!("Session module has no VERSION: {e}")))?;
        if version != SESSION_VERSION {
            return Err(KilnError::session_init(format!(
                "Session module version {version} is not supported (expected {SESSION_VERSION})"
            )));
        }

        let lua = runtime.lua();
        let options = lua
            .to_value_with(options, SerializeOptions::new().serialize_none_to_null(false))
            .map_err(|e| KilnError::internal(format!("Failed to convert session options: {e}")))?;
        let initialize: Function = module
            .get("initialize")
            .map_err(|e| KilnError::session_init(format!("Session module has no initialize: {e}")))?;
        initialize
            .call::<()>((model_id, options))
            .map_err(|e| map_lua_error(&e, KilnError::session_init))?;

        info!(model = model_id, version, "Session initialized");
        Ok(Self {
            runtime,
            module,
            model_id: model_id.to_owned(),
        })
    }

    /// Model the session was initialized for
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The runtime hosting the session
    pub const fn runtime(&self) -> &Arc<RuntimeHandle> {
        &self.runtime
    }

    fn entry(&self, name: &str) -> Result<Function, KilnError> {
        self.module
            .get(name)
            .map_err(|e| KilnError::internal(format!("Session entry point {name} missing: {e}")))
    }

    /// Run one user turn
    ///
    /// With a sink, the turn streams and every non-empty delta is sent to it
    /// in order before this resolves. Without one, the single-shot path is
    /// used. User and assistant messages are appended only on success.
    ///
    /// # Errors
    ///
    /// Returns the bridge or engine error for the turn. History is unchanged.
    pub async fn handle_user_turn(
        &self,
        user_text: &str,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<CompletionResult, KilnError> {
        let handle_turn = self.entry("handle_user_turn")?;
        let (on_chunk, _revoker) = match sink {
            Some(tx) => {
                let (function, revoker) = chunk_sink(self.runtime.lua(), tx)?;
                (Some(function), Some(revoker))
            }
            None => (None, None),
        };

        debug!(streaming = on_chunk.is_some(), len = user_text.len(), "Session turn started");
        let raw: String = handle_turn
            .call_async((user_text, on_chunk))
            .await
            .map_err(|e| map_lua_error(&e, KilnError::bridge_call))?;
        decode_response(&raw)
    }

    /// Snapshot of the history, oldest first
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if an entry has an unknown role.
    pub fn history(&self) -> Result<Vec<ChatMessage>, KilnError> {
        let entries: Table = self
            .entry("history")?
            .call(())
            .map_err(|e| map_lua_error(&e, KilnError::internal))?;

        entries
            .sequence_values::<Table>()
            .map(|entry| {
                let entry = entry.map_err(|e| KilnError::malformed_response(format!("Bad history entry: {e}")))?;
                let role: String = entry
                    .get("role")
                    .map_err(|e| KilnError::malformed_response(format!("History entry has no role: {e}")))?;
                let content: String = entry
                    .get("content")
                    .map_err(|e| KilnError::malformed_response(format!("History entry has no content: {e}")))?;
                let role = MessageRole::parse(&role)
                    .ok_or_else(|| KilnError::malformed_response(format!("Unknown history role: {role}")))?;
                Ok(ChatMessage::new(role, content))
            })
            .collect()
    }

    /// Drop every history entry
    ///
    /// # Errors
    ///
    /// Returns an internal error if the entry point fails.
    pub fn clear_history(&self) -> Result<(), KilnError> {
        self.entry("clear_history")?
            .call::<()>(())
            .map_err(|e| map_lua_error(&e, KilnError::internal))?;
        info!("Session history cleared");
        Ok(())
    }

    /// Replace the system prompt used from the next turn on
    ///
    /// # Errors
    ///
    /// Returns an internal error if the entry point fails.
    pub fn set_system_prompt(&self, prompt: &str) -> Result<(), KilnError> {
        self.entry("set_system_prompt")?
            .call::<()>(prompt)
            .map_err(|e| map_lua_error(&e, KilnError::internal))?;
        info!(len = prompt.len(), "System prompt updated");
        Ok(())
    }

    /// Current system prompt
    ///
    /// # Errors
    ///
    /// Returns an internal error if the entry point fails.
    pub fn system_prompt(&self) -> Result<String, KilnError> {
        self.entry("system_prompt")?
            .call(())
            .map_err(|e| map_lua_error(&e, KilnError::internal))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::bridge::CompletionBridge;
    use crate::config::RuntimeConfig;
    use crate::engine::InferenceEngine;
    use crate::hooks::HookRegistry;
    use crate::runtime::bootstrap;
    use crate::types::{ChatStream, CompletionParams, ErrorKind, StreamChunk, TokenUsage};

    /// Echoes the last user message and records every request
    #[derive(Default)]
    struct EchoEngine {
        requests: Mutex<Vec<Vec<ChatMessage>>>,
        fail: bool,
        fail_mid_stream: bool,
    }

    #[async_trait]
    impl InferenceEngine for EchoEngine {
        fn model_id(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<CompletionResult, KilnError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            if self.fail {
                return Err(KilnError::bridge_call("engine offline"));
            }
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(CompletionResult {
                content: format!("echo: {last}"),
                usage: TokenUsage::new(1, 1),
            })
        }

        async fn complete_stream(
            &self,
            messages: &[ChatMessage],
            params: &CompletionParams,
        ) -> Result<ChatStream, KilnError> {
            let result = self.complete(messages, params).await?;
            if self.fail_mid_stream {
                let chunks = vec![
                    Ok(StreamChunk::delta("partial ")),
                    Err(KilnError::bridge_call("mid-stream")),
                ];
                return Ok(Box::pin(tokio_stream::iter(chunks)));
            }
            let chunks: Vec<Result<StreamChunk, KilnError>> = result
                .content
                .split_inclusive(' ')
                .map(|word| Ok(StreamChunk::delta(word)))
                .chain(std::iter::once(Ok(StreamChunk::finish(result.usage))))
                .collect();
            Ok(Box::pin(tokio_stream::iter(chunks)))
        }
    }

    async fn session_with(engine: Arc<EchoEngine>, options: &SessionOptions) -> SessionHandle {
        let runtime = Arc::new(bootstrap(&RuntimeConfig::default()).await.unwrap());
        Arc::new(CompletionBridge::new(
            engine,
            CompletionParams::default(),
            Arc::new(HookRegistry::new()),
        ))
        .register(&runtime)
        .unwrap();
        SessionHandle::initialize(runtime, "echo", options).unwrap()
    }

    #[tokio::test]
    async fn initialize_requires_registered_bridge() {
        let runtime = Arc::new(bootstrap(&RuntimeConfig::default()).await.unwrap());
        let err = SessionHandle::initialize(runtime, "echo", &SessionOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionInit);
    }

    #[tokio::test]
    async fn streaming_turn_sends_deltas_and_appends_both_messages() {
        let engine = Arc::new(EchoEngine::default());
        let session = session_with(Arc::clone(&engine), &SessionOptions::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let result = session.handle_user_turn("hello there", Some(tx)).await.unwrap();

        let mut deltas = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            deltas.push(delta);
        }
        assert_eq!(deltas.concat(), "echo: hello there");
        assert_eq!(result.content, "echo: hello there");
        assert_eq!(
            session.history().unwrap(),
            vec![
                ChatMessage::user("hello there"),
                ChatMessage::assistant("echo: hello there")
            ]
        );

        let requests = engine.requests.lock().unwrap();
        assert_eq!(requests[0].len(), 2);
        assert_eq!(requests[0][0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn failed_turn_leaves_history_untouched() {
        let engine = Arc::new(EchoEngine {
            fail: true,
            ..EchoEngine::default()
        });
        let session = session_with(engine, &SessionOptions::default()).await;

        let err = session.handle_user_turn("hi", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BridgeCall);
        assert_eq!(err.message, "engine offline");
        assert!(session.history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded_and_prompt_replaceable() {
        let engine = Arc::new(EchoEngine::default());
        let options = SessionOptions {
            system_prompt: Some("be brief".to_owned()),
            max_history: 4,
        };
        let session = session_with(Arc::clone(&engine), &options).await;
        assert_eq!(session.system_prompt().unwrap(), "be brief");

        for text in ["one", "two", "three"] {
            session.handle_user_turn(text, None).await.unwrap();
        }
        let history = session.history().unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], ChatMessage::user("two"));

        session.set_system_prompt("be verbose").unwrap();
        session.clear_history().unwrap();
        session.handle_user_turn("four", None).await.unwrap();

        let requests = engine.requests.lock().unwrap();
        let last = requests.last().unwrap();
        assert_eq!(last, &vec![ChatMessage::system("be verbose"), ChatMessage::user("four")]);
    }

    #[tokio::test]
    async fn chunk_sink_is_revoked_when_a_failed_turn_returns() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("session.lua");
        std::fs::write(
            &script,
            r#"
            local json = require("json")
            local M = { VERSION = 1 }
            function M.initialize() end
            function M.handle_user_turn(text, on_chunk)
              STASH = on_chunk
              return host_complete_streaming(json.encode({ { role = "user", content = text } }), on_chunk)
            end
            return M
            "#,
        )
        .unwrap();
        let runtime = Arc::new(
            bootstrap(&RuntimeConfig {
                session_script: Some(script),
                ..RuntimeConfig::default()
            })
            .await
            .unwrap(),
        );
        Arc::new(CompletionBridge::new(
            Arc::new(EchoEngine {
                fail_mid_stream: true,
                ..EchoEngine::default()
            }),
            CompletionParams::default(),
            Arc::new(HookRegistry::new()),
        ))
        .register(&runtime)
        .unwrap();
        let session = SessionHandle::initialize(Arc::clone(&runtime), "echo", &SessionOptions::default()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let err = session.handle_user_turn("hi", Some(tx)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BridgeCall);
        assert_eq!(err.message, "mid-stream");
        assert_eq!(rx.try_recv().unwrap(), "partial ");

        let err = runtime.run_script("return STASH('late')").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("called after its turn ended"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("session.lua");
        std::fs::write(&script, "return { VERSION = 2, initialize = function() end }").unwrap();
        let runtime = Arc::new(
            bootstrap(&RuntimeConfig {
                session_script: Some(script),
                ..RuntimeConfig::default()
            })
            .await
            .unwrap(),
        );
        Arc::new(CompletionBridge::new(
            Arc::new(EchoEngine::default()),
            CompletionParams::default(),
            Arc::new(HookRegistry::new()),
        ))
        .register(&runtime)
        .unwrap();

        let err = SessionHandle::initialize(runtime, "echo", &SessionOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionInit);
        assert!(err.message.contains("version 2"));
    }
}
