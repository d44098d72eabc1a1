// ABOUTME: Session lifecycle hooks emitted from the Lua session through the host_emit_event bridge function
// ABOUTME: Host-side registry of callbacks keyed by hook type
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

/// Lifecycle points a hook can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    /// Outgoing message list built, completion about to start
    BeforeCompletion,
    /// Completion finished and the turn was appended to history
    AfterCompletion,
    /// Completion failed; nothing was appended
    OnError,
    /// One streamed delta was forwarded to the host
    OnStreamChunk,
}

impl HookType {
    /// Wire name used by the session script
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeCompletion => "before_completion",
            Self::AfterCompletion => "after_completion",
            Self::OnError => "on_error",
            Self::OnStreamChunk => "on_stream_chunk",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "before_completion" => Some(Self::BeforeCompletion),
            "after_completion" => Some(Self::AfterCompletion),
            "on_error" => Some(Self::OnError),
            "on_stream_chunk" => Some(Self::OnStreamChunk),
            _ => None,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked with the event payload
pub type HookCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registered hook callbacks, called in registration order
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookType, Vec<HookCallback>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = hooks.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one hook type
    pub fn register(&self, hook_type: HookType, callback: HookCallback) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hook_type)
            .or_default()
            .push(callback);
    }

    /// Whether any callback is registered for this hook type
    #[must_use]
    pub fn has(&self, hook_type: HookType) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hook_type)
            .is_some_and(|callbacks| !callbacks.is_empty())
    }

    /// Call every callback registered for `hook_type`
    pub fn emit(&self, hook_type: HookType, payload: &Value) {
        // Snapshot so callbacks may register further hooks
        let callbacks: Vec<HookCallback> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hook_type)
            .cloned()
            .unwrap_or_default();
        if callbacks.is_empty() {
            return;
        }
        debug!(hook = %hook_type, count = callbacks.len(), "Emitting hook");
        for callback in &callbacks {
            callback(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[test]
    fn names_round_trip() {
        for hook in [
            HookType::BeforeCompletion,
            HookType::AfterCompletion,
            HookType::OnError,
            HookType::OnStreamChunk,
        ] {
            assert_eq!(HookType::parse(hook.as_str()), Some(hook));
        }
        assert_eq!(HookType::parse("on_banana"), None);
    }

    #[test]
    fn emit_calls_only_matching_callbacks_in_order() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            registry.register(
                HookType::AfterCompletion,
                Arc::new(move |payload: &Value| {
                    seen.lock().unwrap().push(format!("{tag}:{}", payload["response"]));
                }),
            );
        }
        let errors = Arc::clone(&seen);
        registry.register(
            HookType::OnError,
            Arc::new(move |_: &Value| errors.lock().unwrap().push("error".to_owned())),
        );

        registry.emit(HookType::AfterCompletion, &json!({ "response": "ok" }));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![r#"first:"ok""#.to_owned(), r#"second:"ok""#.to_owned()]
        );
        assert!(registry.has(HookType::OnError));
        assert!(!registry.has(HookType::BeforeCompletion));
    }
}
