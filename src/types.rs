// ABOUTME: Core types for the kiln chat pipeline: messages, usage, chunks, and errors
// ABOUTME: Shared by the engine adapter, the cross-runtime bridge, and the chat loop
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Core Types
//!
//! Self-contained definitions used on both sides of the cross-runtime bridge.
//! The serde shapes of [`ChatMessage`] and [`CompletionResult`] *are* the
//! bridge wire format, so field names here must stay snake_case.

use std::fmt;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

// ============================================================================
// Error Type
// ============================================================================

/// Error type for every stage of the chat pipeline
#[derive(Debug, Clone)]
pub struct KilnError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// Categories of errors produced by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Capability probe failed (no GPU interface, no adapter)
    UnsupportedPlatform,
    /// Embedded runtime creation or package installation failed
    Bootstrap,
    /// Inference engine creation failed (network, compile, unknown model)
    ModelLoad,
    /// Session controller could not be initialized inside the runtime
    SessionInit,
    /// A single completion call failed inside or across the bridge
    BridgeCall,
    /// JSON on either side of the bridge could not be parsed
    MalformedResponse,
    /// Configuration error
    Config,
    /// Internal error (bug, unexpected state)
    Internal,
}

impl KilnError {
    /// Create an unsupported-platform error
    pub fn unsupported_platform(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UnsupportedPlatform,
            message: message.into(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Bootstrap,
            message: message.into(),
        }
    }

    /// Create a model-load error
    pub fn model_load(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ModelLoad,
            message: format!("{}: {}", model_id.into(), message.into()),
        }
    }

    /// Create a session-init error
    pub fn session_init(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::SessionInit,
            message: message.into(),
        }
    }

    /// Create a bridge-call error
    pub fn bridge_call(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BridgeCall,
            message: message.into(),
        }
    }

    /// Create a malformed-response error
    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::MalformedResponse,
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Config,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }

    /// Whether the error belongs to a single turn and leaves the chat usable
    ///
    /// Malformed JSON is handled exactly like any other bridge failure.
    #[must_use]
    pub const fn is_turn_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::BridgeCall | ErrorKind::MalformedResponse
        )
    }
}

impl fmt::Display for KilnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for KilnError {}

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction message
    System,
    /// User input message
    User,
    /// Assistant response message
    Assistant,
}

impl MessageRole {
    /// Wire representation of the role
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a wire role name
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Sampling parameters passed with every completion call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Temperature for response randomness (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
}

impl CompletionParams {
    /// Set the temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the maximum tokens
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens used
    #[serde(default)]
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Build a usage record, deriving the total from its parts
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Result of one completion request, single-shot or fully drained stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Generated message content
    pub content: String,
    /// Token usage statistics (zeroed when the engine reported none)
    #[serde(default)]
    pub usage: TokenUsage,
}

/// A chunk of a streaming response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Content delta for this chunk
    pub delta: String,
    /// Authoritative usage, present on the final chunk only
    pub usage: Option<TokenUsage>,
    /// Finish reason if final
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    /// Create a content-only chunk
    #[must_use]
    pub fn delta(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Create a terminal chunk carrying usage
    #[must_use]
    pub fn finish(usage: TokenUsage) -> Self {
        Self {
            delta: String::new(),
            usage: Some(usage),
            finish_reason: Some("stop".to_owned()),
        }
    }
}

/// Stream type for chat completion responses
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, KilnError>> + Send>>;
