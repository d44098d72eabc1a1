// ABOUTME: Local chat pipeline library: GPU probe, model selection, engine adapter, embedded Lua session
// ABOUTME: Re-exports the orchestrator, view contract, runtime bridge, and configuration types
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Kiln - Local Chat Orchestration
//!
//! Runs a chat session against a locally hosted language model. The session
//! controller (history, system prompt, hooks) is a Lua script living inside an
//! embedded runtime; the host owns the GPU probe, the model choice, the
//! inference engine, and the chat loop that renders streamed replies.
//!
//! ```text
//! ChatOrchestrator -> kiln_session (Lua) -> host_complete_streaming
//!        ^                                          |
//!        +------ chunk sink <- Lua forwarder <------+  InferenceEngine
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kiln::{ChatOrchestrator, ChatView, DeclaredPlatform, HookRegistry, KilnConfig};
//! use kiln::openai_engine::OpenAiEngineLoader;
//!
//! # async fn example(view: &dyn ChatView) -> Result<(), kiln::KilnError> {
//! let config = KilnConfig::default().with_process_env()?;
//! let platform = DeclaredPlatform::new(config.gpu.clone());
//! let loader = OpenAiEngineLoader::new(config.engine.clone())?;
//! let chat = ChatOrchestrator::launch(&config, &platform, &loader, Arc::new(HookRegistry::new()), view).await?;
//! chat.submit(view, "Hello!").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Messages, usage, stream chunks, and the error type
//! - [`capability`] - GPU platform and adapter traits, the probe gate
//! - [`model`] - Model catalog and the selection policy
//! - [`engine`] - Inference engine and loader traits, load progress
//! - [`runtime`] - Embedded Lua runtime bootstrap and package installer
//! - [`bridge`] - Host functions, wire format, and streaming forwarding
//! - [`session`] - Host handle to the Lua session controller
//! - [`hooks`] - Session lifecycle hooks
//! - [`ui`] - View contract and turn statistics
//! - [`orchestrator`] - Startup pipeline and single-flight chat loop
//! - [`config`] - Layered configuration

/// Core types: messages, usage, chunks, and errors
pub mod types;

/// Cross-runtime bridge host functions and wire format
pub mod bridge;
/// GPU capability probing
pub mod capability;
/// Layered configuration
pub mod config;
/// Inference engine contract
pub mod engine;
/// Session lifecycle hooks
pub mod hooks;
/// Model catalog and selection
pub mod model;
/// OpenAI-compatible HTTP engine
#[cfg(feature = "openai-api")]
pub mod openai_engine;
/// Startup pipeline and chat loop
pub mod orchestrator;
/// Embedded Lua runtime
pub mod runtime;
/// Session controller handle
pub mod session;
/// View contract and statistics
pub mod ui;
/// Native wgpu capability platform
#[cfg(feature = "wgpu")]
pub mod wgpu_probe;

pub use capability::{probe, DeclaredPlatform, GpuAdapter, GpuConfig, GpuFeatures, GpuPlatform};
pub use config::{EngineConfig, KilnConfig, PlatformKind, RuntimeConfig, SessionOptions};
pub use engine::{EngineLoader, InferenceEngine, LoadProgress, MonotonicProgress};
pub use hooks::{HookRegistry, HookType};
pub use model::{select, ModelCatalog, ModelDescriptor, ModelMode};
pub use orchestrator::{ChatOrchestrator, GenerationFlag, TurnOutcome, TurnReport};
pub use runtime::{bootstrap, PackageInstaller, RuntimeHandle};
pub use session::SessionHandle;
pub use types::{ChatMessage, CompletionResult, ErrorKind, KilnError, MessageRole, StreamChunk};
pub use ui::{ChatView, TurnStats};
#[cfg(feature = "wgpu")]
pub use wgpu_probe::WgpuPlatform;
