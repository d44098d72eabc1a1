// ABOUTME: Chat orchestrator owning the startup pipeline and the single-flight chat loop
// ABOUTME: Probe, select, bootstrap, load, bridge, session; then one streamed turn at a time
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Chat Orchestrator
//!
//! Startup runs strictly in order and stops at the first failure:
//!
//! 1. capability probe
//! 2. model selection (never fails)
//! 3. runtime bootstrap
//! 4. engine creation, with progress rendered as it arrives
//! 5. bridge registration
//! 6. session initialization
//!
//! [`ChatOrchestrator::launch`] is the one place startup errors are handled:
//! the view gets a banner and sending stays disabled.
//!
//! After startup, [`ChatOrchestrator::submit`] runs at most one turn at a
//! time. Submissions while a turn is in flight are dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::CompletionBridge;
use crate::capability::{probe, AdapterInfo, CapabilityReport, GpuPlatform};
use crate::config::KilnConfig;
use crate::engine::{EngineLoader, LoadProgress, MonotonicProgress};
use crate::hooks::HookRegistry;
use crate::model::{select, ModelCatalog, ModelDescriptor, ModelMode};
use crate::runtime::bootstrap;
use crate::session::SessionHandle;
use crate::types::{CompletionResult, ErrorKind, KilnError};
use crate::ui::{ChatView, TurnStats, ERROR_PREFIX};

// ============================================================================
// Generation flag
// ============================================================================

/// Single-flight gate: idle or generating
#[derive(Debug, Default)]
pub struct GenerationFlag {
    generating: AtomicBool,
}

impl GenerationFlag {
    /// Create an idle flag
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generating: AtomicBool::new(false),
        }
    }

    /// Move idle to generating; `None` when a generation is already running
    pub fn try_claim(&self) -> Option<GenerationGuard<'_>> {
        self.generating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GenerationGuard { flag: self })
    }

    /// Whether a generation is in flight
    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }
}

/// Returns the flag to idle when dropped
#[derive(Debug)]
pub struct GenerationGuard<'a> {
    flag: &'a GenerationFlag,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.flag.generating.store(false, Ordering::Release);
    }
}

// ============================================================================
// Turn outcome
// ============================================================================

/// A successfully completed turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// Final content and usage
    pub result: CompletionResult,
    /// Timing and throughput
    pub stats: TurnStats,
}

/// What happened to one submission
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// A turn was already in flight; nothing was done
    Busy,
    /// The turn completed and was appended to history
    Completed(TurnReport),
    /// The turn failed; the error was rendered and history is unchanged
    Failed(KilnError),
}

/// Banner text for a startup failure
#[must_use]
pub fn startup_banner(err: &KilnError) -> String {
    let stage = match err.kind {
        ErrorKind::UnsupportedPlatform => "This machine cannot run local inference",
        ErrorKind::Bootstrap => "The embedded runtime failed to start",
        ErrorKind::ModelLoad => "The model failed to load",
        ErrorKind::SessionInit => "The chat session failed to start",
        ErrorKind::Config => "The configuration is invalid",
        ErrorKind::BridgeCall | ErrorKind::MalformedResponse | ErrorKind::Internal => {
            "Startup failed"
        }
    };
    format!("{stage}: {}", err.message)
}

fn render_delta(view: &dyn ChatView, placeholder_open: &mut bool, delta: &str) {
    if !*placeholder_open {
        view.hide_typing_indicator();
        view.begin_assistant_message();
        *placeholder_open = true;
    }
    view.append_assistant_text(delta);
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owns every piece of process-wide chat state
pub struct ChatOrchestrator {
    capability: CapabilityReport,
    model: ModelDescriptor,
    session: SessionHandle,
    hooks: Arc<HookRegistry>,
    generation: GenerationFlag,
}

impl std::fmt::Debug for ChatOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOrchestrator")
            .field("adapter", &self.capability.adapter_info)
            .field("model", &self.model.id)
            .field("generating", &self.generation.is_generating())
            .finish_non_exhaustive()
    }
}

impl ChatOrchestrator {
    /// Run the startup pipeline
    ///
    /// Loading progress is forwarded to `view` while the engine is created.
    ///
    /// # Errors
    ///
    /// Returns the first stage's error; later stages do not run.
    pub async fn start(
        config: &KilnConfig,
        platform: &dyn GpuPlatform,
        loader: &dyn EngineLoader,
        hooks: Arc<HookRegistry>,
        view: &dyn ChatView,
    ) -> Result<Self, KilnError> {
        let capability = probe(platform).await?;

        let catalog = ModelCatalog::default();
        let mode = ModelMode::parse(&config.model, &catalog);
        let model = select(&mode, &catalog, Some(capability.adapter.as_ref()));

        let runtime = Arc::new(bootstrap(&config.runtime).await?);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<LoadProgress>();
        let on_progress = MonotonicProgress::new(Arc::new(move |progress: LoadProgress| {
            let _ = progress_tx.send(progress);
        }))
        .into_callback();

        let engine = {
            let load = loader.create_engine(&model.id, on_progress);
            tokio::pin!(load);
            loop {
                tokio::select! {
                    biased;
                    Some(progress) = progress_rx.recv() => view.show_loading(&progress),
                    result = &mut load => break result?,
                }
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            view.show_loading(&progress);
        }
        info!(model = %model.id, "Engine ready");

        Arc::new(CompletionBridge::new(
            engine,
            config.params.clone(),
            Arc::clone(&hooks),
        ))
        .register(&runtime)?;

        let session = SessionHandle::initialize(runtime, &model.id, &config.session)?;

        Ok(Self {
            capability,
            model,
            session,
            hooks,
            generation: GenerationFlag::new(),
        })
    }

    /// Run startup with the top-level failure handler
    ///
    /// Sending is disabled until startup succeeds. On failure the view shows a
    /// banner and sending stays disabled for the life of the process.
    ///
    /// # Errors
    ///
    /// Returns the startup error after it has been rendered.
    pub async fn launch(
        config: &KilnConfig,
        platform: &dyn GpuPlatform,
        loader: &dyn EngineLoader,
        hooks: Arc<HookRegistry>,
        view: &dyn ChatView,
    ) -> Result<Self, KilnError> {
        view.set_send_enabled(false);
        match Self::start(config, platform, loader, hooks, view).await {
            Ok(orchestrator) => {
                info!(
                    adapter = %orchestrator.capability.adapter_info.name,
                    model = %orchestrator.model,
                    "Chat ready"
                );
                view.set_send_enabled(true);
                Ok(orchestrator)
            }
            Err(e) => {
                error!(kind = ?e.kind, error = %e.message, "Startup failed");
                view.show_banner(&startup_banner(&e));
                Err(e)
            }
        }
    }

    /// Submit one user message
    ///
    /// Never fails: errors are rendered as an `Error: ` assistant message and
    /// returned in the outcome. The generation flag is always released.
    pub async fn submit(&self, view: &dyn ChatView, text: &str) -> TurnOutcome {
        let Some(_guard) = self.generation.try_claim() else {
            debug!("Submission ignored, generation in flight");
            return TurnOutcome::Busy;
        };

        view.show_user_message(text);
        view.clear_input();
        view.set_send_enabled(false);
        view.show_typing_indicator();

        let started = Instant::now();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let mut placeholder_open = false;

        let turn = self.session.handle_user_turn(text, Some(chunk_tx));
        tokio::pin!(turn);
        let result = loop {
            tokio::select! {
                biased;
                Some(delta) = chunk_rx.recv() => render_delta(view, &mut placeholder_open, &delta),
                result = &mut turn => break result,
            }
        };
        while let Ok(delta) = chunk_rx.try_recv() {
            render_delta(view, &mut placeholder_open, &delta);
        }

        let outcome = match result {
            Ok(result) => {
                if !placeholder_open {
                    view.hide_typing_indicator();
                    view.show_assistant_message("");
                }
                let stats = TurnStats {
                    elapsed: started.elapsed(),
                    usage: result.usage,
                };
                view.show_stats(&stats);
                info!(
                    tokens = stats.usage.completion_tokens,
                    elapsed_ms = stats.elapsed.as_millis(),
                    throughput = %stats.throughput_label(),
                    "Turn completed"
                );
                TurnOutcome::Completed(TurnReport { result, stats })
            }
            Err(e) => {
                warn!(kind = ?e.kind, error = %e.message, "Turn failed");
                view.hide_typing_indicator();
                view.show_assistant_message(&format!("{ERROR_PREFIX}{}", e.message));
                TurnOutcome::Failed(e)
            }
        };

        view.set_send_enabled(true);
        outcome
    }

    /// Whether a turn is in flight
    pub fn is_generating(&self) -> bool {
        self.generation.is_generating()
    }

    /// The session controller handle
    pub const fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// The model selected at startup
    pub const fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    /// The adapter the capability probe accepted
    pub const fn adapter_info(&self) -> &AdapterInfo {
        &self.capability.adapter_info
    }

    /// Hook registry shared with the bridge
    pub const fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_single_flight_and_released_on_drop() {
        let flag = GenerationFlag::new();
        let guard = flag.try_claim().unwrap();
        assert!(flag.is_generating());
        assert!(flag.try_claim().is_none());
        drop(guard);
        assert!(!flag.is_generating());
        assert!(flag.try_claim().is_some());
    }

    #[test]
    fn banner_names_the_failed_stage() {
        let banner = startup_banner(&KilnError::unsupported_platform("no adapter"));
        assert_eq!(banner, "This machine cannot run local inference: no adapter");
    }
}
