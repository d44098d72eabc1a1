// ABOUTME: Inference engine adapter contract: engine creation with progress and chat completions
// ABOUTME: Uniform single-shot and streaming completion over a chat-message list
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ChatStream, CompletionParams, CompletionResult, KilnError};

/// A progress report emitted while an engine loads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    /// Completion fraction in `0.0..=1.0`
    pub fraction: f64,
    /// Human-readable status text
    pub text: String,
}

impl LoadProgress {
    /// Create a progress report, clamping the fraction into range
    pub fn new(fraction: f64, text: impl Into<String>) -> Self {
        Self {
            fraction: if fraction.is_nan() {
                0.0
            } else {
                fraction.clamp(0.0, 1.0)
            },
            text: text.into(),
        }
    }

    /// Completion as a whole percentage
    #[must_use]
    pub fn percent(&self) -> u8 {
        (self.fraction * 100.0).round() as u8
    }
}

/// Callback receiving load progress
pub type ProgressCallback = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Wraps a progress callback so reported fractions never go backwards
///
/// Engines report per-file or per-shard progress that can restart at zero;
/// observers only ever see the high-water mark.
#[derive(Clone)]
pub struct MonotonicProgress {
    inner: ProgressCallback,
    high_water: Arc<Mutex<f64>>,
}

impl MonotonicProgress {
    /// Wrap a callback
    pub fn new(inner: ProgressCallback) -> Self {
        Self {
            inner,
            high_water: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Forward a report, raising its fraction to the highest seen so far
    pub fn report(&self, progress: LoadProgress) {
        let fraction = {
            let mut high = self
                .high_water
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if progress.fraction > *high {
                *high = progress.fraction;
            }
            *high
        };
        (self.inner)(LoadProgress {
            fraction,
            text: progress.text,
        });
    }

    /// Convert into a plain callback
    pub fn into_callback(self) -> ProgressCallback {
        Arc::new(move |progress| self.report(progress))
    }
}

/// A loaded model able to serve chat completions
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Identifier of the loaded model
    fn model_id(&self) -> &str;

    /// Perform a chat completion (non-streaming)
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<CompletionResult, KilnError>;

    /// Perform a streaming chat completion
    ///
    /// The returned stream is finite and cannot be restarted. Only the final
    /// chunk's usage is authoritative; chunk boundaries are arbitrary.
    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatStream, KilnError>;
}

/// Creates engines for a model id
#[async_trait]
pub trait EngineLoader: Send + Sync {
    /// Load the model, reporting progress zero or more times
    ///
    /// May take minutes while weights download or shaders compile.
    async fn create_engine(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<dyn InferenceEngine>, KilnError>;
}
