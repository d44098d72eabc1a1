// ABOUTME: Write-only view contract driven by the chat orchestrator, plus per-turn statistics
// ABOUTME: Throughput is completion tokens over elapsed wall time, or "--" when either is zero
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::time::Duration;

use crate::engine::LoadProgress;
use crate::types::TokenUsage;

/// Placeholder shown when throughput cannot be computed
pub const NO_THROUGHPUT: &str = "--";

/// Prefix for failed turns rendered as assistant messages
pub const ERROR_PREFIX: &str = "Error: ";

/// Rendering surface for the chat loop
///
/// Every method is a fire-and-forget render instruction; nothing is read back.
pub trait ChatView: Send + Sync {
    /// Render the user's submitted message
    fn show_user_message(&self, text: &str);

    /// Clear the input affordance
    fn clear_input(&self);

    /// Enable or disable sending
    fn set_send_enabled(&self, enabled: bool);

    /// Show the typing indicator
    fn show_typing_indicator(&self);

    /// Remove the typing indicator if present
    fn hide_typing_indicator(&self);

    /// Insert an empty assistant message that following deltas append to
    fn begin_assistant_message(&self);

    /// Append a delta to the open assistant message
    fn append_assistant_text(&self, delta: &str);

    /// Render a complete assistant message in one piece
    fn show_assistant_message(&self, text: &str);

    /// Render statistics for a finished turn
    fn show_stats(&self, stats: &TurnStats);

    /// Show a fatal banner
    fn show_banner(&self, message: &str);

    /// Show model loading progress
    fn show_loading(&self, progress: &LoadProgress);
}

/// Statistics for one completed turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnStats {
    /// Wall time from submit to completion
    pub elapsed: Duration,
    /// Usage reported by the engine
    pub usage: TokenUsage,
}

impl TurnStats {
    /// Tokens per second, if both the token count and elapsed time are non-zero
    #[must_use]
    pub fn throughput(&self) -> Option<f64> {
        let seconds = self.elapsed.as_secs_f64();
        if self.usage.completion_tokens == 0 || seconds <= 0.0 {
            return None;
        }
        Some(f64::from(self.usage.completion_tokens) / seconds)
    }

    /// Throughput formatted for display
    #[must_use]
    pub fn throughput_label(&self) -> String {
        self.throughput()
            .map_or_else(|| NO_THROUGHPUT.to_owned(), |t| format!("{t:.1} tok/s"))
    }

    /// One-line summary: tokens, elapsed time, throughput
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} tokens in {:.2}s ({})",
            self.usage.completion_tokens,
            self.elapsed.as_secs_f64(),
            self.throughput_label()
        )
    }
}
