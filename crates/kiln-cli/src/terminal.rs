// ABOUTME: ANSI terminal implementation of the chat view
// ABOUTME: Streams assistant deltas to stdout and renders loading progress, stats, and banners
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use kiln::{ChatView, LoadProgress, TurnStats};

const CLEAR_LINE: &str = "\r\x1b[2K";
const DIM: &str = "\x1b[2m";
const BOLD_RED: &str = "\x1b[1;31m";
const RESET: &str = "\x1b[0m";

/// Prompt printed before each input line
pub const PROMPT: &str = "you> ";

/// Chat view writing to the process's stdout
#[derive(Debug, Default)]
pub struct TerminalView {
    send_enabled: AtomicBool,
    loading: AtomicBool,
    reply_open: AtomicBool,
}

impl TerminalView {
    /// Create a view with sending disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether input should currently be accepted
    pub fn send_enabled(&self) -> bool {
        self.send_enabled.load(Ordering::Acquire)
    }

    /// Print the input prompt
    pub fn prompt(&self) {
        write_out(PROMPT);
    }

    /// Print an informational line (command output)
    pub fn info(&self, text: &str) {
        write_out(&format!("{text}\n"));
    }

    fn finish_loading(&self) {
        if self.loading.swap(false, Ordering::AcqRel) {
            write_out("\n");
        }
    }
}

fn write_out(text: &str) {
    let mut out = io::stdout().lock();
    // The view is write-only; a closed stdout has nobody left to tell
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

impl ChatView for TerminalView {
    fn show_user_message(&self, _text: &str) {
        // Already echoed by the terminal as it was typed
    }

    fn clear_input(&self) {}

    fn set_send_enabled(&self, enabled: bool) {
        if enabled {
            self.finish_loading();
        }
        self.send_enabled.store(enabled, Ordering::Release);
    }

    fn show_typing_indicator(&self) {
        write_out(&format!("{DIM}assistant is typing...{RESET}"));
    }

    fn hide_typing_indicator(&self) {
        write_out(CLEAR_LINE);
    }

    fn begin_assistant_message(&self) {
        self.reply_open.store(true, Ordering::Release);
        write_out("assistant> ");
    }

    fn append_assistant_text(&self, delta: &str) {
        write_out(delta);
    }

    fn show_assistant_message(&self, text: &str) {
        if self.reply_open.swap(false, Ordering::AcqRel) {
            write_out("\n");
        }
        write_out(&format!("assistant> {text}\n"));
    }

    fn show_stats(&self, stats: &TurnStats) {
        if self.reply_open.swap(false, Ordering::AcqRel) {
            write_out("\n");
        }
        write_out(&format!("{DIM}[{}]{RESET}\n", stats.summary()));
    }

    fn show_banner(&self, message: &str) {
        self.finish_loading();
        write_out(&format!("{BOLD_RED}{message}{RESET}\n"));
    }

    fn show_loading(&self, progress: &LoadProgress) {
        self.loading.store(true, Ordering::Release);
        write_out(&format!(
            "{CLEAR_LINE}Loading model [{:>3}%] {}",
            progress.percent(),
            progress.text
        ));
    }
}
