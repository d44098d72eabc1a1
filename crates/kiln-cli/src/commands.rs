// ABOUTME: Slash-command parsing for the interactive chat loop
// ABOUTME: Recognizes /clear, /history, /system, /models, /help, and /quit
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

/// A command typed at the chat prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drop the session history
    Clear,
    /// Print the session history
    History,
    /// Show (`None`) or replace the system prompt
    System(Option<String>),
    /// List catalog models and the active one
    Models,
    /// Print command help
    Help,
    /// Leave the chat
    Quit,
}

/// Help text listing every command
pub const HELP: &str = "\
/clear          forget the conversation so far
/history        print the conversation so far
/system [text]  show or replace the system prompt
/models         list known models
/help           show this help
/quit           exit";

/// Parse a line typed at the prompt
///
/// Returns `None` for ordinary chat input and `Some(Err(..))` for an unknown
/// command.
pub fn parse_command(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim();
    let rest = line.strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "clear" => Command::Clear,
        "history" => Command::History,
        "system" if arg.is_empty() => Command::System(None),
        "system" => Command::System(Some(arg.to_owned())),
        "models" => Command::Models,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Some(Err(format!("Unknown command /{other}, try /help"))),
    };
    Some(Ok(command))
}
