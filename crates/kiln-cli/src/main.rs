// ABOUTME: CLI entry point for the kiln terminal chat binary
// ABOUTME: Layers config (file, env, flags), launches the orchestrator, and reads chat input from stdin
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

mod commands;
mod terminal;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kiln::openai_engine::OpenAiEngineLoader;
use kiln::{
    ChatOrchestrator, DeclaredPlatform, GpuPlatform, HookRegistry, HookType, KilnConfig,
    KilnError, ModelCatalog, PlatformKind,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::{parse_command, Command, HELP};
use terminal::TerminalView;

/// kiln - chat with a local language model from the terminal
#[derive(Parser)]
#[command(name = "kiln", version, about)]
struct Cli {
    /// Config file (default: <config_dir>/kiln/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model: "auto" or an explicit model id
    #[arg(long)]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible inference server
    #[arg(long)]
    engine_url: Option<String>,

    /// Runtime package to install (name, path, or URL); repeatable
    #[arg(long = "package")]
    packages: Vec<String>,

    /// Directory bare package names resolve against
    #[arg(long)]
    package_dir: Option<PathBuf>,

    /// System prompt override
    #[arg(long)]
    system_prompt: Option<String>,

    /// Capability platform: "declared" or "wgpu"
    #[arg(long)]
    platform: Option<String>,
}

impl Cli {
    fn apply(self, mut config: KilnConfig) -> Result<KilnConfig, KilnError> {
        if let Some(model) = self.model {
            config = config.with_model(model);
        }
        if let Some(url) = self.engine_url {
            config = config.with_engine_url(url);
        }
        config = config.with_packages(self.packages);
        if let Some(dir) = self.package_dir {
            config = config.with_package_dir(dir);
        }
        if let Some(prompt) = self.system_prompt {
            config = config.with_system_prompt(prompt);
        }
        if let Some(platform) = self.platform {
            let kind = match platform.as_str() {
                "declared" => PlatformKind::Declared,
                "wgpu" => PlatformKind::Wgpu,
                other => {
                    return Err(KilnError::config(format!(
                        "Unknown platform: {other}. Valid: declared, wgpu"
                    )))
                }
            };
            config = config.with_platform(kind);
        }
        Ok(config)
    }
}

#[cfg(feature = "wgpu")]
fn native_platform() -> Result<Box<dyn GpuPlatform>, KilnError> {
    Ok(Box::new(kiln::WgpuPlatform::new()))
}

#[cfg(not(feature = "wgpu"))]
fn native_platform() -> Result<Box<dyn GpuPlatform>, KilnError> {
    Err(KilnError::config(
        "The wgpu platform needs a kiln build with the wgpu feature",
    ))
}

fn build_hooks() -> Arc<HookRegistry> {
    let hooks = Arc::new(HookRegistry::new());
    hooks.register(
        HookType::AfterCompletion,
        Arc::new(|payload: &serde_json::Value| {
            tracing::debug!(usage = %payload["usage"], "Completion finished");
        }),
    );
    hooks.register(
        HookType::OnError,
        Arc::new(|payload: &serde_json::Value| {
            tracing::debug!(error = %payload["error"], "Session reported an error");
        }),
    );
    hooks
}

fn run_command(
    command: Command,
    chat: &ChatOrchestrator,
    view: &TerminalView,
) -> Result<bool, KilnError> {
    let session = chat.session();
    match command {
        Command::Clear => {
            session.clear_history()?;
            view.info("History cleared.");
        }
        Command::History => {
            let history = session.history()?;
            if history.is_empty() {
                view.info("(no messages yet)");
            }
            for message in history {
                view.info(&format!("{}> {}", message.role, message.content));
            }
        }
        Command::System(None) => view.info(&session.system_prompt()?),
        Command::System(Some(prompt)) => {
            session.set_system_prompt(&prompt)?;
            view.info("System prompt updated.");
        }
        Command::Models => {
            for model in ModelCatalog::default().entries() {
                let marker = if model.id == chat.model().id { "*" } else { " " };
                view.info(&format!(
                    "{marker} {model} ~{} MB{}",
                    model.approx_vram_mb,
                    if model.requires_reduced_precision_ext {
                        ", needs shader-f16"
                    } else {
                        ""
                    }
                ));
            }
            if ModelCatalog::default().find(&chat.model().id).is_none() {
                view.info(&format!("* {}", chat.model()));
            }
        }
        Command::Help => view.info(HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so stdout stays the chat surface
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = KilnConfig::load(cli.config.as_deref())?.with_process_env()?;
    let config = cli.apply(config)?;

    let platform: Box<dyn GpuPlatform> = match config.platform {
        PlatformKind::Declared => Box::new(DeclaredPlatform::new(config.gpu.clone())),
        PlatformKind::Wgpu => native_platform()?,
    };
    let loader = OpenAiEngineLoader::new(config.engine.clone())?;
    let view = TerminalView::new();

    tracing::info!(
        platform = %config.platform,
        engine = %config.engine.base_url,
        model = %config.model,
        "Starting kiln"
    );

    let chat =
        ChatOrchestrator::launch(&config, platform.as_ref(), &loader, build_hooks(), &view).await?;
    view.info(&format!(
        "Chatting with {} on {}. Type /help for commands.",
        chat.model(),
        chat.adapter_info().name
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        view.prompt();
        let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| KilnError::internal(format!("Failed to read stdin: {e}")))?
        else {
            break;
        };

        match parse_command(&line) {
            Some(Ok(command)) => match run_command(command, &chat, &view) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => view.info(&format!("Command failed: {}", e.message)),
            },
            Some(Err(message)) => view.info(&message),
            None if line.trim().is_empty() || !view.send_enabled() => {}
            None => {
                chat.submit(&view, line.trim()).await;
            }
        }
    }

    Ok(())
}
