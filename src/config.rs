// ABOUTME: Layered configuration for the chat pipeline (defaults, optional TOML file, environment)
// ABOUTME: Engine endpoint, runtime packages, session options, sampling parameters, and GPU declaration
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::GpuConfig;
use crate::types::{CompletionParams, KilnError};

/// Default timeout for single-shot engine requests (120 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default OpenAI-compatible server address
const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8000";

/// Default number of history entries kept by the session
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Default sampling temperature
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default completion length cap
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Environment variable names read by [`KilnConfig::apply_env`]
pub mod env_keys {
    /// Model mode: `auto` or a model id
    pub const MODEL: &str = "KILN_MODEL";
    /// Engine base URL
    pub const ENGINE_URL: &str = "KILN_ENGINE_URL";
    /// Engine bearer token
    pub const API_KEY: &str = "KILN_API_KEY";
    /// Comma-separated packages to install
    pub const PACKAGES: &str = "KILN_PACKAGES";
    /// Directory bare package names resolve against
    pub const PACKAGE_DIR: &str = "KILN_PACKAGE_DIR";
    /// Sampling temperature
    pub const TEMPERATURE: &str = "KILN_TEMPERATURE";
    /// Completion length cap
    pub const MAX_TOKENS: &str = "KILN_MAX_TOKENS";
    /// Engine request timeout in seconds
    pub const TIMEOUT: &str = "KILN_TIMEOUT";
    /// System prompt override
    pub const SYSTEM_PROMPT: &str = "KILN_SYSTEM_PROMPT";
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Which capability platform the probe runs against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Capabilities declared in the `[gpu]` table
    #[default]
    Declared,
    /// Native adapters through wgpu
    Wgpu,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declared => write!(f, "declared"),
            Self::Wgpu => write!(f, "wgpu"),
        }
    }
}

/// Inference server connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,
    /// Optional bearer token
    pub api_key: Option<String>,
    /// Timeout for non-streaming requests
    #[serde(rename = "timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENGINE_URL.to_owned(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Embedded runtime bootstrap settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Packages installed in order before the session script
    pub packages: Vec<String>,
    /// Directory bare package names resolve against
    pub package_dir: Option<PathBuf>,
    /// Replacement for the built-in session script
    pub session_script: Option<PathBuf>,
}

/// Options passed to the session controller at initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Replacement for the built-in system prompt
    pub system_prompt: Option<String>,
    /// Maximum history entries kept; oldest are dropped first
    pub max_history: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// Complete configuration for one chat process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// `auto` or an explicit model id
    pub model: String,
    /// Capability platform used by the probe
    pub platform: PlatformKind,
    /// Declared GPU capabilities (used by [`PlatformKind::Declared`])
    pub gpu: GpuConfig,
    /// Inference server settings
    pub engine: EngineConfig,
    /// Runtime packages
    pub runtime: RuntimeConfig,
    /// Session options
    pub session: SessionOptions,
    /// Sampling parameters for every completion
    pub params: CompletionParams,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            model: "auto".to_owned(),
            platform: PlatformKind::Declared,
            gpu: GpuConfig::default(),
            engine: EngineConfig::default(),
            runtime: RuntimeConfig::default(),
            session: SessionOptions::default(),
            params: CompletionParams::default()
                .with_temperature(DEFAULT_TEMPERATURE)
                .with_max_tokens(DEFAULT_MAX_TOKENS),
        }
    }
}

impl KilnConfig {
    /// Set the model mode (`auto` or an id)
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the engine base URL
    #[must_use]
    pub fn with_engine_url(mut self, url: impl Into<String>) -> Self {
        self.engine.base_url = url.into();
        self
    }

    /// Append packages to install
    #[must_use]
    pub fn with_packages(mut self, packages: impl IntoIterator<Item = String>) -> Self {
        self.runtime.packages.extend(packages);
        self
    }

    /// Set the package directory
    #[must_use]
    pub fn with_package_dir(mut self, dir: PathBuf) -> Self {
        self.runtime.package_dir = Some(dir);
        self
    }

    /// Set the session script override
    #[must_use]
    pub fn with_session_script(mut self, path: PathBuf) -> Self {
        self.runtime.session_script = Some(path);
        self
    }

    /// Set the system prompt override
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.session.system_prompt = Some(prompt.into());
        self
    }

    /// Set the capability platform
    #[must_use]
    pub const fn with_platform(mut self, platform: PlatformKind) -> Self {
        self.platform = platform;
        self
    }

    /// Apply overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns a config error if a numeric variable does not parse.
    pub fn with_process_env(self) -> Result<Self, KilnError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment lookup
    ///
    /// Empty values are treated as unset. `KILN_PACKAGES` appends to the
    /// configured package list.
    ///
    /// # Errors
    ///
    /// Returns a config error if a numeric variable does not parse.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KilnError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(model) = get(env_keys::MODEL) {
            self.model = model.trim().to_owned();
        }
        if let Some(url) = get(env_keys::ENGINE_URL) {
            self.engine.base_url = url.trim().to_owned();
        }
        if let Some(key) = get(env_keys::API_KEY) {
            self.engine.api_key = Some(key);
        }
        if let Some(packages) = get(env_keys::PACKAGES) {
            self.runtime.packages.extend(parse_list(&packages));
        }
        if let Some(dir) = get(env_keys::PACKAGE_DIR) {
            self.runtime.package_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(value) = get(env_keys::TEMPERATURE) {
            let temperature = value.trim().parse::<f32>().map_err(|e| {
                KilnError::config(format!("{} must be a number: {e}", env_keys::TEMPERATURE))
            })?;
            self.params.temperature = Some(temperature);
        }
        if let Some(value) = get(env_keys::MAX_TOKENS) {
            let max_tokens = value.trim().parse::<u32>().map_err(|e| {
                KilnError::config(format!("{} must be an integer: {e}", env_keys::MAX_TOKENS))
            })?;
            self.params.max_tokens = Some(max_tokens);
        }
        if let Some(value) = get(env_keys::TIMEOUT) {
            self.engine.timeout = parse_timeout(&value).map_err(|e| {
                KilnError::config(format!("{} must be whole seconds: {e}", env_keys::TIMEOUT))
            })?;
        }
        if let Some(prompt) = get(env_keys::SYSTEM_PROMPT) {
            self.session.system_prompt = Some(prompt);
        }
        Ok(self)
    }

    /// Parse a TOML document layered over the defaults
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid TOML or mistyped fields.
    #[cfg(feature = "config-file")]
    pub fn from_toml(text: &str) -> Result<Self, KilnError> {
        toml::from_str(text).map_err(|e| KilnError::config(format!("Invalid config file: {e}")))
    }

    /// Load the config file at `path`, or the default path when `None`
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read or parsed.
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, KilnError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "Loaded config file");
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(e) => Err(KilnError::config(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Default config file location: `<config_dir>/kiln/config.toml`
#[cfg(feature = "config-file")]
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kiln").join("config.toml"))
}

/// Parse a comma-separated list, dropping empty entries
#[must_use]
pub fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse a timeout value from a string (in seconds)
///
/// # Errors
///
/// Returns an error if the string cannot be parsed as a `u64`.
pub fn parse_timeout(input: &str) -> Result<Duration, ParseIntError> {
    input.trim().parse::<u64>().map(Duration::from_secs)
}
