// ABOUTME: Embedded Lua runtime bootstrap with a sandboxed stdlib and a preload-based package installer
// ABOUTME: Exposes host-function registration and script evaluation to the bridge and session layers
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Embedded Runtime
//!
//! The session controller lives inside a Lua 5.4 state. Bootstrapping creates
//! that state with a restricted standard library, installs the host `json`
//! module, then installs every configured package in order. Packages are
//! compiled at install time and registered in `package.preload`, so a
//! `require` never touches the filesystem.
//!
//! Any failure during bootstrap is fatal; there is no partial runtime.

use std::path::{Path, PathBuf};

use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, Table, Value};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::types::KilnError;

/// Maximum accepted size of one package source (1 MiB)
const MAX_PACKAGE_BYTES: u64 = 1024 * 1024;

/// Module name the session controller script is installed under
pub const SESSION_MODULE: &str = "kiln_session";

/// Built-in session controller source
const SESSION_SOURCE: &str = include_str!("lua/session.lua");

/// Module names a package may not take: the host `json` module, the session
/// controller, and the loaded standard libraries
const RESERVED_MODULES: &[&str] = &[
    "json",
    SESSION_MODULE,
    "_G",
    "coroutine",
    "math",
    "package",
    "string",
    "table",
    "utf8",
];

/// Base-library globals removed from the sandbox
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "collectgarbage"];

/// Map an `mlua` error back into a [`KilnError`]
///
/// Errors raised by host functions keep their original kind even after
/// travelling through Lua (including `pcall` and re-raise). Anything else is
/// passed to `fallback` as a message.
pub(crate) fn map_lua_error(err: &mlua::Error, fallback: impl FnOnce(String) -> KilnError) -> KilnError {
    match err {
        mlua::Error::ExternalError(inner) => match inner.downcast_ref::<KilnError>() {
            Some(kiln) => kiln.clone(),
            None => fallback(inner.to_string()),
        },
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            map_lua_error(cause, fallback)
        }
        mlua::Error::RuntimeError(message) => fallback(message.clone()),
        mlua::Error::SyntaxError { message, .. } => fallback(message.clone()),
        other => fallback(other.to_string()),
    }
}

/// Convert JSON into a Lua value, mapping `null` to `nil`
pub(crate) fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

// ============================================================================
// Runtime handle
// ============================================================================

/// A bootstrapped Lua runtime
pub struct RuntimeHandle {
    lua: Lua,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle").finish_non_exhaustive()
    }
}

impl RuntimeHandle {
    /// Create a sandboxed runtime with the host `json` module but no packages
    ///
    /// # Errors
    ///
    /// Returns a bootstrap error if the Lua state cannot be created.
    pub fn new() -> Result<Self, KilnError> {
        let libs = StdLib::COROUTINE
            | StdLib::TABLE
            | StdLib::STRING
            | StdLib::UTF8
            | StdLib::MATH
            | StdLib::PACKAGE;
        let lua = Lua::new_with(libs, LuaOptions::default())
            .map_err(|e| KilnError::bootstrap(format!("Failed to create Lua state: {e}")))?;

        let handle = Self { lua };
        handle
            .sandbox()
            .and_then(|()| handle.install_json_module())
            .map_err(|e| KilnError::bootstrap(format!("Failed to prepare Lua state: {e}")))?;
        Ok(handle)
    }

    fn sandbox(&self) -> mlua::Result<()> {
        let globals = self.lua.globals();
        for name in REMOVED_GLOBALS {
            globals.set(*name, Value::Nil)?;
        }
        let package: Table = globals.get("package")?;
        package.set("path", "")?;
        package.set("cpath", "")?;
        Ok(())
    }

    fn install_json_module(&self) -> mlua::Result<()> {
        let json = self.lua.create_table()?;
        json.set(
            "encode",
            self.lua.create_function(|_, value: Value| {
                serde_json::to_string(&value).map_err(mlua::Error::external)
            })?,
        )?;
        json.set(
            "decode",
            self.lua.create_function(|lua, text: String| {
                let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                    mlua::Error::external(KilnError::malformed_response(format!("Invalid JSON: {e}")))
                })?;
                json_to_lua(lua, &value)
            })?,
        )?;
        self.loaded()?.set("json", json)
    }

    fn loaded(&self) -> mlua::Result<Table> {
        let package: Table = self.lua.globals().get("package")?;
        package.get("loaded")
    }

    fn preload(&self) -> mlua::Result<Table> {
        let package: Table = self.lua.globals().get("package")?;
        package.get("preload")
    }

    /// The underlying Lua state
    pub const fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Register a host function as a runtime global
    ///
    /// # Errors
    ///
    /// Returns an internal error if the global cannot be set.
    pub fn define_host_function(&self, name: &str, function: Function) -> Result<(), KilnError> {
        self.lua
            .globals()
            .set(name, function)
            .map_err(|e| KilnError::internal(format!("Failed to define host function {name}: {e}")))?;
        debug!(name, "Host function defined");
        Ok(())
    }

    /// Whether a global with this name exists
    pub fn has_global(&self, name: &str) -> bool {
        self.lua
            .globals()
            .contains_key(name)
            .unwrap_or(false)
    }

    /// Evaluate a synchronous script and return its value as JSON
    ///
    /// # Errors
    ///
    /// Returns a bridge-call error carrying the Lua error message, or the
    /// original kind if a host function failed.
    pub fn run_script(&self, source: &str) -> Result<serde_json::Value, KilnError> {
        let value: Value = self
            .lua
            .load(source)
            .set_name("=script")
            .eval()
            .map_err(|e| map_lua_error(&e, KilnError::bridge_call))?;
        self.to_json(value)
    }

    /// Evaluate a script that may await host functions
    ///
    /// # Errors
    ///
    /// Same as [`Self::run_script`].
    pub async fn run_script_async(&self, source: &str) -> Result<serde_json::Value, KilnError> {
        let value: Value = self
            .lua
            .load(source)
            .set_name("=script")
            .eval_async()
            .await
            .map_err(|e| map_lua_error(&e, KilnError::bridge_call))?;
        self.to_json(value)
    }

    fn to_json(&self, value: Value) -> Result<serde_json::Value, KilnError> {
        self.lua
            .from_value(value)
            .map_err(|e| KilnError::malformed_response(format!("Script result is not JSON: {e}")))
    }

    /// Load an installed module through `require`
    ///
    /// # Errors
    ///
    /// Returns a session-init error if the module is missing, fails while
    /// loading, or does not evaluate to a table.
    pub fn require(&self, name: &str) -> Result<Table, KilnError> {
        let require: Function = self
            .lua
            .globals()
            .get("require")
            .map_err(|e| KilnError::internal(format!("require is unavailable: {e}")))?;
        require
            .call::<Table>(name)
            .map_err(|e| map_lua_error(&e, |m| KilnError::session_init(format!("require {name}: {m}"))))
    }

    /// Installer for additional packages
    pub fn installer(&self, package_dir: Option<PathBuf>) -> PackageInstaller<'_> {
        PackageInstaller::new(self, package_dir)
    }

    fn register_source(&self, module: &str, chunk_name: &str, source: &str) -> Result<(), KilnError> {
        let loader = self
            .lua
            .load(source)
            .set_name(format!("@{chunk_name}"))
            .into_function()
            .map_err(|e| map_lua_error(&e, |m| KilnError::bootstrap(format!("{module}: {m}"))))?;
        self.preload()
            .and_then(|preload| preload.set(module, loader))
            .map_err(|e| KilnError::bootstrap(format!("Failed to register {module}: {e}")))
    }
}

// ============================================================================
// Packages
// ============================================================================

/// Where a package's source comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Bare module name, resolved against the package directory
    Named(String),
    /// Explicit path to a `.lua` file
    File(PathBuf),
    /// `http(s)` URL
    Url(String),
}

impl PackageSource {
    /// Classify a package spec
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        if spec.starts_with("http://") || spec.starts_with("https://") {
            Self::Url(spec.to_owned())
        } else if spec.contains('/') || spec.contains('\\') || spec.ends_with(".lua") {
            Self::File(PathBuf::from(spec))
        } else {
            Self::Named(spec.to_owned())
        }
    }

    /// Module name the package is registered under
    ///
    /// # Errors
    ///
    /// Returns a bootstrap error when no valid module name can be derived.
    pub fn module_name(&self) -> Result<String, KilnError> {
        let name = match self {
            Self::Named(name) => name.clone(),
            Self::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                let last = path.rsplit('/').next().unwrap_or_default();
                last.strip_suffix(".lua").unwrap_or(last).to_owned()
            }
        };
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(KilnError::bootstrap(format!(
                "Invalid package name derived from {self:?}"
            )));
        }
        if RESERVED_MODULES.contains(&name.as_str()) {
            return Err(KilnError::bootstrap(format!(
                "Package name '{name}' is reserved by the runtime"
            )));
        }
        Ok(name)
    }
}

/// Resolve a bare package name to a file inside `package_dir`
///
/// # Errors
///
/// Returns a bootstrap error when no directory is configured or the file does
/// not exist.
pub fn resolve_named_package(name: &str, package_dir: Option<&Path>) -> Result<PathBuf, KilnError> {
    let Some(dir) = package_dir else {
        return Err(KilnError::bootstrap(format!(
            "Package '{name}' requested but no package directory is configured"
        )));
    };
    let path = dir.join(format!("{name}.lua"));
    if path.is_file() {
        debug!(package = name, path = %path.display(), "Resolved package");
        Ok(path)
    } else {
        Err(KilnError::bootstrap(format!(
            "Package '{name}' not found at {}",
            path.display()
        )))
    }
}

async fn read_source_capped(path: &Path) -> Result<String, KilnError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| KilnError::bootstrap(format!("Failed to open {}: {e}", path.display())))?;
    let mut buf = Vec::new();
    file.take(MAX_PACKAGE_BYTES + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| KilnError::bootstrap(format!("Failed to read {}: {e}", path.display())))?;
    if buf.len() as u64 > MAX_PACKAGE_BYTES {
        return Err(KilnError::bootstrap(format!(
            "{} exceeds the {MAX_PACKAGE_BYTES} byte package limit",
            path.display()
        )));
    }
    String::from_utf8(buf)
        .map_err(|e| KilnError::bootstrap(format!("{} is not UTF-8: {e}", path.display())))
}

#[cfg(feature = "remote-packages")]
async fn fetch_source_capped(url: &str) -> Result<String, KilnError> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| KilnError::bootstrap(format!("Failed to fetch {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(KilnError::bootstrap(format!(
            "Fetching {url} returned {}",
            response.status()
        )));
    }
    if response
        .content_length()
        .is_some_and(|len| len > MAX_PACKAGE_BYTES)
    {
        return Err(KilnError::bootstrap(format!(
            "{url} exceeds the {MAX_PACKAGE_BYTES} byte package limit"
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| KilnError::bootstrap(format!("Failed to read {url}: {e}")))?;
    if bytes.len() as u64 > MAX_PACKAGE_BYTES {
        return Err(KilnError::bootstrap(format!(
            "{url} exceeds the {MAX_PACKAGE_BYTES} byte package limit"
        )));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|e| KilnError::bootstrap(format!("{url} is not UTF-8: {e}")))
}

#[cfg(not(feature = "remote-packages"))]
#[allow(clippy::unused_async)]
async fn fetch_source_capped(url: &str) -> Result<String, KilnError> {
    Err(KilnError::bootstrap(format!(
        "Cannot fetch {url}: built without remote package support"
    )))
}

/// Installs packages into a runtime's `package.preload`
pub struct PackageInstaller<'a> {
    runtime: &'a RuntimeHandle,
    package_dir: Option<PathBuf>,
}

impl<'a> PackageInstaller<'a> {
    const fn new(runtime: &'a RuntimeHandle, package_dir: Option<PathBuf>) -> Self {
        Self {
            runtime,
            package_dir,
        }
    }

    /// Fetch, compile, and register one package; returns its module name
    ///
    /// # Errors
    ///
    /// Returns a bootstrap error if the package cannot be resolved, fetched,
    /// or compiled.
    pub async fn install(&self, name_or_url: &str) -> Result<String, KilnError> {
        let source = PackageSource::parse(name_or_url);
        let module = source.module_name()?;

        let text = match &source {
            PackageSource::Named(name) => {
                let path = resolve_named_package(name, self.package_dir.as_deref())?;
                read_source_capped(&path).await?
            }
            PackageSource::File(path) => read_source_capped(path).await?,
            PackageSource::Url(url) => fetch_source_capped(url).await?,
        };

        self.runtime.register_source(&module, &module, &text)?;
        info!(package = %module, bytes = text.len(), "Package installed");
        Ok(module)
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Create a runtime and install every configured package plus the session script
///
/// Packages are installed one at a time in configuration order. The first
/// failure aborts the bootstrap.
///
/// # Errors
///
/// Returns a bootstrap error for any runtime, package, or script failure.
pub async fn bootstrap(config: &RuntimeConfig) -> Result<RuntimeHandle, KilnError> {
    let runtime = RuntimeHandle::new()?;

    {
        let installer = runtime.installer(config.package_dir.clone());
        for package in &config.packages {
            installer.install(package).await?;
        }
    }

    match &config.session_script {
        Some(path) => {
            let source = read_source_capped(path).await?;
            runtime.register_source(SESSION_MODULE, &path.display().to_string(), &source)?;
            info!(path = %path.display(), "Session script installed from override");
        }
        None => {
            runtime.register_source(SESSION_MODULE, "kiln_session.lua", SESSION_SOURCE)?;
            debug!("Built-in session script installed");
        }
    }

    info!(packages = config.packages.len(), "Runtime bootstrapped");
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::types::ErrorKind;

    fn write_package(dir: &Path, name: &str, source: &str) -> PathBuf {
        let path = dir.join(format!("{name}.lua"));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    #[test]
    fn classifies_package_specs() {
        assert_eq!(PackageSource::parse("greeter"), PackageSource::Named("greeter".into()));
        assert_eq!(
            PackageSource::parse("./lib/greeter.lua"),
            PackageSource::File(PathBuf::from("./lib/greeter.lua"))
        );
        assert_eq!(
            PackageSource::parse("https://example.com/pkgs/greeter.lua?v=2"),
            PackageSource::Url("https://example.com/pkgs/greeter.lua?v=2".into())
        );
        assert_eq!(
            PackageSource::parse("https://example.com/pkgs/greeter.lua?v=2")
                .module_name()
                .unwrap(),
            "greeter"
        );
        assert!(PackageSource::parse("bad name").module_name().is_err());
    }

    #[tokio::test]
    async fn reserved_package_names_fail_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "json", "return {}");
        write_package(dir.path(), SESSION_MODULE, "return { VERSION = 1 }");

        for package in ["json", SESSION_MODULE, "./lib/string.lua"] {
            let config = RuntimeConfig {
                packages: vec![package.to_owned()],
                package_dir: Some(dir.path().to_path_buf()),
                ..RuntimeConfig::default()
            };
            let err = bootstrap(&config).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Bootstrap);
            assert!(err.message.contains("reserved"), "{package}: {}", err.message);
        }
    }

    #[test]
    fn sandbox_removes_file_access() {
        let runtime = RuntimeHandle::new().unwrap();
        let value = runtime
            .run_script("return { io == nil, os == nil, dofile == nil, package.path }")
            .unwrap();
        assert_eq!(value, serde_json::json!([true, true, true, ""]));
    }

    #[test]
    fn json_module_round_trips_nested_values() {
        let runtime = RuntimeHandle::new().unwrap();
        let value = runtime
            .run_script(
                r#"
                local json = require("json")
                local t = json.decode('{"a":[1,2],"b":null,"c":"q\\"uote"}')
                return { t.b == nil, #t.a, json.decode(json.encode(t.c)) }
                "#,
            )
            .unwrap();
        assert_eq!(value, serde_json::json!([true, 2, "q\"uote"]));
    }

    #[test]
    fn script_errors_become_bridge_call_errors() {
        let runtime = RuntimeHandle::new().unwrap();
        let err = runtime.run_script("error('boom', 0)").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BridgeCall);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn host_errors_keep_their_kind_through_pcall() {
        let runtime = RuntimeHandle::new().unwrap();
        let failing = runtime
            .lua()
            .create_function(|_, ()| -> mlua::Result<()> {
                Err(mlua::Error::external(KilnError::malformed_response("bad json")))
            })
            .unwrap();
        runtime.define_host_function("failing", failing).unwrap();
        assert!(runtime.has_global("failing"));

        let err = runtime
            .run_script("local ok, e = pcall(failing); error(e, 0)")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedResponse);
        assert_eq!(err.message, "bad json");
    }

    #[tokio::test]
    async fn bootstrap_installs_named_packages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "greeter", "return { hello = function(n) return 'hi ' .. n end }");
        let config = RuntimeConfig {
            packages: vec!["greeter".to_owned()],
            package_dir: Some(dir.path().to_path_buf()),
            session_script: None,
        };

        let runtime = bootstrap(&config).await.unwrap();
        let value = runtime
            .run_script("return require('greeter').hello('kiln')")
            .unwrap();
        assert_eq!(value, serde_json::json!("hi kiln"));
        assert!(runtime.require(SESSION_MODULE).is_ok());
    }

    #[tokio::test]
    async fn bootstrap_fails_on_first_missing_package() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "present", "return {}");
        let config = RuntimeConfig {
            packages: vec!["absent".to_owned(), "present".to_owned()],
            package_dir: Some(dir.path().to_path_buf()),
            session_script: None,
        };

        let err = bootstrap(&config).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Bootstrap);
        assert!(err.message.contains("absent"));
    }

    #[tokio::test]
    async fn syntax_errors_fail_at_install_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_package(dir.path(), "broken", "return {");
        let runtime = RuntimeHandle::new().unwrap();
        let err = runtime
            .installer(None)
            .install(&path.display().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Bootstrap);
        assert!(err.message.starts_with("broken:"));
    }

    #[tokio::test]
    async fn oversized_packages_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("return '{}'", "x".repeat(usize::try_from(MAX_PACKAGE_BYTES).unwrap()));
        write_package(dir.path(), "huge", &body);
        let runtime = RuntimeHandle::new().unwrap();
        let err = runtime
            .installer(Some(dir.path().to_path_buf()))
            .install("huge")
            .await
            .unwrap_err();
        assert!(err.message.contains("package limit"));
    }

    #[tokio::test]
    async fn async_scripts_can_await_host_functions() {
        let runtime = RuntimeHandle::new().unwrap();
        let double = runtime
            .lua()
            .create_async_function(|_, n: i64| async move {
                tokio::task::yield_now().await;
                Ok(n * 2)
            })
            .unwrap();
        runtime.define_host_function("double", double).unwrap();
        let value = runtime.run_script_async("return double(21)").await.unwrap();
        assert_eq!(value, serde_json::json!(42));
    }
}
