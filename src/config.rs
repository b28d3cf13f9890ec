//! Bridge configuration.
//!
//! Settings come from `.langbridge.json` in the workspace root (or the file
//! passed with `--config`), then the `LANGBRIDGE_SERVER` and
//! `LANGBRIDGE_TRACE` environment variables, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::client::{LanguageClientConfig, TransportKind};
use crate::rpc::{Trace, TraceFormat};

/// Name of the configuration file looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = ".langbridge.json";

/// Overrides the server command line, e.g. `pyright-langserver --stdio`.
pub const SERVER_ENV: &str = "LANGBRIDGE_SERVER";

/// Overrides the trace level.
pub const TRACE_ENV: &str = "LANGBRIDGE_TRACE";

/// Contents of `.langbridge.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub server_command: String,
    pub server_args: Vec<String>,
    pub transport: TransportKind,
    pub port: u16,
    pub trace: Trace,
    pub trace_format: TraceFormat,
    pub partial_message_timeout_ms: u64,
    pub change_delay_ms: u64,
    pub init_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let defaults = LanguageClientConfig::default();
        Self {
            server_command: defaults.server_command,
            server_args: defaults.server_args,
            transport: defaults.transport,
            port: defaults.port,
            trace: defaults.trace,
            trace_format: defaults.trace_format,
            partial_message_timeout_ms: millis(defaults.partial_message_timeout),
            change_delay_ms: millis(defaults.change_delay),
            init_timeout_ms: millis(defaults.init_timeout),
            request_timeout_ms: millis(defaults.request_timeout),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl BridgeConfig {
    /// Loads the configuration and applies environment overrides.
    ///
    /// An explicit `path` must exist. Without one, `.langbridge.json` in
    /// `workspace` is used if present, otherwise the defaults.
    ///
    /// ## Errors
    /// Returns an error if:
    /// - The file cannot be read or is not valid JSON
    /// - An environment override is invalid
    pub fn load(path: Option<&Path>, workspace: &Path) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = workspace.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(
            std::env::var(SERVER_ENV).ok().as_deref(),
            std::env::var(TRACE_ENV).ok().as_deref(),
        )?;
        Ok(config)
    }

    /// Reads a configuration file. Missing keys take their defaults.
    ///
    /// ## Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {} - invalid JSON", path.display()))
    }

    /// Applies the server command line and trace level overrides.
    ///
    /// ## Errors
    /// Returns an error if the server command line is empty or the trace
    /// level is unknown.
    pub fn apply_overrides(&mut self, server: Option<&str>, trace: Option<&str>) -> Result<()> {
        if let Some(server) = server {
            let mut words = server.split_whitespace().map(str::to_string);
            let Some(command) = words.next() else {
                bail!("{SERVER_ENV} is set but empty");
            };
            self.server_command = command;
            self.server_args = words.collect();
        }
        if let Some(trace) = trace {
            self.trace = trace
                .parse()
                .map_err(|e: String| anyhow::anyhow!("{TRACE_ENV}: {e}"))?;
        }
        Ok(())
    }

    /// Builds the client configuration for `workspace_root`.
    pub fn to_client_config(&self, workspace_root: &Path) -> LanguageClientConfig {
        LanguageClientConfig {
            server_command: self.server_command.clone(),
            server_args: self.server_args.clone(),
            workspace_root: workspace_root.to_path_buf(),
            transport: self.transport,
            port: self.port,
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            change_delay: Duration::from_millis(self.change_delay_ms),
            trace: self.trace,
            trace_format: self.trace_format,
            partial_message_timeout: Duration::from_millis(self.partial_message_timeout_ms),
        }
    }
}

/// Writes a default `.langbridge.json` into `dir` and returns its path.
///
/// ## Errors
/// Returns an error if:
/// - The file already exists
/// - File I/O fails
pub fn write_default(dir: &Path) -> Result<PathBuf> {
    let config_file = dir.join(CONFIG_FILE_NAME);
    if config_file.exists() {
        bail!(
            "{} already exists\n\n\
            To regenerate it, first remove the existing file, then run:\n  \
            langbridge init",
            config_file.display()
        );
    }

    // Write atomically (temp file + rename)
    let temp_file = config_file.with_extension("json.tmp");
    let json_str = serde_json::to_string_pretty(&BridgeConfig::default())
        .context("failed to serialize configuration")?;
    fs::write(&temp_file, json_str).context("failed to write temporary config file")?;
    fs::rename(&temp_file, &config_file).context("failed to rename temporary config file")?;

    Ok(config_file)
}
