use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// File name looked up in the current directory before the home fallback.
pub const LOCAL_CONFIG_FILE: &str = "flowchat.toml";

/// Top-level flowchat configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Assistant the sessions are reported under.
    #[serde(default = "default_assistant_id")]
    pub assistant_id: String,
    /// Flow file or directory, or the `http(s)://` root of a backend
    /// serving `/api/assistants/{id}/flow`.
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assistant_id: default_assistant_id(),
            flow: None,
            workspace: default_workspace(),
        }
    }
}

fn default_assistant_id() -> String { "local".to_string() }
fn default_workspace() -> String { "~/.flowchat".to_string() }

/// Reveal timing. All values in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "default_per_char")]
    pub per_char_ms: u64,
    #[serde(default = "default_inter_element_pause")]
    pub inter_element_pause_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            per_char_ms: default_per_char(),
            inter_element_pause_ms: default_inter_element_pause(),
        }
    }
}

impl PacingConfig {
    /// No delays at all. Every reveal happens on node entry.
    pub fn instant() -> Self {
        Self {
            min_delay_ms: 0,
            per_char_ms: 0,
            inter_element_pause_ms: 0,
        }
    }

    /// Simulated typing time for `content`.
    pub fn typing_delay(&self, content: &str) -> Duration {
        let chars = content.chars().count() as u64;
        let ms = chars.saturating_mul(self.per_char_ms).max(self.min_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.inter_element_pause_ms)
    }
}

fn default_min_delay() -> u64 { 500 }
fn default_per_char() -> u64 { 10 }
fn default_inter_element_pause() -> u64 { 600 }

/// Bot texts the engine produces on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesConfig {
    /// Re-prompt after a response that matches no option and has no fallback.
    #[serde(default = "default_unmatched")]
    pub unmatched: String,
    /// Shown when the session cannot be created or the flow cannot be loaded.
    #[serde(default = "default_start_failed")]
    pub start_failed: String,
    #[serde(default = "default_no_start_node")]
    pub no_start_node: String,
    /// Shown when an auto-advancing node has nowhere to go.
    #[serde(default = "default_dead_end")]
    pub dead_end: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            unmatched: default_unmatched(),
            start_failed: default_start_failed(),
            no_start_node: default_no_start_node(),
            dead_end: default_dead_end(),
        }
    }
}

fn default_unmatched() -> String { "Sorry, I didn't get that. Please choose one of the options.".to_string() }
fn default_start_failed() -> String { "Sorry, this conversation could not be started. Please try again later.".to_string() }
fn default_no_start_node() -> String { "This assistant has no starting point configured.".to_string() }
fn default_dead_end() -> String { "This conversation has ended.".to_string() }

/// Where telemetry goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryBackend {
    #[default]
    Log,
    Sqlite,
    Http,
    None,
}

impl TelemetryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryBackend::Log => "log",
            TelemetryBackend::Sqlite => "sqlite",
            TelemetryBackend::Http => "http",
            TelemetryBackend::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub backend: TelemetryBackend,
    /// SQLite database. Default: <workspace>/flowchat.db
    #[serde(default)]
    pub db_path: Option<String>,
    /// Backend API root for the http backend, e.g. `https://bots.example.com`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token sent to the backend API.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry policy for fire-and-forget telemetry writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

/// JSONL transcript logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable transcript logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for transcript files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = session lifecycle, 2 = plus messages, 3 = plus every reveal step (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(&expand_env_vars(content)).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Pick the config file: the explicit path, else `./flowchat.toml`,
    /// else `~/.flowchat/config.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return local;
        }
        expand_home("~/.flowchat/config.toml")
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn db_path(&self) -> PathBuf {
        match &self.telemetry.db_path {
            Some(p) => expand_home(p),
            None => self.workspace_dir().join("flowchat.db"),
        }
    }

    /// Transcript directory when transcript logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Replace `${NAME}` with the value of environment variable `NAME`.
/// Unset variables and unterminated references are left untouched.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
