//! Crate configuration — built from defaults, an optional TOML file at
//! `{data_dir}/config.toml`, and `PARLEY_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_COMPLETION_URL: &str = "https://api.parley.chat/agent/completion";
const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HISTORY_WINDOW: usize = 11;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;
/// Threads are kept forever unless pruning is opted into.
const DEFAULT_PRUNE_DAYS: u32 = 0;
const DEFAULT_SLOW_QUERY_MS: u64 = 100;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// Raw shape of `config.toml`. Every field is optional — absent fields fall
/// through to env vars and then built-in defaults.
#[derive(Debug, Default, Deserialize, Serialize)]
struct TomlConfig {
    /// Override the chat-completion endpoint URL.
    completion_url: Option<String>,
    /// BCP-47 language tag sent with every completion request (default: "en").
    language: Option<String>,
    /// Deadline for the remote completion call in seconds (default: 30).
    request_timeout_secs: Option<u64>,
    /// How many cached messages precede the new user turn in the outbound
    /// payload (default: 11).
    history_window: Option<usize>,
    /// Interval of the periodic registry re-fetch in seconds (default: 5).
    refresh_interval_secs: Option<u64>,
    /// How many days of idle threads to keep before pruning (default: 0 = never).
    thread_prune_days: Option<u32>,
    /// Log SQLite queries slower than this many milliseconds (default: 100;
    /// 0 disables).
    slow_query_threshold_ms: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── ChatConfig ───────────────────────────────────────────────────────────────

/// Resolved configuration shared by every component.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Directory holding the SQLite database and `config.toml`.
    pub data_dir: PathBuf,
    /// Chat-completion endpoint (PARLEY_COMPLETION_URL env var).
    pub completion_url: String,
    /// Language tag sent with every completion request (PARLEY_LANGUAGE env var).
    pub language: String,
    /// Deadline for the remote completion call, in seconds.
    pub request_timeout_secs: u64,
    /// How many cached messages precede the new user turn in the payload.
    pub history_window: usize,
    /// Interval of the periodic registry re-fetch, in seconds.
    pub refresh_interval_secs: u64,
    /// Days of idle threads to keep before pruning (0 = never prune).
    pub thread_prune_days: u32,
    /// Slow-query logging threshold in milliseconds (0 = disabled).
    pub slow_query_threshold_ms: u64,
}

impl ChatConfig {
    /// Build config from an optional data dir + TOML file + env overrides.
    ///
    /// Priority (highest to lowest):
    ///   1. `PARLEY_*` environment variables
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let completion_url = std::env::var("PARLEY_COMPLETION_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.completion_url)
            .unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string());

        let language = std::env::var("PARLEY_LANGUAGE")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.language)
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let request_timeout_secs = toml
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let history_window = toml.history_window.unwrap_or(DEFAULT_HISTORY_WINDOW);
        let refresh_interval_secs = toml
            .refresh_interval_secs
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
        let thread_prune_days = toml.thread_prune_days.unwrap_or(DEFAULT_PRUNE_DAYS);
        let slow_query_threshold_ms = toml
            .slow_query_threshold_ms
            .unwrap_or(DEFAULT_SLOW_QUERY_MS);

        Self {
            data_dir,
            completion_url,
            language,
            request_timeout_secs,
            history_window,
            refresh_interval_secs,
            thread_prune_days,
            slow_query_threshold_ms,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/parley
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("parley");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/parley or ~/.local/share/parley
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("parley");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("parley");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\parley
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("parley");
        }
    }
    // Fallback
    PathBuf::from(".parley")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
