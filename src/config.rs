//! User settings: default download directory, chunk count, listen port and
//! history backend.
//!
//! Settings are read from `$XDG_CONFIG_HOME/downloader/config.toml`
//! (fallback `$HOME/.config/downloader/config.toml`). The file uses a flat
//! `key = value` subset of TOML:
//!
//! ```toml
//! download_dir = "/home/me/Downloads"
//! chunk_count = 8          # 1..=32
//! listen_port = 8080
//! history_backend = "sqlite"
//! history_path = "/home/me/.local/share/downloader/history.db"
//! ```

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::db::Database;
use crate::download::{DEFAULT_CHUNK_COUNT, MAX_CHUNK_COUNT};
use crate::history::{
    HistoryError, HistoryStore, JsonHistoryStore, MemoryHistoryStore, SqliteHistoryStore,
};

/// Default port of the local request listener.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but cannot be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The config file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not of the form `key = value`, or the key is unknown.
    #[error("invalid config syntax on line {line}: {message}")]
    Syntax {
        /// 1-based line number.
        line: usize,
        /// What is wrong with the line.
        message: String,
    },

    /// A value does not parse or is out of range.
    #[error("invalid config value for `{key}` on line {line}: {message}")]
    Value {
        /// The offending key.
        key: String,
        /// 1-based line number.
        line: usize,
        /// Why the value was rejected.
        message: String,
    },
}

impl ConfigError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    fn value(key: &str, line: usize, message: impl Into<String>) -> Self {
        Self::Value {
            key: key.to_string(),
            line,
            message: message.into(),
        }
    }
}

/// Where finished downloads are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryBackend {
    #[default]
    Json,
    Sqlite,
    Memory,
}

impl HistoryBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for HistoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err("expected one of: json, sqlite, memory".to_string()),
        }
    }
}

/// Settings read at task creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory used when a request carries no save path.
    pub download_dir: PathBuf,
    /// Chunks per task when none is requested.
    pub chunk_count: usize,
    /// Port of the local request listener.
    pub listen_port: u16,
    pub history_backend: HistoryBackend,
    /// Explicit history location; see [`Settings::history_path`].
    pub history_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            chunk_count: DEFAULT_CHUNK_COUNT,
            listen_port: DEFAULT_LISTEN_PORT,
            history_backend: HistoryBackend::default(),
            history_path: None,
        }
    }
}

impl Settings {
    /// Loads settings from the default config path, or defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but is unreadable or invalid.
    pub fn load() -> Result<Self, ConfigError> {
        match resolve_default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Loads settings from `path`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is unreadable or invalid.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading config");
        Self::parse(&raw)
    }

    /// Parses config text on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Syntax` for malformed lines or unknown keys and
    /// `ConfigError::Value` for bad or out-of-range values.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        for (line_index, raw_line) in raw.lines().enumerate() {
            let line_no = line_index + 1;
            let line = strip_inline_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let Some((raw_key, raw_value)) = line.split_once('=') else {
                return Err(ConfigError::syntax(line_no, "expected key = value"));
            };
            let key = raw_key.trim();
            let value = raw_value.trim();

            match key {
                "download_dir" => {
                    let parsed = parse_string_literal(value)
                        .map_err(|m| ConfigError::value(key, line_no, m))?;
                    settings.download_dir = PathBuf::from(parsed);
                }
                "chunk_count" => {
                    let parsed = parse_integer(value)
                        .map_err(|m| ConfigError::value(key, line_no, m))?;
                    if !(1..=MAX_CHUNK_COUNT as u64).contains(&parsed) {
                        return Err(ConfigError::value(
                            key,
                            line_no,
                            format!("{parsed} is outside 1..={MAX_CHUNK_COUNT}"),
                        ));
                    }
                    settings.chunk_count = usize::try_from(parsed)
                        .map_err(|e| ConfigError::value(key, line_no, e.to_string()))?;
                }
                "listen_port" => {
                    let parsed = parse_integer(value)
                        .map_err(|m| ConfigError::value(key, line_no, m))?;
                    settings.listen_port = u16::try_from(parsed)
                        .ok()
                        .filter(|port| *port > 0)
                        .ok_or_else(|| {
                            ConfigError::value(key, line_no, format!("{parsed} is outside 1..=65535"))
                        })?;
                }
                "history_backend" => {
                    let parsed = parse_string_literal(value)
                        .map_err(|m| ConfigError::value(key, line_no, m))?;
                    settings.history_backend = parsed
                        .parse()
                        .map_err(|m: String| ConfigError::value(key, line_no, m))?;
                }
                "history_path" => {
                    let parsed = parse_string_literal(value)
                        .map_err(|m| ConfigError::value(key, line_no, m))?;
                    settings.history_path = Some(PathBuf::from(parsed));
                }
                unknown => {
                    return Err(ConfigError::syntax(
                        line_no,
                        format!("unknown configuration key '{unknown}'"),
                    ));
                }
            }
        }
        Ok(settings)
    }

    /// History location: the explicit path, else `<data dir>/downloader/`
    /// `history.json` or `history.db` depending on the backend.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        if let Some(path) = &self.history_path {
            return path.clone();
        }
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("downloader");
        match self.history_backend {
            HistoryBackend::Sqlite => base.join("history.db"),
            HistoryBackend::Json | HistoryBackend::Memory => base.join("history.json"),
        }
    }

    /// Opens the configured history backend.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError` if the file or database cannot be opened.
    pub async fn open_history(&self) -> Result<Arc<dyn HistoryStore>, HistoryError> {
        let store: Arc<dyn HistoryStore> = match self.history_backend {
            HistoryBackend::Memory => Arc::new(MemoryHistoryStore::new()),
            HistoryBackend::Json => Arc::new(JsonHistoryStore::open(self.history_path()).await?),
            HistoryBackend::Sqlite => {
                let db = Database::new(&self.history_path())
                    .await
                    .map_err(HistoryError::database)?;
                Arc::new(SqliteHistoryStore::new(db))
            }
        };
        Ok(store)
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/downloader/config.toml`
/// 2. `$HOME/.config/downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("downloader")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("downloader")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String, String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        return Err("expected double-quoted string".to_string());
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer(raw_value: &str) -> Result<u64, String> {
    let token = raw_value.trim();
    if token.is_empty() {
        return Err("expected integer value".to_string());
    }
    let value = token.parse::<i128>().map_err(|e| e.to_string())?;
    if value < 0 {
        return Err("expected non-negative integer".to_string());
    }
    u64::try_from(value).map_err(|_| "integer value out of range".to_string())
}
