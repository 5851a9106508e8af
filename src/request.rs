//! Inbound download requests and destination resolution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::download::{DownloadError, filename_from_url, sanitize_filename};

/// A request to download `url`, as sent by browser integrations.
///
/// ```json
/// { "url": "https://example.com/a.iso", "savePath": "", "filename": "a.iso" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    /// Full destination path; empty or absent means "use the default directory".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,
    /// Preferred file name when `save_path` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl DownloadRequest {
    /// Creates a request for `url` with no destination hints.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            save_path: None,
            filename: None,
        }
    }

    /// Parses one line of input: a JSON request object or a bare URL.
    ///
    /// Returns `None` for blank lines and `#` comments.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when a line starting with `{` is not a valid
    /// request object.
    pub fn from_line(line: &str) -> Option<Result<Self, serde_json::Error>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        if line.starts_with('{') {
            return Some(serde_json::from_str(line));
        }
        Some(Ok(Self::new(line)))
    }

    /// Resolves the destination file.
    ///
    /// A non-empty `save_path` is used as is, unless it names an existing
    /// directory, in which case the file name is appended. Otherwise the file
    /// goes to `default_dir` under `filename` or a name derived from the URL.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::InvalidUrl` if the URL does not parse.
    pub fn resolve_path(&self, default_dir: &Path) -> Result<PathBuf, DownloadError> {
        let url = Url::parse(self.url.trim()).map_err(|_| DownloadError::invalid_url(&self.url))?;
        let name = match self.filename.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => sanitize_filename(name),
            _ => filename_from_url(&url),
        };

        match self.save_path.as_deref().map(str::trim) {
            Some(save_path) if !save_path.is_empty() => {
                let save_path = PathBuf::from(save_path);
                if save_path.is_dir() {
                    Ok(save_path.join(name))
                } else {
                    Ok(save_path)
                }
            }
            _ => Ok(default_dir.join(name)),
        }
    }
}
