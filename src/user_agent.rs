//! Shared User-Agent string for probe and chunk requests.
//!
//! Some mirrors refuse ranged requests from unknown clients, so both the HEAD
//! probe and every chunk GET present a browser-like identity.

/// Browser User-Agent sent with every download request.
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Default User-Agent for download requests.
#[must_use]
pub(crate) fn default_download_user_agent() -> &'static str {
    BROWSER_USER_AGENT
}
