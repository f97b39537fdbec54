//! Shared User-Agent string for archive and download HTTP clients.
//!
//! Archive mirrors reject obvious bot agents outright, so requests present a
//! desktop browser identity with the tool name appended.

/// Browser identity sent before the tool suffix.
const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Default User-Agent for every outgoing request.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{BROWSER_UA} book-downloader/{version}")
}
