//! Constants for the download module (timeouts, retry ladder, payload checks).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default retry ceiling for page and binary fetches.
pub const DEFAULT_MAX_RETRY: u32 = 10;

/// Default base sleep of the linear backoff ladder.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(5);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// A markup response smaller than this share of the expected size is treated
/// as an interstitial page rather than the book.
pub const MARKUP_SIZE_RATIO: f64 = 0.9;

/// Content types that are never a book payload.
pub const MARKUP_CONTENT_TYPES: &[&str] = &["text/html", "application/xhtml+xml"];
