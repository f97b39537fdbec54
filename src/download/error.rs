//! Error types for the download module.
//!
//! This module defines structured errors for fetch, hand-off and coordinator
//! operations, providing context-rich messages for logs and queue entries.

use std::path::PathBuf;

use thiserror::Error;

use crate::bypass::BypassError;

/// Errors that can occur while fetching a page or a file.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The server answered with a web page where a book file was expected.
    #[error("{url} returned a {content_type} page ({received_bytes} bytes) instead of a file")]
    MarkupResponse {
        /// The URL that served markup.
        url: String,
        /// Content type reported by the server.
        content_type: String,
        /// Bytes received before the response was rejected.
        received_bytes: u64,
    },

    /// The item's cancel token was signalled mid-transfer.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL being fetched when cancellation was observed.
        url: String,
    },

    /// The web bypasser failed to produce a page.
    #[error("bypass failed for {url}: {source}")]
    Bypass {
        /// The URL handed to the bypasser.
        url: String,
        /// The underlying bypasser error.
        #[source]
        source: BypassError,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, mapping timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            return Self::Timeout { url };
        }
        Self::Network { url, source }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a markup-instead-of-file error.
    pub fn markup(url: impl Into<String>, content_type: impl Into<String>, received_bytes: u64) -> Self {
        Self::MarkupResponse {
            url: url.into(),
            content_type: content_type.into(),
            received_bytes,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Creates a bypasser error.
    pub fn bypass(url: impl Into<String>, source: BypassError) -> Self {
        Self::Bypass {
            url: url.into(),
            source,
        }
    }

    /// Returns true if this error came from a cancel signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the HTTP status code if this is an HTTP error.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised while moving a finished file into the ingest directory.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Copying into the ingest directory failed after a rename was refused.
    #[error(
        "could not move {from} to {to}: rename failed ({rename_error}), copy failed ({copy_error})"
    )]
    MoveFailed {
        /// Scratch file.
        from: PathBuf,
        /// Destination in the ingest directory.
        to: PathBuf,
        /// Why the rename was refused.
        rename_error: std::io::Error,
        /// Why the copy fallback failed.
        copy_error: std::io::Error,
    },

    /// The copied file does not match the source size.
    #[error("copy of {path} is incomplete: expected {expected_bytes} bytes, got {actual_bytes}")]
    Incomplete {
        /// Intermediate path that failed verification.
        path: PathBuf,
        /// Source size in bytes.
        expected_bytes: u64,
        /// Copied size in bytes.
        actual_bytes: u64,
    },

    /// Any other filesystem failure during hand-off.
    #[error("IO error handing off {path}: {source}")]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The item was cancelled before its file became visible.
    #[error("hand-off of {path} cancelled")]
    Cancelled {
        /// Scratch file that was being delivered.
        path: PathBuf,
    },
}

impl HandoffError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned by the coordinator's post-download hook.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script could not be started.
    #[error("failed to run custom script {script}: {source}")]
    Spawn {
        /// Script path.
        script: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The script exited unsuccessfully.
    #[error("custom script {script} exited with {code:?}")]
    Failed {
        /// Script path.
        script: PathBuf,
        /// Exit code, absent when killed by a signal.
        code: Option<i32>,
    },
}
