//! Error types for archive managers.

use thiserror::Error;

/// Errors that can occur during archive lookups.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The page could not be fetched after the retry ladder ran out.
    #[error("failed to fetch {url}")]
    Fetch {
        /// Page that was requested.
        url: String,
    },

    /// The page was fetched but did not have the expected structure.
    #[error("failed to parse {url}: {message}")]
    Parse {
        /// Page that was parsed.
        url: String,
        /// What was missing.
        message: String,
    },

    /// The identifier is empty or malformed.
    #[error("invalid book id: {id:?}")]
    InvalidId {
        /// Offending identifier.
        id: String,
    },

    /// No manager is registered under the requested id.
    #[error("unknown archive manager: {id}")]
    UnknownManager {
        /// Requested manager id.
        id: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl ArchiveError {
    /// Creates a fetch error.
    pub fn fetch(url: impl Into<String>) -> Self {
        Self::Fetch { url: url.into() }
    }

    /// Creates a parse error.
    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.into(),
        }
    }
}
