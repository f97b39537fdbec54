//! Error types for web bypassers.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while retrieving a challenged page.
#[derive(Debug, Error)]
pub enum BypassError {
    /// The selected strategy does not bypass anything.
    #[error("web bypasser is disabled")]
    Disabled,

    /// The strategy is missing required settings.
    #[error("web bypasser misconfigured: {message}")]
    Configuration {
        /// What is missing or invalid.
        message: String,
    },

    /// Transport error talking to the solver or WebDriver endpoint.
    #[error("request to {endpoint} failed: {source}")]
    Request {
        /// Endpoint that was called.
        endpoint: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint answered with an unexpected HTTP status.
    #[error("{endpoint} answered HTTP {status}: {message}")]
    Status {
        /// Endpoint that was called.
        endpoint: String,
        /// HTTP status code.
        status: u16,
        /// Error text reported by the endpoint, if any.
        message: String,
    },

    /// The external solver reported a failure for the target page.
    #[error("solver could not fetch {url}: {message}")]
    Solver {
        /// Target page.
        url: String,
        /// Message reported by the solver.
        message: String,
    },

    /// The rendered page was still a challenge when the wait ran out.
    #[error("challenge on {url} not cleared after {waited:?}")]
    ChallengeTimeout {
        /// Target page.
        url: String,
        /// How long the bypasser waited.
        waited: Duration,
    },

    /// The endpoint answered with a body that could not be decoded.
    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse {
        /// Endpoint that was called.
        endpoint: String,
        /// Decoding failure.
        message: String,
    },
}

impl BypassError {
    /// Creates a transport error.
    pub fn request(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Request {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Creates an invalid-response error.
    pub fn invalid_response(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
