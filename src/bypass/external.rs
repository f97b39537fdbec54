//! Strategy that forwards page requests to an external challenge solver.
//!
//! The solver speaks the FlareSolverr protocol: a `request.get` command is
//! posted as JSON and the rendered page comes back in `solution.response`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{BypassError, WebBypasser};

/// Grace added to the solver's own timeout for the HTTP round-trip.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// External solver settings.
#[derive(Debug, Clone)]
pub struct ExternalSettings {
    /// Solver base URL, e.g. `http://flaresolverr:8191`. Empty disables the strategy.
    pub url: String,
    /// API path appended to the base URL.
    pub path: String,
    /// Time the solver may spend on one page.
    pub timeout: Duration,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            path: "/v1".to_string(),
            timeout: Duration::from_millis(60_000),
        }
    }
}

impl ExternalSettings {
    fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolverRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    #[serde(default)]
    response: String,
}

/// Bypasser backed by a challenge-solving HTTP service.
#[derive(Debug, Clone)]
pub struct ExternalBypasser {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl ExternalBypasser {
    /// Creates a bypasser for `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError::Configuration`] when no solver URL is set.
    pub fn new(settings: ExternalSettings) -> Result<Self, BypassError> {
        if settings.url.trim().is_empty() {
            return Err(BypassError::configuration(
                "EXT_BYPASSER_URL is required for the external bypasser",
            ));
        }
        let endpoint = settings.endpoint();
        let client = Client::builder()
            .timeout(settings.timeout + TRANSPORT_GRACE)
            .build()
            .map_err(|e| BypassError::request(endpoint.clone(), e))?;
        Ok(Self {
            client,
            endpoint,
            timeout: settings.timeout,
        })
    }
}

#[async_trait]
impl WebBypasser for ExternalBypasser {
    fn name(&self) -> &'static str {
        "external"
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn get_page(&self, url: &str) -> Result<String, BypassError> {
        let body = SolverRequest {
            cmd: "request.get",
            url,
            max_timeout: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| BypassError::request(self.endpoint.clone(), e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "solver rejected request");
            return Err(BypassError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let decoded: SolverResponse = response
            .json()
            .await
            .map_err(|e| BypassError::invalid_response(self.endpoint.clone(), e.to_string()))?;
        if decoded.status != "ok" {
            return Err(BypassError::Solver {
                url: url.to_string(),
                message: decoded.message,
            });
        }
        let page = decoded.solution.map(|s| s.response).unwrap_or_default();
        debug!(bytes = page.len(), "solver returned page");
        Ok(page)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_url_and_path() {
        let settings = ExternalSettings {
            url: "http://solver:8191/".to_string(),
            path: "/v1".to_string(),
            ..ExternalSettings::default()
        };
        assert_eq!(settings.endpoint(), "http://solver:8191/v1");
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let body = SolverRequest {
            cmd: "request.get",
            url: "https://example.com",
            max_timeout: 60_000,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["cmd"], "request.get");
        assert_eq!(json["maxTimeout"], 60_000);
    }

    #[test]
    fn test_new_rejects_blank_url() {
        assert!(ExternalBypasser::new(ExternalSettings::default()).is_err());
    }
}
