//! Strategy that renders challenged pages in a real browser over WebDriver.
//!
//! A single browser session is created lazily, reused across calls and torn
//! down after a period of inactivity. Callers are serialized on the session
//! lock so commands from concurrent workers never interleave.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{BypassError, WebBypasser};

/// Markers that identify an anti-bot interstitial rather than real content.
const CHALLENGE_MARKERS: &[&str] = &[
    "Just a moment",
    "challenge-platform",
    "cf-browser-verification",
    "Verify you are human",
    "DDoS-Guard",
];

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Browser strategy settings.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// WebDriver endpoint (chromedriver, geckodriver or a Selenium node).
    pub webdriver_url: String,
    /// `browserName` capability.
    pub browser_name: String,
    /// Run without a visible window.
    pub headless: bool,
    /// How long a challenge may take to clear.
    pub challenge_timeout: Duration,
    /// Idle time after which the browser session is released.
    pub idle_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://127.0.0.1:4444".to_string(),
            browser_name: "chrome".to_string(),
            headless: true,
            challenge_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct WebDriverFailure {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
struct Session {
    id: String,
    last_used: Instant,
}

#[derive(Debug)]
struct Driver {
    client: Client,
    settings: BrowserSettings,
    session: Mutex<Option<Session>>,
}

/// Bypasser that drives a browser through the W3C WebDriver protocol.
#[derive(Debug, Clone)]
pub struct BrowserBypasser {
    driver: Arc<Driver>,
}

impl BrowserBypasser {
    /// Creates a bypasser; no browser is started until the first page request.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError::Configuration`] when the WebDriver URL is blank.
    pub fn new(settings: BrowserSettings) -> Result<Self, BypassError> {
        if settings.webdriver_url.trim().is_empty() {
            return Err(BypassError::configuration(
                "BROWSER_WEBDRIVER_URL is required for the browser bypasser",
            ));
        }
        let client = Client::builder()
            .timeout(settings.challenge_timeout + Duration::from_secs(30))
            .build()
            .map_err(|e| BypassError::request(settings.webdriver_url.clone(), e))?;
        Ok(Self {
            driver: Arc::new(Driver {
                client,
                settings,
                session: Mutex::new(None),
            }),
        })
    }

    /// Returns true while a browser session is held.
    pub async fn has_session(&self) -> bool {
        self.driver.session.lock().await.is_some()
    }
}

#[async_trait]
impl WebBypasser for BrowserBypasser {
    fn name(&self) -> &'static str {
        "browser"
    }

    #[instrument(skip(self))]
    async fn get_page(&self, url: &str) -> Result<String, BypassError> {
        let mut guard = self.driver.session.lock().await;
        let session_id = match guard.as_ref() {
            Some(session) => session.id.clone(),
            None => {
                let id = self.driver.create_session().await?;
                *guard = Some(Session {
                    id: id.clone(),
                    last_used: Instant::now(),
                });
                spawn_idle_reaper(Arc::downgrade(&self.driver), id.clone());
                id
            }
        };

        match self.driver.render(&session_id, url).await {
            Ok(page) => {
                if let Some(session) = guard.as_mut() {
                    session.last_used = Instant::now();
                }
                Ok(page)
            }
            Err(error) => {
                warn!(error = %error, "browser render failed; discarding session");
                self.driver.delete_session(&session_id).await;
                *guard = None;
                Err(error)
            }
        }
    }

    async fn shutdown(&self) {
        let mut guard = self.driver.session.lock().await;
        if let Some(session) = guard.take() {
            self.driver.delete_session(&session.id).await;
            info!("browser session closed");
        }
    }
}

impl Driver {
    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.settings.webdriver_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn command<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, BypassError> {
        let endpoint = self.endpoint(path);
        let mut request = self.client.request(method, &endpoint);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BypassError::request(endpoint.clone(), e))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<Envelope<WebDriverFailure>>().await {
                Ok(envelope) => format!("{}: {}", envelope.value.error, envelope.value.message),
                Err(_) => String::new(),
            };
            return Err(BypassError::Status {
                endpoint,
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Envelope<T>>()
            .await
            .map(|envelope| envelope.value)
            .map_err(|e| BypassError::invalid_response(endpoint, e.to_string()))
    }

    fn capabilities(&self) -> Value {
        let name = self.settings.browser_name.as_str();
        let mut always_match = json!({ "browserName": name });
        let args: Vec<&str> = if name.eq_ignore_ascii_case("firefox") {
            if self.settings.headless {
                vec!["-headless"]
            } else {
                Vec::new()
            }
        } else {
            let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage"];
            if self.settings.headless {
                args.push("--headless=new");
            }
            args
        };
        let options_key = if name.eq_ignore_ascii_case("firefox") {
            "moz:firefoxOptions"
        } else {
            "goog:chromeOptions"
        };
        if let Some(map) = always_match.as_object_mut() {
            map.insert(options_key.to_string(), json!({ "args": args }));
        }
        json!({ "capabilities": { "alwaysMatch": always_match } })
    }

    async fn create_session(&self) -> Result<String, BypassError> {
        let session: NewSession = self
            .command(Method::POST, "session", Some(self.capabilities()))
            .await?;
        info!(session_id = %session.session_id, "browser session started");
        Ok(session.session_id)
    }

    async fn delete_session(&self, session_id: &str) {
        let path = format!("session/{session_id}");
        if let Err(error) = self
            .command::<Value>(Method::DELETE, &path, None)
            .await
        {
            debug!(error = %error, "failed to delete browser session");
        }
    }

    async fn render(&self, session_id: &str, url: &str) -> Result<String, BypassError> {
        let _: Value = self
            .command(
                Method::POST,
                &format!("session/{session_id}/url"),
                Some(json!({ "url": url })),
            )
            .await?;

        let started = Instant::now();
        let source_path = format!("session/{session_id}/source");
        loop {
            let source: String = self.command(Method::GET, &source_path, None).await?;
            if !is_challenge(&source) {
                debug!(bytes = source.len(), waited_ms = started.elapsed().as_millis(), "page rendered");
                return Ok(source);
            }
            let waited = started.elapsed();
            if waited >= self.settings.challenge_timeout {
                return Err(BypassError::ChallengeTimeout {
                    url: url.to_string(),
                    waited,
                });
            }
            let remaining = self.settings.challenge_timeout - waited;
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }
}

fn is_challenge(page: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| page.contains(marker))
}

/// Releases the session once it has been idle for the configured window.
///
/// The task ends when the bypasser is dropped or the session it watches is
/// replaced.
fn spawn_idle_reaper(driver: Weak<Driver>, session_id: String) {
    tokio::spawn(async move {
        loop {
            let Some(idle_timeout) = driver.upgrade().map(|d| d.settings.idle_timeout) else {
                return;
            };
            let check_every = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
            tokio::time::sleep(check_every).await;

            let Some(driver) = driver.upgrade() else {
                return;
            };
            let mut guard = driver.session.lock().await;
            match guard.as_ref() {
                Some(session) if session.id == session_id => {
                    if session.last_used.elapsed() >= idle_timeout {
                        driver.delete_session(&session_id).await;
                        *guard = None;
                        info!(session_id = %session_id, "browser session released after idle timeout");
                        return;
                    }
                }
                _ => return,
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_markers_detected() {
        assert!(is_challenge("<title>Just a moment...</title>"));
        assert!(is_challenge("<script src=\"/cdn-cgi/challenge-platform/x.js\">"));
        assert!(!is_challenge("<html><body>Book list</body></html>"));
    }

    #[test]
    fn test_chrome_capabilities_include_headless_flag() {
        let bypasser = BrowserBypasser::new(BrowserSettings::default()).unwrap();
        let caps = bypasser.driver.capabilities();
        let args = &caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"];
        assert!(
            args.as_array()
                .unwrap()
                .iter()
                .any(|a| a == "--headless=new")
        );
        assert_eq!(caps["capabilities"]["alwaysMatch"]["browserName"], "chrome");
    }

    #[test]
    fn test_firefox_capabilities_use_moz_options() {
        let settings = BrowserSettings {
            browser_name: "firefox".to_string(),
            ..BrowserSettings::default()
        };
        let bypasser = BrowserBypasser::new(settings).unwrap();
        let caps = bypasser.driver.capabilities();
        assert!(caps["capabilities"]["alwaysMatch"]["moz:firefoxOptions"].is_object());
    }

    #[test]
    fn test_blank_webdriver_url_rejected() {
        let settings = BrowserSettings {
            webdriver_url: " ".to_string(),
            ..BrowserSettings::default()
        };
        assert!(BrowserBypasser::new(settings).is_err());
    }
}
