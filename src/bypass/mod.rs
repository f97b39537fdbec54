//! Web bypassers: strategies for reading pages behind anti-bot challenges.
//!
//! # Architecture
//!
//! - [`WebBypasser`] - Async trait every strategy implements
//! - [`NoopBypasser`] - Pass-through, disables escalation
//! - [`BrowserBypasser`] - Drives a WebDriver browser session until the challenge clears
//! - [`ExternalBypasser`] - Delegates to an HTTP challenge-solving service
//! - [`BypasserKind`] - Closed registry of strategies, resolved at startup
//!
//! One strategy instance is shared per archive manager. Implementations that
//! own exclusive state serialize their callers internally.

mod browser;
mod error;
mod external;
mod noop;

pub use browser::{BrowserBypasser, BrowserSettings};
pub use error::BypassError;
pub use external::{ExternalBypasser, ExternalSettings};
pub use noop::NoopBypasser;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

/// Strategy that retrieves page content from sites that challenge automated clients.
#[async_trait]
pub trait WebBypasser: Send + Sync + fmt::Debug {
    /// Stable identifier used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Returns false for strategies that cannot bypass anything.
    ///
    /// Fetchers only escalate to enabled bypassers, and archive managers only
    /// offer challenge-protected mirrors when one is enabled.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Returns the rendered content of `url` once any challenge is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError`] when the page cannot be obtained.
    async fn get_page(&self, url: &str) -> Result<String, BypassError>;

    /// Releases held resources.
    async fn shutdown(&self) {}
}

/// Available bypass strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BypasserKind {
    /// No bypass.
    #[default]
    Noop,
    /// In-process browser automation over WebDriver.
    Browser,
    /// External challenge-solving service.
    External,
}

impl BypasserKind {
    /// Returns the configuration identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Browser => "browser",
            Self::External => "external",
        }
    }

    /// Constructs the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError::Configuration`] when the strategy's settings are
    /// incomplete, or a transport error if its HTTP client cannot be built.
    pub fn build(self, settings: &BypassSettings) -> Result<Arc<dyn WebBypasser>, BypassError> {
        let bypasser: Arc<dyn WebBypasser> = match self {
            Self::Noop => Arc::new(NoopBypasser),
            Self::Browser => Arc::new(BrowserBypasser::new(settings.browser.clone())?),
            Self::External => Arc::new(ExternalBypasser::new(settings.external.clone())?),
        };
        info!(bypasser = bypasser.name(), "web bypasser ready");
        Ok(bypasser)
    }
}

impl fmt::Display for BypasserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BypasserKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "noop" | "none" | "" => Ok(Self::Noop),
            "browser" | "cloudflare" => Ok(Self::Browser),
            "external" => Ok(Self::External),
            other => Err(format!("unknown web bypasser: {other}")),
        }
    }
}

/// Settings for every strategy; only the selected one is read.
#[derive(Debug, Clone, Default)]
pub struct BypassSettings {
    /// Browser strategy settings.
    pub browser: BrowserSettings,
    /// External strategy settings.
    pub external: ExternalSettings,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bypasser_kind_parses_aliases() {
        assert_eq!("noop".parse::<BypasserKind>().unwrap(), BypasserKind::Noop);
        assert_eq!(
            "Cloudflare".parse::<BypasserKind>().unwrap(),
            BypasserKind::Browser
        );
        assert_eq!(
            " external ".parse::<BypasserKind>().unwrap(),
            BypasserKind::External
        );
        assert!("selenium-grid".parse::<BypasserKind>().is_err());
    }

    #[test]
    fn test_build_noop_is_disabled() {
        let bypasser = BypasserKind::Noop.build(&BypassSettings::default()).unwrap();
        assert_eq!(bypasser.name(), "noop");
        assert!(!bypasser.is_enabled());
    }

    #[test]
    fn test_build_external_requires_url() {
        let err = BypasserKind::External
            .build(&BypassSettings::default())
            .unwrap_err();
        assert!(matches!(err, BypassError::Configuration { .. }));
    }
}
