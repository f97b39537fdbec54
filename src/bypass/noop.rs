//! Pass-through strategy used when no bypass is configured.

use async_trait::async_trait;

use super::{BypassError, WebBypasser};

/// Bypasser that never bypasses.
///
/// Callers check [`WebBypasser::is_enabled`] before escalating; a direct call
/// to `get_page` fails with [`BypassError::Disabled`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBypasser;

#[async_trait]
impl WebBypasser for NoopBypasser {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn get_page(&self, _url: &str) -> Result<String, BypassError> {
        Err(BypassError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_is_disabled() {
        let bypasser = NoopBypasser;
        assert!(!bypasser.is_enabled());
        assert!(matches!(
            bypasser.get_page("https://example.com").await,
            Err(BypassError::Disabled)
        ));
    }
}
