//! HTTP fetch primitives shared by archive managers and the coordinator.
//!
//! This module provides the [`HttpClient`] which fetches pages through the
//! retry ladder (escalating to a web bypasser on anti-bot rejections) and
//! streams book files with progress reporting and cooperative cancellation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{
    CONNECT_TIMEOUT_SECS, MARKUP_CONTENT_TYPES, MARKUP_SIZE_RATIO, READ_TIMEOUT_SECS,
};
use super::error::DownloadError;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use crate::bypass::{NoopBypasser, WebBypasser};
use crate::queue::CancelToken;
use crate::user_agent;

/// Progress callback invoked with a percentage after each received chunk.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// HTTP client for page and file fetches.
///
/// Created once per archive manager and cloned cheaply; clones share the
/// connection pool and the bypasser.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use book_downloader_core::bypass::NoopBypasser;
/// use book_downloader_core::download::{HttpClient, RetryPolicy};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new(RetryPolicy::default(), Arc::new(NoopBypasser))?;
/// let page = client.fetch_page("https://annas-archive.org/md5/abc", false).await;
/// println!("fetched {} bytes", page.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
    bypasser: Arc<dyn WebBypasser>,
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built.
    pub fn new(policy: RetryPolicy, bypasser: Arc<dyn WebBypasser>) -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
            policy,
            bypasser,
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
        policy: RetryPolicy,
        bypasser: Arc<dyn WebBypasser>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .gzip(true)
            .cookie_store(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self {
            client,
            policy,
            bypasser,
        })
    }

    /// Creates a client with no bypasser.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built.
    pub fn without_bypass(policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        Self::new(policy, Arc::new(NoopBypasser))
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the bypasser used for challenged pages.
    #[must_use]
    pub fn bypasser(&self) -> &Arc<dyn WebBypasser> {
        &self.bypasser
    }

    /// Fetches a page as text, returning an empty string on failure.
    ///
    /// See [`try_fetch_page`](Self::try_fetch_page) for the retry ladder.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_page(&self, url: &str, use_bypasser: bool) -> String {
        match self.try_fetch_page(url, use_bypasser).await {
            Ok(page) => page,
            Err(error) => {
                warn!(error = %error, "page fetch failed");
                String::new()
            }
        }
    }

    /// Sends a single GET to `url` and reports whether it answered with success.
    ///
    /// Used to pick a reachable mirror; never retries.
    pub async fn probe(&self, url: &str) -> bool {
        match self.send_get(url).await {
            Ok(_) => true,
            Err(error) => {
                debug!(url, error = %error, "mirror probe failed");
                false
            }
        }
    }

    /// Fetches a page as text, returning an empty string on failure or
    /// cancellation.
    #[instrument(skip(self, cancel), fields(url = %url))]
    pub async fn fetch_page_or_cancel(
        &self,
        url: &str,
        use_bypasser: bool,
        cancel: &CancelToken,
    ) -> String {
        match self.try_fetch_page_or_cancel(url, use_bypasser, cancel).await {
            Ok(page) => page,
            Err(error) if error.is_cancelled() => {
                debug!("page fetch cancelled");
                String::new()
            }
            Err(error) => {
                warn!(error = %error, "page fetch failed");
                String::new()
            }
        }
    }

    /// Fetches a page as text through the retry ladder.
    ///
    /// - Permanent failures (404, 410, 400, invalid URL) return immediately.
    /// - A 403 switches to the bypasser once, without sleeping, if an enabled
    ///   bypasser is configured. Subsequent failures stay on the bypasser path.
    /// - A 429 sleeps for its Retry-After when present.
    /// - Other failures sleep `base_delay × attempt`, for at most `max_retry`
    ///   retries.
    ///
    /// # Errors
    ///
    /// Returns the last [`DownloadError`] once the ladder is exhausted.
    pub async fn try_fetch_page(
        &self,
        url: &str,
        use_bypasser: bool,
    ) -> Result<String, DownloadError> {
        self.try_fetch_page_or_cancel(url, use_bypasser, &CancelToken::new())
            .await
    }

    /// Same ladder as [`try_fetch_page`](Self::try_fetch_page), abandoned as
    /// soon as `cancel` fires: in flight, or during a backoff sleep.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] on cancellation, otherwise the
    /// last [`DownloadError`] once the ladder is exhausted.
    pub async fn try_fetch_page_or_cancel(
        &self,
        url: &str,
        use_bypasser: bool,
        cancel: &CancelToken,
    ) -> Result<String, DownloadError> {
        let bypass_available = self.bypasser.is_enabled();
        let mut via_bypasser = use_bypasser && bypass_available;
        let mut escalated = via_bypasser;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::cancelled(url));
            }
            attempt += 1;
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
                result = self.attempt_page(url, via_bypasser) => result,
            };
            let error = match result {
                Ok(page) => {
                    debug!(attempt, bytes = page.len(), bypassed = via_bypasser, "page fetched");
                    return Ok(page);
                }
                Err(error) => error,
            };

            let failure = classify_error(&error);
            if failure == FailureType::Challenge && bypass_available && !escalated {
                if !self.policy.has_budget(attempt) {
                    return Err(error);
                }
                info!(attempt, bypasser = self.bypasser.name(), "request refused; retrying through bypasser");
                via_bypasser = true;
                escalated = true;
                continue;
            }

            let delay = match self.policy.should_retry(failure, attempt) {
                RetryDecision::Retry { delay, .. } => delay,
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason, "not retrying page fetch");
                    return Err(error);
                }
            };
            let delay = if failure == FailureType::RateLimited {
                retry_after(&error).unwrap_or(delay)
            } else {
                delay
            };
            warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "page fetch failed; backing off"
            );
            if cancel.wait_timeout(delay).await {
                debug!(attempt, "cancelled during backoff");
                return Err(DownloadError::cancelled(url));
            }
        }
    }

    async fn attempt_page(&self, url: &str, via_bypasser: bool) -> Result<String, DownloadError> {
        if via_bypasser {
            self.bypasser
                .get_page(url)
                .await
                .map_err(|e| DownloadError::bypass(url, e))
        } else {
            self.get_text(url).await
        }
    }

    /// Streams `url` into a new file at `dest`.
    ///
    /// Returns the number of bytes written. The file is removed if the
    /// transfer fails or is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] if `cancel` fires,
    /// [`DownloadError::MarkupResponse`] if a web page came back instead of a
    /// file, or the transport/IO error that stopped the transfer.
    #[instrument(skip(self, on_progress, cancel), fields(url = %url, dest = %dest.display()))]
    pub async fn download_to_path(
        &self,
        url: &str,
        size_hint: Option<u64>,
        dest: &Path,
        on_progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<u64, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::cancelled(url));
        }
        let response = self.send_get_or_cancel(url, cancel).await?;
        let file = File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;
        let mut writer = BufWriter::new(file);

        let result = stream_body(response, url, size_hint, &mut writer, dest, on_progress, cancel).await;
        if let Err(error) = &result {
            debug!(error = %error, "removing incomplete download");
            drop(writer);
            let _ = tokio::fs::remove_file(dest).await;
        }
        let bytes = result?;
        info!(bytes, "download complete");
        Ok(bytes)
    }

    /// Fetches `url` into memory.
    ///
    /// Returns `None` on any failure, including cancellation and disguised
    /// web pages; partial data is never returned.
    #[instrument(skip(self, on_progress, cancel), fields(url = %url))]
    pub async fn fetch_binary(
        &self,
        url: &str,
        size_hint: Option<u64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Option<Vec<u8>> {
        if cancel.is_cancelled() {
            return None;
        }
        let response = match self.send_get_or_cancel(url, cancel).await {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "binary fetch failed");
                return None;
            }
        };
        let mut buffer: Vec<u8> = Vec::new();
        match stream_body(
            response,
            url,
            size_hint,
            &mut buffer,
            Path::new("<memory>"),
            on_progress,
            cancel,
        )
        .await
        {
            Ok(_) => Some(buffer),
            Err(error) => {
                warn!(error = %error, "binary fetch failed");
                None
            }
        }
    }

    async fn get_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self.send_get(url).await?;
        response
            .text()
            .await
            .map_err(|e| DownloadError::network(url, e))
    }

    async fn send_get_or_cancel(
        &self,
        url: &str,
        cancel: &CancelToken,
    ) -> Result<reqwest::Response, DownloadError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DownloadError::cancelled(url)),
            response = self.send_get(url) => response,
        }
    }

    async fn send_get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }
        Ok(response)
    }
}

fn retry_after(error: &DownloadError) -> Option<Duration> {
    match error {
        DownloadError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

fn is_markup(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    MARKUP_CONTENT_TYPES.contains(&mime.as_str())
}

/// Returns true when a markup response cannot be the expected file.
#[allow(clippy::cast_precision_loss)]
fn looks_like_error_page(received: u64, expected: Option<u64>) -> bool {
    expected.is_none_or(|expected| (received as f64) < expected as f64 * MARKUP_SIZE_RATIO)
}

#[allow(clippy::cast_precision_loss)]
fn percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (received as f64 / total as f64 * 100.0).min(100.0)
}

async fn stream_body<W>(
    response: reqwest::Response,
    url: &str,
    size_hint: Option<u64>,
    writer: &mut W,
    path: &Path,
    on_progress: ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<u64, DownloadError>
where
    W: AsyncWrite + Unpin + Send,
{
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let expected = response
        .content_length()
        .filter(|len| *len > 0)
        .or(size_hint);
    let markup = is_markup(&content_type);

    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        received += chunk.len() as u64;
        if let Some(total) = expected {
            on_progress(percent(received, total));
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(path, e))?;

    // Judge markup against the advertised book size, not the page's own length.
    if markup && looks_like_error_page(received, size_hint) {
        return Err(DownloadError::markup(url, content_type, received));
    }
    Ok(received)
}
