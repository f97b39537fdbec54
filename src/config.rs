//! Startup settings read from the process environment.
//!
//! Every value has a default; invalid values are rejected with a
//! [`ConfigError`] naming the variable. [`Settings::from_lookup`] accepts any
//! lookup function so tests never touch the real environment.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::archive::{ArchiveKind, ArchiveSettings};
use crate::bypass::{BrowserSettings, BypassSettings, BypasserKind, ExternalSettings};
use crate::cache;
use crate::download::{CoordinatorSettings, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRY, RetryPolicy};

const DEFAULT_FORMATS: &str = "epub,mobi,azw3,fb2,djvu,cbz,cbr";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
        /// What was expected.
        reason: String,
    },

    /// A numeric variable is outside its allowed range.
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Variable name.
        name: &'static str,
        /// Parsed value.
        value: u64,
        /// Inclusive lower bound.
        min: u64,
        /// Inclusive upper bound.
        max: u64,
    },

    /// A directory could not be created or written.
    #[error("directory {path} is not usable: {source}")]
    Directory {
        /// Directory path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Settings for the whole service.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker pool size.
    pub max_concurrent: usize,
    /// Page fetch retries.
    pub max_retry: u32,
    /// Backoff unit.
    pub default_sleep: Duration,
    /// Supervisory loop interval.
    pub loop_interval: Duration,
    /// Age after which terminal queue entries are dropped.
    pub status_timeout: Duration,
    /// Scratch directory.
    pub scratch_dir: PathBuf,
    /// Ingest directory.
    pub ingest_dir: PathBuf,
    /// Name delivered files after the title.
    pub use_book_title: bool,
    /// Post-download hook.
    pub custom_script: Option<PathBuf>,
    /// Manager used when a request names none.
    pub default_archive: ArchiveKind,
    /// Anna's Archive settings.
    pub annas: ArchiveSettings,
    /// WeLib settings.
    pub welib: ArchiveSettings,
    /// Selected bypass strategy.
    pub bypasser: BypasserKind,
    /// Settings of every bypass strategy.
    pub bypass: BypassSettings,
    /// Lookup cache time to live.
    pub lookup_cache_ttl: Duration,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP read timeout.
    pub read_timeout: Duration,
}

impl Settings {
    /// Reads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first invalid variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first invalid variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let max_concurrent = env.ranged(
            "MAX_CONCURRENT_DOWNLOADS",
            DEFAULT_CONCURRENCY as u64,
            1,
            32,
        )?;
        let max_retry = env.ranged("MAX_RETRY", u64::from(DEFAULT_MAX_RETRY), 0, 50)?;

        let supported_formats = env.list("SUPPORTED_FORMATS", DEFAULT_FORMATS, true);
        let languages = env.list("BOOK_LANGUAGE", "en", true);
        let welib_base = env.string("WELIB_BASE_URL", "auto");
        let welib_mirror = if welib_base.eq_ignore_ascii_case("auto") {
            ArchiveKind::Welib.known_mirrors()[0].to_string()
        } else {
            welib_base.clone()
        };

        let annas = ArchiveSettings {
            base_url: env.string("AA_BASE_URL", "auto"),
            additional_urls: env.list("AA_ADDITIONAL_URLS", "", false),
            donator_key: env.optional("AA_DONATOR_KEY"),
            welib_url: Some(welib_mirror),
            prioritize_welib: env.flag("PRIORITIZE_WELIB", false)?,
            supported_formats: supported_formats.clone(),
            languages: languages.clone(),
        };
        let welib = ArchiveSettings {
            base_url: welib_base,
            additional_urls: env.list("WELIB_ADDITIONAL_URLS", "", false),
            donator_key: None,
            welib_url: None,
            prioritize_welib: false,
            supported_formats,
            languages,
        };

        let browser_defaults = BrowserSettings::default();
        let bypass = BypassSettings {
            browser: BrowserSettings {
                webdriver_url: env.string("BROWSER_WEBDRIVER_URL", &browser_defaults.webdriver_url),
                browser_name: env.string("BROWSER_NAME", &browser_defaults.browser_name),
                headless: env.flag("BROWSER_HEADLESS", browser_defaults.headless)?,
                challenge_timeout: env.seconds(
                    "BROWSER_CHALLENGE_TIMEOUT",
                    browser_defaults.challenge_timeout,
                )?,
                idle_timeout: env.seconds("BROWSER_IDLE_TIMEOUT", browser_defaults.idle_timeout)?,
            },
            external: ExternalSettings {
                url: env.string("EXT_BYPASSER_URL", ""),
                path: env.string("EXT_BYPASSER_PATH", "/v1"),
                timeout: env.millis("EXT_BYPASSER_TIMEOUT", Duration::from_millis(60_000))?,
            },
        };

        Ok(Self {
            max_concurrent: usize::try_from(max_concurrent).unwrap_or(DEFAULT_CONCURRENCY),
            max_retry: u32::try_from(max_retry).unwrap_or(DEFAULT_MAX_RETRY),
            default_sleep: env.seconds("DEFAULT_SLEEP", Duration::from_secs(5))?,
            loop_interval: env.seconds("MAIN_LOOP_SLEEP_TIME", Duration::from_secs(5))?,
            status_timeout: env.seconds("STATUS_TIMEOUT", Duration::from_secs(3600))?,
            scratch_dir: PathBuf::from(env.string("TMP_DIR", "/tmp/book-downloader")),
            ingest_dir: PathBuf::from(env.string("INGEST_DIR", "/book-ingest")),
            use_book_title: env.flag("USE_BOOK_TITLE", false)?,
            custom_script: env.optional("CUSTOM_SCRIPT").map(PathBuf::from),
            default_archive: env.parsed("DEFAULT_ARCHIVE_MANAGER", ArchiveKind::AnnasArchive)?,
            annas,
            welib,
            bypasser: env.parsed("DEFAULT_WEB_BYPASSER", BypasserKind::Noop)?,
            bypass,
            lookup_cache_ttl: env.seconds("LOOKUP_CACHE_TTL", cache::DEFAULT_TTL)?,
            connect_timeout: env.seconds("HTTP_CONNECT_TIMEOUT", Duration::from_secs(30))?,
            read_timeout: env.seconds("HTTP_READ_TIMEOUT", Duration::from_secs(300))?,
        })
    }

    /// Retry policy for page fetches.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry, self.default_sleep)
    }

    /// Settings for one archive manager kind.
    #[must_use]
    pub fn archive_settings(&self, kind: ArchiveKind) -> &ArchiveSettings {
        match kind {
            ArchiveKind::AnnasArchive => &self.annas,
            ArchiveKind::Welib => &self.welib,
        }
    }

    /// Coordinator settings, given the filesystem probe result.
    #[must_use]
    pub fn coordinator_settings(&self, cross_filesystem: bool) -> CoordinatorSettings {
        CoordinatorSettings {
            max_concurrent: self.max_concurrent,
            loop_interval: self.loop_interval,
            status_timeout: self.status_timeout,
            scratch_dir: self.scratch_dir.clone(),
            ingest_dir: self.ingest_dir.clone(),
            cross_filesystem,
            use_book_title: self.use_book_title,
            custom_script: self.custom_script.clone(),
        }
    }

    /// Creates both directories, checks they accept writes and reports
    /// whether they sit on different filesystems.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Directory`] for the first unusable directory.
    pub fn prepare_directories(&self) -> Result<bool, ConfigError> {
        for dir in [&self.scratch_dir, &self.ingest_dir] {
            ensure_writable(dir).map_err(|source| ConfigError::Directory {
                path: dir.clone(),
                source,
            })?;
        }
        let same = same_filesystem(&self.scratch_dir, &self.ingest_dir).map_err(|source| {
            ConfigError::Directory {
                path: self.ingest_dir.clone(),
                source,
            }
        })?;
        info!(
            scratch_dir = %self.scratch_dir.display(),
            ingest_dir = %self.ingest_dir.display(),
            cross_filesystem = !same,
            "directories ready"
        );
        Ok(!same)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.raw(name)
    }

    fn list(&self, name: &str, default: &str, lowercase: bool) -> Vec<String> {
        self.string(name, default)
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| if lowercase { v.to_lowercase() } else { v.to_string() })
            .collect()
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.raw(name) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        }
    }

    fn ranged(&self, name: &'static str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        let Some(value) = self.raw(name) else {
            return Ok(default);
        };
        let parsed: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: value.clone(),
            reason: "expected a whole number".to_string(),
        })?;
        if !(min..=max).contains(&parsed) {
            return Err(ConfigError::OutOfRange {
                name,
                value: parsed,
                min,
                max,
            });
        }
        Ok(parsed)
    }

    fn seconds(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let Some(value) = self.raw(name) else {
            return Ok(default);
        };
        value
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or(ConfigError::InvalidValue {
                name,
                value,
                reason: "expected a non-negative number of seconds".to_string(),
            })
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let Some(value) = self.raw(name) else {
            return Ok(default);
        };
        value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue {
                name,
                value,
                reason: "expected milliseconds".to_string(),
            })
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr<Err = String>,
    {
        let Some(value) = self.raw(name) else {
            return Ok(default);
        };
        value
            .parse()
            .map_err(|reason| ConfigError::InvalidValue { name, value, reason })
    }
}

fn ensure_writable(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".write-test-{}", std::process::id()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    debug!(dir = %dir.display(), "directory is writable");
    Ok(())
}

#[cfg(unix)]
fn same_filesystem(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(a)?.dev() == std::fs::metadata(b)?.dev())
}

#[cfg(not(unix))]
fn same_filesystem(_a: &Path, _b: &Path) -> io::Result<bool> {
    Ok(true)
}
