//! Archive managers: pluggable sources of book metadata and download links.
//!
//! # Architecture
//!
//! - [`ArchiveManager`] - Async trait every source implements
//! - [`AnnasArchiveManager`] - Manager for Anna's-Archive-style sites (also serves WeLib)
//! - [`ArchiveKind`] - Closed registry of manager kinds, resolved at startup
//! - [`ArchiveRegistry`] - The configured managers, keyed by id
//!
//! Managers share the [`HttpClient`] fetch primitive, which owns the retry
//! ladder and the web bypasser.

mod annas;
mod error;
mod parse;

pub use annas::{AnnasArchiveManager, build_search_url};
pub use error::ArchiveError;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bypass::WebBypasser;
use crate::download::{HttpClient, ProgressFn};
use crate::queue::{BookMetadata, CancelToken};

/// Search filters accepted by every archive manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// ISBN-10 or ISBN-13 values.
    #[serde(default)]
    pub isbn: Vec<String>,
    /// Author names.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Title terms.
    #[serde(default)]
    pub titles: Vec<String>,
    /// Language codes; `all` disables the language filter.
    #[serde(default)]
    pub lang: Vec<String>,
    /// Sort order understood by the source.
    #[serde(default)]
    pub sort: Option<String>,
    /// Content types (e.g. `book_fiction`).
    #[serde(default)]
    pub content: Vec<String>,
    /// File formats.
    #[serde(default)]
    pub format: Vec<String>,
}

impl SearchFilters {
    /// Returns true if no filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.isbn.is_empty()
            && self.authors.is_empty()
            && self.titles.is_empty()
            && self.lang.is_empty()
            && self.sort.as_deref().is_none_or(str::is_empty)
            && self.content.is_empty()
            && self.format.is_empty()
    }

    /// Returns a normalized, order-independent representation for cache keys.
    #[must_use]
    pub fn normalized_key(&self) -> String {
        fn list(values: &[String]) -> String {
            let mut values: Vec<String> = values
                .iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect();
            values.sort();
            values.dedup();
            values.join(",")
        }
        format!(
            "isbn={};authors={};titles={};lang={};sort={};content={};format={}",
            list(&self.isbn),
            list(&self.authors),
            list(&self.titles),
            list(&self.lang),
            self.sort.as_deref().unwrap_or("").trim().to_lowercase(),
            list(&self.content),
            list(&self.format),
        )
    }
}

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSummary {
    /// Source-scoped identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Author line.
    pub author: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Publication year.
    pub year: Option<String>,
    /// Language.
    pub language: Option<String>,
    /// Lower-case file format.
    pub format: Option<String>,
    /// Human size hint.
    pub size: Option<String>,
    /// Cover image URL.
    pub preview: Option<String>,
}

/// Full metadata for one book, with ranked candidate download pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDetails {
    /// Source-scoped identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Author line.
    pub author: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Publication year.
    pub year: Option<String>,
    /// Language.
    pub language: Option<String>,
    /// Lower-case file format.
    pub format: Option<String>,
    /// Human size hint.
    pub size: Option<String>,
    /// Cover image URL.
    pub preview: Option<String>,
    /// Identifier of the manager that produced these details.
    pub source: String,
    /// Extra identifiers (ISBNs, ASIN, Goodreads, ...).
    #[serde(default)]
    pub info: BTreeMap<String, Vec<String>>,
    /// Candidate download pages, most preferred first.
    #[serde(default)]
    pub download_urls: Vec<String>,
}

impl BookDetails {
    /// Details used when an id is unknown to both the queue and the source.
    #[must_use]
    pub fn unknown(id: &str, source: &str) -> Self {
        Self {
            id: id.to_string(),
            title: "Unknown".to_string(),
            source: source.to_string(),
            ..Self::default()
        }
    }
}

impl From<&BookDetails> for BookMetadata {
    fn from(details: &BookDetails) -> Self {
        Self {
            title: details.title.clone(),
            author: details.author.clone(),
            format: details.format.clone(),
            size: details.size.clone(),
            source: details.source.clone(),
            download_urls: details.download_urls.clone(),
        }
    }
}

/// Source of book metadata and download links.
#[async_trait]
pub trait ArchiveManager: Send + Sync + fmt::Debug {
    /// Stable identifier, used in cache keys and queue metadata.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// The fetch primitive this manager uses.
    fn client(&self) -> &HttpClient;

    /// The bypasser configured for this manager.
    fn bypasser(&self) -> &Arc<dyn WebBypasser> {
        self.client().bypasser()
    }

    /// Searches the source.
    ///
    /// An empty query with empty filters returns no results without touching
    /// the network.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the results page cannot be fetched or parsed.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<BookSummary>, ArchiveError>;

    /// Resolves full metadata and ranked candidate download pages for `id`.
    ///
    /// The candidate order is stable for identical pages.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] if the page cannot be fetched or parsed.
    async fn get_details(&self, id: &str) -> Result<BookDetails, ArchiveError>;

    /// Turns one candidate download page into a direct file URL.
    ///
    /// Returns `None` if the page yields no link or `cancel` fires while
    /// waiting on the source.
    async fn resolve_download_link(
        &self,
        link: &str,
        title: &str,
        cancel: &CancelToken,
    ) -> Option<String>;

    /// Fetches a page, returning an empty string on failure.
    async fn fetch_page(&self, url: &str, use_bypasser: bool) -> String {
        self.client().fetch_page(url, use_bypasser).await
    }

    /// Fetches a file into memory, returning `None` on failure or cancellation.
    async fn fetch_binary(
        &self,
        url: &str,
        size_hint: Option<u64>,
        on_progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Option<Vec<u8>> {
        self.client()
            .fetch_binary(url, size_hint, on_progress, cancel)
            .await
    }
}

/// Available archive manager kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArchiveKind {
    /// Anna's Archive.
    #[default]
    AnnasArchive,
    /// WeLib, an Anna's Archive mirror behind an anti-bot wall.
    Welib,
}

impl ArchiveKind {
    /// All kinds, in registration order.
    pub const ALL: [ArchiveKind; 2] = [ArchiveKind::AnnasArchive, ArchiveKind::Welib];

    /// Returns the configuration identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnnasArchive => "annas_archive",
            Self::Welib => "welib",
        }
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::AnnasArchive => "Anna's Archive",
            Self::Welib => "WeLib",
        }
    }

    /// Known mirrors probed when the base URL is `auto`.
    #[must_use]
    pub fn known_mirrors(&self) -> &'static [&'static str] {
        match self {
            Self::AnnasArchive => &[
                "https://annas-archive.org",
                "https://annas-archive.se",
                "https://annas-archive.li",
            ],
            Self::Welib => &["https://welib.org", "https://welib.se", "https://welib.li"],
        }
    }

    /// Constructs the manager, probing mirrors when the base URL is `auto`.
    ///
    /// # Errors
    ///
    /// Currently infallible once `client` exists; kept fallible for sources
    /// that validate their settings.
    pub async fn build(
        self,
        settings: ArchiveSettings,
        client: HttpClient,
    ) -> Result<Arc<dyn ArchiveManager>, ArchiveError> {
        let manager = AnnasArchiveManager::connect(self, settings, client).await?;
        Ok(Arc::new(manager))
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "annas_archive" | "annas-archive" | "aa" => Ok(Self::AnnasArchive),
            "welib" => Ok(Self::Welib),
            other => Err(format!("unknown archive manager: {other}")),
        }
    }
}

/// Settings for one archive manager instance.
#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// Base URL, or `auto` to probe the known mirrors.
    pub base_url: String,
    /// Extra mirrors probed before the known ones.
    pub additional_urls: Vec<String>,
    /// Donor key enabling the fast-lane API.
    pub donator_key: Option<String>,
    /// WeLib base URL consulted for extra mirrors, if any.
    pub welib_url: Option<String>,
    /// Move WeLib links ahead of libgen links.
    pub prioritize_welib: bool,
    /// Accepted formats, in preference order.
    pub supported_formats: Vec<String>,
    /// Default language filter.
    pub languages: Vec<String>,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            base_url: "auto".to_string(),
            additional_urls: Vec::new(),
            donator_key: None,
            welib_url: None,
            prioritize_welib: false,
            supported_formats: ["epub", "mobi", "azw3", "fb2", "djvu", "cbz", "cbr"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            languages: vec!["en".to_string()],
        }
    }
}

/// The configured archive managers.
#[derive(Debug, Clone)]
pub struct ArchiveRegistry {
    managers: Vec<Arc<dyn ArchiveManager>>,
    default_index: usize,
}

impl ArchiveRegistry {
    /// Creates a registry whose default manager is `default`.
    #[must_use]
    pub fn new(default: Arc<dyn ArchiveManager>) -> Self {
        Self {
            managers: vec![default],
            default_index: 0,
        }
    }

    /// Adds a manager. A manager with the same id replaces the earlier one,
    /// except the default, which is kept.
    pub fn register(&mut self, manager: Arc<dyn ArchiveManager>) {
        match self.managers.iter().position(|m| m.id() == manager.id()) {
            Some(index) if index == self.default_index => {
                warn!(manager = manager.id(), "ignoring duplicate of the default archive manager");
            }
            Some(index) => self.managers[index] = manager,
            None => self.managers.push(manager),
        }
    }

    /// Returns the manager registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn ArchiveManager>> {
        self.managers.iter().find(|m| m.id() == id)
    }

    /// Returns the default manager.
    #[must_use]
    pub fn default_manager(&self) -> &Arc<dyn ArchiveManager> {
        &self.managers[self.default_index]
    }

    /// Returns the manager for queue metadata `source`, falling back to the default.
    #[must_use]
    pub fn for_source(&self, source: &str) -> &Arc<dyn ArchiveManager> {
        self.get(source).unwrap_or_else(|| self.default_manager())
    }

    /// Registered ids, default first.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = vec![self.default_manager().id()];
        ids.extend(
            self.managers
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != self.default_index)
                .map(|(_, m)| m.id()),
        );
        ids
    }

    /// Releases bypasser resources held by every manager.
    pub async fn shutdown(&self) {
        for manager in &self.managers {
            manager.bypasser().shutdown().await;
        }
    }
}
