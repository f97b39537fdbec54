//! Short-lived memoization of archive lookups.
//!
//! Search results and book details are cached separately, each bounded to a
//! handful of entries and expired after a fixed time to live. Keys carry the
//! archive manager id so identical queries against different sources never
//! share an entry. Failed lookups are not cached.

use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, instrument};

use crate::archive::{ArchiveError, ArchiveManager, BookDetails, BookSummary, SearchFilters};

/// Entries kept per lookup kind.
pub const DEFAULT_CAPACITY: u64 = 5;

/// Default time to live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache in front of [`ArchiveManager::search`] and [`ArchiveManager::get_details`].
#[derive(Debug, Clone)]
pub struct LookupCache {
    searches: Cache<String, Vec<BookSummary>>,
    details: Cache<String, BookDetails>,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl LookupCache {
    /// Creates a cache with the default capacity.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, ttl)
    }

    /// Creates a cache holding up to `capacity` entries per lookup kind.
    #[must_use]
    pub fn with_capacity(capacity: u64, ttl: Duration) -> Self {
        Self {
            searches: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            details: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Key of a search lookup.
    #[must_use]
    pub fn search_key(manager_id: &str, query: &str, filters: &SearchFilters) -> String {
        let query = query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        format!("{manager_id}:search:{query}:{}", filters.normalized_key())
    }

    /// Key of a details lookup.
    #[must_use]
    pub fn details_key(manager_id: &str, id: &str) -> String {
        format!("{manager_id}:details:{}", id.trim())
    }

    /// Searches through the cache.
    ///
    /// # Errors
    ///
    /// Returns the manager's error on a miss that fails; nothing is stored then.
    #[instrument(skip(self, manager, filters), fields(manager = manager.id()))]
    pub async fn search(
        &self,
        manager: &dyn ArchiveManager,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<BookSummary>, ArchiveError> {
        let key = Self::search_key(manager.id(), query, filters);
        if let Some(hit) = self.searches.get(&key).await {
            debug!("search cache hit");
            return Ok(hit);
        }
        let results = manager.search(query, filters).await?;
        self.searches.insert(key, results.clone()).await;
        Ok(results)
    }

    /// Resolves book details through the cache.
    ///
    /// # Errors
    ///
    /// Returns the manager's error on a miss that fails; nothing is stored then.
    #[instrument(skip(self, manager), fields(manager = manager.id()))]
    pub async fn details(
        &self,
        manager: &dyn ArchiveManager,
        id: &str,
    ) -> Result<BookDetails, ArchiveError> {
        let key = Self::details_key(manager.id(), id);
        if let Some(hit) = self.details.get(&key).await {
            debug!(book_id = %id, "details cache hit");
            return Ok(hit);
        }
        let details = manager.get_details(id).await?;
        self.details.insert(key, details.clone()).await;
        Ok(details)
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        self.searches.invalidate_all();
        self.details.invalidate_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::download::{HttpClient, RetryPolicy};
    use crate::queue::CancelToken;

    #[derive(Debug)]
    struct CountingManager {
        id: &'static str,
        client: HttpClient,
        searches: AtomicUsize,
        details: AtomicUsize,
        fail: bool,
    }

    impl CountingManager {
        fn new(id: &'static str, fail: bool) -> Self {
            Self {
                id,
                client: HttpClient::without_bypass(RetryPolicy::default()).unwrap(),
                searches: AtomicUsize::new(0),
                details: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl ArchiveManager for CountingManager {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            "counting"
        }

        fn client(&self) -> &HttpClient {
            &self.client
        }

        async fn search(
            &self,
            query: &str,
            _filters: &SearchFilters,
        ) -> Result<Vec<BookSummary>, ArchiveError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ArchiveError::fetch("https://example.com/search"));
            }
            Ok(vec![BookSummary {
                id: format!("{}-{query}", self.id),
                title: query.to_string(),
                ..BookSummary::default()
            }])
        }

        async fn get_details(&self, id: &str) -> Result<BookDetails, ArchiveError> {
            self.details.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ArchiveError::fetch("https://example.com/md5"));
            }
            Ok(BookDetails {
                id: id.to_string(),
                title: "Dune".to_string(),
                source: self.id.to_string(),
                ..BookDetails::default()
            })
        }

        async fn resolve_download_link(
            &self,
            _link: &str,
            _title: &str,
            _cancel: &CancelToken,
        ) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_search_hit_skips_manager() {
        let cache = LookupCache::default();
        let manager = CountingManager::new("annas_archive", false);
        let filters = SearchFilters::default();

        cache.search(&manager, "dune", &filters).await.unwrap();
        cache.search(&manager, "  DUNE ", &filters).await.unwrap();

        assert_eq!(manager.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_manager() {
        let cache = LookupCache::default();
        let annas = CountingManager::new("annas_archive", false);
        let welib = CountingManager::new("welib", false);
        let filters = SearchFilters::default();

        let a = cache.search(&annas, "dune", &filters).await.unwrap();
        let b = cache.search(&welib, "dune", &filters).await.unwrap();

        assert_ne!(a[0].id, b[0].id);
        assert_eq!(welib.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = LookupCache::default();
        let manager = CountingManager::new("annas_archive", true);

        assert!(cache.details(&manager, "abc").await.is_err());
        assert!(cache.details(&manager, "abc").await.is_err());

        assert_eq!(manager.details.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = LookupCache::new(Duration::from_millis(50));
        let manager = CountingManager::new("annas_archive", false);

        cache.details(&manager, "abc").await.unwrap();
        cache.details(&manager, "abc").await.unwrap();
        assert_eq!(manager.details.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.details(&manager, "abc").await.unwrap();
        assert_eq!(manager.details.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_search_key_normalizes_query_and_filters() {
        let filters = SearchFilters {
            lang: vec!["EN".to_string()],
            ..SearchFilters::default()
        };
        assert_eq!(
            LookupCache::search_key("welib", "  Dune   Messiah", &filters),
            LookupCache::search_key("welib", "dune messiah", &filters)
        );
        assert_ne!(
            LookupCache::search_key("welib", "dune", &filters),
            LookupCache::search_key("annas_archive", "dune", &filters)
        );
    }
}
