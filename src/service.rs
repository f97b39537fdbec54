//! Service registry: the queue, the archive managers, the lookup cache and the
//! coordinator, built once at startup and shared by every caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::archive::{
    ArchiveError, ArchiveKind, ArchiveManager, ArchiveRegistry, BookDetails, BookSummary,
    SearchFilters,
};
use crate::bypass::BypassError;
use crate::cache::LookupCache;
use crate::config::{ConfigError, Settings};
use crate::download::{CoordinatorSettings, DownloadCoordinator, EngineError, HttpClient};
use crate::queue::{BookMetadata, BookQueue, CancelToken, QueueItemView, QueueStatus};

/// Errors raised while assembling the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Settings or directories are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bypass strategy could not be built.
    #[error(transparent)]
    Bypass(#[from] BypassError),

    /// An archive manager could not be built.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The coordinator rejected its settings.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Everything callers need, constructed once and passed by reference.
#[derive(Debug)]
pub struct BookService {
    queue: Arc<BookQueue>,
    archives: ArchiveRegistry,
    cache: LookupCache,
    coordinator: DownloadCoordinator,
    shutdown: CancelToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl BookService {
    /// Assembles the service from `archives` without starting the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the coordinator settings are invalid.
    pub fn new(
        archives: ArchiveRegistry,
        cache: LookupCache,
        coordinator_settings: CoordinatorSettings,
    ) -> Result<Self, EngineError> {
        let queue = Arc::new(BookQueue::new());
        let coordinator =
            DownloadCoordinator::new(Arc::clone(&queue), archives.clone(), coordinator_settings)?;
        Ok(Self {
            queue,
            archives,
            cache,
            coordinator,
            shutdown: CancelToken::new(),
            runner: Mutex::new(None),
        })
    }

    /// Builds every component from `settings` and starts the coordinator.
    ///
    /// Prepares the scratch and ingest directories, builds the configured
    /// bypasser and archive managers (probing mirrors where requested).
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] for the first component that cannot be built.
    #[instrument(skip(settings), fields(archive = %settings.default_archive, bypasser = %settings.bypasser))]
    pub async fn from_settings(settings: &Settings) -> Result<Self, ServiceError> {
        let cross_filesystem = settings.prepare_directories()?;
        let archives = build_archives(settings).await?;
        let service = Self::new(
            archives,
            LookupCache::new(settings.lookup_cache_ttl),
            settings.coordinator_settings(cross_filesystem),
        )?;
        service.start();
        Ok(service)
    }

    /// Spawns the coordinator loop if it is not already running.
    pub fn start(&self) {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        *runner = Some(tokio::spawn(async move { coordinator.run(shutdown).await }));
        info!("download coordinator running");
    }

    /// The shared queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<BookQueue> {
        &self.queue
    }

    /// The configured archive managers.
    #[must_use]
    pub fn archives(&self) -> &ArchiveRegistry {
        &self.archives
    }

    /// The coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    fn manager(&self, source: Option<&str>) -> Result<&Arc<dyn ArchiveManager>, ArchiveError> {
        match source {
            None => Ok(self.archives.default_manager()),
            Some(id) => self
                .archives
                .get(id)
                .ok_or_else(|| ArchiveError::UnknownManager { id: id.to_string() }),
        }
    }

    /// Searches `source` (the default manager when `None`) through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] for unknown sources and failed lookups.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        source: Option<&str>,
    ) -> Result<Vec<BookSummary>, ArchiveError> {
        let manager = self.manager(source)?;
        self.cache.search(manager.as_ref(), query, filters).await
    }

    /// Resolves details for `id` through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] for unknown sources and failed lookups.
    pub async fn get_details(
        &self,
        id: &str,
        source: Option<&str>,
    ) -> Result<BookDetails, ArchiveError> {
        let manager = self.manager(source)?;
        self.cache.details(manager.as_ref(), id).await
    }

    /// Resolves `id` and admits it to the queue.
    ///
    /// Returns false if the details cannot be resolved or the queue refuses
    /// the id.
    #[instrument(skip(self), fields(book_id = %id))]
    pub async fn enqueue(&self, id: &str, priority: i64, source: Option<&str>) -> bool {
        let details = match self.get_details(id, source).await {
            Ok(details) => details,
            Err(error) => {
                warn!(error = %error, "cannot enqueue book");
                return false;
            }
        };
        self.queue.add(id, priority, BookMetadata::from(&details))
    }

    /// Cancels `id`.
    pub fn cancel(&self, id: &str) -> bool {
        self.queue.cancel(id)
    }

    /// Changes the priority of a queued item.
    pub fn set_priority(&self, id: &str, priority: i64) -> bool {
        self.queue.set_priority(id, priority)
    }

    /// Applies a batch of priorities in one critical section.
    pub fn reorder(&self, priorities: &HashMap<String, i64>) -> bool {
        self.queue.reorder(priorities)
    }

    /// Items for display, active first.
    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<QueueItemView> {
        self.queue.snapshot()
    }

    /// Ids currently claimed or downloading.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        self.queue.active_ids()
    }

    /// Removes every finished item; returns how many were removed.
    pub fn sweep_finished(&self) -> usize {
        self.queue.sweep_finished()
    }

    /// Reads the delivered file of an `available` item.
    ///
    /// Returns `None` bytes for unknown ids, items that are not available and
    /// files that can no longer be read; in the last case the recorded path is
    /// cleared.
    pub async fn read_downloaded_bytes(&self, id: &str) -> (Option<Vec<u8>>, BookDetails) {
        let Some(view) = self.queue.item(id) else {
            return (None, BookDetails::unknown(id, self.archives.default_manager().id()));
        };
        let details = details_from_view(&view);
        let Some(path) = view
            .download_path
            .filter(|_| view.status == QueueStatus::Available)
        else {
            debug!(book_id = %id, status = %view.status, "no delivered file");
            return (None, details);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => (Some(bytes), details),
            Err(error) => {
                warn!(book_id = %id, path = %path.display(), error = %error, "delivered file unreadable");
                self.queue.update_download_path(id, None);
                (None, details)
            }
        }
    }

    /// Stops the coordinator, cancelling in-flight items, and releases
    /// bypasser resources.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = runner
            && let Err(error) = handle.await
        {
            warn!(error = %error, "coordinator task failed");
        }
        self.archives.shutdown().await;
        info!("service stopped");
    }
}

fn details_from_view(view: &QueueItemView) -> BookDetails {
    let metadata = &view.metadata;
    BookDetails {
        id: view.id.clone(),
        title: metadata.title.clone(),
        author: metadata.author.clone(),
        format: metadata.format.clone(),
        size: metadata.size.clone(),
        source: metadata.source.clone(),
        download_urls: metadata.download_urls.clone(),
        ..BookDetails::default()
    }
}

/// Builds the configured bypasser, the shared HTTP client and every archive
/// manager, the default one first.
///
/// # Errors
///
/// Returns [`ServiceError`] if the bypasser, the client or a manager cannot
/// be built.
pub async fn build_archives(settings: &Settings) -> Result<ArchiveRegistry, ServiceError> {
    let bypasser = settings.bypasser.build(&settings.bypass)?;
    let client = HttpClient::with_timeouts(
        settings.connect_timeout,
        settings.read_timeout,
        settings.retry_policy(),
        bypasser,
    )?;

    let default_kind = settings.default_archive;
    let default = default_kind
        .build(settings.archive_settings(default_kind).clone(), client.clone())
        .await?;
    let mut registry = ArchiveRegistry::new(default);
    for kind in ArchiveKind::ALL {
        if kind != default_kind {
            let manager = kind
                .build(settings.archive_settings(kind).clone(), client.clone())
                .await?;
            registry.register(manager);
        }
    }
    Ok(registry)
}
