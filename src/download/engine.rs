//! Download coordinator: a bounded worker pool draining the book queue.
//!
//! A single supervisory loop reconciles finished worker tasks, expires stale
//! queue entries and claims new items while spare capacity exists. Each
//! worker owns exactly one item for its lifetime.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use book_downloader_core::archive::ArchiveRegistry;
//! use book_downloader_core::download::{CoordinatorSettings, DownloadCoordinator};
//! use book_downloader_core::queue::{BookQueue, CancelToken};
//!
//! # async fn example(archives: ArchiveRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(BookQueue::new());
//! let coordinator = DownloadCoordinator::new(queue, archives, CoordinatorSettings::default())?;
//! coordinator.run_until_idle(CancelToken::new()).await;
//! println!("completed: {}", coordinator.stats().completed());
//! # Ok(())
//! # }
//! ```

mod task;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::archive::ArchiveRegistry;
use crate::queue::{BookQueue, CancelToken};

/// Minimum allowed worker count.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed worker count.
const MAX_CONCURRENCY: usize = 32;

/// Default worker count.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Error type for coordinator construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },
}

/// Settings the coordinator reads once at construction.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Size of the worker pool.
    pub max_concurrent: usize,
    /// How often the supervisory loop reconciles when nothing wakes it.
    pub loop_interval: Duration,
    /// Terminal items older than this are dropped from the queue.
    pub status_timeout: Duration,
    /// Working directory for in-progress downloads.
    pub scratch_dir: PathBuf,
    /// Final destination of finished books.
    pub ingest_dir: PathBuf,
    /// Scratch and ingest live on different filesystems.
    pub cross_filesystem: bool,
    /// Name delivered files after the book title instead of its id.
    pub use_book_title: bool,
    /// Executable run on each finished file before handoff.
    pub custom_script: Option<PathBuf>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_CONCURRENCY,
            loop_interval: Duration::from_secs(5),
            status_timeout: Duration::from_secs(3600),
            scratch_dir: std::env::temp_dir().join("book-downloader"),
            ingest_dir: PathBuf::from("/book-ingest"),
            cross_filesystem: false,
            use_book_title: false,
            custom_script: None,
        }
    }
}

/// Outcome counters for one coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl CoordinatorStats {
    /// Books delivered to the ingest directory.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Items that ended in `error`.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Items that ended in `cancelled` after being claimed.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// State shared by the supervisory loop and every worker.
#[derive(Debug)]
struct WorkerContext {
    queue: Arc<BookQueue>,
    archives: ArchiveRegistry,
    settings: CoordinatorSettings,
    stats: CoordinatorStats,
    worker_done: Notify,
}

/// Bounded-parallelism executor over a [`BookQueue`].
///
/// Cloning is cheap; clones drive the same queue and share counters.
#[derive(Debug, Clone)]
pub struct DownloadCoordinator {
    ctx: Arc<WorkerContext>,
}

impl DownloadCoordinator {
    /// Creates a coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if `max_concurrent` is
    /// outside `1..=32`.
    #[instrument(level = "debug", skip(queue, archives, settings), fields(max_concurrent = settings.max_concurrent))]
    pub fn new(
        queue: Arc<BookQueue>,
        archives: ArchiveRegistry,
        settings: CoordinatorSettings,
    ) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&settings.max_concurrent) {
            return Err(EngineError::InvalidConcurrency {
                value: settings.max_concurrent,
            });
        }
        debug!(
            scratch_dir = %settings.scratch_dir.display(),
            ingest_dir = %settings.ingest_dir.display(),
            cross_filesystem = settings.cross_filesystem,
            "creating download coordinator"
        );
        Ok(Self {
            ctx: Arc::new(WorkerContext {
                queue,
                archives,
                settings,
                stats: CoordinatorStats::default(),
                worker_done: Notify::new(),
            }),
        })
    }

    /// The queue this coordinator drains.
    #[must_use]
    pub fn queue(&self) -> &Arc<BookQueue> {
        &self.ctx.queue
    }

    /// The settings in effect.
    #[must_use]
    pub fn settings(&self) -> &CoordinatorSettings {
        &self.ctx.settings
    }

    /// Outcome counters.
    #[must_use]
    pub fn stats(&self) -> &CoordinatorStats {
        &self.ctx.stats
    }

    /// Runs the supervisory loop until `shutdown` fires.
    ///
    /// On shutdown no new items are claimed, in-flight items are cancelled
    /// and their workers awaited.
    pub async fn run(&self, shutdown: CancelToken) {
        self.supervise(&shutdown, false).await;
    }

    /// Runs until every tracked item is terminal, or `shutdown` fires.
    pub async fn run_until_idle(&self, shutdown: CancelToken) {
        self.supervise(&shutdown, true).await;
    }

    #[instrument(skip(self, shutdown))]
    async fn supervise(&self, shutdown: &CancelToken, stop_when_idle: bool) {
        let ctx = &self.ctx;
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();
        info!(workers = ctx.settings.max_concurrent, "coordinator started");

        loop {
            reap_finished(&mut handles, ctx).await;

            let expired = ctx.queue.expire_stale(ctx.settings.status_timeout);
            if expired > 0 {
                debug!(expired, "expired stale queue entries");
            }
            if shutdown.is_cancelled() {
                break;
            }

            while handles.len() < ctx.settings.max_concurrent {
                let Some((id, cancel)) = ctx.queue.get_next() else {
                    break;
                };
                debug!(book_id = %id, in_flight = handles.len() + 1, "dispatching worker");
                let worker_ctx = Arc::clone(ctx);
                let worker_id = id.clone();
                handles.push((
                    id,
                    tokio::spawn(async move {
                        task::process_item(&worker_ctx, &worker_id, &cancel).await;
                        worker_ctx.worker_done.notify_one();
                    }),
                ));
            }

            if stop_when_idle && handles.is_empty() && ctx.queue.is_idle() {
                break;
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => {}
                () = ctx.worker_done.notified() => {}
                _ = ctx.queue.wait_for_work(ctx.settings.loop_interval) => {}
            }
        }

        if shutdown.is_cancelled() {
            let active = ctx.queue.active_ids();
            info!(active = active.len(), "shutting down; cancelling in-flight items");
            for id in &active {
                ctx.queue.cancel(id);
            }
        }
        for (id, handle) in handles {
            if let Err(error) = handle.await {
                task::handle_task_join_error(ctx, &id, &error);
            }
        }
        info!(
            completed = ctx.stats.completed(),
            failed = ctx.stats.failed(),
            cancelled = ctx.stats.cancelled(),
            "coordinator stopped"
        );
    }
}

async fn reap_finished(handles: &mut Vec<(String, JoinHandle<()>)>, ctx: &WorkerContext) {
    let mut idx = 0;
    while idx < handles.len() {
        if handles[idx].1.is_finished() {
            let (id, handle) = handles.swap_remove(idx);
            if let Err(error) = handle.await {
                task::handle_task_join_error(ctx, &id, &error);
            }
        } else {
            idx += 1;
        }
    }
}
