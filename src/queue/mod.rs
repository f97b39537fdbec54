//! In-memory download queue with priority ordering and cancellation plumbing.
//!
//! This module tracks requested books through their lifecycle
//! (queued → downloading → available/error/cancelled).
//!
//! # Overview
//!
//! The queue system consists of:
//! - [`BookQueue`] - Main interface for queue operations
//! - [`QueueItemView`] - Snapshot of an individual queue entry
//! - [`QueueStatus`] - Item lifecycle states
//! - [`CancelToken`] - Cooperative cancellation signal handed to workers
//!
//! Every mutation and the priority-selection read run under one mutex per
//! queue, so a claim can never observe a half-applied reorder and no two
//! workers can claim the same entry.
//!
//! # Example
//!
//! ```
//! use book_downloader_core::queue::{BookMetadata, BookQueue, QueueStatus};
//!
//! let queue = BookQueue::new();
//! queue.add("a", 5, BookMetadata::new("Slow Book", "annas_archive"));
//! queue.add("b", 1, BookMetadata::new("Urgent Book", "annas_archive"));
//!
//! let (id, _cancel) = queue.get_next().unwrap();
//! assert_eq!(id, "b");
//! queue.update_status(&id, QueueStatus::Downloading);
//! ```

mod cancel;
mod item;

pub use cancel::CancelToken;
pub use item::{BookMetadata, QueueItemView, QueueStatus};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

/// Default priority for new queue items.
pub const DEFAULT_PRIORITY: i64 = 0;

#[derive(Debug)]
struct Entry {
    status: QueueStatus,
    priority: i64,
    enqueued_at: Instant,
    sequence: u64,
    progress: f64,
    claimed: bool,
    cancel: CancelToken,
    download_path: Option<PathBuf>,
    error: Option<String>,
    metadata: BookMetadata,
    status_changed_at: Instant,
}

impl Entry {
    fn new(priority: i64, sequence: u64, metadata: BookMetadata) -> Self {
        let now = Instant::now();
        Self {
            status: QueueStatus::Queued,
            priority,
            enqueued_at: now,
            sequence,
            progress: 0.0,
            claimed: false,
            cancel: CancelToken::new(),
            download_path: None,
            error: None,
            metadata,
            status_changed_at: now,
        }
    }

    fn order_key(&self) -> (i64, Instant, u64) {
        (self.priority, self.enqueued_at, self.sequence)
    }

    fn set_status(&mut self, status: QueueStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Instant::now();
        }
        if status.is_terminal() {
            self.claimed = false;
        }
    }

    fn view(&self, id: &str) -> QueueItemView {
        QueueItemView {
            id: id.to_string(),
            status: self.status,
            priority: self.priority,
            progress: self.progress,
            claimed: self.claimed,
            download_path: self.download_path.clone(),
            error: self.error.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    next_sequence: u64,
}

impl QueueState {
    fn apply_priority(&mut self, id: &str, priority: i64) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.status == QueueStatus::Queued => {
                entry.priority = priority;
                true
            }
            Some(entry) => {
                debug!(book_id = %id, status = %entry.status, "priority change ignored for non-queued item");
                false
            }
            None => {
                warn!(book_id = %id, "priority change for unknown item");
                false
            }
        }
    }
}

/// Thread- and task-safe store of requested downloads.
///
/// Designed to be wrapped in `Arc` and shared between the caller surface and
/// the download coordinator.
#[derive(Debug, Default)]
pub struct BookQueue {
    state: Mutex<QueueState>,
    work_available: Notify,
}

impl BookQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits `id` in `queued` state.
    ///
    /// If `id` is already tracked and not terminal, only its priority is
    /// updated. A terminal entry is replaced as if it were new, with a fresh
    /// cancel token. Returns whether the item is now tracked.
    #[instrument(skip(self, metadata), fields(book_id = %id))]
    pub fn add(&self, id: &str, priority: i64, metadata: BookMetadata) -> bool {
        if id.trim().is_empty() {
            warn!("refusing to queue an empty id");
            return false;
        }

        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(id)
            && !entry.status.is_terminal()
        {
            debug!(
                old_priority = entry.priority,
                new_priority = priority,
                "item already queued; updating priority"
            );
            if entry.status == QueueStatus::Queued {
                entry.priority = priority;
            }
            return true;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state
            .entries
            .insert(id.to_string(), Entry::new(priority, sequence, metadata));
        drop(state);

        info!(priority, "book queued");
        self.work_available.notify_one();
        true
    }

    /// Claims the ready item with the lowest `(priority, enqueued_at)`.
    ///
    /// The claimed entry stays `queued` until its worker reports
    /// `downloading`, but it is never handed out twice.
    pub fn get_next(&self) -> Option<(String, CancelToken)> {
        let mut state = self.lock();
        let id = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.status == QueueStatus::Queued && !entry.claimed)
            .min_by_key(|(_, entry)| entry.order_key())
            .map(|(id, _)| id.clone())?;

        let entry = state.entries.get_mut(&id)?;
        entry.claimed = true;
        debug!(book_id = %id, priority = entry.priority, "claimed next item");
        Some((id, entry.cancel.clone()))
    }

    /// Moves `id` to `status` if the state machine allows it.
    ///
    /// Returns `false` for unknown ids and illegal transitions (such as leaving
    /// a terminal state).
    pub fn update_status(&self, id: &str, status: QueueStatus) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            warn!(book_id = %id, %status, "status update for unknown item");
            return false;
        };
        if !entry.status.can_transition_to(status) {
            debug!(book_id = %id, from = %entry.status, to = %status, "ignoring illegal status transition");
            return false;
        }
        entry.set_status(status);
        if status == QueueStatus::Available {
            entry.progress = 100.0;
        }
        true
    }

    /// Records download progress for a `downloading` item.
    ///
    /// Values are clamped to `0.0..=100.0` and never move backwards.
    pub fn update_progress(&self, id: &str, percent: f64) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            warn!(book_id = %id, "progress update for unknown item");
            return false;
        };
        if entry.status != QueueStatus::Downloading {
            return false;
        }
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        if percent > entry.progress {
            entry.progress = percent;
        }
        true
    }

    /// Sets or clears the final location of a downloaded file.
    pub fn update_download_path(&self, id: &str, path: Option<PathBuf>) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            warn!(book_id = %id, "download path update for unknown item");
            return false;
        };
        entry.download_path = path;
        true
    }

    /// Records the last failure message of an item.
    pub fn update_error(&self, id: &str, message: impl Into<String>) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            warn!(book_id = %id, "error update for unknown item");
            return false;
        };
        entry.error = Some(message.into());
        true
    }

    /// Replaces the metadata of an item.
    pub fn update_metadata(&self, id: &str, metadata: BookMetadata) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            warn!(book_id = %id, "metadata update for unknown item");
            return false;
        };
        entry.metadata = metadata;
        true
    }

    /// Changes the priority of a `queued` item.
    pub fn set_priority(&self, id: &str, priority: i64) -> bool {
        self.lock().apply_priority(id, priority)
    }

    /// Applies a batch of priority changes in one critical section.
    ///
    /// Entries that are unknown or no longer queued are skipped. Returns
    /// `true` only if every entry was applied.
    #[instrument(skip(self, priorities), fields(count = priorities.len()))]
    pub fn reorder(&self, priorities: &HashMap<String, i64>) -> bool {
        let mut state = self.lock();
        let mut all_applied = true;
        for (id, priority) in priorities {
            if !state.apply_priority(id, *priority) {
                all_applied = false;
            }
        }
        all_applied
    }

    /// Signals the cancel token of `id`.
    ///
    /// A `queued` item moves straight to `cancelled`. A `downloading` item is
    /// left for its worker to finalize once it observes the signal. Returns
    /// `false` for unknown or already finished items.
    #[instrument(skip(self), fields(book_id = %id))]
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            warn!("cancel requested for unknown item");
            return false;
        };
        match entry.status {
            QueueStatus::Queued => {
                entry.cancel.cancel();
                entry.set_status(QueueStatus::Cancelled);
                info!("queued item cancelled");
                true
            }
            QueueStatus::Downloading => {
                entry.cancel.cancel();
                info!("cancellation signalled to active download");
                true
            }
            status => {
                debug!(%status, "cancel ignored for finished item");
                false
            }
        }
    }

    /// Returns a view of one item.
    #[must_use]
    pub fn item(&self, id: &str) -> Option<QueueItemView> {
        self.lock().entries.get(id).map(|entry| entry.view(id))
    }

    /// Returns all items for display.
    ///
    /// Unfinished items come first in claim order, followed by finished items
    /// in admission order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueItemView> {
        let state = self.lock();
        let mut entries: Vec<(&String, &Entry)> = state.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| {
            let terminal = entry.status.is_terminal();
            let priority = if terminal { 0 } else { entry.priority };
            (terminal, priority, entry.enqueued_at, entry.sequence)
        });
        entries
            .into_iter()
            .map(|(id, entry)| entry.view(id))
            .collect()
    }

    /// Returns the ids currently owned by a worker, in admission order.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        let state = self.lock();
        let mut active: Vec<(&String, &Entry)> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                !entry.status.is_terminal()
                    && (entry.claimed || entry.status == QueueStatus::Downloading)
            })
            .collect();
        active.sort_by_key(|(_, entry)| entry.sequence);
        active.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Removes every item in a terminal state and returns how many were removed.
    pub fn sweep_finished(&self) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.status.is_terminal());
        let removed = before - state.entries.len();
        if removed > 0 {
            info!(removed, "cleared finished items");
        }
        removed
    }

    /// Drops terminal items older than `timeout` and clears download paths
    /// whose file no longer exists.
    ///
    /// Returns the number of removed items.
    pub fn expire_stale(&self, timeout: Duration) -> usize {
        let (removed, delivered) = {
            let mut state = self.lock();
            let before = state.entries.len();
            state.entries.retain(|_, entry| {
                !(entry.status.is_terminal() && entry.status_changed_at.elapsed() > timeout)
            });
            let removed = before - state.entries.len();
            let delivered: Vec<(String, PathBuf)> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.status == QueueStatus::Available)
                .filter_map(|(id, entry)| {
                    entry.download_path.clone().map(|path| (id.clone(), path))
                })
                .collect();
            (removed, delivered)
        };
        if removed > 0 {
            debug!(removed, "expired stale finished items");
        }

        // Filesystem checks run outside the lock.
        let missing: Vec<(String, PathBuf)> = delivered
            .into_iter()
            .filter(|(_, path)| !path.exists())
            .collect();
        if !missing.is_empty() {
            let mut state = self.lock();
            for (id, path) in missing {
                if let Some(entry) = state.entries.get_mut(&id)
                    && entry.download_path.as_ref() == Some(&path)
                {
                    debug!(book_id = %id, path = %path.display(), "delivered file vanished; clearing path");
                    entry.download_path = None;
                }
            }
        }
        removed
    }

    /// Returns true when nothing is waiting or downloading.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock()
            .entries
            .values()
            .all(|entry| entry.status.is_terminal())
    }

    /// Number of tracked items, finished ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until an item is admitted or `timeout` elapses.
    ///
    /// Returns true if woken by an admission.
    pub async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.work_available.notified())
            .await
            .is_ok()
    }
}
