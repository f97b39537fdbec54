//! Per-book progress bars for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use book_downloader_core::{BookQueue, QueueStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    queue: Arc<BookQueue>,
    ids: Vec<String>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bars(queue, ids, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bars(
    queue: Arc<BookQueue>,
    ids: Vec<String>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let style = ProgressStyle::with_template("{prefix:>12} [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let bars: Vec<(String, ProgressBar)> = ids
            .into_iter()
            .map(|id| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_prefix(short_id(&id));
                (id, bar)
            })
            .collect();

        loop {
            let stopping = stop.load(Ordering::SeqCst);
            for (id, bar) in &bars {
                if bar.is_finished() {
                    continue;
                }
                let Some(item) = queue.item(id) else {
                    continue;
                };
                bar.set_position(percent_position(item.progress));
                bar.set_message(item.metadata.title.clone());
                if item.status.is_terminal() {
                    let label = match item.status {
                        QueueStatus::Available => "done".to_string(),
                        QueueStatus::Error => {
                            format!("failed: {}", item.error.as_deref().unwrap_or("unknown error"))
                        }
                        other => other.to_string(),
                    };
                    bar.finish_with_message(format!("{} ({label})", item.metadata.title));
                }
            }
            if stopping {
                break;
            }
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        for (_, bar) in &bars {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_position(progress: f64) -> u64 {
    progress.clamp(0.0, 100.0).round() as u64
}

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}
