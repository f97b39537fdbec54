use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};

use super::WorkerContext;
use crate::download::error::{HandoffError, ScriptError};
use crate::download::filename::{book_file_name, format_from_url, parse_size_hint, scratch_file_name};
use crate::download::handoff;
use crate::queue::{BookMetadata, CancelToken, QueueStatus};

/// Why an item did not reach the ingest directory.
#[derive(Debug)]
enum ItemFailure {
    Cancelled,
    Failed(String),
}

impl ItemFailure {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Runs one claimed item to a terminal state.
#[instrument(skip(ctx, cancel), fields(book_id = %id))]
pub(super) async fn process_item(ctx: &Arc<WorkerContext>, id: &str, cancel: &CancelToken) {
    let queue = &ctx.queue;
    if cancel.is_cancelled() {
        queue.update_status(id, QueueStatus::Cancelled);
        ctx.stats.increment_cancelled();
        return;
    }
    if !queue.update_status(id, QueueStatus::Downloading) {
        debug!("item left the queued state before its worker started");
        return;
    }

    match download_item(ctx, id, cancel).await {
        Ok(path) => {
            info!(path = %path.display(), "book available");
            queue.update_download_path(id, Some(path));
            queue.update_status(id, QueueStatus::Available);
            ctx.stats.increment_completed();
        }
        Err(ItemFailure::Cancelled) => {
            info!("download cancelled");
            queue.update_status(id, QueueStatus::Cancelled);
            ctx.stats.increment_cancelled();
        }
        Err(ItemFailure::Failed(message)) => {
            warn!(error = %message, "download failed");
            queue.update_error(id, message);
            queue.update_status(id, QueueStatus::Error);
            ctx.stats.increment_failed();
        }
    }
}

async fn download_item(
    ctx: &Arc<WorkerContext>,
    id: &str,
    cancel: &CancelToken,
) -> Result<PathBuf, ItemFailure> {
    let view = ctx
        .queue
        .item(id)
        .ok_or_else(|| ItemFailure::failed("item is no longer tracked"))?;
    let manager = Arc::clone(ctx.archives.for_source(&view.metadata.source));

    let mut metadata = view.metadata;
    if metadata.download_urls.is_empty() {
        let details = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ItemFailure::Cancelled),
            details = manager.get_details(id) => details,
        }
        .map_err(|e| ItemFailure::failed(format!("could not resolve book details: {e}")))?;
        metadata = BookMetadata::from(&details);
        ctx.queue.update_metadata(id, metadata.clone());
    }
    if metadata.download_urls.is_empty() {
        return Err(ItemFailure::failed("no download sources found"));
    }

    let size_hint = metadata.size.as_deref().and_then(parse_size_hint);
    let progress_queue = Arc::clone(&ctx.queue);
    let progress_id = id.to_string();
    let on_progress = move |percent: f64| {
        progress_queue.update_progress(&progress_id, percent);
    };

    let mut last_error: Option<String> = None;
    let mut finished: Option<(PathBuf, Option<String>)> = None;
    for (index, link) in metadata.download_urls.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ItemFailure::Cancelled);
        }
        let Some(url) = manager
            .resolve_download_link(link, &metadata.title, cancel)
            .await
        else {
            if cancel.is_cancelled() {
                return Err(ItemFailure::Cancelled);
            }
            debug!(source = index, link = %link, "no direct link");
            last_error = Some(format!("no direct link from {link}"));
            continue;
        };

        let format = metadata.format.clone().or_else(|| format_from_url(&url));
        let scratch = ctx
            .settings
            .scratch_dir
            .join(scratch_file_name(id, format.as_deref()));
        match manager
            .client()
            .download_to_path(&url, size_hint, &scratch, &on_progress, cancel)
            .await
        {
            Ok(bytes) => {
                debug!(source = index, bytes, "source succeeded");
                finished = Some((scratch, format));
                break;
            }
            Err(error) if error.is_cancelled() => {
                remove_scratch(&scratch).await;
                return Err(ItemFailure::Cancelled);
            }
            Err(error) => {
                warn!(source = index, error = %error, "source failed; trying next");
                last_error = Some(error.to_string());
            }
        }
    }

    let Some((scratch, format)) = finished else {
        return Err(ItemFailure::Failed(format!(
            "all {} sources failed; last error: {}",
            metadata.download_urls.len(),
            last_error.unwrap_or_else(|| "unknown".to_string())
        )));
    };

    if let Some(script) = ctx.settings.custom_script.as_deref()
        && let Err(error) = run_custom_script(script, &scratch).await
    {
        remove_scratch(&scratch).await;
        return Err(ItemFailure::failed(error.to_string()));
    }
    if cancel.is_cancelled() {
        remove_scratch(&scratch).await;
        return Err(ItemFailure::Cancelled);
    }

    let file_name = book_file_name(
        id,
        &metadata.title,
        format.as_deref(),
        ctx.settings.use_book_title,
    );
    match handoff::deliver(
        &scratch,
        &ctx.settings.ingest_dir,
        id,
        &file_name,
        ctx.settings.cross_filesystem,
        cancel,
    )
    .await
    {
        Ok(path) => Ok(path),
        Err(HandoffError::Cancelled { .. }) => {
            remove_scratch(&scratch).await;
            Err(ItemFailure::Cancelled)
        }
        Err(error) => {
            remove_scratch(&scratch).await;
            Err(ItemFailure::failed(error.to_string()))
        }
    }
}

/// Runs the post-download hook with the scratch file as its only argument.
async fn run_custom_script(script: &Path, file: &Path) -> Result<(), ScriptError> {
    debug!(script = %script.display(), "running custom script");
    let status = Command::new(script)
        .arg(file)
        .status()
        .await
        .map_err(|source| ScriptError::Spawn {
            script: script.to_path_buf(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ScriptError::Failed {
            script: script.to_path_buf(),
            code: status.code(),
        })
    }
}

async fn remove_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed scratch file"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), error = %error, "could not remove scratch file"),
    }
}

pub(super) fn handle_task_join_error(ctx: &WorkerContext, id: &str, join_error: &JoinError) {
    warn!(book_id = %id, error = %join_error, "download task panicked");
    ctx.queue.update_error(id, format!("worker task failed: {join_error}"));
    if !ctx.queue.update_status(id, QueueStatus::Error) {
        debug!(book_id = %id, "panicked item was already terminal");
    }
    ctx.stats.increment_failed();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_custom_script_success_and_failure() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("book.epub");
        std::fs::write(&file, b"x").unwrap();

        let ok = write_script(dir.path(), "ok.sh", "test -f \"$1\"");
        run_custom_script(&ok, &file).await.unwrap();

        let failing = write_script(dir.path(), "fail.sh", "exit 3");
        let err = run_custom_script(&failing, &file).await.unwrap_err();
        assert!(matches!(err, ScriptError::Failed { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_custom_script_missing_binary() {
        let dir = TempDir::new().unwrap();
        let err = run_custom_script(&dir.path().join("nope"), &dir.path().join("f"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_remove_scratch_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.epub");
        remove_scratch(&path).await;
        std::fs::write(&path, b"x").unwrap();
        remove_scratch(&path).await;
        assert!(!path.exists());
    }
}
