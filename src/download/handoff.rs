//! Moves finished downloads from the scratch directory into the ingest directory.
//!
//! Files are staged under a `.partial` name keyed by the item, not by the
//! delivered name, and linked into place only once complete, so watchers of
//! the ingest directory never see a half-written book. Publishing never
//! replaces another item's book: a taken title-based name falls back to
//! one that carries the item id.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::error::HandoffError;
use super::filename::disambiguated_file_name;
use crate::queue::CancelToken;

/// Suffix of the intermediate file inside the ingest directory.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Returns the staging path of scratch file `source` inside `ingest_dir`.
///
/// Scratch names are unique per item, so concurrent deliveries never share
/// a staging file even when they publish under the same name.
#[must_use]
pub fn staging_path(source: &Path, ingest_dir: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    ingest_dir.join(name)
}

/// Delivers `source` into `ingest_dir` as `file_name`.
///
/// When the directories share a filesystem the file is renamed. Otherwise, or
/// when the rename is refused, it is copied, verified by size and the source
/// removed. If `file_name` is already taken by a different book, the file is
/// published as `<stem> (<id>).<ext>` instead. Returns the final path.
///
/// # Errors
///
/// Returns [`HandoffError::Cancelled`] if `cancel` fired before the final
/// rename, [`HandoffError::MoveFailed`] when both rename and copy failed, or
/// another [`HandoffError`] for verification and IO failures. Staging
/// artifacts are removed on every error path.
#[instrument(skip(source, cancel), fields(source = %source.display()))]
pub async fn deliver(
    source: &Path,
    ingest_dir: &Path,
    id: &str,
    file_name: &str,
    cross_filesystem: bool,
    cancel: &CancelToken,
) -> Result<PathBuf, HandoffError> {
    let staging = staging_path(source, ingest_dir);

    if cross_filesystem {
        debug!("scratch and ingest are on different filesystems; copying");
        copy_verified(source, &staging).await?;
        remove_source(source).await;
    } else if let Err(rename_error) = tokio::fs::rename(source, &staging).await {
        if rename_error.kind() == ErrorKind::CrossesDevices {
            debug!("rename crossed devices; copying");
        } else {
            warn!(error = %rename_error, "rename into ingest directory failed; copying instead");
        }
        match copy_verified(source, &staging).await {
            Ok(()) => remove_source(source).await,
            Err(HandoffError::Io {
                source: copy_error, ..
            }) => {
                return Err(HandoffError::MoveFailed {
                    from: source.to_path_buf(),
                    to: staging,
                    rename_error,
                    copy_error,
                });
            }
            Err(other) => return Err(other),
        }
    }

    if cancel.is_cancelled() {
        discard(&staging).await;
        return Err(HandoffError::Cancelled {
            path: source.to_path_buf(),
        });
    }

    let own_name = source.file_name().is_some_and(|n| n == file_name);
    let final_path = match publish(&staging, ingest_dir, id, file_name, own_name).await {
        Ok(path) => path,
        Err(error) => {
            discard(&staging).await;
            return Err(error);
        }
    };
    info!(path = %final_path.display(), "book delivered");
    Ok(final_path)
}

/// Makes the staged file visible under its final name without clobbering
/// another item's book.
///
/// A hard link fails instead of replacing an existing file. An id-derived
/// name that is already taken belongs to this item and is replaced.
async fn publish(
    staging: &Path,
    ingest_dir: &Path,
    id: &str,
    file_name: &str,
    own_name: bool,
) -> Result<PathBuf, HandoffError> {
    let preferred = ingest_dir.join(file_name);
    let target = match tokio::fs::hard_link(staging, &preferred).await {
        Ok(()) => {
            discard(staging).await;
            return Ok(preferred);
        }
        Err(error) if error.kind() == ErrorKind::AlreadyExists && !own_name => {
            let fallback = ingest_dir.join(disambiguated_file_name(file_name, id));
            debug!(taken = %preferred.display(), fallback = %fallback.display(), "name taken; using id-qualified name");
            fallback
        }
        Err(error) if error.kind() == ErrorKind::AlreadyExists => preferred,
        Err(error) => {
            debug!(error = %error, "hard link unavailable; renaming");
            preferred
        }
    };
    tokio::fs::rename(staging, &target)
        .await
        .map_err(|e| HandoffError::io(&target, e))?;
    Ok(target)
}

async fn copy_verified(source: &Path, target: &Path) -> Result<(), HandoffError> {
    let expected_bytes = tokio::fs::metadata(source)
        .await
        .map_err(|e| HandoffError::io(source, e))?
        .len();
    if let Err(error) = tokio::fs::copy(source, target).await {
        discard(target).await;
        return Err(HandoffError::io(target, error));
    }
    let actual_bytes = match tokio::fs::metadata(target).await {
        Ok(meta) => meta.len(),
        Err(error) => {
            discard(target).await;
            return Err(HandoffError::io(target, error));
        }
    };
    if actual_bytes != expected_bytes {
        discard(target).await;
        return Err(HandoffError::Incomplete {
            path: target.to_path_buf(),
            expected_bytes,
            actual_bytes,
        });
    }
    Ok(())
}

async fn remove_source(source: &Path) {
    if let Err(error) = tokio::fs::remove_file(source).await {
        warn!(path = %source.display(), error = %error, "could not remove scratch file after copy");
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed staging file"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), error = %error, "could not remove staging file"),
    }
}
