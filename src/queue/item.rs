//! Queue item types and status definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Status of a queue item.
///
/// ```text
/// queued -> downloading -> available | error | cancelled
/// queued -> cancelled | error
/// available -> done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is fetching the file.
    Downloading,
    /// File is in the ingest directory.
    Available,
    /// Every candidate source failed.
    Error,
    /// File was consumed downstream.
    Done,
    /// Cancelled by the user.
    Cancelled,
}

impl QueueStatus {
    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Available => "available",
            Self::Error => "error",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for states that are only left through an explicit re-add.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Available | Self::Error | Self::Done | Self::Cancelled
        )
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed so mutators stay idempotent.
    #[must_use]
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (
                Self::Queued,
                Self::Downloading | Self::Cancelled | Self::Error
            ) | (
                Self::Downloading,
                Self::Available | Self::Error | Self::Cancelled
            ) | (Self::Available, Self::Done)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "available" => Ok(Self::Available),
            "error" => Ok(Self::Error),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// Book metadata carried by a queue entry.
///
/// Populated at admission from the archive lookup and refreshed by the
/// coordinator the first time it resolves download links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Display title.
    pub title: String,
    /// Author line as shown by the archive.
    pub author: Option<String>,
    /// Lower-case file format (e.g. `epub`).
    pub format: Option<String>,
    /// Human size hint as shown by the archive (e.g. `1.4MB`).
    pub size: Option<String>,
    /// Identifier of the archive manager that produced this entry.
    pub source: String,
    /// Ranked candidate download pages, most preferred first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_urls: Vec<String>,
}

impl BookMetadata {
    /// Creates metadata with only a title and source archive.
    #[must_use]
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source: source.into(),
            ..Self::default()
        }
    }
}

/// Read-only view of one queue entry, as handed to display callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItemView {
    /// Source-scoped identifier (e.g. an MD5 content hash).
    pub id: String,
    /// Current lifecycle state.
    pub status: QueueStatus,
    /// Lower value is served first.
    pub priority: i64,
    /// Download progress in percent, `0.0..=100.0`.
    pub progress: f64,
    /// Whether a worker has claimed this entry.
    pub claimed: bool,
    /// Final location once the file reached the ingest directory.
    pub download_path: Option<PathBuf>,
    /// Last failure message for `error` items.
    pub error: Option<String>,
    /// Book metadata.
    pub metadata: BookMetadata,
}

impl fmt::Display for QueueItemView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem {{ id: {}, title: {}, status: {}, priority: {} }}",
            self.id, self.metadata.title, self.status, self.priority
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_as_str_round_trips_through_from_str() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Downloading,
            QueueStatus::Available,
            QueueStatus::Error,
            QueueStatus::Done,
            QueueStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_queue_status_from_str_rejects_unknown() {
        let err = "paused".parse::<QueueStatus>().unwrap_err();
        assert!(err.contains("paused"));
    }

    #[test]
    fn test_queue_status_serde_snake_case() {
        let json = serde_json::to_string(&QueueStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(!QueueStatus::Downloading.is_terminal());
        assert!(QueueStatus::Available.is_terminal());
        assert!(QueueStatus::Error.is_terminal());
        assert!(QueueStatus::Done.is_terminal());
        assert!(QueueStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_transitions_follow_state_machine() {
        assert!(QueueStatus::Queued.can_transition_to(QueueStatus::Downloading));
        assert!(QueueStatus::Queued.can_transition_to(QueueStatus::Cancelled));
        assert!(QueueStatus::Downloading.can_transition_to(QueueStatus::Available));
        assert!(QueueStatus::Downloading.can_transition_to(QueueStatus::Cancelled));
        assert!(QueueStatus::Available.can_transition_to(QueueStatus::Done));

        assert!(!QueueStatus::Queued.can_transition_to(QueueStatus::Available));
        assert!(!QueueStatus::Cancelled.can_transition_to(QueueStatus::Downloading));
        assert!(!QueueStatus::Error.can_transition_to(QueueStatus::Queued));
        assert!(!QueueStatus::Done.can_transition_to(QueueStatus::Available));
    }

    #[test]
    fn test_same_state_transition_is_allowed() {
        assert!(QueueStatus::Cancelled.can_transition_to(QueueStatus::Cancelled));
    }
}
