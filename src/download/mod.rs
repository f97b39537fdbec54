//! Fetching, streaming and delivering book files.
//!
//! # Features
//!
//! - Page fetches through a linear retry ladder that escalates to a web
//!   bypasser when a site answers with a challenge
//! - Streaming downloads with progress callbacks and per-chunk cancellation
//! - Detection of HTML error pages served in place of a book
//! - Staged, filesystem-aware handoff into the ingest directory
//! - A bounded worker pool ([`DownloadCoordinator`]) draining the queue

mod client;
mod constants;
mod engine;
mod error;
mod filename;
pub mod handoff;
mod retry;

pub use client::{HttpClient, ProgressFn};
pub use constants::{DEFAULT_MAX_RETRY, DEFAULT_SLEEP};
pub use engine::{
    CoordinatorSettings, CoordinatorStats, DEFAULT_CONCURRENCY, DownloadCoordinator, EngineError,
};
pub use error::{DownloadError, HandoffError, ScriptError};
pub use filename::{
    book_file_name, disambiguated_file_name, format_from_url, parse_size_hint, sanitize_filename,
    scratch_file_name,
};
pub use retry::{
    FailureType, RetryDecision, RetryPolicy, classify_error, classify_http_status,
    parse_retry_after,
};
