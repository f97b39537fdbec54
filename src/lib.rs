//! Book Downloader Core Library
//!
//! Finds e-books on archive sites and delivers them to a local ingest
//! directory with bounded concurrency, user-assigned priority and support for
//! sites that challenge automated clients.
//!
//! # Architecture
//!
//! - [`queue`] - In-memory download queue with priorities and cancellation
//! - [`download`] - Fetch primitive, retry ladder, coordinator and file handoff
//! - [`archive`] - Archive managers (search, details, link resolution)
//! - [`bypass`] - Web bypassers for challenge-protected pages
//! - [`cache`] - Short-TTL lookup cache
//! - [`config`] - Startup settings
//! - [`service`] - The service registry callers talk to

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod bypass;
pub mod cache;
pub mod config;
pub mod download;
pub mod queue;
pub mod service;
mod user_agent;

// Re-export commonly used types
pub use archive::{ArchiveError, ArchiveKind, ArchiveManager, BookDetails, BookSummary, SearchFilters};
pub use bypass::{BypasserKind, WebBypasser};
pub use cache::LookupCache;
pub use config::{ConfigError, Settings};
pub use download::{DownloadCoordinator, DownloadError, HttpClient, RetryPolicy};
pub use queue::{BookQueue, CancelToken, QueueItemView, QueueStatus};
pub use service::{BookService, ServiceError};
