//! CLI entry point for the book downloader.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use book_downloader_core::service::build_archives;
use book_downloader_core::{
    BookDetails, BookService, BookSummary, CancelToken, LookupCache, QueueStatus, Settings,
};
use clap::Parser;
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::{Cli, Command, DownloadArgs, SearchArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let mut settings = Settings::from_env().context("invalid configuration")?;
    cli.apply_overrides(&mut settings);

    match &cli.command {
        Command::Search(args) => run_search(&settings, args, cli.source.as_deref()).await,
        Command::Info { id, json } => run_info(&settings, id, *json, cli.source.as_deref()).await,
        Command::Download(args) => {
            run_download(&settings, args, cli.source.as_deref(), cli.quiet).await
        }
    }
}

/// Builds a service for lookups only; directories are left untouched and the
/// coordinator is not started.
async fn lookup_service(settings: &Settings) -> Result<BookService> {
    let archives = build_archives(settings)
        .await
        .context("failed to build archive managers")?;
    let service = BookService::new(
        archives,
        LookupCache::new(settings.lookup_cache_ttl),
        settings.coordinator_settings(false),
    )?;
    Ok(service)
}

async fn run_search(settings: &Settings, args: &SearchArgs, source: Option<&str>) -> Result<()> {
    let service = lookup_service(settings).await?;
    let query = args.query_text();
    let results = service
        .search(&query, &args.filters(), source)
        .await
        .with_context(|| format!("search for '{query}' failed"));
    service.shutdown().await;
    let results = results?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        info!("No books found");
    } else {
        for book in &results {
            println!("{}", summary_line(book));
        }
    }
    Ok(())
}

async fn run_info(settings: &Settings, id: &str, json: bool, source: Option<&str>) -> Result<()> {
    let service = lookup_service(settings).await?;
    let details = service
        .get_details(id, source)
        .await
        .with_context(|| format!("failed to load details for {id}"));
    service.shutdown().await;
    let details = details?;

    if json {
        println!("{}", serde_json::to_string_pretty(&details)?);
    } else {
        print_details(&details);
    }
    Ok(())
}

async fn run_download(
    settings: &Settings,
    args: &DownloadArgs,
    source: Option<&str>,
    quiet: bool,
) -> Result<()> {
    let cross_filesystem = settings
        .prepare_directories()
        .context("failed to prepare download directories")?;
    let archives = build_archives(settings)
        .await
        .context("failed to build archive managers")?;
    let service = BookService::new(
        archives,
        LookupCache::new(settings.lookup_cache_ttl),
        settings.coordinator_settings(cross_filesystem),
    )?;

    let mut queued = Vec::with_capacity(args.ids.len());
    for (id, priority) in args.prioritized_ids() {
        if service.enqueue(id, priority, source).await {
            queued.push(id.to_string());
        } else {
            warn!(id = %id, "could not queue book");
        }
    }
    if queued.is_empty() {
        service.shutdown().await;
        bail!("none of the requested books could be queued");
    }
    info!(count = queued.len(), "books queued");

    let shutdown = CancelToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling active downloads");
            interrupt.cancel();
        }
    });

    let show_progress = !args.no_progress && !quiet && io::stderr().is_terminal();
    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(show_progress, Arc::clone(service.queue()), queued.clone());

    service.coordinator().run_until_idle(shutdown).await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }
    service.shutdown().await;

    let mut failed = 0_usize;
    for id in &queued {
        let Some(item) = service.queue().item(id) else {
            continue;
        };
        match item.status {
            QueueStatus::Available | QueueStatus::Done => {
                if let Some(path) = &item.download_path {
                    println!("{}", path.display());
                }
            }
            QueueStatus::Error => {
                failed += 1;
                warn!(
                    id = %id,
                    error = item.error.as_deref().unwrap_or("unknown error"),
                    "download failed"
                );
            }
            _ => failed += 1,
        }
    }

    let stats = service.coordinator().stats();
    info!(
        completed = stats.completed(),
        failed = stats.failed(),
        cancelled = stats.cancelled(),
        "Download run complete"
    );
    if failed > 0 {
        bail!("{failed} of {} books were not delivered", queued.len());
    }
    Ok(())
}

fn summary_line(book: &BookSummary) -> String {
    let format = book.format.as_deref().unwrap_or("?");
    let size = book.size.as_deref().unwrap_or("?");
    match &book.author {
        Some(author) => format!("{}  {format:<5} {size:>9}  {} / {author}", book.id, book.title),
        None => format!("{}  {format:<5} {size:>9}  {}", book.id, book.title),
    }
}

fn print_details(details: &BookDetails) {
    println!("{}", details.title);
    let fields = [
        ("Author", &details.author),
        ("Publisher", &details.publisher),
        ("Year", &details.year),
        ("Language", &details.language),
        ("Format", &details.format),
        ("Size", &details.size),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            println!("  {label}: {value}");
        }
    }
    for (key, values) in &details.info {
        println!("  {key}: {}", values.join(", "));
    }
    if details.download_urls.is_empty() {
        println!("  No download pages found");
    } else {
        println!("  Download pages:");
        for url in &details.download_urls {
            println!("    {url}");
        }
    }
}
