//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use book_downloader_core::{SearchFilters, Settings};
use clap::{Args, Parser, Subcommand};

/// Find e-books on archive sites and deliver them to an ingest directory.
#[derive(Parser, Debug)]
#[command(name = "book-downloader")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Maximum concurrent downloads (1-32); overrides MAX_CONCURRENT_DOWNLOADS
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Scratch directory; overrides TMP_DIR
    #[arg(long, global = true, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Ingest directory; overrides INGEST_DIR
    #[arg(long, global = true, value_name = "DIR")]
    pub ingest_dir: Option<PathBuf>,

    /// Archive manager to use (annas_archive, welib)
    #[arg(short = 's', long, global = true)]
    pub source: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search the archive
    Search(SearchArgs),
    /// Show details and candidate download pages for one book
    Info {
        /// Book identifier (e.g. an md5)
        id: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Download books into the ingest directory
    Download(DownloadArgs),
}

/// Arguments of `search`.
#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Free-text query
    pub query: Vec<String>,

    /// ISBN-10 or ISBN-13 (repeatable)
    #[arg(long)]
    pub isbn: Vec<String>,

    /// Author (repeatable)
    #[arg(long)]
    pub author: Vec<String>,

    /// Title term (repeatable)
    #[arg(long)]
    pub title: Vec<String>,

    /// Language code, or `all` (repeatable)
    #[arg(long)]
    pub lang: Vec<String>,

    /// Sort order understood by the source
    #[arg(long)]
    pub sort: Option<String>,

    /// Content type such as book_fiction (repeatable)
    #[arg(long)]
    pub content: Vec<String>,

    /// File format (repeatable)
    #[arg(long)]
    pub format: Vec<String>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

impl SearchArgs {
    /// The free-text query.
    pub fn query_text(&self) -> String {
        self.query.join(" ")
    }

    /// The filters given on the command line.
    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            isbn: self.isbn.clone(),
            authors: self.author.clone(),
            titles: self.title.clone(),
            lang: self.lang.clone(),
            sort: self.sort.clone(),
            content: self.content.clone(),
            format: self.format.clone(),
        }
    }
}

/// Arguments of `download`.
#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Book identifiers, served in the order given
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Priority of the first id; later ids get increasing values
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,

    /// Disable the progress display
    #[arg(long)]
    pub no_progress: bool,
}

impl DownloadArgs {
    /// Pairs each id with its priority, saturating at `i64::MAX`.
    pub fn prioritized_ids(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        (0_i64..)
            .zip(&self.ids)
            .map(|(offset, id)| (id.as_str(), self.priority.saturating_add(offset)))
    }
}

impl Cli {
    /// Applies command-line overrides on top of environment settings.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(concurrency) = self.concurrency {
            settings.max_concurrent = usize::from(concurrency);
        }
        if let Some(dir) = &self.scratch_dir {
            settings.scratch_dir.clone_from(dir);
        }
        if let Some(dir) = &self.ingest_dir {
            settings.ingest_dir.clone_from(dir);
        }
    }

    /// Default log level implied by `-q`/`-v`.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_search_collects_filters() {
        let cli = Cli::try_parse_from([
            "book-downloader",
            "search",
            "dune",
            "messiah",
            "--author",
            "Herbert",
            "--format",
            "epub",
            "--lang",
            "all",
        ])
        .unwrap();
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.query_text(), "dune messiah");
        let filters = args.filters();
        assert_eq!(filters.authors, vec!["Herbert".to_string()]);
        assert_eq!(filters.format, vec!["epub".to_string()]);
        assert_eq!(filters.lang, vec!["all".to_string()]);
    }

    #[test]
    fn test_cli_download_requires_ids() {
        let err = Cli::try_parse_from(["book-downloader", "download"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_download_negative_priority() {
        let cli =
            Cli::try_parse_from(["book-downloader", "download", "abc", "-p", "-2"]).unwrap();
        let Command::Download(args) = cli.command else {
            panic!("expected download");
        };
        assert_eq!(args.ids, vec!["abc".to_string()]);
        assert_eq!(args.priority, -2);
    }

    #[test]
    fn test_cli_download_priorities_follow_argument_order() {
        let cli = Cli::try_parse_from(["book-downloader", "download", "a", "b", "-p", "3"]).unwrap();
        let Command::Download(args) = cli.command else {
            panic!("expected download");
        };
        let pairs: Vec<(&str, i64)> = args.prioritized_ids().collect();
        assert_eq!(pairs, vec![("a", 3), ("b", 4)]);
    }

    #[test]
    fn test_cli_download_priority_saturates_at_max() {
        let max = i64::MAX.to_string();
        let cli = Cli::try_parse_from(["book-downloader", "download", "a", "b", "-p", &max]).unwrap();
        let Command::Download(args) = cli.command else {
            panic!("expected download");
        };
        let priorities: Vec<i64> = args.prioritized_ids().map(|(_, p)| p).collect();
        assert_eq!(priorities, vec![i64::MAX, i64::MAX]);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["book-downloader", "info", "abc", "-vv", "-c", "4"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.concurrency, Some(4));
        assert_eq!(cli.log_level(), "trace");
    }

    #[test]
    fn test_cli_concurrency_out_of_range_rejected() {
        let err = Cli::try_parse_from(["book-downloader", "-c", "33", "info", "abc"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_overrides_settings() {
        let cli = Cli::try_parse_from([
            "book-downloader",
            "--concurrency",
            "7",
            "--ingest-dir",
            "/srv/ingest",
            "info",
            "abc",
        ])
        .unwrap();
        let mut settings = Settings::from_lookup(|_| None).unwrap();
        cli.apply_overrides(&mut settings);
        assert_eq!(settings.max_concurrent, 7);
        assert_eq!(settings.ingest_dir, PathBuf::from("/srv/ingest"));
    }

    #[test]
    fn test_cli_quiet_wins_over_verbose() {
        let cli = Cli::try_parse_from(["book-downloader", "-q", "-v", "info", "x"]).unwrap();
        assert_eq!(cli.log_level(), "error");
    }
}
