//! Manager for Anna's-Archive-style sources.
//!
//! The same page layout is served by Anna's Archive and by WeLib, so one
//! implementation backs both [`ArchiveKind`] variants. WeLib pages sit behind
//! an anti-bot wall and are always fetched through the bypasser.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::parse::{self, CandidateLinks, LinkOutcome, PageKind};
use super::{
    ArchiveError, ArchiveKind, ArchiveManager, ArchiveSettings, BookDetails, BookSummary,
    SearchFilters,
};
use crate::download::HttpClient;
use crate::queue::CancelToken;

const MAX_COUNTDOWN_ROUNDS: u32 = 3;
const FAST_DOWNLOAD_PATH: &str = "/dyn/api/fast_download.json";

/// Archive manager for Anna's Archive and its WeLib sibling.
#[derive(Debug)]
pub struct AnnasArchiveManager {
    kind: ArchiveKind,
    base_url: String,
    client: HttpClient,
    donator_key: Option<String>,
    welib_url: Option<String>,
    prioritize_welib: bool,
    supported_formats: Vec<String>,
    languages: Vec<String>,
}

impl AnnasArchiveManager {
    /// Creates the manager, resolving `auto` to the first reachable mirror.
    ///
    /// Mirrors from `additional_urls` are probed before the built-in list.
    /// When none answers, the first candidate is used and a warning logged.
    ///
    /// # Errors
    ///
    /// Does not fail today; the signature leaves room for validating settings.
    #[instrument(skip(settings, client), fields(manager = kind.as_str()))]
    pub async fn connect(
        kind: ArchiveKind,
        settings: ArchiveSettings,
        client: HttpClient,
    ) -> Result<Self, ArchiveError> {
        let configured = settings.base_url.trim();
        let base_url = if configured.is_empty() || configured.eq_ignore_ascii_case("auto") {
            select_mirror(kind, &settings.additional_urls, &client).await
        } else {
            configured.trim_end_matches('/').to_string()
        };
        info!(base_url = %base_url, "archive manager ready");

        Ok(Self {
            kind,
            base_url,
            client,
            donator_key: settings.donator_key.filter(|k| !k.trim().is_empty()),
            welib_url: settings
                .welib_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            prioritize_welib: settings.prioritize_welib,
            supported_formats: settings
                .supported_formats
                .iter()
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
            languages: settings.languages,
        })
    }

    /// The mirror this manager talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pages_need_bypasser(&self) -> bool {
        self.kind == ArchiveKind::Welib
    }

    fn bypass_active(&self) -> bool {
        self.client.bypasser().is_enabled()
    }

    fn format_rank(&self, format: Option<&str>) -> usize {
        format
            .and_then(|f| self.supported_formats.iter().position(|s| s == f))
            .unwrap_or(self.supported_formats.len())
    }

    fn fast_lane_url(&self, id: &str) -> Option<String> {
        let key = self.donator_key.as_deref()?;
        Some(format!(
            "{}{FAST_DOWNLOAD_PATH}?md5={}&key={}",
            self.base_url,
            urlencoding::encode(id),
            urlencoding::encode(key)
        ))
    }

    /// Slow-download links offered by the configured WeLib mirror.
    async fn welib_links(&self, id: &str) -> Vec<String> {
        let Some(welib_url) = self.welib_url.as_deref() else {
            return Vec::new();
        };
        if self.kind == ArchiveKind::Welib || !self.bypass_active() {
            return Vec::new();
        }
        let url = format!("{welib_url}/md5/{id}");
        let page = self.client.fetch_page(&url, true).await;
        if page.is_empty() {
            debug!(book_id = %id, "no WeLib page");
            return Vec::new();
        }
        parse::parse_slow_download_links(&page, &url)
    }

    fn link_needs_bypasser(&self, link: &str) -> bool {
        self.pages_need_bypasser()
            || link.contains("welib")
            || PageKind::of(link) == PageKind::SlowDownload
    }

    async fn resolve_fast_lane(&self, link: &str, cancel: &CancelToken) -> Option<String> {
        let body = self.client.fetch_page_or_cancel(link, false, cancel).await;
        if body.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(error) => {
                warn!(error = %error, "fast download API returned invalid JSON");
                return None;
            }
        };
        let url = value
            .get("download_url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(ToString::to_string);
        if url.is_none() {
            let reason = value.get("error").and_then(Value::as_str).unwrap_or("");
            warn!(error = reason, "fast download API returned no link");
        }
        url
    }
}

#[async_trait]
impl ArchiveManager for AnnasArchiveManager {
    fn id(&self) -> &str {
        self.kind.as_str()
    }

    fn name(&self) -> &str {
        self.kind.display_name()
    }

    fn client(&self) -> &HttpClient {
        &self.client
    }

    #[instrument(skip(self, filters), fields(manager = self.kind.as_str()))]
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<BookSummary>, ArchiveError> {
        if query.trim().is_empty() && filters.is_empty() {
            debug!("empty search; skipping network");
            return Ok(Vec::new());
        }
        let url = build_search_url(
            &self.base_url,
            query,
            filters,
            &self.supported_formats,
            &self.languages,
        );
        let page = self
            .client
            .fetch_page(&url, self.pages_need_bypasser())
            .await;
        if page.is_empty() {
            return Err(ArchiveError::fetch(url));
        }
        if page.contains("No files found.") {
            info!("search returned no files");
            return Ok(Vec::new());
        }

        let mut books = parse::parse_search_results(&page);
        books.sort_by_key(|book| self.format_rank(book.format.as_deref()));
        info!(results = books.len(), "search complete");
        Ok(books)
    }

    #[instrument(skip(self), fields(manager = self.kind.as_str()))]
    async fn get_details(&self, id: &str) -> Result<BookDetails, ArchiveError> {
        let id = id.trim();
        if id.is_empty() || id.contains('/') {
            return Err(ArchiveError::InvalidId { id: id.to_string() });
        }
        let url = format!("{}/md5/{id}", self.base_url);
        let page = self
            .client
            .fetch_page(&url, self.pages_need_bypasser())
            .await;
        if page.is_empty() {
            return Err(ArchiveError::fetch(url));
        }
        let parsed = parse::parse_details(&page, &url)
            .ok_or_else(|| ArchiveError::parse(&url, "no title on details page"))?;

        let welib = self.welib_links(id).await;
        let download_urls = rank_candidates(
            self.fast_lane_url(id),
            &parsed.links,
            &welib,
            self.prioritize_welib,
            self.bypass_active(),
        );
        debug!(candidates = download_urls.len(), "details resolved");

        let first_info = |prefix: &str| {
            parsed
                .info
                .iter()
                .find(|(key, _)| key.to_lowercase().starts_with(prefix))
                .and_then(|(_, values)| values.first().cloned())
        };
        Ok(BookDetails {
            id: id.to_string(),
            title: parsed.title.clone(),
            author: parsed.author.clone(),
            publisher: parsed.publisher.clone(),
            year: first_info("year"),
            language: first_info("language"),
            format: parsed.format.clone(),
            size: parsed.size.clone(),
            preview: parsed.preview.clone(),
            source: self.kind.as_str().to_string(),
            info: parsed.info,
            download_urls,
        })
    }

    #[instrument(skip(self, cancel), fields(manager = self.kind.as_str()))]
    async fn resolve_download_link(
        &self,
        link: &str,
        title: &str,
        cancel: &CancelToken,
    ) -> Option<String> {
        if link.contains(FAST_DOWNLOAD_PATH) {
            return self.resolve_fast_lane(link, cancel).await;
        }

        let kind = PageKind::of(link);
        let use_bypasser = self.link_needs_bypasser(link);
        for round in 1..=MAX_COUNTDOWN_ROUNDS {
            if cancel.is_cancelled() {
                return None;
            }
            let page = self
                .client
                .fetch_page_or_cancel(link, use_bypasser, cancel)
                .await;
            if page.is_empty() {
                return None;
            }
            match parse::extract_direct_link(&page, kind) {
                LinkOutcome::Direct(href) => {
                    let url = parse::absolute_url(link, &href);
                    return (!url.is_empty()).then_some(url);
                }
                LinkOutcome::Countdown(seconds) => {
                    info!(round, seconds, "waiting out download countdown");
                    if cancel.wait_timeout(Duration::from_secs(seconds)).await {
                        debug!("cancelled during countdown");
                        return None;
                    }
                }
                LinkOutcome::Missing => {
                    debug!("no direct link on page");
                    return None;
                }
            }
        }
        warn!(rounds = MAX_COUNTDOWN_ROUNDS, "countdown never finished");
        None
    }
}

async fn select_mirror(kind: ArchiveKind, additional: &[String], client: &HttpClient) -> String {
    let candidates: Vec<String> = additional
        .iter()
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .chain(kind.known_mirrors().iter().map(ToString::to_string))
        .collect();
    for candidate in &candidates {
        if client.probe(candidate).await {
            return candidate.clone();
        }
    }
    let fallback = candidates
        .into_iter()
        .next()
        .unwrap_or_else(|| kind.known_mirrors()[0].to_string());
    warn!(mirror = %fallback, "no mirror answered; using first candidate");
    fallback
}

/// Orders candidate pages for download, most preferred first.
///
/// Partner-server links are only useful when a bypasser can get through the
/// wall in front of them. Duplicates keep their first position.
pub(crate) fn rank_candidates(
    fast_lane: Option<String>,
    links: &CandidateLinks,
    welib: &[String],
    prioritize_welib: bool,
    bypass_active: bool,
) -> Vec<String> {
    let mut ranked: Vec<String> = Vec::new();
    let mut extend = |urls: &[String]| {
        for url in urls {
            if !ranked.contains(url) {
                ranked.push(url.clone());
            }
        }
    };

    if let Some(url) = fast_lane.as_ref() {
        extend(std::slice::from_ref(url));
    }
    if prioritize_welib && bypass_active {
        extend(welib);
    }
    if bypass_active {
        extend(&links.partner_no_waitlist);
    }
    extend(&links.libgen);
    if !prioritize_welib && bypass_active {
        extend(welib);
    }
    if bypass_active {
        extend(&links.partner_waitlist);
    }
    extend(&links.zlib);
    ranked
}

/// Builds the search URL for `query` and `filters`.
///
/// ISBN and author filters are folded into the query text, title filters
/// become term pairs. Empty format or language filters fall back to the
/// manager defaults; the language `all` disables language filtering.
#[must_use]
pub fn build_search_url(
    base_url: &str,
    query: &str,
    filters: &SearchFilters,
    supported_formats: &[String],
    default_languages: &[String],
) -> String {
    let mut terms: Vec<String> = Vec::new();
    let isbn: Vec<String> = filters
        .isbn
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty())
        .map(|i| format!("('isbn13:{i}' || 'isbn10:{i}')"))
        .collect();
    if !isbn.is_empty() {
        terms.push(isbn.join(" || "));
    }
    terms.extend(
        filters
            .authors
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(|a| format!("author:{a}")),
    );
    if !query.trim().is_empty() {
        terms.push(query.trim().to_string());
    }

    let mut url = format!(
        "{}/search?index=&page=1&display=table&acc=aa_download&acc=external_download",
        base_url.trim_end_matches('/')
    );
    let formats = if filters.format.is_empty() {
        supported_formats
    } else {
        &filters.format
    };
    for format in formats {
        let _ = write!(url, "&ext={}", urlencoding::encode(&format.to_lowercase()));
    }
    let _ = write!(url, "&q={}", urlencoding::encode(&terms.join(" ")));

    let languages = if filters.lang.is_empty() {
        default_languages
    } else {
        &filters.lang
    };
    for lang in languages
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("all"))
    {
        let _ = write!(url, "&lang={}", urlencoding::encode(lang));
    }
    if let Some(sort) = filters.sort.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let _ = write!(url, "&sort={}", urlencoding::encode(sort));
    }
    for content in &filters.content {
        let _ = write!(url, "&content={}", urlencoding::encode(content));
    }
    for (index, title) in filters
        .titles
        .iter()
        .filter(|t| !t.trim().is_empty())
        .enumerate()
    {
        let _ = write!(
            url,
            "&termtype_{index}=title&termval_{index}={}",
            urlencoding::encode(title.trim())
        );
    }
    url
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn sample_links() -> CandidateLinks {
        CandidateLinks {
            partner_no_waitlist: strings(&["https://aa/slow/0"]),
            partner_waitlist: strings(&["https://aa/slow/1"]),
            libgen: strings(&["https://libgen.gl/ads.php?md5=x"]),
            zlib: strings(&["https://z-lib.gs/md5/x", "https://aa/slow/0"]),
        }
    }

    #[test]
    fn test_rank_candidates_full_order() {
        let ranked = rank_candidates(
            Some("https://aa/fast".to_string()),
            &sample_links(),
            &strings(&["https://welib.org/slow_download/x/0/0"]),
            false,
            true,
        );
        assert_eq!(
            ranked,
            strings(&[
                "https://aa/fast",
                "https://aa/slow/0",
                "https://libgen.gl/ads.php?md5=x",
                "https://welib.org/slow_download/x/0/0",
                "https://aa/slow/1",
                "https://z-lib.gs/md5/x",
            ])
        );
    }

    #[test]
    fn test_rank_candidates_prioritized_welib_goes_second() {
        let ranked = rank_candidates(
            None,
            &sample_links(),
            &strings(&["https://welib.org/slow_download/x/0/0"]),
            true,
            true,
        );
        assert_eq!(ranked[0], "https://welib.org/slow_download/x/0/0");
        assert_eq!(ranked[1], "https://aa/slow/0");
    }

    #[test]
    fn test_rank_candidates_without_bypasser_skips_partner_links() {
        let ranked = rank_candidates(None, &sample_links(), &[], false, false);
        assert_eq!(
            ranked,
            strings(&[
                "https://libgen.gl/ads.php?md5=x",
                "https://z-lib.gs/md5/x",
                "https://aa/slow/0",
            ])
        );
    }

    #[test]
    fn test_rank_candidates_is_stable() {
        let links = sample_links();
        let a = rank_candidates(None, &links, &[], false, true);
        let b = rank_candidates(None, &links, &[], false, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_build_search_url_folds_filters() {
        let filters = SearchFilters {
            isbn: strings(&["9780441013593"]),
            authors: strings(&["Herbert"]),
            titles: strings(&["Dune"]),
            sort: Some("newest".to_string()),
            content: strings(&["book_fiction"]),
            ..SearchFilters::default()
        };
        let url = build_search_url(
            "https://annas-archive.org/",
            "sci-fi",
            &filters,
            &strings(&["epub", "mobi"]),
            &strings(&["en"]),
        );
        assert!(url.starts_with("https://annas-archive.org/search?index=&page=1&display=table"));
        assert!(url.contains("&ext=epub&ext=mobi"));
        assert!(url.contains(
            "&q=%28%27isbn13%3A9780441013593%27%20%7C%7C%20%27isbn10%3A9780441013593%27%29%20author%3AHerbert%20sci-fi"
        ));
        assert!(url.contains("&lang=en"));
        assert!(url.contains("&sort=newest"));
        assert!(url.contains("&content=book_fiction"));
        assert!(url.ends_with("&termtype_0=title&termval_0=Dune"));
    }

    #[test]
    fn test_build_search_url_language_all_disables_filter() {
        let filters = SearchFilters {
            lang: strings(&["all"]),
            format: strings(&["PDF"]),
            ..SearchFilters::default()
        };
        let url = build_search_url("https://x", "q", &filters, &strings(&["epub"]), &strings(&["en"]));
        assert!(!url.contains("&lang="));
        assert!(url.contains("&ext=pdf"));
        assert!(!url.contains("&ext=epub"));
    }
}
