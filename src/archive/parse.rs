//! HTML extraction for Anna's-Archive-style pages.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use super::BookSummary;
use crate::download::parse_size_hint;

const KNOWN_FORMATS: &[&str] = &[
    "epub", "mobi", "azw3", "azw", "fb2", "djvu", "cbz", "cbr", "pdf", "txt", "rtf", "doc",
    "docx", "lit",
];

const RELEVANT_INFO_PREFIXES: &[&str] = &[
    "isbn-",
    "alternative",
    "asin",
    "goodreads",
    "language",
    "year",
];

/// Candidate download pages found on a details page, by category.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct CandidateLinks {
    pub partner_no_waitlist: Vec<String>,
    pub partner_waitlist: Vec<String>,
    pub libgen: Vec<String>,
    pub zlib: Vec<String>,
}

/// Fields extracted from a details page.
#[derive(Debug, Default, Clone)]
pub(crate) struct ParsedDetails {
    pub title: String,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub format: Option<String>,
    pub size: Option<String>,
    pub preview: Option<String>,
    pub info: BTreeMap<String, Vec<String>>,
    pub links: CandidateLinks,
}

/// What a candidate download page offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkOutcome {
    /// A direct link, possibly relative.
    Direct(String),
    /// The source asks to wait this many seconds and reload.
    Countdown(u64),
    /// Nothing usable on the page.
    Missing,
}

/// Kind of candidate page, decided from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    ZLibrary,
    SlowDownload,
    Mirror,
}

impl PageKind {
    pub(crate) fn of(link: &str) -> Self {
        let host = Url::parse(link)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        if host.starts_with("z-lib.") || host.contains(".z-lib.") {
            Self::ZLibrary
        } else if link.contains("/slow_download/") {
            Self::SlowDownload
        } else {
            Self::Mirror
        }
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document.select(&sel).map(text_of).find(|t| !t.is_empty())
}

/// Resolves `href` against `base`, returning an empty string when impossible.
pub(crate) fn absolute_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(String::from)
        .unwrap_or_default()
}

/// Parses the rows of a search results table.
///
/// Rows without an id link or title are skipped.
pub(crate) fn parse_search_results(html: &str) -> Vec<BookSummary> {
    let document = Html::parse_document(html);
    let (Some(row_sel), Some(cell_sel), Some(link_sel), Some(span_sel), Some(img_sel)) = (
        selector("table tr"),
        selector("td"),
        selector("a[href]"),
        selector("span"),
        selector("img"),
    ) else {
        return Vec::new();
    };

    let cell_text = |cell: Option<&ElementRef<'_>>| -> Option<String> {
        let cell = cell?;
        let text = cell.select(&span_sel).next().map_or_else(|| text_of(*cell), text_of);
        non_empty(text)
    };

    let mut books = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.len() < 11 {
            continue;
        }
        let Some(id) = row
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| href.trim_end_matches('/').rsplit('/').next())
            .map(ToString::to_string)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        let Some(title) = cell_text(cells.get(1)) else {
            debug!(book_id = %id, "skipping search row without title");
            continue;
        };
        books.push(BookSummary {
            id,
            title,
            author: cell_text(cells.get(2)),
            publisher: cell_text(cells.get(3)),
            year: cell_text(cells.get(4)),
            language: cell_text(cells.get(7)),
            format: cell_text(cells.get(9)).map(|f| f.to_lowercase()),
            size: cell_text(cells.get(10)),
            preview: cells[0]
                .select(&img_sel)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(ToString::to_string),
        });
    }
    books
}

/// Parses a book details page found at `page_url`.
///
/// Returns `None` when the page has no recognizable title.
pub(crate) fn parse_details(html: &str, page_url: &str) -> Option<ParsedDetails> {
    let document = Html::parse_document(html);

    let title = first_text(&document, "div.main-inner div.text-3xl")
        .or_else(|| first_text(&document, "main h1"))?;
    let author = first_text(&document, "div.main-inner div.italic");
    let publisher = first_text(&document, "div.main-inner div.text-md");
    let preview = selector("div.main-inner img").and_then(|sel| {
        document
            .select(&sel)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(ToString::to_string)
    });
    let (format, size) = parse_meta_line(&document);

    Some(ParsedDetails {
        title,
        author,
        publisher,
        format,
        size,
        preview,
        info: parse_info(&document),
        links: parse_candidate_links(&document, page_url),
    })
}

/// Finds format and size in the ` · `-separated summary line.
fn parse_meta_line(document: &Html) -> (Option<String>, Option<String>) {
    let Some(div_sel) = selector("div.main-inner div") else {
        return (None, None);
    };
    for div in document.select(&div_sel) {
        let text = text_of(div);
        if !text.contains(" · ") {
            continue;
        }
        let tokens: Vec<&str> = text.split(" · ").map(str::trim).collect();
        let format = tokens
            .iter()
            .map(|t| t.to_lowercase())
            .find(|t| KNOWN_FORMATS.contains(&t.as_str()));
        let size = tokens
            .iter()
            .find(|t| parse_size_hint(t).is_some())
            .map(|t| t.to_lowercase());
        if format.is_some() || size.is_some() {
            return (format, size);
        }
    }
    (None, None)
}

/// Collects identifier pairs from the codes tabs, keeping the useful ones.
fn parse_info(document: &Html) -> BTreeMap<String, Vec<String>> {
    let mut info: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let (Some(tab_sel), Some(span_sel)) = (selector(".js-md5-codes-tabs-tab"), selector("span"))
    else {
        return info;
    };
    for tab in document.select(&tab_sel) {
        let spans: Vec<String> = tab.select(&span_sel).map(text_of).collect();
        let [key, value, ..] = spans.as_slice() else {
            continue;
        };
        let lowered = key.to_lowercase();
        if key.is_empty()
            || value.is_empty()
            || lowered.contains("filename")
            || !RELEVANT_INFO_PREFIXES.iter().any(|p| lowered.starts_with(p))
        {
            continue;
        }
        let values = info.entry(key.clone()).or_default();
        if !values.contains(value) {
            values.push(value.clone());
        }
    }
    info
}

fn parse_candidate_links(document: &Html, page_url: &str) -> CandidateLinks {
    let mut links = CandidateLinks::default();
    let Some(anchor_sel) = selector("a[href]") else {
        return links;
    };
    for anchor in document.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let label = text_of(anchor).to_lowercase();
        let context = anchor
            .parent()
            .and_then(ElementRef::wrap)
            .map(text_of)
            .unwrap_or_default();
        let context_lower = context.to_lowercase();

        if label.starts_with("slow partner server") {
            let url = absolute_url(page_url, href);
            if context_lower.contains("no waitlist") {
                push_unique(&mut links.partner_no_waitlist, url);
            } else {
                push_unique(&mut links.partner_waitlist, url);
            }
        } else if context.contains("“GET” at the top") || context.contains("\"GET\" at the top") {
            let url = absolute_url(page_url, &rewrite_libgen_host(href));
            push_unique(&mut links.libgen, url);
        } else if label.starts_with("z-lib") && !href.contains(".onion/") {
            push_unique(&mut links.zlib, absolute_url(page_url, href));
        }
    }
    links
}

/// Points retired libgen hosts at the mirror that still serves files.
pub(crate) fn rewrite_libgen_host(href: &str) -> String {
    for retired in ["libgen.lc", "libgen.is", "libgen.bz", "libgen.st"] {
        if let Some(index) = href.find(retired) {
            let mut rewritten = String::with_capacity(href.len());
            rewritten.push_str(&href[..index]);
            rewritten.push_str("libgen.gl");
            rewritten.push_str(&href[index + retired.len()..]);
            return rewritten;
        }
    }
    href.to_string()
}

fn push_unique(target: &mut Vec<String>, url: String) {
    if !url.is_empty() && !target.contains(&url) {
        target.push(url);
    }
}

/// Collects `/slow_download/` links from a WeLib details page.
pub(crate) fn parse_slow_download_links(html: &str, page_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();
    let Some(anchor_sel) = selector("a[href]") else {
        return links;
    };
    for href in document
        .select(&anchor_sel)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains("/slow_download/"))
    {
        push_unique(&mut links, absolute_url(page_url, href));
    }
    links
}

/// Reads the direct link (or the wait request) from a candidate download page.
pub(crate) fn extract_direct_link(html: &str, kind: PageKind) -> LinkOutcome {
    let document = Html::parse_document(html);
    let Some(anchor_sel) = selector("a[href]") else {
        return LinkOutcome::Missing;
    };
    let href_where = |predicate: &dyn Fn(ElementRef<'_>) -> bool| {
        document
            .select(&anchor_sel)
            .find(|a| predicate(*a))
            .and_then(|a| a.value().attr("href"))
            .map(ToString::to_string)
    };

    let found = match kind {
        PageKind::ZLibrary => href_where(&|a| {
            a.value()
                .classes()
                .any(|class| class == "addDownloadedBook")
        }),
        PageKind::SlowDownload => {
            let link = href_where(&|a| text_of(a).contains("Download now"));
            if link.is_none()
                && let Some(seconds) = countdown_seconds(&document)
            {
                return LinkOutcome::Countdown(seconds);
            }
            link
        }
        PageKind::Mirror => href_where(&|a| text_of(a) == "GET"),
    };
    found.map_or(LinkOutcome::Missing, LinkOutcome::Direct)
}

fn countdown_seconds(document: &Html) -> Option<u64> {
    let sel = selector("span.js-partner-countdown")?;
    document
        .select(&sel)
        .next()
        .and_then(|span| text_of(span).parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SEARCH_PAGE: &str = r#"
        <table><tbody>
          <tr>
            <td><a href="/md5/aaa111"><img src="https://img/aaa.jpg"></a></td>
            <td><span>Dune</span></td><td><span>Frank Herbert</span></td>
            <td><span>Ace</span></td><td><span>1965</span></td>
            <td></td><td></td><td><span>English</span></td><td></td>
            <td><span>EPUB</span></td><td><span>1.2MB</span></td>
          </tr>
          <tr><td>malformed</td></tr>
        </tbody></table>"#;

    const DETAILS_PAGE: &str = r#"
        <html><body><main><div class="main-inner">
          <img src="https://img/cover.jpg">
          <div class="text-3xl">Dune</div>
          <div class="text-md">Ace Books</div>
          <div class="italic">Frank Herbert</div>
          <div class="text-sm">English [en] · EPUB · 1.2MB · 1965 · Book (fiction)</div>
          <a class="js-md5-codes-tabs-tab"><span>ISBN-13</span><span>9780441013593</span></a>
          <a class="js-md5-codes-tabs-tab"><span>Filename</span><span>dune.epub</span></a>
          <ul>
            <li><a href="/slow_download/aaa111/0/0">Slow Partner Server #1</a> (no waitlist, but can be very slow)</li>
            <li><a href="/slow_download/aaa111/0/1">Slow Partner Server #2</a> (slightly faster but with waitlist)</li>
            <li><a href="https://libgen.is/ads.php?md5=aaa111">Libgen.li</a> (also click “GET” at the top)</li>
            <li><a href="https://z-lib.gs/md5/aaa111">Z-Library</a></li>
            <li><a href="http://zlib.onion/md5/aaa111">Z-Library TOR</a></li>
          </ul>
        </div></main></body></html>"#;

    #[test]
    fn test_parse_search_results_reads_columns() {
        let books = parse_search_results(SEARCH_PAGE);
        assert_eq!(books.len(), 1);
        let book = &books[0];
        assert_eq!(book.id, "aaa111");
        assert_eq!(book.title, "Dune");
        assert_eq!(book.author.as_deref(), Some("Frank Herbert"));
        assert_eq!(book.format.as_deref(), Some("epub"));
        assert_eq!(book.size.as_deref(), Some("1.2MB"));
        assert_eq!(book.preview.as_deref(), Some("https://img/aaa.jpg"));
    }

    #[test]
    fn test_parse_details_fields() {
        let details = parse_details(DETAILS_PAGE, "https://annas-archive.org/md5/aaa111").unwrap();
        assert_eq!(details.title, "Dune");
        assert_eq!(details.author.as_deref(), Some("Frank Herbert"));
        assert_eq!(details.format.as_deref(), Some("epub"));
        assert_eq!(details.size.as_deref(), Some("1.2mb"));
        assert_eq!(
            details.info.get("ISBN-13"),
            Some(&vec!["9780441013593".to_string()])
        );
        assert!(!details.info.contains_key("Filename"));
    }

    #[test]
    fn test_parse_details_categorizes_links() {
        let details = parse_details(DETAILS_PAGE, "https://annas-archive.org/md5/aaa111").unwrap();
        let links = details.links;
        assert_eq!(
            links.partner_no_waitlist,
            vec!["https://annas-archive.org/slow_download/aaa111/0/0".to_string()]
        );
        assert_eq!(
            links.partner_waitlist,
            vec!["https://annas-archive.org/slow_download/aaa111/0/1".to_string()]
        );
        assert_eq!(
            links.libgen,
            vec!["https://libgen.gl/ads.php?md5=aaa111".to_string()]
        );
        assert_eq!(links.zlib, vec!["https://z-lib.gs/md5/aaa111".to_string()]);
    }

    #[test]
    fn test_parse_details_without_title_is_none() {
        assert!(parse_details("<html><body>nothing</body></html>", "https://x").is_none());
    }

    #[test]
    fn test_extract_direct_link_variants() {
        let zlib = r#"<a class="btn addDownloadedBook" href="/dl/123">Download</a>"#;
        assert_eq!(
            extract_direct_link(zlib, PageKind::ZLibrary),
            LinkOutcome::Direct("/dl/123".to_string())
        );

        let slow = r#"<a href="https://files.example/abc.epub">📚 Download now</a>"#;
        assert_eq!(
            extract_direct_link(slow, PageKind::SlowDownload),
            LinkOutcome::Direct("https://files.example/abc.epub".to_string())
        );

        let waiting = r#"<p>Please wait <span class="js-partner-countdown">12</span> seconds</p>"#;
        assert_eq!(
            extract_direct_link(waiting, PageKind::SlowDownload),
            LinkOutcome::Countdown(12)
        );

        let mirror = r#"<h2><a href="get.php?md5=abc&key=K">GET</a></h2>"#;
        assert_eq!(
            extract_direct_link(mirror, PageKind::Mirror),
            LinkOutcome::Direct("get.php?md5=abc&key=K".to_string())
        );

        assert_eq!(
            extract_direct_link("<p>gone</p>", PageKind::Mirror),
            LinkOutcome::Missing
        );
    }

    #[test]
    fn test_page_kind_from_url() {
        assert_eq!(PageKind::of("https://z-lib.gs/md5/x"), PageKind::ZLibrary);
        assert_eq!(
            PageKind::of("https://annas-archive.org/slow_download/x/0/0"),
            PageKind::SlowDownload
        );
        assert_eq!(PageKind::of("https://libgen.gl/ads.php?md5=x"), PageKind::Mirror);
    }

    #[test]
    fn test_absolute_url() {
        assert_eq!(
            absolute_url("https://libgen.gl/ads.php?md5=x", "get.php?md5=x"),
            "https://libgen.gl/get.php?md5=x"
        );
        assert_eq!(absolute_url("https://a.org/x", "https://b.org/y"), "https://b.org/y");
        assert_eq!(absolute_url("https://a.org/x", ""), "");
    }

    #[test]
    fn test_rewrite_libgen_host() {
        assert_eq!(
            rewrite_libgen_host("https://libgen.lc/ads.php?md5=1"),
            "https://libgen.gl/ads.php?md5=1"
        );
        assert_eq!(
            rewrite_libgen_host("https://libgen.li/ads.php?md5=1"),
            "https://libgen.li/ads.php?md5=1"
        );
    }

    #[test]
    fn test_parse_slow_download_links_dedups() {
        let html = r#"<a href="/slow_download/x/0/0">a</a><a href="/slow_download/x/0/0">b</a><a href="/md5/x">c</a>"#;
        assert_eq!(
            parse_slow_download_links(html, "https://welib.org/md5/x"),
            vec!["https://welib.org/slow_download/x/0/0".to_string()]
        );
    }
}
