//! File naming for scratch and delivered book files.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static SIZE_HINT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(\d+(?:[.,]\d+)?)\s*(b|kb|kib|mb|mib|gb|gib|tb|tib)\s*$").ok()
});

/// Reduces a title to characters that are safe in a file name on every platform.
///
/// Keeps alphanumerics, spaces, dots and underscores, then trims trailing
/// whitespace. A result made only of dots and spaces collapses to an empty string.
#[must_use]
pub fn sanitize_filename(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_'))
        .collect();
    let kept = kept.trim_end().to_string();
    if kept.chars().all(|c| matches!(c, '.' | ' ')) {
        return String::new();
    }
    kept
}

/// Builds the delivered file name of a book.
///
/// Uses the sanitized title when `use_book_title` is set and the title
/// survives sanitization, otherwise the id.
#[must_use]
pub fn book_file_name(id: &str, title: &str, format: Option<&str>, use_book_title: bool) -> String {
    let stem = if use_book_title {
        let cleaned = sanitize_filename(title);
        if cleaned.is_empty() {
            sanitize_filename(id)
        } else {
            cleaned
        }
    } else {
        sanitize_filename(id)
    };
    let stem = if stem.is_empty() { "book".to_string() } else { stem };
    with_extension(stem, format)
}

/// Builds the scratch file name of an item.
#[must_use]
pub fn scratch_file_name(id: &str, format: Option<&str>) -> String {
    let stem = sanitize_filename(id);
    let stem = if stem.is_empty() { "book".to_string() } else { stem };
    with_extension(stem, format)
}

/// Qualifies a delivered file name with the item id: `Dune.epub` becomes
/// `Dune (abc123).epub`.
#[must_use]
pub fn disambiguated_file_name(file_name: &str, id: &str) -> String {
    let id = sanitize_filename(id);
    let id = if id.is_empty() { "book".to_string() } else { id };
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!("{stem} ({id}).{ext}")
        }
        _ => format!("{file_name} ({id})"),
    }
}

fn with_extension(stem: String, format: Option<&str>) -> String {
    match format.map(normalize_format).filter(|f| !f.is_empty()) {
        Some(format) => format!("{stem}.{format}"),
        None => stem,
    }
}

fn normalize_format(format: &str) -> String {
    format
        .trim()
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_lowercase()
}

/// Guesses a format from the last path segment of a URL.
#[must_use]
pub fn format_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = normalize_format(&last_segment[dot_index..]);
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext)
}

/// Parses a human size hint such as `1.5MB`, `850 kB` or `2,3 MB` into bytes.
///
/// Units are read as powers of 1024.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn parse_size_hint(hint: &str) -> Option<u64> {
    let captures = SIZE_HINT.as_ref()?.captures(hint)?;
    let number: f64 = captures.get(1)?.as_str().replace(',', ".").parse().ok()?;
    let exponent = match captures.get(2)?.as_str().to_lowercase().as_str() {
        "b" => 0,
        "kb" | "kib" => 1,
        "mb" | "mib" => 2,
        "gb" | "gib" => 3,
        _ => 4,
    };
    let bytes = number * 1024_f64.powi(exponent);
    (bytes.is_finite() && bytes >= 0.0).then(|| bytes.round() as u64)
}
