//! Reduces raw URLs to path templates.
//!
//! Every path segment is replaced by a placeholder when it looks like an
//! identifier, using the first rule that matches:
//!
//! | segment                                   | becomes  |
//! |-------------------------------------------|----------|
//! | `^[0-9]+$`                                | `{num}`  |
//! | 32 hex chars, or 8-4-4-4-12 hex with `-`  | `{id}`   |
//! | anything else                             | literal  |
//!
//! `https://x.com.br/item/6186/detalhes?p=1` therefore becomes
//! `/item/{num}/detalhes`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use url::Url;

pub const NUM_PLACEHOLDER: &str = "{num}";
pub const ID_PLACEHOLDER: &str = "{id}";
pub const MAX_SAMPLE_URLS: usize = 3;

static NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("numeric segment pattern"));

static HEX_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[0-9a-fA-F]{32}|[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})$",
    )
    .expect("identifier segment pattern")
});

/// Occurrence data for one template within a single site's URL list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStats {
    pub count: usize,
    /// First distinct source URLs seen for this template, in input order.
    pub sample_urls: Vec<String>,
    /// Index in the input list of the first URL that produced this template.
    pub first_seen: usize,
}

pub type TemplateTable = BTreeMap<String, TemplateStats>;

/// Path component of a URL with scheme, host, query and fragment removed.
///
/// Strings that do not parse as absolute URLs are treated as bare paths.
pub fn url_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let path = match Url::parse(trimmed) {
        Ok(url) => url.path().to_string(),
        Err(_) => {
            let cut = trimmed.find(['?', '#']).unwrap_or(trimmed.len());
            trimmed[..cut].to_string()
        }
    };
    path.chars().filter(|c| !c.is_ascii_control()).collect()
}

/// Placeholder for a single segment, or the segment itself.
pub fn normalize_segment(segment: &str) -> &str {
    if NUMERIC.is_match(segment) {
        NUM_PLACEHOLDER
    } else if HEX_ID.is_match(segment) {
        ID_PLACEHOLDER
    } else {
        segment
    }
}

/// Template string for one URL. Empty segments are dropped; the root is `/`.
pub fn template_for(raw: &str) -> String {
    let path = url_path(raw);
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(normalize_segment)
        .collect();

    format!("/{}", segments.join("/"))
}

/// Build the template frequency table for one site's URL list.
pub fn extract<S: AsRef<str>>(urls: &[S]) -> TemplateTable {
    let mut table: TemplateTable = BTreeMap::new();

    for (index, raw) in urls.iter().enumerate() {
        let raw = raw.as_ref();
        let template = template_for(raw);

        let stats = table.entry(template).or_insert_with(|| TemplateStats {
            count: 0,
            sample_urls: Vec::new(),
            first_seen: index,
        });

        stats.count += 1;
        if stats.sample_urls.len() < MAX_SAMPLE_URLS && !stats.sample_urls.iter().any(|u| u == raw)
        {
            stats.sample_urls.push(raw.to_string());
        }
    }

    table
}

/// Split a template into its path segments.
pub fn segments(template: &str) -> Vec<&str> {
    template.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn is_placeholder(segment: &str) -> bool {
    segment == NUM_PLACEHOLDER || segment == ID_PLACEHOLDER
}

/// Literal runs of a template between placeholders, e.g.
/// `/leilao/{num}/lotes` gives `["/leilao/", "/lotes"]`.
pub fn literal_fragments(template: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();

    for segment in segments(template) {
        if is_placeholder(segment) {
            current.push('/');
            if current.len() > 1 {
                fragments.push(std::mem::take(&mut current));
            }
            current.clear();
        } else {
            current.push('/');
            current.push_str(segment);
        }
    }

    if current.len() > 1 {
        fragments.push(current);
    }
    fragments
}
