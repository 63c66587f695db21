// Site list import and domain normalization

use crate::data::Database;
use crate::error::{LotmapError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Hosting platforms recognisable from the domain alone, checked in order.
const KNOWN_PLATFORMS: &[(&str, &str)] = &[
    ("lel.br", ".lel.br"),
    ("leilao.br", ".leilao.br"),
    ("superbid", "superbid"),
    ("bomvalor", "bomvalor"),
    ("zuk", "zuk"),
    ("copart", "copart"),
];

pub const CUSTOM_PLATFORM: &str = "custom";

/// One row of a site list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRecord {
    #[serde(rename = "nome", default)]
    pub name: String,
    #[serde(rename = "dominio", default)]
    pub domain: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub site_ids: Vec<i64>,
}

/// Canonical host for a domain as typed by a human: no scheme, no path, no
/// port, lower case, a doubled `www.www.` collapsed. `None` when nothing
/// host-like remains.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut host = raw.trim().to_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = host.strip_prefix(scheme) {
            host = rest.to_string();
        }
    }
    if let Some(cut) = host.find(['/', '?', '#']) {
        host.truncate(cut);
    }
    if let Some(cut) = host.find(':') {
        host.truncate(cut);
    }
    while host.starts_with("www.www.") {
        host = host["www.".len()..].to_string();
    }
    let host = host.trim_end_matches('.').to_string();

    let valid = host.contains('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    valid.then_some(host)
}

pub fn detect_platform(domain: &str) -> &'static str {
    let domain = domain.to_lowercase();
    KNOWN_PLATFORMS
        .iter()
        .find(|(_, pattern)| domain.contains(pattern))
        .map(|(platform, _)| *platform)
        .unwrap_or(CUSTOM_PLATFORM)
}

/// Base URL a crawler starts from.
pub fn base_url(domain: &str) -> String {
    format!("https://{}", domain)
}

/// Read a `nome,dominio` CSV. Rows without a domain are dropped.
pub fn read_sites_csv<R: Read>(reader: R) -> Result<Vec<SiteRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    if !headers.iter().any(|h| h == "dominio") {
        return Err(LotmapError::Config(
            "site list must have a 'dominio' column".to_string(),
        ));
    }

    let mut records = Vec::new();
    for row in csv_reader.deserialize::<SiteRecord>() {
        let record = row?;
        if !record.domain.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

/// One domain per line; blank lines and `#` comments are ignored.
pub fn read_domain_list(content: &str) -> Vec<SiteRecord> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| SiteRecord {
            name: String::new(),
            domain: line.to_string(),
        })
        .collect()
}

/// Load a site list, choosing the format from the file extension.
pub fn load_sites(path: &Path) -> Result<Vec<SiteRecord>> {
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

    if is_csv {
        read_sites_csv(fs::File::open(path)?)
    } else {
        Ok(read_domain_list(&fs::read_to_string(path)?))
    }
}

/// Upsert every record by canonical domain.
pub fn import_sites(db: &Database, records: &[SiteRecord]) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for record in records {
        let Some(domain) = normalize_domain(&record.domain) else {
            warn!("Skipping invalid domain '{}'", record.domain);
            summary.skipped += 1;
            continue;
        };

        let name = if record.name.trim().is_empty() {
            domain.clone()
        } else {
            record.name.trim().to_string()
        };

        let id = db.upsert_site(&domain, &name)?;
        debug!("Imported site {} ({})", id, domain);
        if !summary.site_ids.contains(&id) {
            summary.site_ids.push(id);
        }
        summary.imported += 1;
    }

    info!(
        "Imported {} sites ({} skipped)",
        summary.site_ids.len(),
        summary.skipped
    );
    Ok(summary)
}
