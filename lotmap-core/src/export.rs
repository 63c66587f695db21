// Crawler configuration export from validated groups

use crate::data::Database;
use crate::error::{LotmapError, Result};
use crate::model::{GroupStatus, TemplateGroup};
use crate::sites::{base_url, detect_platform};
use crate::template::literal_fragments;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    pub generated_at: String,
    pub total_groups: usize,
    pub total_sites: usize,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub group_id: i64,
    pub status: GroupStatus,
    pub signature_hash: String,
    pub listing_template_pattern: String,
    pub detail_template_pattern: String,
    pub member_sites: Vec<MemberConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberConfig {
    pub name: String,
    pub domain: String,
    pub base_url: String,
    pub platform: String,
    pub sample_crawl_urls: Vec<String>,
    pub include_path_fragments: Vec<String>,
}

/// Literal parts of both chosen templates, listing first, without repeats.
pub fn include_path_fragments(listing_template: &str, detail_template: &str) -> Vec<String> {
    let mut fragments: Vec<String> = Vec::new();
    for fragment in literal_fragments(listing_template)
        .into_iter()
        .chain(literal_fragments(detail_template))
    {
        if !fragments.contains(&fragment) {
            fragments.push(fragment);
        }
    }
    fragments
}

fn group_config(db: &Database, group: &TemplateGroup) -> Result<GroupConfig> {
    let fragments = include_path_fragments(&group.listing_template, &group.detail_template);

    let mut member_sites = Vec::new();
    for site in db.get_member_sites(group.id)? {
        let mut sample_crawl_urls = db
            .latest_site_template(site.id, &group.listing_template)?
            .map(|t| t.sample_urls)
            .unwrap_or_default();
        if sample_crawl_urls.is_empty() {
            sample_crawl_urls.push(base_url(&site.domain));
        }

        member_sites.push(MemberConfig {
            name: site.name,
            base_url: base_url(&site.domain),
            platform: detect_platform(&site.domain).to_string(),
            domain: site.domain,
            sample_crawl_urls,
            include_path_fragments: fragments.clone(),
        });
    }

    Ok(GroupConfig {
        group_id: group.id,
        status: group.status,
        signature_hash: group.signature_hash.clone(),
        listing_template_pattern: group.listing_template.clone(),
        detail_template_pattern: group.detail_template.clone(),
        member_sites,
    })
}

/// Collect the crawler configuration for validated groups, and candidate
/// groups too when `include_candidates` is set. Groups whose members all
/// moved elsewhere are left out.
pub fn gather_export_data(db: &Database, include_candidates: bool) -> Result<CrawlerConfig> {
    let mut groups = Vec::new();
    for group in db.list_groups(None)? {
        let wanted = match group.status {
            GroupStatus::Validated => true,
            GroupStatus::Candidate => include_candidates,
            GroupStatus::Rejected => false,
        };
        if wanted && group.size > 0 {
            groups.push(group_config(db, &group)?);
        }
    }

    Ok(CrawlerConfig {
        generated_at: chrono::Utc::now().to_rfc3339(),
        total_groups: groups.len(),
        total_sites: groups.iter().map(|g| g.member_sites.len()).sum(),
        groups,
    })
}

pub fn generate_json_export(config: &CrawlerConfig) -> Result<String> {
    Ok(serde_json::to_string_pretty(config)?)
}

/// One row per member site; list cells are `|`-joined.
pub fn generate_csv_export(config: &CrawlerConfig) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "group_id",
        "listing_template",
        "detail_template",
        "name",
        "domain",
        "base_url",
        "platform",
        "crawl_urls",
        "include_paths",
    ])?;

    for group in &config.groups {
        let group_id = group.group_id.to_string();
        for member in &group.member_sites {
            writer.write_record([
                group_id.as_str(),
                group.listing_template_pattern.as_str(),
                group.detail_template_pattern.as_str(),
                member.name.as_str(),
                member.domain.as_str(),
                member.base_url.as_str(),
                member.platform.as_str(),
                member.sample_crawl_urls.join("|").as_str(),
                member.include_path_fragments.join("|").as_str(),
            ])?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| LotmapError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| LotmapError::InvalidState(e.to_string()))
}

pub fn render_export(config: &CrawlerConfig, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => generate_json_export(config),
        ExportFormat::Csv => generate_csv_export(config),
    }
}

/// Write an export to disk, creating parent directories as needed.
pub fn save_export(content: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
