//! Clusters eligible sites by the shape of their dominant listing and detail
//! templates.
//!
//! For every eligible site of a run one listing template and one detail
//! template are chosen (highest count, then earliest first-seen, then
//! lexical order). The pair is hashed into a signature and sites sharing a
//! signature become members of the same
//! [`TemplateGroup`](crate::model::TemplateGroup). The whole pass
//! runs inside one transaction.

use crate::data::{self, Database, current_timestamp};
use crate::error::{LotmapError, Result};
use crate::model::{GroupStatus, GroupingStatus, RunStatus, SiteTemplate};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Separates the two templates inside the hashed signature input.
pub const SIGNATURE_SEPARATOR: char = '\n';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingSummary {
    pub run_id: String,
    pub eligible_sites: usize,
    pub ineligible_sites: usize,
    pub ignored_sites: usize,
    pub groups_created: usize,
    pub groups_reformed: usize,
    pub members_added: usize,
    pub members_moved: usize,
    pub members_unchanged: usize,
    pub group_ids: Vec<i64>,
}

/// Lowercase hex SHA-256 of `listing + "\n" + detail`.
pub fn signature_hash(listing_template: &str, detail_template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(listing_template.as_bytes());
    hasher.update([SIGNATURE_SEPARATOR as u8]);
    hasher.update(detail_template.as_bytes());
    hex::encode(hasher.finalize())
}

/// Dominant template among `candidates`.
pub fn choose_template<'a, I>(candidates: I) -> Option<&'a SiteTemplate>
where
    I: IntoIterator<Item = &'a SiteTemplate>,
{
    candidates.into_iter().min_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.template.cmp(&b.template))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChosenPair {
    listing: String,
    detail: String,
}

fn choose_pair(
    templates: &[SiteTemplate],
    listing: &[String],
    detail: &[String],
) -> Option<ChosenPair> {
    let listing: BTreeSet<&str> = listing.iter().map(String::as_str).collect();
    let detail: BTreeSet<&str> = detail.iter().map(String::as_str).collect();

    let chosen_listing = choose_template(
        templates
            .iter()
            .filter(|t| listing.contains(t.template.as_str())),
    )?;
    let chosen_detail = choose_template(
        templates
            .iter()
            .filter(|t| detail.contains(t.template.as_str())),
    )?;

    Some(ChosenPair {
        listing: chosen_listing.template.clone(),
        detail: chosen_detail.template.clone(),
    })
}

fn current_membership(conn: &Connection, site_id: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT group_id FROM template_group_members WHERE site_id = ?1",
            params![site_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Group every eligible site of `run_id`. Re-running for the same run is a no-op.
pub fn run_grouping(db: &mut Database, run_id: &str) -> Result<GroupingSummary> {
    let run = db
        .get_run(run_id)?
        .ok_or_else(|| LotmapError::NotFound(format!("run {}", run_id)))?;
    if run.status == RunStatus::Running {
        return Err(LotmapError::InvalidState(format!(
            "run {} is still mapping",
            run_id
        )));
    }

    let mut summary = GroupingSummary {
        run_id: run_id.to_string(),
        ..Default::default()
    };

    // Read phase: pick each eligible site's pair.
    let mut clusters: BTreeMap<String, (ChosenPair, Vec<i64>)> = BTreeMap::new();
    for signature in db.get_run_signatures(run_id)? {
        if !signature.eligible {
            summary.ineligible_sites += 1;
            continue;
        }

        let templates = db.get_site_templates(run_id, signature.site_id)?;
        let Some(pair) = choose_pair(
            &templates,
            &signature.listing_templates,
            &signature.detail_templates,
        ) else {
            summary.ineligible_sites += 1;
            continue;
        };

        let hash = signature_hash(&pair.listing, &pair.detail);
        debug!(
            "Site {} -> {} | {} ({})",
            signature.site_id, pair.listing, pair.detail, &hash[..12]
        );
        clusters
            .entry(hash)
            .or_insert_with(|| (pair, Vec::new()))
            .1
            .push(signature.site_id);
    }

    // Write phase: one transaction for the whole pass.
    let tx = db.transaction()?;
    let now = current_timestamp();
    let mut vacated: BTreeSet<i64> = BTreeSet::new();

    for (hash, (pair, site_ids)) in &clusters {
        let mut joining = Vec::with_capacity(site_ids.len());
        for site_id in site_ids {
            let site = data::query_site(&tx, *site_id)?
                .ok_or_else(|| LotmapError::NotFound(format!("site {}", site_id)))?;
            if site.grouping_status == GroupingStatus::Ignored {
                summary.ignored_sites += 1;
            } else {
                joining.push(*site_id);
            }
        }
        if joining.is_empty() {
            continue;
        }
        summary.eligible_sites += joining.len();

        let group_id = match data::query_group_by_hash(&tx, hash)? {
            Some(group) if group.status == GroupStatus::Rejected => {
                tx.execute(
                    "UPDATE template_groups SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![GroupStatus::Candidate, now, group.id],
                )?;
                summary.groups_reformed += 1;
                info!("Re-forming rejected group {} as candidate", group.id);
                group.id
            }
            Some(group) => group.id,
            None => {
                let id: i64 = tx.query_row(
                    "INSERT INTO template_groups
                        (signature_hash, listing_template, detail_template, status, size, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
                     RETURNING id",
                    params![hash, &pair.listing, &pair.detail, GroupStatus::Candidate, now],
                    |row| row.get(0),
                )?;
                summary.groups_created += 1;
                info!(
                    "Created candidate group {} for {} | {}",
                    id, pair.listing, pair.detail
                );
                id
            }
        };

        for site_id in joining {
            match current_membership(&tx, site_id)? {
                Some(existing) if existing == group_id => {
                    summary.members_unchanged += 1;
                    continue;
                }
                Some(previous) => {
                    tx.execute(
                        "DELETE FROM template_group_members WHERE group_id = ?1 AND site_id = ?2",
                        params![previous, site_id],
                    )?;
                    vacated.insert(previous);
                    summary.members_moved += 1;
                    debug!("Site {} leaves group {}", site_id, previous);
                }
                None => {}
            }

            tx.execute(
                "INSERT INTO template_group_members (group_id, site_id, run_id, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group_id, site_id, run_id, now],
            )?;
            tx.execute(
                "UPDATE sites SET group_id = ?1, grouping_status = ?2 WHERE id = ?3",
                params![group_id, GroupingStatus::CandidateGrouped, site_id],
            )?;
            summary.members_added += 1;
        }

        data::refresh_group_stats(&tx, group_id)?;
        summary.group_ids.push(group_id);
    }

    for group_id in vacated {
        data::refresh_group_stats(&tx, group_id)?;
    }

    tx.commit()?;

    info!(
        "Grouping for run {}: {} eligible, {} ineligible, {} groups ({} new, {} re-formed)",
        run_id,
        summary.eligible_sites,
        summary.ineligible_sites,
        summary.group_ids.len(),
        summary.groups_created,
        summary.groups_reformed
    );
    Ok(summary)
}

/// Exclude a site from grouping, dropping any membership it holds.
pub fn ignore_site(db: &mut Database, site_id: i64) -> Result<()> {
    let tx = db.transaction()?;
    if data::query_site(&tx, site_id)?.is_none() {
        return Err(LotmapError::NotFound(format!("site {}", site_id)));
    }

    let previous = current_membership(&tx, site_id)?;
    if let Some(group_id) = previous {
        tx.execute(
            "DELETE FROM template_group_members WHERE group_id = ?1 AND site_id = ?2",
            params![group_id, site_id],
        )?;
    }

    tx.execute(
        "UPDATE sites SET grouping_status = ?1, group_id = NULL WHERE id = ?2",
        params![GroupingStatus::Ignored, site_id],
    )?;

    if let Some(group_id) = previous {
        data::refresh_group_stats(&tx, group_id)?;
    }
    tx.commit()?;

    info!("Site {} ignored", site_id);
    Ok(())
}

/// Return an ignored site to `ungrouped` so the next grouping pass sees it.
pub fn unignore_site(db: &Database, site_id: i64) -> Result<()> {
    let changed = db.get_connection().execute(
        "UPDATE sites SET grouping_status = ?1 WHERE id = ?2 AND grouping_status = ?3",
        params![GroupingStatus::Ungrouped, site_id, GroupingStatus::Ignored],
    )?;
    if changed == 0 {
        return Err(LotmapError::InvalidState(format!(
            "site {} is not ignored",
            site_id
        )));
    }
    Ok(())
}
