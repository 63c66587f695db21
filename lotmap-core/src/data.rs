use crate::classify::Classification;
use crate::error::{LotmapError, Result};
use crate::model::{
    AiValidation, DiscoveryStatus, GroupStatus, MapRun, RunStatus, Site, SiteMap,
    SiteSignature, SiteTemplate, TemplateGroup, TemplateGroupMember,
};
use crate::template::TemplateTable;
use lotmap_scanner::FetchError;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

/// Everything produced for one site by a successful fetch.
pub struct MappedSite<'a> {
    pub urls: &'a [String],
    pub attempts: u32,
    pub templates: &'a TemplateTable,
    pub classification: &'a Classification,
}

pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const SITE_COLUMNS: &str = "id, domain, name, discovery_status, grouping_status, group_id, \
     last_mapped_at, last_signature_at, created_at";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        domain: row.get(1)?,
        name: row.get(2)?,
        discovery_status: row.get(3)?,
        grouping_status: row.get(4)?,
        group_id: row.get(5)?,
        last_mapped_at: row.get(6)?,
        last_signature_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const RUN_COLUMNS: &str = "id, status, sites_total, sites_success, sites_failed, concurrency, \
     rate_limit, started_at, finished_at, error";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<MapRun> {
    Ok(MapRun {
        id: row.get(0)?,
        status: row.get(1)?,
        sites_total: row.get(2)?,
        sites_success: row.get(3)?,
        sites_failed: row.get(4)?,
        concurrency: row.get(5)?,
        rate_limit: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
        error: row.get(9)?,
    })
}

const TEMPLATE_COLUMNS: &str = "id, run_id, site_id, template, count, sample_urls, first_seen";

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<SiteTemplate> {
    Ok(SiteTemplate {
        id: row.get(0)?,
        run_id: row.get(1)?,
        site_id: row.get(2)?,
        template: row.get(3)?,
        count: row.get(4)?,
        sample_urls: json_column(row, 5)?,
        first_seen: row.get(6)?,
    })
}

const SIGNATURE_COLUMNS: &str =
    "id, run_id, site_id, listing_templates, detail_templates, eligible, reason, created_at";

fn signature_from_row(row: &Row<'_>) -> rusqlite::Result<SiteSignature> {
    Ok(SiteSignature {
        id: row.get(0)?,
        run_id: row.get(1)?,
        site_id: row.get(2)?,
        listing_templates: json_column(row, 3)?,
        detail_templates: json_column(row, 4)?,
        eligible: row.get(5)?,
        reason: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const GROUP_COLUMNS: &str = "id, signature_hash, listing_template, detail_template, status, size, \
     representative_site_id, created_at, updated_at";

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<TemplateGroup> {
    Ok(TemplateGroup {
        id: row.get(0)?,
        signature_hash: row.get(1)?,
        listing_template: row.get(2)?,
        detail_template: row.get(3)?,
        status: row.get(4)?,
        size: row.get(5)?,
        representative_site_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// Lookups shared with code running inside a transaction.

pub(crate) fn query_group(conn: &Connection, group_id: i64) -> Result<Option<TemplateGroup>> {
    let sql = format!("SELECT {} FROM template_groups WHERE id = ?1", GROUP_COLUMNS);
    Ok(conn
        .query_row(&sql, params![group_id], group_from_row)
        .optional()?)
}

pub(crate) fn query_group_by_hash(
    conn: &Connection,
    signature_hash: &str,
) -> Result<Option<TemplateGroup>> {
    let sql = format!(
        "SELECT {} FROM template_groups WHERE signature_hash = ?1",
        GROUP_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![signature_hash], group_from_row)
        .optional()?)
}

pub(crate) fn query_site(conn: &Connection, site_id: i64) -> Result<Option<Site>> {
    let sql = format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS);
    Ok(conn
        .query_row(&sql, params![site_id], site_from_row)
        .optional()?)
}

/// Raw URL count of the site's most recent successful map, 0 if never mapped.
pub(crate) fn query_latest_url_count(conn: &Connection, site_id: i64) -> Result<i64> {
    let count = conn
        .query_row(
            "SELECT url_count FROM site_maps
             WHERE site_id = ?1 AND error_kind IS NULL
             ORDER BY fetched_at DESC, id DESC LIMIT 1",
            params![site_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

/// Recompute `size` and `representative_site_id` from the current membership.
pub(crate) fn refresh_group_stats(conn: &Connection, group_id: i64) -> Result<()> {
    let mut stmt = conn.prepare("SELECT site_id FROM template_group_members WHERE group_id = ?1")?;
    let members = stmt
        .query_map(params![group_id], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut representative: Option<(i64, i64)> = None;
    for site_id in &members {
        let urls = query_latest_url_count(conn, *site_id)?;
        representative = match representative {
            Some((best_id, best_urls))
                if best_urls > urls || (best_urls == urls && best_id < *site_id) =>
            {
                Some((best_id, best_urls))
            }
            _ => Some((*site_id, urls)),
        };
    }

    conn.execute(
        "UPDATE template_groups
         SET size = ?1, representative_site_id = ?2, updated_at = ?3
         WHERE id = ?4",
        params![
            members.len() as i64,
            representative.map(|(id, _)| id),
            current_timestamp(),
            group_id
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn drop(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
CREATE TABLE IF NOT EXISTS sites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    discovery_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(discovery_status IN ('pending', 'mapping', 'mapped', 'failed')),
    grouping_status TEXT NOT NULL DEFAULT 'ungrouped'
        CHECK(grouping_status IN ('ungrouped', 'candidate_grouped', 'grouped', 'rejected', 'ignored')),
    group_id INTEGER,
    last_mapped_at INTEGER,
    last_signature_at INTEGER,
    created_at INTEGER NOT NULL,

    FOREIGN KEY(group_id) REFERENCES template_groups(id) ON DELETE SET NULL,
    CHECK(group_id IS NULL OR grouping_status IN ('candidate_grouped', 'grouped'))
);

CREATE INDEX IF NOT EXISTS idx_sites_group ON sites(group_id);

-- One batch execution of the discovery pipeline
CREATE TABLE IF NOT EXISTS map_runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK(status IN ('running', 'done', 'failed')),
    sites_total INTEGER NOT NULL,
    sites_success INTEGER NOT NULL DEFAULT 0,
    sites_failed INTEGER NOT NULL DEFAULT 0,
    concurrency INTEGER NOT NULL,
    rate_limit INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    error TEXT
);

CREATE TABLE IF NOT EXISTS map_run_sites (
    run_id TEXT NOT NULL,
    site_id INTEGER NOT NULL,
    PRIMARY KEY(run_id, site_id),
    FOREIGN KEY(run_id) REFERENCES map_runs(id) ON DELETE CASCADE,
    FOREIGN KEY(site_id) REFERENCES sites(id) ON DELETE CASCADE
);

-- Raw fetch result, written once per (run, site)
CREATE TABLE IF NOT EXISTS site_maps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    site_id INTEGER NOT NULL,
    urls TEXT NOT NULL,           -- JSON array, input order
    url_count INTEGER NOT NULL,
    error_kind TEXT CHECK(error_kind IS NULL OR error_kind IN ('timeout', 'rateLimit', 'httpError', 'network')),
    error_message TEXT,
    attempts INTEGER NOT NULL,
    fetched_at INTEGER NOT NULL,

    FOREIGN KEY(run_id) REFERENCES map_runs(id) ON DELETE CASCADE,
    FOREIGN KEY(site_id) REFERENCES sites(id) ON DELETE CASCADE,
    UNIQUE(run_id, site_id)
);

CREATE INDEX IF NOT EXISTS idx_site_maps_site ON site_maps(site_id);

CREATE TABLE IF NOT EXISTS site_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    site_id INTEGER NOT NULL,
    template TEXT NOT NULL,
    count INTEGER NOT NULL,
    sample_urls TEXT NOT NULL,    -- JSON array, at most 3
    first_seen INTEGER NOT NULL,

    FOREIGN KEY(run_id) REFERENCES map_runs(id) ON DELETE CASCADE,
    FOREIGN KEY(site_id) REFERENCES sites(id) ON DELETE CASCADE,
    UNIQUE(site_id, run_id, template)
);

CREATE INDEX IF NOT EXISTS idx_site_templates_lookup ON site_templates(site_id, template);

CREATE TABLE IF NOT EXISTS site_signatures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    site_id INTEGER NOT NULL,
    listing_templates TEXT NOT NULL,  -- JSON array
    detail_templates TEXT NOT NULL,   -- JSON array
    eligible INTEGER NOT NULL,
    reason TEXT CHECK(reason IS NULL OR reason IN ('map_vazio', 'sem_padroes', 'sem_listagem', 'sem_detalhe')),
    created_at INTEGER NOT NULL,

    FOREIGN KEY(run_id) REFERENCES map_runs(id) ON DELETE CASCADE,
    FOREIGN KEY(site_id) REFERENCES sites(id) ON DELETE CASCADE,
    UNIQUE(run_id, site_id),
    CHECK((eligible = 1 AND reason IS NULL) OR (eligible = 0 AND reason IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS template_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    signature_hash TEXT NOT NULL UNIQUE,
    listing_template TEXT NOT NULL,
    detail_template TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('candidate', 'validated', 'rejected')),
    size INTEGER NOT NULL DEFAULT 0,
    representative_site_id INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,

    FOREIGN KEY(representative_site_id) REFERENCES sites(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS template_group_members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL,
    site_id INTEGER NOT NULL,
    run_id TEXT NOT NULL,
    joined_at INTEGER NOT NULL,

    FOREIGN KEY(group_id) REFERENCES template_groups(id) ON DELETE CASCADE,
    FOREIGN KEY(site_id) REFERENCES sites(id) ON DELETE CASCADE,
    UNIQUE(group_id, site_id)
);

CREATE INDEX IF NOT EXISTS idx_group_members_site ON template_group_members(site_id);

-- Append-only audit trail of every verdict applied to a group
CREATE TABLE IF NOT EXISTS ai_validations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('agent', 'manual')),
    input_payload TEXT NOT NULL,     -- JSON
    output_verdict TEXT NOT NULL,    -- JSON
    is_valid INTEGER NOT NULL,
    confidence TEXT NOT NULL CHECK(confidence IN ('low', 'medium', 'high')),
    reasoning TEXT NOT NULL,
    created_at INTEGER NOT NULL,

    FOREIGN KEY(group_id) REFERENCES template_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_ai_validations_group ON ai_validations(group_id);
            ",
        )?;
        Ok(())
    }

    pub fn get_connection(&self) -> &Connection {
        &self.conn
    }

    /// Single-writer transaction; requires exclusive access to the database.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    // Site management

    /// Insert a site or refresh the display name of an existing domain.
    pub fn upsert_site(&self, domain: &str, name: &str) -> Result<i64> {
        let id = self.conn.query_row(
            "INSERT INTO sites (domain, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(domain) DO UPDATE SET name = excluded.name
             RETURNING id",
            params![domain, name, current_timestamp()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_site(&self, site_id: i64) -> Result<Option<Site>> {
        query_site(&self.conn, site_id)
    }

    pub fn get_site_by_domain(&self, domain: &str) -> Result<Option<Site>> {
        let sql = format!("SELECT {} FROM sites WHERE domain = ?1", SITE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![domain], site_from_row)
            .optional()?)
    }

    pub fn list_sites(&self) -> Result<Vec<Site>> {
        let sql = format!("SELECT {} FROM sites ORDER BY id", SITE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    pub fn list_sites_by_discovery_status(&self, status: DiscoveryStatus) -> Result<Vec<Site>> {
        let sql = format!(
            "SELECT {} FROM sites WHERE discovery_status = ?1 ORDER BY id",
            SITE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sites = stmt
            .query_map(params![status], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    pub fn count_sites_by_discovery_status(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT discovery_status, COUNT(*) FROM sites GROUP BY discovery_status ORDER BY 1",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    pub fn count_sites_by_grouping_status(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT grouping_status, COUNT(*) FROM sites GROUP BY grouping_status ORDER BY 1",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// `pending`/`mapped`/`failed` → `mapping`. A site already mapping is left alone.
    pub fn mark_site_mapping(&self, site_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sites SET discovery_status = ?1 WHERE id = ?2 AND discovery_status != ?1",
            params![DiscoveryStatus::Mapping, site_id],
        )?;
        Ok(changed == 1)
    }

    // Run management

    pub fn create_run(&mut self, site_ids: &[i64], concurrency: usize, rate_limit: u32) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO map_runs (id, status, sites_total, concurrency, rate_limit, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &run_id,
                RunStatus::Running,
                site_ids.len() as i64,
                concurrency as i64,
                i64::from(rate_limit),
                current_timestamp()
            ],
        )?;

        for site_id in site_ids {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO map_run_sites (run_id, site_id) VALUES (?1, ?2)",
                params![&run_id, site_id],
            )?;
            if inserted == 0 {
                return Err(LotmapError::InvalidState(format!(
                    "site {} listed twice in run",
                    site_id
                )));
            }
        }

        tx.commit()?;
        Ok(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<MapRun>> {
        let sql = format!("SELECT {} FROM map_runs WHERE id = ?1", RUN_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![run_id], run_from_row)
            .optional()?)
    }

    pub fn list_runs(&self) -> Result<Vec<MapRun>> {
        let sql = format!(
            "SELECT {} FROM map_runs ORDER BY started_at DESC, rowid DESC",
            RUN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn run_site_ids(&self, run_id: &str) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT site_id FROM map_run_sites WHERE run_id = ?1 ORDER BY site_id")?;
        let ids = stmt
            .query_map(params![run_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Move a running run to a terminal status. Terminal runs are never reopened.
    pub fn finish_run(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
        if !status.is_terminal() {
            return Err(LotmapError::InvalidState(
                "a run can only finish as done or failed".to_string(),
            ));
        }

        let changed = self.conn.execute(
            "UPDATE map_runs SET status = ?1, finished_at = ?2, error = ?3
             WHERE id = ?4 AND status = ?5",
            params![status, current_timestamp(), error, run_id, RunStatus::Running],
        )?;

        if changed == 0 {
            return Err(LotmapError::InvalidState(format!(
                "run {} is not running",
                run_id
            )));
        }
        Ok(())
    }

    // Per-site outcomes. Each one is self-contained: artifacts, site state and
    // the run counter change together or not at all.

    pub fn record_site_mapped(&mut self, run_id: &str, site_id: i64, mapped: &MappedSite<'_>) -> Result<()> {
        let now = current_timestamp();
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO site_maps (run_id, site_id, urls, url_count, attempts, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                site_id,
                serde_json::to_string(mapped.urls)?,
                mapped.urls.len() as i64,
                i64::from(mapped.attempts),
                now
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO site_templates (run_id, site_id, template, count, sample_urls, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (template, stats) in mapped.templates {
                stmt.execute(params![
                    run_id,
                    site_id,
                    template,
                    stats.count as i64,
                    serde_json::to_string(&stats.sample_urls)?,
                    stats.first_seen as i64
                ])?;
            }
        }

        let classification = mapped.classification;
        tx.execute(
            "INSERT INTO site_signatures
                (run_id, site_id, listing_templates, detail_templates, eligible, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                site_id,
                serde_json::to_string(&classification.listing)?,
                serde_json::to_string(&classification.detail)?,
                classification.eligible,
                classification.reason,
                now
            ],
        )?;

        tx.execute(
            "UPDATE sites SET discovery_status = ?1, last_mapped_at = ?2, last_signature_at = ?2
             WHERE id = ?3",
            params![DiscoveryStatus::Mapped, now, site_id],
        )?;

        Self::bump_run_counter(&tx, run_id, "sites_success")?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_site_failed(
        &mut self,
        run_id: &str,
        site_id: i64,
        error: &FetchError,
        attempts: u32,
    ) -> Result<()> {
        let now = current_timestamp();
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO site_maps
                (run_id, site_id, urls, url_count, error_kind, error_message, attempts, fetched_at)
             VALUES (?1, ?2, '[]', 0, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                site_id,
                error.kind().as_str(),
                error.to_string(),
                i64::from(attempts),
                now
            ],
        )?;

        tx.execute(
            "UPDATE sites SET discovery_status = ?1 WHERE id = ?2",
            params![DiscoveryStatus::Failed, site_id],
        )?;

        Self::bump_run_counter(&tx, run_id, "sites_failed")?;
        tx.commit()?;
        Ok(())
    }

    fn bump_run_counter(tx: &Transaction<'_>, run_id: &str, column: &str) -> Result<()> {
        // Increment in SQL so concurrent completions never lose an update.
        let sql = format!(
            "UPDATE map_runs SET {column} = {column} + 1 WHERE id = ?1 AND status = ?2"
        );
        let changed = tx.execute(&sql, params![run_id, RunStatus::Running])?;
        if changed == 0 {
            return Err(LotmapError::InvalidState(format!(
                "run {} is not running",
                run_id
            )));
        }
        Ok(())
    }

    pub fn get_site_map(&self, run_id: &str, site_id: i64) -> Result<Option<SiteMap>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, run_id, site_id, urls, url_count, error_kind, error_message, attempts, fetched_at
                 FROM site_maps WHERE run_id = ?1 AND site_id = ?2",
                params![run_id, site_id],
                |row| {
                    Ok(SiteMap {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        site_id: row.get(2)?,
                        urls: json_column(row, 3)?,
                        url_count: row.get(4)?,
                        error_kind: row.get(5)?,
                        error_message: row.get(6)?,
                        attempts: row.get(7)?,
                        fetched_at: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn latest_url_count(&self, site_id: i64) -> Result<i64> {
        query_latest_url_count(&self.conn, site_id)
    }

    /// Templates of one site in one run, in first-seen order.
    pub fn get_site_templates(&self, run_id: &str, site_id: i64) -> Result<Vec<SiteTemplate>> {
        let sql = format!(
            "SELECT {} FROM site_templates WHERE run_id = ?1 AND site_id = ?2 ORDER BY first_seen",
            TEMPLATE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let templates = stmt
            .query_map(params![run_id, site_id], template_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(templates)
    }

    /// Most recently written row for a given template of a site, across runs.
    pub fn latest_site_template(&self, site_id: i64, template: &str) -> Result<Option<SiteTemplate>> {
        let sql = format!(
            "SELECT {} FROM site_templates WHERE site_id = ?1 AND template = ?2
             ORDER BY id DESC LIMIT 1",
            TEMPLATE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![site_id, template], template_from_row)
            .optional()?)
    }

    pub fn get_signature(&self, run_id: &str, site_id: i64) -> Result<Option<SiteSignature>> {
        let sql = format!(
            "SELECT {} FROM site_signatures WHERE run_id = ?1 AND site_id = ?2",
            SIGNATURE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![run_id, site_id], signature_from_row)
            .optional()?)
    }

    pub fn get_run_signatures(&self, run_id: &str) -> Result<Vec<SiteSignature>> {
        let sql = format!(
            "SELECT {} FROM site_signatures WHERE run_id = ?1 ORDER BY site_id",
            SIGNATURE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let signatures = stmt
            .query_map(params![run_id], signature_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(signatures)
    }

    // Groups

    pub fn get_group(&self, group_id: i64) -> Result<Option<TemplateGroup>> {
        query_group(&self.conn, group_id)
    }

    pub fn get_group_by_hash(&self, signature_hash: &str) -> Result<Option<TemplateGroup>> {
        query_group_by_hash(&self.conn, signature_hash)
    }

    pub fn list_groups(&self, status: Option<GroupStatus>) -> Result<Vec<TemplateGroup>> {
        let sql = format!(
            "SELECT {} FROM template_groups WHERE ?1 IS NULL OR status = ?1 ORDER BY id",
            GROUP_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let groups = stmt
            .query_map(params![status], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    pub fn get_group_members(&self, group_id: i64) -> Result<Vec<TemplateGroupMember>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, site_id, run_id, joined_at
             FROM template_group_members WHERE group_id = ?1 ORDER BY site_id",
        )?;
        let members = stmt
            .query_map(params![group_id], |row| {
                Ok(TemplateGroupMember {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    site_id: row.get(2)?,
                    run_id: row.get(3)?,
                    joined_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    /// Member sites, most recently mapped first.
    pub fn get_member_sites(&self, group_id: i64) -> Result<Vec<Site>> {
        let sql = format!(
            "SELECT {} FROM sites
             WHERE id IN (SELECT site_id FROM template_group_members WHERE group_id = ?1)
             ORDER BY last_mapped_at IS NULL, last_mapped_at DESC, id",
            SITE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sites = stmt
            .query_map(params![group_id], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    pub fn get_validations(&self, group_id: i64) -> Result<Vec<AiValidation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, source, input_payload, is_valid, confidence, reasoning, created_at
             FROM ai_validations WHERE group_id = ?1 ORDER BY id",
        )?;
        let validations = stmt
            .query_map(params![group_id], |row| {
                Ok(AiValidation {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    source: row.get(2)?,
                    input_payload: row.get(3)?,
                    is_valid: row.get(4)?,
                    confidence: row.get(5)?,
                    reasoning: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(validations)
    }

    /// Number of sites whose group reference is set while their status forbids it.
    /// Always zero unless the schema constraint was bypassed.
    pub fn count_dangling_group_refs(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM sites
             WHERE (group_id IS NOT NULL AND grouping_status NOT IN ('candidate_grouped', 'grouped'))
                OR (group_id IS NOT NULL AND group_id NOT IN (SELECT id FROM template_groups))",
            [],
            |row| row.get(0),
        )?)
    }
}
