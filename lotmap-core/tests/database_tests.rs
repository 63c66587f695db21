// Tests for database functionality

mod common;

use common::{create_test_db, map_site, urls};
use lotmap_core::data::Database;
use lotmap_core::error::LotmapError;
use lotmap_core::model::{DiscoveryStatus, GroupingStatus, IneligibleReason, RunStatus};
use lotmap_scanner::FetchError;
use tempfile::TempDir;

// ============================================================================
// Database Creation Tests
// ============================================================================

#[test]
fn test_database_creation() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let db = Database::new(&db_path);
    assert!(db.is_ok());
    assert!(db_path.exists());
}

#[test]
fn test_database_exists_and_drop() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    assert!(!Database::exists(&db_path));

    let db = Database::new(&db_path).unwrap();
    drop(db);
    assert!(Database::exists(&db_path));

    Database::drop(&db_path).unwrap();
    assert!(!Database::exists(&db_path));
}

#[test]
fn test_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    {
        let db = Database::new(&db_path).unwrap();
        db.upsert_site("a.com.br", "A").unwrap();
    }

    let db = Database::new(&db_path).unwrap();
    assert!(db.get_site_by_domain("a.com.br").unwrap().is_some());
}

// ============================================================================
// Site Tests
// ============================================================================

#[test]
fn test_upsert_site_is_keyed_by_domain() {
    let (_temp_dir, db) = create_test_db();

    let first = db.upsert_site("a.com.br", "Old name").unwrap();
    let second = db.upsert_site("a.com.br", "New name").unwrap();
    assert_eq!(first, second);

    let site = db.get_site(first).unwrap().unwrap();
    assert_eq!(site.name, "New name");
    assert_eq!(site.discovery_status, DiscoveryStatus::Pending);
    assert_eq!(site.grouping_status, GroupingStatus::Ungrouped);
    assert_eq!(site.group_id, None);
    assert_eq!(db.list_sites().unwrap().len(), 1);
}

#[test]
fn test_get_missing_site() {
    let (_temp_dir, db) = create_test_db();
    assert!(db.get_site(42).unwrap().is_none());
    assert!(db.get_site_by_domain("nowhere.com").unwrap().is_none());
}

#[test]
fn test_group_reference_requires_grouped_status() {
    let (_temp_dir, db) = create_test_db();
    let site = db.upsert_site("a.com.br", "A").unwrap();
    db.get_connection()
        .execute(
            "INSERT INTO template_groups (signature_hash, listing_template, detail_template, status, created_at, updated_at)
             VALUES ('h', '/lotes', '/{num}/info', 'candidate', 0, 0)",
            [],
        )
        .unwrap();

    let result = db.get_connection().execute(
        "UPDATE sites SET group_id = 1, grouping_status = 'rejected' WHERE id = ?1",
        [site],
    );
    assert!(result.is_err());

    let result = db.get_connection().execute(
        "UPDATE sites SET group_id = 1, grouping_status = 'candidate_grouped' WHERE id = ?1",
        [site],
    );
    assert!(result.is_ok());
    assert_eq!(db.count_dangling_group_refs().unwrap(), 0);
}

// ============================================================================
// Run Tests
// ============================================================================

#[test]
fn test_create_run() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let b = db.upsert_site("b.com.br", "B").unwrap();

    let run_id = db.create_run(&[a, b], 3, 30).unwrap();
    assert_eq!(run_id.len(), 36);

    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.sites_total, 2);
    assert_eq!(run.sites_success, 0);
    assert_eq!(run.concurrency, 3);
    assert_eq!(run.rate_limit, 30);
    assert_eq!(db.run_site_ids(&run_id).unwrap(), vec![a, b]);
}

#[test]
fn test_create_run_rejects_duplicate_sites() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();

    let result = db.create_run(&[a, a], 1, 0);
    assert!(matches!(result, Err(LotmapError::InvalidState(_))));
    assert!(db.list_runs().unwrap().is_empty());
}

#[test]
fn test_finish_run_only_once() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();

    db.finish_run(&run_id, RunStatus::Done, None).unwrap();
    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert!(run.finished_at.is_some());

    assert!(db.finish_run(&run_id, RunStatus::Failed, Some("late")).is_err());
    assert!(db.finish_run(&run_id, RunStatus::Running, None).is_err());
}

// ============================================================================
// Per-site Outcome Tests
// ============================================================================

#[test]
fn test_record_site_mapped() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();
    assert!(db.mark_site_mapping(a).unwrap());

    let list = urls(
        "a.com.br",
        &["/leilao/10/lotes", "/item/55/detalhes", "/item/56/detalhes"],
    );
    map_site(&mut db, &run_id, a, &list);

    let site = db.get_site(a).unwrap().unwrap();
    assert_eq!(site.discovery_status, DiscoveryStatus::Mapped);
    assert!(site.last_mapped_at.is_some());
    assert_eq!(site.last_mapped_at, site.last_signature_at);

    let map = db.get_site_map(&run_id, a).unwrap().unwrap();
    assert_eq!(map.urls, list);
    assert_eq!(map.url_count, 3);
    assert_eq!(map.error_kind, None);

    let templates = db.get_site_templates(&run_id, a).unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(templates[0].template, "/leilao/{num}/lotes");
    assert_eq!(templates[1].template, "/item/{num}/detalhes");
    assert_eq!(templates[1].count, 2);
    assert_eq!(templates[1].sample_urls.len(), 2);

    let signature = db.get_signature(&run_id, a).unwrap().unwrap();
    assert!(signature.eligible);
    assert_eq!(signature.reason, None);
    assert_eq!(signature.listing_templates, vec!["/leilao/{num}/lotes"]);
    assert_eq!(signature.detail_templates, vec!["/item/{num}/detalhes"]);

    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.sites_success, 1);
    assert_eq!(run.sites_failed, 0);
    assert_eq!(db.latest_url_count(a).unwrap(), 3);
}

#[test]
fn test_record_site_mapped_empty_list() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();

    map_site(&mut db, &run_id, a, &[]);

    let signature = db.get_signature(&run_id, a).unwrap().unwrap();
    assert!(!signature.eligible);
    assert_eq!(signature.reason, Some(IneligibleReason::MapVazio));
    assert_eq!(
        db.get_site(a).unwrap().unwrap().discovery_status,
        DiscoveryStatus::Mapped
    );
}

#[test]
fn test_record_site_failed() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();

    db.record_site_failed(&run_id, a, &FetchError::Timeout("60s".to_string()), 3)
        .unwrap();

    let map = db.get_site_map(&run_id, a).unwrap().unwrap();
    assert_eq!(map.error_kind.as_deref(), Some("timeout"));
    assert_eq!(map.attempts, 3);
    assert!(map.urls.is_empty());
    assert!(db.get_signature(&run_id, a).unwrap().is_none());

    assert_eq!(
        db.get_site(a).unwrap().unwrap().discovery_status,
        DiscoveryStatus::Failed
    );
    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.sites_failed, 1);
    assert_eq!(run.sites_success, 0);
}

#[test]
fn test_site_outcome_written_once_per_run() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();
    map_site(&mut db, &run_id, a, &urls("a.com.br", &["/lotes"]));

    let again = db.record_site_failed(&run_id, a, &FetchError::RateLimited, 1);
    assert!(again.is_err());

    // The failed attempt rolled back completely.
    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.sites_success, 1);
    assert_eq!(run.sites_failed, 0);
    assert_eq!(
        db.get_site(a).unwrap().unwrap().discovery_status,
        DiscoveryStatus::Mapped
    );
}

#[test]
fn test_outcome_rejected_after_run_finished() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();
    db.finish_run(&run_id, RunStatus::Failed, Some("aborted"))
        .unwrap();

    let result = db.record_site_failed(&run_id, a, &FetchError::RateLimited, 1);
    assert!(matches!(result, Err(LotmapError::InvalidState(_))));
    assert!(db.get_site_map(&run_id, a).unwrap().is_none());
}

#[test]
fn test_status_counts() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    db.upsert_site("b.com.br", "B").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();
    map_site(&mut db, &run_id, a, &urls("a.com.br", &["/sobre"]));

    let counts = db.count_sites_by_discovery_status().unwrap();
    assert_eq!(
        counts,
        vec![("mapped".to_string(), 1), ("pending".to_string(), 1)]
    );
    let pending = db
        .list_sites_by_discovery_status(DiscoveryStatus::Pending)
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].domain, "b.com.br");
}
