// Tests for the grouping engine

mod common;

use common::{create_test_db, seed_run, seed_scenario, urls};
use lotmap_core::error::LotmapError;
use lotmap_core::grouping::{ignore_site, run_grouping, signature_hash, unignore_site};
use lotmap_core::model::{Confidence, GroupStatus, GroupingStatus};
use lotmap_core::validation::{StaticValidator, approve_group, reject_group, validate_group};

// ============================================================================
// Scenario Tests
// ============================================================================

#[test]
fn test_three_site_scenario() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, c, run_id) = seed_scenario(&mut db);

    let summary = run_grouping(&mut db, &run_id).unwrap();
    assert_eq!(summary.eligible_sites, 2);
    assert_eq!(summary.ineligible_sites, 1);
    assert_eq!(summary.groups_created, 1);
    assert_eq!(summary.group_ids.len(), 1);

    let group = db.get_group(summary.group_ids[0]).unwrap().unwrap();
    assert_eq!(group.listing_template, "/leilao/{num}/lotes");
    assert_eq!(group.detail_template, "/item/{num}/detalhes");
    assert_eq!(group.size, 2);
    assert_eq!(group.status, GroupStatus::Candidate);
    assert_eq!(
        group.signature_hash,
        signature_hash("/leilao/{num}/lotes", "/item/{num}/detalhes")
    );
    // A has three URLs, B two.
    assert_eq!(group.representative_site_id, Some(a));

    for id in [a, b] {
        let site = db.get_site(id).unwrap().unwrap();
        assert_eq!(site.group_id, Some(group.id));
        assert_eq!(site.grouping_status, GroupingStatus::CandidateGrouped);
    }

    let site_c = db.get_site(c).unwrap().unwrap();
    assert_eq!(site_c.group_id, None);
    assert_eq!(site_c.grouping_status, GroupingStatus::Ungrouped);
    let signature = db.get_signature(&run_id, c).unwrap().unwrap();
    assert_eq!(
        signature.reason,
        Some(lotmap_core::model::IneligibleReason::SemPadroes)
    );
}

#[test]
fn test_regrouping_is_idempotent() {
    let (_temp_dir, mut db) = create_test_db();
    let (_, _, _, run_id) = seed_scenario(&mut db);

    let first = run_grouping(&mut db, &run_id).unwrap();
    let members_before = db.get_group_members(first.group_ids[0]).unwrap();

    let second = run_grouping(&mut db, &run_id).unwrap();
    assert_eq!(second.groups_created, 0);
    assert_eq!(second.members_added, 0);
    assert_eq!(second.members_unchanged, 2);
    assert_eq!(second.group_ids, first.group_ids);

    let members_after = db.get_group_members(first.group_ids[0]).unwrap();
    assert_eq!(members_before, members_after);
    assert_eq!(db.list_groups(None).unwrap().len(), 1);
}

#[test]
fn test_grouping_refuses_running_run() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let run_id = db.create_run(&[a], 1, 0).unwrap();

    let result = run_grouping(&mut db, &run_id);
    assert!(matches!(result, Err(LotmapError::InvalidState(_))));
    assert!(matches!(
        run_grouping(&mut db, "no-such-run"),
        Err(LotmapError::NotFound(_))
    ));
}

// ============================================================================
// Determinism Tests
// ============================================================================

#[test]
fn test_same_shape_same_group_regardless_of_order() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();
    let b = db.upsert_site("b.com.br", "B").unwrap();

    let a_urls = urls("a.com.br", &["/item/1/detalhes", "/leilao/1/lotes"]);
    let b_urls = urls("b.com.br", &["/leilao/9/lotes", "/item/7/detalhes"]);

    // B first, then A, in separate runs.
    let run_b = seed_run(&mut db, &[(b, b_urls)]);
    let group_b = run_grouping(&mut db, &run_b).unwrap().group_ids[0];
    let run_a = seed_run(&mut db, &[(a, a_urls)]);
    let group_a = run_grouping(&mut db, &run_a).unwrap().group_ids[0];

    assert_eq!(group_a, group_b);
    let group = db.get_group(group_a).unwrap().unwrap();
    assert_eq!(group.size, 2);
}

#[test]
fn test_tie_broken_by_first_seen() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();

    let run_id = seed_run(
        &mut db,
        &[(
            a,
            urls(
                "a.com.br",
                &[
                    "/lotes/imoveis",
                    "/leilao/1/lotes",
                    "/item/1/detalhes",
                    "/lote/1/show",
                ],
            ),
        )],
    );
    let summary = run_grouping(&mut db, &run_id).unwrap();
    let group = db.get_group(summary.group_ids[0]).unwrap().unwrap();
    assert_eq!(group.listing_template, "/lotes/imoveis");
    assert_eq!(group.detail_template, "/item/{num}/detalhes");
}

#[test]
fn test_highest_count_wins() {
    let (_temp_dir, mut db) = create_test_db();
    let a = db.upsert_site("a.com.br", "A").unwrap();

    let run_id = seed_run(
        &mut db,
        &[(
            a,
            urls(
                "a.com.br",
                &[
                    "/lotes",
                    "/leilao/1/lotes",
                    "/leilao/2/lotes",
                    "/item/1/detalhes",
                ],
            ),
        )],
    );
    let summary = run_grouping(&mut db, &run_id).unwrap();
    let group = db.get_group(summary.group_ids[0]).unwrap().unwrap();
    assert_eq!(group.listing_template, "/leilao/{num}/lotes");
}

// ============================================================================
// Membership Tests
// ============================================================================

#[test]
fn test_site_moves_when_shape_changes() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, _, run_id) = seed_scenario(&mut db);
    let old_group = run_grouping(&mut db, &run_id).unwrap().group_ids[0];

    // A is remapped with a different detail page shape.
    let run2 = seed_run(
        &mut db,
        &[(a, urls("a.com.br", &["/leilao/10/lotes", "/lote/5/info"]))],
    );
    let summary = run_grouping(&mut db, &run2).unwrap();
    assert_eq!(summary.members_moved, 1);
    let new_group = summary.group_ids[0];
    assert_ne!(new_group, old_group);

    let old = db.get_group(old_group).unwrap().unwrap();
    assert_eq!(old.size, 1);
    assert_eq!(old.representative_site_id, Some(b));

    let site_a = db.get_site(a).unwrap().unwrap();
    assert_eq!(site_a.group_id, Some(new_group));
    assert_eq!(db.get_group_members(old_group).unwrap().len(), 1);
    assert_eq!(db.count_dangling_group_refs().unwrap(), 0);
}

#[tokio::test]
async fn test_group_emptied_when_all_members_move() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, _, run_id) = seed_scenario(&mut db);
    let old_group = run_grouping(&mut db, &run_id).unwrap().group_ids[0];

    let run2 = seed_run(
        &mut db,
        &[
            (a, urls("a.com.br", &["/leilao/10/lotes", "/lote/5/info"])),
            (b, urls("b.com.br", &["/leilao/20/lotes", "/lote/7/info"])),
        ],
    );
    let summary = run_grouping(&mut db, &run2).unwrap();
    assert_eq!(summary.members_moved, 2);
    assert_eq!(summary.group_ids.len(), 1);
    assert!(!summary.group_ids.contains(&old_group));

    let old = db.get_group(old_group).unwrap().unwrap();
    assert_eq!(old.size, 0);
    assert_eq!(old.representative_site_id, None);
    assert!(db.get_group_members(old_group).unwrap().is_empty());

    let validator = StaticValidator::accept(Confidence::High);
    assert!(matches!(
        validate_group(&mut db, &validator, old_group).await,
        Err(LotmapError::InvalidState(_))
    ));
    assert_eq!(validator.calls(), 0);
    assert!(matches!(
        approve_group(&mut db, old_group, None),
        Err(LotmapError::InvalidState(_))
    ));
    assert_eq!(
        db.get_group(old_group).unwrap().unwrap().status,
        GroupStatus::Candidate
    );
    assert!(db.get_validations(old_group).unwrap().is_empty());
}

#[test]
fn test_ignored_sites_are_skipped() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, _, run_id) = seed_scenario(&mut db);
    ignore_site(&mut db, b).unwrap();

    let summary = run_grouping(&mut db, &run_id).unwrap();
    assert_eq!(summary.ignored_sites, 1);
    let group = db.get_group(summary.group_ids[0]).unwrap().unwrap();
    assert_eq!(group.size, 1);
    assert_eq!(group.representative_site_id, Some(a));

    let site_b = db.get_site(b).unwrap().unwrap();
    assert_eq!(site_b.grouping_status, GroupingStatus::Ignored);
    assert_eq!(site_b.group_id, None);
}

#[test]
fn test_ignore_removes_membership() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, _, run_id) = seed_scenario(&mut db);
    let group_id = run_grouping(&mut db, &run_id).unwrap().group_ids[0];

    ignore_site(&mut db, a).unwrap();
    let group = db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.size, 1);
    assert_eq!(group.representative_site_id, Some(b));

    unignore_site(&db, a).unwrap();
    assert_eq!(
        db.get_site(a).unwrap().unwrap().grouping_status,
        GroupingStatus::Ungrouped
    );
    assert!(unignore_site(&db, a).is_err());
    assert!(matches!(
        ignore_site(&mut db, 999),
        Err(LotmapError::NotFound(_))
    ));
}

#[test]
fn test_rejected_group_reforms_as_candidate() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, _, run_id) = seed_scenario(&mut db);
    let group_id = run_grouping(&mut db, &run_id).unwrap().group_ids[0];

    reject_group(&mut db, group_id, None).unwrap();
    assert_eq!(
        db.get_group(group_id).unwrap().unwrap().status,
        GroupStatus::Rejected
    );

    let summary = run_grouping(&mut db, &run_id).unwrap();
    assert_eq!(summary.groups_reformed, 1);
    assert_eq!(summary.group_ids, vec![group_id]);

    let group = db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Candidate);
    assert_eq!(group.size, 2);
    for id in [a, b] {
        let site = db.get_site(id).unwrap().unwrap();
        assert_eq!(site.grouping_status, GroupingStatus::CandidateGrouped);
        assert_eq!(site.group_id, Some(group_id));
    }
}
