// Tests for the validation coordinator

mod common;

use common::{create_test_db, seed_scenario};
use lotmap_core::data::Database;
use lotmap_core::error::LotmapError;
use lotmap_core::grouping::run_grouping;
use lotmap_core::model::{Confidence, GroupStatus, GroupingStatus, VerdictSource};
use lotmap_core::validation::{
    AgentValidator, StaticValidator, ValidationOutcome, Validator, approve_group, build_payload,
    reject_group, validate_group,
};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn grouped_scenario(db: &mut Database) -> (i64, i64, i64) {
    let (a, b, _, run_id) = seed_scenario(db);
    let group_id = run_grouping(db, &run_id).unwrap().group_ids[0];
    (a, b, group_id)
}

// ============================================================================
// Payload Tests
// ============================================================================

#[test]
fn test_build_payload() {
    let (_temp_dir, mut db) = create_test_db();
    let (_, _, group_id) = grouped_scenario(&mut db);

    let payload = build_payload(&db, group_id).unwrap();
    assert_eq!(payload.listing_template, "/leilao/{num}/lotes");
    assert_eq!(payload.detail_template, "/item/{num}/detalhes");
    assert_eq!(payload.domains_count, 2);
    assert_eq!(payload.examples.len(), 2);

    let example_a = payload
        .examples
        .iter()
        .find(|e| e.domain == "a.com.br")
        .unwrap();
    assert_eq!(example_a.listing_urls, vec!["https://a.com.br/leilao/10/lotes"]);
    assert_eq!(example_a.detail_urls, vec!["https://a.com.br/item/55/detalhes"]);
}

#[test]
fn test_payload_samples_at_most_three_members() {
    let (_temp_dir, mut db) = create_test_db();
    let mut sites = Vec::new();
    for n in 0..5 {
        let domain = format!("s{}.com.br", n);
        let id = db.upsert_site(&domain, &domain).unwrap();
        sites.push((
            id,
            common::urls(&domain, &["/leilao/1/lotes", "/item/1/detalhes"]),
        ));
    }
    let run_id = common::seed_run(&mut db, &sites);
    let group_id = run_grouping(&mut db, &run_id).unwrap().group_ids[0];

    let payload = build_payload(&db, group_id).unwrap();
    assert_eq!(payload.domains_count, 5);
    assert_eq!(payload.examples.len(), 3);
}

// ============================================================================
// Verdict Tests
// ============================================================================

#[tokio::test]
async fn test_accept_verdict() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, group_id) = grouped_scenario(&mut db);
    let validator = StaticValidator::accept(Confidence::High);

    let outcome = validate_group(&mut db, &validator, group_id).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Validated { .. }));

    let group = db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Validated);
    for id in [a, b] {
        let site = db.get_site(id).unwrap().unwrap();
        assert_eq!(site.grouping_status, GroupingStatus::Grouped);
        assert_eq!(site.group_id, Some(group_id));
    }

    let audit = db.get_validations(group_id).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].source, VerdictSource::Agent);
    assert!(audit[0].is_valid);
    assert_eq!(audit[0].confidence, Confidence::High);
    assert!(audit[0].input_payload.contains("\"listingTemplate\""));
}

#[tokio::test]
async fn test_reject_verdict_rolls_back_membership() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, group_id) = grouped_scenario(&mut db);
    let validator = StaticValidator::reject("listing pages are news archives");

    let outcome = validate_group(&mut db, &validator, group_id).await.unwrap();
    match outcome {
        ValidationOutcome::Rejected { sites_released, verdict, .. } => {
            assert_eq!(sites_released, 2);
            assert!(!verdict.is_valid);
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let group = db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Rejected);
    assert_eq!(group.size, 0);
    assert!(db.get_group_members(group_id).unwrap().is_empty());

    for id in [a, b] {
        let site = db.get_site(id).unwrap().unwrap();
        assert_eq!(site.grouping_status, GroupingStatus::Rejected);
        assert_eq!(site.group_id, None);
    }
    assert_eq!(db.count_dangling_group_refs().unwrap(), 0);

    let audit = db.get_validations(group_id).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].is_valid);
    assert_eq!(audit[0].reasoning, "listing pages are news archives");
}

#[tokio::test]
async fn test_transport_failure_abstains() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, _, group_id) = grouped_scenario(&mut db);
    let validator = StaticValidator::unreachable("connection reset");

    let outcome = validate_group(&mut db, &validator, group_id).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Abstained { .. }));
    assert_eq!(validator.calls(), 1);

    let group = db.get_group(group_id).unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Candidate);
    assert_eq!(group.size, 2);
    assert!(db.get_validations(group_id).unwrap().is_empty());
    assert_eq!(
        db.get_site(a).unwrap().unwrap().grouping_status,
        GroupingStatus::CandidateGrouped
    );

    // Still eligible for a later attempt.
    let retry = StaticValidator::accept(Confidence::Medium);
    let outcome = validate_group(&mut db, &retry, group_id).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Validated { .. }));
}

#[tokio::test]
async fn test_only_candidates_are_validated() {
    let (_temp_dir, mut db) = create_test_db();
    let (_, _, group_id) = grouped_scenario(&mut db);
    let validator = StaticValidator::accept(Confidence::High);

    validate_group(&mut db, &validator, group_id).await.unwrap();
    let again = validate_group(&mut db, &validator, group_id).await;
    assert!(matches!(again, Err(LotmapError::InvalidState(_))));
    assert_eq!(validator.calls(), 1);

    let missing = validate_group(&mut db, &validator, 404).await;
    assert!(matches!(missing, Err(LotmapError::NotFound(_))));
}

// ============================================================================
// Manual Override Tests
// ============================================================================

#[test]
fn test_manual_approve() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, _, group_id) = grouped_scenario(&mut db);

    approve_group(&mut db, group_id, Some("checked by hand")).unwrap();

    assert_eq!(
        db.get_group(group_id).unwrap().unwrap().status,
        GroupStatus::Validated
    );
    assert_eq!(
        db.get_site(a).unwrap().unwrap().grouping_status,
        GroupingStatus::Grouped
    );
    let audit = db.get_validations(group_id).unwrap();
    assert_eq!(audit[0].source, VerdictSource::Manual);
    assert_eq!(audit[0].reasoning, "checked by hand");

    assert!(approve_group(&mut db, group_id, None).is_err());
}

#[test]
fn test_manual_reject_of_validated_group() {
    let (_temp_dir, mut db) = create_test_db();
    let (a, b, group_id) = grouped_scenario(&mut db);
    approve_group(&mut db, group_id, None).unwrap();

    reject_group(&mut db, group_id, Some("wrong platform")).unwrap();

    assert!(db.get_group_members(group_id).unwrap().is_empty());
    for id in [a, b] {
        let site = db.get_site(id).unwrap().unwrap();
        assert_eq!(site.grouping_status, GroupingStatus::Rejected);
        assert_eq!(site.group_id, None);
    }
    assert_eq!(db.get_validations(group_id).unwrap().len(), 2);

    // A rejected group cannot be rejected or approved again.
    assert!(reject_group(&mut db, group_id, None).is_err());
    assert!(approve_group(&mut db, group_id, None).is_err());
    assert_eq!(db.get_validations(group_id).unwrap().len(), 2);
}

// ============================================================================
// Agent Validator Tests
// ============================================================================

fn chat_response(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
}

#[tokio::test]
async fn test_agent_validator_parses_verdict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response(
            r#"{"isValid": true, "confidence": "medium", "reasoning": "same lot pages"}"#,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let (_temp_dir, mut db) = create_test_db();
    let (_, _, group_id) = grouped_scenario(&mut db);
    let validator = AgentValidator::new(
        &format!("{}/v1/chat/completions", server.uri()),
        "gpt-4o-mini",
        "sk-test",
        Duration::from_secs(5),
    )
    .unwrap();

    let outcome = validate_group(&mut db, &validator, group_id).await.unwrap();
    match outcome {
        ValidationOutcome::Validated { verdict, .. } => {
            assert_eq!(verdict.confidence, Confidence::Medium);
            assert_eq!(verdict.reasoning, "same lot pages");
        }
        other => panic!("expected validation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_agent_validator_server_error_is_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let (_temp_dir, mut db) = create_test_db();
    let (_, _, group_id) = grouped_scenario(&mut db);
    let validator = AgentValidator::new(&server.uri(), "gpt-4o-mini", "sk-test", Duration::from_secs(5))
        .unwrap();

    let payload = build_payload(&db, group_id).unwrap();
    assert!(matches!(
        validator.validate(&payload).await,
        Err(LotmapError::Validator(_))
    ));

    let outcome = validate_group(&mut db, &validator, group_id).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Abstained { .. }));
    assert_eq!(
        db.get_group(group_id).unwrap().unwrap().status,
        GroupStatus::Candidate
    );
}

#[tokio::test]
async fn test_agent_validator_garbage_answer_abstains() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("I think so")))
        .mount(&server)
        .await;

    let (_temp_dir, mut db) = create_test_db();
    let (_, _, group_id) = grouped_scenario(&mut db);
    let validator = AgentValidator::new(&server.uri(), "gpt-4o-mini", "sk-test", Duration::from_secs(5))
        .unwrap();

    let outcome = validate_group(&mut db, &validator, group_id).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Abstained { .. }));
    assert!(db.get_validations(group_id).unwrap().is_empty());
}
