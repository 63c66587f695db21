// Validation of candidate groups and the accept/reject transition

use crate::data::{self, Database, current_timestamp};
use crate::error::{LotmapError, Result};
use crate::model::{Confidence, GroupStatus, GroupingStatus, VerdictSource};
use async_trait::async_trait;
use reqwest::{Client, header};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Members sampled into a validation payload.
pub const MAX_REPRESENTATIVES: usize = 3;

const SYSTEM_PROMPT: &str = "You review clusters of auction websites that were grouped \
because their URLs share the same listing-page template and detail-page template. \
Decide whether the example URLs are really lot listing pages and lot detail pages of the \
same kind of site, so that a single crawler configuration can serve every site in the \
cluster. Reply with a JSON object only: \
{\"isValid\": boolean, \"confidence\": \"low\" | \"medium\" | \"high\", \"reasoning\": string}.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationExample {
    pub domain: String,
    pub listing_urls: Vec<String>,
    pub detail_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPayload {
    pub listing_template: String,
    pub detail_template: String,
    pub domains_count: usize,
    pub examples: Vec<ValidationExample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_valid: bool,
    pub confidence: Confidence,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Validated { group_id: i64, verdict: Verdict },
    Rejected { group_id: i64, verdict: Verdict, sites_released: usize },
    /// The validator could not be reached; the group stays `candidate`.
    Abstained { group_id: i64, reason: String },
}

impl ValidationOutcome {
    pub fn group_id(&self) -> i64 {
        match self {
            ValidationOutcome::Validated { group_id, .. }
            | ValidationOutcome::Rejected { group_id, .. }
            | ValidationOutcome::Abstained { group_id, .. } => *group_id,
        }
    }
}

/// An external judge of candidate groups.
///
/// An `Err` is a transport failure, never a negative answer: a negative
/// answer is an `Ok(Verdict { is_valid: false, .. })`.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, payload: &ValidationPayload) -> Result<Verdict>;
}

/// Chat-completions backed validator (OpenAI compatible).
pub struct AgentValidator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl AgentValidator {
    pub fn new(endpoint: &str, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LotmapError::Validator(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Models sometimes wrap JSON in a markdown fence.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

pub fn parse_verdict(content: &str) -> Result<Verdict> {
    serde_json::from_str(strip_code_fence(content))
        .map_err(|e| LotmapError::Validator(format!("unparseable verdict: {}", e)))
}

#[async_trait]
impl Validator for AgentValidator {
    async fn validate(&self, payload: &ValidationPayload) -> Result<Verdict> {
        let request_body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": serde_json::to_string(payload)? },
            ],
        });

        debug!("Calling validator at {}", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| LotmapError::Validator(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LotmapError::Validator(format!(
                "validator returned {}: {}",
                status,
                body.trim()
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LotmapError::Validator(e.to_string()))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LotmapError::Validator("empty validator response".to_string()))?;

        parse_verdict(&content)
    }
}

/// Deterministic validator: always answers the same verdict, or always fails.
pub struct StaticValidator {
    answer: std::result::Result<Verdict, String>,
    calls: AtomicUsize,
}

impl StaticValidator {
    pub fn accept(confidence: Confidence) -> Self {
        Self::answering(Verdict {
            is_valid: true,
            confidence,
            reasoning: "accepted".to_string(),
        })
    }

    pub fn reject(reasoning: &str) -> Self {
        Self::answering(Verdict {
            is_valid: false,
            confidence: Confidence::High,
            reasoning: reasoning.to_string(),
        })
    }

    pub fn answering(verdict: Verdict) -> Self {
        Self {
            answer: Ok(verdict),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(message: &str) -> Self {
        Self {
            answer: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for StaticValidator {
    async fn validate(&self, _payload: &ValidationPayload) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(LotmapError::Validator)
    }
}

/// Payload for a group: up to three members, most recently mapped first,
/// each with one sample listing and one sample detail URL.
pub fn build_payload(db: &Database, group_id: i64) -> Result<ValidationPayload> {
    let group = db
        .get_group(group_id)?
        .ok_or_else(|| LotmapError::NotFound(format!("group {}", group_id)))?;
    let members = db.get_member_sites(group_id)?;

    let mut examples = Vec::new();
    for site in members.iter().take(MAX_REPRESENTATIVES) {
        let sample = |template: &str| -> Result<Vec<String>> {
            Ok(db
                .latest_site_template(site.id, template)?
                .and_then(|t| t.sample_urls.into_iter().next())
                .into_iter()
                .collect())
        };

        examples.push(ValidationExample {
            domain: site.domain.clone(),
            listing_urls: sample(&group.listing_template)?,
            detail_urls: sample(&group.detail_template)?,
        });
    }

    Ok(ValidationPayload {
        listing_template: group.listing_template,
        detail_template: group.detail_template,
        domains_count: members.len(),
        examples,
    })
}

/// Ask `validator` about a candidate group and apply its verdict.
pub async fn validate_group(
    db: &mut Database,
    validator: &dyn Validator,
    group_id: i64,
) -> Result<ValidationOutcome> {
    let group = db
        .get_group(group_id)?
        .ok_or_else(|| LotmapError::NotFound(format!("group {}", group_id)))?;
    if group.status != GroupStatus::Candidate {
        return Err(LotmapError::InvalidState(format!(
            "group {} is {}, only candidate groups can be validated",
            group_id, group.status
        )));
    }
    if group.size == 0 {
        return Err(LotmapError::InvalidState(format!(
            "group {} has no member sites",
            group_id
        )));
    }

    let payload = build_payload(db, group_id)?;
    info!(
        "Validating group {} ({} sites, {} examples)",
        group_id,
        payload.domains_count,
        payload.examples.len()
    );

    let verdict = match validator.validate(&payload).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!("Validator unavailable for group {}: {}", group_id, e);
            return Ok(ValidationOutcome::Abstained {
                group_id,
                reason: e.to_string(),
            });
        }
    };

    apply_verdict(db, group_id, VerdictSource::Agent, &payload, verdict)
}

/// Operator override: accept without asking the validator.
pub fn approve_group(db: &mut Database, group_id: i64, note: Option<&str>) -> Result<ValidationOutcome> {
    let payload = build_payload(db, group_id)?;
    let verdict = Verdict {
        is_valid: true,
        confidence: Confidence::High,
        reasoning: note.unwrap_or("approved manually").to_string(),
    };
    apply_verdict(db, group_id, VerdictSource::Manual, &payload, verdict)
}

/// Operator override: reject and dissolve the group's memberships.
pub fn reject_group(db: &mut Database, group_id: i64, note: Option<&str>) -> Result<ValidationOutcome> {
    let payload = build_payload(db, group_id)?;
    let verdict = Verdict {
        is_valid: false,
        confidence: Confidence::High,
        reasoning: note.unwrap_or("rejected manually").to_string(),
    };
    apply_verdict(db, group_id, VerdictSource::Manual, &payload, verdict)
}

/// Audit row first, then the transition, in one transaction.
fn apply_verdict(
    db: &mut Database,
    group_id: i64,
    source: VerdictSource,
    payload: &ValidationPayload,
    verdict: Verdict,
) -> Result<ValidationOutcome> {
    let tx = db.transaction()?;
    let now = current_timestamp();

    let group = data::query_group(&tx, group_id)?
        .ok_or_else(|| LotmapError::NotFound(format!("group {}", group_id)))?;
    let allowed = match (source, verdict.is_valid) {
        (_, true) => group.status == GroupStatus::Candidate,
        (VerdictSource::Agent, false) => group.status == GroupStatus::Candidate,
        (VerdictSource::Manual, false) => group.status != GroupStatus::Rejected,
    };
    if !allowed {
        return Err(LotmapError::InvalidState(format!(
            "group {} is already {}",
            group_id, group.status
        )));
    }
    // Only a group with members can become validated.
    if verdict.is_valid && group.size == 0 {
        return Err(LotmapError::InvalidState(format!(
            "group {} has no member sites",
            group_id
        )));
    }

    tx.execute(
        "INSERT INTO ai_validations
            (group_id, source, input_payload, output_verdict, is_valid, confidence, reasoning, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            group_id,
            source,
            serde_json::to_string(payload)?,
            serde_json::to_string(&verdict)?,
            verdict.is_valid,
            verdict.confidence,
            &verdict.reasoning,
            now
        ],
    )?;

    let outcome = if verdict.is_valid {
        tx.execute(
            "UPDATE template_groups SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![GroupStatus::Validated, now, group_id],
        )?;
        tx.execute(
            "UPDATE sites SET grouping_status = ?1
             WHERE id IN (SELECT site_id FROM template_group_members WHERE group_id = ?2)",
            params![GroupingStatus::Grouped, group_id],
        )?;
        ValidationOutcome::Validated { group_id, verdict }
    } else {
        let sites_released = tx.execute(
            "UPDATE sites SET grouping_status = ?1, group_id = NULL
             WHERE id IN (SELECT site_id FROM template_group_members WHERE group_id = ?2)",
            params![GroupingStatus::Rejected, group_id],
        )?;
        tx.execute(
            "DELETE FROM template_group_members WHERE group_id = ?1",
            params![group_id],
        )?;
        tx.execute(
            "UPDATE template_groups
             SET status = ?1, size = 0, representative_site_id = NULL, updated_at = ?2
             WHERE id = ?3",
            params![GroupStatus::Rejected, now, group_id],
        )?;
        ValidationOutcome::Rejected {
            group_id,
            verdict,
            sites_released,
        }
    };

    tx.commit()?;

    match &outcome {
        ValidationOutcome::Validated { verdict, .. } => info!(
            "Group {} validated ({}, {} confidence)",
            group_id, source, verdict.confidence
        ),
        ValidationOutcome::Rejected { sites_released, .. } => info!(
            "Group {} rejected ({}), {} sites released",
            group_id, source, sites_released
        ),
        ValidationOutcome::Abstained { .. } => {}
    }
    Ok(outcome)
}
