// Listing/detail classification of a site's templates

use crate::model::IneligibleReason;
use crate::template::{ID_PLACEHOLDER, NUM_PLACEHOLDER, segments};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const LISTING_SEQUENCE: [&str; 3] = ["leilao", NUM_PLACEHOLDER, "lotes"];
const LISTING_SEGMENT: &str = "lotes";
const DETAIL_TERMINALS: [&str; 3] = ["detalhes", "show", "info"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub listing: BTreeSet<String>,
    pub detail: BTreeSet<String>,
    pub eligible: bool,
    pub reason: Option<IneligibleReason>,
}

/// A listing page either sits under `leilao/{num}/lotes`, starts with
/// `lotes`, or ends with `lotes` somewhere below a numeric segment.
pub fn is_listing_candidate(template: &str) -> bool {
    let parts = segments(template);

    let has_sequence = parts
        .windows(LISTING_SEQUENCE.len())
        .any(|window| window == LISTING_SEQUENCE);
    let starts_with_lotes = parts.first() == Some(&LISTING_SEGMENT);
    let ends_with_lotes = parts.last() == Some(&LISTING_SEGMENT);
    let has_num = parts.contains(&NUM_PLACEHOLDER);

    has_sequence || starts_with_lotes || (ends_with_lotes && has_num)
}

/// A detail page ends with `detalhes`, `show` or `info` and is keyed by an
/// identifier somewhere in its path.
pub fn is_detail_candidate(template: &str) -> bool {
    let parts = segments(template);

    let detail_terminal = parts
        .last()
        .is_some_and(|last| DETAIL_TERMINALS.contains(last));
    let keyed = parts
        .iter()
        .any(|p| *p == NUM_PLACEHOLDER || *p == ID_PLACEHOLDER);

    detail_terminal && keyed
}

/// Reason precedence: an empty input is always `map_vazio`, never
/// `sem_padroes`.
pub fn ineligible_reason(
    template_count: usize,
    listing_count: usize,
    detail_count: usize,
) -> Option<IneligibleReason> {
    if template_count == 0 {
        Some(IneligibleReason::MapVazio)
    } else if listing_count == 0 && detail_count == 0 {
        Some(IneligibleReason::SemPadroes)
    } else if listing_count == 0 {
        Some(IneligibleReason::SemListagem)
    } else if detail_count == 0 {
        Some(IneligibleReason::SemDetalhe)
    } else {
        None
    }
}

pub fn classify<I, S>(templates: I) -> Classification
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut listing = BTreeSet::new();
    let mut detail = BTreeSet::new();
    let mut total = 0usize;

    for template in templates {
        let template = template.as_ref();
        total += 1;
        if is_listing_candidate(template) {
            listing.insert(template.to_string());
        }
        if is_detail_candidate(template) {
            detail.insert(template.to_string());
        }
    }

    let reason = ineligible_reason(total, listing.len(), detail.len());
    Classification {
        eligible: reason.is_none(),
        listing,
        detail,
        reason,
    }
}
