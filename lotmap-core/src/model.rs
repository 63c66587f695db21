// Domain records and lifecycle states

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares a fieldless enum stored as a lowercase TEXT column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                $name::parse(text).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{}'", stringify!($name), text).into())
                })
            }
        }
    };
}

text_enum!(
    /// Where a site is in the fetch lifecycle.
    DiscoveryStatus {
        Pending => "pending",
        Mapping => "mapping",
        Mapped => "mapped",
        Failed => "failed",
    }
);

text_enum!(
    GroupingStatus {
        Ungrouped => "ungrouped",
        CandidateGrouped => "candidate_grouped",
        Grouped => "grouped",
        Rejected => "rejected",
        Ignored => "ignored",
    }
);

text_enum!(
    RunStatus {
        Running => "running",
        Done => "done",
        Failed => "failed",
    }
);

text_enum!(
    GroupStatus {
        Candidate => "candidate",
        Validated => "validated",
        Rejected => "rejected",
    }
);

text_enum!(
    /// Why a site cannot be grouped. Listed in reporting priority order.
    IneligibleReason {
        MapVazio => "map_vazio",
        SemPadroes => "sem_padroes",
        SemListagem => "sem_listagem",
        SemDetalhe => "sem_detalhe",
    }
);

text_enum!(
    Confidence {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

text_enum!(
    /// Who produced a verdict: the external agent or an operator override.
    VerdictSource {
        Agent => "agent",
        Manual => "manual",
    }
);

impl GroupingStatus {
    /// Statuses under which a site may carry a group reference.
    pub fn allows_group(&self) -> bool {
        matches!(self, GroupingStatus::CandidateGrouped | GroupingStatus::Grouped)
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub domain: String,
    pub name: String,
    pub discovery_status: DiscoveryStatus,
    pub grouping_status: GroupingStatus,
    pub group_id: Option<i64>,
    pub last_mapped_at: Option<i64>,
    pub last_signature_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRun {
    pub id: String,
    pub status: RunStatus,
    pub sites_total: i64,
    pub sites_success: i64,
    pub sites_failed: i64,
    pub concurrency: i64,
    pub rate_limit: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteMap {
    pub id: i64,
    pub run_id: String,
    pub site_id: i64,
    pub urls: Vec<String>,
    pub url_count: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i64,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteTemplate {
    pub id: i64,
    pub run_id: String,
    pub site_id: i64,
    pub template: String,
    pub count: i64,
    pub sample_urls: Vec<String>,
    pub first_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSignature {
    pub id: i64,
    pub run_id: String,
    pub site_id: i64,
    pub listing_templates: Vec<String>,
    pub detail_templates: Vec<String>,
    pub eligible: bool,
    pub reason: Option<IneligibleReason>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateGroup {
    pub id: i64,
    pub signature_hash: String,
    pub listing_template: String,
    pub detail_template: String,
    pub status: GroupStatus,
    pub size: i64,
    pub representative_site_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateGroupMember {
    pub id: i64,
    pub group_id: i64,
    pub site_id: i64,
    pub run_id: String,
    pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiValidation {
    pub id: i64,
    pub group_id: i64,
    pub source: VerdictSource,
    pub input_payload: String,
    pub is_valid: bool,
    pub confidence: Confidence,
    pub reasoning: String,
    pub created_at: i64,
}
