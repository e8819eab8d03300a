//! Audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::case::CaseId;

/// What an audit entry is attached to. Administrative actions on agencies
/// have no case; they are system-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "case_id", rename_all = "snake_case")]
pub enum AuditScope {
    Case(CaseId),
    System,
}

impl AuditScope {
    pub fn case_id(&self) -> Option<CaseId> {
        match self {
            AuditScope::Case(id) => Some(*id),
            AuditScope::System => None,
        }
    }

    pub fn from_case_id(case_id: Option<CaseId>) -> Self {
        case_id.map_or(AuditScope::System, AuditScope::Case)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub scope: AuditScope,
    pub actor: String,
    /// e.g. `AUTO_ALLOCATE`, `UPDATE_AGENCY`.
    pub action: String,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub scope: AuditScope,
    pub actor: String,
    pub action: String,
    pub details: String,
}

impl NewAuditEntry {
    pub fn system(
        actor: impl Into<String>,
        action: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            scope: AuditScope::System,
            actor: actor.into(),
            action: action.into(),
            details: details.into(),
        }
    }

    pub fn for_case(
        case_id: CaseId,
        actor: impl Into<String>,
        action: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            scope: AuditScope::Case(case_id),
            actor: actor.into(),
            action: action.into(),
            details: details.into(),
        }
    }
}
