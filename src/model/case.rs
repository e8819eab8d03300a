//! Cases: overdue invoices tracked for recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agency::AgencyId;
use super::performance::validate_percentage;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaseId(pub Uuid);

impl CaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case priority. Values we don't recognize rank below `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

impl Priority {
    /// Ranking weight: HIGH(3) > MEDIUM(2) > LOW(1) > unknown(0).
    pub fn weight(self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
            Priority::Unknown => 0,
        }
    }

    /// Lenient parse: anything unrecognized becomes `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Priority::High,
            "MEDIUM" => Priority::Medium,
            "LOW" => Priority::Low,
            _ => Priority::Unknown,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    /// Created on invoice ingestion.
    New,
    /// Selected for an allocation run, or handed back for reassignment.
    Queued,
    /// Committed to an agency.
    Assigned,
    Closed,
}

impl CaseStatus {
    pub fn can_transition_to(self, to: CaseStatus) -> bool {
        use CaseStatus::*;
        matches!(
            (self, to),
            (New, Queued)
                | (Queued, Assigned)
                | (Assigned, Queued) // manual reassignment
                | (New, Closed)
                | (Queued, Closed)
                | (Assigned, Closed)
        )
    }

    /// Eligible to be picked up by an allocation run.
    pub fn is_pending(self) -> bool {
        matches!(self, CaseStatus::New | CaseStatus::Queued)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaseStatus::New => "NEW",
            CaseStatus::Queued => "QUEUED",
            CaseStatus::Assigned => "ASSIGNED",
            CaseStatus::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CaseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(CaseStatus::New),
            "QUEUED" => Ok(CaseStatus::Queued),
            "ASSIGNED" => Ok(CaseStatus::Assigned),
            "CLOSED" => Ok(CaseStatus::Closed),
            _ => Err(Error::validation("case.status", format!("unknown status: {s}"))),
        }
    }
}

/// The invoice a case recovers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRef {
    pub id: Uuid,
    pub invoice_number: String,
    pub amount: f64,
    pub customer_name: String,
}

/// A unit of recoverable debt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    /// `None` only when the invoice link is broken; allocation refuses
    /// to run over such a case.
    pub invoice: Option<InvoiceRef>,
    pub priority: Priority,
    /// Derived urgency ("AI score"), 0-100.
    pub urgency_score: f64,
    pub status: CaseStatus,
    pub assigned_agency: Option<AgencyId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    /// Move to `to`, enforcing the lifecycle.
    pub fn transition(&mut self, to: CaseStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::invalid_transition(self.status, to));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Invoice ingestion request. Creates the invoice and its `NEW` case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub amount: f64,
    pub customer_name: String,
    pub priority: Priority,
    pub urgency_score: f64,
}

impl NewInvoice {
    pub fn validate(&self) -> Result<()> {
        if self.invoice_number.trim().is_empty() {
            return Err(Error::validation(
                "invoice.invoice_number",
                "invoice number must not be empty",
            ));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(Error::validation(
                "invoice.amount",
                format!("must be a non-negative number, got {}", self.amount),
            ));
        }
        validate_percentage("case.urgency_score", self.urgency_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_priority_deserializes_to_unknown() {
        let p: Priority = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(p, Priority::Unknown);
        assert_eq!(p.weight(), 0);
        assert_eq!(Priority::parse_lenient("high"), Priority::High);
    }

    #[test]
    fn case_lifecycle_follows_queue_then_assign() {
        assert!(CaseStatus::New.can_transition_to(CaseStatus::Queued));
        assert!(CaseStatus::Queued.can_transition_to(CaseStatus::Assigned));
        assert!(CaseStatus::Assigned.can_transition_to(CaseStatus::Queued));
        assert!(!CaseStatus::New.can_transition_to(CaseStatus::Assigned));
        assert!(!CaseStatus::Closed.can_transition_to(CaseStatus::Queued));
    }

    #[test]
    fn invoice_validation_checks_urgency_range() {
        let invoice = NewInvoice {
            invoice_number: "INV-1001".to_string(),
            amount: 1250.0,
            customer_name: "Acme".to_string(),
            priority: Priority::High,
            urgency_score: 140.0,
        };
        let err = invoice.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { ref field, .. } if field == "case.urgency_score"
        ));
    }
}
