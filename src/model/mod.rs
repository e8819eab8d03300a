//! Core data model.
//!
//! Cases are overdue invoices waiting for recovery. Agencies are the
//! collection partners that receive them. Performance records are the
//! monthly metrics a score is derived from. Jobs carry allocation and
//! ingestion work through the queue; audit entries record who changed what.

pub mod agency;
pub mod audit;
pub mod case;
pub mod job;
pub mod performance;

pub use agency::{Agency, AgencyId, AgencyStatus, AgencyUpdate, ImportedAgency, NewAgency};
pub use audit::{AuditEntry, AuditScope, NewAuditEntry};
pub use case::{Case, CaseId, CaseStatus, InvoiceRef, NewInvoice, Priority};
pub use job::{Claim, Job, JobId, JobKind, JobState, NewJob};
pub use performance::{Month, PerformanceRecord};
