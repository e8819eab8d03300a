//! Persistence boundary for agencies, performance history, cases and the
//! audit trail.
//!
//! Implemented by the Postgres-backed [`crate::db::Db`] and by
//! [`memory::MemoryRepository`]. An allocation run happens inside the
//! repository so snapshot, plan application and audit entries share one
//! atomic unit under the allocation lease.

pub mod memory;

use async_trait::async_trait;

use crate::engine::AllocationReport;
use crate::engine::scoring::DEFAULT_LOOKBACK_MONTHS;
use crate::error::Result;
use crate::model::{
    Agency, AgencyId, AgencyUpdate, AuditEntry, Case, CaseId, CaseStatus, Month, NewAgency,
    NewAuditEntry, NewInvoice, PerformanceRecord,
};

/// Actor recorded on entries written by allocation runs.
pub const ALLOCATOR_ACTOR: &str = "system:allocator";

/// Audit action for an automatic assignment.
pub const AUTO_ALLOCATE: &str = "AUTO_ALLOCATE";

/// Audit action for an assignment handed back because the agency's
/// capacity dropped below its committed load.
pub const RELEASE_OVER_CAPACITY: &str = "RELEASE_OVER_CAPACITY";

/// Knobs for one allocation run.
#[derive(Debug, Clone)]
pub struct AllocationSettings {
    pub lookback_months: usize,
    pub actor: String,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            lookback_months: DEFAULT_LOOKBACK_MONTHS,
            actor: ALLOCATOR_ACTOR.to_string(),
        }
    }
}

/// An agency upserted by bulk migration together with its full history.
#[derive(Debug, Clone)]
pub struct AgencyImport {
    pub id: AgencyId,
    pub name: String,
    /// Used only when the agency is created.
    pub region: String,
    pub capacity: i32,
    /// Replaces any existing history.
    pub history: Vec<PerformanceRecord>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // --- agencies ---------------------------------------------------------

    async fn create_agency(&self, new: NewAgency, capacity: i32) -> Result<Agency>;

    /// Partial update. Setting status back to `ACTIVE` also clears a soft
    /// delete. Capacity may drop below the committed load; the next
    /// allocation run hands back the excess. Never interleaves with a run.
    async fn update_agency(&self, id: &AgencyId, update: AgencyUpdate) -> Result<Agency>;

    /// `INACTIVE` plus a deletion timestamp. Rows are never removed.
    async fn soft_delete_agency(&self, id: &AgencyId) -> Result<Agency>;

    async fn get_agency(&self, id: &AgencyId) -> Result<Agency>;

    /// Ordered by name.
    async fn list_agencies(&self, include_deleted: bool) -> Result<Vec<Agency>>;

    /// Upsert by natural key and replace its history, atomically. Never
    /// interleaves with a run.
    async fn import_agency(&self, import: AgencyImport) -> Result<Agency>;

    /// Cases currently `ASSIGNED` to the agency.
    async fn committed_load(&self, id: &AgencyId) -> Result<i32>;

    // --- performance ------------------------------------------------------

    /// Insert or overwrite the record for (agency, month).
    async fn upsert_performance(&self, record: PerformanceRecord) -> Result<PerformanceRecord>;

    async fn get_performance(&self, id: &AgencyId, month: Month)
    -> Result<Option<PerformanceRecord>>;

    /// Newest-first, at most `limit` records.
    async fn performance_history(
        &self,
        id: &AgencyId,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>>;

    /// Delete every record for the agency. Returns how many went.
    async fn reset_history(&self, id: &AgencyId) -> Result<u64>;

    // --- cases ------------------------------------------------------------

    /// Create the invoice and its `NEW` case.
    async fn ingest_invoice(&self, new: NewInvoice) -> Result<Case>;

    async fn get_case(&self, id: CaseId) -> Result<Case>;

    /// Insertion order.
    async fn list_cases(&self, status: Option<CaseStatus>, limit: usize) -> Result<Vec<Case>>;

    /// Move a case through its lifecycle and write `entry` in the same
    /// unit. Leaving `ASSIGNED` clears the agency reference.
    async fn transition_case(
        &self,
        id: CaseId,
        to: CaseStatus,
        entry: NewAuditEntry,
    ) -> Result<Case>;

    // --- allocation -------------------------------------------------------

    /// Take the allocation lease, snapshot pending cases and agency
    /// standings, plan, and apply the plan with one audit entry per
    /// release and per assignment. Runs never overlap. Afterwards no
    /// agency holds more cases than its capacity.
    async fn run_allocation(&self, settings: &AllocationSettings) -> Result<AllocationReport>;

    // --- audit ------------------------------------------------------------

    async fn record_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry>;

    /// Newest-first. `case` narrows to one case's entries.
    async fn audit_trail(&self, case: Option<CaseId>, limit: usize) -> Result<Vec<AuditEntry>>;
}

pub(crate) fn assignment_details(agency_id: &AgencyId, run_id: uuid::Uuid) -> String {
    format!("assigned to agency {agency_id} by allocation run {run_id}")
}

pub(crate) fn release_details(agency_id: &AgencyId, run_id: uuid::Uuid) -> String {
    format!("released from agency {agency_id}, over capacity, by allocation run {run_id}")
}
