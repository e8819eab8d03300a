//! Administrative operations: agency lifecycle, performance corrections,
//! bulk migration, manual case handling.
//!
//! Every mutation writes an audit entry. Mutations that can change who
//! should get which case also enqueue an allocation recompute when a
//! dispatcher is configured.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::scoring::{
    PROBATIONARY_SCORE, ScoreSummary, capacity_tier, compute_score, derived_dso,
    synthesize_record,
};
use crate::error::{Error, Result};
use crate::model::performance::validate_percentage;
use crate::model::{
    Agency, AgencyId, AgencyUpdate, Case, CaseId, CaseStatus, ImportedAgency, Month, NewAgency,
    NewAuditEntry, NewInvoice, PerformanceRecord,
};
use crate::queue::Dispatcher;
use crate::store::{AgencyImport, Repository};

/// Months shown on an agency detail view.
pub const DETAIL_MONTHS: usize = 12;

/// An agency with its current standing.
#[derive(Debug, Clone, Serialize)]
pub struct AgencyOverview {
    pub agency: Agency,
    pub summary: ScoreSummary,
    pub committed_load: i32,
}

/// An agency with its recent history, newest-first.
#[derive(Debug, Clone, Serialize)]
pub struct AgencyDetail {
    pub agency: Agency,
    pub summary: ScoreSummary,
    pub committed_load: i32,
    pub history: Vec<PerformanceRecord>,
}

pub struct Admin {
    repo: Arc<dyn Repository>,
    dispatcher: Option<Dispatcher>,
    lookback_months: usize,
}

impl Admin {
    pub fn new(repo: Arc<dyn Repository>, lookback_months: usize) -> Self {
        Self {
            repo,
            dispatcher: None,
            lookback_months,
        }
    }

    /// Enqueue an allocation recompute after relevant mutations.
    pub fn with_recompute(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    // --- agencies ---------------------------------------------------------

    /// Onboard an agency. Without an explicit capacity it starts on the
    /// tier of the probationary score.
    pub async fn onboard_agency(&self, new: NewAgency, actor: &str) -> Result<Agency> {
        let capacity = new.capacity.unwrap_or(capacity_tier(PROBATIONARY_SCORE));
        let agency = self.repo.create_agency(new, capacity).await?;
        self.audit(
            actor,
            "CREATE_AGENCY",
            format!("created agency {} ({}) with capacity {capacity}", agency.name, agency.id),
        )
        .await?;
        self.recompute("agency created").await;
        Ok(agency)
    }

    pub async fn update_agency(
        &self,
        id: &AgencyId,
        update: AgencyUpdate,
        actor: &str,
    ) -> Result<Agency> {
        if update.is_empty() {
            return Err(Error::validation("agency.update", "nothing to update"));
        }
        let agency = self.repo.update_agency(id, update.clone()).await?;
        self.audit(
            actor,
            "UPDATE_AGENCY",
            format!("updated agency {id} with {}", serde_json::to_string(&update)?),
        )
        .await?;
        self.recompute("agency updated").await;
        Ok(agency)
    }

    /// Soft delete. The agency leaves the eligible set; its history and
    /// assigned cases stay.
    pub async fn remove_agency(&self, id: &AgencyId, actor: &str) -> Result<Agency> {
        let agency = self.repo.soft_delete_agency(id).await?;
        self.audit(actor, "DELETE_AGENCY", format!("soft deleted agency {id}"))
            .await?;
        self.recompute("agency removed").await;
        Ok(agency)
    }

    /// Set or correct one month's metrics. DSO is derived from the
    /// recovery rate. Capacity is left alone.
    pub async fn record_performance(
        &self,
        id: &AgencyId,
        month: Month,
        recovery_rate: f64,
        sla_adherence: f64,
        actor: &str,
    ) -> Result<PerformanceRecord> {
        let record = PerformanceRecord {
            agency_id: id.clone(),
            month,
            recovery_rate,
            sla_adherence,
            avg_dso: derived_dso(recovery_rate),
        };
        let record = self.repo.upsert_performance(record).await?;
        self.audit(
            actor,
            "UPDATE_PERFORMANCE",
            format!("updated metrics for {id} in {month}"),
        )
        .await?;
        self.recompute("performance updated").await;
        Ok(record)
    }

    /// Bulk migration. Each entry's `history` is oldest-first with the
    /// last value belonging to the month before `as_of`. Capacity comes
    /// from the entry's score and existing history is replaced.
    pub async fn import_agencies(
        &self,
        entries: Vec<ImportedAgency>,
        as_of: Month,
        actor: &str,
    ) -> Result<Vec<Agency>> {
        // Validate everything before touching anything.
        let imports = entries
            .into_iter()
            .map(|entry| to_import(entry, as_of))
            .collect::<Result<Vec<_>>>()?;

        let mut agencies = Vec::with_capacity(imports.len());
        for import in imports {
            let months = import.history.len();
            let agency = self.repo.import_agency(import).await?;
            self.audit(
                actor,
                "IMPORT_AGENCY",
                format!(
                    "imported agency {} ({}) with capacity {} and {months} months of history",
                    agency.name, agency.id, agency.capacity
                ),
            )
            .await?;
            agencies.push(agency);
        }

        info!(count = agencies.len(), "agencies imported");
        if !agencies.is_empty() {
            self.recompute("agencies imported").await;
        }
        Ok(agencies)
    }

    /// Reset capacity to the tier of the current score. The only path that
    /// overrides an administrator-set capacity without new score data.
    pub async fn recompute_capacity(&self, id: &AgencyId, actor: &str) -> Result<Agency> {
        let history = self.repo.performance_history(id, self.lookback_months).await?;
        let summary = compute_score(&history, self.lookback_months);
        let before = self.repo.get_agency(id).await?.capacity;
        let update = AgencyUpdate {
            capacity: Some(summary.capacity_tier),
            ..Default::default()
        };
        let agency = self.repo.update_agency(id, update).await?;
        self.audit(
            actor,
            "RECOMPUTE_CAPACITY",
            format!(
                "capacity of {id} {before} -> {} from score {}",
                agency.capacity, summary.current_score
            ),
        )
        .await?;
        self.recompute("capacity recomputed").await;
        Ok(agency)
    }

    pub async fn reset_history(&self, id: &AgencyId, actor: &str) -> Result<u64> {
        self.repo.get_agency(id).await?;
        let removed = self.repo.reset_history(id).await?;
        self.audit(
            actor,
            "RESET_HISTORY",
            format!("deleted {removed} performance records of {id}"),
        )
        .await?;
        self.recompute("history reset").await;
        Ok(removed)
    }

    pub async fn agency_overview(&self, include_deleted: bool) -> Result<Vec<AgencyOverview>> {
        let mut overview = Vec::new();
        for agency in self.repo.list_agencies(include_deleted).await? {
            let history = self
                .repo
                .performance_history(&agency.id, self.lookback_months)
                .await?;
            overview.push(AgencyOverview {
                summary: compute_score(&history, self.lookback_months),
                committed_load: self.repo.committed_load(&agency.id).await?,
                agency,
            });
        }
        Ok(overview)
    }

    pub async fn agency_detail(&self, id: &AgencyId) -> Result<AgencyDetail> {
        let agency = self.repo.get_agency(id).await?;
        let history = self.repo.performance_history(id, DETAIL_MONTHS).await?;
        let window = history.len().min(self.lookback_months);
        Ok(AgencyDetail {
            summary: compute_score(&history[..window], self.lookback_months),
            committed_load: self.repo.committed_load(id).await?,
            agency,
            history,
        })
    }

    // --- cases ------------------------------------------------------------

    pub async fn add_case(&self, invoice: NewInvoice) -> Result<Case> {
        let case = self.repo.ingest_invoice(invoice).await?;
        info!(case.id = %case.id, priority = %case.priority, "case created");
        self.recompute("case created").await;
        Ok(case)
    }

    /// Send an assigned case back to the pool.
    pub async fn reassign_case(&self, id: CaseId, actor: &str) -> Result<Case> {
        let current = self.repo.get_case(id).await?;
        let previous = current
            .assigned_agency
            .as_ref()
            .map_or("none".to_string(), |a| a.to_string());
        let entry = NewAuditEntry::for_case(
            id,
            actor,
            "REASSIGN_CASE",
            format!("released from agency {previous}"),
        );
        let case = self.repo.transition_case(id, CaseStatus::Queued, entry).await?;
        self.recompute("case released").await;
        Ok(case)
    }

    pub async fn close_case(&self, id: CaseId, actor: &str) -> Result<Case> {
        let entry = NewAuditEntry::for_case(id, actor, "CLOSE_CASE", "case closed");
        let case = self.repo.transition_case(id, CaseStatus::Closed, entry).await?;
        if case.status == CaseStatus::Closed {
            self.recompute("case closed").await;
        }
        Ok(case)
    }

    // --- internals --------------------------------------------------------

    async fn audit(&self, actor: &str, action: &str, details: String) -> Result<()> {
        self.repo
            .record_audit(NewAuditEntry::system(actor, action, details))
            .await?;
        Ok(())
    }

    /// The mutation is already committed; a failed enqueue is only logged
    /// and the next run picks the change up.
    async fn recompute(&self, reason: &str) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        if let Err(e) = dispatcher.request_allocation(reason).await {
            warn!(reason, error = %e, "failed to enqueue allocation recompute");
        }
    }
}

fn to_import(entry: ImportedAgency, as_of: Month) -> Result<AgencyImport> {
    if entry.name.trim().is_empty() {
        return Err(Error::validation(
            "agency.name",
            format!("agency {} has an empty name", entry.id),
        ));
    }
    validate_percentage("agency.score", entry.score)?;
    for value in &entry.history {
        validate_percentage("agency.history", *value)?;
    }

    let len = entry.history.len() as u32;
    let history = entry
        .history
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let month = as_of.minus_months(len - i as u32);
            synthesize_record(entry.id.clone(), month, *value, *value)
        })
        .collect();

    Ok(AgencyImport {
        capacity: capacity_tier(entry.score),
        region: entry.region.unwrap_or_else(|| "NA".to_string()),
        id: entry.id,
        name: entry.name,
        history,
    })
}
