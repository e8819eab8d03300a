//! In-process repository, mutex-guarded.
//!
//! Holding the mutex for a whole allocation run gives the same guarantee
//! as the Postgres advisory lock: runs are serialized.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::{
    AUTO_ALLOCATE, AgencyImport, AllocationSettings, RELEASE_OVER_CAPACITY, Repository,
    assignment_details, release_details,
};
use crate::engine::{self, AllocationReport, AllocationSnapshot, standing_for};
use crate::error::{Error, Result};
use crate::model::agency::validate_capacity;
use crate::model::{
    Agency, AgencyId, AgencyStatus, AgencyUpdate, AuditEntry, AuditScope, Case, CaseId,
    CaseStatus, InvoiceRef, Month, NewAgency, NewAuditEntry, NewInvoice, PerformanceRecord,
};

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    agencies: BTreeMap<AgencyId, Agency>,
    performance: BTreeMap<(AgencyId, Month), PerformanceRecord>,
    /// Insertion order.
    cases: Vec<Case>,
    audit: Vec<AuditEntry>,
}

impl Inner {
    fn agency_mut(&mut self, id: &AgencyId) -> Result<&mut Agency> {
        self.agencies
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("agency {id}")))
    }

    fn case_mut(&mut self, id: CaseId) -> Result<&mut Case> {
        self.cases
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("case {id}")))
    }

    fn history(&self, id: &AgencyId, limit: usize) -> Vec<PerformanceRecord> {
        self.performance
            .iter()
            .filter(|((agency, _), _)| agency == id)
            .rev()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn load(&self, id: &AgencyId) -> i32 {
        self.cases
            .iter()
            .filter(|c| {
                c.status == CaseStatus::Assigned && c.assigned_agency.as_ref() == Some(id)
            })
            .count() as i32
    }

    fn push_audit(&mut self, entry: NewAuditEntry) -> AuditEntry {
        let stored = AuditEntry {
            id: self.audit.len() as i64 + 1,
            scope: entry.scope,
            actor: entry.actor,
            action: entry.action,
            details: entry.details,
            recorded_at: Utc::now(),
        };
        self.audit.push(stored.clone());
        stored
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("repository mutex poisoned".to_string()))
    }

    /// Insert a case as-is, bypassing invoice validation. Lets tests
    /// reproduce rows a broken import left behind.
    pub fn insert_case_raw(&self, case: Case) -> Result<()> {
        self.lock()?.cases.push(case);
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_agency(&self, new: NewAgency, capacity: i32) -> Result<Agency> {
        new.validate()?;
        validate_capacity(capacity)?;
        let mut inner = self.lock()?;
        let id = new.id.unwrap_or_default();
        if inner.agencies.contains_key(&id) {
            return Err(Error::validation(
                "agency.id",
                format!("agency {id} already exists"),
            ));
        }
        let now = Utc::now();
        let agency = Agency {
            id: id.clone(),
            name: new.name,
            region: new.region,
            capacity,
            status: AgencyStatus::Active,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.agencies.insert(id, agency.clone());
        Ok(agency)
    }

    async fn update_agency(&self, id: &AgencyId, update: AgencyUpdate) -> Result<Agency> {
        update.validate()?;
        let mut inner = self.lock()?;
        let agency = inner.agency_mut(id)?;
        update.apply_to(agency);
        if update.status == Some(AgencyStatus::Active) {
            agency.deleted_at = None;
        }
        agency.updated_at = Utc::now();
        Ok(agency.clone())
    }

    async fn soft_delete_agency(&self, id: &AgencyId) -> Result<Agency> {
        let mut inner = self.lock()?;
        let agency = inner.agency_mut(id)?;
        let now = Utc::now();
        agency.status = AgencyStatus::Inactive;
        agency.deleted_at = Some(now);
        agency.updated_at = now;
        Ok(agency.clone())
    }

    async fn get_agency(&self, id: &AgencyId) -> Result<Agency> {
        let mut inner = self.lock()?;
        inner.agency_mut(id).map(|a| a.clone())
    }

    async fn list_agencies(&self, include_deleted: bool) -> Result<Vec<Agency>> {
        let inner = self.lock()?;
        let mut agencies: Vec<Agency> = inner
            .agencies
            .values()
            .filter(|a| include_deleted || a.deleted_at.is_none())
            .cloned()
            .collect();
        agencies.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(agencies)
    }

    async fn import_agency(&self, import: AgencyImport) -> Result<Agency> {
        validate_capacity(import.capacity)?;
        for record in &import.history {
            record.validate()?;
        }
        let mut inner = self.lock()?;
        let now = Utc::now();
        let agency = inner
            .agencies
            .entry(import.id.clone())
            .and_modify(|a| {
                a.name = import.name.clone();
                a.capacity = import.capacity;
                a.updated_at = now;
            })
            .or_insert_with(|| Agency {
                id: import.id.clone(),
                name: import.name.clone(),
                region: import.region.clone(),
                capacity: import.capacity,
                status: AgencyStatus::Active,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            })
            .clone();

        inner.performance.retain(|(agency, _), _| agency != &import.id);
        for record in import.history {
            inner
                .performance
                .insert((import.id.clone(), record.month), record);
        }
        Ok(agency)
    }

    async fn committed_load(&self, id: &AgencyId) -> Result<i32> {
        Ok(self.lock()?.load(id))
    }

    async fn upsert_performance(&self, record: PerformanceRecord) -> Result<PerformanceRecord> {
        record.validate()?;
        let mut inner = self.lock()?;
        if !inner.agencies.contains_key(&record.agency_id) {
            return Err(Error::NotFound(format!("agency {}", record.agency_id)));
        }
        inner
            .performance
            .insert((record.agency_id.clone(), record.month), record.clone());
        Ok(record)
    }

    async fn get_performance(
        &self,
        id: &AgencyId,
        month: Month,
    ) -> Result<Option<PerformanceRecord>> {
        let inner = self.lock()?;
        Ok(inner.performance.get(&(id.clone(), month)).cloned())
    }

    async fn performance_history(
        &self,
        id: &AgencyId,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>> {
        Ok(self.lock()?.history(id, limit))
    }

    async fn reset_history(&self, id: &AgencyId) -> Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.performance.len();
        inner.performance.retain(|(agency, _), _| agency != id);
        Ok((before - inner.performance.len()) as u64)
    }

    async fn ingest_invoice(&self, new: NewInvoice) -> Result<Case> {
        new.validate()?;
        let mut inner = self.lock()?;
        let duplicate = inner.cases.iter().any(|c| {
            c.invoice
                .as_ref()
                .is_some_and(|i| i.invoice_number == new.invoice_number)
        });
        if duplicate {
            return Err(Error::validation(
                "invoice.invoice_number",
                format!("invoice {} already exists", new.invoice_number),
            ));
        }
        let now = Utc::now();
        let case = Case {
            id: CaseId::new(),
            invoice: Some(InvoiceRef {
                id: Uuid::new_v4(),
                invoice_number: new.invoice_number,
                amount: new.amount,
                customer_name: new.customer_name,
            }),
            priority: new.priority,
            urgency_score: new.urgency_score,
            status: CaseStatus::New,
            assigned_agency: None,
            created_at: now,
            updated_at: now,
        };
        inner.cases.push(case.clone());
        Ok(case)
    }

    async fn get_case(&self, id: CaseId) -> Result<Case> {
        let mut inner = self.lock()?;
        inner.case_mut(id).map(|c| c.clone())
    }

    async fn list_cases(&self, status: Option<CaseStatus>, limit: usize) -> Result<Vec<Case>> {
        let inner = self.lock()?;
        Ok(inner
            .cases
            .iter()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn transition_case(
        &self,
        id: CaseId,
        to: CaseStatus,
        entry: NewAuditEntry,
    ) -> Result<Case> {
        let mut inner = self.lock()?;
        let case = inner.case_mut(id)?;
        let from = case.status;
        case.transition(to)?;
        if from == CaseStatus::Assigned {
            case.assigned_agency = None;
        }
        let case = case.clone();
        inner.push_audit(entry);
        Ok(case)
    }

    async fn run_allocation(&self, settings: &AllocationSettings) -> Result<AllocationReport> {
        let mut inner = self.lock()?;

        let agencies = inner
            .agencies
            .values()
            .map(|agency| {
                let history = inner.history(&agency.id, settings.lookback_months);
                standing_for(agency, &history, inner.load(&agency.id), settings.lookback_months)
            })
            .collect();
        let cases: Vec<Case> = inner
            .cases
            .iter()
            .filter(|c| c.status.is_pending() || c.status == CaseStatus::Assigned)
            .cloned()
            .collect();
        let snapshot = AllocationSnapshot { cases, agencies };

        let plan = engine::plan(&snapshot)?;
        let report = AllocationReport::new(plan);

        // Apply: releases first, every candidate is then QUEUED and
        // assignments move on from there.
        for release in &report.released {
            let case = inner.case_mut(release.case_id)?;
            case.transition(CaseStatus::Queued)?;
            case.assigned_agency = None;
            inner.push_audit(NewAuditEntry {
                scope: AuditScope::Case(release.case_id),
                actor: settings.actor.clone(),
                action: RELEASE_OVER_CAPACITY.to_string(),
                details: release_details(&release.agency_id, report.run_id),
            });
        }
        for candidate in &snapshot.cases {
            let case = inner.case_mut(candidate.id)?;
            if case.status == CaseStatus::New {
                case.transition(CaseStatus::Queued)?;
            }
        }
        for assignment in &report.assignments {
            let case = inner.case_mut(assignment.case_id)?;
            case.transition(CaseStatus::Assigned)?;
            case.assigned_agency = Some(assignment.agency_id.clone());
            inner.push_audit(NewAuditEntry {
                scope: AuditScope::Case(assignment.case_id),
                actor: settings.actor.clone(),
                action: AUTO_ALLOCATE.to_string(),
                details: assignment_details(&assignment.agency_id, report.run_id),
            });
        }

        info!(
            run_id = %report.run_id,
            considered = report.considered,
            released = report.released.len(),
            assigned = report.assignments.len(),
            unassignable = report.unassignable.len(),
            "allocation run applied"
        );
        Ok(report)
    }

    async fn record_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        Ok(self.lock()?.push_audit(entry))
    }

    async fn audit_trail(&self, case: Option<CaseId>, limit: usize) -> Result<Vec<AuditEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|e| case.is_none() || e.scope.case_id() == case)
            .take(limit)
            .cloned()
            .collect())
    }
}
