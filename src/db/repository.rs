//! Domain persistence on Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

use super::Db;
use super::rows::{
    AGENCY_COLUMNS, AgencyRow, AuditRow, CASE_SELECT, CaseRow, PERFORMANCE_COLUMNS,
    PerformanceRow, insert_audit,
};
use crate::engine::{self, AllocationReport, AllocationSnapshot, standing_for};
use crate::error::{Error, Result};
use crate::model::agency::validate_capacity;
use crate::model::{
    Agency, AgencyId, AgencyStatus, AgencyUpdate, AuditEntry, AuditScope, Case, CaseId,
    CaseStatus, Month, NewAgency, NewAuditEntry, NewInvoice, PerformanceRecord,
};
use crate::store::{
    AUTO_ALLOCATE, AgencyImport, AllocationSettings, RELEASE_OVER_CAPACITY, Repository,
    assignment_details, release_details,
};

/// Advisory lock key guarding allocation runs. One global lease: cases
/// carry no region to shard by.
const ALLOCATION_LOCK: &str = "caseflow:allocation:global";

/// Take the allocation lease for the rest of the transaction. Runs and
/// capacity writes both hold it, so a run never sees capacity change under
/// it and a concurrent run waits here.
async fn lock_allocation(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(ALLOCATION_LOCK)
        .execute(conn)
        .await?;
    Ok(())
}

async fn fetch_agency(conn: &mut PgConnection, id: &AgencyId, lock: bool) -> Result<Agency> {
    let suffix = if lock { " FOR UPDATE" } else { "" };
    let row: Option<AgencyRow> = sqlx::query_as(&format!(
        "SELECT {AGENCY_COLUMNS} FROM agencies WHERE id = $1{suffix}"
    ))
    .bind(id.as_str())
    .fetch_optional(conn)
    .await?;
    row.ok_or_else(|| Error::NotFound(format!("agency {id}")))?
        .try_into_agency()
}

async fn fetch_case(conn: &mut PgConnection, id: CaseId, lock: bool) -> Result<Case> {
    let suffix = if lock { " FOR UPDATE OF c" } else { "" };
    let row: Option<CaseRow> = sqlx::query_as(&format!("{CASE_SELECT} WHERE c.id = $1{suffix}"))
        .bind(id.0)
        .fetch_optional(conn)
        .await?;
    row.ok_or_else(|| Error::NotFound(format!("case {id}")))?
        .try_into_case()
}

async fn insert_record(conn: &mut PgConnection, record: &PerformanceRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO performance_records (agency_id, month, recovery_rate, sla_adherence, avg_dso)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (agency_id, month) DO UPDATE
         SET recovery_rate = EXCLUDED.recovery_rate,
             sla_adherence = EXCLUDED.sla_adherence,
             avg_dso = EXCLUDED.avg_dso",
    )
    .bind(record.agency_id.as_str())
    .bind(record.month.to_string())
    .bind(record.recovery_rate)
    .bind(record.sla_adherence)
    .bind(record.avg_dso)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Repository for Db {
    async fn create_agency(&self, new: NewAgency, capacity: i32) -> Result<Agency> {
        new.validate()?;
        validate_capacity(capacity)?;
        let id = new.id.unwrap_or_default();

        let row: Option<AgencyRow> = sqlx::query_as(&format!(
            "INSERT INTO agencies (id, name, region, capacity, status)
             VALUES ($1, $2, $3, $4, 'ACTIVE')
             ON CONFLICT (id) DO NOTHING
             RETURNING {AGENCY_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(&new.name)
        .bind(&new.region)
        .bind(capacity)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::validation("agency.id", format!("agency {id} already exists")))?
            .try_into_agency()
    }

    async fn update_agency(&self, id: &AgencyId, update: AgencyUpdate) -> Result<Agency> {
        update.validate()?;
        let mut tx = self.pool.begin().await?;
        if update.capacity.is_some() {
            lock_allocation(&mut tx).await?;
        }
        let mut agency = fetch_agency(&mut tx, id, true).await?;
        update.apply_to(&mut agency);
        if update.status == Some(AgencyStatus::Active) {
            agency.deleted_at = None;
        }

        let row: AgencyRow = sqlx::query_as(&format!(
            "UPDATE agencies
             SET name = $2, region = $3, capacity = $4, status = $5, deleted_at = $6,
                 updated_at = now()
             WHERE id = $1
             RETURNING {AGENCY_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(&agency.name)
        .bind(&agency.region)
        .bind(agency.capacity)
        .bind(agency.status.to_string())
        .bind(agency.deleted_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into_agency()
    }

    async fn soft_delete_agency(&self, id: &AgencyId) -> Result<Agency> {
        let row: Option<AgencyRow> = sqlx::query_as(&format!(
            "UPDATE agencies
             SET status = 'INACTIVE', deleted_at = now(), updated_at = now()
             WHERE id = $1
             RETURNING {AGENCY_COLUMNS}"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("agency {id}")))?
            .try_into_agency()
    }

    async fn get_agency(&self, id: &AgencyId) -> Result<Agency> {
        let mut conn = self.pool.acquire().await?;
        fetch_agency(&mut conn, id, false).await
    }

    async fn list_agencies(&self, include_deleted: bool) -> Result<Vec<Agency>> {
        let rows: Vec<AgencyRow> = sqlx::query_as(&format!(
            "SELECT {AGENCY_COLUMNS} FROM agencies
             WHERE $1 OR deleted_at IS NULL
             ORDER BY name, id"
        ))
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AgencyRow::try_into_agency).collect()
    }

    async fn import_agency(&self, import: AgencyImport) -> Result<Agency> {
        validate_capacity(import.capacity)?;
        for record in &import.history {
            record.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        lock_allocation(&mut tx).await?;

        let row: AgencyRow = sqlx::query_as(&format!(
            "INSERT INTO agencies (id, name, region, capacity, status)
             VALUES ($1, $2, $3, $4, 'ACTIVE')
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name, capacity = EXCLUDED.capacity, updated_at = now()
             RETURNING {AGENCY_COLUMNS}"
        ))
        .bind(import.id.as_str())
        .bind(&import.name)
        .bind(&import.region)
        .bind(import.capacity)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM performance_records WHERE agency_id = $1")
            .bind(import.id.as_str())
            .execute(&mut *tx)
            .await?;
        for record in &import.history {
            insert_record(&mut tx, record).await?;
        }

        tx.commit().await?;
        row.try_into_agency()
    }

    async fn committed_load(&self, id: &AgencyId) -> Result<i32> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cases WHERE status = 'ASSIGNED' AND assigned_agency_id = $1",
        )
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as i32)
    }

    async fn upsert_performance(&self, record: PerformanceRecord) -> Result<PerformanceRecord> {
        record.validate()?;
        let mut tx = self.pool.begin().await?;
        fetch_agency(&mut tx, &record.agency_id, false).await?;
        insert_record(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get_performance(
        &self,
        id: &AgencyId,
        month: Month,
    ) -> Result<Option<PerformanceRecord>> {
        let row: Option<PerformanceRow> = sqlx::query_as(&format!(
            "SELECT {PERFORMANCE_COLUMNS} FROM performance_records
             WHERE agency_id = $1 AND month = $2"
        ))
        .bind(id.as_str())
        .bind(month.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(PerformanceRow::try_into_record).transpose()
    }

    async fn performance_history(
        &self,
        id: &AgencyId,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>> {
        let rows: Vec<PerformanceRow> = sqlx::query_as(&format!(
            "SELECT {PERFORMANCE_COLUMNS} FROM performance_records
             WHERE agency_id = $1
             ORDER BY month DESC
             LIMIT $2"
        ))
        .bind(id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PerformanceRow::try_into_record).collect()
    }

    async fn reset_history(&self, id: &AgencyId) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM performance_records WHERE agency_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn ingest_invoice(&self, new: NewInvoice) -> Result<Case> {
        new.validate()?;
        let mut tx = self.pool.begin().await?;

        let invoice_id: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO invoices (id, invoice_number, amount, customer_name)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (invoice_number) DO NOTHING
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(&new.invoice_number)
        .bind(new.amount)
        .bind(&new.customer_name)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((invoice_id,)) = invoice_id else {
            return Err(Error::validation(
                "invoice.invoice_number",
                format!("invoice {} already exists", new.invoice_number),
            ));
        };

        let case_id = CaseId::new();
        sqlx::query(
            "INSERT INTO cases (id, invoice_id, priority, urgency_score, status)
             VALUES ($1, $2, $3, $4, 'NEW')",
        )
        .bind(case_id.0)
        .bind(invoice_id)
        .bind(new.priority.to_string())
        .bind(new.urgency_score)
        .execute(&mut *tx)
        .await?;

        let case = fetch_case(&mut tx, case_id, false).await?;
        tx.commit().await?;
        Ok(case)
    }

    async fn get_case(&self, id: CaseId) -> Result<Case> {
        let mut conn = self.pool.acquire().await?;
        fetch_case(&mut conn, id, false).await
    }

    async fn list_cases(&self, status: Option<CaseStatus>, limit: usize) -> Result<Vec<Case>> {
        let rows: Vec<CaseRow> = sqlx::query_as(&format!(
            "{CASE_SELECT}
             WHERE ($1::text IS NULL OR c.status = $1)
             ORDER BY c.seq
             LIMIT $2"
        ))
        .bind(status.map(|s| s.to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CaseRow::try_into_case).collect()
    }

    async fn transition_case(
        &self,
        id: CaseId,
        to: CaseStatus,
        entry: NewAuditEntry,
    ) -> Result<Case> {
        let mut tx = self.pool.begin().await?;
        let mut case = fetch_case(&mut tx, id, true).await?;
        let from = case.status;
        case.transition(to)?;
        if from == CaseStatus::Assigned {
            case.assigned_agency = None;
        }

        sqlx::query(
            "UPDATE cases SET status = $2, assigned_agency_id = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(case.status.to_string())
        .bind(case.assigned_agency.as_ref().map(AgencyId::as_str))
        .execute(&mut *tx)
        .await?;
        insert_audit(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(case)
    }

    async fn run_allocation(&self, settings: &AllocationSettings) -> Result<AllocationReport> {
        let mut tx = self.pool.begin().await?;
        lock_allocation(&mut tx).await?;

        let agencies: Vec<AgencyRow> =
            sqlx::query_as(&format!("SELECT {AGENCY_COLUMNS} FROM agencies ORDER BY id"))
                .fetch_all(&mut *tx)
                .await?;

        let records: Vec<PerformanceRow> = sqlx::query_as(&format!(
            "SELECT {PERFORMANCE_COLUMNS} FROM performance_records ORDER BY agency_id, month DESC"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let mut history: HashMap<AgencyId, Vec<PerformanceRecord>> = HashMap::new();
        for row in records {
            let record = row.try_into_record()?;
            history.entry(record.agency_id.clone()).or_default().push(record);
        }

        let loads: Vec<(String, i64)> = sqlx::query_as(
            "SELECT assigned_agency_id, COUNT(*) FROM cases
             WHERE status = 'ASSIGNED' AND assigned_agency_id IS NOT NULL
             GROUP BY assigned_agency_id",
        )
        .fetch_all(&mut *tx)
        .await?;
        let loads: HashMap<String, i64> = loads.into_iter().collect();

        let mut standings = Vec::with_capacity(agencies.len());
        for row in agencies {
            let agency = row.try_into_agency()?;
            let records = history.get(&agency.id).map_or(&[][..], Vec::as_slice);
            let window = &records[..records.len().min(settings.lookback_months)];
            let load = loads.get(agency.id.as_str()).copied().unwrap_or(0) as i32;
            standings.push(standing_for(&agency, window, load, settings.lookback_months));
        }

        let over_capacity: Vec<String> = standings
            .iter()
            .filter(|s| s.committed_load > s.capacity)
            .map(|s| s.agency_id.as_str().to_string())
            .collect();

        let cases: Vec<CaseRow> = sqlx::query_as(&format!(
            "{CASE_SELECT}
             WHERE c.status IN ('NEW', 'QUEUED')
                OR (c.status = 'ASSIGNED' AND c.assigned_agency_id = ANY($1))
             ORDER BY c.seq
             FOR UPDATE OF c"
        ))
        .bind(&over_capacity)
        .fetch_all(&mut *tx)
        .await?;
        let cases = cases
            .into_iter()
            .map(CaseRow::try_into_case)
            .collect::<Result<Vec<_>>>()?;

        let snapshot = AllocationSnapshot {
            cases,
            agencies: standings,
        };
        let plan = engine::plan(&snapshot)?;
        let report = AllocationReport::new(plan);

        for release in &report.released {
            let updated = sqlx::query(
                "UPDATE cases SET status = 'QUEUED', assigned_agency_id = NULL, updated_at = now()
                 WHERE id = $1 AND status = 'ASSIGNED' AND assigned_agency_id = $2",
            )
            .bind(release.case_id.0)
            .bind(release.agency_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated != 1 {
                return Err(Error::invalid_transition("not assigned", CaseStatus::Queued));
            }
            insert_audit(
                &mut tx,
                &NewAuditEntry {
                    scope: AuditScope::Case(release.case_id),
                    actor: settings.actor.clone(),
                    action: RELEASE_OVER_CAPACITY.to_string(),
                    details: release_details(&release.agency_id, report.run_id),
                },
            )
            .await?;
        }

        let fresh: Vec<Uuid> = snapshot
            .cases
            .iter()
            .filter(|c| c.status == CaseStatus::New)
            .map(|c| c.id.0)
            .collect();
        sqlx::query(
            "UPDATE cases SET status = 'QUEUED', updated_at = now()
             WHERE status = 'NEW' AND id = ANY($1)",
        )
        .bind(&fresh)
        .execute(&mut *tx)
        .await?;

        for assignment in &report.assignments {
            let updated = sqlx::query(
                "UPDATE cases SET status = 'ASSIGNED', assigned_agency_id = $2, updated_at = now()
                 WHERE id = $1 AND status = 'QUEUED'",
            )
            .bind(assignment.case_id.0)
            .bind(assignment.agency_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated != 1 {
                // Rolls back the whole run.
                return Err(Error::invalid_transition("not pending", CaseStatus::Assigned));
            }
            insert_audit(
                &mut tx,
                &NewAuditEntry {
                    scope: AuditScope::Case(assignment.case_id),
                    actor: settings.actor.clone(),
                    action: AUTO_ALLOCATE.to_string(),
                    details: assignment_details(&assignment.agency_id, report.run_id),
                },
            )
            .await?;
        }

        tx.commit().await?;
        info!(
            run_id = %report.run_id,
            considered = report.considered,
            released = report.released.len(),
            assigned = report.assignments.len(),
            unassignable = report.unassignable.len(),
            "allocation run committed"
        );
        Ok(report)
    }

    async fn record_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(&mut conn, &entry).await
    }

    async fn audit_trail(&self, case: Option<CaseId>, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, case_id, actor, action, details, recorded_at FROM audit_log
             WHERE ($1::uuid IS NULL OR case_id = $1)
             ORDER BY id DESC
             LIMIT $2",
        )
        .bind(case.map(|c| c.0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }
}
