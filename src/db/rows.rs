//! Internal row types for `sqlx::FromRow` and shared statements.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use sqlx::types::Json;
use uuid::Uuid;

use super::EVENT_CHANNEL;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{
    Agency, AgencyId, AuditEntry, AuditScope, Case, CaseId, InvoiceRef, Job, JobId,
    NewAuditEntry, PerformanceRecord, Priority,
};

/// NOTIFY payloads are capped at 8000 bytes; keep error text well under.
const EVENT_ERROR_LIMIT: usize = 1000;

pub(super) const JOB_COLUMNS: &str = "id, kind, payload, state, attempts, max_attempts, worker_id, \
     lease_expires_at, result, error, created_at, updated_at, finished_at";

pub(super) const AGENCY_COLUMNS: &str =
    "id, name, region, capacity, status, deleted_at, created_at, updated_at";

pub(super) const CASE_SELECT: &str = "SELECT c.id, c.priority, c.urgency_score, c.status, \
     c.assigned_agency_id, c.created_at, c.updated_at, i.id AS invoice_id, i.invoice_number, \
     i.amount, i.customer_name \
     FROM cases c LEFT JOIN invoices i ON i.id = c.invoice_id";

pub(super) const PERFORMANCE_COLUMNS: &str =
    "agency_id, month, recovery_rate, sla_adherence, avg_dso";

#[derive(sqlx::FromRow)]
pub(super) struct JobRow {
    id: Uuid,
    kind: String,
    payload: Json<Vec<String>>,
    state: String,
    attempts: i32,
    max_attempts: i32,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub(super) fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            kind: self.kind.parse()?,
            payload: self.payload.0,
            state: self.state.parse()?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            worker_id: self.worker_id,
            lease_expires_at: self.lease_expires_at,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct AgencyRow {
    id: String,
    name: String,
    region: String,
    capacity: i32,
    status: String,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AgencyRow {
    pub(super) fn try_into_agency(self) -> Result<Agency> {
        Ok(Agency {
            id: AgencyId(self.id),
            name: self.name,
            region: self.region,
            capacity: self.capacity,
            status: self.status.parse()?,
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct CaseRow {
    id: Uuid,
    priority: String,
    urgency_score: f64,
    status: String,
    assigned_agency_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    invoice_id: Option<Uuid>,
    invoice_number: Option<String>,
    amount: Option<f64>,
    customer_name: Option<String>,
}

impl CaseRow {
    pub(super) fn try_into_case(self) -> Result<Case> {
        // A dangling or missing invoice comes back as NULL columns.
        let columns = (self.invoice_id, self.invoice_number, self.amount, self.customer_name);
        let invoice = match columns {
            (Some(id), Some(invoice_number), Some(amount), Some(customer_name)) => Some(InvoiceRef {
                id,
                invoice_number,
                amount,
                customer_name,
            }),
            _ => None,
        };
        Ok(Case {
            id: CaseId(self.id),
            invoice,
            priority: Priority::parse_lenient(&self.priority),
            urgency_score: self.urgency_score,
            status: self.status.parse()?,
            assigned_agency: self.assigned_agency_id.map(AgencyId),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct PerformanceRow {
    agency_id: String,
    month: String,
    recovery_rate: f64,
    sla_adherence: f64,
    avg_dso: f64,
}

impl PerformanceRow {
    pub(super) fn try_into_record(self) -> Result<PerformanceRecord> {
        Ok(PerformanceRecord {
            agency_id: AgencyId(self.agency_id),
            month: self.month.parse()?,
            recovery_rate: self.recovery_rate,
            sla_adherence: self.sla_adherence,
            avg_dso: self.avg_dso,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct AuditRow {
    id: i64,
    case_id: Option<Uuid>,
    actor: String,
    action: String,
    details: String,
    recorded_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        AuditEntry {
            id: row.id,
            scope: AuditScope::from_case_id(row.case_id.map(CaseId)),
            actor: row.actor,
            action: row.action,
            details: row.details,
            recorded_at: row.recorded_at,
        }
    }
}

pub(super) async fn insert_audit(
    conn: &mut PgConnection,
    entry: &NewAuditEntry,
) -> Result<AuditEntry> {
    let row: AuditRow = sqlx::query_as(
        "INSERT INTO audit_log (case_id, actor, action, details)
         VALUES ($1, $2, $3, $4)
         RETURNING id, case_id, actor, action, details, recorded_at",
    )
    .bind(entry.scope.case_id().map(|c| c.0))
    .bind(&entry.actor)
    .bind(&entry.action)
    .bind(&entry.details)
    .fetch_one(conn)
    .await?;
    Ok(row.into())
}

/// Persist a job's mutable columns after an in-memory transition.
pub(super) async fn store_job(conn: &mut PgConnection, job: &Job) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET state = $2, attempts = $3, worker_id = $4, lease_expires_at = $5,
                result = $6, error = $7, updated_at = $8, finished_at = $9
         WHERE id = $1",
    )
    .bind(job.id.0)
    .bind(job.state.to_string())
    .bind(job.attempts as i32)
    .bind(&job.worker_id)
    .bind(job.lease_expires_at)
    .bind(&job.result)
    .bind(&job.error)
    .bind(job.updated_at)
    .bind(job.finished_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Append to `job_events` and NOTIFY. Delivered on commit.
pub(super) async fn record_event(conn: &mut PgConnection, kind: EventKind) -> Result<Event> {
    let kind = match kind {
        EventKind::JobFailed {
            id,
            error,
            retryable,
            attempt,
            terminal,
        } => EventKind::JobFailed {
            id,
            error: truncate(error, EVENT_ERROR_LIMIT),
            retryable,
            attempt,
            terminal,
        },
        other => other,
    };
    let job_id = kind
        .job_id()
        .ok_or_else(|| Error::Other("refusing to record an event without a job".to_string()))?;

    let (seq, recorded_at): (i64, DateTime<Utc>) = sqlx::query_as(
        "INSERT INTO job_events (job_id, event) VALUES ($1, $2) RETURNING seq, recorded_at",
    )
    .bind(job_id.0)
    .bind(Json(&kind))
    .fetch_one(&mut *conn)
    .await?;

    let event = Event {
        seq: seq as u64,
        timestamp: recorded_at,
        kind,
    };
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(EVENT_CHANNEL)
        .bind(serde_json::to_string(&event)?)
        .execute(&mut *conn)
        .await?;
    Ok(event)
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(10);
        let cut = truncate(text, 5);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.trim_end_matches("...").chars().count(), 2);
    }

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate("boom".to_string(), 10), "boom");
    }
}
