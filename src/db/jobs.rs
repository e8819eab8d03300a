//! Durable job queue on Postgres.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never take
//! the same job. Outcomes and renewals are checked against the claim
//! under the row lock. Every transition appends to `job_events` and
//! notifies in the same transaction.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use tokio::sync::broadcast;
use tracing::debug;

use super::Db;
use super::rows::{JOB_COLUMNS, JobRow, record_event, store_job};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{Claim, Job, JobId, JobKind, JobState, NewJob};
use crate::queue::{JobQueue, fail_in_place};

const RECOVERED_ERROR: &str = "lease expired before completion";

impl Db {
    async fn lock_job(&self, tx: &mut sqlx::PgConnection, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    /// Lock the claimed job and make sure `claim` still holds it.
    async fn lock_held(&self, tx: &mut sqlx::PgConnection, claim: &Claim) -> Result<Job> {
        let job = self.lock_job(tx, claim.id).await?;
        claim.check(&job)?;
        Ok(job)
    }
}

#[async_trait]
impl JobQueue for Db {
    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let job = new.into_job(self.default_max_attempts);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO jobs
                 (id, kind, payload, state, attempts, max_attempts, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, $5, $6, $6)",
        )
        .bind(job.id.0)
        .bind(job.kind.to_string())
        .bind(Json(&job.payload))
        .bind(job.state.to_string())
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        record_event(
            &mut tx,
            EventKind::JobQueued {
                id: job.id,
                kind: job.kind,
                attempt: 0,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn claim(
        &self,
        kinds: &[JobKind],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let kinds: Vec<String> = kinds.iter().map(ToString::to_string).collect();
        let mut tx = self.pool.begin().await?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET state = 'ACTIVE', attempts = attempts + 1, worker_id = $2,
                 lease_expires_at = now() + make_interval(secs => $3), updated_at = now()
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state = 'QUEUED' AND kind = ANY($1)
                 ORDER BY seq
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&kinds)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let job = row.try_into_job()?;

        record_event(
            &mut tx,
            EventKind::JobClaimed {
                id: job.id,
                worker_id: worker_id.to_string(),
                attempt: job.attempts,
            },
        )
        .await?;
        tx.commit().await?;
        debug!(job.id = %job.id, attempt = job.attempts, "job claimed");
        Ok(Some(job))
    }

    async fn complete(&self, claim: &Claim, result: serde_json::Value) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = self.lock_held(&mut tx, claim).await?;
        crate::model::job::validate_transition(job.state, JobState::Completed)?;

        let now = chrono::Utc::now();
        job.state = JobState::Completed;
        job.result = Some(result);
        job.error = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        store_job(&mut tx, &job).await?;

        record_event(
            &mut tx,
            EventKind::JobCompleted {
                id: job.id,
                attempt: job.attempts,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn fail(&self, claim: &Claim, error: &str, retryable: bool) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = self.lock_held(&mut tx, claim).await?;
        let kinds = fail_in_place(&mut job, error, retryable)?;
        store_job(&mut tx, &job).await?;
        for kind in kinds {
            record_event(&mut tx, kind).await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn renew(&self, claim: &Claim, lease: Duration) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs
             SET lease_expires_at = now() + make_interval(secs => $4), updated_at = now()
             WHERE id = $1 AND state = 'ACTIVE' AND worker_id = $2 AND attempts = $3
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(claim.id.0)
        .bind(&claim.worker_id)
        .bind(claim.attempt as i32)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row.try_into_job(),
            None => Err(Error::LeaseLost {
                job: claim.id.to_string(),
                attempt: claim.attempt,
            }),
        }
    }

    async fn recover_expired(&self) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE state = 'ACTIVE' AND lease_expires_at <= now()
             ORDER BY seq
             FOR UPDATE SKIP LOCKED"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = row.try_into_job()?;
            let kinds = fail_in_place(&mut job, RECOVERED_ERROR, true)?;
            store_job(&mut tx, &job).await?;
            for kind in kinds {
                record_event(&mut tx, kind).await?;
            }
            recovered.push(job);
        }
        tx.commit().await?;
        Ok(recovered)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR state = $1) AND ($2::text IS NULL OR kind = $2)
             ORDER BY seq DESC
             LIMIT $3"
        ))
        .bind(state.map(|s| s.to_string()))
        .bind(kind.map(|k| k.to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
