//! Durable job queue boundary and the dispatcher producers use.
//!
//! `JobQueue` is implemented by the Postgres-backed [`crate::db::Db`] and
//! by [`memory::MemoryQueue`] for tests and single-process runs.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::job::validate_transition;
use crate::model::{Claim, Job, JobId, JobKind, JobState, NewJob};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Capacity of the in-process event broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new `QUEUED` job.
    async fn enqueue(&self, new: NewJob) -> Result<Job>;

    /// Atomically claim the oldest `QUEUED` job of one of `kinds`, moving
    /// it to `ACTIVE`, bumping its attempt count and granting a lease.
    async fn claim(&self, kinds: &[JobKind], worker_id: &str, lease: Duration)
    -> Result<Option<Job>>;

    /// `ACTIVE -> COMPLETED` with a result payload. `LeaseLost` when
    /// `claim` no longer holds the job.
    async fn complete(&self, claim: &Claim, result: serde_json::Value) -> Result<Job>;

    /// `ACTIVE -> FAILED`. Retryable failures with attempts left continue
    /// `FAILED -> QUEUED`; the returned job reflects the final state.
    /// `LeaseLost` when `claim` no longer holds the job.
    async fn fail(&self, claim: &Claim, error: &str, retryable: bool) -> Result<Job>;

    /// Push the lease of a held job `lease` into the future.
    async fn renew(&self, claim: &Claim, lease: Duration) -> Result<Job>;

    /// Fail every `ACTIVE` job whose lease has run out (worker crashed or
    /// hung), re-queueing the ones with attempts left.
    async fn recover_expired(&self) -> Result<Vec<Job>>;

    async fn get(&self, id: JobId) -> Result<Job>;

    async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Subscribe to job events (queued, claimed, completed, failed).
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// Producer-side handle: enqueue without waiting on execution.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueue `kind` with `payload`. Returns as soon as the job is durable.
    pub async fn enqueue<I, S>(&self, kind: JobKind, payload: I) -> Result<JobId>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        self.submit(NewJob::new(kind).payload(payload)).await
    }

    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        let kind = new.kind();
        let job = self.queue.enqueue(new).await?;
        metrics::jobs_enqueued().add(1, &[KeyValue::new("kind", kind.to_string())]);
        info!(job.id = %job.id, job.kind = %kind, "job enqueued");
        Ok(job.id)
    }

    /// Convenience for the most common follow-up: a full allocation recompute.
    pub async fn request_allocation(&self, reason: &str) -> Result<JobId> {
        self.enqueue(JobKind::Allocation, ["--reason", reason]).await
    }

    /// Wait until `id` reaches a terminal state, listening on the event
    /// channel and re-reading the job as a fallback.
    pub async fn wait_for_terminal(&self, id: JobId, timeout: Duration) -> Result<Job> {
        let mut events = self.queue.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let job = self.queue.get(id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    operation: format!("waiting for job {id}"),
                    after: timeout,
                });
            }

            // Wake on any event for this job, or re-poll after a short pause
            // in case the event was published before we subscribed.
            let wait = (deadline - now).min(Duration::from_millis(500));
            match tokio::time::timeout(wait, events.recv()).await {
                Ok(Ok(event)) => {
                    if event.kind.job_id() == Some(id) {
                        debug!(
                            job.id = %id,
                            seq = event.seq,
                            terminal = ?event.kind.terminal_state(),
                            "observed job event"
                        );
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "event subscriber lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    tokio::time::sleep(wait).await;
                }
                Err(_) => {}
            }
        }
    }
}

/// Apply `ACTIVE -> FAILED` and, when allowed, `FAILED -> QUEUED`.
pub(crate) fn fail_in_place(job: &mut Job, error: &str, retryable: bool) -> Result<Vec<EventKind>> {
    validate_transition(job.state, JobState::Failed)?;
    let now = Utc::now();
    let retry = retryable && job.attempts_remaining();

    job.state = JobState::Failed;
    job.error = Some(error.to_string());
    job.worker_id = None;
    job.lease_expires_at = None;
    job.updated_at = now;

    let mut kinds = vec![EventKind::JobFailed {
        id: job.id,
        error: error.to_string(),
        retryable,
        attempt: job.attempts,
        terminal: !retry,
    }];

    if retry {
        validate_transition(JobState::Failed, JobState::Queued)?;
        job.state = JobState::Queued;
        kinds.push(EventKind::JobQueued {
            id: job.id,
            kind: job.kind,
            attempt: job.attempts,
        });
    } else {
        job.finished_at = Some(now);
    }
    Ok(kinds)
}
