//! In-process job queue.
//!
//! Same semantics as the Postgres queue, held in a mutex. State does not
//! survive a restart, so this is for tests and single-process runs.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use super::{EVENT_CHANNEL_CAPACITY, JobQueue, fail_in_place};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::job::{DEFAULT_MAX_ATTEMPTS, validate_transition};
use crate::model::{Claim, Job, JobId, JobKind, JobState, NewJob};

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Event>,
    default_max_attempts: u32,
}

struct Inner {
    /// Insertion order is FIFO order.
    jobs: Vec<Job>,
    seq: u64,
    events: broadcast::Sender<Event>,
}

impl Inner {
    fn find_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// Number and send under the lock, so subscribers see `seq` in order.
    fn emit(&mut self, kind: EventKind) {
        self.seq += 1;
        // No subscribers is fine.
        let _ = self.events.send(Event {
            seq: self.seq,
            timestamp: Utc::now(),
            kind,
        });
    }

    fn held_mut(&mut self, claim: &Claim) -> Result<&mut Job> {
        let job = self.find_mut(claim.id)?;
        claim.check(job)?;
        Ok(job)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    /// Retry ceiling for jobs that don't set their own.
    pub fn with_max_attempts(default_max_attempts: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                jobs: Vec::new(),
                seq: 0,
                events: events.clone(),
            }),
            events,
            default_max_attempts,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("job queue mutex poisoned".to_string()))
    }

    /// Force a job's lease into the past, as if its worker had died.
    pub fn expire_lease(&self, id: JobId) -> Result<()> {
        let mut inner = self.lock()?;
        let job = inner.find_mut(id)?;
        job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        Ok(())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_duration(lease: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(lease)
        .map_err(|e| Error::Config(format!("lease out of range: {e}")))
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let job = new.into_job(self.default_max_attempts);
        let mut inner = self.lock()?;
        inner.jobs.push(job.clone());
        inner.emit(EventKind::JobQueued {
            id: job.id,
            kind: job.kind,
            attempt: 0,
        });
        Ok(job)
    }

    async fn claim(
        &self,
        kinds: &[JobKind],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let lease = lease_duration(lease)?;
        let mut inner = self.lock()?;
        let Some(job) = inner
            .jobs
            .iter_mut()
            .find(|j| j.state == JobState::Queued && kinds.contains(&j.kind))
        else {
            return Ok(None);
        };

        validate_transition(job.state, JobState::Active)?;
        let now = Utc::now();
        job.state = JobState::Active;
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + lease);
        job.updated_at = now;
        let job = job.clone();

        inner.emit(EventKind::JobClaimed {
            id: job.id,
            worker_id: worker_id.to_string(),
            attempt: job.attempts,
        });
        Ok(Some(job))
    }

    async fn complete(&self, claim: &Claim, result: serde_json::Value) -> Result<Job> {
        let mut inner = self.lock()?;
        let job = inner.held_mut(claim)?;
        validate_transition(job.state, JobState::Completed)?;
        let now = Utc::now();
        job.state = JobState::Completed;
        job.result = Some(result);
        job.error = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        let job = job.clone();
        inner.emit(EventKind::JobCompleted {
            id: job.id,
            attempt: job.attempts,
        });
        Ok(job)
    }

    async fn fail(&self, claim: &Claim, error: &str, retryable: bool) -> Result<Job> {
        let mut inner = self.lock()?;
        let job = inner.held_mut(claim)?;
        let kinds = fail_in_place(job, error, retryable)?;
        let job = job.clone();
        for kind in kinds {
            inner.emit(kind);
        }
        Ok(job)
    }

    async fn renew(&self, claim: &Claim, lease: Duration) -> Result<Job> {
        let lease = lease_duration(lease)?;
        let mut inner = self.lock()?;
        let job = inner.held_mut(claim)?;
        if job.state != JobState::Active {
            return Err(Error::LeaseLost {
                job: job.id.to_string(),
                attempt: claim.attempt,
            });
        }
        let now = Utc::now();
        job.lease_expires_at = Some(now + lease);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn recover_expired(&self) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let mut recovered = Vec::new();
        let mut kinds = Vec::new();
        for job in inner.jobs.iter_mut().filter(|j| {
            j.state == JobState::Active && j.lease_expires_at.is_some_and(|t| t <= now)
        }) {
            kinds.extend(fail_in_place(job, "lease expired before completion", true)?);
            recovered.push(job.clone());
        }
        for kind in kinds {
            inner.emit(kind);
        }
        Ok(recovered)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let mut inner = self.lock()?;
        inner.find_mut(id).map(|j| j.clone())
    }

    async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .iter()
            .rev()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .filter(|j| kind.is_none_or(|k| j.kind == k))
            .take(limit)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn claim_is_fifo_within_kind() {
        let queue = MemoryQueue::new();
        let first = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
        let _ingest = queue.enqueue(NewJob::new(JobKind::Ingestion)).await.unwrap();
        let second = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();

        let a = queue.claim(&[JobKind::Allocation], "w1", LEASE).await.unwrap().unwrap();
        let b = queue.claim(&[JobKind::Allocation], "w2", LEASE).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert!(queue.claim(&[JobKind::Allocation], "w3", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_job_is_not_claimed_twice() {
        let queue = MemoryQueue::new();
        queue.enqueue(NewJob::new(JobKind::Ingestion)).await.unwrap();
        let claimed = queue.claim(&JobKind::ALL, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);
        assert!(queue.claim(&JobKind::ALL, "w2", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_failure_requeues_until_ceiling() {
        let queue = MemoryQueue::new();
        let job = queue
            .enqueue(NewJob::new(JobKind::Allocation).max_attempts(2))
            .await
            .unwrap();

        let claimed = queue.claim(&JobKind::ALL, "w1", LEASE).await.unwrap().unwrap();
        let after_first = queue
            .fail(&Claim::of(&claimed, "w1"), "queue unavailable", true)
            .await
            .unwrap();
        assert_eq!(after_first.id, job.id);
        assert_eq!(after_first.state, JobState::Queued);

        let claimed = queue.claim(&JobKind::ALL, "w1", LEASE).await.unwrap().unwrap();
        let after_second = queue
            .fail(&Claim::of(&claimed, "w1"), "queue unavailable", true)
            .await
            .unwrap();
        assert_eq!(after_second.state, JobState::Failed);
        assert_eq!(after_second.attempts, 2);
        assert!(after_second.finished_at.is_some());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal() {
        let queue = MemoryQueue::new();
        queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
        let claimed = queue.claim(&JobKind::ALL, "w1", LEASE).await.unwrap().unwrap();
        let failed = queue
            .fail(&Claim::of(&claimed, "w1"), "invalid agency.capacity", false)
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.as_deref(), Some("invalid agency.capacity"));
    }

    #[tokio::test]
    async fn completing_an_unclaimed_job_is_rejected() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
        let err = queue
            .complete(&Claim::of(&job, "w1"), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
        assert_eq!(queue.get(job.id).await.unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn expired_lease_is_recovered() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
        queue.claim(&JobKind::ALL, "crashed", LEASE).await.unwrap();

        assert!(queue.recover_expired().await.unwrap().is_empty());

        queue.expire_lease(job.id).unwrap();
        let recovered = queue.recover_expired().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, JobState::Queued);

        let reclaimed = queue.claim(&JobKind::ALL, "w2", LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn renewed_lease_survives_recovery() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
        let claimed = queue.claim(&JobKind::ALL, "w1", LEASE).await.unwrap().unwrap();

        queue.expire_lease(job.id).unwrap();
        let renewed = queue.renew(&Claim::of(&claimed, "w1"), LEASE).await.unwrap();
        assert!(renewed.lease_expires_at.unwrap() > Utc::now());
        assert!(queue.recover_expired().await.unwrap().is_empty());

        let err = queue.renew(&Claim::of(&claimed, "w2"), LEASE).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn events_are_published_in_order() {
        let queue = MemoryQueue::new();
        let mut events = queue.subscribe();
        queue.enqueue(NewJob::new(JobKind::Allocation)).await.unwrap();
        let claimed = queue.claim(&JobKind::ALL, "w1", LEASE).await.unwrap().unwrap();
        queue
            .complete(&Claim::of(&claimed, "w1"), serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let queued = events.recv().await.unwrap();
        let claimed = events.recv().await.unwrap();
        let completed = events.recv().await.unwrap();
        assert!(matches!(queued.kind, EventKind::JobQueued { .. }));
        assert!(matches!(claimed.kind, EventKind::JobClaimed { .. }));
        assert_eq!(completed.kind.terminal_state(), Some(JobState::Completed));
        assert!(queued.seq < claimed.seq && claimed.seq < completed.seq);
    }
}
