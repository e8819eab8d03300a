//! Worker runtime: claim jobs, route them to handlers, record outcomes.
//!
//! A worker wakes on job events or on its poll interval, then claims and
//! runs jobs up to its concurrency cap. Expired leases are recovered on a
//! fixed interval regardless of event traffic. While a handler runs its
//! lease is renewed; if the lease is lost anyway the handler is dropped
//! and the outcome is left to whoever holds the job now. Handler errors
//! and timeouts become `FAILED` (or re-`QUEUED`) jobs; queue errors are
//! logged and the loop keeps going.

pub mod handler;

pub use handler::{AllocationHandler, HandlerRegistry, IngestionHandler, JobHandler};

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Notify, broadcast};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{Claim, Job, JobKind, JobState};
use crate::queue::JobQueue;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded on claimed jobs.
    pub worker_id: String,
    /// Kinds this worker claims.
    pub kinds: Vec<JobKind>,
    /// Renewed every third of its length while a handler runs.
    pub lease: Duration,
    /// Hard ceiling on one handler invocation.
    pub max_execution: Duration,
    /// Fallback wake-up when no event arrives, and the lease recovery period.
    pub poll_interval: Duration,
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            kinds: JobKind::ALL.to_vec(),
            lease: Duration::from_secs(300),
            max_execution: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            max_concurrent: 2,
        }
    }
}

#[derive(Clone)]
pub struct WorkerRuntime {
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    /// Poked when a slot frees up.
    wake: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Ask the loop to stop. In-flight jobs run to completion.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let mut events = self.queue.subscribe();
        info!(
            worker_id = %self.config.worker_id,
            kinds = ?self.config.kinds,
            max_concurrent = self.config.max_concurrent,
            "worker started"
        );

        let mut recovery = tokio::time::interval(self.config.poll_interval);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(
                        worker_id = %self.config.worker_id,
                        in_flight = self.active(),
                        "worker shutting down"
                    );
                    return Ok(());
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::JobQueued { .. }) {
                            continue;
                        }
                        debug!(seq = event.seq, "woken by queued job");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("event channel closed, falling back to polling");
                        events = self.queue.subscribe();
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                },
                _ = self.wake.notified() => {}
                _ = recovery.tick() => {
                    self.recover().await;
                }
            }

            if let Err(e) = self.fill().await {
                error!("claim error: {e}");
            }
        }
    }

    /// Recover expired leases, then claim and run one job inline. Returns
    /// whether a job was run.
    pub async fn tick(&self) -> Result<bool> {
        self.recover().await;
        match self.claim().await? {
            Some(job) => {
                self.active.fetch_add(1, Ordering::Relaxed);
                let outcome = self.execute(job).await;
                self.active.fetch_sub(1, Ordering::Relaxed);
                outcome.map(|_| true)
            }
            None => Ok(false),
        }
    }

    /// Keep ticking until the queue has nothing claimable.
    pub async fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        while self.tick().await? {
            ran += 1;
        }
        Ok(ran)
    }

    /// Claim jobs into free slots, each on its own task.
    async fn fill(&self) -> Result<()> {
        while self.active.load(Ordering::Relaxed) < self.config.max_concurrent {
            let Some(job) = self.claim().await? else {
                return Ok(());
            };
            self.active.fetch_add(1, Ordering::Relaxed);
            let worker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.execute(job).await {
                    error!("failed to record job outcome: {e}");
                }
                worker.active.fetch_sub(1, Ordering::Relaxed);
                worker.wake.notify_one();
            });
        }
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Job>> {
        self.queue
            .claim(&self.config.kinds, &self.config.worker_id, self.config.lease)
            .await
    }

    async fn recover(&self) {
        match self.queue.recover_expired().await {
            Ok(recovered) => {
                for job in &recovered {
                    warn!(
                        job.id = %job.id,
                        job.kind = %job.kind,
                        attempt = job.attempts,
                        state = %job.state,
                        "recovered job with expired lease"
                    );
                }
            }
            Err(e) => error!("lease recovery error: {e}"),
        }
    }

    /// Drive `work` to completion while renewing `claim`. `None` when the
    /// lease was lost; `work` is dropped unfinished.
    async fn hold_lease<F: Future>(&self, claim: &Claim, work: F) -> Option<F::Output> {
        let mut renewal = tokio::time::interval(renew_every(self.config.lease));
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim just set the lease.
        renewal.tick().await;
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                _ = renewal.tick() => match self.queue.renew(claim, self.config.lease).await {
                    Ok(_) => debug!(job.id = %claim.id, attempt = claim.attempt, "lease renewed"),
                    Err(Error::LeaseLost { .. }) => return None,
                    Err(e) => warn!(job.id = %claim.id, "lease renewal error: {e}"),
                },
            }
        }
    }

    /// The job as it stands after this worker lost its claim.
    async fn abandon(&self, job: &Job) -> Result<Job> {
        warn!(
            job.id = %job.id,
            attempt = job.attempts,
            worker_id = %self.config.worker_id,
            "lease lost, abandoning job"
        );
        self.queue.get(job.id).await
    }

    /// Run one claimed job and record its outcome.
    async fn execute(&self, job: Job) -> Result<Job> {
        let span = start_job_span(job.kind, job.id, job.attempts);
        record_state_transition(&span, "QUEUED", "ACTIVE");
        count_transition(job.kind, JobState::Queued, JobState::Active);
        let claim = Claim::of(&job, self.config.worker_id.as_str());

        async {
            let start = Instant::now();
            let outcome = match self.registry.get(job.kind) {
                Some(handler) => {
                    let limit = self.config.max_execution;
                    let work = tokio::time::timeout(limit, handler.handle(&job));
                    match self.hold_lease(&claim, work).await {
                        Some(Ok(result)) => result,
                        Some(Err(_)) => Err(Error::Timeout {
                            operation: format!("{} job {}", job.kind, job.id),
                            after: self.config.max_execution,
                        }),
                        None => return self.abandon(&job).await,
                    }
                }
                None => {
                    let kind = KeyValue::new("kind", job.kind.to_string());
                    metrics::jobs_unroutable().add(1, &[kind]);
                    Err(Error::Other(format!("no handler registered for {}", job.kind)))
                }
            };
            let duration_ms = start.elapsed().as_millis() as u64;
            metrics::operation_duration_ms().record(
                duration_ms as f64,
                &[KeyValue::new("operation", format!("job.{}", job.kind))],
            );

            match outcome {
                Ok(result) => {
                    let done = match self.queue.complete(&claim, result).await {
                        Err(Error::LeaseLost { .. }) => return self.abandon(&job).await,
                        other => other?,
                    };
                    record_state_transition(&span, "ACTIVE", "COMPLETED");
                    count_transition(job.kind, JobState::Active, JobState::Completed);
                    info!(job.id = %job.id, attempt = job.attempts, duration_ms, "job completed");
                    Ok(done)
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    let after = match self.queue.fail(&claim, &e.detail(), retryable).await {
                        Err(Error::LeaseLost { .. }) => return self.abandon(&job).await,
                        other => other?,
                    };
                    record_state_transition(&span, "ACTIVE", "FAILED");
                    count_transition(job.kind, JobState::Active, JobState::Failed);
                    if after.state == JobState::Queued {
                        record_state_transition(&span, "FAILED", "QUEUED");
                        count_transition(job.kind, JobState::Failed, JobState::Queued);
                        warn!(
                            job.id = %job.id,
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            error = %e,
                            duration_ms,
                            "job failed, will retry"
                        );
                    } else {
                        error!(
                            job.id = %job.id,
                            attempt = job.attempts,
                            retryable,
                            error = %e,
                            duration_ms,
                            "job failed terminally"
                        );
                    }
                    Ok(after)
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}

fn renew_every(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(10))
}

fn count_transition(kind: JobKind, from: JobState, to: JobState) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
