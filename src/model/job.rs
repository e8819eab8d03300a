//! Queued units of asynchronous work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default retry ceiling when a job doesn't set its own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Run the allocation engine over pending cases.
    Allocation,
    /// Score an uploaded agency file through the oracle.
    Ingestion,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Allocation, JobKind::Ingestion];
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Allocation => "ALLOCATION",
            JobKind::Ingestion => "INGESTION",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ALLOCATION" => Ok(JobKind::Allocation),
            "INGESTION" => Ok(JobKind::Ingestion),
            _ => Err(Error::validation("job.kind", format!("unknown job kind: {s}"))),
        }
    }
}

/// Job lifecycle.
///
/// `QUEUED -> ACTIVE -> {COMPLETED | FAILED}`, with `FAILED -> QUEUED` on
/// retry while attempts remain. A stored `FAILED` job is terminal: a
/// retryable failure passes through `FAILED` and lands back in `QUEUED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Active) | (Active, Completed) | (Active, Failed) | (Failed, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Active => "ACTIVE",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobState::Queued),
            "ACTIVE" => Ok(JobState::Active),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            _ => Err(Error::validation("job.state", format!("unknown job state: {s}"))),
        }
    }
}

/// Validate a state transition, returning an error if disallowed.
pub fn validate_transition(from: JobState, to: JobState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::invalid_transition(from, to))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Opaque argument list, e.g. `["--agency", "agency-alpha", "--file", "/tmp/q3.txt"]`.
    pub payload: Vec<String>,
    pub state: JobState,
    /// Incremented on every claim.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Worker holding the current claim.
    pub worker_id: Option<String>,
    /// Past this instant an `ACTIVE` job is presumed abandoned.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Value following `flag` in the payload, e.g. `arg("--agency")`.
    pub fn arg(&self, flag: &str) -> Option<&str> {
        self.payload
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.payload.get(i + 1))
            .map(String::as_str)
    }

    pub fn require_arg(&self, flag: &str) -> Result<&str> {
        self.arg(flag).ok_or_else(|| {
            Error::validation(
                format!("job.payload{flag}"),
                format!("{} job requires {flag} <value>", self.kind),
            )
        })
    }
}

/// Who holds an `ACTIVE` job: the worker that claimed it and on which
/// attempt. Completing, failing or renewing requires the current claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: JobId,
    pub worker_id: String,
    pub attempt: u32,
}

impl Claim {
    /// The claim `worker_id` was granted for a job it just claimed.
    pub fn of(job: &Job, worker_id: impl Into<String>) -> Self {
        Self {
            id: job.id,
            worker_id: worker_id.into(),
            attempt: job.attempts,
        }
    }

    /// Reject the claim unless it still holds `job`. A job that has been
    /// re-queued or re-claimed since is lost to this claim; one already
    /// finished under it is left to the transition check.
    pub fn check(&self, job: &Job) -> Result<()> {
        let lost = || Error::LeaseLost {
            job: job.id.to_string(),
            attempt: self.attempt,
        };
        if job.attempts != self.attempt {
            return Err(lost());
        }
        let holder = job.worker_id.as_deref() == Some(self.worker_id.as_str());
        match job.state {
            JobState::Active if holder => Ok(()),
            JobState::Active | JobState::Queued => Err(lost()),
            JobState::Completed | JobState::Failed => Ok(()),
        }
    }
}

/// Builder for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) kind: JobKind,
    pub(crate) payload: Vec<String>,
    pub(crate) max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
            max_attempts: None,
        }
    }

    pub fn payload<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Materialize a fresh `QUEUED` job.
    pub(crate) fn into_job(self, default_max_attempts: u32) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            kind: self.kind,
            payload: self.payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts).max(1),
            worker_id: None,
            lease_expires_at: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}
