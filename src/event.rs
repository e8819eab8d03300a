//! Structured events emitted on every job state transition.
//!
//! Producers subscribe to the event stream to observe completion or
//! failure of the jobs they enqueued instead of polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, JobKind, JobState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobQueued {
        id: JobId,
        kind: JobKind,
        attempt: u32,
    },
    JobClaimed {
        id: JobId,
        worker_id: String,
        attempt: u32,
    },
    JobCompleted {
        id: JobId,
        attempt: u32,
    },
    JobFailed {
        id: JobId,
        error: String,
        retryable: bool,
        attempt: u32,
        /// No retry follows.
        terminal: bool,
    },
    /// Payload we couldn't decode, e.g. a newer producer's event type.
    #[serde(skip)]
    Unknown { raw: String },
}

impl Event {
    /// Decode a published event. An unrecognized kind survives as
    /// [`EventKind::Unknown`] rather than failing the whole payload.
    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        struct Wire {
            seq: u64,
            timestamp: DateTime<Utc>,
            kind: serde_json::Value,
        }

        let wire: Wire = serde_json::from_str(payload)?;
        Ok(Event {
            seq: wire.seq,
            timestamp: wire.timestamp,
            kind: EventKind::decode(&wire.kind.to_string()),
        })
    }
}

impl EventKind {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EventKind::JobQueued { id, .. }
            | EventKind::JobClaimed { id, .. }
            | EventKind::JobCompleted { id, .. }
            | EventKind::JobFailed { id, .. } => Some(*id),
            EventKind::Unknown { .. } => None,
        }
    }

    /// The state this event leaves the job in, if it is terminal.
    pub fn terminal_state(&self) -> Option<JobState> {
        match self {
            EventKind::JobCompleted { .. } => Some(JobState::Completed),
            EventKind::JobFailed { terminal: true, .. } => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Decode a serialized event kind, keeping the raw text when it
    /// doesn't match any known variant.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| EventKind::Unknown {
            raw: raw.to_string(),
        })
    }
}
