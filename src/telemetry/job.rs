//! Job execution span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::{JobId, JobKind};

/// Start a span for one job attempt.
///
/// `job.state` is declared empty and updated by [`record_state_transition`].
pub fn start_job_span(kind: JobKind, id: JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = %kind,
        "job.id" = %id,
        "job.attempt" = attempt,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on `span` and in its `job.state` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

pub fn start_allocation_span(run_id: Uuid) -> Span {
    tracing::info_span!(
        "allocation.run",
        "allocation.run_id" = %run_id,
        "allocation.assigned" = tracing::field::Empty,
        "allocation.unassignable" = tracing::field::Empty,
    )
}
