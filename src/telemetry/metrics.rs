//! Metric instrument factories for caseflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"caseflow"` meter. With no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("caseflow")
}

/// Counter: jobs enqueued.
/// Labels: `kind`.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job state transitions.
/// Labels: `kind`, `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs claimed with no registered handler.
/// Labels: `kind`.
pub fn jobs_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.jobs.unroutable")
        .with_description("Jobs with no matching handler")
        .build()
}

/// Counter: allocation runs applied.
pub fn allocation_runs() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.allocation.runs")
        .with_description("Number of allocation runs applied")
        .build()
}

/// Counter: case assignments committed by allocation runs.
pub fn allocation_assignments() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.allocation.assignments")
        .with_description("Cases assigned by allocation runs")
        .build()
}

/// Counter: cases left pending for lack of capacity.
pub fn allocation_unassignable() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.allocation.unassignable")
        .with_description("Cases no eligible agency had room for")
        .build()
}

/// Counter: scoring oracle invocations.
/// Labels: `result` ("ok" | "error" | "timeout").
pub fn oracle_invocations() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.oracle.invocations")
        .with_description("Number of scoring oracle invocations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("caseflow.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
