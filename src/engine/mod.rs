//! Allocation engine: metric aggregation, ranking and assignment planning.
//!
//! Everything in here is pure and synchronous. A run is bounded and
//! completes without suspending; the worker runtime and the repository
//! supply inputs and apply the resulting plan.

pub mod allocate;
pub mod ranking;
pub mod scoring;

pub use allocate::{
    AllocationPlan, AllocationReport, AllocationSnapshot, Assignment, Release, allocate,
    excess_assignments, plan, standing_for,
};
pub use ranking::{AgencyStanding, rank_agencies, rank_cases};
pub use scoring::{ScoreSummary, capacity_tier, compute_score, derived_dso, synthesize_record};
