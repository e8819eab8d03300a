//! Allocation decisions: a greedy, deterministic case -> agency plan.
//!
//! The allocator is side-effect free. It returns a plan; the repository
//! applies it atomically together with the audit trail.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ranking::{AgencyStanding, rank_agencies, rank_cases};
use super::scoring::compute_score;
use crate::error::{Error, Result};
use crate::model::{Agency, AgencyId, AgencyStatus, Case, CaseId, CaseStatus, PerformanceRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub case_id: CaseId,
    pub agency_id: AgencyId,
}

/// An assignment handed back because its agency now holds more cases
/// than its capacity allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub case_id: CaseId,
    pub agency_id: AgencyId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    /// Applied before `assignments`. A released case may be reassigned in
    /// the same plan.
    #[serde(default)]
    pub released: Vec<Release>,
    pub assignments: Vec<Assignment>,
    /// Cases no eligible agency had room for. Not an error.
    pub unassignable: Vec<CaseId>,
}

impl AllocationPlan {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.assignments.is_empty() && self.unassignable.is_empty()
    }
}

/// Everything a run needs, loaded under the allocation lease.
#[derive(Debug, Clone, Default)]
pub struct AllocationSnapshot {
    /// Pending cases, plus the `ASSIGNED` cases of any agency holding more
    /// than its capacity. Insertion order.
    pub cases: Vec<Case>,
    pub agencies: Vec<AgencyStanding>,
}

/// Outcome of an applied run, stored as the job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReport {
    pub run_id: Uuid,
    /// Cases the run tried to place: pending ones plus any released.
    pub considered: usize,
    #[serde(default)]
    pub released: Vec<Release>,
    pub assignments: Vec<Assignment>,
    pub unassignable: Vec<CaseId>,
}

impl AllocationReport {
    pub fn new(plan: AllocationPlan) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            considered: plan.assignments.len() + plan.unassignable.len(),
            released: plan.released,
            assignments: plan.assignments,
            unassignable: plan.unassignable,
        }
    }
}

/// Build an agency's standing from its record and history (newest-first).
/// A soft-deleted agency stands as inactive whatever its status column says.
pub fn standing_for(
    agency: &Agency,
    history: &[PerformanceRecord],
    committed_load: i32,
    lookback_months: usize,
) -> AgencyStanding {
    let status = if agency.deleted_at.is_some() {
        AgencyStatus::Inactive
    } else {
        agency.status
    };
    AgencyStanding {
        agency_id: agency.id.clone(),
        status,
        capacity: agency.capacity,
        committed_load,
        score: compute_score(history, lookback_months).current_score,
    }
}

/// Greedy single pass over ranked inputs.
///
/// Each case goes to the highest-ranked agency that still has room; the
/// agency's in-run load is bumped so later cases in the same batch see it.
/// Cases that are not `NEW`/`QUEUED` are skipped, which makes a re-run
/// over already-assigned cases a no-op.
pub fn allocate(
    ranked_cases: &[&Case],
    ranked_agencies: &[&AgencyStanding],
) -> Result<AllocationPlan> {
    for agency in ranked_agencies {
        validate_standing(agency)?;
    }
    for case in ranked_cases {
        validate_case(case)?;
    }

    let mut loads: Vec<i32> = ranked_agencies.iter().map(|a| a.committed_load).collect();
    let mut plan = AllocationPlan::default();

    for case in ranked_cases.iter().filter(|c| c.status.is_pending()) {
        let slot = ranked_agencies
            .iter()
            .zip(loads.iter())
            .position(|(agency, load)| {
                agency.status == AgencyStatus::Active && *load < agency.capacity
            });

        match slot {
            Some(i) => {
                loads[i] += 1;
                plan.assignments.push(Assignment {
                    case_id: case.id,
                    agency_id: ranked_agencies[i].agency_id.clone(),
                });
            }
            None => plan.unassignable.push(case.id),
        }
    }

    Ok(plan)
}

/// Assignments held beyond capacity, to be handed back before allocating.
///
/// Agencies are visited in identifier order. Within one agency the
/// lowest-ranked cases go first, so the most urgent work stays put.
pub fn excess_assignments(cases: &[Case], agencies: &[AgencyStanding]) -> Vec<Release> {
    let mut over: Vec<&AgencyStanding> = agencies
        .iter()
        .filter(|a| a.committed_load > a.capacity)
        .collect();
    over.sort_by(|a, b| a.agency_id.cmp(&b.agency_id));

    let mut released = Vec::new();
    for agency in over {
        let held = cases.iter().filter(|c| {
            c.status == CaseStatus::Assigned
                && c.assigned_agency.as_ref() == Some(&agency.agency_id)
        });
        let excess = (agency.committed_load - agency.capacity.max(0)) as usize;
        let lowest_first = rank_cases(held).into_iter().rev().take(excess);
        released.extend(lowest_first.map(|case| Release {
            case_id: case.id,
            agency_id: agency.agency_id.clone(),
        }));
    }
    released
}

/// Validate the whole snapshot, hand back over-capacity assignments, rank
/// and allocate.
pub fn plan(snapshot: &AllocationSnapshot) -> Result<AllocationPlan> {
    for agency in &snapshot.agencies {
        validate_standing(agency)?;
    }

    let released = excess_assignments(&snapshot.cases, &snapshot.agencies);
    let released_ids: HashSet<CaseId> = released.iter().map(|r| r.case_id).collect();

    let agencies: Vec<AgencyStanding> = snapshot
        .agencies
        .iter()
        .map(|agency| {
            let handed_back = released
                .iter()
                .filter(|r| r.agency_id == agency.agency_id)
                .count() as i32;
            AgencyStanding {
                committed_load: agency.committed_load - handed_back,
                ..agency.clone()
            }
        })
        .collect();

    // Released cases compete with the pending ones as if re-queued.
    let candidates: Vec<Case> = snapshot
        .cases
        .iter()
        .filter(|c| c.status.is_pending() || released_ids.contains(&c.id))
        .map(|c| {
            let mut case = c.clone();
            if released_ids.contains(&case.id) {
                case.status = CaseStatus::Queued;
                case.assigned_agency = None;
            }
            case
        })
        .collect();

    let ranked_cases = rank_cases(&candidates);
    let ranked_agencies = rank_agencies(&agencies);
    let mut plan = allocate(&ranked_cases, &ranked_agencies)?;
    plan.released = released;
    Ok(plan)
}

fn validate_standing(agency: &AgencyStanding) -> Result<()> {
    if agency.capacity < 0 {
        return Err(Error::validation(
            "agency.capacity",
            format!(
                "agency {} has negative capacity {}",
                agency.agency_id, agency.capacity
            ),
        ));
    }
    Ok(())
}

fn validate_case(case: &Case) -> Result<()> {
    if case.invoice.is_none() {
        return Err(Error::validation(
            "case.invoice",
            format!("case {} references no invoice", case.id),
        ));
    }
    Ok(())
}
