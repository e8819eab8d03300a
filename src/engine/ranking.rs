//! Eligibility and ranking of allocation inputs.
//!
//! Neither function mutates anything; each returns an ordered view over
//! its input.

use std::cmp::Ordering;

use serde::Serialize;

use crate::model::{AgencyId, AgencyStatus, Case};

/// An agency as the allocator sees it at the start of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgencyStanding {
    pub agency_id: AgencyId,
    pub status: AgencyStatus,
    pub capacity: i32,
    /// Cases currently `ASSIGNED` to this agency.
    pub committed_load: i32,
    pub score: f64,
}

impl AgencyStanding {
    pub fn is_eligible(&self) -> bool {
        self.status == AgencyStatus::Active && self.committed_load < self.capacity
    }
}

/// Order cases by priority weight, then urgency, both descending.
/// The sort is stable, so equal cases keep their insertion order.
pub fn rank_cases<'a, I>(cases: I) -> Vec<&'a Case>
where
    I: IntoIterator<Item = &'a Case>,
{
    let mut ranked: Vec<&Case> = cases.into_iter().collect();
    ranked.sort_by(|a, b| compare_cases(a, b));
    ranked
}

fn compare_cases(a: &Case, b: &Case) -> Ordering {
    b.priority
        .weight()
        .cmp(&a.priority.weight())
        .then_with(|| b.urgency_score.total_cmp(&a.urgency_score))
}

/// Keep only eligible agencies (active, below capacity) and order them by
/// score descending, then lighter load, then identifier.
pub fn rank_agencies<'a, I>(agencies: I) -> Vec<&'a AgencyStanding>
where
    I: IntoIterator<Item = &'a AgencyStanding>,
{
    let mut ranked: Vec<&AgencyStanding> =
        agencies.into_iter().filter(|a| a.is_eligible()).collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.committed_load.cmp(&b.committed_load))
            .then_with(|| a.agency_id.cmp(&b.agency_id))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseId, CaseStatus, Priority};
    use chrono::Utc;

    fn case(priority: Priority, urgency: f64) -> Case {
        let now = Utc::now();
        Case {
            id: CaseId::new(),
            invoice: None,
            priority,
            urgency_score: urgency,
            status: CaseStatus::New,
            assigned_agency: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn standing(id: &str, score: f64, capacity: i32, load: i32) -> AgencyStanding {
        AgencyStanding {
            agency_id: AgencyId::from(id),
            status: AgencyStatus::Active,
            capacity,
            committed_load: load,
            score,
        }
    }

    #[test]
    fn priority_then_urgency() {
        let cases = vec![
            case(Priority::High, 50.0),
            case(Priority::Low, 90.0),
            case(Priority::High, 90.0),
        ];
        let ranked = rank_cases(&cases);
        let got: Vec<(Priority, f64)> = ranked
            .iter()
            .map(|c| (c.priority, c.urgency_score))
            .collect();
        assert_eq!(
            got,
            vec![
                (Priority::High, 90.0),
                (Priority::High, 50.0),
                (Priority::Low, 90.0)
            ]
        );
    }

    #[test]
    fn unknown_priority_ranks_last() {
        let cases = vec![case(Priority::Unknown, 99.0), case(Priority::Low, 1.0)];
        let ranked = rank_cases(&cases);
        assert_eq!(ranked[0].priority, Priority::Low);
        assert_eq!(ranked[1].priority, Priority::Unknown);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let cases: Vec<Case> = (0..5).map(|_| case(Priority::Medium, 42.0)).collect();
        let ranked = rank_cases(&cases);
        let ids: Vec<CaseId> = ranked.iter().map(|c| c.id).collect();
        let expected: Vec<CaseId> = cases.iter().map(|c| c.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn ineligible_agencies_are_excluded() {
        let mut suspended = standing("agency-s", 99.0, 5, 0);
        suspended.status = AgencyStatus::Suspended;
        let agencies = vec![
            standing("agency-full", 95.0, 2, 2),
            suspended,
            standing("agency-ok", 70.0, 3, 1),
            standing("agency-zero", 90.0, 0, 0),
        ];
        let ranked = rank_agencies(&agencies);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].agency_id.as_str(), "agency-ok");
    }

    #[test]
    fn agency_ties_break_on_load_then_id() {
        let agencies = vec![
            standing("agency-c", 80.0, 5, 2),
            standing("agency-b", 80.0, 5, 1),
            standing("agency-a", 80.0, 5, 2),
            standing("agency-top", 90.0, 5, 4),
        ];
        let ranked: Vec<&str> = rank_agencies(&agencies)
            .iter()
            .map(|a| a.agency_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["agency-top", "agency-b", "agency-a", "agency-c"]);
    }
}
