//! Metric aggregation: current score, capacity tier and derived DSO.
//!
//! Pure functions over an agency's performance history. History is always
//! handled newest-first.

use serde::Serialize;

use crate::model::{AgencyId, Month, PerformanceRecord};

/// Score given to an agency with no history yet.
pub const PROBATIONARY_SCORE: f64 = 60.0;

/// Trailing window considered when no other value is configured.
pub const DEFAULT_LOOKBACK_MONTHS: usize = 12;

/// SLA adherence assumed for a synthesized record when nothing better is known.
pub const DEFAULT_SLA_ADHERENCE: f64 = 95.0;

/// Result of aggregating one agency's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    /// Recovery rate of the most recent month, or the probationary score.
    pub current_score: f64,
    pub capacity_tier: i32,
    /// Records inside the lookback window.
    pub months_considered: usize,
    pub trailing_recovery_rate: Option<f64>,
    pub trailing_sla_adherence: Option<f64>,
    pub trailing_avg_dso: Option<f64>,
}

/// Aggregate an agency's records (newest-first) over `lookback_months`.
pub fn compute_score(records: &[PerformanceRecord], lookback_months: usize) -> ScoreSummary {
    debug_assert!(
        records.windows(2).all(|w| w[0].month >= w[1].month),
        "performance history must be newest-first"
    );

    let window = &records[..records.len().min(lookback_months)];
    let current_score = window
        .first()
        .map_or(PROBATIONARY_SCORE, |latest| latest.recovery_rate);

    ScoreSummary {
        current_score,
        capacity_tier: capacity_tier(current_score),
        months_considered: window.len(),
        trailing_recovery_rate: mean(window.iter().map(|r| r.recovery_rate)),
        trailing_sla_adherence: mean(window.iter().map(|r| r.sla_adherence)),
        trailing_avg_dso: mean(window.iter().map(|r| r.avg_dso)),
    }
}

/// Capacity tier for a score: >= 85 gets 5, >= 75 gets 4, everything else 3.
pub fn capacity_tier(score: f64) -> i32 {
    if score >= 85.0 {
        5
    } else if score >= 75.0 {
        4
    } else {
        3
    }
}

/// DSO synthesized from a bare score: `45 - (score - 60) * 0.5`.
///
/// Unclamped. Scores are validated to 0-100 before they get here, which
/// keeps the result within 25-75 days.
pub fn derived_dso(score: f64) -> f64 {
    45.0 - (score - 60.0) * 0.5
}

/// Build a record from a bare score, as migration and oracle updates do.
pub fn synthesize_record(
    agency_id: AgencyId,
    month: Month,
    recovery_rate: f64,
    sla_adherence: f64,
) -> PerformanceRecord {
    PerformanceRecord {
        agency_id,
        month,
        recovery_rate,
        sla_adherence,
        avg_dso: derived_dso(recovery_rate),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
