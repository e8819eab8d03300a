//! Monthly performance snapshots.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::agency::AgencyId;
use crate::error::{Error, Result};

/// A calendar month, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::validation(
                "performance.month",
                format!("month must be 1-12, got {month}"),
            ));
        }
        if !(1900..=9999).contains(&year) {
            return Err(Error::validation(
                "performance.month",
                format!("year out of range: {year}"),
            ));
        }
        Ok(Self { year, month })
    }

    /// The current UTC month.
    pub fn current() -> Self {
        let today = Utc::now().date_naive();
        Self {
            year: today.year(),
            month: today.month(),
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    /// The month `n` months before this one.
    pub fn minus_months(self, n: u32) -> Self {
        let index = self.year as i64 * 12 + (self.month as i64 - 1) - n as i64;
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }
}

impl std::fmt::Display for Month {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for Month {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::validation(
                "performance.month",
                format!("expected YYYY-MM, got {s:?}"),
            )
        };
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Month::new(year, month)
    }
}

impl TryFrom<String> for Month {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Month> for String {
    fn from(m: Month) -> Self {
        m.to_string()
    }
}

/// One calendar month of an agency's metrics. Unique per (agency, month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub agency_id: AgencyId,
    pub month: Month,
    /// Percentage of debt value recovered, 0-100.
    pub recovery_rate: f64,
    /// Service-level compliance, 0-100.
    pub sla_adherence: f64,
    /// Average days-sales-outstanding.
    pub avg_dso: f64,
}

impl PerformanceRecord {
    pub fn validate(&self) -> Result<()> {
        validate_percentage("performance.recovery_rate", self.recovery_rate)?;
        validate_percentage("performance.sla_adherence", self.sla_adherence)?;
        if !self.avg_dso.is_finite() || self.avg_dso < 0.0 {
            return Err(Error::validation(
                "performance.avg_dso",
                format!("must be a non-negative number, got {}", self.avg_dso),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_percentage(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::validation(
            field,
            format!("must be within 0-100, got {value}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_parses_and_displays() {
        let m: Month = "2024-03".parse().unwrap();
        assert_eq!(m.year(), 2024);
        assert_eq!(m.month(), 3);
        assert_eq!(m.to_string(), "2024-03");
    }

    #[test]
    fn month_rejects_malformed_input() {
        assert!("2024-13".parse::<Month>().is_err());
        assert!("2024-3".parse::<Month>().is_err());
        assert!("March 2024".parse::<Month>().is_err());
    }

    #[test]
    fn minus_months_crosses_year_boundary() {
        let m = Month::new(2024, 2).unwrap();
        assert_eq!(m.minus_months(2).to_string(), "2023-12");
        assert_eq!(m.minus_months(14).to_string(), "2022-12");
        assert_eq!(m.minus_months(0), m);
    }

    #[test]
    fn months_order_chronologically() {
        let older: Month = "2023-11".parse().unwrap();
        let newer: Month = "2024-01".parse().unwrap();
        assert!(older < newer);
    }

    #[test]
    fn record_validation_bounds_percentages() {
        let record = PerformanceRecord {
            agency_id: AgencyId::from("agency-alpha"),
            month: "2024-01".parse().unwrap(),
            recovery_rate: 101.0,
            sla_adherence: 90.0,
            avg_dso: 40.0,
        };
        assert!(record.validate().is_err());
    }
}
