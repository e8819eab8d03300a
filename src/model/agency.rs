//! Collection agencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Agency identifier. Imported agencies keep their natural key
/// (e.g. `agency-alpha`); agencies onboarded here get a UUID string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyId(pub String);

impl AgencyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgencyId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for AgencyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgencyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgencyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgencyStatus {
    Active,
    Inactive,
    Suspended,
}

impl std::fmt::Display for AgencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgencyStatus::Active => "ACTIVE",
            AgencyStatus::Inactive => "INACTIVE",
            AgencyStatus::Suspended => "SUSPENDED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AgencyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(AgencyStatus::Active),
            "INACTIVE" => Ok(AgencyStatus::Inactive),
            "SUSPENDED" => Ok(AgencyStatus::Suspended),
            _ => Err(Error::validation(
                "agency.status",
                format!("unknown status: {s}"),
            )),
        }
    }
}

/// An external collection partner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    pub id: AgencyId,
    pub name: String,
    pub region: String,
    /// Maximum concurrent cases. Kept signed so a corrupt row is caught
    /// by validation instead of wrapping.
    pub capacity: i32,
    pub status: AgencyStatus,
    /// Set on soft delete. Agencies are never hard-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agency {
    /// Only active, non-deleted agencies may receive cases.
    pub fn is_allocatable(&self) -> bool {
        self.status == AgencyStatus::Active && self.deleted_at.is_none()
    }
}

pub fn validate_capacity(capacity: i32) -> Result<()> {
    if capacity < 0 {
        return Err(Error::validation(
            "agency.capacity",
            format!("capacity must be >= 0, got {capacity}"),
        ));
    }
    Ok(())
}

/// Builder for onboarding a new agency.
#[derive(Debug, Clone)]
pub struct NewAgency {
    pub(crate) id: Option<AgencyId>,
    pub(crate) name: String,
    pub(crate) region: String,
    pub(crate) capacity: Option<i32>,
}

impl NewAgency {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            region: region.into(),
            capacity: None,
        }
    }

    pub fn id(mut self, id: impl Into<AgencyId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Explicit capacity. Without one the agency starts on the tier of
    /// the probationary score.
    pub fn capacity(mut self, capacity: i32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("agency.name", "name must not be empty"));
        }
        if let Some(capacity) = self.capacity {
            validate_capacity(capacity)?;
        }
        Ok(())
    }
}

/// Partial update applied by an administrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgencyUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AgencyStatus>,
}

impl AgencyUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.region.is_none()
            && self.capacity.is_none()
            && self.status.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(Error::validation("agency.name", "name must not be empty"));
        }
        if let Some(capacity) = self.capacity {
            validate_capacity(capacity)?;
        }
        Ok(())
    }

    /// Apply onto an agency in place.
    pub fn apply_to(&self, agency: &mut Agency) {
        if let Some(ref name) = self.name {
            agency.name = name.clone();
        }
        if let Some(ref region) = self.region {
            agency.region = region.clone();
        }
        if let Some(capacity) = self.capacity {
            agency.capacity = capacity;
        }
        if let Some(status) = self.status {
            agency.status = status;
        }
    }
}

/// One entry of a bulk migration file.
///
/// `history` is oldest-first: the last element is the previous calendar
/// month. Storage and read paths are newest-first; the importer converts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedAgency {
    pub id: AgencyId,
    pub name: String,
    pub score: f64,
    #[serde(default)]
    pub history: Vec<f64>,
    #[serde(default)]
    pub region: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_capacity_is_rejected() {
        let err = NewAgency::new("Alpha Collections", "NA")
            .capacity(-1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "agency.capacity"));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("active".parse::<AgencyStatus>().unwrap(), AgencyStatus::Active);
        assert_eq!(
            "SUSPENDED".parse::<AgencyStatus>().unwrap(),
            AgencyStatus::Suspended
        );
        assert!("retired".parse::<AgencyStatus>().is_err());
    }

    #[test]
    fn update_applies_only_set_fields() {
        let now = Utc::now();
        let mut agency = Agency {
            id: AgencyId::from("agency-alpha"),
            name: "Alpha".to_string(),
            region: "NA".to_string(),
            capacity: 3,
            status: AgencyStatus::Active,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let update = AgencyUpdate {
            capacity: Some(7),
            ..Default::default()
        };
        update.apply_to(&mut agency);
        assert_eq!(agency.capacity, 7);
        assert_eq!(agency.name, "Alpha");
    }

    #[test]
    fn imported_history_defaults_to_empty() {
        let parsed: ImportedAgency =
            serde_json::from_str(r#"{"id":"agency-beta","name":"Beta Recovery","score":78}"#)
                .unwrap();
        assert!(parsed.history.is_empty());
        assert_eq!(parsed.id.as_str(), "agency-beta");
    }
}
