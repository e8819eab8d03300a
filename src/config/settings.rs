//! Tunables loaded from a TOML file. Every field has a default, so an
//! empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [jobs]
//! max_attempts = 3
//! lease_secs = 300
//!
//! [worker]
//! max_concurrent = 2
//! kinds = ["ALLOCATION", "INGESTION"]
//!
//! [oracle]
//! program = "python3"
//! args = ["AnalyzeAgency.py"]
//! timeout_secs = 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::scoring::DEFAULT_LOOKBACK_MONTHS;
use crate::error::{Error, Result};
use crate::model::JobKind;
use crate::model::job::DEFAULT_MAX_ATTEMPTS;
use crate::oracle::CommandOracle;
use crate::store::AllocationSettings;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub jobs: JobSettings,
    pub worker: WorkerSettings,
    pub allocation: AllocationTuning,
    pub oracle: OracleSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobSettings {
    pub max_attempts: u32,
    /// How long a claimed job may stay `ACTIVE` before another worker may
    /// recover it.
    pub lease_secs: u64,
    pub max_execution_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_secs: 300,
            max_execution_secs: 600,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub max_concurrent: usize,
    pub kinds: Vec<JobKind>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            kinds: JobKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocationTuning {
    pub lookback_months: usize,
    /// Enqueue an allocation recompute after mutations that change
    /// eligibility or capacity.
    pub auto_recompute: bool,
}

impl Default for AllocationTuning {
    fn default() -> Self {
        Self {
            lookback_months: DEFAULT_LOOKBACK_MONTHS,
            auto_recompute: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OracleSettings {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["AnalyzeAgency.py".to_string()],
            timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), config_message(e))))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| Error::Config(e.message().to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.jobs.max_attempts == 0, "jobs.max_attempts must be at least 1"),
            (self.jobs.lease_secs == 0, "jobs.lease_secs must be positive"),
            (self.jobs.max_execution_secs == 0, "jobs.max_execution_secs must be positive"),
            (self.jobs.poll_interval_ms == 0, "jobs.poll_interval_ms must be positive"),
            (self.worker.max_concurrent == 0, "worker.max_concurrent must be at least 1"),
            (self.worker.kinds.is_empty(), "worker.kinds must name at least one kind"),
            (self.allocation.lookback_months == 0, "allocation.lookback_months must be at least 1"),
            (self.oracle.program.trim().is_empty(), "oracle.program must not be empty"),
            (self.oracle.timeout_secs == 0, "oracle.timeout_secs must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(Error::Config(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn worker_config(&self, worker_id: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.into(),
            kinds: self.worker.kinds.clone(),
            lease: Duration::from_secs(self.jobs.lease_secs),
            max_execution: Duration::from_secs(self.jobs.max_execution_secs),
            poll_interval: Duration::from_millis(self.jobs.poll_interval_ms),
            max_concurrent: self.worker.max_concurrent,
        }
    }

    pub fn oracle(&self) -> CommandOracle {
        CommandOracle::new(
            &self.oracle.program,
            self.oracle.args.clone(),
            Duration::from_secs(self.oracle.timeout_secs),
        )
    }

    pub fn allocation_settings(&self) -> AllocationSettings {
        AllocationSettings {
            lookback_months: self.allocation.lookback_months,
            ..AllocationSettings::default()
        }
    }
}

fn config_message(err: Error) -> String {
    match err {
        Error::Config(message) => message,
        other => other.to_string(),
    }
}
