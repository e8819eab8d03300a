//! Job handlers and the kind -> handler registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::engine::scoring::{DEFAULT_SLA_ADHERENCE, capacity_tier, synthesize_record};
use crate::error::{Error, Result};
use crate::model::{AgencyId, AgencyUpdate, Job, JobKind, Month, NewAuditEntry};
use crate::oracle::ScoringOracle;
use crate::queue::Dispatcher;
use crate::store::{AllocationSettings, Repository};
use crate::telemetry::job::start_allocation_span;
use crate::telemetry::metrics;

/// Audit actor for oracle-driven updates.
pub const INGESTION_ACTOR: &str = "system:ingestion";

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Execute one attempt. The returned value is stored as the job result.
    async fn handle(&self, job: &Job) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for its kind, replacing any earlier one.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

/// Runs the allocation engine over every pending case.
pub struct AllocationHandler {
    repo: Arc<dyn Repository>,
    settings: AllocationSettings,
}

impl AllocationHandler {
    pub fn new(repo: Arc<dyn Repository>, settings: AllocationSettings) -> Self {
        Self { repo, settings }
    }
}

#[async_trait]
impl JobHandler for AllocationHandler {
    fn kind(&self) -> JobKind {
        JobKind::Allocation
    }

    async fn handle(&self, job: &Job) -> Result<Value> {
        let span = start_allocation_span(Uuid::new_v4());
        let start = Instant::now();

        let report = self
            .repo
            .run_allocation(&self.settings)
            .instrument(span.clone())
            .await?;

        span.record("allocation.assigned", report.assignments.len());
        span.record("allocation.unassignable", report.unassignable.len());
        metrics::allocation_runs().add(1, &[]);
        metrics::allocation_assignments().add(report.assignments.len() as u64, &[]);
        metrics::allocation_unassignable().add(report.unassignable.len() as u64, &[]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_millis() as f64,
            &[KeyValue::new("operation", "allocation")],
        );

        if !report.unassignable.is_empty() {
            warn!(
                job.id = %job.id,
                unassignable = report.unassignable.len(),
                "cases left pending, no eligible capacity"
            );
        }
        info!(
            job.id = %job.id,
            run_id = %report.run_id,
            reason = job.arg("--reason").unwrap_or("unspecified"),
            assigned = report.assignments.len(),
            released = report.released.len(),
            "allocation complete"
        );
        Ok(serde_json::to_value(&report)?)
    }
}

/// Scores an uploaded agency file through the oracle and folds the result
/// into the agency's history and capacity.
///
/// Payload: `--agency <id> --file <path> [--month YYYY-MM]`. Without a
/// month the current calendar month is updated.
pub struct IngestionHandler {
    repo: Arc<dyn Repository>,
    oracle: Arc<dyn ScoringOracle>,
    /// Where the follow-up allocation recompute goes. `None` disables it.
    follow_up: Option<Dispatcher>,
}

impl IngestionHandler {
    pub fn new(
        repo: Arc<dyn Repository>,
        oracle: Arc<dyn ScoringOracle>,
        follow_up: Option<Dispatcher>,
    ) -> Self {
        Self {
            repo,
            oracle,
            follow_up,
        }
    }
}

#[async_trait]
impl JobHandler for IngestionHandler {
    fn kind(&self) -> JobKind {
        JobKind::Ingestion
    }

    async fn handle(&self, job: &Job) -> Result<Value> {
        let agency_id = AgencyId::from(job.require_arg("--agency")?);
        let file = job.require_arg("--file")?;
        let month = match job.arg("--month") {
            Some(raw) => raw.parse::<Month>()?,
            None => Month::current(),
        };

        // Fail before spending an oracle call on an unknown agency.
        let agency = self.repo.get_agency(&agency_id).await?;

        let reading = self.oracle.analyze(Path::new(file)).await?;
        if reading.score.is_none() && reading.capacity.is_none() {
            return Err(Error::Oracle {
                message: format!("no score or capacity found in {file}"),
                raw_output: None,
            });
        }

        if let Some(score) = reading.score {
            let sla = self
                .repo
                .get_performance(&agency_id, month)
                .await?
                .map_or(DEFAULT_SLA_ADHERENCE, |existing| existing.sla_adherence);
            self.repo
                .upsert_performance(synthesize_record(agency_id.clone(), month, score, sla))
                .await?;
        }

        let capacity = reading
            .capacity
            .or_else(|| reading.score.map(capacity_tier))
            .unwrap_or(agency.capacity);
        if capacity != agency.capacity {
            let update = AgencyUpdate {
                capacity: Some(capacity),
                ..Default::default()
            };
            self.repo.update_agency(&agency_id, update).await?;
        }

        let details = format!(
            "ingested {file} for {month}: score {}, capacity {} -> {capacity}",
            reading.score.map_or("none".to_string(), |s| s.to_string()),
            agency.capacity,
        );
        self.repo
            .record_audit(NewAuditEntry::system(
                INGESTION_ACTOR,
                "INGEST_PERFORMANCE",
                format!("agency {agency_id}: {details}"),
            ))
            .await?;

        let follow_up = match &self.follow_up {
            Some(dispatcher) => Some(
                dispatcher
                    .request_allocation(&format!("ingestion:{agency_id}"))
                    .await?,
            ),
            None => None,
        };

        info!(
            job.id = %job.id,
            agency = %agency_id,
            %month,
            score = ?reading.score,
            capacity,
            "ingestion complete"
        );
        Ok(json!({
            "agency_id": agency_id,
            "month": month,
            "score": reading.score,
            "capacity": capacity,
            "follow_up_job": follow_up.map(|id| id.to_string()),
        }))
    }
}
