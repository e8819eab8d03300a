//! Oracle-driven ingestion jobs with a scripted oracle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use caseflow::engine::synthesize_record;
use caseflow::error::{Error, Result};
use caseflow::model::{AgencyId, JobId, JobKind, JobState, NewAgency, NewInvoice, Priority};
use caseflow::oracle::{OracleReading, ScoringOracle};
use caseflow::queue::memory::MemoryQueue;
use caseflow::queue::{Dispatcher, JobQueue};
use caseflow::store::memory::MemoryRepository;
use caseflow::store::{AllocationSettings, Repository};
use caseflow::worker::{
    AllocationHandler, HandlerRegistry, IngestionHandler, WorkerConfig, WorkerRuntime,
};

/// Replays one canned answer and remembers which files it was shown.
struct ScriptedOracle {
    answer: std::result::Result<OracleReading, String>,
    seen: Mutex<Vec<PathBuf>>,
}

impl ScriptedOracle {
    fn reading(score: Option<f64>, capacity: Option<i32>) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(OracleReading { score, capacity }),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(raw: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Err(raw.to_string()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ScoringOracle for ScriptedOracle {
    async fn analyze(&self, file: &Path) -> Result<OracleReading> {
        self.seen.lock().unwrap().push(file.to_path_buf());
        match &self.answer {
            Ok(reading) => Ok(*reading),
            Err(raw) => Err(Error::Oracle {
                message: "malformed oracle output: expected value".to_string(),
                raw_output: Some(raw.clone()),
            }),
        }
    }
}

struct Harness {
    repo: Arc<MemoryRepository>,
    queue: Arc<MemoryQueue>,
    dispatcher: Dispatcher,
    worker: WorkerRuntime,
}

async fn harness(oracle: Arc<ScriptedOracle>) -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    repo.create_agency(NewAgency::new("Alpha", "NA").id("agency-alpha"), 3)
        .await
        .unwrap();

    let queue = Arc::new(MemoryQueue::new());
    let dispatcher = Dispatcher::new(queue.clone());
    let registry = HandlerRegistry::new()
        .register(Arc::new(AllocationHandler::new(
            repo.clone(),
            AllocationSettings::default(),
        )))
        .register(Arc::new(IngestionHandler::new(
            repo.clone(),
            oracle,
            Some(dispatcher.clone()),
        )));
    let worker = WorkerRuntime::new(queue.clone(), Arc::new(registry), WorkerConfig::default());
    Harness {
        repo,
        queue,
        dispatcher,
        worker,
    }
}

impl Harness {
    async fn ingest(&self, args: &[&str]) -> JobId {
        let id = self
            .dispatcher
            .enqueue(JobKind::Ingestion, args.iter().copied())
            .await
            .unwrap();
        self.worker.drain().await.unwrap();
        id
    }
}

fn alpha() -> AgencyId {
    AgencyId::from("agency-alpha")
}

#[tokio::test]
async fn score_updates_month_and_capacity_then_recomputes() {
    let oracle = ScriptedOracle::reading(Some(88.0), None);
    let h = harness(oracle.clone()).await;
    h.repo
        .ingest_invoice(NewInvoice {
            invoice_number: "INV-1".to_string(),
            amount: 300.0,
            customer_name: "Hooli".to_string(),
            priority: Priority::Medium,
            urgency_score: 40.0,
        })
        .await
        .unwrap();

    let id = h
        .ingest(&["--agency", "agency-alpha", "--file", "/data/q2.txt", "--month", "2024-05"])
        .await;

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(oracle.seen.lock().unwrap()[0], PathBuf::from("/data/q2.txt"));

    let record = h
        .repo
        .get_performance(&alpha(), "2024-05".parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.recovery_rate, 88.0);
    assert_eq!(record.sla_adherence, 95.0);
    assert_eq!(record.avg_dso, 31.0);
    assert_eq!(h.repo.get_agency(&alpha()).await.unwrap().capacity, 5);

    let result = job.result.unwrap();
    assert_eq!(result["capacity"], 5);
    assert_eq!(result["month"], "2024-05");

    // The follow-up allocation ran in the same drain.
    let follow_up = result["follow_up_job"].as_str().unwrap();
    let follow_up = JobId(uuid::Uuid::parse_str(follow_up).unwrap());
    let allocation = h.queue.get(follow_up).await.unwrap();
    assert_eq!(allocation.kind, JobKind::Allocation);
    assert_eq!(allocation.state, JobState::Completed);
    assert_eq!(allocation.arg("--reason"), Some("ingestion:agency-alpha"));
    assert_eq!(h.repo.committed_load(&alpha()).await.unwrap(), 1);

    let audit = h.repo.audit_trail(None, 10).await.unwrap();
    let entry = audit
        .iter()
        .find(|e| e.action == "INGEST_PERFORMANCE")
        .unwrap();
    assert_eq!(entry.actor, "system:ingestion");
    assert!(entry.scope.case_id().is_none());
}

#[tokio::test]
async fn existing_sla_is_kept() {
    let h = harness(ScriptedOracle::reading(Some(70.0), None)).await;
    let month = "2024-05".parse().unwrap();
    h.repo
        .upsert_performance(synthesize_record(alpha(), month, 50.0, 81.0))
        .await
        .unwrap();

    h.ingest(&["--agency", "agency-alpha", "--file", "/data/q2.txt", "--month", "2024-05"])
        .await;

    let record = h.repo.get_performance(&alpha(), month).await.unwrap().unwrap();
    assert_eq!(record.recovery_rate, 70.0);
    assert_eq!(record.sla_adherence, 81.0);
    assert_eq!(record.avg_dso, 40.0);
}

#[tokio::test]
async fn oracle_capacity_overrides_tier() {
    let h = harness(ScriptedOracle::reading(Some(90.0), Some(2))).await;
    h.ingest(&["--agency", "agency-alpha", "--file", "/data/q2.txt"])
        .await;

    assert_eq!(h.repo.get_agency(&alpha()).await.unwrap().capacity, 2);
    let history = h.repo.performance_history(&alpha(), 12).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].recovery_rate, 90.0);
}

#[tokio::test]
async fn capacity_alone_leaves_history_untouched() {
    let h = harness(ScriptedOracle::reading(None, Some(7))).await;
    let id = h
        .ingest(&["--agency", "agency-alpha", "--file", "/data/q2.txt"])
        .await;

    assert_eq!(h.queue.get(id).await.unwrap().state, JobState::Completed);
    assert_eq!(h.repo.get_agency(&alpha()).await.unwrap().capacity, 7);
    assert!(h.repo.performance_history(&alpha(), 12).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_reading_fails_without_retry() {
    let h = harness(ScriptedOracle::reading(None, None)).await;
    let id = h
        .ingest(&["--agency", "agency-alpha", "--file", "/data/empty.txt"])
        .await;

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("no score or capacity"));
    assert_eq!(h.repo.get_agency(&alpha()).await.unwrap().capacity, 3);
}

#[tokio::test]
async fn malformed_output_is_kept_in_failure_detail() {
    let h = harness(ScriptedOracle::failing("Score: ??")).await;
    let id = h
        .ingest(&["--agency", "agency-alpha", "--file", "/data/q2.txt"])
        .await;

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("raw output: Score: ??"));
}

#[tokio::test]
async fn unknown_agency_fails_before_calling_oracle() {
    let oracle = ScriptedOracle::reading(Some(80.0), None);
    let h = harness(oracle.clone()).await;
    let id = h
        .ingest(&["--agency", "agency-omega", "--file", "/data/q2.txt"])
        .await;

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().contains("agency-omega"));
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test]
async fn missing_file_argument_is_rejected() {
    let oracle = ScriptedOracle::reading(Some(80.0), None);
    let h = harness(oracle.clone()).await;
    let id = h.ingest(&["--agency", "agency-alpha"]).await;

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().contains("--file"));
    assert_eq!(oracle.calls(), 0);
}
