//! Administrative flows: agency lifecycle, performance corrections, bulk
//! migration and manual case handling, each with its audit entry and
//! recompute request.

use std::sync::Arc;

use caseflow::admin::Admin;
use caseflow::error::Error;
use caseflow::model::{
    AgencyId, AgencyStatus, AgencyUpdate, CaseStatus, ImportedAgency, JobKind, JobState, Month,
    NewAgency, NewInvoice, Priority,
};
use caseflow::queue::memory::MemoryQueue;
use caseflow::queue::{Dispatcher, JobQueue};
use caseflow::store::memory::MemoryRepository;
use caseflow::store::{AllocationSettings, Repository};

struct Harness {
    repo: Arc<MemoryRepository>,
    queue: Arc<MemoryQueue>,
    admin: Admin,
}

fn harness() -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let queue = Arc::new(MemoryQueue::new());
    let admin = Admin::new(repo.clone(), 12).with_recompute(Dispatcher::new(queue.clone()));
    Harness { repo, queue, admin }
}

impl Harness {
    async fn queued_allocations(&self) -> usize {
        self.queue
            .list(Some(JobState::Queued), Some(JobKind::Allocation), 100)
            .await
            .unwrap()
            .len()
    }

    async fn last_action(&self) -> String {
        self.repo.audit_trail(None, 1).await.unwrap()[0].action.clone()
    }
}

fn invoice(number: &str) -> NewInvoice {
    NewInvoice {
        invoice_number: number.to_string(),
        amount: 980.5,
        customer_name: "Initech".to_string(),
        priority: Priority::High,
        urgency_score: 75.0,
    }
}

#[tokio::test]
async fn onboarding_defaults_to_probationary_tier() {
    let h = harness();
    let agency = h
        .admin
        .onboard_agency(NewAgency::new("Acme Recovery", "EU"), "alice")
        .await
        .unwrap();

    assert_eq!(agency.capacity, 3);
    assert_eq!(agency.status, AgencyStatus::Active);
    assert_eq!(h.last_action().await, "CREATE_AGENCY");
    assert_eq!(h.queued_allocations().await, 1);

    let job = &h.queue.list(None, None, 1).await.unwrap()[0];
    assert_eq!(job.arg("--reason"), Some("agency created"));
}

#[tokio::test]
async fn onboarding_validates_input() {
    let h = harness();
    let err = h
        .admin
        .onboard_agency(NewAgency::new("  ", "EU"), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "agency.name"));

    let err = h
        .admin
        .onboard_agency(NewAgency::new("Neg", "EU").capacity(-1), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { ref field, .. } if field == "agency.capacity"));
    assert_eq!(h.queued_allocations().await, 0);
}

#[tokio::test]
async fn empty_update_is_rejected() {
    let h = harness();
    let agency = h
        .admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme"), "alice")
        .await
        .unwrap();

    let err = h
        .admin
        .update_agency(&agency.id, AgencyUpdate::default(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    let update = AgencyUpdate {
        capacity: Some(7),
        region: Some("APAC".to_string()),
        ..Default::default()
    };
    let agency = h.admin.update_agency(&agency.id, update, "alice").await.unwrap();
    assert_eq!(agency.capacity, 7);
    assert_eq!(agency.region, "APAC");

    let entry = &h.repo.audit_trail(None, 1).await.unwrap()[0];
    assert_eq!(entry.action, "UPDATE_AGENCY");
    assert_eq!(entry.actor, "alice");
    assert!(entry.details.contains("\"capacity\":7"));
}

#[tokio::test]
async fn removed_agency_is_hidden_and_ineligible() {
    let h = harness();
    let id = AgencyId::from("gone");
    h.admin
        .onboard_agency(NewAgency::new("Gone", "NA").id("gone"), "alice")
        .await
        .unwrap();
    h.admin.add_case(invoice("INV-1")).await.unwrap();

    let removed = h.admin.remove_agency(&id, "alice").await.unwrap();
    assert_eq!(removed.status, AgencyStatus::Inactive);
    assert!(removed.deleted_at.is_some());
    assert_eq!(h.last_action().await, "DELETE_AGENCY");

    assert!(h.admin.agency_overview(false).await.unwrap().is_empty());
    assert_eq!(h.admin.agency_overview(true).await.unwrap().len(), 1);

    let report = h
        .repo
        .run_allocation(&AllocationSettings::default())
        .await
        .unwrap();
    assert!(report.assignments.is_empty());
    assert_eq!(report.unassignable.len(), 1);
}

#[tokio::test]
async fn performance_update_derives_dso_and_keeps_capacity() {
    let h = harness();
    let id = AgencyId::from("acme");
    h.admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme").capacity(2), "alice")
        .await
        .unwrap();

    let month: Month = "2024-06".parse().unwrap();
    let record = h
        .admin
        .record_performance(&id, month, 80.0, 92.0, "bob")
        .await
        .unwrap();
    assert_eq!(record.avg_dso, 35.0);
    assert_eq!(h.last_action().await, "UPDATE_PERFORMANCE");

    // Correcting the same month overwrites it.
    h.admin
        .record_performance(&id, month, 90.0, 92.0, "bob")
        .await
        .unwrap();
    let history = h.repo.performance_history(&id, 12).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].recovery_rate, 90.0);

    assert_eq!(h.repo.get_agency(&id).await.unwrap().capacity, 2);
}

#[tokio::test]
async fn performance_update_rejects_out_of_range_values() {
    let h = harness();
    h.admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme"), "alice")
        .await
        .unwrap();

    let err = h
        .admin
        .record_performance(&"acme".into(), Month::current(), 101.0, 90.0, "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

#[tokio::test]
async fn recompute_applies_tier_of_current_score() {
    let h = harness();
    let id = AgencyId::from("acme");
    h.admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme").capacity(1), "alice")
        .await
        .unwrap();
    h.admin
        .record_performance(&id, Month::current().minus_months(1), 86.0, 90.0, "bob")
        .await
        .unwrap();

    let agency = h.admin.recompute_capacity(&id, "bob").await.unwrap();
    assert_eq!(agency.capacity, 5);
    assert_eq!(h.last_action().await, "RECOMPUTE_CAPACITY");
}

#[tokio::test]
async fn reset_history_returns_to_probationary_score() {
    let h = harness();
    let id = AgencyId::from("acme");
    h.admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme"), "alice")
        .await
        .unwrap();
    for months_back in 1..=3 {
        h.admin
            .record_performance(&id, Month::current().minus_months(months_back), 88.0, 90.0, "bob")
            .await
            .unwrap();
    }

    let removed = h.admin.reset_history(&id, "bob").await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(h.last_action().await, "RESET_HISTORY");

    let detail = h.admin.agency_detail(&id).await.unwrap();
    assert!(detail.history.is_empty());
    assert_eq!(detail.summary.current_score, 60.0);

    let err = h.admin.reset_history(&"nobody".into(), "bob").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn import_places_history_before_as_of_month() {
    let h = harness();
    let entries: Vec<ImportedAgency> = serde_json::from_str(
        r#"[
            {"id": "agency-alpha", "name": "Alpha", "score": 88, "history": [70, 80, 90]},
            {"id": "agency-beta", "name": "Beta", "score": 72, "history": [65], "region": "EU"}
        ]"#,
    )
    .unwrap();

    let as_of: Month = "2024-03".parse().unwrap();
    let agencies = h.admin.import_agencies(entries, as_of, "migrator").await.unwrap();
    assert_eq!(agencies.len(), 2);
    assert_eq!(agencies[0].capacity, 5);
    assert_eq!(agencies[0].region, "NA");
    assert_eq!(agencies[1].capacity, 3);
    assert_eq!(agencies[1].region, "EU");

    let alpha = h.admin.agency_detail(&"agency-alpha".into()).await.unwrap();
    let months: Vec<String> = alpha.history.iter().map(|r| r.month.to_string()).collect();
    assert_eq!(months, vec!["2024-02", "2024-01", "2023-12"]);
    assert_eq!(alpha.history[0].recovery_rate, 90.0);
    assert_eq!(alpha.history[0].avg_dso, 30.0);

    let imports = h
        .repo
        .audit_trail(None, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "IMPORT_AGENCY")
        .count();
    assert_eq!(imports, 2);
}

#[tokio::test]
async fn reimport_replaces_history() {
    let h = harness();
    let as_of: Month = "2024-03".parse().unwrap();
    let first = vec![ImportedAgency {
        id: "agency-alpha".into(),
        name: "Alpha".into(),
        score: 88.0,
        history: vec![70.0, 80.0, 90.0],
        region: None,
    }];
    let second = vec![ImportedAgency {
        id: "agency-alpha".into(),
        name: "Alpha Collections".into(),
        score: 76.0,
        history: vec![76.0],
        region: None,
    }];
    h.admin.import_agencies(first, as_of, "migrator").await.unwrap();
    h.admin.import_agencies(second, as_of, "migrator").await.unwrap();

    let detail = h.admin.agency_detail(&"agency-alpha".into()).await.unwrap();
    assert_eq!(detail.agency.name, "Alpha Collections");
    assert_eq!(detail.agency.capacity, 4);
    assert_eq!(detail.history.len(), 1);
}

#[tokio::test]
async fn invalid_import_entry_imports_nothing() {
    let h = harness();
    let entries = vec![
        ImportedAgency {
            id: "good".into(),
            name: "Good".into(),
            score: 80.0,
            history: vec![80.0],
            region: None,
        },
        ImportedAgency {
            id: "bad".into(),
            name: "Bad".into(),
            score: 180.0,
            history: vec![],
            region: None,
        },
    ];

    let err = h
        .admin
        .import_agencies(entries, Month::current(), "migrator")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(h.admin.agency_overview(true).await.unwrap().is_empty());
}

#[tokio::test]
async fn reassignment_releases_case_for_next_run() {
    let h = harness();
    h.admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme").capacity(1), "alice")
        .await
        .unwrap();
    let case = h.admin.add_case(invoice("INV-1")).await.unwrap();
    assert_eq!(case.status, CaseStatus::New);

    h.repo
        .run_allocation(&AllocationSettings::default())
        .await
        .unwrap();
    let assigned = h.repo.get_case(case.id).await.unwrap();
    assert_eq!(assigned.status, CaseStatus::Assigned);
    assert_eq!(h.repo.committed_load(&"acme".into()).await.unwrap(), 1);

    let released = h.admin.reassign_case(case.id, "carol").await.unwrap();
    assert_eq!(released.status, CaseStatus::Queued);
    assert!(released.assigned_agency.is_none());
    assert_eq!(h.repo.committed_load(&"acme".into()).await.unwrap(), 0);

    let trail = h.repo.audit_trail(Some(case.id), 10).await.unwrap();
    assert_eq!(trail[0].action, "REASSIGN_CASE");
    assert_eq!(trail[0].actor, "carol");
    assert!(trail[0].details.contains("acme"));
    assert_eq!(trail[1].action, "AUTO_ALLOCATE");

    let report = h
        .repo
        .run_allocation(&AllocationSettings::default())
        .await
        .unwrap();
    assert_eq!(report.assignments.len(), 1);
}

#[tokio::test]
async fn closed_case_frees_capacity_and_cannot_be_reassigned() {
    let h = harness();
    h.admin
        .onboard_agency(NewAgency::new("Acme", "NA").id("acme").capacity(1), "alice")
        .await
        .unwrap();
    let first = h.admin.add_case(invoice("INV-1")).await.unwrap();
    let second = h.admin.add_case(invoice("INV-2")).await.unwrap();
    h.repo
        .run_allocation(&AllocationSettings::default())
        .await
        .unwrap();

    let closed = h.admin.close_case(first.id, "carol").await.unwrap();
    assert_eq!(closed.status, CaseStatus::Closed);

    let report = h
        .repo
        .run_allocation(&AllocationSettings::default())
        .await
        .unwrap();
    assert_eq!(report.assignments.len(), 1);
    assert_eq!(report.assignments[0].case_id, second.id);

    let err = h.admin.reassign_case(first.id, "carol").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn duplicate_invoice_number_is_rejected() {
    let h = harness();
    h.admin.add_case(invoice("INV-1")).await.unwrap();
    let err = h.admin.add_case(invoice("INV-1")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation { ref field, .. } if field == "invoice.invoice_number"
    ));
}
