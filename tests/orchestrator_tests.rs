mod test_utils;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use ehr_sync::adapters::AdapterError;
use ehr_sync::collaborators::RecordKey;
use ehr_sync::models::enums::{
    ConflictStatus, ConflictStrategy, ErrorSeverity, FailureKind, JobStatus, JobType,
    SyncDirection,
};
use ehr_sync::orchestrator::{JobSpec, ProcessOutcome};
use ehr_sync::queue::JobFailure;
use ehr_sync::repositories::TransformationRuleRepository;
use ehr_sync::repositories::sync_conflict::ConflictFilter;
use serde_json::json;
use test_utils::*;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn full_sync(connection_id: Uuid, direction: SyncDirection, max_attempts: u32) -> JobSpec {
    JobSpec {
        connection_id,
        job_type: JobType::Full,
        direction,
        priority: Some(3),
        resource_types: Vec::new(),
        since: None,
        patient_id: None,
        resource_id: None,
        max_attempts: Some(max_attempts),
    }
}

fn observation(id: &str, status: &str) -> serde_json::Value {
    json!({ "resourceType": "Observation", "id": id, "status": status })
}

#[tokio::test]
async fn full_sync_stores_records_and_auto_resolves_newer_remote() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let now = Utc::now();
    seed_record(
        &db,
        connection_id,
        "Observation",
        "obs-2",
        observation("obs-2", "preliminary"),
        now - Duration::hours(1),
    )
    .await
    .unwrap();

    let adapter = MockAdapter::new();
    adapter.script_records(vec![
        provider_record("Observation", "obs-1", observation("obs-1", "final"), now),
        provider_record("Observation", "obs-2", observation("obs-2", "final"), now),
        provider_record("Observation", "obs-3", observation("obs-3", "final"), now),
    ]);
    let engine = build_engine(&db, adapter.clone()).unwrap();

    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 3))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let outcome = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await
        .unwrap();
    let ProcessOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.records_stored, 3);
    assert_eq!(summary.conflicts_detected, 1);
    assert_eq!(summary.conflicts_resolved, 1);
    assert_eq!(summary.records_failed, 0);

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    assert_eq!(details.job.attempt_count, 1);
    assert!(details.errors.is_empty());

    let conflicts = engine
        .conflicts
        .list(ConflictFilter {
            connection_id: Some(connection_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].resource_id, "obs-2");
    assert_eq!(conflicts[0].status, ConflictStatus::AutoResolved);
    assert_eq!(conflicts[0].strategy, ConflictStrategy::LastWriteWins);
    assert_eq!(conflicts[0].job_id, Some(job.id));

    let stored = engine
        .collaborators
        .store
        .get(&RecordKey::new(connection_id, "Observation", "obs-2"))
        .await
        .unwrap()
        .expect("record stored");
    assert_eq!(stored.data["status"], "final");
}

#[tokio::test]
async fn patient_scoped_sync_keeps_newer_local_record() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let now = Utc::now();
    seed_record(
        &db,
        connection_id,
        "Observation",
        "obs-2",
        observation("obs-2", "amended"),
        now,
    )
    .await
    .unwrap();

    let adapter = MockAdapter::new();
    adapter.script_records(vec![
        provider_record("Observation", "obs-1", observation("obs-1", "final"), now),
        provider_record(
            "Observation",
            "obs-2",
            observation("obs-2", "preliminary"),
            now - Duration::hours(2),
        ),
        provider_record("Observation", "obs-3", observation("obs-3", "final"), now),
    ]);
    let engine = build_engine(&db, adapter).unwrap();

    let mut spec = full_sync(connection_id, SyncDirection::Inbound, 3);
    spec.resource_types = vec!["Observation".to_string()];
    spec.patient_id = Some("pat-1".to_string());
    let job = engine.orchestrator.create_job(spec).await.unwrap();

    let outcome = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await
        .unwrap();
    let ProcessOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.records_stored, 2);
    assert_eq!(summary.conflicts_detected, 1);
    assert_eq!(summary.conflicts_resolved, 1);

    let stored = engine
        .collaborators
        .store
        .get(&RecordKey::new(connection_id, "Observation", "obs-2"))
        .await
        .unwrap()
        .expect("record stored");
    assert_eq!(stored.data["status"], "amended");
    assert_eq!(
        engine.orchestrator.get_job(job.id).await.unwrap().job.patient_id.as_deref(),
        Some("pat-1")
    );
}

#[tokio::test]
async fn timeouts_are_retried_until_an_attempt_succeeds() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let adapter = MockAdapter::new();
    adapter.script_pull(Err(AdapterError::Timeout));
    adapter.script_pull(Err(AdapterError::Timeout));
    adapter.script_records(vec![provider_record(
        "Observation",
        "obs-1",
        observation("obs-1", "final"),
        Utc::now(),
    )]);
    let engine = build_engine(&db, adapter.clone()).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 3))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    for attempt in 1..=2 {
        let result = engine.orchestrator.process_job(job.id, &cancel).await;
        assert!(
            matches!(result, Err(JobFailure::Retry(_))),
            "attempt {attempt} should ask for a retry"
        );
        let current = engine.orchestrator.get_job(job.id).await.unwrap().job;
        assert_eq!(current.status, JobStatus::Retrying);
        assert_eq!(current.attempt_count, attempt);
    }

    let outcome = engine.orchestrator.process_job(job.id, &cancel).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed(summary) if summary.records_stored == 1));

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    assert_eq!(details.job.attempt_count, 3);
    assert!(details.errors.is_empty(), "retried attempts leave no error rows");
    assert_eq!(adapter.pull_calls(), 3);
}

#[tokio::test]
async fn exhausted_attempts_record_one_terminal_error() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let adapter = MockAdapter::new();
    adapter.script_pull(Err(AdapterError::Timeout));
    adapter.script_pull(Err(AdapterError::Timeout));
    let engine = build_engine(&db, adapter).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 2))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(matches!(
        engine.orchestrator.process_job(job.id, &cancel).await,
        Err(JobFailure::Retry(_))
    ));
    assert!(matches!(
        engine.orchestrator.process_job(job.id, &cancel).await,
        Err(JobFailure::Fatal(_))
    ));

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Failed);
    assert_eq!(details.errors.len(), 1);
    let error = &details.errors[0];
    assert!(error.terminal);
    assert_eq!(error.kind, FailureKind::Timeout);
    assert_eq!(error.severity, ErrorSeverity::Critical);
    assert!(details.job.last_error.is_some());
}

#[tokio::test]
async fn non_retryable_failure_ends_the_job_on_first_attempt() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let adapter = MockAdapter::new();
    adapter.script_pull(Err(AdapterError::Unauthorized));
    let engine = build_engine(&db, adapter).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 5))
        .await
        .unwrap();

    let result = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(JobFailure::Fatal(_))));

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Failed);
    assert_eq!(details.job.attempt_count, 1);
    assert_eq!(details.errors.len(), 1);
    assert_eq!(details.errors[0].severity, ErrorSeverity::Error);
}

#[tokio::test]
async fn processing_a_finished_job_again_is_a_no_op() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let adapter = MockAdapter::new();
    adapter.script_records(vec![provider_record(
        "Observation",
        "obs-1",
        observation("obs-1", "final"),
        Utc::now(),
    )]);
    let engine = build_engine(&db, adapter.clone()).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 3))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    engine.orchestrator.process_job(job.id, &cancel).await.unwrap();
    let before = engine.orchestrator.get_job(job.id).await.unwrap().job;

    let again = engine.orchestrator.process_job(job.id, &cancel).await.unwrap();
    assert_eq!(again, ProcessOutcome::Skipped);

    let after = engine.orchestrator.get_job(job.id).await.unwrap().job;
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.attempt_count, before.attempt_count);
    assert_eq!(after.records_stored, before.records_stored);
    assert_eq!(adapter.pull_calls(), 1);
}

#[tokio::test]
async fn failed_job_can_be_retried_with_a_fresh_budget() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let adapter = MockAdapter::new();
    adapter.script_pull(Err(AdapterError::Timeout));
    let engine = build_engine(&db, adapter).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 1))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(engine.orchestrator.process_job(job.id, &cancel).await.is_err());
    assert!(engine.orchestrator.cancel_job(job.id).await.is_err());

    let retried = engine.orchestrator.retry_job(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Retrying);
    assert_eq!(retried.attempt_count, 0);

    let outcome = engine.orchestrator.process_job(job.id, &cancel).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed(_)));
    assert!(engine.orchestrator.retry_job(job.id).await.is_err());
}

#[tokio::test]
async fn cancelled_job_is_never_processed() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let adapter = MockAdapter::new();
    let engine = build_engine(&db, adapter.clone()).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 3))
        .await
        .unwrap();

    let cancelled = engine.orchestrator.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let outcome = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Skipped);
    assert_eq!(adapter.pull_calls(), 0);
}

#[tokio::test]
async fn bidirectional_job_pushes_local_changes_without_echoing_pulled_records() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(
        &db,
        &["Observation", "Patient"],
        SyncDirection::Bidirectional,
    )
    .await
    .unwrap();
    let now = Utc::now();
    seed_record(
        &db,
        connection_id,
        "Patient",
        "pat-1",
        json!({ "resourceType": "Patient", "id": "pat-1", "active": true }),
        now - Duration::minutes(5),
    )
    .await
    .unwrap();

    let adapter = MockAdapter::new();
    adapter.script_records(vec![provider_record(
        "Observation",
        "obs-1",
        observation("obs-1", "final"),
        now,
    )]);
    let engine = build_engine(&db, adapter.clone()).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Bidirectional, 3))
        .await
        .unwrap();

    let outcome = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await
        .unwrap();
    let ProcessOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.records_stored, 1);
    assert_eq!(summary.records_pushed, 1);

    let pushed = adapter.pushed();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].resource_type, "Patient");
    assert_eq!(pushed[0].resource_id, "pat-1");
}

#[tokio::test]
async fn create_job_rejects_resource_types_outside_the_connection_scope() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let engine = build_engine(&db, MockAdapter::new()).unwrap();

    let mut spec = full_sync(connection_id, SyncDirection::Inbound, 3);
    spec.resource_types = vec!["Patient".to_string()];
    assert!(engine.orchestrator.create_job(spec).await.is_err());

    let wrong_direction = full_sync(connection_id, SyncDirection::Outbound, 3);
    assert!(engine.orchestrator.create_job(wrong_direction).await.is_err());

    assert!(
        engine
            .orchestrator
            .create_job(full_sync(Uuid::new_v4(), SyncDirection::Inbound, 3))
            .await
            .is_err()
    );
}

async fn require_code(db: &sea_orm::DatabaseConnection) {
    TransformationRuleRepository::new(db.clone())
        .insert(
            PROVIDER,
            "Observation",
            1,
            json!({ "kind": "require", "field": "code" }),
        )
        .await
        .unwrap();
}

fn coded_observation(id: &str) -> serde_json::Value {
    json!({ "resourceType": "Observation", "id": id, "status": "final", "code": { "text": "HbA1c" } })
}

#[tokio::test]
async fn record_failing_a_rule_is_tallied_and_the_job_still_completes() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    require_code(&db).await;

    let now = Utc::now();
    let adapter = MockAdapter::new();
    adapter.script_records(vec![
        provider_record("Observation", "obs-1", coded_observation("obs-1"), now),
        provider_record("Observation", "obs-x", observation("obs-x", "final"), now),
        provider_record("Observation", "obs-3", coded_observation("obs-3"), now),
    ]);
    let engine = build_engine(&db, adapter).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 3))
        .await
        .unwrap();

    let outcome = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await
        .unwrap();
    let ProcessOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.records_stored, 2);
    assert_eq!(summary.records_failed, 1);

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    assert_eq!(details.job.records_failed, 1);
    assert_eq!(details.errors.len(), 1);
    let error = &details.errors[0];
    assert_eq!(error.severity, ErrorSeverity::Warning);
    assert_eq!(error.kind, FailureKind::Transformation);
    assert!(!error.terminal);
    assert_eq!(error.resource_ref.as_deref(), Some("Observation/obs-x"));

    let missing = engine
        .collaborators
        .store
        .get(&RecordKey::new(connection_id, "Observation", "obs-x"))
        .await
        .unwrap();
    assert!(missing.is_none(), "failed record is not stored");
}

#[tokio::test]
async fn too_many_failed_records_abort_the_job() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    require_code(&db).await;

    let now = Utc::now();
    let adapter = MockAdapter::new();
    adapter.script_records(vec![
        provider_record("Observation", "obs-1", observation("obs-1", "final"), now),
        provider_record("Observation", "obs-2", observation("obs-2", "final"), now),
        provider_record("Observation", "obs-3", observation("obs-3", "final"), now),
    ]);
    let mut config = test_config();
    config.orchestrator.max_record_failures = Some(2);
    let engine = build_engine_with_config(&db, adapter, config).unwrap();
    let job = engine
        .orchestrator
        .create_job(full_sync(connection_id, SyncDirection::Inbound, 3))
        .await
        .unwrap();

    let result = engine
        .orchestrator
        .process_job(job.id, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(JobFailure::Fatal(_))), "got {result:?}");

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Failed);
    assert_eq!(details.job.attempt_count, 1, "aborts are not retried");
    assert_eq!(details.job.records_failed, 2);
    let warnings = details
        .errors
        .iter()
        .filter(|error| error.severity == ErrorSeverity::Warning)
        .count();
    assert_eq!(warnings, 2);
    let terminal: Vec<_> = details.errors.iter().filter(|error| error.terminal).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, FailureKind::Transformation);
}

#[tokio::test]
async fn running_job_finishes_and_records_statistics_during_shutdown() {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let now = Utc::now();
    seed_record(
        &db,
        connection_id,
        "Observation",
        "obs-2",
        observation("obs-2", "amended"),
        now,
    )
    .await
    .unwrap();

    let adapter = MockAdapter::new();
    adapter.script_records(vec![
        provider_record("Observation", "obs-1", observation("obs-1", "final"), now),
        provider_record(
            "Observation",
            "obs-2",
            observation("obs-2", "preliminary"),
            now - Duration::hours(2),
        ),
        provider_record("Observation", "obs-3", observation("obs-3", "final"), now),
    ]);
    adapter.delay_pulls(StdDuration::from_millis(300));
    let engine = build_engine(&db, adapter.clone()).unwrap();
    engine.start().await.unwrap();

    let mut spec = full_sync(connection_id, SyncDirection::Inbound, 3);
    spec.patient_id = Some("pat-1".to_string());
    let job = engine.orchestrator.create_job(spec).await.unwrap();
    assert!(
        eventually(|| {
            let adapter = adapter.clone();
            async move { adapter.pull_calls() >= 1 }
        })
        .await
    );

    engine.shutdown_with_grace(StdDuration::from_secs(5)).await;

    let details = engine.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);

    let report = engine
        .statistics
        .query(Some(connection_id), None)
        .await
        .unwrap();
    let totals = report.totals.counters;
    assert_eq!(totals.jobs_completed, 1);
    assert_eq!(totals.records_processed, 3);
    assert_eq!(totals.conflicts_detected, 1);
    assert_eq!(totals.conflicts_resolved, 1);
    assert_eq!(totals.records_failed, 0);
}
