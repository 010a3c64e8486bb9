mod test_utils;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use ehr_sync::adapters::AdapterError;
use ehr_sync::collaborators::RecordKey;
use ehr_sync::conflicts::ManualDecision;
use ehr_sync::engine::Engine;
use ehr_sync::models::enums::{
    ConflictStatus, ConflictStrategy, ErrorSeverity, JobType, SyncDirection,
};
use ehr_sync::models::sync_conflict::Model as ConflictModel;
use ehr_sync::orchestrator::{JobSpec, ProcessOutcome};
use ehr_sync::repositories::sync_conflict::ConflictFilter;
use sea_orm::DatabaseConnection;
use serde_json::json;
use test_utils::*;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Escalated {
    engine: Arc<Engine>,
    adapter: Arc<MockAdapter>,
    connection_id: Uuid,
    conflict: ConflictModel,
}

/// Runs a sync in which the remote copy of `Observation/obs-1` diverges from
/// the canonical one under a manual-review policy, leaving one OPEN conflict.
async fn escalated_conflict(db: &DatabaseConnection) -> Escalated {
    let connection_id = insert_connection(db, &["Observation"], SyncDirection::Bidirectional)
        .await
        .unwrap();
    let now = Utc::now();
    seed_record(
        db,
        connection_id,
        "Observation",
        "obs-1",
        json!({ "resourceType": "Observation", "id": "obs-1", "status": "amended" }),
        now - Duration::minutes(10),
    )
    .await
    .unwrap();

    let adapter = MockAdapter::new();
    adapter.script_records(vec![provider_record(
        "Observation",
        "obs-1",
        json!({ "resourceType": "Observation", "id": "obs-1", "status": "final" }),
        now,
    )]);

    let mut config = test_config();
    config
        .conflicts
        .resource_strategies
        .insert("Observation".to_string(), ConflictStrategy::ManualReview);
    let engine = build_engine_with_config(db, adapter.clone(), config).unwrap();

    let job = engine
        .orchestrator
        .create_job(JobSpec {
            connection_id,
            job_type: JobType::Full,
            direction: SyncDirection::Inbound,
            priority: None,
            resource_types: vec!["Observation".to_string()],
            since: None,
            patient_id: None,
            resource_id: None,
            max_attempts: Some(3),
        })
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
    assert_eq!(summary.conflicts_detected, 1);
    assert_eq!(summary.conflicts_resolved, 0);

    let mut open = engine
        .conflicts
        .list(ConflictFilter {
            status: Some(ConflictStatus::Open),
            connection_id: Some(connection_id),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    let conflict = open.remove(0);

    Escalated {
        engine,
        adapter,
        connection_id,
        conflict,
    }
}

async fn canonical_status(engine: &Engine, connection_id: Uuid) -> String {
    let stored = engine
        .collaborators
        .store
        .get(&RecordKey::new(connection_id, "Observation", "obs-1"))
        .await
        .unwrap()
        .expect("canonical record present");
    stored.data["status"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn escalated_conflict_leaves_canonical_record_untouched() {
    let db = setup_test_db().await.unwrap();
    let Escalated {
        engine,
        connection_id,
        conflict,
        ..
    } = escalated_conflict(&db).await;

    assert_eq!(conflict.strategy, ConflictStrategy::ManualReview);
    assert!(conflict.escalation_reason.is_some());
    assert!(conflict.outcome.is_none());
    assert_eq!(canonical_status(&engine, connection_id).await, "amended");
}

#[tokio::test]
async fn keep_local_resolves_and_schedules_propagation() {
    let db = setup_test_db().await.unwrap();
    let Escalated {
        engine,
        connection_id,
        conflict,
        ..
    } = escalated_conflict(&db).await;

    let resolved = engine
        .conflicts
        .resolve_conflict(
            conflict.id,
            ManualDecision::KeepLocal,
            Some("clinician amended".to_string()),
            "operator-1",
        )
        .await
        .unwrap();

    assert!(!resolved.already_resolved);
    assert_eq!(resolved.conflict.status, ConflictStatus::Resolved);
    assert_eq!(resolved.conflict.resolved_by.as_deref(), Some("operator-1"));
    assert_eq!(resolved.conflict.reason.as_deref(), Some("clinician amended"));
    assert_eq!(
        resolved.record.as_ref().and_then(|record| record["status"].as_str()),
        Some("amended")
    );
    assert_eq!(
        resolved.propagation_job_id,
        Some(format!("conflict-propagate-{}", conflict.id))
    );
    assert_eq!(canonical_status(&engine, connection_id).await, "amended");
}

#[tokio::test]
async fn keep_remote_overwrites_canonical_record_without_propagation() {
    let db = setup_test_db().await.unwrap();
    let Escalated {
        engine,
        connection_id,
        conflict,
        ..
    } = escalated_conflict(&db).await;

    let resolved = engine
        .conflicts
        .resolve_conflict(conflict.id, ManualDecision::KeepRemote, None, "operator-1")
        .await
        .unwrap();

    assert_eq!(resolved.conflict.status, ConflictStatus::Resolved);
    assert!(resolved.propagation_job_id.is_none());
    assert_eq!(canonical_status(&engine, connection_id).await, "final");
}

#[tokio::test]
async fn resolving_twice_returns_the_first_outcome() {
    let db = setup_test_db().await.unwrap();
    let Escalated {
        engine,
        connection_id,
        conflict,
        ..
    } = escalated_conflict(&db).await;

    let first = engine
        .conflicts
        .resolve_conflict(conflict.id, ManualDecision::KeepRemote, None, "operator-1")
        .await
        .unwrap();
    let second = engine
        .conflicts
        .resolve_conflict(conflict.id, ManualDecision::KeepLocal, None, "operator-2")
        .await
        .unwrap();

    assert!(second.already_resolved);
    assert!(second.propagation_job_id.is_none());
    assert_eq!(second.conflict.status, first.conflict.status);
    assert_eq!(second.conflict.resolved_by.as_deref(), Some("operator-1"));
    assert_eq!(second.record, first.record);
    assert_eq!(canonical_status(&engine, connection_id).await, "final");
}

#[tokio::test]
async fn ignore_closes_conflict_without_writing() {
    let db = setup_test_db().await.unwrap();
    let Escalated {
        engine,
        connection_id,
        conflict,
        ..
    } = escalated_conflict(&db).await;

    let resolved = engine
        .conflicts
        .resolve_conflict(conflict.id, ManualDecision::Ignore, None, "operator-1")
        .await
        .unwrap();

    assert_eq!(resolved.conflict.status, ConflictStatus::Ignored);
    assert!(resolved.record.is_none());
    assert!(resolved.propagation_job_id.is_none());
    assert_eq!(canonical_status(&engine, connection_id).await, "amended");

    let open = engine
        .conflicts
        .list(ConflictFilter {
            status: Some(ConflictStatus::Open),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn resolving_unknown_conflict_is_not_found() {
    let db = setup_test_db().await.unwrap();
    let engine = build_engine(&db, MockAdapter::new()).unwrap();

    let result = engine
        .conflicts
        .resolve_conflict(Uuid::new_v4(), ManualDecision::KeepLocal, None, "operator-1")
        .await;
    assert!(matches!(
        result,
        Err(ehr_sync::conflicts::ConflictError::NotFound(_))
    ));
}

#[tokio::test]
async fn rejected_propagation_is_recorded_on_the_conflict_and_job() {
    let db = setup_test_db().await.unwrap();
    let Escalated {
        engine,
        adapter,
        conflict,
        ..
    } = escalated_conflict(&db).await;
    adapter.script_push(Err(AdapterError::Unauthorized));
    engine.start().await.unwrap();

    engine
        .conflicts
        .resolve_conflict(conflict.id, ManualDecision::KeepLocal, None, "operator-1")
        .await
        .unwrap();

    let recorded = eventually(|| {
        let engine = Arc::clone(&engine);
        let conflict_id = conflict.id;
        async move {
            engine
                .conflicts
                .get(conflict_id)
                .await
                .unwrap()
                .propagation_error
                .is_some()
        }
    })
    .await;
    engine.shutdown_with_grace(StdDuration::from_secs(2)).await;
    assert!(recorded, "propagation failure was never recorded");

    let current = engine.conflicts.get(conflict.id).await.unwrap();
    assert!(current.propagated_at.is_none());
    assert_eq!(current.status, ConflictStatus::Resolved);
    assert!(adapter.pushed().is_empty());

    let job_id = conflict.job_id.expect("conflict raised by a sync job");
    let errors: Vec<_> = engine
        .orchestrator
        .list_errors(job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|error| error.severity == ErrorSeverity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].resource_ref.as_deref(), Some("Observation/obs-1"));
    assert!(errors[0].message.contains("abandoned"));
    assert!(!errors[0].terminal);
}
