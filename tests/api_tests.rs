mod test_utils;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use ehr_sync::models::enums::SyncDirection;
use ehr_sync::server::{AppState, create_app};
use serde_json::{Value, json};
use test_utils::*;
use tower::ServiceExt;
use uuid::Uuid;

async fn app() -> (Router, Uuid) {
    let db = setup_test_db().await.unwrap();
    let connection_id = insert_connection(&db, &["Observation"], SyncDirection::Inbound)
        .await
        .unwrap();
    let engine = build_engine(&db, MockAdapter::new()).unwrap();
    (create_app(AppState::new(engine)), connection_id)
}

fn authorized(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header(header::AUTHORIZATION, format!("Bearer {OPERATOR_TOKEN}"))
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let (app, _) = app().await;

    let missing = app
        .clone()
        .oneshot(Request::get("/sync/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .oneshot(
            Request::get("/sync/jobs")
                .header(header::AUTHORIZATION, "Bearer not-the-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_is_public_and_reports_database_and_queues() {
    let (app, _) = app().await;

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "up");
    assert_eq!(body["providers"], json!([PROVIDER]));
    assert!(body["queues"].is_object());
}

#[tokio::test]
async fn job_can_be_created_fetched_and_cancelled() {
    let (app, connection_id) = app().await;

    let created = app
        .clone()
        .oneshot(
            authorized(Request::post("/sync/jobs"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "connectionId": connection_id,
                        "type": "FULL",
                        "direction": "INBOUND",
                        "resourceTypes": ["Observation"]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::ACCEPTED);
    let body = json_body(created).await;
    assert_eq!(body["status"], "PENDING");
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let fetched = app
        .clone()
        .oneshot(
            authorized(Request::get(format!("/sync/jobs/{job_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    let body = json_body(fetched).await;
    assert_eq!(body["id"], job_id.as_str());
    assert_eq!(body["errors"], json!([]));

    let cancelled = app
        .oneshot(
            authorized(Request::delete(format!("/sync/jobs/{job_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(json_body(cancelled).await["status"], "CANCELLED");
}

#[tokio::test]
async fn create_job_for_unknown_connection_is_not_found() {
    let (app, _) = app().await;

    let response = app
        .oneshot(
            authorized(Request::post("/sync/jobs"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "connectionId": Uuid::new_v4(),
                        "type": "FULL",
                        "direction": "INBOUND",
                        "resourceTypes": ["Observation"]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_job_id_is_a_validation_error() {
    let (app, _) = app().await;

    let response = app
        .oneshot(
            authorized(Request::get("/sync/jobs/not-a-uuid"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn webhook_receive_for_unknown_config_is_not_found() {
    let (app, _) = app().await;

    let response = app
        .oneshot(
            Request::post("/sync/webhooks/receive")
                .header("x-webhook-id", Uuid::new_v4().to_string())
                .header("x-signature-sha256", "sha256=00")
                .body(Body::from(r#"{"eventType":"resource.updated"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn statistics_reject_unknown_range() {
    let (app, _) = app().await;

    let response = app
        .oneshot(
            authorized(Request::get("/sync/statistics?range=fortnight"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn conflicts_list_is_empty_for_a_fresh_database() {
    let (app, _) = app().await;

    let response = app
        .oneshot(
            authorized(Request::get("/sync/conflicts?status=OPEN"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
