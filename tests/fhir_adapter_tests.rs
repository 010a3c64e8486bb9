use chrono::{TimeZone, Utc};
use ehr_sync::adapters::{
    AdapterError, FhirRestAdapter, ProviderAdapter, ProviderRecord, PullRequest, VENDOR_PROFILES,
    VendorProfile,
};
use ehr_sync::collaborators::ActiveConnection;
use ehr_sync::models::enums::{JobType, SyncDirection};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "provider-access-token";

fn profile(slug: &str) -> VendorProfile {
    *VENDOR_PROFILES
        .iter()
        .find(|profile| profile.slug == slug)
        .expect("known vendor")
}

fn adapter(slug: &str, max_pages: u32) -> FhirRestAdapter {
    FhirRestAdapter::new(profile(slug), reqwest::Client::new(), None, max_pages)
}

fn connection(base_url: &str) -> ActiveConnection {
    ActiveConnection {
        id: Uuid::new_v4(),
        provider_slug: "epic".to_string(),
        display_name: "Epic sandbox".to_string(),
        base_url: Some(base_url.to_string()),
        credentials: Some(json!({ "access_token": TOKEN })),
        permitted_resource_types: vec!["Observation".to_string()],
        sync_direction: SyncDirection::Bidirectional,
        conflict_strategy: None,
        sync_interval_seconds: None,
        last_synced_at: None,
    }
}

fn search(resource_types: &[&str]) -> PullRequest {
    PullRequest {
        job_type: JobType::Full,
        resource_types: resource_types.iter().map(|t| t.to_string()).collect(),
        patient_id: None,
        resource_id: None,
        since: None,
    }
}

fn observation(id: &str) -> serde_json::Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "meta": { "lastUpdated": "2024-03-01T12:00:00Z" }
    })
}

#[tokio::test]
async fn search_follows_next_links_across_pages() {
    let server = MockServer::start().await;
    let base = format!("{}/fhir", server.uri());

    Mock::given(method("GET"))
        .and(path("/fhir/Observation"))
        .and(query_param("_count", "100"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{ "resource": observation("obs-1") }, { "resource": observation("obs-2") }],
            "link": [{ "relation": "next", "url": format!("{base}/Observation?page=2") }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Observation"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{ "resource": observation("obs-3") }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = adapter("epic", 10)
        .pull(&connection(&base), &search(&["Observation"]))
        .await
        .unwrap();

    let ids: Vec<&str> = result
        .records
        .iter()
        .map(|record| record.resource_id.as_str())
        .collect();
    assert_eq!(ids, vec!["obs-1", "obs-2", "obs-3"]);
    assert!(result.bytes_transferred > 0);
    assert_eq!(
        result.records[0].modified_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn page_limit_stops_pagination() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/Observation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{ "resource": observation("obs-1") }],
            "link": [{ "relation": "next", "url": format!("{base}/Observation?page=2") }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = adapter("epic", 1)
        .pull(&connection(&base), &search(&["Observation"]))
        .await
        .unwrap();
    assert_eq!(result.records.len(), 1);
}

#[tokio::test]
async fn incremental_search_scopes_patient_and_last_updated() {
    let server = MockServer::start().await;
    let since = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap();

    Mock::given(method("GET"))
        .and(path("/Observation"))
        .and(query_param("subject", "pat-7"))
        .and(query_param("_lastUpdated", "gt2024-01-15T08:30:00Z"))
        .and(query_param("_count", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = PullRequest {
        job_type: JobType::Incremental,
        resource_types: vec!["Observation".to_string()],
        patient_id: Some("pat-7".to_string()),
        resource_id: None,
        since: Some(since),
    };
    let result = adapter("nextgen", 5)
        .pull(&connection(&server.uri()), &request)
        .await
        .unwrap();
    assert!(result.records.is_empty());
}

#[tokio::test]
async fn single_resource_pull_reads_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Patient/pat-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Patient",
            "id": "pat-1",
            "active": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = PullRequest {
        job_type: JobType::SingleResource,
        resource_types: vec!["Patient".to_string()],
        patient_id: None,
        resource_id: Some("pat-1".to_string()),
        since: None,
    };
    let result = adapter("epic", 5)
        .pull(&connection(&server.uri()), &request)
        .await
        .unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].resource_type, "Patient");
    assert_eq!(result.records[0].data["active"], true);
}

#[tokio::test]
async fn push_puts_the_resource_by_id() {
    let server = MockServer::start().await;
    let data = json!({ "resourceType": "Observation", "id": "obs-1", "status": "amended" });
    Mock::given(method("PUT"))
        .and(path("/Observation/obs-1"))
        .and(header("content-type", "application/fhir+json"))
        .and(body_json(data.clone()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let record = ProviderRecord {
        resource_type: "Observation".to_string(),
        resource_id: "obs-1".to_string(),
        data,
        modified_at: None,
    };
    let pushed = adapter("epic", 5)
        .push(&connection(&server.uri()), &record)
        .await
        .unwrap();
    assert!(pushed.bytes_transferred > 0);
}

#[tokio::test]
async fn http_statuses_map_to_adapter_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Unauthorized"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Broken"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Invalid"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/NotABundle"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "resourceType": "Patient", "id": "x" })),
        )
        .mount(&server)
        .await;

    let fhir = adapter("epic", 5);
    let conn = connection(&server.uri());

    let unauthorized = fhir.pull(&conn, &search(&["Unauthorized"])).await.unwrap_err();
    assert_eq!(unauthorized, AdapterError::Unauthorized);
    assert!(!unauthorized.into_failure().retryable);

    let limited = fhir.pull(&conn, &search(&["Limited"])).await.unwrap_err();
    assert_eq!(limited, AdapterError::RateLimited { retry_after: Some(30) });
    assert!(limited.into_failure().retryable);

    let broken = fhir.pull(&conn, &search(&["Broken"])).await.unwrap_err();
    assert!(matches!(broken, AdapterError::Http { status: 502, .. }));
    assert!(broken.into_failure().retryable);

    let invalid = fhir.pull(&conn, &search(&["Invalid"])).await.unwrap_err();
    assert!(matches!(invalid, AdapterError::Http { status: 400, .. }));
    assert!(!invalid.into_failure().retryable);

    let malformed = fhir.pull(&conn, &search(&["NotABundle"])).await.unwrap_err();
    assert!(matches!(malformed, AdapterError::Malformed(_)));
}

#[tokio::test]
async fn missing_credentials_are_unauthorized() {
    let mut conn = connection("http://127.0.0.1:9");
    conn.credentials = None;
    let result = adapter("epic", 5).pull(&conn, &search(&["Observation"])).await;
    assert_eq!(result, Err(AdapterError::Unauthorized));
}

#[tokio::test]
async fn missing_base_url_is_a_configuration_error() {
    let mut conn = connection("http://127.0.0.1:9");
    conn.base_url = None;
    let result = adapter("epic", 5).pull(&conn, &search(&["Observation"])).await;
    assert!(matches!(result, Err(AdapterError::Configuration(_))));
}
