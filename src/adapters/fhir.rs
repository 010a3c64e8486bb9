//! FHIR R4 REST adapter shared by every supported EHR vendor.
//!
//! Vendors differ only in small ways (page size, how patients are scoped),
//! which a [`VendorProfile`] captures. Wire-level parsing stays minimal: the
//! adapter extracts `resourceType`, `id` and `meta.lastUpdated` and hands the
//! rest of the resource through untouched.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url, header};
use serde_json::Value as JsonValue;

use super::{AdapterError, ProviderAdapter, ProviderRecord, PullRequest, PullResult, PushResult};
use crate::collaborators::ActiveConnection;
use crate::models::enums::JobType;

const FHIR_JSON: &str = "application/fhir+json";
const BODY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorProfile {
    pub slug: &'static str,
    pub display_name: &'static str,
    /// Search parameter used to scope a query to one patient
    pub patient_param: &'static str,
    /// `_count` sent with every search; `None` leaves the server default
    pub page_size: Option<u32>,
}

pub const VENDOR_PROFILES: &[VendorProfile] = &[
    VendorProfile {
        slug: "epic",
        display_name: "Epic",
        patient_param: "patient",
        page_size: Some(100),
    },
    VendorProfile {
        slug: "cerner",
        display_name: "Oracle Health (Cerner)",
        patient_param: "patient",
        page_size: Some(50),
    },
    VendorProfile {
        slug: "athenahealth",
        display_name: "athenahealth",
        patient_param: "patient",
        page_size: Some(100),
    },
    VendorProfile {
        slug: "allscripts",
        display_name: "Allscripts",
        patient_param: "patient",
        page_size: None,
    },
    VendorProfile {
        slug: "nextgen",
        display_name: "NextGen",
        patient_param: "subject",
        page_size: Some(50),
    },
    VendorProfile {
        slug: "eclinicalworks",
        display_name: "eClinicalWorks",
        patient_param: "patient",
        page_size: Some(100),
    },
];

#[derive(Debug, Clone)]
pub struct FhirRestAdapter {
    profile: VendorProfile,
    client: Client,
    default_base_url: Option<String>,
    max_pages: u32,
}

impl FhirRestAdapter {
    pub fn new(
        profile: VendorProfile,
        client: Client,
        default_base_url: Option<String>,
        max_pages: u32,
    ) -> Self {
        Self {
            profile,
            client,
            default_base_url,
            max_pages: max_pages.max(1),
        }
    }

    pub fn profile(&self) -> &VendorProfile {
        &self.profile
    }

    fn base_url(&self, connection: &ActiveConnection) -> Result<String, AdapterError> {
        connection
            .base_url
            .clone()
            .or_else(|| self.default_base_url.clone())
            .map(|base| base.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                AdapterError::Configuration(format!(
                    "no FHIR base URL for {} connection {}",
                    self.profile.slug, connection.id
                ))
            })
    }

    fn access_token<'a>(&self, connection: &'a ActiveConnection) -> Result<&'a str, AdapterError> {
        connection.access_token().ok_or(AdapterError::Unauthorized)
    }

    fn search_url(
        &self,
        base: &str,
        resource_type: &str,
        request: &PullRequest,
    ) -> Result<Url, AdapterError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(patient_id) = &request.patient_id {
            params.push((self.profile.patient_param, patient_id.clone()));
        }
        if let Some(since) = request.since {
            params.push((
                "_lastUpdated",
                format!("gt{}", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ));
        }
        if let Some(page_size) = self.profile.page_size {
            params.push(("_count", page_size.to_string()));
        }
        Url::parse_with_params(&format!("{base}/{resource_type}"), &params)
            .map_err(|e| AdapterError::Configuration(e.to_string()))
    }

    async fn get_json(&self, url: Url, token: &str) -> Result<(JsonValue, u64), AdapterError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header(header::ACCEPT, FHIR_JSON)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;
        let body = response.bytes().await.map_err(map_transport_error)?;
        let json = serde_json::from_slice(&body)
            .map_err(|e| AdapterError::Malformed(format!("invalid JSON: {e}")))?;
        Ok((json, body.len() as u64))
    }

    async fn pull_resource_type(
        &self,
        base: &str,
        token: &str,
        resource_type: &str,
        request: &PullRequest,
        result: &mut PullResult,
    ) -> Result<(), AdapterError> {
        let mut next = Some(self.search_url(base, resource_type, request)?);
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == self.max_pages {
                tracing::warn!(
                    provider = self.profile.slug,
                    resource_type,
                    max_pages = self.max_pages,
                    "Stopped following bundle pages at the page limit"
                );
                break;
            }
            pages += 1;

            let (bundle, bytes) = self.get_json(url, token).await?;
            result.bytes_transferred += bytes;
            result.records.extend(bundle_records(&bundle)?);
            next = next_link(&bundle)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for FhirRestAdapter {
    fn provider(&self) -> &str {
        self.profile.slug
    }

    async fn pull(
        &self,
        connection: &ActiveConnection,
        request: &PullRequest,
    ) -> Result<PullResult, AdapterError> {
        let base = self.base_url(connection)?;
        let token = self.access_token(connection)?;
        let mut result = PullResult::default();

        if request.job_type == JobType::SingleResource {
            let (Some(resource_id), [resource_type]) =
                (&request.resource_id, request.resource_types.as_slice())
            else {
                return Err(AdapterError::Unsupported(
                    "single-resource pulls need exactly one resource type and an id".to_string(),
                ));
            };
            let url = Url::parse(&format!("{base}/{resource_type}/{resource_id}"))
                .map_err(|e| AdapterError::Configuration(e.to_string()))?;
            let (resource, bytes) = self.get_json(url, token).await?;
            result.bytes_transferred = bytes;
            result.records.push(resource_record(&resource)?);
            return Ok(result);
        }

        for resource_type in &request.resource_types {
            self.pull_resource_type(&base, token, resource_type, request, &mut result)
                .await?;
        }

        tracing::debug!(
            provider = self.profile.slug,
            connection_id = %connection.id,
            records = result.records.len(),
            bytes = result.bytes_transferred,
            "FHIR pull finished"
        );
        Ok(result)
    }

    async fn push(
        &self,
        connection: &ActiveConnection,
        record: &ProviderRecord,
    ) -> Result<PushResult, AdapterError> {
        let base = self.base_url(connection)?;
        let token = self.access_token(connection)?;
        let url = Url::parse(&format!(
            "{base}/{}/{}",
            record.resource_type, record.resource_id
        ))
        .map_err(|e| AdapterError::Configuration(e.to_string()))?;

        let body = serde_json::to_vec(&record.data)
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;
        let bytes_transferred = body.len() as u64;

        let response = self
            .client
            .put(url)
            .bearer_auth(token)
            .header(header::ACCEPT, FHIR_JSON)
            .header(header::CONTENT_TYPE, FHIR_JSON)
            .body(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await?;

        Ok(PushResult { bytes_transferred })
    }
}

fn map_transport_error(error: reqwest::Error) -> AdapterError {
    if error.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Network(error.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            Err(AdapterError::RateLimited { retry_after })
        }
        _ => {
            let body = response.text().await.ok().map(|text| {
                if text.chars().count() > BODY_SNIPPET_CHARS {
                    let truncated: String = text.chars().take(BODY_SNIPPET_CHARS).collect();
                    format!("{truncated}...")
                } else {
                    text
                }
            });
            Err(AdapterError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn resource_record(resource: &JsonValue) -> Result<ProviderRecord, AdapterError> {
    let resource_type = resource
        .get("resourceType")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| AdapterError::Malformed("resource without resourceType".to_string()))?;
    let resource_id = resource
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| AdapterError::Malformed(format!("{resource_type} without id")))?;
    let modified_at = resource
        .pointer("/meta/lastUpdated")
        .and_then(JsonValue::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc));

    Ok(ProviderRecord {
        resource_type: resource_type.to_string(),
        resource_id: resource_id.to_string(),
        data: resource.clone(),
        modified_at,
    })
}

fn bundle_records(bundle: &JsonValue) -> Result<Vec<ProviderRecord>, AdapterError> {
    if bundle.get("resourceType").and_then(JsonValue::as_str) != Some("Bundle") {
        return Err(AdapterError::Malformed("expected a Bundle".to_string()));
    }
    bundle
        .get("entry")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("resource"))
                // Search bundles may include OperationOutcome entries alongside matches.
                .filter(|resource| {
                    resource.get("resourceType").and_then(JsonValue::as_str)
                        != Some("OperationOutcome")
                })
                .map(resource_record)
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

fn next_link(bundle: &JsonValue) -> Result<Option<Url>, AdapterError> {
    let next = bundle
        .get("link")
        .and_then(JsonValue::as_array)
        .and_then(|links| {
            links.iter().find(|link| {
                link.get("relation").and_then(JsonValue::as_str) == Some("next")
            })
        })
        .and_then(|link| link.get("url"))
        .and_then(JsonValue::as_str);
    next.map(|url| Url::parse(url).map_err(|e| AdapterError::Malformed(e.to_string())))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundle_entries_become_records() {
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Observation", "id": "a",
                              "meta": {"lastUpdated": "2024-01-02T03:04:05Z"}}},
                {"resource": {"resourceType": "OperationOutcome", "issue": []}},
                {"resource": {"resourceType": "Observation", "id": "b"}}
            ],
            "link": [{"relation": "next", "url": "https://fhir.example/Observation?page=2"}]
        });

        let records = bundle_records(&bundle).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].resource_id, "a");
        assert!(records[0].modified_at.is_some());
        assert!(records[1].modified_at.is_none());

        let next = next_link(&bundle).unwrap().unwrap();
        assert_eq!(next.as_str(), "https://fhir.example/Observation?page=2");
    }

    #[test]
    fn non_bundle_is_malformed() {
        assert!(matches!(
            bundle_records(&json!({"resourceType": "Patient"})),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn resource_without_id_is_malformed() {
        assert!(resource_record(&json!({"resourceType": "Patient"})).is_err());
    }
}
