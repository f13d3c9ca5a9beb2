// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWX-compatible REST client.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | ping | `GET {api}/ping/` |
//! | launch | `POST {api}/job_templates/{id}/launch/` |
//! | status, artifacts | `GET {api}/jobs/{id}/` |
//! | output | `GET {api}/jobs/{id}/stdout/?format=txt` |
//! | cancel | `POST {api}/jobs/{id}/cancel/` |
//!
//! `{api}` is the configured base URL with `/api/v2` appended when missing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::traits::*;
use crate::preview::mask_token;

const API_SUFFIX: &str = "/api/v2";

/// Connection settings for [`AwxClient`].
#[derive(Clone)]
pub struct AwxConfig {
    /// Server URL, with or without `/api/v2`.
    pub base_url: String,
    /// Bearer token.
    pub token: String,
    /// Timeout for a single request.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for AwxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwxConfig")
            .field("base_url", &self.base_url)
            .field("token", &mask_token(&self.token))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Normalize a base URL: trim trailing slashes and append `/api/v2`.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with(API_SUFFIX) {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, API_SUFFIX)
    }
}

/// Whether the settings look usable. Empty values and placeholder hosts
/// count as not configured.
pub fn is_configured(base_url: &str, token: &str) -> bool {
    let base_url = base_url.trim();
    !base_url.is_empty() && !token.trim().is_empty() && !base_url.contains("example.com")
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    id: Option<u64>,
    job: Option<u64>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobDetail {
    status: String,
    #[serde(default)]
    job_explanation: Option<String>,
    #[serde(default)]
    result_traceback: Option<String>,
}

/// HTTP client for AWX-compatible job servers.
pub struct AwxClient {
    http: Client,
    api_base: String,
    token: String,
    configured: bool,
}

impl AwxClient {
    /// Build a client. Never contacts the server.
    pub fn new(config: AwxConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            configured: is_configured(&config.base_url, &config.token),
            api_base: normalize_base_url(&config.base_url),
            token: config.token,
        })
    }

    /// Normalized API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(RemoteError::NotConfigured(
                "set TASKLANE_REMOTE_BASE_URL and TASKLANE_REMOTE_TOKEN".to_string(),
            ))
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
    }

    async fn fetch_job(&self, remote_id: &str) -> Result<Value> {
        self.ensure_configured()?;
        let response = self
            .get(&format!("/jobs/{}/", remote_id))
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let response = check_status(response, remote_id).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

/// Map non-success responses onto [`RemoteError`].
async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = error_detail(response).await;
    Err(match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(format!("{}: {}", what, detail)),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("HTTP {}: {}", s.as_u16(), detail))
        }
        s => RemoteError::Rejected {
            status: s.as_u16(),
            detail,
        },
    })
}

/// Pull the `detail` field out of an error body, else the raw text.
async fn error_detail(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) {
        if let Some(Value::String(detail)) = map.get("detail") {
            return detail.clone();
        }
        return Value::Object(map).to_string();
    }

    if text.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        text
    }
}

#[async_trait]
impl RemoteJobClient for AwxClient {
    fn client_type(&self) -> &'static str {
        "awx"
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_configured()?;

        let response = self
            .get("/ping/")
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Unreachable(format!(
                "ping returned HTTP {}",
                status.as_u16()
            )))
        }
    }

    async fn launch(&self, template_id: &str, body: &Value) -> Result<LaunchedJob> {
        self.ensure_configured()?;
        debug!(template_id = %template_id, "Launching job template");

        let response = self
            .post(&format!("/job_templates/{}/launch/", template_id))
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                detail: error_detail(response).await,
            });
        }

        let launched: LaunchResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let remote_id = launched
            .job
            .or(launched.id)
            .ok_or_else(|| RemoteError::Decode("launch response has no job id".to_string()))?;

        Ok(LaunchedJob {
            remote_id: remote_id.to_string(),
            status: RemoteStatus::parse(launched.status.as_deref().unwrap_or("pending")),
        })
    }

    async fn get_status(&self, remote_id: &str) -> Result<JobSnapshot> {
        let raw = self.fetch_job(remote_id).await?;
        let detail: JobDetail =
            serde_json::from_value(raw.clone()).map_err(|e| RemoteError::Decode(e.to_string()))?;

        Ok(JobSnapshot {
            status: RemoteStatus::parse(&detail.status),
            job_explanation: detail.job_explanation,
            result_traceback: detail.result_traceback,
            raw,
        })
    }

    async fn get_output(&self, remote_id: &str) -> Result<String> {
        self.ensure_configured()?;
        let response = self
            .get(&format!("/jobs/{}/stdout/", remote_id))
            .query(&[("format", "txt")])
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let response = check_status(response, remote_id).await?;
        response
            .text()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn get_artifacts(&self, remote_id: &str) -> Result<Value> {
        let raw = self.fetch_job(remote_id).await?;
        Ok(match raw {
            Value::Object(mut map) => map
                .remove("artifacts")
                .filter(|a| !a.is_null())
                .unwrap_or_else(|| Value::Object(Default::default())),
            _ => Value::Object(Default::default()),
        })
    }

    async fn cancel(&self, remote_id: &str) -> Result<()> {
        self.ensure_configured()?;
        let response = self
            .post(&format!("/jobs/{}/cancel/", remote_id))
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        check_status(response, remote_id).await?;
        Ok(())
    }

    fn launch_endpoint(&self, template_id: &str) -> LaunchEndpoint {
        LaunchEndpoint {
            method: "POST",
            url: format!("{}/job_templates/{}/launch/", self.api_base, template_id),
            masked_token: if self.token.is_empty() {
                None
            } else {
                Some(mask_token(&self.token))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "abcdefgh1234567890wxyz";

    fn client_for(server: &MockServer) -> AwxClient {
        AwxClient::new(AwxConfig {
            base_url: server.uri(),
            token: TOKEN.to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client should build")
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://awx.internal"),
            "https://awx.internal/api/v2"
        );
        assert_eq!(
            normalize_base_url("https://awx.internal/"),
            "https://awx.internal/api/v2"
        );
        assert_eq!(
            normalize_base_url("https://awx.internal/api/v2/"),
            "https://awx.internal/api/v2"
        );
    }

    #[test]
    fn test_is_configured() {
        assert!(is_configured("https://awx.internal", "t"));
        assert!(!is_configured("", "t"));
        assert!(!is_configured("https://awx.internal", " "));
        assert!(!is_configured("https://awx.example.com", "t"));
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails_ping_without_request() {
        let client = AwxClient::new(AwxConfig {
            base_url: String::new(),
            token: String::new(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap();

        assert!(matches!(
            client.ping().await,
            Err(RemoteError::NotConfigured(_))
        ));
        assert!(client.launch_endpoint("1").masked_token.is_none());
    }

    #[tokio::test]
    async fn test_ping_sends_bearer_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/ping/"))
            .and(header("Authorization", format!("Bearer {}", TOKEN).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "23.0"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        client_for(&mock_server).ping().await.expect("ping should pass");
    }

    #[tokio::test]
    async fn test_ping_server_error_is_unreachable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/ping/"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let err = client_for(&mock_server).ping().await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_launch_returns_job_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v2/job_templates/7/launch/"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"job": 4711, "id": 4711, "status": "pending"})),
            )
            .mount(&mock_server)
            .await;

        let launched = client_for(&mock_server)
            .launch("7", &json!({"extra_vars": {"host": "web01"}}))
            .await
            .unwrap();
        assert_eq!(launched.remote_id, "4711");
        assert_eq!(launched.status, RemoteStatus::Pending);
    }

    #[tokio::test]
    async fn test_launch_rejection_preserves_detail() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v2/job_templates/99/launch/"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Not found."})))
            .mount(&mock_server)
            .await;

        let err = client_for(&mock_server)
            .launch("99", &json!({}))
            .await
            .unwrap_err();
        match err {
            RemoteError::Rejected { status, detail } => {
                assert_eq!(status, 404);
                assert_eq!(detail, "Not found.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_status_and_artifacts() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/jobs/4711/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 4711,
                "status": "failed",
                "job_explanation": "Previous Task Failed",
                "result_traceback": "",
                "artifacts": {"x": 1}
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let snapshot = client.get_status("4711").await.unwrap();
        assert_eq!(snapshot.status, RemoteStatus::Failed);
        assert_eq!(snapshot.failure_message(), Some("Previous Task Failed"));
        assert_eq!(snapshot.raw["id"], 4711);

        let artifacts = client.get_artifacts("4711").await.unwrap();
        assert_eq!(artifacts, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_get_status_server_error_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/jobs/1/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let err = client_for(&mock_server).get_status("1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
    }

    #[tokio::test]
    async fn test_get_output_requests_text() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/jobs/4711/stdout/"))
            .and(query_param("format", "txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("PLAY RECAP *****"))
            .mount(&mock_server)
            .await;

        let output = client_for(&mock_server).get_output("4711").await.unwrap();
        assert_eq!(output, "PLAY RECAP *****");
    }

    #[tokio::test]
    async fn test_cancel() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v2/jobs/4711/cancel/"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/jobs/4712/cancel/"))
            .respond_with(
                ResponseTemplate::new(405).set_body_json(json!({"detail": "Method not allowed."})),
            )
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        client.cancel("4711").await.expect("cancel should pass");
        let err = client.cancel("4712").await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 405, .. }));
    }

    #[tokio::test]
    async fn test_launch_endpoint_masks_token() {
        let mock_server = MockServer::start().await;
        let endpoint = client_for(&mock_server).launch_endpoint("7");
        assert_eq!(
            endpoint.url,
            format!("{}/api/v2/job_templates/7/launch/", mock_server.uri())
        );
        assert_eq!(endpoint.masked_token.as_deref(), Some("abcdefgh...wxyz"));
    }
}
