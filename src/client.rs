//! BrowserStack API client.
//!
//! Wraps the REST worker-management endpoints and the Automate
//! session-tracking endpoint behind the [`WorkerApi`] trait so that session
//! brokers and the run reporter can be exercised against recording mocks in
//! tests. One client is constructed per run from the resolved credentials and
//! shared by reference across all brokers; it is never mutated afterwards.

use std::convert::TryFrom;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::Credentials;

/// Errors surfaced by the BrowserStack API boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("BrowserStack credentials are not configured")]
    MissingCredentials,
    #[error("failed to construct BrowserStack HTTP client: {source}")]
    Build {
        #[source]
        source: reqwest::Error,
    },
    #[error("BrowserStack API call to {context} failed: {source}")]
    Request {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("BrowserStack API call to {context} failed ({status}): {body}")]
    Api {
        context: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to parse BrowserStack response while attempting to {context}: {source}")]
    InvalidResponse {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("worker response did not include an id")]
    MissingWorkerId,
}

/// Remote session status pushed to the Automate endpoint after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

/// Payload sent to the worker-creation endpoint.
///
/// This is the sanitised shape of a browser definition: provider keys plus
/// the target URL the remote browser must load, with all plugin-internal
/// metadata stripped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(
        rename = "browserstack.local",
        skip_serializing_if = "std::ops::Not::not",
        default
    )]
    pub local: bool,
    #[serde(
        rename = "browserstack.localIdentifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub local_identifier: Option<String>,
}

/// One live remote browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorker {
    pub id: u64,
    pub status: Option<String>,
    pub browser_url: Option<String>,
}

impl RemoteWorker {
    /// Automate session identifier, derived from the last path segment of the
    /// live-session URL. Absent until the extended info fetch has populated
    /// `browser_url`.
    pub fn session_id(&self) -> Option<&str> {
        self.browser_url
            .as_deref()
            .and_then(|url| url.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    id: Option<u64>,
    status: Option<String>,
    browser_url: Option<String>,
}

impl TryFrom<WorkerResponse> for RemoteWorker {
    type Error = ClientError;

    fn try_from(value: WorkerResponse) -> Result<Self, Self::Error> {
        let id = value.id.ok_or(ClientError::MissingWorkerId)?;
        Ok(Self {
            id,
            status: value.status,
            browser_url: value.browser_url,
        })
    }
}

/// Provider boundary consumed by session brokers and the run reporter.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Create a remote worker that loads the request's target URL.
    async fn create_worker(&self, request: &WorkerRequest) -> Result<RemoteWorker, ClientError>;

    /// Fetch extended session info for a live worker.
    async fn fetch_worker(&self, worker_id: u64) -> Result<RemoteWorker, ClientError>;

    /// Terminate a worker by id.
    async fn terminate_worker(&self, worker_id: u64) -> Result<(), ClientError>;

    /// Push a final status to the Automate session-tracking endpoint.
    async fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), ClientError>;
}

/// Reqwest-backed [`WorkerApi`] implementation.
///
/// Construction succeeds even without credentials; they surface as
/// [`ClientError::MissingCredentials`] on the first remote call instead.
pub struct BrowserStackClient {
    client: HttpClient,
    credentials: Credentials,
    api_url: String,
    automate_url: String,
}

impl BrowserStackClient {
    pub fn new(
        credentials: Credentials,
        api_url: impl Into<String>,
        automate_url: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let client = HttpClient::builder()
            .build()
            .map_err(|source| ClientError::Build { source })?;

        Ok(Self {
            client,
            credentials,
            api_url: api_url.into(),
            automate_url: automate_url.into(),
        })
    }

    fn auth(&self) -> Result<(&str, &str), ClientError> {
        match (&self.credentials.username, &self.credentials.access_key) {
            (Some(username), Some(access_key)) => Ok((username, access_key)),
            _ => Err(ClientError::MissingCredentials),
        }
    }

    fn api_endpoint(&self, path: &str) -> String {
        join_url(&self.api_url, path)
    }

    fn automate_endpoint(&self, path: &str) -> String {
        join_url(&self.automate_url, path)
    }

    async fn handle_worker_response(
        &self,
        response: reqwest::Response,
        context: &str,
    ) -> Result<RemoteWorker, ClientError> {
        if response.status().is_success() {
            let parsed: WorkerResponse =
                response
                    .json()
                    .await
                    .map_err(|source| ClientError::InvalidResponse {
                        context: context.to_string(),
                        source,
                    })?;
            RemoteWorker::try_from(parsed)
        } else {
            Err(api_error(response, context).await)
        }
    }
}

async fn api_error(response: reqwest::Response, context: &str) -> ClientError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unavailable>".to_string());
    ClientError::Api {
        context: context.to_string(),
        status,
        body,
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[async_trait]
impl WorkerApi for BrowserStackClient {
    async fn create_worker(&self, request: &WorkerRequest) -> Result<RemoteWorker, ClientError> {
        let context = "create worker";
        let (username, access_key) = self.auth()?;
        let url = self.api_endpoint("worker");
        let response = self
            .client
            .post(url)
            .basic_auth(username, Some(access_key))
            .json(request)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                context: context.to_string(),
                source,
            })?;

        self.handle_worker_response(response, context).await
    }

    async fn fetch_worker(&self, worker_id: u64) -> Result<RemoteWorker, ClientError> {
        let context = format!("fetch worker {worker_id}");
        let (username, access_key) = self.auth()?;
        let url = self.api_endpoint(&format!("worker/{worker_id}"));
        let response = self
            .client
            .get(url)
            .basic_auth(username, Some(access_key))
            .send()
            .await
            .map_err(|source| ClientError::Request {
                context: context.clone(),
                source,
            })?;

        self.handle_worker_response(response, &context).await
    }

    async fn terminate_worker(&self, worker_id: u64) -> Result<(), ClientError> {
        let context = format!("terminate worker {worker_id}");
        let (username, access_key) = self.auth()?;
        let url = self.api_endpoint(&format!("worker/{worker_id}"));
        let response = self
            .client
            .delete(url)
            .basic_auth(username, Some(access_key))
            .send()
            .await
            .map_err(|source| ClientError::Request {
                context: context.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response, &context).await)
        }
    }

    async fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), ClientError> {
        let context = format!("update session {session_id}");
        let (username, access_key) = self.auth()?;
        let url = self.automate_endpoint(&format!("sessions/{session_id}.json"));
        let response = self
            .client
            .put(url)
            .basic_auth(username, Some(access_key))
            .json(&json!({ "status": status.as_str() }))
            .send()
            .await
            .map_err(|source| ClientError::Request {
                context: context.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response, &context).await)
        }
    }
}
