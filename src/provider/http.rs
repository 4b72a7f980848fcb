//! REST client for a provisioning API.
//!
//! Endpoints, relative to the configured base URL:
//!
//! - `GET  environments/{environment}/resources` returns `{"resources": [ResourceNode]}`
//! - `POST environments/{environment}/operations` applies one operation
//!
//! HTTP statuses are mapped onto [`ProvisionError`] so that the executor can
//! tell transient failures from permanent ones.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProvisionError;
use crate::graph::{ResourceConfig, ResourceKind, ResourceNode};
use crate::planner::{Action, Operation};

use super::ProvisioningApi;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry delay assumed when a 429 response carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Marker a 409 body carries when the provider has not settled yet.
const NOT_YET_CONSISTENT: &str = "not-yet-consistent";

/// Provisioning API client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    /// HTTP client.
    client: Client,
    /// Base URL, always ending with a slash.
    base_url: String,
    /// Bearer token.
    token: Option<String>,
    /// Per-request timeout.
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ResourcesResponse {
    resources: Vec<ResourceNode>,
}

#[derive(Debug, Serialize)]
struct OperationRequest<'a> {
    target: &'a str,
    kind: ResourceKind,
    action: Action,
    payload: &'a ResourceConfig,
    config_hash: &'a str,
    dependencies: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpProvisioner {
    /// Creates a client for the API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ProvisionError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ProvisionError> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::network(format!("Failed to create HTTP client: {e}")))?;

        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            token,
            timeout,
        })
    }

    fn url(&self, environment: &str, path: &str) -> String {
        format!("{}environments/{environment}/{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    fn transport_error(&self, e: &reqwest::Error) -> ProvisionError {
        if e.is_timeout() {
            ProvisionError::Timeout {
                elapsed: self.timeout,
            }
        } else {
            ProvisionError::network(format!("Request failed: {e}"))
        }
    }

    /// Maps a non-success response onto a provisioning error.
    async fn classify(response: Response, resource: &str) -> ProvisionError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| body.clone());
        let code = parsed.and_then(|b| b.code).unwrap_or_default();

        trace!("Provisioning API returned {status} for {resource}: {body}");

        match status {
            StatusCode::TOO_MANY_REQUESTS => ProvisionError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            },
            StatusCode::CONFLICT if code == NOT_YET_CONSISTENT || body.contains(NOT_YET_CONSISTENT) => {
                ProvisionError::NotYetConsistent {
                    resource: resource.to_string(),
                    message,
                }
            }
            StatusCode::NOT_FOUND => ProvisionError::NotFound {
                resource: resource.to_string(),
            },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ProvisionError::InvalidConfiguration {
                    resource: resource.to_string(),
                    message,
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProvisionError::AuthenticationFailed { message }
            }
            s if s.is_server_error() => ProvisionError::Unavailable {
                status: s.as_u16(),
                message,
            },
            s => ProvisionError::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
impl ProvisioningApi for HttpProvisioner {
    async fn observed_state(&self, environment: &str) -> Result<Vec<ResourceNode>, ProvisionError> {
        let url = self.url(environment, "resources");
        debug!("Fetching observed state from {url}");

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::classify(response, environment).await);
        }

        let parsed: ResourcesResponse =
            response
                .json()
                .await
                .map_err(|e| ProvisionError::InvalidResponse {
                    message: format!("Failed to parse observed state: {e}"),
                })?;
        Ok(parsed.resources)
    }

    async fn apply_operation(
        &self,
        environment: &str,
        operation: &Operation,
    ) -> Result<(), ProvisionError> {
        let url = self.url(environment, "operations");
        debug!("Dispatching {operation} to {url}");

        let body = OperationRequest {
            target: &operation.target,
            kind: operation.kind,
            action: operation.action,
            payload: &operation.payload,
            config_hash: &operation.config_hash,
            dependencies: &operation.resource_dependencies,
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response, &operation.target).await)
        }
    }
}
