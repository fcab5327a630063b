//! Call execution with bounded retry and failover.
//!
//! [`CallExecutor::execute`] is the only entry point upper layers need: it
//! picks a node, injects the datacenter token, retries transient failures
//! and drives node and datacenter failover until it has a response, a
//! non-retryable application error, or the deployment has failed.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::datacenter::Datacenter;
use crate::deployment::{Deployment, PickedNode};
use crate::error::{DeployError, Result};
use crate::node::Node;

/// Header used by Stargate APIs for the auth token.
pub const DEFAULT_TOKEN_HEADER: &str = "X-Cassandra-Token";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { multiplier: f64, max_delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per node before it is failed over. At least 1.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { multiplier, max_delay } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let millis = (self.delay.as_millis() as f64 * factor).min(max_delay.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn post(body: impl Into<String>) -> Self {
        Self::new(Method::POST).with_body(body)
    }

    pub fn put(body: impl Into<String>) -> Self {
        Self::new(Method::PUT).with_body(body)
    }

    pub fn patch(body: impl Into<String>) -> Self {
        Self::new(Method::PATCH).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    /// Node that produced the response.
    pub node: String,
    pub datacenter: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Result of one pass through pick, token and bounded retry.
enum CallOutcome {
    Done(ApiResponse),
    RetryNode { picked: PickedNode, cause: DeployError },
    RetryDatacenter(String),
    Fatal(DeployError),
}

enum TokenHeader {
    Named(HeaderName),
    Bearer,
}

pub struct CallExecutor {
    deployment: Arc<Deployment>,
    client: Client,
    retry: RetryPolicy,
    token_header: TokenHeader,
}

impl std::fmt::Debug for CallExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallExecutor")
            .field("deployment", &self.deployment)
            .field("retry", &self.retry)
            .finish()
    }
}

impl CallExecutor {
    /// `token_header` names the header carrying the token; `Authorization`
    /// sends it as a bearer token.
    pub fn new(deployment: Arc<Deployment>, client: Client, retry: RetryPolicy, token_header: &str) -> Result<Self> {
        let token_header = if token_header.eq_ignore_ascii_case("authorization") {
            TokenHeader::Bearer
        } else {
            let name = HeaderName::from_bytes(token_header.as_bytes())
                .map_err(|e| DeployError::config(format!("Invalid token header '{}': {}", token_header, e)))?;
            TokenHeader::Named(name)
        };

        Ok(Self {
            deployment,
            client,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
            token_header,
        })
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.deployment
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute one logical call.
    ///
    /// Returns the response, `Application` for a non-retryable 4xx, `Auth`
    /// when no token can be obtained, or `DeploymentFailed` once every
    /// datacenter is exhausted.
    pub async fn execute<F>(&self, url_builder: F, request: ApiRequest) -> Result<ApiResponse>
    where
        F: Fn(&Node) -> String + Send + Sync,
    {
        let span = info_span!("call", id = %Uuid::new_v4(), method = %request.method);
        self.run(&url_builder, &request).instrument(span).await
    }

    async fn run<F>(&self, url_builder: &F, request: &ApiRequest) -> Result<ApiResponse>
    where
        F: Fn(&Node) -> String + Send + Sync,
    {
        loop {
            match self.attempt(url_builder, request).await {
                CallOutcome::Done(response) => return Ok(response),
                CallOutcome::RetryNode { picked, cause } => {
                    self.deployment
                        .failover_node(picked.datacenter.id(), picked.node.id(), &cause)?;
                }
                CallOutcome::RetryDatacenter(dc) => {
                    warn!("Datacenter {} has no available node", dc);
                    if let Err(e) = self.deployment.failover_datacenter(&dc) {
                        error!("Call failed: {}", e);
                        return Err(e);
                    }
                }
                CallOutcome::Fatal(e) => {
                    if !matches!(e, DeployError::Application { .. }) {
                        error!("Call failed: {}", e);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.execute(|node| node.url_for(path), ApiRequest::get()).await
    }

    pub async fn post(&self, path: &str, body: impl Into<String>) -> Result<ApiResponse> {
        self.execute(|node| node.url_for(path), ApiRequest::post(body)).await
    }

    pub async fn put(&self, path: &str, body: impl Into<String>) -> Result<ApiResponse> {
        self.execute(|node| node.url_for(path), ApiRequest::put(body)).await
    }

    pub async fn patch(&self, path: &str, body: impl Into<String>) -> Result<ApiResponse> {
        self.execute(|node| node.url_for(path), ApiRequest::patch(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.execute(|node| node.url_for(path), ApiRequest::delete()).await
    }

    async fn attempt<F>(&self, url_builder: &F, request: &ApiRequest) -> CallOutcome
    where
        F: Fn(&Node) -> String + Send + Sync,
    {
        let picked = match self.deployment.try_pick_node() {
            Ok(picked) => picked,
            Err(DeployError::NoResourceAvailable(dc)) => return CallOutcome::RetryDatacenter(dc),
            Err(e) => return CallOutcome::Fatal(e),
        };

        let url = url_builder(&picked.node);
        if let Err(e) = validate_request(&url, request) {
            return CallOutcome::Fatal(e);
        }
        let mut token = match self.acquire_token(&picked.datacenter).await {
            Ok(token) => token,
            Err(e) => return CallOutcome::Fatal(e),
        };

        let mut attempt = 0;
        let mut auth_retried = false;
        let mut last_error = String::new();

        while attempt < self.retry.max_attempts {
            attempt += 1;
            debug!(
                "{} {} via {} (attempt {}/{})",
                request.method,
                url,
                picked.node.id(),
                attempt,
                self.retry.max_attempts
            );

            match self.send(&url, request, &token).await {
                Ok((status, headers, body)) => {
                    if status.is_success() || status.is_redirection() {
                        return CallOutcome::Done(ApiResponse {
                            status: status.as_u16(),
                            headers,
                            body,
                            node: picked.node.id().to_string(),
                            datacenter: picked.datacenter.id().to_string(),
                        });
                    }

                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        if auth_retried {
                            return CallOutcome::Fatal(DeployError::Application {
                                status: status.as_u16(),
                                body,
                            });
                        }
                        auth_retried = true;
                        warn!("{} rejected token with {}, renewing", picked.node.id(), status);
                        token = match picked.datacenter.token_provider().renew(&token).await {
                            Ok(token) => token,
                            Err(e) => return CallOutcome::Fatal(e),
                        };
                        // The extra attempt does not consume the retry budget.
                        attempt -= 1;
                        continue;
                    }

                    if status.is_client_error() {
                        return CallOutcome::Fatal(DeployError::Application {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    last_error = format!("status {}", status);
                }
                Err(e) if e.is_builder() => {
                    // Nothing was sent; the request itself is malformed.
                    return CallOutcome::Fatal(DeployError::InvalidRequest(e.to_string()));
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            let transient = DeployError::TransientNode {
                node: picked.node.id().to_string(),
                message: last_error.clone(),
            };
            debug!("{}", transient);

            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        let cause = DeployError::ResourceUnavailable {
            node: picked.node.id().to_string(),
            attempts: attempt,
            message: last_error,
        };
        CallOutcome::RetryNode { picked, cause }
    }

    /// Token for `datacenter`, with one retry after dropping the cache.
    async fn acquire_token(&self, datacenter: &Datacenter) -> Result<String> {
        match datacenter.token().await {
            Ok(token) => Ok(token),
            Err(first) => {
                warn!("Token for {} unavailable ({}), retrying once", datacenter.id(), first);
                datacenter.token_provider().invalidate();
                datacenter.token().await
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        request: &ApiRequest,
        token: &str,
    ) -> std::result::Result<(StatusCode, HeaderMap, String), reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), url);

        let mut has_content_type = false;
        for (name, value) in &request.headers {
            if self.is_token_header(name) {
                continue;
            }
            has_content_type |= name.eq_ignore_ascii_case(CONTENT_TYPE.as_str());
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &self.token_header {
            TokenHeader::Bearer => builder.bearer_auth(token),
            TokenHeader::Named(name) => builder.header(name.clone(), token),
        };

        if let Some(body) = &request.body {
            if !has_content_type {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok((status, headers, body))
    }

    fn is_token_header(&self, name: &str) -> bool {
        match &self.token_header {
            TokenHeader::Bearer => name.eq_ignore_ascii_case("authorization"),
            TokenHeader::Named(header) => name.eq_ignore_ascii_case(header.as_str()),
        }
    }
}

/// Reject requests that could never be sent, before any node is charged for them.
fn validate_request(url: &str, request: &ApiRequest) -> Result<()> {
    Url::parse(url).map_err(|e| DeployError::InvalidRequest(format!("invalid URL '{}': {}", url, e)))?;
    for (name, value) in &request.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DeployError::InvalidRequest(format!("invalid header name '{}': {}", name, e)))?;
        HeaderValue::from_str(value)
            .map_err(|e| DeployError::InvalidRequest(format!("invalid value for header '{}': {}", name, e)))?;
    }
    Ok(())
}
