//! Backend node definition and health probe.

use reqwest::{Client, StatusCode, Url};
use std::fmt;
use tracing::debug;

use crate::error::{DeployError, Result};

/// One addressable backend instance.
///
/// Nodes come from static configuration and never change after
/// construction. Identity is the `id`.
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    endpoint: Url,
    health_check_endpoint: Url,
}

impl Node {
    pub fn new(id: impl Into<String>, endpoint: Url, health_check_endpoint: Url) -> Self {
        Self {
            id: id.into(),
            endpoint,
            health_check_endpoint,
        }
    }

    /// Parse both URLs, reporting the node id on failure.
    pub fn parse(id: impl Into<String>, endpoint: &str, health_check_endpoint: &str) -> Result<Self> {
        let id = id.into();
        let endpoint = Url::parse(endpoint)
            .map_err(|e| DeployError::config(format!("Node {} has invalid endpoint '{}': {}", id, endpoint, e)))?;
        let health = Url::parse(health_check_endpoint).map_err(|e| {
            DeployError::config(format!(
                "Node {} has invalid health check endpoint '{}': {}",
                id, health_check_endpoint, e
            ))
        })?;
        Ok(Self::new(id, endpoint, health))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn health_check_endpoint(&self) -> &Url {
        &self.health_check_endpoint
    }

    /// Endpoint joined with `path`, without doubling the separator.
    pub fn url_for(&self, path: &str) -> String {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Single GET against the health endpoint. Only a 200 counts as alive.
    pub async fn is_alive(&self, client: &Client) -> bool {
        match client.get(self.health_check_endpoint.clone()).send().await {
            Ok(response) => {
                let alive = response.status() == StatusCode::OK;
                debug!("Health probe {} -> {} (alive: {})", self.id, response.status(), alive);
                alive
            }
            Err(e) => {
                debug!("Health probe {} failed: {}", self.id, e);
                false
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}
