use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    /// One attempt against one node failed (timeout, connection reset, 5xx).
    #[error("Transient failure on node {node}: {message}")]
    TransientNode { node: String, message: String },

    /// A node exhausted its retry budget.
    #[error("Resource {node} unavailable after {attempts} attempts: {message}")]
    ResourceUnavailable {
        node: String,
        attempts: u32,
        message: String,
    },

    #[error("No resource available in {0}")]
    NoResourceAvailable(String),

    #[error("Deployment failed: no datacenter has an available node")]
    DeploymentFailed,

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Request rejected with status {status}: {body}")]
    Application { status: u16, body: String },

    /// The caller's request cannot be sent (bad URL, header name or value).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown datacenter: {0}")]
    UnknownDatacenter(String),

    #[error("Unknown node {node} in datacenter {datacenter}")]
    UnknownNode { datacenter: String, node: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    pub fn config(msg: impl Into<String>) -> Self {
        DeployError::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        DeployError::Auth(msg.into())
    }

    /// Errors that end a call without a response.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeployError::DeploymentFailed
                | DeployError::Auth(_)
                | DeployError::Application { .. }
                | DeployError::InvalidRequest(_)
                | DeployError::Config(_)
        )
    }

    /// Errors recovered inside the deployment through retry or failover.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::TransientNode { .. }
                | DeployError::ResourceUnavailable { .. }
                | DeployError::NoResourceAvailable(_)
        )
    }
}
