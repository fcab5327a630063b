//! Deployment configuration.
//!
//! Provides:
//! - YAML loading/saving
//! - Validation of the topology
//! - Construction of the deployment, executor and health monitor

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::datacenter::Datacenter;
use crate::deployment::Deployment;
use crate::error::{DeployError, Result};
use crate::executor::{Backoff, CallExecutor, RetryPolicy, DEFAULT_TOKEN_HEADER};
use crate::health::HealthMonitor;
use crate::loadbalancer::LoadBalancingPolicy;
use crate::node::Node;
use crate::token::{Credentials, HttpTokenProvider, StaticTokenProvider, TokenProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Datacenter preferred at startup
    pub local_datacenter: String,
    /// Datacenters in failover order
    pub datacenters: Vec<DatacenterConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatacenterConfig {
    pub id: String,
    #[serde(default)]
    pub policy: LoadBalancingPolicy,
    pub nodes: Vec<NodeConfig>,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub endpoint: String,
    /// Defaults to `{endpoint}/health`
    #[serde(default)]
    pub health_check: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Static token; when set, credentials are ignored
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Base URLs of the auth service; `/v1/auth` is appended
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per node before failover
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Header carrying the token; `Authorization` sends a bearer token
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Re-probe unavailable nodes in the background
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recovery_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily-rotated JSON logs; console only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            local_datacenter: "dc1".to_string(),
            datacenters: vec![DatacenterConfig {
                id: "dc1".to_string(),
                policy: LoadBalancingPolicy::RoundRobin,
                nodes: vec![NodeConfig {
                    id: "node1".to_string(),
                    endpoint: "http://localhost:8082".to_string(),
                    health_check: Some("http://localhost:8084/checker/liveness".to_string()),
                }],
                auth: AuthConfig {
                    token: None,
                    username: Some("cassandra".to_string()),
                    password: Some("cassandra".to_string()),
                    urls: vec!["http://localhost:8081".to_string()],
                    ttl_secs: default_token_ttl(),
                },
            }],
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: BackoffKind::default(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            token_header: default_token_header(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_recovery_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

fn default_token_ttl() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_token_header() -> String {
    DEFAULT_TOKEN_HEADER.to_string()
}

fn default_recovery_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                multiplier: self.multiplier,
                max_delay: Duration::from_millis(self.max_delay_ms),
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.delay_ms),
            backoff,
        }
    }
}

impl NodeConfig {
    pub fn health_check_url(&self) -> String {
        self.health_check
            .clone()
            .unwrap_or_else(|| format!("{}/health", self.endpoint.trim_end_matches('/')))
    }
}

impl DeploymentConfig {
    /// Load from the first existing file among `./stargate.yml`, the user
    /// config directory and `/etc/stargate/config.yml`.
    pub fn load() -> Result<Self> {
        let config_paths = [
            PathBuf::from("stargate.yml"),
            dirs::config_dir()
                .map(|p| p.join("stargate/config.yml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/stargate/config.yml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from_file(path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DeployError::config(format!("Failed to read config file {:?}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| DeployError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write atomically through a temporary file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.datacenters.is_empty() {
            return Err(DeployError::config("At least one datacenter is required"));
        }
        if self.retry.max_attempts == 0 {
            return Err(DeployError::config("retry.max_attempts must be at least 1"));
        }
        if self.recovery.interval_secs == 0 {
            return Err(DeployError::config("recovery.interval_secs must be at least 1"));
        }
        if self.recovery.probe_timeout_ms == 0 {
            return Err(DeployError::config("recovery.probe_timeout_ms must be at least 1"));
        }

        let mut dc_ids = HashSet::new();
        for dc in &self.datacenters {
            if !dc_ids.insert(dc.id.as_str()) {
                return Err(DeployError::config(format!("Duplicate datacenter {}", dc.id)));
            }
            if dc.nodes.is_empty() {
                return Err(DeployError::config(format!("Datacenter {} has no nodes", dc.id)));
            }
            let mut node_ids = HashSet::new();
            for node in &dc.nodes {
                if !node_ids.insert(node.id.as_str()) {
                    return Err(DeployError::config(format!(
                        "Duplicate node {} in datacenter {}",
                        node.id, dc.id
                    )));
                }
            }
            if dc.auth.token.is_none() {
                if dc.auth.username.is_none() || dc.auth.password.is_none() {
                    return Err(DeployError::config(format!(
                        "Datacenter {} needs a static token or username and password",
                        dc.id
                    )));
                }
                if dc.auth.urls.is_empty() {
                    return Err(DeployError::config(format!("Datacenter {} has no auth URL", dc.id)));
                }
            }
        }

        if !dc_ids.contains(self.local_datacenter.as_str()) {
            return Err(DeployError::config(format!(
                "Local datacenter {} is not configured",
                self.local_datacenter
            )));
        }
        Ok(())
    }

    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(self.http.connect_timeout_secs))
            .timeout(Duration::from_secs(self.http.request_timeout_secs))
            .build()
            .map_err(|e| DeployError::config(format!("Failed to create HTTP client: {}", e)))
    }

    pub fn build_deployment(&self, client: &Client) -> Result<Arc<Deployment>> {
        self.validate()?;
        let mut datacenters = Vec::with_capacity(self.datacenters.len());
        for dc in &self.datacenters {
            let nodes = dc
                .nodes
                .iter()
                .map(|n| Node::parse(n.id.clone(), &n.endpoint, &n.health_check_url()))
                .collect::<Result<Vec<_>>>()?;
            let token_provider = self.token_provider(dc, client)?;
            datacenters.push(Datacenter::new(dc.id.clone(), token_provider, dc.policy, nodes)?);
        }
        Ok(Arc::new(Deployment::new(datacenters, &self.local_datacenter)?))
    }

    pub fn build_executor(&self) -> Result<CallExecutor> {
        let client = self.http_client()?;
        let deployment = self.build_deployment(&client)?;
        CallExecutor::new(deployment, client, self.retry.policy(), &self.http.token_header)
    }

    /// Monitor for `deployment` when recovery is enabled.
    pub fn health_monitor(&self, deployment: Arc<Deployment>) -> Result<Option<HealthMonitor>> {
        if !self.recovery.enabled {
            return Ok(None);
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(self.recovery.probe_timeout_ms))
            .build()
            .map_err(|e| DeployError::config(format!("Failed to create probe client: {}", e)))?;
        Ok(Some(HealthMonitor::new(
            deployment,
            client,
            Duration::from_secs(self.recovery.interval_secs),
        )))
    }

    fn token_provider(&self, dc: &DatacenterConfig, client: &Client) -> Result<Arc<dyn TokenProvider>> {
        if let Some(token) = &dc.auth.token {
            return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
        }
        let credentials = Credentials {
            username: dc.auth.username.clone().unwrap_or_default(),
            password: dc.auth.password.clone().unwrap_or_default(),
        };
        let provider = HttpTokenProvider::new(
            &dc.id,
            client.clone(),
            credentials,
            dc.auth.urls.clone(),
            Duration::from_secs(dc.auth.ttl_secs),
            self.retry.max_attempts,
        )?;
        Ok(Arc::new(provider))
    }
}
