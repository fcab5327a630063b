//! Command-line interface for inspecting and exercising a deployment.
//!
//! Provides:
//! - `status`: topology snapshot as YAML
//! - `check`: concurrent health probe of every node
//! - `call`: one request through the failover path

use clap::{Parser, Subcommand};
use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::DeploymentConfig;
use crate::error::{DeployError, Result};
use crate::executor::{ApiRequest, ApiResponse, CallExecutor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file; searched in the default locations when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides `logging.level` from the configuration
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the deployment topology and availability
    Status,
    /// Probe the health endpoint of every node
    Check,
    /// Execute one call through the deployment
    Call {
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Path appended to the selected node's endpoint
        #[arg(short, long)]
        path: String,
        /// Request body
        #[arg(short, long)]
        data: Option<String>,
        /// Extra header as `Name: value`; repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub datacenter: String,
    pub node: String,
    pub endpoint: String,
    pub alive: bool,
}

pub struct CliHandler {
    config: DeploymentConfig,
    executor: CallExecutor,
}

impl CliHandler {
    pub fn new(config: DeploymentConfig) -> Result<Self> {
        let executor = config.build_executor()?;
        Ok(Self { config, executor })
    }

    pub fn load(path: Option<&PathBuf>) -> Result<DeploymentConfig> {
        match path {
            Some(path) => DeploymentConfig::load_from_file(path),
            None => DeploymentConfig::load(),
        }
    }

    pub fn executor(&self) -> &CallExecutor {
        &self.executor
    }

    pub fn status(&self) -> Result<String> {
        let snapshot = self.executor.deployment().snapshot();
        Ok(serde_yaml::to_string(&snapshot)?)
    }

    pub async fn check(&self) -> Result<Vec<NodeHealth>> {
        let client = self.config.http_client()?;
        let deployment = Arc::clone(self.executor.deployment());
        let probes = deployment.datacenters().iter().flat_map(|dc| {
            let client = client.clone();
            dc.nodes().into_iter().map(move |node| {
                let client = client.clone();
                let datacenter = dc.id().to_string();
                async move {
                    let alive = node.is_alive(&client).await;
                    debug!("{} alive={}", node, alive);
                    NodeHealth {
                        datacenter,
                        node: node.id().to_string(),
                        endpoint: node.health_check_endpoint().to_string(),
                        alive,
                    }
                }
            })
        });
        Ok(join_all(probes).await)
    }

    pub async fn call(
        &self,
        method: &str,
        path: &str,
        data: Option<String>,
        headers: &[String],
    ) -> Result<ApiResponse> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| DeployError::config(format!("Invalid HTTP method {}", method)))?;
        let mut request = ApiRequest::new(method);
        if let Some(body) = data {
            request = request.with_body(body);
        }
        for header in headers {
            let (name, value) = parse_header(header)?;
            request = request.with_header(name, value);
        }
        self.executor
            .execute(|node| node.url_for(path), request)
            .await
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| DeployError::config(format!("Header must be 'Name: value', got '{}'", raw)))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}
