//! Client-side deployment layer for multi-datacenter Stargate backends.
//!
//! Tracks nodes grouped by datacenter, balances calls across them, keeps a
//! per-datacenter auth token fresh and fails over between nodes and then
//! datacenters when calls keep failing.

pub mod cli;
pub mod config;
pub mod datacenter;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod health;
pub mod loadbalancer;
pub mod logging;
pub mod node;
pub mod token;

// Re-export common types
pub use config::DeploymentConfig;
pub use datacenter::Datacenter;
pub use deployment::{Deployment, DeploymentState};
pub use error::{DeployError, Result};
pub use executor::{ApiRequest, ApiResponse, CallExecutor, RetryPolicy};
pub use health::HealthMonitor;
pub use loadbalancer::{LoadBalancer, LoadBalancingPolicy, WeightedResource};
pub use node::Node;
pub use token::{HttpTokenProvider, StaticTokenProvider, TokenProvider};
