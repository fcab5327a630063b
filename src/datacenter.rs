use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DeployError, Result};
use crate::loadbalancer::{LoadBalancer, LoadBalancingPolicy, ResourceStatus, UnavailableReason};
use crate::node::Node;
use crate::token::{TokenProvider, TokenStatus};

/// A named group of nodes sharing one token domain.
#[derive(Debug)]
pub struct Datacenter {
    id: String,
    token_provider: Arc<dyn TokenProvider>,
    nodes: HashMap<String, Arc<Node>>,
    order: Vec<String>,
    load_balancer: LoadBalancer<Arc<Node>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatacenterStatus {
    pub id: String,
    pub available_nodes: usize,
    pub nodes: Vec<ResourceStatus>,
    pub token: TokenStatus,
}

impl Datacenter {
    /// Every node starts available with weight `100 / nodes.len()`.
    pub fn new(
        id: impl Into<String>,
        token_provider: Arc<dyn TokenProvider>,
        policy: LoadBalancingPolicy,
        nodes: Vec<Node>,
    ) -> Result<Self> {
        let id = id.into();
        if nodes.is_empty() {
            return Err(DeployError::config(format!("Datacenter {} has no nodes", id)));
        }

        let nodes: Vec<Arc<Node>> = nodes.into_iter().map(Arc::new).collect();
        let order = nodes.iter().map(|n| n.id().to_string()).collect();
        let load_balancer = LoadBalancer::evenly_weighted(
            id.clone(),
            policy,
            nodes.iter().map(|n| (n.id().to_string(), n.clone())).collect(),
        )?;
        let nodes = nodes.into_iter().map(|n| (n.id().to_string(), n)).collect();

        Ok(Self {
            id,
            token_provider,
            nodes,
            order,
            load_balancer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token_provider(&self) -> &Arc<dyn TokenProvider> {
        &self.token_provider
    }

    pub async fn token(&self) -> Result<String> {
        self.token_provider.token().await
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// Nodes in configured order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.order.iter().filter_map(|id| self.nodes.get(id).cloned()).collect()
    }

    pub fn available_nodes(&self) -> usize {
        self.load_balancer.available_count()
    }

    pub fn has_available_node(&self) -> bool {
        self.available_nodes() > 0
    }

    pub fn pick_node(&self) -> Result<Arc<Node>> {
        self.load_balancer.next()
    }

    pub fn mark_node_unavailable(&self, node_id: &str, reason: UnavailableReason) -> Result<bool> {
        self.load_balancer
            .mark_unavailable(node_id, reason)
            .map_err(|_| self.unknown(node_id))
    }

    pub fn reset_node(&self, node_id: &str) -> Result<bool> {
        self.load_balancer.reset(node_id).map_err(|_| self.unknown(node_id))
    }

    pub fn reset(&self) {
        self.load_balancer.reset_all();
    }

    pub fn is_node_available(&self, node_id: &str) -> Option<bool> {
        self.load_balancer.is_available(node_id)
    }

    /// Nodes out of rotation together with the reason they were removed.
    pub fn unavailable_nodes(&self) -> Vec<(Arc<Node>, Option<UnavailableReason>)> {
        self.load_balancer
            .unavailable()
            .into_iter()
            .map(|(_, node, reason)| (node, reason))
            .collect()
    }

    pub fn status(&self) -> DatacenterStatus {
        DatacenterStatus {
            id: self.id.clone(),
            available_nodes: self.available_nodes(),
            nodes: self.load_balancer.snapshot(),
            token: self.token_provider.describe(),
        }
    }

    fn unknown(&self, node_id: &str) -> DeployError {
        DeployError::UnknownNode {
            datacenter: self.id.clone(),
            node: node_id.to_string(),
        }
    }
}
