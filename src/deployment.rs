//! Deployment topology and failover state machine.
//!
//! A [`Deployment`] owns every configured [`Datacenter`] in configuration
//! order and a pointer to the local one. Node failover stays inside the
//! local datacenter; datacenter failover moves the pointer to the next
//! available datacenter in configured order. Once no datacenter is left the
//! deployment is [`DeploymentState::Failed`] until an explicit reset.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::datacenter::{Datacenter, DatacenterStatus};
use crate::error::{DeployError, Result};
use crate::loadbalancer::UnavailableReason;
use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "datacenter", rename_all = "snake_case")]
pub enum DeploymentState {
    /// Serving traffic from the named datacenter
    Normal(String),
    /// No datacenter has an available node
    Failed,
}

/// Node chosen for one call, with the datacenter that owns its token.
#[derive(Debug, Clone)]
pub struct PickedNode {
    pub datacenter: Arc<Datacenter>,
    pub node: Arc<Node>,
}

struct Topology {
    local_dc: String,
    state: DeploymentState,
    availability: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSnapshot {
    pub state: DeploymentState,
    pub local_datacenter: String,
    pub datacenter_failovers: u64,
    pub node_failovers: u64,
    pub datacenters: Vec<DatacenterSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatacenterSnapshot {
    pub available: bool,
    #[serde(flatten)]
    pub status: DatacenterStatus,
}

pub struct Deployment {
    datacenters: Vec<Arc<Datacenter>>,
    index: HashMap<String, usize>,
    default_dc: String,
    topology: RwLock<Topology>,
    dc_failovers: AtomicU64,
    node_failovers: AtomicU64,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("datacenters", &self.index.keys().collect::<Vec<_>>())
            .field("local_dc", &self.local_datacenter())
            .finish()
    }
}

impl Deployment {
    /// Datacenters are kept in the given order, which is also the failover order.
    pub fn new(datacenters: Vec<Datacenter>, local_dc: &str) -> Result<Self> {
        if datacenters.is_empty() {
            return Err(DeployError::config("Deployment has no datacenters"));
        }

        let mut index = HashMap::with_capacity(datacenters.len());
        for (i, dc) in datacenters.iter().enumerate() {
            if index.insert(dc.id().to_string(), i).is_some() {
                return Err(DeployError::config(format!("Duplicate datacenter {}", dc.id())));
            }
        }
        if !index.contains_key(local_dc) {
            return Err(DeployError::config(format!(
                "Local datacenter {} is not part of the deployment",
                local_dc
            )));
        }

        let availability = index.keys().map(|id| (id.clone(), true)).collect();
        Ok(Self {
            datacenters: datacenters.into_iter().map(Arc::new).collect(),
            index,
            default_dc: local_dc.to_string(),
            topology: RwLock::new(Topology {
                local_dc: local_dc.to_string(),
                state: DeploymentState::Normal(local_dc.to_string()),
                availability,
            }),
            dc_failovers: AtomicU64::new(0),
            node_failovers: AtomicU64::new(0),
        })
    }

    pub fn datacenter(&self, id: &str) -> Result<&Arc<Datacenter>> {
        self.index
            .get(id)
            .map(|&i| &self.datacenters[i])
            .ok_or_else(|| DeployError::UnknownDatacenter(id.to_string()))
    }

    /// Datacenters in configured order.
    pub fn datacenters(&self) -> &[Arc<Datacenter>] {
        &self.datacenters
    }

    pub fn local_datacenter(&self) -> String {
        self.topology.read().local_dc.clone()
    }

    pub fn state(&self) -> DeploymentState {
        self.topology.read().state.clone()
    }

    pub fn is_datacenter_available(&self, id: &str) -> Option<bool> {
        self.topology.read().availability.get(id).copied()
    }

    pub fn datacenter_failovers(&self) -> u64 {
        self.dc_failovers.load(Ordering::SeqCst)
    }

    /// Pick from the local datacenter without failing over.
    ///
    /// Returns `NoResourceAvailable` when the local datacenter is exhausted
    /// and `DeploymentFailed` once the deployment is in its terminal state.
    pub fn try_pick_node(&self) -> Result<PickedNode> {
        let local = {
            let topology = self.topology.read();
            if topology.state == DeploymentState::Failed {
                return Err(DeployError::DeploymentFailed);
            }
            topology.local_dc.clone()
        };

        let datacenter = self.datacenter(&local)?.clone();
        let node = datacenter.pick_node()?;
        Ok(PickedNode { datacenter, node })
    }

    /// Pick a node, failing over once per exhausted datacenter.
    pub fn pick_node(&self) -> Result<PickedNode> {
        for _ in 0..=self.datacenters.len() {
            match self.try_pick_node() {
                Err(DeployError::NoResourceAvailable(dc)) => {
                    self.failover_datacenter(&dc)?;
                }
                other => return other,
            }
        }
        Err(DeployError::DeploymentFailed)
    }

    /// Take `node_id` out of rotation in `dc_id`. Leaves the local pointer alone.
    /// Returns `true` if this call changed the node's state.
    pub fn failover_node(&self, dc_id: &str, node_id: &str, cause: &DeployError) -> Result<bool> {
        let changed = self
            .datacenter(dc_id)?
            .mark_node_unavailable(node_id, UnavailableReason::Failover)?;
        if changed {
            self.node_failovers.fetch_add(1, Ordering::SeqCst);
            warn!("Node failover: {} in {} is unavailable ({})", node_id, dc_id, cause);
        }
        Ok(changed)
    }

    /// Operator removal of a node. Health probes never bring it back;
    /// only `reset_node` or a datacenter reset does.
    pub fn disable_node(&self, dc_id: &str, node_id: &str) -> Result<bool> {
        let changed = self
            .datacenter(dc_id)?
            .mark_node_unavailable(node_id, UnavailableReason::Manual)?;
        if changed {
            info!("Node {} in {} disabled", node_id, dc_id);
        }
        Ok(changed)
    }

    /// Move the local pointer away from `from`.
    ///
    /// If another caller already moved it, the current local datacenter is
    /// returned unchanged. Fails with `DeploymentFailed` when no datacenter
    /// remains; that state is terminal until a reset.
    pub fn failover_datacenter(&self, from: &str) -> Result<Arc<Datacenter>> {
        let start = *self
            .index
            .get(from)
            .ok_or_else(|| DeployError::UnknownDatacenter(from.to_string()))?;

        let mut topology = self.topology.write();
        if topology.state == DeploymentState::Failed {
            return Err(DeployError::DeploymentFailed);
        }
        if topology.local_dc != from {
            let current = topology.local_dc.clone();
            return self.datacenter(&current).cloned();
        }

        topology.availability.insert(from.to_string(), false);
        let count = self.datacenters.len();
        for offset in 1..count {
            let candidate = &self.datacenters[(start + offset) % count];
            if topology.availability.get(candidate.id()).copied().unwrap_or(false) {
                topology.local_dc = candidate.id().to_string();
                topology.state = DeploymentState::Normal(candidate.id().to_string());
                self.dc_failovers.fetch_add(1, Ordering::SeqCst);
                warn!("Datacenter failover: {} -> {}", from, candidate.id());
                return Ok(candidate.clone());
            }
        }

        topology.state = DeploymentState::Failed;
        error!("Datacenter {} exhausted and no datacenter remains available", from);
        Err(DeployError::DeploymentFailed)
    }

    pub fn reset_node(&self, dc_id: &str, node_id: &str) -> Result<bool> {
        let changed = self.datacenter(dc_id)?.reset_node(node_id)?;
        if changed {
            info!("Node {} in {} back in rotation", node_id, dc_id);
        }
        Ok(changed)
    }

    /// Re-enable a datacenter and all of its nodes. A failed deployment
    /// resumes on this datacenter.
    pub fn reset_datacenter(&self, dc_id: &str) -> Result<()> {
        self.datacenter(dc_id)?.reset();
        self.restore_datacenter(dc_id)
    }

    /// Mark a datacenter available again without touching its nodes.
    pub(crate) fn restore_datacenter(&self, dc_id: &str) -> Result<()> {
        self.datacenter(dc_id)?;
        let mut topology = self.topology.write();
        topology.availability.insert(dc_id.to_string(), true);
        if topology.state == DeploymentState::Failed {
            topology.local_dc = dc_id.to_string();
            topology.state = DeploymentState::Normal(dc_id.to_string());
            info!("Deployment recovered on datacenter {}", dc_id);
        } else {
            info!("Datacenter {} back in rotation", dc_id);
        }
        Ok(())
    }

    /// Restore every datacenter and node and point back at the configured
    /// local datacenter.
    pub fn reset_all(&self) {
        for dc in &self.datacenters {
            dc.reset();
        }
        let mut topology = self.topology.write();
        for available in topology.availability.values_mut() {
            *available = true;
        }
        topology.local_dc = self.default_dc.clone();
        topology.state = DeploymentState::Normal(self.default_dc.clone());
        info!("Deployment reset to {}", self.default_dc);
    }

    /// Switch the local datacenter by hand. The target must be available.
    pub fn set_local_datacenter(&self, dc_id: &str) -> Result<()> {
        self.datacenter(dc_id)?;
        let mut topology = self.topology.write();
        if !topology.availability.get(dc_id).copied().unwrap_or(false) {
            return Err(DeployError::NoResourceAvailable(dc_id.to_string()));
        }
        topology.local_dc = dc_id.to_string();
        topology.state = DeploymentState::Normal(dc_id.to_string());
        info!("Local datacenter set to {}", dc_id);
        Ok(())
    }

    pub fn snapshot(&self) -> DeploymentSnapshot {
        let (state, local_datacenter, availability) = {
            let topology = self.topology.read();
            (
                topology.state.clone(),
                topology.local_dc.clone(),
                topology.availability.clone(),
            )
        };

        DeploymentSnapshot {
            state,
            local_datacenter,
            datacenter_failovers: self.dc_failovers.load(Ordering::SeqCst),
            node_failovers: self.node_failovers.load(Ordering::SeqCst),
            datacenters: self
                .datacenters
                .iter()
                .map(|dc| DatacenterSnapshot {
                    available: availability.get(dc.id()).copied().unwrap_or(false),
                    status: dc.status(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalancer::LoadBalancingPolicy;
    use crate::token::StaticTokenProvider;

    fn dc(id: &str, nodes: &[&str]) -> Datacenter {
        let nodes = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let port = 9100 + i;
                Node::parse(*n, &format!("http://127.0.0.1:{}", port), &format!("http://127.0.0.1:{}/health", port))
                    .unwrap()
            })
            .collect();
        Datacenter::new(id, Arc::new(StaticTokenProvider::new(id)), LoadBalancingPolicy::RoundRobin, nodes).unwrap()
    }

    fn deployment() -> Deployment {
        Deployment::new(
            vec![dc("dc1", &["n1", "n2"]), dc("dc2", &["n3"]), dc("dc3", &["n4"])],
            "dc1",
        )
        .unwrap()
    }

    fn cause() -> DeployError {
        DeployError::ResourceUnavailable {
            node: "test".into(),
            attempts: 3,
            message: "503".into(),
        }
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(Deployment::new(vec![], "dc1"), Err(DeployError::Config(_))));
        assert!(matches!(
            Deployment::new(vec![dc("dc1", &["n1"])], "dc9"),
            Err(DeployError::Config(_))
        ));
        assert!(matches!(
            Deployment::new(vec![dc("dc1", &["n1"]), dc("dc1", &["n2"])], "dc1"),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn test_pick_from_local() {
        let deployment = deployment();
        let picked = deployment.pick_node().unwrap();
        assert_eq!(picked.datacenter.id(), "dc1");
        assert_eq!(picked.node.id(), "n1");
        assert_eq!(deployment.pick_node().unwrap().node.id(), "n2");
    }

    #[test]
    fn test_failover_node_is_idempotent() {
        let deployment = deployment();
        assert!(deployment.failover_node("dc1", "n1", &cause()).unwrap());
        assert!(!deployment.failover_node("dc1", "n1", &cause()).unwrap());
        assert_eq!(deployment.local_datacenter(), "dc1");
        for _ in 0..5 {
            assert_eq!(deployment.pick_node().unwrap().node.id(), "n2");
        }
        assert_eq!(deployment.snapshot().node_failovers, 1);
    }

    #[test]
    fn test_exhausted_local_triggers_one_failover() {
        let deployment = deployment();
        deployment.failover_node("dc1", "n1", &cause()).unwrap();
        deployment.failover_node("dc1", "n2", &cause()).unwrap();

        assert!(matches!(deployment.try_pick_node(), Err(DeployError::NoResourceAvailable(dc)) if dc == "dc1"));
        let picked = deployment.pick_node().unwrap();
        assert_eq!(picked.node.id(), "n3");
        assert_eq!(deployment.local_datacenter(), "dc2");
        assert_eq!(deployment.datacenter_failovers(), 1);
        assert_eq!(deployment.is_datacenter_available("dc1"), Some(false));
    }

    #[test]
    fn test_failover_order_is_deterministic() {
        let deployment = Deployment::new(
            vec![dc("dc1", &["n1"]), dc("dc2", &["n2"]), dc("dc3", &["n3"])],
            "dc2",
        )
        .unwrap();
        assert_eq!(deployment.failover_datacenter("dc2").unwrap().id(), "dc3");
        assert_eq!(deployment.failover_datacenter("dc3").unwrap().id(), "dc1");
        assert!(matches!(deployment.failover_datacenter("dc1"), Err(DeployError::DeploymentFailed)));
    }

    #[test]
    fn test_stale_failover_is_noop() {
        let deployment = deployment();
        assert_eq!(deployment.failover_datacenter("dc1").unwrap().id(), "dc2");
        // A second caller that saw dc1 exhausted must not skip dc2.
        assert_eq!(deployment.failover_datacenter("dc1").unwrap().id(), "dc2");
        assert_eq!(deployment.datacenter_failovers(), 1);
    }

    #[test]
    fn test_all_datacenters_exhausted() {
        let deployment = deployment();
        for (dc, node) in [("dc1", "n1"), ("dc1", "n2"), ("dc2", "n3"), ("dc3", "n4")] {
            deployment.failover_node(dc, node, &cause()).unwrap();
        }
        assert!(matches!(deployment.pick_node(), Err(DeployError::DeploymentFailed)));
        assert_eq!(deployment.state(), DeploymentState::Failed);
        assert_eq!(deployment.datacenter_failovers(), 2);
        // Terminal: further picks fail immediately.
        assert!(matches!(deployment.pick_node(), Err(DeployError::DeploymentFailed)));
        assert!(matches!(deployment.try_pick_node(), Err(DeployError::DeploymentFailed)));
    }

    #[test]
    fn test_reset_datacenter_recovers_failed_deployment() {
        let deployment = Deployment::new(vec![dc("dc1", &["n1"]), dc("dc2", &["n2"])], "dc1").unwrap();
        deployment.failover_node("dc1", "n1", &cause()).unwrap();
        deployment.failover_node("dc2", "n2", &cause()).unwrap();
        assert!(deployment.pick_node().is_err());

        deployment.reset_datacenter("dc2").unwrap();
        assert_eq!(deployment.state(), DeploymentState::Normal("dc2".into()));
        assert_eq!(deployment.pick_node().unwrap().node.id(), "n2");
    }

    #[test]
    fn test_reset_all_restores_default() {
        let deployment = deployment();
        deployment.failover_datacenter("dc1").unwrap();
        deployment.failover_node("dc2", "n3", &cause()).unwrap();
        deployment.reset_all();
        assert_eq!(deployment.local_datacenter(), "dc1");
        let snapshot = deployment.snapshot();
        assert!(snapshot.datacenters.iter().all(|dc| dc.available && dc.status.available_nodes > 0));
    }

    #[test]
    fn test_set_local_datacenter() {
        let deployment = deployment();
        deployment.set_local_datacenter("dc3").unwrap();
        assert_eq!(deployment.pick_node().unwrap().node.id(), "n4");
        assert!(matches!(
            deployment.set_local_datacenter("dc9"),
            Err(DeployError::UnknownDatacenter(_))
        ));
        deployment.failover_datacenter("dc3").unwrap();
        assert!(deployment.set_local_datacenter("dc3").is_err());
    }

    #[test]
    fn test_concurrent_failover_switches_once() {
        let deployment = Arc::new(deployment());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let deployment = deployment.clone();
                std::thread::spawn(move || deployment.failover_datacenter("dc1").unwrap().id().to_string())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), "dc2");
        }
        assert_eq!(deployment.datacenter_failovers(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let deployment = deployment();
        let yaml = serde_yaml::to_string(&deployment.snapshot()).unwrap();
        assert!(yaml.contains("local_datacenter: dc1"));
        assert!(yaml.contains("state: normal"));
    }
}
