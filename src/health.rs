//! Periodic re-probe of nodes taken out of rotation by failover.
//!
//! Nothing is re-enabled automatically unless a [`HealthMonitor`] is
//! spawned. Nodes disabled by an operator are never probed.

use futures::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deployment::Deployment;
use crate::loadbalancer::UnavailableReason;

/// Shortest interval accepted by [`HealthMonitor::new`].
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct HealthMonitor {
    deployment: Arc<Deployment>,
    client: Client,
    interval: Duration,
}

impl HealthMonitor {
    /// `client` should carry a short timeout; probes are not retried.
    /// `interval` is raised to [`MIN_INTERVAL`] if shorter.
    pub fn new(deployment: Arc<Deployment>, client: Client, interval: Duration) -> Self {
        Self {
            deployment,
            client,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Run until the returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!("Health monitor started (interval {:?})", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let restored = self.probe_unavailable().await;
            if restored > 0 {
                info!("Health monitor restored {} node(s)", restored);
            }
        }
    }

    /// Probe every node removed by failover and put back those answering
    /// 200. Returns how many were restored.
    pub async fn probe_unavailable(&self) -> usize {
        let candidates: Vec<_> = self
            .deployment
            .datacenters()
            .iter()
            .flat_map(|dc| {
                dc.unavailable_nodes()
                    .into_iter()
                    .filter(|(_, reason)| *reason != Some(UnavailableReason::Manual))
                    .map(move |(node, _)| (dc.clone(), node))
            })
            .collect();

        if candidates.is_empty() {
            return 0;
        }
        debug!("Probing {} unavailable node(s)", candidates.len());

        let probes = candidates.into_iter().map(|(dc, node)| {
            let client = &self.client;
            async move {
                let alive = node.is_alive(client).await;
                (dc, node, alive)
            }
        });

        let mut restored = 0;
        for (dc, node, alive) in join_all(probes).await {
            if !alive {
                continue;
            }
            match self.deployment.reset_node(dc.id(), node.id()) {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to restore {}: {}", node.id(), e);
                    continue;
                }
            }
            if self.deployment.is_datacenter_available(dc.id()) == Some(false) {
                if let Err(e) = self.deployment.restore_datacenter(dc.id()) {
                    warn!("Failed to restore datacenter {}: {}", dc.id(), e);
                }
            }
        }
        restored
    }
}
