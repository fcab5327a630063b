//! Weighted resource selection.
//!
//! A [`LoadBalancer`] owns a fixed, ordered list of [`WeightedResource`]s and
//! hands one out per call according to its [`LoadBalancingPolicy`]. Resources
//! marked unavailable stay in the list so they can be reset later; they are
//! skipped until then.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeployError, Result};

/// Amount removed from `current_weight` on every selection.
pub const WEIGHT_STEP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Cursor-based round robin with per-resource weight decay.
    #[default]
    RoundRobin,
    /// Uniform choice among available resources.
    Random,
    /// Choice proportional to the default weight.
    WeightedRandom,
}

/// Why a resource was taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Exhausted its retry budget during a call
    Failover,
    /// Disabled by an operator
    Manual,
}

#[derive(Debug, Clone)]
pub struct WeightedResource<T> {
    id: String,
    resource: T,
    default_weight: f64,
    current_weight: f64,
    available: bool,
    unavailable_reason: Option<UnavailableReason>,
    use_count: u64,
}

impl<T> WeightedResource<T> {
    pub fn new(id: impl Into<String>, resource: T, weight: f64) -> Self {
        Self {
            id: id.into(),
            resource,
            default_weight: weight,
            current_weight: weight,
            available: true,
            unavailable_reason: None,
            use_count: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }

    pub fn default_weight(&self) -> f64 {
        self.default_weight
    }

    pub fn current_weight(&self) -> f64 {
        self.current_weight
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    fn select(&mut self) {
        self.use_count += 1;
        self.current_weight = (self.current_weight - WEIGHT_STEP).max(0.0);
    }

    fn restore(&mut self) {
        self.available = true;
        self.unavailable_reason = None;
        self.current_weight = self.default_weight;
    }
}

/// Point-in-time view of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub id: String,
    pub available: bool,
    pub reason: Option<UnavailableReason>,
    pub default_weight: f64,
    pub current_weight: f64,
    pub use_count: u64,
}

struct BalancerState<T> {
    resources: Vec<WeightedResource<T>>,
    cursor: usize,
}

pub struct LoadBalancer<T> {
    name: String,
    policy: LoadBalancingPolicy,
    state: Mutex<BalancerState<T>>,
}

impl<T> std::fmt::Debug for LoadBalancer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("resources", &self.state.lock().resources.len())
            .finish()
    }
}

impl<T: Clone> LoadBalancer<T> {
    /// Build a balancer over `resources`. The list must be non-empty, ids
    /// must be unique and weights strictly positive.
    pub fn new(
        name: impl Into<String>,
        policy: LoadBalancingPolicy,
        resources: Vec<WeightedResource<T>>,
    ) -> Result<Self> {
        let name = name.into();
        if resources.is_empty() {
            return Err(DeployError::config(format!("Load balancer {} has no resources", name)));
        }
        for (i, r) in resources.iter().enumerate() {
            if !(r.default_weight > 0.0) {
                return Err(DeployError::config(format!(
                    "Resource {} in {} has non-positive weight {}",
                    r.id, name, r.default_weight
                )));
            }
            if resources[..i].iter().any(|other| other.id == r.id) {
                return Err(DeployError::config(format!("Duplicate resource {} in {}", r.id, name)));
            }
        }

        Ok(Self {
            name,
            policy,
            state: Mutex::new(BalancerState { resources, cursor: 0 }),
        })
    }

    /// Build a balancer where every resource shares `100 / n` of the weight.
    pub fn evenly_weighted(
        name: impl Into<String>,
        policy: LoadBalancingPolicy,
        resources: Vec<(String, T)>,
    ) -> Result<Self> {
        let weight = if resources.is_empty() { 0.0 } else { 100.0 / resources.len() as f64 };
        let resources = resources
            .into_iter()
            .map(|(id, resource)| WeightedResource::new(id, resource, weight))
            .collect();
        Self::new(name, policy, resources)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> LoadBalancingPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().resources.iter().filter(|r| r.available).count()
    }

    /// Select the next available resource.
    pub fn next(&self) -> Result<T> {
        let mut state = self.state.lock();
        if !state.resources.iter().any(|r| r.available) {
            return Err(DeployError::NoResourceAvailable(self.name.clone()));
        }

        let index = match self.policy {
            LoadBalancingPolicy::RoundRobin => Self::next_round_robin(&mut state)
                .ok_or_else(|| DeployError::NoResourceAvailable(self.name.clone()))?,
            LoadBalancingPolicy::Random => Self::next_random(&state),
            LoadBalancingPolicy::WeightedRandom => Self::next_weighted_random(&state),
        };

        let selected = &mut state.resources[index];
        selected.select();
        debug!("{} selected {} (use count {})", self.name, selected.id, selected.use_count);
        Ok(selected.resource.clone())
    }

    fn next_round_robin(state: &mut BalancerState<T>) -> Option<usize> {
        let len = state.resources.len();
        // Second pass runs after every weight is reset to its default.
        for _ in 0..2 {
            for offset in 0..len {
                let index = (state.cursor + offset) % len;
                let candidate = &state.resources[index];
                if candidate.available && candidate.current_weight > 0.0 {
                    state.cursor = (index + 1) % len;
                    return Some(index);
                }
            }
            for r in state.resources.iter_mut() {
                r.current_weight = r.default_weight;
            }
        }
        None
    }

    fn next_random(state: &BalancerState<T>) -> usize {
        let available: Vec<usize> = state
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.available)
            .map(|(i, _)| i)
            .collect();
        available[rand::rng().random_range(0..available.len())]
    }

    fn next_weighted_random(state: &BalancerState<T>) -> usize {
        let total: f64 = state
            .resources
            .iter()
            .filter(|r| r.available)
            .map(|r| r.default_weight)
            .sum();
        let mut point = rand::rng().random::<f64>() * total;
        let mut last = 0;
        for (i, r) in state.resources.iter().enumerate().filter(|(_, r)| r.available) {
            if point < r.default_weight {
                return i;
            }
            point -= r.default_weight;
            last = i;
        }
        // Floating point leftovers land on the last available resource.
        last
    }

    /// Take a resource out of rotation. Returns `true` if it was available.
    pub fn mark_unavailable(&self, id: &str, reason: UnavailableReason) -> Result<bool> {
        let mut state = self.state.lock();
        let resource = state
            .resources
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| self.unknown(id))?;

        if !resource.available {
            return Ok(false);
        }
        resource.available = false;
        resource.unavailable_reason = Some(reason);
        warn!("{}: resource {} marked unavailable ({:?})", self.name, id, reason);
        Ok(true)
    }

    /// Put a resource back into rotation. Returns `true` if it was unavailable.
    pub fn reset(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let resource = state
            .resources
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| self.unknown(id))?;
        let changed = !resource.available;
        resource.restore();
        Ok(changed)
    }

    pub fn reset_all(&self) {
        let mut state = self.state.lock();
        for r in state.resources.iter_mut() {
            r.restore();
        }
    }

    pub fn is_available(&self, id: &str) -> Option<bool> {
        self.state.lock().resources.iter().find(|r| r.id == id).map(|r| r.available)
    }

    /// Resources currently out of rotation, with their reason.
    pub fn unavailable(&self) -> Vec<(String, T, Option<UnavailableReason>)> {
        self.state
            .lock()
            .resources
            .iter()
            .filter(|r| !r.available)
            .map(|r| (r.id.clone(), r.resource.clone(), r.unavailable_reason))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ResourceStatus> {
        self.state
            .lock()
            .resources
            .iter()
            .map(|r| ResourceStatus {
                id: r.id.clone(),
                available: r.available,
                reason: r.unavailable_reason,
                default_weight: r.default_weight,
                current_weight: r.current_weight,
                use_count: r.use_count,
            })
            .collect()
    }

    fn unknown(&self, id: &str) -> DeployError {
        DeployError::UnknownNode {
            datacenter: self.name.clone(),
            node: id.to_string(),
        }
    }
}
