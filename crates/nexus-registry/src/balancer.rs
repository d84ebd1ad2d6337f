//! Load balancing pickers
//!
//! Pickers select one instance from a non-empty snapshot. They carry at
//! most a small amount of internal state and are safe to share across
//! tasks.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{RegistryError, RegistryResult};
use crate::types::ServiceInstance;

/// Load balancing strategy over a current instance set
pub trait Picker: Send + Sync {
    fn pick(&self, instances: &[ServiceInstance]) -> RegistryResult<ServiceInstance>;
}

// ==================== Round Robin ====================

/// Monotonic round-robin
#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Picker for RoundRobin {
    fn pick(&self, instances: &[ServiceInstance]) -> RegistryResult<ServiceInstance> {
        if instances.is_empty() {
            return Err(RegistryError::NoInstance("empty instance set".to_string()));
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize;
        Ok(instances[idx % instances.len()].clone())
    }
}

// ==================== Random ====================

/// Uniform random choice
#[derive(Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Picker for Random {
    fn pick(&self, instances: &[ServiceInstance]) -> RegistryResult<ServiceInstance> {
        if instances.is_empty() {
            return Err(RegistryError::NoInstance("empty instance set".to_string()));
        }
        let idx = rand::thread_rng().gen_range(0..instances.len());
        Ok(instances[idx].clone())
    }
}

// ==================== Smooth Weighted Round Robin ====================

struct WeightedNode {
    id: String,
    weight: i64,
    current: i64,
}

#[derive(Default)]
struct WrrState {
    nodes: Vec<WeightedNode>,
    fingerprint: String,
}

/// Smooth weighted round-robin (nginx algorithm).
///
/// Picks each instance with frequency proportional to its weight without
/// bursting. Internal nodes are rebuilt whenever the `(id, weight)`
/// fingerprint of the instance set changes.
#[derive(Default)]
pub struct WeightedRoundRobin {
    state: Mutex<WrrState>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Picker for WeightedRoundRobin {
    fn pick(&self, instances: &[ServiceInstance]) -> RegistryResult<ServiceInstance> {
        if instances.is_empty() {
            return Err(RegistryError::NoInstance("empty instance set".to_string()));
        }

        let mut state = self.state.lock().expect("wrr state lock poisoned");

        let fp = fingerprint(instances);
        if fp != state.fingerprint {
            state.nodes = instances
                .iter()
                .map(|inst| WeightedNode {
                    id: inst.id.clone(),
                    weight: inst.weight.max(1) as i64,
                    current: 0,
                })
                .collect();
            state.fingerprint = fp;
        }

        let mut total = 0i64;
        for node in state.nodes.iter_mut() {
            node.current += node.weight;
            total += node.weight;
        }

        let mut best = 0usize;
        for i in 1..state.nodes.len() {
            if state.nodes[i].current > state.nodes[best].current {
                best = i;
            }
        }
        state.nodes[best].current -= total;
        let best_id = state.nodes[best].id.clone();

        instances
            .iter()
            .find(|inst| inst.id == best_id)
            .cloned()
            .ok_or_else(|| RegistryError::NoInstance("instance set changed".to_string()))
    }
}

fn fingerprint(instances: &[ServiceInstance]) -> String {
    let mut fp = String::new();
    for inst in instances {
        fp.push_str(&inst.id);
        fp.push(':');
        fp.push_str(&inst.weight.to_string());
        fp.push(',');
    }
    fp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use std::collections::HashMap;

    fn instances(weights: &[u32]) -> Vec<ServiceInstance> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let mut inst = ServiceInstance::new(
                    "svc",
                    format!("10.0.0.{}:8080", i + 1),
                    Protocol::Http,
                );
                inst.id = format!("node-{}", i + 1);
                inst.weight = w;
                inst
            })
            .collect()
    }

    #[test]
    fn round_robin_is_fair() {
        let set = instances(&[1, 1, 1]);
        let picker = RoundRobin::new();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let picked = picker.pick(&set).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        for inst in &set {
            assert_eq!(counts[&inst.id], 10);
        }
    }

    #[test]
    fn random_rejects_empty_set() {
        assert!(Random::new().pick(&[]).is_err());
        assert!(RoundRobin::new().pick(&[]).is_err());
        assert!(WeightedRoundRobin::new().pick(&[]).is_err());
    }

    #[test]
    fn wrr_distributes_proportionally() {
        // weights [5, 1, 1]: 70 picks must land exactly [50, 10, 10]
        let set = instances(&[5, 1, 1]);
        let picker = WeightedRoundRobin::new();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..70 {
            let picked = picker.pick(&set).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        assert_eq!(counts["node-1"], 50);
        assert_eq!(counts["node-2"], 10);
        assert_eq!(counts["node-3"], 10);
    }

    #[test]
    fn wrr_is_smooth() {
        // the heavy node must never monopolise a long run
        let set = instances(&[4, 1, 1]);
        let picker = WeightedRoundRobin::new();

        let mut longest = 0usize;
        let mut run = 0usize;
        let mut last = String::new();
        for _ in 0..60 {
            let picked = picker.pick(&set).unwrap();
            if picked.id == last {
                run += 1;
            } else {
                run = 1;
                last = picked.id;
            }
            longest = longest.max(run);
        }
        assert!(longest <= 4, "longest run was {}", longest);
    }

    #[test]
    fn wrr_rebuilds_on_weight_change() {
        let mut set = instances(&[1, 1]);
        let picker = WeightedRoundRobin::new();
        picker.pick(&set).unwrap();

        set[0].weight = 3;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            let picked = picker.pick(&set).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        assert_eq!(counts["node-1"], 6);
        assert_eq!(counts["node-2"], 2);
    }
}
