//! Power of two random choices selection
//!
//! Each selection draws two distinct candidates at random and keeps the one
//! with fewer in-flight requests. See
//! <https://www.nginx.com/blog/nginx-power-of-two-choices-load-balancing-algorithm/>.

use crate::node::Node;
use pblb_core::{LoadBalanceMethod, PblbError, PblbResult};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Partition of node indices by health
///
/// Every index is in exactly one of the two sets. Updated together with the
/// node's flag while the lock is held.
#[derive(Debug, Default)]
struct HealthSets {
    healthy: BTreeSet<usize>,
    unhealthy: BTreeSet<usize>,
}

/// Two-choice selector
#[derive(Debug)]
pub struct TwoChoice {
    nodes: Vec<Node>,
    sets: Mutex<HealthSets>,
}

impl TwoChoice {
    /// Create a two-choice selector over at least three nodes
    ///
    /// All nodes start healthy.
    pub fn new(nodes: Vec<Node>) -> PblbResult<Self> {
        let required = LoadBalanceMethod::TwoChoice.min_nodes();
        if nodes.len() < required {
            return Err(PblbError::InsufficientNodes {
                method: LoadBalanceMethod::TwoChoice.to_string(),
                required,
                found: nodes.len(),
            });
        }

        for node in &nodes {
            node.set_healthy(true);
        }
        let sets = HealthSets {
            healthy: (0..nodes.len()).collect(),
            unhealthy: BTreeSet::new(),
        };

        Ok(Self {
            nodes,
            sets: Mutex::new(sets),
        })
    }

    /// All nodes, indexed as in the configuration
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Current (healthy, unhealthy) index sets
    pub fn partition(&self) -> (Vec<usize>, Vec<usize>) {
        let sets = self.lock_sets();
        (
            sets.healthy.iter().copied().collect(),
            sets.unhealthy.iter().copied().collect(),
        )
    }

    /// Pick the less loaded of two random candidates
    ///
    /// Candidates come from the healthy set while it has at least two
    /// members, otherwise from the unhealthy set.
    pub fn select(&self) -> usize {
        let sets = self.lock_sets();
        let pool: Vec<usize> = if sets.healthy.len() >= 2 {
            sets.healthy.iter().copied().collect()
        } else {
            sets.unhealthy.iter().copied().collect()
        };

        let (first, second) = draw_pair(&pool, &mut rand::thread_rng());
        let selected = self.less_loaded(first, second);

        debug!(
            first = %self.nodes[first],
            first_active = self.nodes[first].active_connections(),
            second = %self.nodes[second],
            second_active = self.nodes[second].active_connections(),
            selected = %self.nodes[selected],
            "TwoChoice candidates"
        );

        selected
    }

    fn lock_sets(&self) -> MutexGuard<'_, HealthSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The candidate with strictly fewer active connections, else `first`
    fn less_loaded(&self, first: usize, second: usize) -> usize {
        if self.nodes[second].active_connections() < self.nodes[first].active_connections() {
            second
        } else {
            first
        }
    }

    /// Apply a health outcome, returning whether the node changed sets
    pub fn reconcile(&self, index: usize, healthy: bool) -> bool {
        let mut sets = self.lock_sets();
        let HealthSets {
            healthy: healthy_set,
            unhealthy: unhealthy_set,
        } = &mut *sets;

        let (from, to) = if healthy {
            (unhealthy_set, healthy_set)
        } else {
            (healthy_set, unhealthy_set)
        };

        if !from.remove(&index) {
            return false;
        }
        to.insert(index);
        self.nodes[index].set_healthy(healthy);
        true
    }
}

/// Draw two distinct entries of `pool`, redrawing the second until it differs
fn draw_pair<R: Rng + ?Sized>(pool: &[usize], rng: &mut R) -> (usize, usize) {
    let first = rng.gen_range(0..pool.len());
    let mut second = rng.gen_range(0..pool.len());
    while second == first {
        second = rng.gen_range(0..pool.len());
    }
    (pool[first], pool[second])
}
