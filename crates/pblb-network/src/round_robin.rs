//! Sequential round-robin selection

use crate::node::Node;
use pblb_core::{LoadBalanceMethod, PblbError, PblbResult};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Round-robin selector
///
/// Walks the node list from a shared cursor, skipping unhealthy nodes. When
/// every node is unhealthy it keeps rotating over all of them instead of
/// rejecting traffic.
#[derive(Debug)]
pub struct RoundRobin {
    nodes: Vec<Node>,
    /// Index the next selection starts scanning from, always < nodes.len()
    cursor: Mutex<usize>,
}

impl RoundRobin {
    /// Create a round-robin selector over at least one node
    pub fn new(nodes: Vec<Node>) -> PblbResult<Self> {
        let required = LoadBalanceMethod::RoundRobin.min_nodes();
        if nodes.len() < required {
            return Err(PblbError::InsufficientNodes {
                method: LoadBalanceMethod::RoundRobin.to_string(),
                required,
                found: nodes.len(),
            });
        }

        Ok(Self {
            nodes,
            cursor: Mutex::new(0),
        })
    }

    /// Nodes in rotation order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Pick the next node and advance the cursor past it
    pub fn select(&self) -> usize {
        let len = self.nodes.len();
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);

        let mut index = *cursor;
        let mut scanned = 0;
        while !self.nodes[index].is_healthy() && scanned < len {
            index = (index + 1) % len;
            scanned += 1;
        }

        *cursor = (index + 1) % len;

        debug!(
            selected_index = index,
            skipped = scanned,
            total_nodes = len,
            "Selected node"
        );

        index
    }

    /// Apply a health outcome, returning whether the flag changed
    pub fn reconcile(&self, index: usize, healthy: bool) -> bool {
        self.nodes[index].set_healthy(healthy) != healthy
    }
}
