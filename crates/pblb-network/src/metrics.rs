//! Metrics events emitted by the balancer
//!
//! The balancer only reports events through [`MetricsSink`]; how they are
//! collected and exposed is up to the embedding binary.

use axum::http::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Status class of a forwarded request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusClass {
    /// 1xx
    Informational,
    /// 2xx
    Success,
    /// 3xx
    Redirection,
    /// 4xx
    ClientError,
    /// 5xx
    ServerError,
}

impl StatusClass {
    /// Classify a status code
    pub fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            500..=u16::MAX => StatusClass::ServerError,
            400..=499 => StatusClass::ClientError,
            300..=399 => StatusClass::Redirection,
            200..=299 => StatusClass::Success,
            _ => StatusClass::Informational,
        }
    }

    /// Whether this outcome means the node failed
    pub fn is_failure(&self) -> bool {
        matches!(self, StatusClass::ServerError)
    }

    /// Label used when exporting the class
    pub fn label(&self) -> &'static str {
        match self {
            StatusClass::Informational => "1xx",
            StatusClass::Success => "2xx",
            StatusClass::Redirection => "3xx",
            StatusClass::ClientError => "4xx",
            StatusClass::ServerError => "5xx",
        }
    }
}

impl std::fmt::Display for StatusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Receiver of counter and gauge events
pub trait MetricsSink: Send + Sync {
    /// Count a processed request by status class and node (`address:port`)
    fn record_status(&self, class: StatusClass, node: &str);

    /// A node moved from unhealthy to healthy
    fn inc_healthy_nodes(&self);

    /// A node moved from healthy to unhealthy
    fn dec_healthy_nodes(&self);

    /// Publish the healthy node count observed by a probe cycle
    fn set_healthy_nodes(&self, count: usize);

    /// Publish the configured node count
    fn set_total_nodes(&self, count: usize);
}

/// Sink that drops every event
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_status(&self, _class: StatusClass, _node: &str) {}
    fn inc_healthy_nodes(&self) {}
    fn dec_healthy_nodes(&self) {}
    fn set_healthy_nodes(&self, _count: usize) {}
    fn set_total_nodes(&self, _count: usize) {}
}

/// In-process sink: atomic gauges plus a counter map
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    processed: Mutex<BTreeMap<(StatusClass, String), u64>>,
    healthy_nodes: AtomicI64,
    total_nodes: AtomicU64,
}

/// Point-in-time copy of [`InMemoryMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Processed requests keyed by status class, then node address
    pub processed_total: BTreeMap<String, BTreeMap<String, u64>>,
    /// Current healthy node gauge
    pub healthy_nodes: i64,
    /// Configured node gauge
    pub total_nodes: u64,
}

impl InMemoryMetrics {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the healthy node gauge
    pub fn healthy_nodes(&self) -> i64 {
        self.healthy_nodes.load(Ordering::Relaxed)
    }

    /// Current value of the total node gauge
    pub fn total_nodes(&self) -> u64 {
        self.total_nodes.load(Ordering::Relaxed)
    }

    /// Number of processed requests of a class across all nodes
    pub fn processed(&self, class: StatusClass) -> u64 {
        let processed = self.processed.lock().unwrap_or_else(PoisonError::into_inner);
        processed
            .iter()
            .filter(|((c, _), _)| *c == class)
            .map(|(_, count)| count)
            .sum()
    }

    /// Copy the current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut processed_total: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for ((class, node), count) in processed.iter() {
            processed_total
                .entry(class.label().to_string())
                .or_default()
                .insert(node.clone(), *count);
        }

        MetricsSnapshot {
            processed_total,
            healthy_nodes: self.healthy_nodes(),
            total_nodes: self.total_nodes(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_status(&self, class: StatusClass, node: &str) {
        let mut processed = self.processed.lock().unwrap_or_else(PoisonError::into_inner);
        *processed.entry((class, node.to_string())).or_insert(0) += 1;
    }

    fn inc_healthy_nodes(&self) {
        self.healthy_nodes.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_healthy_nodes(&self) {
        self.healthy_nodes.fetch_sub(1, Ordering::Relaxed);
    }

    fn set_healthy_nodes(&self, count: usize) {
        self.healthy_nodes.store(count as i64, Ordering::Relaxed);
    }

    fn set_total_nodes(&self, count: usize) {
        self.total_nodes.store(count as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(StatusClass::of(StatusCode::CONTINUE), StatusClass::Informational);
        assert_eq!(StatusClass::of(StatusCode::OK), StatusClass::Success);
        assert_eq!(StatusClass::of(StatusCode::FOUND), StatusClass::Redirection);
        assert_eq!(StatusClass::of(StatusCode::NOT_FOUND), StatusClass::ClientError);
        assert_eq!(
            StatusClass::of(StatusCode::SERVICE_UNAVAILABLE),
            StatusClass::ServerError
        );
        assert!(StatusClass::of(StatusCode::BAD_GATEWAY).is_failure());
        assert!(!StatusClass::of(StatusCode::NOT_FOUND).is_failure());
    }

    #[test]
    fn test_in_memory_gauges() {
        let metrics = InMemoryMetrics::new();
        metrics.set_total_nodes(3);
        metrics.set_healthy_nodes(3);
        metrics.dec_healthy_nodes();
        metrics.dec_healthy_nodes();
        metrics.inc_healthy_nodes();

        assert_eq!(metrics.total_nodes(), 3);
        assert_eq!(metrics.healthy_nodes(), 2);
    }

    #[test]
    fn test_snapshot_groups_by_class_and_node() {
        let metrics = InMemoryMetrics::new();
        metrics.record_status(StatusClass::Success, "10.0.0.1:8080");
        metrics.record_status(StatusClass::Success, "10.0.0.1:8080");
        metrics.record_status(StatusClass::Success, "10.0.0.2:8080");
        metrics.record_status(StatusClass::ServerError, "10.0.0.2:8080");

        assert_eq!(metrics.processed(StatusClass::Success), 3);
        assert_eq!(metrics.processed(StatusClass::ClientError), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed_total["2xx"]["10.0.0.1:8080"], 2);
        assert_eq!(snapshot.processed_total["5xx"]["10.0.0.2:8080"], 1);
        assert!(!snapshot.processed_total.contains_key("4xx"));
    }
}
