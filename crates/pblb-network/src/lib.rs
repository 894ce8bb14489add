//! pblb-network: Node health tracking and load balancing
//!
//! This crate provides the request path of the balancer:
//! - Backend nodes and request forwarding
//! - Round-robin and two-choice node selection
//! - Periodic health checking
//! - Metrics events

pub mod balancer;
pub mod health;
pub mod metrics;
pub mod node;
pub mod round_robin;
pub mod two_choice;

pub use balancer::{Balancer, BalancerOptions};
pub use health::HealthChecker;
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, NoopMetrics, StatusClass};
pub use node::Node;
pub use round_robin::RoundRobin;
pub use two_choice::TwoChoice;
