//! Health checking for nodes
//!
//! A background loop probes every node on a fixed interval and feeds the
//! outcomes through the same reconciliation used after forwarded requests.

use crate::balancer::Balancer;
use pblb_core::{PblbError, PblbResult};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Build the client used for health probes
pub fn probe_client(timeout: Duration) -> PblbResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PblbError::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Health checker settings and the client probes are sent with
#[derive(Debug, Clone)]
pub struct HealthChecker {
    /// HTTP client for health checks
    client: reqwest::Client,
    /// Time between probe cycles
    interval: Duration,
    /// Timeout for a single probe
    timeout: Duration,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(interval: Duration, timeout: Duration) -> PblbResult<Self> {
        Ok(Self {
            client: probe_client(timeout)?,
            interval,
            timeout,
        })
    }

    /// Client used for probes
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Get the interval between probe cycles
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Periodic probe loop
///
/// The first cycle runs immediately. The loop exits once `shutdown` changes
/// or its sender is dropped; a cycle already in progress finishes first.
pub async fn health_check_loop(balancer: &Balancer, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(balancer.health_checker().interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("Health checker received shutdown signal, exiting");
                return;
            }
            _ = ticker.tick() => {
                perform_health_checks(balancer).await;
            }
        }
    }
}

/// Probe every node once, one at a time, and reconcile each outcome
///
/// Returns the number of healthy nodes, which is also published to the
/// healthy node gauge.
pub async fn perform_health_checks(balancer: &Balancer) -> usize {
    debug!("Performing health checks");

    let client = balancer.health_checker().client();
    let mut healthy_nodes = 0;
    for (index, node) in balancer.nodes().iter().enumerate() {
        let healthy = node.check_health(client).await;
        balancer.reconcile(index, healthy);
        if healthy {
            healthy_nodes += 1;
        }
    }

    let total = balancer.nodes().len();
    info!(healthy = healthy_nodes, total, "Health check cycle complete");
    balancer.metrics().set_healthy_nodes(healthy_nodes);

    healthy_nodes
}
