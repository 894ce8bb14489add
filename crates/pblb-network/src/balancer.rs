//! Load balancer façade over the selection strategies

use crate::health::{self, HealthChecker};
use crate::metrics::{MetricsSink, StatusClass};
use crate::node::{forward_client, Node};
use crate::round_robin::RoundRobin;
use crate::two_choice::TwoChoice;
use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use pblb_core::{Config, HealthCheckConfig, LoadBalanceMethod, PblbResult, ProxyConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runtime settings for a [`Balancer`]
#[derive(Debug, Clone)]
pub struct BalancerOptions {
    /// Timeout for a forwarded request
    pub forward_timeout: Duration,
    /// Largest request body that will be buffered
    pub max_body_bytes: usize,
    /// Time between probe cycles
    pub health_interval: Duration,
    /// Timeout for a single probe
    pub health_timeout: Duration,
}

impl BalancerOptions {
    /// Build options from the proxy and health sections of a config
    pub fn new(proxy: &ProxyConfig, health: &HealthCheckConfig) -> Self {
        Self {
            forward_timeout: proxy.timeout(),
            max_body_bytes: proxy.max_body_bytes,
            health_interval: health.interval(),
            health_timeout: health.timeout(),
        }
    }
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self::new(&ProxyConfig::default(), &HealthCheckConfig::default())
    }
}

#[derive(Debug)]
enum Strategy {
    RoundRobin(RoundRobin),
    TwoChoice(TwoChoice),
}

/// Selects a node for each request, forwards it and tracks node health
pub struct Balancer {
    strategy: Strategy,
    client: reqwest::Client,
    max_body_bytes: usize,
    health: HealthChecker,
    metrics: Arc<dyn MetricsSink>,
}

impl Balancer {
    /// Create a balancer using `method` over `nodes`
    pub fn new(
        method: LoadBalanceMethod,
        nodes: Vec<Node>,
        options: &BalancerOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> PblbResult<Self> {
        let strategy = match method {
            LoadBalanceMethod::RoundRobin => Strategy::RoundRobin(RoundRobin::new(nodes)?),
            LoadBalanceMethod::TwoChoice => Strategy::TwoChoice(TwoChoice::new(nodes)?),
        };

        let balancer = Self {
            strategy,
            client: forward_client(options.forward_timeout)?,
            max_body_bytes: options.max_body_bytes,
            health: HealthChecker::new(options.health_interval, options.health_timeout)?,
            metrics,
        };

        let total = balancer.nodes().len();
        balancer.metrics.set_total_nodes(total);
        balancer.metrics.set_healthy_nodes(balancer.healthy_count());

        info!(method = %method, nodes = total, "Load balancer created");

        Ok(balancer)
    }

    /// Create a balancer from a loaded configuration
    pub fn from_config(config: &Config, metrics: Arc<dyn MetricsSink>) -> PblbResult<Self> {
        let nodes = config.nodes.iter().map(Node::from_config).collect();
        let options = BalancerOptions::new(&config.proxy, &config.health);
        Self::new(config.method, nodes, &options, metrics)
    }

    /// Get the selection method
    pub fn method(&self) -> LoadBalanceMethod {
        match self.strategy {
            Strategy::RoundRobin(_) => LoadBalanceMethod::RoundRobin,
            Strategy::TwoChoice(_) => LoadBalanceMethod::TwoChoice,
        }
    }

    /// All configured nodes
    pub fn nodes(&self) -> &[Node] {
        match &self.strategy {
            Strategy::RoundRobin(rr) => rr.nodes(),
            Strategy::TwoChoice(tc) => tc.nodes(),
        }
    }

    /// Number of nodes currently flagged healthy
    pub fn healthy_count(&self) -> usize {
        self.nodes().iter().filter(|n| n.is_healthy()).count()
    }

    /// Health checker used by the probe loop
    pub fn health_checker(&self) -> &HealthChecker {
        &self.health
    }

    /// Choose the index of the node for the next request
    pub fn select(&self) -> usize {
        match &self.strategy {
            Strategy::RoundRobin(rr) => rr.select(),
            Strategy::TwoChoice(tc) => tc.select(),
        }
    }

    /// Record a health outcome for a node
    ///
    /// Returns whether the node changed state. Repeating an outcome is a
    /// no-op and emits no gauge event.
    pub fn reconcile(&self, index: usize, healthy: bool) -> bool {
        let changed = match &self.strategy {
            Strategy::RoundRobin(rr) => rr.reconcile(index, healthy),
            Strategy::TwoChoice(tc) => tc.reconcile(index, healthy),
        };

        if changed {
            let node = &self.nodes()[index];
            if healthy {
                info!(node = %node, "Node recovered");
                self.metrics.inc_healthy_nodes();
            } else {
                warn!(node = %node, "Node deactivated");
                self.metrics.dec_healthy_nodes();
            }
        }

        changed
    }

    /// Forward one request to a selected node
    ///
    /// A 5xx outcome takes the node out of rotation; any other outcome puts
    /// it back. A request that fails before the node is contacted leaves its
    /// health alone.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let index = self.select();
        let node = &self.nodes()[index];

        debug!(
            node = %node,
            active_connections = node.active_connections(),
            method = %self.method(),
            "Handling request"
        );

        let (response, reached_backend) =
            match node.forward(&self.client, request, self.max_body_bytes).await {
                Ok(response) => (response, true),
                Err(e) => {
                    warn!(node = %node, error = %e, "Forwarding failed");
                    let reached_backend = e.reached_backend();
                    (e.into_response(), reached_backend)
                }
            };
        let status = response.status();
        let class = StatusClass::of(status);

        if reached_backend {
            if class.is_failure() {
                warn!(
                    node = %node,
                    status = status.as_u16(),
                    "Node failed to process request"
                );
            }
            self.reconcile(index, !class.is_failure());
        }
        self.metrics.record_status(class, &node.to_string());

        response
    }

    /// Probe every node once and apply the outcomes
    ///
    /// Returns the number of nodes that passed.
    pub async fn check_all(&self) -> usize {
        health::perform_health_checks(self).await
    }

    /// Run the periodic probe loop until `shutdown` fires
    pub async fn run_health_checks(&self, shutdown: watch::Receiver<bool>) {
        health::health_check_loop(self, shutdown).await
    }

    /// Spawn the probe loop as a background task
    pub fn spawn_health_checks(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_health_checks(shutdown).await;
        })
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("strategy", &self.strategy)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetrics, NoopMetrics};
    use crate::node::tests::{node_for, unreachable_node};
    use axum::http::StatusCode;
    use pblb_core::NodeConfig;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> BalancerOptions {
        BalancerOptions {
            forward_timeout: Duration::from_secs(5),
            max_body_bytes: 1024 * 1024,
            health_interval: Duration::from_secs(3600),
            health_timeout: Duration::from_secs(1),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn ok_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml(
            r#"
method = "twochoice"

[[nodes]]
address = "10.0.0.1"
port = 8080

[[nodes]]
address = "10.0.0.2"
port = 8080

[[nodes]]
address = "10.0.0.3"
port = 8080
"#,
        )
        .unwrap();

        let metrics = Arc::new(InMemoryMetrics::new());
        let balancer = Balancer::from_config(&config, metrics.clone()).unwrap();
        assert_eq!(balancer.method(), LoadBalanceMethod::TwoChoice);
        assert_eq!(balancer.nodes().len(), 3);
        assert_eq!(metrics.total_nodes(), 3);
        assert_eq!(metrics.healthy_nodes(), 3);
    }

    #[test]
    fn test_two_choice_rejects_two_nodes() {
        let nodes = vec![
            Node::from_config(&NodeConfig::new("10.0.0.1", 80)),
            Node::from_config(&NodeConfig::new("10.0.0.2", 80)),
        ];
        let result = Balancer::new(
            LoadBalanceMethod::TwoChoice,
            nodes,
            &options(),
            Arc::new(NoopMetrics),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_health_follows_request_outcome() {
        let server = MockServer::start().await;
        Mock::given(path("/fail"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let metrics = Arc::new(InMemoryMetrics::new());
        let balancer = Balancer::new(
            LoadBalanceMethod::RoundRobin,
            vec![node_for(&server)],
            &options(),
            metrics.clone(),
        )
        .unwrap();

        let response = balancer.handle(get("/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(balancer.nodes()[0].is_healthy());
        assert_eq!(metrics.healthy_nodes(), 1);

        let response = balancer.handle(get("/fail")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!balancer.nodes()[0].is_healthy());
        assert_eq!(metrics.healthy_nodes(), 0);

        // the only node is still served and recovers on success
        let response = balancer.handle(get("/ok")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(balancer.nodes()[0].is_healthy());
        assert_eq!(metrics.healthy_nodes(), 1);

        assert_eq!(metrics.processed(StatusClass::ClientError), 1);
        assert_eq!(metrics.processed(StatusClass::ServerError), 1);
        assert_eq!(metrics.processed(StatusClass::Success), 1);
    }

    #[test]
    fn test_reconcile_emits_one_event_per_transition() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let nodes = (0..3).map(|i| Node::new("127.0.0.1", 32000 + i, "/health")).collect();
        let balancer =
            Balancer::new(LoadBalanceMethod::TwoChoice, nodes, &options(), metrics.clone())
                .unwrap();

        assert!(balancer.reconcile(1, false));
        assert!(!balancer.reconcile(1, false));
        assert_eq!(metrics.healthy_nodes(), 2);

        assert!(balancer.reconcile(1, true));
        assert!(!balancer.reconcile(1, true));
        assert_eq!(metrics.healthy_nodes(), 3);
    }

    #[tokio::test]
    async fn test_two_choice_transport_failure_removes_node() {
        let first = ok_server().await;
        let second = ok_server().await;

        let metrics = Arc::new(InMemoryMetrics::new());
        let nodes = vec![node_for(&first), node_for(&second), unreachable_node()];
        let balancer =
            Balancer::new(LoadBalanceMethod::TwoChoice, nodes, &options(), metrics.clone())
                .unwrap();
        assert_eq!(metrics.healthy_nodes(), 3);

        let mut failed = false;
        for _ in 0..200 {
            let response = balancer.handle(get("/")).await;
            if response.status() == StatusCode::BAD_GATEWAY {
                failed = true;
                break;
            }
        }
        assert!(failed, "unreachable node was never selected");

        let Strategy::TwoChoice(tc) = &balancer.strategy else {
            panic!("expected two-choice strategy");
        };
        assert_eq!(tc.partition(), (vec![0, 1], vec![2]));
        assert_eq!(metrics.healthy_nodes(), 2);

        for _ in 0..100 {
            assert_ne!(balancer.select(), 2);
        }
    }

    #[tokio::test]
    async fn test_request_is_forwarded_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(header("x-trace", "abc"))
            .and(body_string(r#"{"x":1}"#))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let balancer = Balancer::new(
            LoadBalanceMethod::RoundRobin,
            vec![node_for(&server)],
            &options(),
            Arc::new(NoopMetrics),
        )
        .unwrap();

        let request = Request::post("/items")
            .header("X-Trace", "abc")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"x":1}"#))
            .unwrap();

        let response = balancer.handle(request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"created");
    }

    #[tokio::test]
    async fn test_round_robin_skips_failed_node() {
        let first = ok_server().await;
        let second = ok_server().await;

        let balancer = Balancer::new(
            LoadBalanceMethod::RoundRobin,
            vec![node_for(&first), unreachable_node(), node_for(&second)],
            &options(),
            Arc::new(NoopMetrics),
        )
        .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..5 {
            statuses.push(balancer.handle(get("/")).await.status());
        }

        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::BAD_GATEWAY,
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::OK,
            ]
        );
        assert_eq!(balancer.healthy_count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_body_leaves_health_alone() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let options = BalancerOptions {
            max_body_bytes: 16,
            ..options()
        };
        let balancer = Balancer::new(
            LoadBalanceMethod::RoundRobin,
            vec![unreachable_node()],
            &options,
            metrics.clone(),
        )
        .unwrap();
        balancer.reconcile(0, false);
        assert_eq!(metrics.healthy_nodes(), 0);

        let request = Request::post("/upload")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        let response = balancer.handle(request).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!balancer.nodes()[0].is_healthy());
        assert_eq!(metrics.healthy_nodes(), 0);
        assert_eq!(metrics.processed(StatusClass::ClientError), 1);
    }

    #[tokio::test]
    async fn test_counters_are_keyed_by_address_and_port() {
        let first = ok_server().await;
        let second = ok_server().await;

        let metrics = Arc::new(InMemoryMetrics::new());
        let balancer = Balancer::new(
            LoadBalanceMethod::RoundRobin,
            vec![node_for(&first), node_for(&second)],
            &options(),
            metrics.clone(),
        )
        .unwrap();

        for _ in 0..3 {
            balancer.handle(get("/")).await;
        }

        let snapshot = metrics.snapshot();
        let success = &snapshot.processed_total["2xx"];
        assert_eq!(success.len(), 2);
        assert_eq!(success[&balancer.nodes()[0].to_string()], 2);
        assert_eq!(success[&balancer.nodes()[1].to_string()], 1);
    }
}
