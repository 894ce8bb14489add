//! pblb
//!
//! A small load balancer that spreads HTTP requests over a fixed set of
//! backend nodes and takes failing nodes out of rotation.

mod server;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pblb_core::Config;
use pblb_network::{Balancer, InMemoryMetrics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// pblb - a very simple load balancer
#[derive(Parser, Debug)]
#[command(name = "pblb")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the load balancer
    Run(RunArgs),

    /// Check a config file and print the node list
    Validate {
        /// Config file (defaults to /etc/pblb/config.toml, then ./config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Config file (defaults to /etc/pblb/config.toml, then ./config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listening port
    #[arg(long)]
    port: Option<u16>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { config } => validate(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<(PathBuf, Config)> {
    let loaded = match path {
        Some(path) => Config::from_file(path).map(|config| (path.to_path_buf(), config)),
        None => Config::discover(),
    };
    loaded.context("Fatal error in config file")
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

async fn run(args: RunArgs) -> Result<()> {
    let (path, mut config) = load_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level))?;

    info!("Starting pblb v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %path.display(), method = %config.method, "Loaded configuration");

    let metrics = Arc::new(InMemoryMetrics::new());
    let balancer = Arc::new(Balancer::from_config(&config, metrics.clone())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = balancer.clone().spawn_health_checks(shutdown_rx);

    let router = server::create_router(balancer, metrics);

    let listener = bind(&config.address, config.port).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    health.await.context("Health checker task failed")?;

    info!("Shut down gracefully");
    Ok(())
}

/// Bind the listener; `address` may be an IP literal or a hostname
async fn bind(address: &str, port: u16) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind((address, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", address, port))
}

fn validate(path: Option<&Path>) -> Result<()> {
    let (path, config) = load_config(path)?;

    println!("Config '{}' is valid", path.display());
    println!("  Method: {}", config.method);
    println!("  Listen: {}:{}", config.address, config.port);
    println!(
        "  Health checks: every {}s, timeout {}s",
        config.health.interval_secs, config.health.timeout_secs
    );
    println!("  Nodes:");
    for node in &config.nodes {
        println!("    {}:{}{}", node.address, node.port, node.health);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
