//! tether agent load balancer.
//!
//! # Architecture Overview
//!
//! ```text
//!   local client ──▶ net::listener ──▶ net::forward ──▶ load_balancer ──▶ dialer ──▶ server
//!                                                           ▲   │            (direct / HTTP CONNECT / SOCKS5)
//!                       config::watcher ── reconcile ───────┘   └── TrackedServer (per-address connections)
//! ```

use std::path::PathBuf;

use clap::Parser;
use tether::config::loader::load_config;
use tether::config::watcher::ConfigWatcher;
use tether::config::AgentConfig;
use tether::lifecycle::signals::wait_for_signal;
use tether::net::listener::Listener;
use tether::observability::{logging, metrics};
use tether::{Agent, Shutdown};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Connection-aware load balancer for agent-to-server connections", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the default server address (host:port).
    #[arg(long)]
    default_server: Option<String>,

    /// Override the local listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AgentConfig::default(),
    };
    if let Some(server) = cli.default_server {
        config.default_server = server;
    }
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!("tether v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let agent = Agent::new(config)?;

    tracing::info!(
        service = %agent.config().service_name,
        default_server = %agent.config().default_server,
        servers = agent.load_balancer().ring().len(),
        "Agent configured"
    );

    let (_watcher, updates) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, agent.config());
            (Some(watcher.run()?), Some(updates))
        }
        None => (None, None),
    };

    let shutdown = Shutdown::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    agent.run(listener, updates, shutdown).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
