//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the shared dialer and apply proxy settings
//! - Create the load balancer and seed it with the configured servers
//! - Run the forwarder and apply config reloads until shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::dialer::{DialerHandle, ProxyConfigurator, ProxyEnvironment, ProxyError};
use crate::lifecycle::Shutdown;
use crate::load_balancer::LoadBalancer;
use crate::net::forward::Forwarder;
use crate::net::listener::Listener;

/// Composition root: owns the dialer handle and the load balancer.
pub struct Agent {
    config: AgentConfig,
    dialer: Arc<DialerHandle>,
    lb: Arc<LoadBalancer>,
}

impl Agent {
    /// Build from the process environment.
    pub fn new(config: AgentConfig) -> Result<Self, ProxyError> {
        let dialer = Arc::new(DialerHandle::new());
        ProxyConfigurator::new(Arc::clone(&dialer)).configure(&config.effective_server_url())?;
        Ok(Self::assemble(config, dialer))
    }

    /// Build with explicit proxy settings instead of the process environment.
    pub fn with_proxy_environment(
        config: AgentConfig,
        proxy_allowed: bool,
        env: &ProxyEnvironment,
    ) -> Result<Self, ProxyError> {
        let dialer = Arc::new(DialerHandle::new());
        ProxyConfigurator::new(Arc::clone(&dialer)).configure_with(
            &config.effective_server_url(),
            proxy_allowed,
            env,
        )?;
        Ok(Self::assemble(config, dialer))
    }

    fn assemble(config: AgentConfig, dialer: Arc<DialerHandle>) -> Self {
        let lb = LoadBalancer::new(
            config.service_name.clone(),
            config.default_server.clone(),
            Arc::clone(&dialer),
        )
        .with_connect_timeout(Duration::from_secs(config.timeouts.connect_secs));

        if lb.reconcile(&config.servers) {
            tracing::info!(servers = ?config.servers, "Initial server list applied");
        }

        Self {
            config,
            dialer,
            lb: Arc::new(lb),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn dialer(&self) -> &Arc<DialerHandle> {
        &self.dialer
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.lb
    }

    /// Apply a reloaded configuration. Only the server list takes effect at runtime.
    pub fn apply(&self, config: &AgentConfig) -> bool {
        if config.default_server != self.lb.default_server_address() {
            tracing::warn!(
                current = %self.lb.default_server_address(),
                requested = %config.default_server,
                "default_server cannot change at runtime; restart to apply"
            );
        }

        let changed = self.lb.reconcile(&config.servers);
        if changed {
            tracing::info!(
                service = %self.lb.service_name(),
                servers = ?config.servers,
                "Server list reconciled"
            );
        }
        changed
    }

    /// Serve `listener` and apply reloads until shutdown.
    pub async fn run(
        self,
        listener: Listener,
        mut updates: Option<mpsc::UnboundedReceiver<AgentConfig>>,
        shutdown: Shutdown,
    ) {
        let forwarder = Forwarder::new(Arc::clone(&self.lb));
        let server = tokio::spawn(forwarder.serve(listener, shutdown.subscribe()));
        let mut stop = shutdown.subscribe();

        loop {
            tokio::select! {
                Some(config) = recv_update(&mut updates) => {
                    self.apply(&config);
                }
                _ = stop.recv() => break,
            }
        }

        if let Err(e) = server.await {
            tracing::error!(error = %e, "Forwarder task failed");
        }
        tracing::info!(service = %self.lb.service_name(), "Agent stopped");
    }
}

async fn recv_update(updates: &mut Option<mpsc::UnboundedReceiver<AgentConfig>>) -> Option<AgentConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
