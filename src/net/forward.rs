//! Local-to-upstream forwarding with failover.
//!
//! # Responsibilities
//! - Dial the currently selected server for each accepted client
//! - On dial failure, fail over through the ring until every server was tried once
//! - Pipe bytes in both directions until either side closes
//!
//! Upstream connections are tracked by the load balancer, so a server removed
//! by reconciliation has its forwarded connections cut and clients reconnect
//! to a live server.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::load_balancer::{LoadBalancer, LoadBalancerError, TrackedConnection};
use crate::net::listener::Listener;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    NoServers(#[from] LoadBalancerError),

    #[error("all {attempts} servers failed, last error: {source}")]
    AllServersFailed {
        attempts: usize,
        #[source]
        source: io::Error,
    },
}

/// Forwards local connections to whichever server the load balancer selects.
#[derive(Debug, Clone)]
pub struct Forwarder {
    lb: Arc<LoadBalancer>,
}

impl Forwarder {
    pub fn new(lb: Arc<LoadBalancer>) -> Self {
        Self { lb }
    }

    /// Dial the current server, failing over until each ring entry was tried once.
    pub async fn dial_with_failover(&self) -> Result<TrackedConnection, ForwardError> {
        let attempts = self.lb.ring().len().max(1);
        let mut address = self.lb.current_server_address();
        let mut last_err = None;

        for _ in 0..attempts {
            match self.lb.dial("tcp", &address).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(
                        service = %self.lb.service_name(),
                        server = %address,
                        error = %e,
                        "Dial failed, selecting next server"
                    );
                    last_err = Some(e);
                }
            }
            address = self.lb.select_next(&address)?;
        }

        Err(ForwardError::AllServersFailed {
            attempts,
            source: last_err.unwrap_or_else(|| io::Error::other("no dial attempted")),
        })
    }

    /// Accept and forward until shutdown is signalled.
    pub async fn serve(self, listener: Listener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (client, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let forwarder = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = forwarder.forward(client).await {
                            tracing::warn!(peer = %peer, error = %e, "Forwarding failed");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Forwarder received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn forward(&self, mut client: TcpStream) -> Result<(), ForwardError> {
        let mut upstream = self.dial_with_failover().await?;
        let server = upstream.server_address().to_string();

        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::trace!(server = %server, sent, received, "Forwarded connection closed");
            }
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "Forwarded connection ended with error");
            }
        }
        Ok(())
    }
}
