//! Per-address connection tracking.
//!
//! # Responsibilities
//! - Own the set of live connections dialed to one upstream address
//! - Register new connections under the server's own lock
//! - Force every tracked connection closed when the address goes away
//!
//! # Design Decisions
//! - The connection-set lock is separate from the load balancer lock
//! - The lock is never held across a dial or a socket shutdown
//! - Forced closes run as independent tasks so each one can re-take the lock to deregister

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dialer::Dialer;
use crate::load_balancer::connection::{split_close_handle, CloseHandle, ConnectionId, TrackedConnection};
use crate::observability::metrics;

/// One upstream address and the connections currently open to it.
#[derive(Debug)]
pub struct TrackedServer {
    address: String,
    connections: Mutex<HashMap<ConnectionId, Arc<CloseHandle>>>,
}

impl TrackedServer {
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of connections currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dial this server and track the resulting connection.
    pub async fn dial(self: &Arc<Self>, dialer: &Dialer, network: &str) -> io::Result<TrackedConnection> {
        let stream = dialer.dial(network, &self.address).await?;
        self.register(stream)
    }

    /// Wrap an established stream and add it to the tracking set.
    pub fn register(self: &Arc<Self>, stream: tokio::net::TcpStream) -> io::Result<TrackedConnection> {
        let (stream, handle) = split_close_handle(stream)?;
        let handle = Arc::new(handle);
        let id = ConnectionId::new();

        let count = {
            let mut connections = self.lock();
            connections.insert(id, Arc::clone(&handle));
            connections.len()
        };
        metrics::record_server_connections(&self.address, count);

        Ok(TrackedConnection::new(id, stream, handle, self))
    }

    /// Schedule every tracked connection to be closed. Does not wait.
    pub fn close_all(self: &Arc<Self>) {
        let connections = self.lock();
        tracing::debug!(
            server = %self.address,
            count = connections.len(),
            "Closing connections to load balancer server"
        );

        for (&id, handle) in connections.iter() {
            let server = Arc::clone(self);
            let handle = Arc::clone(handle);
            spawn_close(move || {
                server.remove(id);
                if let Err(e) = handle.shutdown() {
                    tracing::trace!(server = %server.address, connection_id = %id, error = %e, "Forced close failed");
                }
            });
        }
    }

    /// Drop `id` from the tracking set. No-op when already removed.
    pub(crate) fn remove(&self, id: ConnectionId) {
        let count = {
            let mut connections = self.lock();
            if connections.remove(&id).is_none() {
                return;
            }
            connections.len()
        };
        metrics::record_server_connections(&self.address, count);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<CloseHandle>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TrackedServer {
    fn drop(&mut self) {
        // A server dropped by reconcile no longer reports connections, even
        // if one registered after its drain was scheduled.
        metrics::record_server_connections(&self.address, 0);
    }
}

/// Run a close on the Tokio runtime when there is one, otherwise on a plain thread.
fn spawn_close<F>(close: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { close() });
        }
        Err(_) => {
            std::thread::spawn(close);
        }
    }
}
