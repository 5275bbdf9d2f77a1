//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! fresh server list (config reload, membership discovery)
//!     → LoadBalancer::reconcile
//!         - create TrackedServer for added addresses
//!         - drain + drop TrackedServer for removed addresses (default kept)
//!         - reshuffle the failover ring
//!
//! outbound connection needed
//!     → LoadBalancer::dial(address)
//!     → server.rs (dial through the shared dialer, register connection)
//!     → connection.rs (TrackedConnection, deregisters on close/drop)
//!
//! dial or request failed against `address`
//!     → LoadBalancer::select_next(address)
//!     → advance the ring only if `address` is still current
//! ```
//!
//! # Design Decisions
//! - Two locks: one for load balancer state, one per tracked server
//! - Neither lock is held across network I/O
//! - Failures never remove addresses; only reconciliation does
//! - The default server is always reachable through the ring

pub mod connection;
pub mod server;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::dialer::DialerHandle;
use crate::observability::metrics;

pub use connection::{ConnectionId, TrackedConnection};
pub use server::TrackedServer;

/// Errors from server selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("no servers in load balancer {service} proxy list")]
    NoServersAvailable { service: String },
}

#[derive(Debug)]
struct State {
    /// Last reconciled list, sorted, default first when present.
    server_addresses: Vec<String>,
    /// Failover ring.
    random_servers: Vec<String>,
    current_server_address: String,
    next_server_index: usize,
    servers: HashMap<String, Arc<TrackedServer>>,
}

/// Client-side load balancer for one logical service.
#[derive(Debug)]
pub struct LoadBalancer {
    service_name: String,
    default_server_address: String,
    dialer: Arc<DialerHandle>,
    connect_timeout: Option<Duration>,
    state: Mutex<State>,
}

impl LoadBalancer {
    /// Create a load balancer that initially only knows its default server.
    pub fn new(
        service_name: impl Into<String>,
        default_server_address: impl Into<String>,
        dialer: Arc<DialerHandle>,
    ) -> Self {
        let service_name = service_name.into();
        let default_server_address = default_server_address.into();

        // Without a default address the ring stays empty until the first reconcile.
        let mut servers = HashMap::new();
        let mut random_servers = Vec::new();
        if !default_server_address.is_empty() {
            servers.insert(
                default_server_address.clone(),
                TrackedServer::new(default_server_address.clone()),
            );
            random_servers.push(default_server_address.clone());
        }

        tracing::info!(
            service = %service_name,
            default_server = %default_server_address,
            "Load balancer created"
        );

        Self {
            state: Mutex::new(State {
                server_addresses: Vec::new(),
                random_servers,
                current_server_address: default_server_address.clone(),
                next_server_index: 0,
                servers,
            }),
            service_name,
            default_server_address,
            dialer,
            connect_timeout: None,
        }
    }

    /// Bound every dial by `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn default_server_address(&self) -> &str {
        &self.default_server_address
    }

    pub fn current_server_address(&self) -> String {
        self.lock().current_server_address.clone()
    }

    /// The last reconciled address list.
    pub fn server_addresses(&self) -> Vec<String> {
        self.lock().server_addresses.clone()
    }

    /// The failover ring, in order.
    pub fn ring(&self) -> Vec<String> {
        self.lock().random_servers.clone()
    }

    pub fn server(&self, address: &str) -> Option<Arc<TrackedServer>> {
        self.lock().servers.get(address).cloned()
    }

    /// Connections currently tracked for `address`, or 0 when it is unknown.
    pub fn connection_count(&self, address: &str) -> usize {
        self.server(address).map(|s| s.len()).unwrap_or(0)
    }

    /// Update the known server set. Returns true if anything changed.
    pub fn reconcile<S: AsRef<str>>(&self, addresses: &[S]) -> bool {
        let (addresses, has_default_server) = sort_servers(addresses, &self.default_server_address);
        if addresses.is_empty() {
            return false;
        }

        let drained = {
            let mut state = self.lock();

            let new_set: BTreeSet<&str> = addresses.iter().map(String::as_str).collect();
            let cur_set: BTreeSet<&str> = state.server_addresses.iter().map(String::as_str).collect();
            if new_set == cur_set {
                return false;
            }

            let added: Vec<String> = new_set.difference(&cur_set).map(|s| s.to_string()).collect();
            let removed: Vec<String> = cur_set.difference(&new_set).map(|s| s.to_string()).collect();

            for address in added {
                tracing::info!(service = %self.service_name, server = %address, "Adding server to load balancer");
                state
                    .servers
                    .entry(address.clone())
                    .or_insert_with(|| TrackedServer::new(address));
            }

            let mut drained = Vec::new();
            for address in removed {
                let Some(server) = state.servers.get(&address).cloned() else {
                    continue;
                };
                tracing::info!(service = %self.service_name, server = %address, "Removing server from load balancer");
                if address != self.default_server_address {
                    state.servers.remove(&address);
                }
                drained.push(server);
            }

            let mut ring = addresses.clone();
            ring.shuffle(&mut rand::thread_rng());
            if !has_default_server && !self.default_server_address.is_empty() {
                ring.push(self.default_server_address.clone());
            }

            state.current_server_address = ring[0].clone();
            state.next_server_index = 1;
            state.random_servers = ring;
            state.server_addresses = addresses;

            metrics::record_servers(&self.service_name, state.random_servers.len());
            drained
        };

        // Stale connections are closed only once the new list is in place,
        // so anything retrying against them lands on a valid server.
        for server in drained {
            server.close_all();
        }

        true
    }

    /// Pick the server to use after a failure against `failed_address`.
    pub fn select_next(&self, failed_address: &str) -> Result<String, LoadBalancerError> {
        let mut state = self.lock();

        if state.random_servers.is_empty() {
            return Err(LoadBalancerError::NoServersAvailable {
                service: self.service_name.clone(),
            });
        }
        if state.random_servers.len() == 1 {
            return Ok(state.current_server_address.clone());
        }
        if failed_address != state.current_server_address {
            return Ok(state.current_server_address.clone());
        }
        if state.next_server_index >= state.random_servers.len() {
            state.next_server_index = 0;
        }

        let next = state.random_servers[state.next_server_index].clone();
        state.current_server_address = next.clone();
        state.next_server_index += 1;

        tracing::debug!(
            service = %self.service_name,
            from = %failed_address,
            to = %next,
            "Failed over to new server"
        );
        metrics::record_failover(&self.service_name);

        Ok(next)
    }

    /// Dial `address` and track the connection against its server.
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TrackedConnection> {
        let server = self.server(address).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("server {address} is not known to load balancer {}", self.service_name),
            )
        })?;
        let dialer = self.dialer.load();

        let result = match self.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, server.dial(&dialer, network)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {address} timed out after {timeout:?}"),
                )),
            },
            None => server.dial(&dialer, network).await,
        };

        if let Err(e) = &result {
            tracing::debug!(service = %self.service_name, server = %address, error = %e, "Dial error");
            metrics::record_dial_error(&self.service_name);
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sort and de-duplicate addresses, dropping empties. The default address
/// moves to the front; the flag reports whether it was present.
fn sort_servers<S: AsRef<str>>(input: &[S], default: &str) -> (Vec<String>, bool) {
    let unique: BTreeSet<&str> = input
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty())
        .collect();

    let found = unique.contains(default);
    let mut result = Vec::with_capacity(unique.len());
    if found {
        result.push(default.to_string());
    }
    result.extend(unique.into_iter().filter(|s| *s != default).map(str::to_string));

    (result, found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const DEFAULT: &str = "10.0.0.1:6443";

    fn lb() -> LoadBalancer {
        LoadBalancer::new("test-service", DEFAULT, Arc::new(DialerHandle::new()))
    }

    fn next_index(lb: &LoadBalancer) -> usize {
        lb.lock().next_server_index
    }

    #[test]
    fn sort_servers_dedups_and_fronts_default() {
        let (sorted, found) = sort_servers(&["c", "a", "", "D", "a", "b"], "D");
        assert_eq!(sorted, vec!["D", "a", "b", "c"]);
        assert!(found);

        let (sorted, found) = sort_servers(&["b", "a"], "D");
        assert_eq!(sorted, vec!["a", "b"]);
        assert!(!found);
    }

    #[test]
    fn new_load_balancer_dials_default() {
        let lb = lb();
        assert_eq!(lb.current_server_address(), DEFAULT);
        assert_eq!(lb.ring(), vec![DEFAULT]);
        assert!(lb.server(DEFAULT).is_some());
        assert_eq!(lb.select_next(DEFAULT).unwrap(), DEFAULT);
    }

    #[test]
    fn empty_reconcile_keeps_state() {
        let lb = lb();
        assert!(lb.reconcile(&["a:1", "b:1"]));
        let ring = lb.ring();
        assert!(!lb.reconcile::<&str>(&[]));
        assert!(!lb.reconcile(&["", ""]));
        assert_eq!(lb.ring(), ring);
    }

    #[test]
    fn unchanged_reconcile_does_not_reshuffle() {
        let lb = lb();
        assert!(lb.reconcile(&["a:1", "b:1", "c:1", "d:1"]));
        let current = lb.select_next(&lb.current_server_address()).unwrap();
        let ring = lb.ring();
        let index = next_index(&lb);

        assert!(!lb.reconcile(&["d:1", "c:1", "b:1", "a:1", "a:1"]));
        assert_eq!(lb.current_server_address(), current);
        assert_eq!(lb.ring(), ring);
        assert_eq!(next_index(&lb), index);
    }

    #[test]
    fn default_is_appended_when_absent() {
        let lb = lb();
        assert!(lb.reconcile(&["A", "B"]));
        let ring = lb.ring();
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.last().map(String::as_str), Some(DEFAULT));
        assert_eq!(lb.server_addresses(), vec!["A", "B"]);

        let mut seen = HashSet::new();
        let mut current = lb.current_server_address();
        seen.insert(current.clone());
        for _ in 0..3 {
            current = lb.select_next(&current).unwrap();
            seen.insert(current.clone());
        }
        assert!(seen.contains(DEFAULT));
    }

    #[test]
    fn repeated_input_without_default_is_unchanged() {
        let lb = lb();
        assert!(lb.reconcile(&["A", "B"]));
        let ring = lb.ring();
        assert!(!lb.reconcile(&["B", "A"]));
        assert_eq!(lb.ring(), ring);
    }

    #[test]
    fn default_presence_change_reshuffles() {
        let lb = lb();
        assert!(lb.reconcile(&["A", "B"]));
        assert_eq!(lb.ring().len(), 3);

        assert!(lb.reconcile(&["A", "B", DEFAULT]));
        let ring = lb.ring();
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().filter(|s| *s == DEFAULT).count(), 1);
        assert_eq!(lb.server_addresses()[0], DEFAULT);
    }

    #[test]
    fn full_ring_coverage() {
        let lb = lb();
        let addresses = ["a:1", "b:1", "c:1", "d:1", "e:1"];
        assert!(lb.reconcile(&addresses));

        let mut current = lb.current_server_address();
        let mut visited = vec![current.clone()];
        for _ in 0..addresses.len() - 1 {
            current = lb.select_next(&current).unwrap();
            visited.push(current.clone());
        }
        assert_eq!(visited, lb.ring());

        // The next advance wraps to the start of the ring.
        assert_eq!(lb.select_next(&current).unwrap(), visited[0]);
    }

    #[test]
    fn stale_failure_is_noop() {
        let lb = lb();
        assert!(lb.reconcile(&["A", "B", "C"]));
        let first = lb.current_server_address();
        let second = lb.select_next(&first).unwrap();
        let index = next_index(&lb);

        assert_eq!(lb.select_next(&first).unwrap(), second);
        assert_eq!(next_index(&lb), index);
        assert_eq!(lb.current_server_address(), second);
    }

    #[test]
    fn concurrent_failures_advance_once() {
        let lb = Arc::new(lb());
        assert!(lb.reconcile(&["A", "B", "C", "D"]));
        let failed = lb.current_server_address();
        let ring = lb.ring();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lb = Arc::clone(&lb);
                let failed = failed.clone();
                std::thread::spawn(move || lb.select_next(&failed).unwrap())
            })
            .collect();
        let results: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.len(), 1);
        assert!(results.contains(&ring[1]));
        assert_eq!(next_index(&lb), 2);
    }

    #[test]
    fn removed_servers_are_dropped_except_default() {
        let lb = lb();
        assert!(lb.reconcile(&[DEFAULT, "B", "C"]));
        assert!(lb.server("B").is_some());

        assert!(lb.reconcile(&["C"]));
        assert!(lb.server("B").is_none());
        assert!(lb.server("C").is_some());
        assert!(lb.server(DEFAULT).is_some());
        assert_eq!(lb.ring(), vec!["C", DEFAULT]);
    }

    #[test]
    fn current_is_always_tracked_and_in_ring() {
        let lb = lb();
        for list in [vec!["A", "B"], vec!["B", "C", DEFAULT], vec!["E"], vec!["E", "F"]] {
            lb.reconcile(&list);
            let current = lb.current_server_address();
            assert!(lb.ring().contains(&current));
            assert!(lb.server(&current).is_some());
        }
    }

    #[test]
    fn scenario_single_then_three() {
        let lb = lb();
        assert!(lb.reconcile(&[DEFAULT]));
        assert_eq!(lb.ring(), vec![DEFAULT]);
        assert_eq!(lb.select_next(DEFAULT).unwrap(), DEFAULT);
        assert_eq!(lb.select_next("other").unwrap(), DEFAULT);

        assert!(lb.reconcile(&[DEFAULT, "10.0.0.2:6443", "10.0.0.3:6443"]));
        let ring = lb.ring();
        assert_eq!(ring.len(), 3);
        let current = lb.current_server_address();
        let next = lb.select_next(DEFAULT).unwrap();
        if current == DEFAULT {
            assert_eq!(next, ring[1]);
        } else {
            assert_eq!(next, current);
        }
    }

    #[test]
    fn no_default_and_no_servers_is_an_error() {
        let lb = LoadBalancer::new("svc", "", Arc::new(DialerHandle::new()));
        assert_eq!(
            lb.select_next("A"),
            Err(LoadBalancerError::NoServersAvailable { service: "svc".into() })
        );

        assert!(lb.reconcile(&["A", "B"]));
        assert_eq!(lb.ring().len(), 2);
        assert!(lb.select_next("A").is_ok());
    }

    #[test]
    fn no_servers_error_message() {
        let err = LoadBalancerError::NoServersAvailable {
            service: "svc".into(),
        };
        assert_eq!(err.to_string(), "no servers in load balancer svc proxy list");
    }

    #[tokio::test]
    async fn dial_unknown_address_is_not_found() {
        let lb = lb();
        let err = lb.dial("tcp", "192.0.2.1:1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
