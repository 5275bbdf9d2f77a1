//! Server list discovery from the configuration file.
//!
//! # Responsibilities
//! - Reload the file whenever it is written
//! - Forward a reload only when it carries a new, non-empty server list
//! - Stop reloading once the agent no longer listens
//!
//! Only `servers` changes at runtime, so reloads that leave it as it was
//! never reach the load balancer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::AgentConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches the configuration file and emits configs with changed server lists.
pub struct ConfigWatcher {
    path: PathBuf,
    servers: ServerListFilter,
    update_tx: mpsc::UnboundedSender<AgentConfig>,
}

impl ConfigWatcher {
    /// `current` is the configuration already applied; its server list is
    /// not sent again.
    pub fn new(path: &Path, current: &AgentConfig) -> (Self, mpsc::UnboundedReceiver<AgentConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let mut servers = ServerListFilter::default();
        servers.accept(&current.servers);

        (
            Self {
                path: path.to_path_buf(),
                servers,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut servers,
            update_tx,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) || update_tx.is_closed() {
                    return;
                }

                let config = match load_config(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Config reload rejected; keeping current servers");
                        return;
                    }
                };
                if !servers.accept(&config.servers) {
                    tracing::debug!(path = %path.display(), "Server list unchanged; reload ignored");
                    return;
                }

                tracing::info!(path = %path.display(), servers = ?config.servers, "Server list reloaded");
                if update_tx.send(config).is_err() {
                    tracing::warn!(path = %path.display(), "Agent stopped; further reloads are ignored");
                }
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %watched.display(), "Watching config for server list changes");
        Ok(watcher)
    }
}

/// Last server list forwarded, compared as a set the way reconcile compares it.
#[derive(Debug, Default)]
struct ServerListFilter {
    last: BTreeSet<String>,
}

impl ServerListFilter {
    /// True when `servers` is non-empty and differs from the last accepted list.
    fn accept(&mut self, servers: &[String]) -> bool {
        let next: BTreeSet<String> = servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if next.is_empty() || next == self.last {
            return false;
        }
        self.last = next;
        true
    }
}
