//! Live-connection tracking and outbound federation links.

use crate::connection::{self, ConnHandle};
use crate::metrics::counters;
use crate::server::ServerState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// How long one federation dial attempt may take before the next SRV target
/// is tried.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection table keyed by connection id, plus the domain → connection
/// index for outbound federation links.
pub struct Router {
    connections: DashMap<u64, ConnHandle>,
    // Held across resolve + dial so two concurrent calls for one domain
    // cannot both dial (at most one outbound link per domain).
    federations: Mutex<HashMap<String, ConnHandle>>,
    next_id: AtomicU64,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            federations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocates the next connection id.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a connection into the live table.
    pub fn register(&self, handle: ConnHandle) {
        self.connections.insert(handle.id(), handle);
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Looks up a live connection by id.
    #[must_use]
    pub fn connection(&self, id: u64) -> Option<ConnHandle> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every live connection.
    #[must_use]
    pub fn live_connections(&self) -> Vec<ConnHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Looks up the open federation link for a domain, if any.
    pub async fn federation(&self, domain: &str) -> Option<ConnHandle> {
        self.federations.lock().await.get(domain).cloned()
    }

    /// Removes a connection from the live table and, when it carried a
    /// federation domain, from the domain index. The index entry is only
    /// removed if it still refers to this connection.
    pub async fn remove(&self, id: u64, federation_domain: Option<&str>) {
        self.connections.remove(&id);
        if let Some(domain) = federation_domain {
            let mut federations = self.federations.lock().await;
            if federations.get(domain).is_some_and(|h| h.id() == id) {
                federations.remove(domain);
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensures an outbound federation link to `domain` exists, dialing one if
/// necessary, and returns its handle.
///
/// Resolves the domain's SRV targets and dials them in preference order;
/// the first successful dial wins. Returns `None` when every target fails or
/// none resolve — the caller answers from whatever it has cached.
pub async fn initiate_outgoing(state: &Arc<ServerState>, domain: &str) -> Option<ConnHandle> {
    let mut federations = state.router.federations.lock().await;
    if let Some(handle) = federations.get(domain) {
        return Some(handle.clone());
    }

    if state.router.connection_count() >= state.config.max_connections {
        warn!(domain, "connection limit reached, not dialing federation target");
        return None;
    }

    let records = state.resolver.resolve_srv(domain).await;
    if records.is_empty() {
        debug!(domain, "no federation targets resolved");
        counters::federation_dials_total("unresolved");
        return None;
    }

    for record in records {
        let dial = timeout(
            DIAL_TIMEOUT,
            TcpStream::connect((record.target.as_str(), record.port)),
        );
        match dial.await.unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            ))
        }) {
            Ok(stream) => {
                info!(domain, target = %record.target, port = record.port,
                    "connected to federation target");
                counters::federation_dials_total("connected");
                let handle =
                    connection::spawn(state.clone(), stream, true, Some(domain.to_string()));
                federations.insert(domain.to_string(), handle.clone());
                return Some(handle);
            }
            Err(e) => {
                warn!(domain, target = %record.target,
                    "unable to connect to federation target: {e}");
                counters::federation_dials_total("failed");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use siren_common::wire::Payload;
    use tokio::sync::mpsc;

    fn make_handle(id: u64, domain: Option<&str>) -> ConnHandle {
        let (encrypted_tx, _enc_rx) = mpsc::channel::<Payload>(1);
        let (plain_tx, _plain_rx) = mpsc::channel::<Payload>(1);
        connection::ConnHandle::for_tests(id, domain.map(str::to_owned), encrypted_tx, plain_tx)
    }

    #[tokio::test]
    async fn register_and_remove_connection() {
        let router = Router::new();
        let handle = make_handle(router.next_id(), None);
        let id = handle.id();

        router.register(handle);
        assert_eq!(router.connection_count(), 1);
        assert!(router.connection(id).is_some());

        router.remove(id, None).await;
        assert_eq!(router.connection_count(), 0);
        assert!(router.connection(id).is_none());
    }

    #[tokio::test]
    async fn federation_removal_is_guarded_by_id() {
        let router = Router::new();
        let old = make_handle(router.next_id(), Some("remote.example"));
        let new = make_handle(router.next_id(), Some("remote.example"));
        let old_id = old.id();
        let new_id = new.id();

        {
            let mut federations = router.federations.lock().await;
            federations.insert("remote.example".to_string(), old);
            federations.insert("remote.example".to_string(), new);
        }

        // Removing under the stale id leaves the newer entry in place.
        router.remove(old_id, Some("remote.example")).await;
        let current = router.federation("remote.example").await.unwrap();
        assert_eq!(current.id(), new_id);

        router.remove(new_id, Some("remote.example")).await;
        assert!(router.federation("remote.example").await.is_none());
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let router = Router::new();
        let a = router.next_id();
        let b = router.next_id();
        assert_ne!(a, b);
    }
}
