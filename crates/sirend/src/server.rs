use crate::config::ServerConfig;
use crate::connection;
use crate::directory::Directory;
use crate::error::SirendError;
use crate::metrics::HealthState;
use crate::resolver::SrvResolver;
use crate::router::Router;
use siren_common::crypto;
use siren_common::types::Pubkey;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Shared state for the Siren server.
///
/// Components hold no references to one another; operations that need to
/// cross component boundaries (connection → directory → router → connection)
/// take `&Arc<ServerState>` instead.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// This node's long-lived Curve25519 public key.
    pub public_key: Pubkey,
    /// This node's long-lived Curve25519 private key.
    pub secret_key: [u8; 32],
    /// Live-connection table and federation index.
    pub router: Router,
    /// Authoritative directory for the configured local domains.
    pub local_directory: Directory,
    /// Cache of directory records fetched over federation links.
    pub external_directory: Directory,
    /// Service discovery for federation targets.
    pub resolver: Box<dyn SrvResolver>,
}

impl ServerState {
    /// Builds server state from a validated config, a private key, and a
    /// resolver.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        secret_key: [u8; 32],
        resolver: Box<dyn SrvResolver>,
    ) -> Self {
        Self {
            public_key: crypto::public_key_of(&secret_key),
            secret_key,
            config,
            router: Router::new(),
            local_directory: Directory::new(),
            external_directory: Directory::new(),
            resolver,
        }
    }

    /// Returns `true` if this server is authoritative for `domain`.
    #[must_use]
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.config.local_domains.iter().any(|d| d == domain)
    }
}

/// Runs the accept loop until the listener fails.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an unrecoverable I/O
/// failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), SirendError> {
    run_with_health(listener, state, HealthState::new()).await
}

/// Runs the accept loop, reflecting accept capacity in `health`: the
/// readiness probe reports not-ready while the connection table is full.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an unrecoverable I/O
/// failure.
pub async fn run_with_health(
    listener: TcpListener,
    state: Arc<ServerState>,
    health: HealthState,
) -> Result<(), SirendError> {
    let local_addr = listener.local_addr().map_err(SirendError::Io)?;
    info!("server listening on {}", local_addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => match accept_connection(&state, stream) {
                Ok(()) => health.set_ready(true),
                Err(e) => {
                    warn!("rejecting connection from {}: {}", addr, e);
                    health.set_ready(false);
                }
            },
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

fn accept_connection(state: &Arc<ServerState>, stream: TcpStream) -> Result<(), SirendError> {
    if state.router.connection_count() >= state.config.max_connections {
        drop(stream);
        return Err(SirendError::ConnectionLimit);
    }
    connection::spawn(state.clone(), stream, false, None);
    Ok(())
}
