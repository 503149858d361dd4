#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use siren_common::crypto;
use siren_common::types::fmt_key;
use sirend::config::{Args, ServerConfig};
use sirend::metrics::{start_metrics_server, HealthState};
use sirend::resolver::StaticResolver;
use sirend::run_with_health;
use sirend::server::ServerState;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.clone().into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let secret_key = if let Some(ref path) = args.keypair {
        load_keypair(path)?
    } else {
        generate_keypair()
    };
    let public_key = crypto::public_key_of(&secret_key);
    info!("server public key: {}", fmt_key(&public_key));

    let resolver = StaticResolver::from_peer_entries(&args.federation_peers)
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    let state = Arc::new(ServerState::new(
        config.clone(),
        secret_key,
        Box::new(resolver),
    ));

    if args.seed_test_user {
        seed_test_users(&state);
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = run_with_health(listener, state, health_state.clone()) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
    health_state.set_ready(false);

    Ok(())
}

fn load_keypair(path: &Path) -> Result<[u8; 32]> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)?;
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            anyhow::bail!(
                "keypair file permissions too open: {:o}. Expected 0600",
                mode
            );
        }
    }

    let data = std::fs::read(path)?;
    if data.len() < 32 {
        anyhow::bail!("keypair file too short, expected at least 32 bytes");
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&data[..32]);
    info!("loaded keypair from {}", path.display());
    Ok(secret)
}

fn generate_keypair() -> [u8; 32] {
    let (_, secret) = crypto::generate_keypair();
    warn!("using ephemeral keypair (not persisted)");
    secret
}

/// Seeds `test@<domain>` for every local domain with fresh keys, so a
/// `sirenc lookup` has something to find.
fn seed_test_users(state: &Arc<ServerState>) {
    for domain in &state.config.local_domains {
        let uid = format!("test@{domain}");
        let signing_key = crypto::generate_signing_keypair();
        let (device_a, _) = crypto::generate_keypair();
        let (device_b, _) = crypto::generate_keypair();
        state.local_directory.register_user(
            &uid,
            signing_key.verifying_key().to_bytes().to_vec(),
            vec![device_a.to_vec(), device_b.to_vec()],
        );
        info!("seeded directory entry for {uid}");
    }
}
