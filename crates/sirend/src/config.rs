use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the Siren server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sirend")]
#[command(about = "Siren federated messaging server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:9989", env = "SIREND_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9990", env = "SIREND_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum encoded packet size in bytes.
    #[arg(long, default_value = "4096", env = "SIREND_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "4096", env = "SIREND_MAX_CONNECTIONS")]
    pub max_connections: usize,
    /// Refuse inbound server-to-server connections.
    #[arg(long, env = "SIREND_DISABLE_FEDERATION")]
    pub disable_federation: bool,
    /// Domain this server is authoritative for (repeatable).
    #[arg(long = "local-domain", env = "SIREND_LOCAL_DOMAINS", value_delimiter = ',')]
    pub local_domains: Vec<String>,
    /// Static federation target: `domain=host:port[,host:port]` (repeatable).
    #[arg(long = "federation-peer", env = "SIREND_FEDERATION_PEERS")]
    pub federation_peers: Vec<String>,
    /// Path to the 32-byte Curve25519 private key file.
    #[arg(long, env = "SIREND_KEYPAIR")]
    pub keypair: Option<PathBuf>,
    /// Seed `test@<domain>` with fresh keys for each local domain.
    #[arg(long)]
    pub seed_test_user: bool,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum encoded packet size in bytes.
    pub max_message_size: usize,
    /// Maximum total concurrent connections.
    pub max_connections: usize,
    /// Whether inbound server-to-server connections are accepted.
    pub federation_enabled: bool,
    /// Domains this server is authoritative for.
    pub local_domains: Vec<String>,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending value.
    pub fn validate(&self) -> Result<(), String> {
        // Must hold a length-prefixed HelloIAm at minimum.
        if self.max_message_size < 64 {
            return Err("max_message_size must be at least 64 bytes".to_string());
        }
        if self.max_message_size > 1_048_576 {
            return Err("max_message_size exceeds reasonable limit (1 MiB)".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.max_connections > 1_000_000 {
            return Err("max_connections exceeds reasonable limit (1,000,000)".to_string());
        }

        for domain in &self.local_domains {
            if domain.is_empty() || domain.contains('@') || domain.contains(char::is_whitespace) {
                return Err(format!("invalid local domain {domain:?}"));
            }
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_message_size: args.max_message_size,
            max_connections: args.max_connections,
            federation_enabled: !args.disable_federation,
            local_domains: args.local_domains,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:9989".parse().unwrap(),
            metrics_addr: "127.0.0.1:9990".parse().unwrap(),
            max_message_size: 4096,
            max_connections: 4096,
            federation_enabled: true,
            local_domains: vec!["test.com".to_string()],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn max_message_size_too_small() {
        let mut c = valid_config();
        c.max_message_size = 16;
        assert!(c.validate().unwrap_err().contains("max_message_size"));
    }

    #[test]
    fn max_message_size_too_large() {
        let mut c = valid_config();
        c.max_message_size = 2_000_000;
        assert!(c.validate().unwrap_err().contains("max_message_size"));
    }

    #[test]
    fn max_connections_zero() {
        let mut c = valid_config();
        c.max_connections = 0;
        assert!(c.validate().unwrap_err().contains("max_connections"));
    }

    #[test]
    fn max_connections_too_large() {
        let mut c = valid_config();
        c.max_connections = 1_000_001;
        assert!(c.validate().unwrap_err().contains("max_connections"));
    }

    #[test]
    fn local_domain_with_at_sign_rejected() {
        let mut c = valid_config();
        c.local_domains = vec!["user@test.com".to_string()];
        assert!(c.validate().unwrap_err().contains("local domain"));
    }

    #[test]
    fn empty_local_domain_rejected() {
        let mut c = valid_config();
        c.local_domains = vec![String::new()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.max_message_size = 64;
        c.max_connections = 1;
        assert!(c.validate().is_ok());

        c.max_message_size = 1_048_576;
        c.max_connections = 1_000_000;
        assert!(c.validate().is_ok());
    }
}
