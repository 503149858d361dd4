//! Service discovery for federation targets.
//!
//! Real DNS resolution lives outside the core: the router consumes a
//! [`SrvResolver`], which answers the `_siren._tcp.<domain>` question with an
//! ordered list of dial targets. The shipped implementation is a static table
//! built from `--federation-peer` configuration entries.

use async_trait::async_trait;
use std::collections::HashMap;

/// One SRV-style record: a dial target in the resolver's preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Hostname or IP address to dial.
    pub target: String,
    /// TCP port.
    pub port: u16,
}

/// Resolves a federation domain to an ordered list of dial targets.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Answers the `_siren._tcp.<domain>` SRV question. An empty list means
    /// the domain is unreachable; the caller abandons the dial.
    async fn resolve_srv(&self, domain: &str) -> Vec<SrvRecord>;
}

/// Resolver backed by a static domain → targets table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<SrvRecord>>,
}

impl StaticResolver {
    /// Creates an empty resolver that answers every domain with no targets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dial target for a domain, after any existing targets.
    pub fn add(&mut self, domain: impl Into<String>, target: impl Into<String>, port: u16) {
        self.entries.entry(domain.into()).or_default().push(SrvRecord {
            target: target.into(),
            port,
        });
    }

    /// Parses repeated `domain=host:port[,host:port]` configuration entries.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed entry.
    pub fn from_peer_entries(entries: &[String]) -> Result<Self, String> {
        let mut resolver = Self::new();
        for entry in entries {
            let (domain, targets) = entry
                .split_once('=')
                .ok_or_else(|| format!("federation peer {entry:?} is missing '='"))?;
            if domain.is_empty() {
                return Err(format!("federation peer {entry:?} has an empty domain"));
            }
            for target in targets.split(',') {
                let (host, port) = target
                    .rsplit_once(':')
                    .ok_or_else(|| format!("federation target {target:?} is missing a port"))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| format!("federation target {target:?} has an invalid port"))?;
                if host.is_empty() {
                    return Err(format!("federation target {target:?} has an empty host"));
                }
                resolver.add(domain, host, port);
            }
        }
        Ok(resolver)
    }
}

#[async_trait]
impl SrvResolver for StaticResolver {
    async fn resolve_srv(&self, domain: &str) -> Vec<SrvRecord> {
        self.entries.get(domain).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_domain_resolves_to_nothing() {
        let resolver = StaticResolver::new();
        assert!(resolver.resolve_srv("nowhere.example").await.is_empty());
    }

    #[tokio::test]
    async fn entries_preserve_preference_order() {
        let resolver = StaticResolver::from_peer_entries(&[
            "remote.example=first.example:9989,second.example:9990".to_string(),
        ])
        .unwrap();
        let records = resolver.resolve_srv("remote.example").await;
        assert_eq!(
            records,
            vec![
                SrvRecord {
                    target: "first.example".to_string(),
                    port: 9989
                },
                SrvRecord {
                    target: "second.example".to_string(),
                    port: 9990
                },
            ]
        );
    }

    #[test]
    fn rejects_entry_without_equals() {
        assert!(StaticResolver::from_peer_entries(&["remote.example".to_string()]).is_err());
    }

    #[test]
    fn rejects_target_without_port() {
        assert!(
            StaticResolver::from_peer_entries(&["remote.example=hostonly".to_string()]).is_err()
        );
    }

    #[test]
    fn rejects_bad_port() {
        assert!(
            StaticResolver::from_peer_entries(&["remote.example=host:notaport".to_string()])
                .is_err()
        );
    }
}
