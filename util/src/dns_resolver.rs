//! DNS lookups for response routing.

use std::io;
use std::net::IpAddr;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::lookup_ip::LookupIp;
use hickory_resolver::TokioAsyncResolver;

/// Resolver
pub struct Resolver {
    dns_resolver: TokioAsyncResolver,
}

impl Resolver {
    async fn lookup(&self, host: &str) -> Result<LookupIp, ResolveError> {
        self.dns_resolver.lookup_ip(host).await
    }

    /// Resolve a host name to a single address.
    pub async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        self.lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup DNS: {}", err)))?
            .iter()
            .next()
            .ok_or_else(|| io::Error::other(format!("No address found for {}", host)))
    }

    /// Resolve every address of a host name.
    pub async fn resolve_all(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let result = self
            .lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup dns: {}", err)))?;

        let addresses = result.iter().collect();

        Ok(addresses)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        // Fall back to a static configuration when the host has no usable
        // system resolver configuration.
        let dns_resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        Self { dns_resolver }
    }
}
