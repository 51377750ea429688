//! Async DNS resolver using hickory-dns.
//!
//! Fully async lookups with system-config auto-detection and dual-stack
//! (IPv4 + IPv6) resolution. The underlying resolver is process-wide and
//! lazily initialized on first use; per-reactor [`HickoryResolver`] values
//! all share it.

use super::{Name, Resolve, Resolving};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::net::SocketAddr;
use std::sync::LazyLock;

/// Resolver backed by hickory-dns.
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: &'static LazyLock<TokioResolver>,
}

impl HickoryResolver {
    /// Creates a handle to the shared resolver. Initialization is
    /// deferred to the first lookup; if the system DNS configuration
    /// cannot be read, defaults are used.
    pub fn new() -> Self {
        static RESOLVER: LazyLock<TokioResolver> = LazyLock::new(|| {
            let mut builder = match TokioResolver::builder_tokio() {
                Ok(builder) => builder,
                Err(e) => {
                    tracing::warn!(error = %e, "no system DNS config, using defaults");
                    TokioResolver::builder_with_config(
                        ResolverConfig::default(),
                        TokioConnectionProvider::default(),
                    )
                }
            };
            builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
            builder.build()
        });

        Self { resolver: &RESOLVER }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name, port: u16) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let host = name.as_str();
            tracing::trace!(host = %host, "resolving via hickory-dns");

            let lookup = resolver.resolver.lookup_ip(host).await.map_err(|e| {
                tracing::debug!(host = %host, error = %e, "hickory-dns lookup failed");
                NetError::NameNotResolved
            })?;

            let addrs: Vec<SocketAddr> =
                lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();

            if addrs.is_empty() {
                return Err(NetError::NameNotResolved);
            }

            tracing::debug!(host = %host, count = addrs.len(), "resolved");
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_one_resolver() {
        let a = HickoryResolver::new();
        let b = a.clone();
        assert!(std::ptr::eq(a.resolver, b.resolver));
    }
}
