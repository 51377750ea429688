//! System DNS resolver using getaddrinfo.
//!
//! Resolution runs in `tokio::task::spawn_blocking` so the reactor thread
//! never blocks inside the libc resolver. Use this when the process should
//! respect system DNS configuration (`/etc/resolv.conf`, nsswitch, hosts
//! file); for high lookup rates prefer [`HickoryResolver`].
//!
//! [`HickoryResolver`]: crate::dns::HickoryResolver

use super::{Name, Resolve, Resolving};
use crate::base::neterror::NetError;
use std::net::ToSocketAddrs;

/// Resolver backed by `getaddrinfo` on a blocking thread.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name, port: u16) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let lookup = host.clone();

            let result = tokio::task::spawn_blocking(move || {
                tracing::trace!(host = %lookup, "resolving via getaddrinfo");
                (lookup.as_str(), port)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            let addrs = result
                .map_err(|e| {
                    tracing::warn!(error = %e, "resolver task failed");
                    NetError::Internal
                })?
                .map_err(|e| {
                    tracing::debug!(host = %host, error = %e, "getaddrinfo failed");
                    NetError::NameNotResolved
                })?;

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

    #[tokio::test]
    async fn localhost_resolves() {
        let resolver = GaiResolver::new();
        let addrs = resolver.resolve(Name::new("localhost"), 4444).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 4444));
    }

    #[tokio::test]
    async fn ip_literal_resolves_to_itself() {
        let resolver = GaiResolver::new();
        let addrs = resolver.resolve(Name::new("127.0.0.1"), 9090).await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].to_string(), "127.0.0.1:9090");
    }
}
