//! The resolution seam: the [`Resolve`] trait and supporting types.

use crate::base::neterror::NetError;
use crate::config::IpPreference;
use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

/// A hostname to resolve.
///
/// Thin wrapper so resolvers take something better-typed than `&str`.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Future returned by a resolver. The core is single-threaded, so the
/// future does not need to be `Send`.
pub type Resolving = LocalBoxFuture<'static, Result<Vec<SocketAddr>, NetError>>;

/// Trait for DNS resolution.
///
/// Implementations return the full candidate address list for a
/// destination, already carrying the destination port. An empty list is an
/// error ([`NetError::NameNotResolved`]), never an `Ok`.
pub trait Resolve {
    fn resolve(&self, name: Name, port: u16) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Rc<R> {
    fn resolve(&self, name: Name, port: u16) -> Resolving {
        (**self).resolve(name, port)
    }
}

/// Fixed hostname-to-address table.
///
/// Looks up the hostname in a map and fails with
/// [`NetError::NameNotResolved`] on a miss; there is no fallback resolver
/// behind it. Entries with port 0 take the port the caller asked for,
/// entries with an explicit port keep it (useful for redirecting a
/// destination onto a different local port in tests).
#[derive(Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, addrs: Vec<SocketAddr>) {
        self.entries.insert(host.into(), addrs);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, name: Name, port: u16) -> Resolving {
        let result = match self.entries.get(name.as_str()) {
            Some(addrs) if !addrs.is_empty() => {
                let addrs = addrs
                    .iter()
                    .map(|a| {
                        let mut a = *a;
                        if a.port() == 0 {
                            a.set_port(port);
                        }
                        a
                    })
                    .collect();
                Ok(addrs)
            }
            _ => {
                tracing::debug!(host = %name, "no static entry for host");
                Err(NetError::NameNotResolved)
            }
        };
        Box::pin(std::future::ready(result))
    }
}

impl fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResolver")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Reorders (or filters) a candidate list by address-family preference.
/// Ordering within a family is preserved, so the resolver's own ranking
/// still decides ties.
pub fn order_by_preference(addrs: Vec<SocketAddr>, pref: IpPreference) -> Vec<SocketAddr> {
    match pref {
        IpPreference::Any => addrs,
        IpPreference::V4Only => addrs.into_iter().filter(|a| a.is_ipv4()).collect(),
        IpPreference::V6Only => addrs.into_iter().filter(|a| a.is_ipv6()).collect(),
        IpPreference::V4First => {
            let (v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv4());
            v4.into_iter().chain(v6).collect()
        }
        IpPreference::V6First => {
            let (v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv6());
            v6.into_iter().chain(v4).collect()
        }
    }
}
