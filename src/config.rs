//! Endpoints and tunables.
//!
//! Everything here is a plain value handed in at construction time. The
//! core does not read configuration files or environment variables; the
//! client layers above own that and pass the results down.

use crate::base::neterror::NetError;
use crate::socket::Socket;
use std::fmt;
use std::net::Ipv6Addr;
use std::rc::Rc;
use std::time::Duration;

/// A destination, canonicalized to `host:port`.
///
/// The host is validated and lowercased through [`url::Host`], so
/// `"DB01.Example.COM:11210"` and `"db01.example.com:11210"` key the same
/// pool bucket. IPv6 literals must be bracketed (`[::1]:11210`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Result<Self, NetError> {
        if port == 0 {
            return Err(NetError::BadEndpoint);
        }
        // url::Host wants IPv6 literals bracketed; they arrive here bare.
        let host = if let Ok(ip) = host.parse::<Ipv6Addr>() {
            ip.to_string()
        } else {
            match url::Host::parse(host).map_err(|_| NetError::BadEndpoint)? {
                url::Host::Domain(d) => d,
                url::Host::Ipv4(ip) => ip.to_string(),
                url::Host::Ipv6(ip) => ip.to_string(),
            }
        };
        if host.is_empty() {
            return Err(NetError::BadEndpoint);
        }
        Ok(Endpoint { host, port })
    }

    /// Parses `host:port`, with brackets required for IPv6 literals.
    pub fn parse(dest: &str) -> Result<Self, NetError> {
        let (host, port) = if let Some(rest) = dest.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or(NetError::BadEndpoint)?;
            let port = rest.strip_prefix(':').ok_or(NetError::BadEndpoint)?;
            (host, port)
        } else {
            let (host, port) = dest.rsplit_once(':').ok_or(NetError::BadEndpoint)?;
            if host.contains(':') {
                // unbracketed IPv6
                return Err(NetError::BadEndpoint);
            }
            (host, port)
        };
        let port: u16 = port.parse().map_err(|_| NetError::BadEndpoint)?;
        Endpoint::new(host, port)
    }

    /// Host without brackets, as handed to the resolver.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Canonical `host:port` string, used as the pool bucket key. IPv6
    /// hosts come back bracketed.
    pub fn key(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Address-family policy applied to resolver output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IpPreference {
    /// Use addresses in resolver order.
    #[default]
    Any,
    /// Try IPv4 addresses before IPv6, keeping both.
    V4First,
    /// Try IPv6 addresses before IPv4, keeping both.
    V6First,
    /// Drop IPv6 addresses entirely.
    V4Only,
    /// Drop IPv4 addresses entirely.
    V6Only,
}

/// Hook applied to a freshly connected socket, before any I/O context is
/// bound and before any application bytes flow. This is where a TLS layer
/// attaches its state; the core fires it at most once per socket and does
/// not interpret what it does.
pub type WrapHook = Rc<dyn Fn(&Socket)>;

/// Per-connection tunables.
#[derive(Clone)]
pub struct NetConfig {
    pub connect_timeout: Option<Duration>,
    pub nodelay: bool,
    pub keepalive: bool,
    pub ip: IpPreference,
    pub wrap: Option<WrapHook>,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            connect_timeout: None,
            nodelay: true,
            keepalive: true,
            ip: IpPreference::Any,
            wrap: None,
        }
    }
}

impl NetConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Effective connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

impl fmt::Debug for NetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetConfig")
            .field("connect_timeout", &self.connect_timeout())
            .field("nodelay", &self.nodelay)
            .field("keepalive", &self.keepalive)
            .field("ip", &self.ip)
            .field("wrap", &self.wrap.is_some())
            .finish()
    }
}

/// Per-destination pool limits.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Cap on idle + connecting + leased sockets for one destination.
    pub max_total: usize,
    /// Cap on the idle list; excess returned sockets are closed.
    pub max_idle: usize,
    /// How long an unused pooled socket survives before it is closed.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 6,
            max_idle: 2,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hostname() {
        let ep = Endpoint::parse("db01.Example.com:11210").unwrap();
        assert_eq!(ep.host(), "db01.example.com");
        assert_eq!(ep.port(), 11210);
        assert_eq!(ep.key(), "db01.example.com:11210");
    }

    #[test]
    fn parse_ipv4() {
        let ep = Endpoint::parse("127.0.0.1:9090").unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.key(), "127.0.0.1:9090");
    }

    #[test]
    fn parse_ipv6_requires_brackets() {
        let ep = Endpoint::parse("[::1]:9090").unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.key(), "[::1]:9090");
        assert_eq!(Endpoint::parse("::1:9090"), Err(NetError::BadEndpoint));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Endpoint::parse("no-port"), Err(NetError::BadEndpoint));
        assert_eq!(Endpoint::parse("host:notaport"), Err(NetError::BadEndpoint));
        assert_eq!(Endpoint::parse("host:0"), Err(NetError::BadEndpoint));
        assert_eq!(Endpoint::parse(":9090"), Err(NetError::BadEndpoint));
    }

    #[test]
    fn same_key_same_bucket() {
        let a = Endpoint::parse("Cache.Local:9090").unwrap();
        let b = Endpoint::parse("cache.local:9090").unwrap();
        assert_eq!(a, b);
    }
}
