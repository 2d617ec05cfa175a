//! Backend address resolution.
//!
//! # Responsibilities
//! - Turn an engine hostname into exactly one IPv4 socket address
//! - Run once per request, before the upstream connection is opened
//!
//! # Design Decisions
//! - Resolution goes through the `Resolve` trait so the request task is
//!   suspended on a future instead of blocking the worker thread
//! - No caching and no retry; a failed lookup fails the request
//! - The resolved address lives in the request context only

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use futures_util::future::BoxFuture;

use crate::error::ProxyError;

/// Resolved backend endpoint. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Name-service lookup for backend hosts.
pub trait Resolve: Send + Sync + fmt::Debug {
    /// Resolve `host` to a single IPv4 address on `port`.
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<BackendAddress, ProxyError>>;
}

/// Resolver backed by the system name service through tokio.
///
/// The blocking `getaddrinfo` call runs on tokio's blocking pool, so only the
/// requesting task waits for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl Resolve for DnsResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<BackendAddress, ProxyError>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| ProxyError::Resolution {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;

            first_ipv4(addrs).ok_or_else(|| ProxyError::Resolution {
                host: host.to_string(),
                reason: "no IPv4 address".to_string(),
            })
        })
    }
}

/// Resolver with a fixed host table, used when backends are resolved at
/// configuration time.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry. Host names are matched case-insensitively.
    pub fn with_host(mut self, host: &str, ip: Ipv4Addr) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), ip);
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<BackendAddress, ProxyError>> {
        let result = self
            .hosts
            .get(&host.to_ascii_lowercase())
            .map(|ip| BackendAddress::new(*ip, port))
            .ok_or_else(|| ProxyError::Resolution {
                host: host.to_string(),
                reason: "host not in static table".to_string(),
            });
        Box::pin(futures_util::future::ready(result))
    }
}

fn first_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<BackendAddress> {
    addrs.into_iter().find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(BackendAddress::new(*v4.ip(), v4.port())),
        SocketAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ipv4_skips_v6() {
        let addrs: Vec<SocketAddr> = vec![
            "[::1]:80".parse().unwrap(),
            "10.0.0.7:80".parse().unwrap(),
            "10.0.0.8:80".parse().unwrap(),
        ];
        let picked = first_ipv4(addrs).unwrap();
        assert_eq!(picked, BackendAddress::new(Ipv4Addr::new(10, 0, 0, 7), 80));
    }

    #[test]
    fn first_ipv4_none_when_only_v6() {
        let addrs: Vec<SocketAddr> = vec!["[::1]:80".parse().unwrap()];
        assert!(first_ipv4(addrs).is_none());
    }

    #[tokio::test]
    async fn dns_resolver_accepts_literal() {
        let addr = DnsResolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn static_resolver_case_insensitive() {
        let resolver = StaticResolver::new().with_host("CN.Bing.com", Ipv4Addr::new(1, 2, 3, 4));
        let addr = resolver.resolve("cn.bing.com", 80).await.unwrap();
        assert_eq!(addr.socket_addr(), "1.2.3.4:80".parse().unwrap());

        let err = resolver.resolve("www.baidu.com", 80).await.unwrap_err();
        assert!(matches!(err, ProxyError::Resolution { .. }));
    }
}
