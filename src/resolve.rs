//! Hostname resolution for outbound requests.
//!
//! The anti-SSRF guard and the upstream forwarder share one [`Resolve`]
//! implementation so that the addresses vetted by the guard are exactly the
//! addresses the forwarder connects to.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'a>>;

/// Resolves a host and port to one or more socket addresses.
pub trait Resolve: Send + Sync + 'static {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> ResolveFuture<'a>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> ResolveFuture<'a> {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {host}"),
                ));
            }
            Ok(addrs)
        })
    }
}

/// Resolver with fixed host entries, falling back to another resolver for
/// everything else.
///
/// A pinned entry replaces both the address and the port, which makes it
/// handy for pointing a target name at a local test server.
///
/// ```rust
/// use mimic::resolve::StaticResolver;
///
/// let resolver = StaticResolver::new().pin("target.test", "127.0.0.1:8080".parse().unwrap());
/// ```
#[derive(Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<SocketAddr>>,
    fallback: Option<Arc<dyn Resolve>>,
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticResolver {
    /// A resolver that only knows pinned entries.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: None,
        }
    }

    /// Pin `host` to `addr`. Repeated calls for the same host add addresses.
    pub fn pin(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.entries
            .entry(host.into().to_ascii_lowercase())
            .or_default()
            .push(addr);
        self
    }

    /// Resolve unpinned hosts with `fallback`.
    pub fn fallback(mut self, fallback: impl Resolve) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> ResolveFuture<'a> {
        Box::pin(async move {
            if let Some(addrs) = self.entries.get(&host.to_ascii_lowercase()) {
                return Ok(addrs.clone());
            }
            match &self.fallback {
                Some(fallback) => fallback.resolve(host, port).await,
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no static entry for {host}"),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pinned_entry_overrides_port() {
        let resolver = StaticResolver::new().pin("Target.Test", "127.0.0.1:9000".parse().unwrap());
        let addrs = resolver.resolve("target.test", 443).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn unknown_host_without_fallback_fails() {
        let resolver = StaticResolver::new();
        let err = resolver.resolve("nowhere.test", 80).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn falls_back_for_unpinned_hosts() {
        let inner = StaticResolver::new().pin("b.test", "10.0.0.2:80".parse().unwrap());
        let resolver = StaticResolver::new()
            .pin("a.test", "10.0.0.1:80".parse().unwrap())
            .fallback(inner);
        let addrs = resolver.resolve("b.test", 80).await.unwrap();
        assert_eq!(addrs[0].ip().to_string(), "10.0.0.2");
    }
}
