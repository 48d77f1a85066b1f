use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::Service;

use crate::domain::{Origin, Translator};
use crate::error::Error;
use crate::hooks::HookBus;
use crate::http::{Body, BoxError, HttpService, ResolvedAddrs, UpstreamTarget};
use crate::resolve::Resolve;

use super::call_inner;

/// Tower layer that resolves the upstream host once and rejects requests
/// whose addresses are not publicly routable.
///
/// Hosts configured by the operator (the target and its explicit resources)
/// are exempt; dynamically learned hosts are not. The vetted addresses are
/// handed to the forwarder as [`ResolvedAddrs`] so no second lookup can
/// return something different.
#[derive(Clone)]
pub struct SsrfGuard {
    resolver: Arc<dyn Resolve>,
    translator: Arc<Translator>,
    hooks: Arc<HookBus>,
}

impl SsrfGuard {
    pub fn new(resolver: Arc<dyn Resolve>, translator: Arc<Translator>, hooks: Arc<HookBus>) -> Self {
        Self {
            resolver,
            translator,
            hooks,
        }
    }
}

impl tower::Layer<HttpService> for SsrfGuard {
    type Service = SsrfGuardService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        SsrfGuardService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            guard: self.clone(),
        }
    }
}

pub struct SsrfGuardService {
    inner: Arc<tokio::sync::Mutex<HttpService>>,
    guard: SsrfGuard,
}

impl Service<Request<Body>> for SsrfGuardService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let guard = self.guard.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            let Some(target) = req.extensions().get::<UpstreamTarget>().cloned() else {
                return call_inner(&inner, req).await;
            };
            let addrs = guard
                .resolver
                .resolve(&target.host, target.port)
                .await
                .map_err(|e| Error::upstream(target.pool_key(), e))?;

            let exempt = guard.translator.origin_of(&target.host) == Some(Origin::Configured);
            if !exempt && let Some(addr) = addrs.iter().map(|a| a.ip()).find(|ip| !is_public(*ip)) {
                tracing::warn!(host = %target.host, %addr, "blocked outbound request to non-public address");
                guard.hooks.fire_security_violation(&target.host, addr);
                return Err(Box::new(Error::SecurityPolicyViolation {
                    host: target.host,
                    addr,
                }) as BoxError);
            }

            req.extensions_mut().insert(ResolvedAddrs(addrs));
            call_inner(&inner, req).await
        })
    }
}

/// `false` for loopback, private, link-local, shared and unspecified ranges.
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let shared = a == 100 && (b & 0xc0) == 64;
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || shared
        || a == 0)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
