use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::uri::Scheme;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tower::Service;

use crate::error::Error;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::resolve::Resolve;
use crate::upstream_proxy::UpstreamProxy;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;
pub type HttpService = tower::util::BoxService<Request<Body>, Response<Body>, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(data.into())
        .map_err(|e| match e {})
        .boxed()
}

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(|e| match e {}).boxed()
}

/// Convert a hyper `Incoming` body into our boxed body type.
pub fn incoming_to_body(incoming: Incoming) -> Body {
    incoming.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    // Names listed in `Connection` are hop-by-hop too
    let listed: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// Where a request is forwarded to. Set as a request extension by the
/// content rewriter once the client-facing host has been translated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        let port = if scheme == Scheme::HTTPS { 443 } else { 80 };
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub(crate) fn pool_key(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Absolute target-side URL for a path and query.
    pub fn url(&self, path_and_query: &str) -> String {
        let default_port = if self.scheme == Scheme::HTTPS { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme, self.host, path_and_query)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, path_and_query)
        }
    }
}

/// Addresses already resolved (and vetted) for the request's upstream host.
#[derive(Clone, Debug)]
pub struct ResolvedAddrs(pub Vec<SocketAddr>);

/// Shared upstream HTTP/1.1 client: one connection pool, one TLS
/// configuration, one resolver for every request of a proxy.
///
/// Redirects are never followed; the response goes back through the
/// pipeline so `Location` can be translated. With an [`UpstreamProxy`] every
/// new connection is tunneled through it.
pub struct UpstreamClient {
    pool: ConnectionPool,
    connector: TlsConnector,
    resolver: Arc<dyn Resolve>,
    timeout: Duration,
    proxy: Option<UpstreamProxy>,
}

impl UpstreamClient {
    pub(crate) fn new(
        tls: rustls::ClientConfig,
        resolver: Arc<dyn Resolve>,
        timeout: Duration,
        max_idle_per_host: usize,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(PoolConfig {
                max_idle_per_host,
                ..PoolConfig::default()
            }),
            connector: TlsConnector::from(Arc::new(tls)),
            resolver,
            timeout,
            proxy: None,
        }
    }

    /// Reach the target through `proxy`.
    pub(crate) fn via(mut self, proxy: Option<UpstreamProxy>) -> Self {
        self.proxy = proxy;
        self
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    /// Send `req` to the [`UpstreamTarget`] stored in its extensions.
    pub async fn send(&self, mut req: Request<Body>) -> Result<Response<Body>, Error> {
        let target = req
            .extensions()
            .get::<UpstreamTarget>()
            .cloned()
            .ok_or_else(|| Error::upstream("<unset>", "request has no upstream target"))?;
        let key = target.pool_key();
        let resolved = req.extensions_mut().remove::<ResolvedAddrs>();
        strip_hop_by_hop(req.headers_mut());

        let start = Instant::now();
        let exchange = async {
            let mut sender = match self.pool.checkout(&key) {
                Some(sender) => sender,
                None => self.connect(&target, resolved.map(|r| r.0)).await?,
            };
            futures_util::future::poll_fn(|cx| sender.poll_ready(cx))
                .await
                .map_err(|e| Error::upstream(&key, e))?;
            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| Error::upstream(&key, e))?;
            Ok::<_, Error>((sender, resp))
        };

        let (mut sender, resp) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    target: key,
                    elapsed: start.elapsed(),
                });
            }
        };

        // The connection becomes reusable once the response body is drained
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if futures_util::future::poll_fn(|cx| sender.poll_ready(cx))
                .await
                .is_ok()
            {
                pool.checkin(key, sender);
            }
        });

        Ok(resp.map(incoming_to_body))
    }

    async fn resolve(&self, target: &UpstreamTarget) -> Result<Vec<SocketAddr>, Error> {
        self.resolver
            .resolve(&target.host, target.port)
            .await
            .map_err(|e| Error::upstream(target.pool_key(), e))
    }

    async fn connect(
        &self,
        target: &UpstreamTarget,
        resolved: Option<Vec<SocketAddr>>,
    ) -> Result<hyper::client::conn::http1::SendRequest<Body>, Error> {
        let key = target.pool_key();
        let tcp = match &self.proxy {
            Some(proxy) => {
                let addr = match resolved {
                    Some(addrs) => addrs.first().copied(),
                    None if proxy.needs_resolved_address() => self.resolve(target).await?.first().copied(),
                    None => None,
                };
                proxy
                    .connect(&target.host, target.port, addr)
                    .await
                    .map_err(|e| Error::upstream(&key, e))?
            }
            None => {
                let addrs = match resolved {
                    Some(addrs) => addrs,
                    None => self.resolve(target).await?,
                };
                let tcp = TcpStream::connect(addrs.as_slice())
                    .await
                    .map_err(|e| Error::upstream(&key, e))?;
                tcp.set_nodelay(true).ok();
                tcp
            }
        };

        if target.scheme == Scheme::HTTPS {
            let server_name: ServerName<'static> = target
                .host
                .clone()
                .try_into()
                .map_err(|e| Error::upstream(&key, e))?;
            let tls = self
                .connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::upstream(&key, e))?;
            handshake(tls, &key).await
        } else {
            handshake(tcp, &key).await
        }
    }
}

async fn handshake<T>(
    io: T,
    key: &str,
) -> Result<hyper::client::conn::http1::SendRequest<Body>, Error>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| Error::upstream(key, e))?;
    let key = key.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(upstream = %key, error = %e, "upstream connection closed");
        }
    });
    Ok(sender)
}

/// Tower service that forwards requests through the shared [`UpstreamClient`].
/// It is the innermost service of every pipeline.
pub struct ForwardService {
    client: Arc<UpstreamClient>,
}

impl ForwardService {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }
}

impl Service<Request<Body>> for ForwardService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let mut resp = client.send(req).await?;
            strip_hop_by_hop(resp.headers_mut());
            Ok(resp)
        })
    }
}
