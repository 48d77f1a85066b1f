pub mod config;
pub mod domain;
pub mod error;
pub mod hooks;
pub mod http;
pub mod middleware;
pub mod plugins;
pub mod pool;
pub mod resolve;
pub mod rewrite;
pub mod rules;
pub mod session;
pub mod sink;
pub mod tls;
pub mod upstream_proxy;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use ::http::header::{HOST, LOCATION};
use ::http::uri::Scheme;
use ::http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::util::BoxService;
use tower::Layer;

pub use config::{ProxyConfig, Settings, TlsMode};
pub use domain::{DomainName, Translator};
pub use error::{Error, Result};
pub use hooks::{HookBus, HookPoint, Plugin};
pub use tls::CertificateAuthority;

use crate::http::{Body, BoxError, ForwardService, HttpService, UpstreamClient, empty_body, full_body, incoming_to_body};
use crate::middleware::{ContentDecoder, ContentRewriter, Hooks, SsrfGuard, TrafficLogger};
use crate::resolve::{Resolve, SystemResolver};
use crate::rewrite::Rewriter;
use crate::session::SessionTracker;
use crate::sink::LogSink;

/// Builder for configuring a [`Proxy`].
pub struct ProxyBuilder {
    settings: Settings,
    hooks: Arc<HookBus>,
    resolver: Option<Arc<dyn Resolve>>,
    sink: Option<LogSink>,
}

impl ProxyBuilder {
    /// Plugin callbacks fired by the pipeline. Defaults to an empty bus.
    pub fn hooks(mut self, hooks: Arc<HookBus>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Resolver for upstream names. Defaults to the system resolver.
    pub fn resolver(mut self, resolver: impl Resolve) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Write traffic and credential records here instead of the configured
    /// log file.
    pub fn log_sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Proxy> {
        let s = self.settings;

        let target_scheme = if s.target_scheme == Scheme::HTTP { "http" } else { "https" };
        let translator = Arc::new(
            Translator::new(s.target.clone(), s.proxy_domain.clone(), &s.target_resources)?
                .dynamic(s.dynamic_mode)
                .max_learned(s.max_learned_domains)
                .client_scheme(s.tls_mode.client_scheme())
                .target_scheme(target_scheme),
        );
        let rewriter = Arc::new(
            Rewriter::new(translator.clone(), s.rules.clone())
                .tls_mode(s.tls_mode)
                .rewrite_cookie_values(s.rewrite_cookie_values),
        );

        let mut sessions = SessionTracker::new(&s.tracking_cookie, &s.tracking_param, s.proxy_domain.as_str())
            .idle_ttl(s.session_idle_timeout);
        if let Some(url) = &s.terminate_redirect_url {
            sessions = sessions.terminate_on(s.terminate_triggers.clone(), url.clone());
        }

        let sink = match (self.sink, &s.log_file) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(
                LogSink::open(path)
                    .map_err(|e| Error::config(format!("opening log file {}: {e}", path.display())))?,
            ),
            (None, None) => None,
        };

        let resolver = self.resolver.unwrap_or_else(|| Arc::new(SystemResolver));
        let client = Arc::new(
            UpstreamClient::new(
                tls::client_config(s.disable_security)?,
                resolver,
                s.upstream_timeout,
                s.pool_max_idle_per_host,
            )
            .via(s.upstream_proxy.clone()),
        );

        let acceptor = match &s.tls {
            Some(material) => Some(TlsAcceptor::from(Arc::new(tls::server_config(
                &material.cert_pem,
                &material.key_pem,
                material.pool_pem.as_deref(),
            )?))),
            None => None,
        };

        tracing::info!(
            proxy = %s.proxy_domain,
            target = %s.target,
            mode = ?s.tls_mode,
            dynamic = s.dynamic_mode,
            upstream_proxy = s.upstream_proxy.as_ref().map(ToString::to_string),
            plugins = self.hooks.plugins().count(),
            "proxy configured"
        );

        Ok(Proxy {
            inner: Arc::new(Shared {
                settings: s,
                translator,
                rewriter,
                sessions: Arc::new(sessions),
                hooks: self.hooks,
                client,
                sink,
                acceptor,
            }),
        })
    }
}

struct Shared {
    settings: Settings,
    translator: Arc<Translator>,
    rewriter: Arc<Rewriter>,
    sessions: Arc<SessionTracker>,
    hooks: Arc<HookBus>,
    client: Arc<UpstreamClient>,
    sink: Option<LogSink>,
    acceptor: Option<TlsAcceptor>,
}

/// A configured domain-translating reverse proxy.
///
/// Cheaply cloneable via an internal `Arc`. Every request runs through the
/// same layer stack:
///
/// ```text
/// request hooks -> session tracker -> traffic logger -> content rewriter
///   -> response hooks -> content decoder -> SSRF guard -> upstream
/// ```
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Shared>,
}

impl Proxy {
    pub fn builder(settings: Settings) -> ProxyBuilder {
        ProxyBuilder {
            settings,
            hooks: Arc::new(HookBus::empty()),
            resolver: None,
            sink: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn translator(&self) -> &Arc<Translator> {
        &self.inner.translator
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.inner.sessions
    }

    fn pipeline(&self) -> HttpService {
        let s = &self.inner;
        let mut svc: HttpService = BoxService::new(ForwardService::new(s.client.clone()));
        if !s.settings.disable_security {
            let guard = SsrfGuard::new(s.client.resolver().clone(), s.translator.clone(), s.hooks.clone());
            svc = BoxService::new(guard.layer(svc));
        }
        svc = BoxService::new(ContentDecoder::new().layer(svc));
        svc = BoxService::new(Hooks::response(s.hooks.clone()).layer(svc));
        let rewriter = ContentRewriter::new(s.rewriter.clone(), s.hooks.clone())
            .scheme(s.settings.target_scheme.clone())
            .target_port(s.settings.target_port)
            .body_timeout(s.settings.upstream_timeout)
            .sink(s.sink.clone());
        svc = BoxService::new(rewriter.layer(svc));
        if let Some(sink) = &s.sink {
            let logger = TrafficLogger::new(sink.clone()).post_only(s.settings.post_only);
            svc = BoxService::new(logger.layer(svc));
        }
        svc = BoxService::new(middleware::SessionTracker::new(s.sessions.clone()).layer(svc));
        BoxService::new(Hooks::request(s.hooks.clone()).layer(svc))
    }

    /// Run one request through a fresh pipeline. Pipeline errors become
    /// generic `403`/`502`/`504` responses.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let pipeline = tokio::sync::Mutex::new(self.pipeline());
        dispatch(&pipeline, req).await
    }

    /// Bind the listeners the TLS mode calls for and serve until `shutdown`
    /// resolves.
    pub async fn listen_with_shutdown(&self, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        let s = &self.inner.settings;
        let http_addr = SocketAddr::new(s.listening_address, s.http_port);
        let http = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
        let https = if s.tls_mode.needs_certificate() {
            let https_addr = SocketAddr::new(s.listening_address, s.https_port);
            Some(
                TcpListener::bind(https_addr)
                    .await
                    .with_context(|| format!("binding HTTPS listener on {https_addr}"))?,
            )
        } else {
            None
        };

        let serve_https = async {
            match https {
                Some(listener) => self.serve_https(listener).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = self.serve_http(http) => result,
            result = serve_https => result,
            () = shutdown => {
                tracing::info!("shutting down");
                Ok(())
            }
        }
    }

    /// Serve until the process is stopped.
    pub async fn listen(&self) -> anyhow::Result<()> {
        self.listen_with_shutdown(std::future::pending()).await
    }

    /// Accept plain HTTP connections on `listener`. In HTTPS-only mode every
    /// request is redirected to the HTTPS listener.
    pub async fn serve_http(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "HTTP listener ready");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            stream.set_nodelay(true).ok();
            let proxy = self.clone();
            tokio::spawn(async move { proxy.serve_connection(stream, peer, false).await });
        }
    }

    /// Accept TLS connections on `listener` with the configured certificate.
    pub async fn serve_https(&self, listener: TcpListener) -> anyhow::Result<()> {
        let acceptor = self
            .inner
            .acceptor
            .clone()
            .context("HTTPS listener needs a TLS certificate")?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "HTTPS listener ready");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            stream.set_nodelay(true).ok();
            let proxy = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => proxy.serve_connection(tls, peer, true).await,
                    Err(e) => tracing::debug!(%peer, error = %e, "TLS handshake failed"),
                }
            });
        }
    }

    async fn serve_connection<I>(self, io: I, peer: SocketAddr, secure: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = self;
        // One pipeline serves every request of the connection
        let pipeline = Arc::new(tokio::sync::Mutex::new(proxy.pipeline()));
        let service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let pipeline = pipeline.clone();
            async move {
                let req = req.map(incoming_to_body);
                if !secure && proxy.inner.settings.tls_mode == TlsMode::HttpsOnly {
                    return Ok::<_, Infallible>(proxy.https_redirect(&req));
                }
                Ok(dispatch(&pipeline, req).await)
            }
        });
        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await
        {
            tracing::debug!(%peer, error = %e, "client connection closed with error");
        }
    }

    /// `301` to the HTTPS listener. Hosts the proxy does not serve are
    /// replaced by the proxy domain, so the redirect never leaves it.
    fn https_redirect(&self, req: &Request<Body>) -> Response<Body> {
        let s = &self.inner.settings;
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|h| self.inner.translator.resolve_request_host(h).is_some())
            .map(domain::strip_port)
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| s.proxy_domain.to_string());
        let port = if s.https_port == 443 {
            String::new()
        } else {
            format!(":{}", s.https_port)
        };
        let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
        let location = format!("https://{host}{port}{path}");

        let mut resp = Response::new(empty_body());
        *resp.status_mut() = StatusCode::MOVED_PERMANENTLY;
        if let Ok(value) = HeaderValue::from_str(&location) {
            resp.headers_mut().insert(LOCATION, value);
        }
        resp
    }
}

async fn dispatch(pipeline: &tokio::sync::Mutex<HttpService>, req: Request<Body>) -> Response<Body> {
    middleware::call_inner(pipeline, req)
        .await
        .unwrap_or_else(error_response)
}

fn error_response(err: BoxError) -> Response<Body> {
    let status = match err.downcast_ref::<Error>() {
        Some(e @ Error::SecurityPolicyViolation { .. }) => {
            tracing::debug!(error = %e, "request refused");
            e.client_status()
        }
        Some(e) => {
            let source = std::error::Error::source(e).map(ToString::to_string);
            tracing::warn!(error = %e, source = source.as_deref().unwrap_or("-"), "request failed");
            e.client_status()
        }
        None => {
            tracing::warn!(error = %err, "request failed");
            StatusCode::BAD_GATEWAY
        }
    };
    let mut resp = Response::new(full_body(status.canonical_reason().unwrap_or("Error")));
    *resp.status_mut() = status;
    resp
}
