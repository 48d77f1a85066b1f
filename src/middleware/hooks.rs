use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::Service;

use crate::hooks::HookBus;
use crate::http::{Body, BoxError, HttpService};
use crate::rewrite::TargetUrl;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Request,
    Response,
}

/// Tower layer that hands request or response heads to plugin callbacks.
///
/// The request phase sits outside the rewriter and sees the client-facing
/// request. The response phase sits inside it and sees the target response
/// before any rewriting.
#[derive(Clone)]
pub struct Hooks {
    bus: Arc<HookBus>,
    phase: Phase,
}

impl Hooks {
    /// Fire `OnRequest` before the request goes further in.
    pub fn request(bus: Arc<HookBus>) -> Self {
        Self {
            bus,
            phase: Phase::Request,
        }
    }

    /// Fire `OnResponse` once the inner service produced a response.
    pub fn response(bus: Arc<HookBus>) -> Self {
        Self {
            bus,
            phase: Phase::Response,
        }
    }
}

impl tower::Layer<HttpService> for Hooks {
    type Service = HooksService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        HooksService {
            inner,
            bus: self.bus.clone(),
            phase: self.phase,
        }
    }
}

pub struct HooksService {
    inner: HttpService,
    bus: Arc<HookBus>,
    phase: Phase,
}

impl Service<Request<Body>> for HooksService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        match self.phase {
            Phase::Request => {
                if !self.bus.has_request_hooks() {
                    return self.inner.call(req);
                }
                let (mut parts, body) = req.into_parts();
                self.bus.fire_request(&mut parts);
                self.inner.call(Request::from_parts(parts, body))
            }
            Phase::Response => {
                if !self.bus.has_response_hooks() {
                    return self.inner.call(req);
                }
                let url = req
                    .extensions()
                    .get::<TargetUrl>()
                    .map(|u| u.0.clone())
                    .unwrap_or_else(|| req.uri().to_string());
                let bus = self.bus.clone();
                let fut = self.inner.call(req);
                Box::pin(async move {
                    let (mut parts, body) = fut.await?.into_parts();
                    bus.fire_response(&url, &mut parts);
                    Ok(Response::from_parts(parts, body))
                })
            }
        }
    }
}
