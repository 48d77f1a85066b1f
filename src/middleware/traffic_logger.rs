use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{Method, Request, Response};
use tower::Service;

use crate::http::{Body, BoxError, HttpService};
use crate::rewrite::TargetUrl;
use crate::session::SessionToken;
use crate::sink::{LogSink, Record, RequestRecord};

/// Tower layer that appends every fetched request to a [`LogSink`].
///
/// Each record carries the session token, method, target-side URL and
/// response status. With `post_only(true)` only POST requests are recorded.
#[derive(Clone)]
pub struct TrafficLogger {
    sink: LogSink,
    post_only: bool,
}

impl TrafficLogger {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink,
            post_only: false,
        }
    }

    /// Record only POST requests.
    pub fn post_only(mut self, enable: bool) -> Self {
        self.post_only = enable;
        self
    }
}

impl tower::Layer<HttpService> for TrafficLogger {
    type Service = TrafficLoggerService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        TrafficLoggerService {
            inner,
            sink: self.sink.clone(),
            post_only: self.post_only,
        }
    }
}

pub struct TrafficLoggerService {
    inner: HttpService,
    sink: LogSink,
    post_only: bool,
}

impl Service<Request<Body>> for TrafficLoggerService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if self.post_only && req.method() != Method::POST {
            return self.inner.call(req);
        }

        let sink = self.sink.clone();
        let method = req.method().to_string();
        let client_url = req.uri().to_string();
        let session = req.extensions().get::<SessionToken>().map(|t| t.0.clone());
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let resp = fut.await?;
            let url = resp
                .extensions()
                .get::<TargetUrl>()
                .map(|u| u.0.clone())
                .unwrap_or(client_url);
            tracing::debug!(
                %method,
                %url,
                status = resp.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "request fetched"
            );
            sink.write(&Record::Request(RequestRecord {
                session,
                method,
                url,
                status: resp.status().as_u16(),
            }));
            Ok(resp)
        })
    }
}
