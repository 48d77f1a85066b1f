mod content_decoder;
mod content_rewriter;
mod hooks;
mod session_tracker;
mod ssrf_guard;
mod traffic_logger;

pub use content_decoder::ContentDecoder;
pub use content_rewriter::ContentRewriter;
pub use hooks::Hooks;
pub use session_tracker::SessionTracker;
pub use ssrf_guard::{SsrfGuard, is_public};
pub use traffic_logger::TrafficLogger;

use http::{Request, Response};
use tower::Service;

use crate::http::{Body, BoxError, HttpService};

/// Drive an inner service that an async call future shares with its layer.
pub(crate) async fn call_inner(
    inner: &tokio::sync::Mutex<HttpService>,
    req: Request<Body>,
) -> Result<Response<Body>, BoxError> {
    let fut = {
        let mut svc = inner.lock().await;
        std::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
        svc.call(req)
    };
    fut.await
}
