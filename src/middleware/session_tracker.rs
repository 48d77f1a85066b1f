use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::{LOCATION, SET_COOKIE};
use http::{HeaderValue, Request, Response, StatusCode};
use tower::Service;

use crate::http::{Body, BoxError, HttpService, empty_body};
use crate::rewrite::{TargetLocation, TargetUrl};
use crate::session::{SessionState, SessionToken, SessionTracker as Tracker, TokenSource};

/// Tower layer that ties every request to a session.
///
/// Terminated sessions are redirected without reaching the target. The
/// tracking cookie and parameter are stripped before forwarding, and the
/// cookie is (re)issued on the response. A response whose target-side URL or
/// `Location` matches a termination trigger ends the session and is replaced
/// by a redirect.
#[derive(Clone)]
pub struct SessionTracker {
    tracker: Arc<Tracker>,
}

impl SessionTracker {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }
}

impl tower::Layer<HttpService> for SessionTracker {
    type Service = SessionTrackerService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        SessionTrackerService {
            inner,
            tracker: self.tracker.clone(),
        }
    }
}

pub struct SessionTrackerService {
    inner: HttpService,
    tracker: Arc<Tracker>,
}

fn redirect(location: &str) -> Response<Body> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        resp.headers_mut().insert(LOCATION, value);
    }
    resp
}

impl Service<Request<Body>> for SessionTrackerService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let tracker = self.tracker.clone();
        let (mut parts, body) = req.into_parts();

        let presented = tracker.extract_token(&parts.headers, &parts.uri);
        let had_cookie = matches!(presented, Some((_, TokenSource::Cookie)));
        let resolution = tracker.resolve(presented.map(|(token, _)| token));
        let token = resolution.token;

        if resolution.state == SessionState::Terminated {
            tracing::debug!(session = %token, path = %parts.uri.path(), "terminated session redirected");
            let location = tracker.redirect_url().unwrap_or("/").to_string();
            return Box::pin(async move { Ok(redirect(&location)) });
        }

        tracker.strip_tracking(&mut parts);
        parts.extensions.insert(SessionToken(token.clone()));
        let fut = self.inner.call(Request::from_parts(parts, body));

        Box::pin(async move {
            let mut resp = fut.await?;

            let target_url = resp.extensions().get::<TargetUrl>().map(|u| u.0.as_str());
            let target_location = resp.extensions().get::<TargetLocation>().map(|l| l.0.as_str());
            let trigger = target_url
                .and_then(|url| tracker.matching_trigger(url))
                .or_else(|| target_location.and_then(|loc| tracker.matching_trigger(loc)))
                .map(str::to_string);

            if let Some(trigger) = trigger
                && let Some(location) = tracker.redirect_url()
            {
                tracker.terminate(&token);
                tracing::info!(session = %token, %trigger, "termination trigger matched");
                let mut replaced = redirect(location);
                for cookie in resp.headers().get_all(SET_COOKIE) {
                    replaced.headers_mut().append(SET_COOKIE, cookie.clone());
                }
                resp = replaced;
            }

            if !had_cookie
                && let Some(cookie) = tracker.cookie_header(&token)
            {
                resp.headers_mut().append(SET_COOKIE, cookie);
            }
            Ok(resp)
        })
    }
}
