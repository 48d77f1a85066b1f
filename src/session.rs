//! Per-client session tracking and termination.
//!
//! Sessions live in a sharded [`DashMap`] keyed by tracking token, so
//! requests of unrelated sessions never contend on one lock. Sessions idle
//! for longer than the idle TTL are swept, terminated ones included.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use cookie::Cookie;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::HeaderValue;
use rand::Rng;

/// How long a session survives without requests by default.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on the time between two sweeps.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle of a tracked session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No valid token was presented; one was just issued.
    New,
    Active,
    /// A termination trigger matched. Terminal.
    Terminated,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub token: String,
    pub created: Instant,
    pub last_seen: Instant,
    pub state: SessionState,
}

/// Request extension carrying the tracking token of the current request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionToken(pub String);

/// Where the inbound token was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenSource {
    Cookie,
    QueryParam,
}

/// Outcome of resolving a request to its session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub token: String,
    /// State the session was in when the request arrived.
    pub state: SessionState,
}

/// Issues and reads tracking tokens and owns the session table.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: DashMap<String, Session>,
    cookie_name: String,
    param_name: String,
    cookie_domain: String,
    triggers: Vec<String>,
    redirect_url: Option<String>,
    idle_ttl: Duration,
    last_sweep: Mutex<Instant>,
}

impl SessionTracker {
    pub fn new(cookie_name: impl Into<String>, param_name: impl Into<String>, cookie_domain: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            cookie_name: cookie_name.into(),
            param_name: param_name.into(),
            cookie_domain: cookie_domain.into(),
            triggers: Vec::new(),
            redirect_url: None,
            idle_ttl: DEFAULT_IDLE_TTL,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Forget sessions with no request for `ttl`.
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Terminate sessions whose target-side URLs contain any of `triggers`,
    /// redirecting them to `redirect_url` from then on.
    pub fn terminate_on(mut self, triggers: Vec<String>, redirect_url: impl Into<String>) -> Self {
        self.triggers = triggers;
        self.redirect_url = Some(redirect_url.into());
        self
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.sessions.get(token).map(|s| s.clone())
    }

    /// Find a well-formed token on the request, preferring the cookie.
    pub fn extract_token(&self, headers: &http::HeaderMap, uri: &http::Uri) -> Option<(String, TokenSource)> {
        let from_cookie = headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .find(|c| c.name() == self.cookie_name)
            .map(|c| c.value().to_string())
            .filter(|t| is_valid_token(t));
        if let Some(token) = from_cookie {
            return Some((token, TokenSource::Cookie));
        }

        uri.query()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| *k == self.param_name)
                    .map(|(_, v)| v.into_owned())
            })
            .filter(|t| is_valid_token(t))
            .map(|t| (t, TokenSource::QueryParam))
    }

    /// Map a request to its session, creating one when needed.
    ///
    /// A token that is unknown but well-formed (e.g. assigned by the operator
    /// in a link) starts a new session under that token. Creating a session
    /// also sweeps idle ones when the last sweep is old enough.
    pub fn resolve(&self, presented: Option<String>) -> Resolution {
        let now = Instant::now();
        let token = presented.unwrap_or_else(generate_token);
        let resolution = match self.sessions.entry(token.clone()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                session.last_seen = session.last_seen.max(now);
                Resolution {
                    token,
                    state: session.state,
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Session {
                    token: token.clone(),
                    created: now,
                    last_seen: now,
                    state: SessionState::Active,
                });
                tracing::debug!(session = %token, "new session");
                Resolution {
                    token,
                    state: SessionState::New,
                }
            }
        };
        if resolution.state == SessionState::New {
            self.maybe_sweep(now);
        }
        resolution
    }

    fn maybe_sweep(&self, now: Instant) {
        let interval = self.idle_ttl.min(MAX_SWEEP_INTERVAL);
        {
            let Ok(mut last) = self.last_sweep.try_lock() else {
                return;
            };
            if now.saturating_duration_since(*last) < interval {
                return;
            }
            *last = now;
        }
        self.remove_idle(now);
    }

    /// Drop every session whose `last_seen` is more than the idle TTL before
    /// `now`. Returns how many were removed.
    pub fn remove_idle(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.last_seen) < self.idle_ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.sessions.len(), "idle sessions swept");
        }
        removed
    }

    /// Refresh `last_seen`, ignoring timestamps older than the stored one.
    pub fn touch(&self, token: &str, seen: Instant) {
        if let Some(mut session) = self.sessions.get_mut(token) {
            session.last_seen = session.last_seen.max(seen);
        }
    }

    /// Move a session to [`SessionState::Terminated`]. Returns `true` on the
    /// first transition only.
    pub fn terminate(&self, token: &str) -> bool {
        match self.sessions.get_mut(token) {
            Some(mut session) if session.state != SessionState::Terminated => {
                session.state = SessionState::Terminated;
                tracing::info!(session = %token, "session terminated");
                true
            }
            _ => false,
        }
    }

    /// The first termination trigger contained in `url`.
    pub fn matching_trigger(&self, url: &str) -> Option<&str> {
        if self.redirect_url.is_none() {
            return None;
        }
        self.triggers
            .iter()
            .find(|t| url.contains(t.as_str()))
            .map(String::as_str)
    }

    /// `Set-Cookie` value that (re)issues `token` for the proxy domain.
    pub fn cookie_header(&self, token: &str) -> Option<HeaderValue> {
        let cookie = Cookie::build((self.cookie_name.as_str(), token))
            .path("/")
            .domain(self.cookie_domain.as_str())
            .http_only(true)
            .build();
        HeaderValue::from_str(&cookie.to_string()).ok()
    }

    /// Remove the tracking cookie and query parameter so the target never
    /// sees them.
    pub fn strip_tracking(&self, parts: &mut http::request::Parts) {
        let kept: Vec<String> = parts
            .headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next().map(str::trim) != Some(self.cookie_name.as_str()))
            .map(str::to_string)
            .collect();
        parts.headers.remove(http::header::COOKIE);
        if !kept.is_empty()
            && let Ok(value) = HeaderValue::from_str(&kept.join("; "))
        {
            parts.headers.insert(http::header::COOKIE, value);
        }

        if let Some(query) = parts.uri.query() {
            let remaining: Vec<&str> = query
                .split('&')
                .filter(|pair| {
                    let key = pair.split('=').next().unwrap_or_default();
                    key != self.param_name
                })
                .collect();
            if remaining.len() != query.split('&').count() {
                let path = parts.uri.path();
                let path_and_query = if remaining.is_empty() {
                    path.to_string()
                } else {
                    format!("{path}?{}", remaining.join("&"))
                };
                let mut uri = http::uri::Parts::from(parts.uri.clone());
                if let Ok(pq) = path_and_query.parse() {
                    uri.path_and_query = Some(pq);
                    if let Ok(rebuilt) = http::Uri::from_parts(uri) {
                        parts.uri = rebuilt;
                    }
                }
            }
        }
    }
}

pub fn is_valid_token(token: &str) -> bool {
    (1..=64).contains(&token.len())
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
