//! Plugin registration and hook dispatch.
//!
//! Plugins are assembled by the process entry point and handed to
//! [`HookBus::builder`]. The finished bus is immutable, so it is shared as an
//! `Arc<HookBus>` and invoked concurrently without locking.

use std::fmt;
use std::net::IpAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::config::ProxyConfig;
use crate::error::Error;
use crate::http::BoxError;
use crate::sink::CapturedCredentials;

/// Result returned by hook callbacks.
pub type HookResult = Result<(), BoxError>;

/// The extension points a plugin can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Configuration parsed, listeners not yet bound.
    FlagsParsed,
    /// Request received, before any rewriting.
    Request,
    /// Target response received, before any rewriting.
    Response,
    /// Login-style POST data observed.
    CredentialsCaptured,
    /// The anti-SSRF guard rejected an outbound request.
    SecurityViolation,
}

impl HookPoint {
    pub fn name(self) -> &'static str {
        match self {
            HookPoint::FlagsParsed => "OnFlagsParsed",
            HookPoint::Request => "OnRequest",
            HookPoint::Response => "OnResponse",
            HookPoint::CredentialsCaptured => "OnCredentialsCaptured",
            HookPoint::SecurityViolation => "OnSecurityViolation",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type FlagsParsedFn = Box<dyn Fn(&mut ProxyConfig) -> HookResult + Send + Sync>;
type RequestFn = Box<dyn Fn(&mut http::request::Parts) -> HookResult + Send + Sync>;
type ResponseFn = Box<dyn Fn(&str, &mut http::response::Parts) -> HookResult + Send + Sync>;
type CredentialsFn = Box<dyn Fn(&CapturedCredentials) -> HookResult + Send + Sync>;
type ViolationFn = Box<dyn Fn(&str, IpAddr) -> HookResult + Send + Sync>;

/// A named set of hook callbacks.
///
/// # Examples
///
/// ```rust
/// use mimic::hooks::Plugin;
///
/// let plugin = Plugin::new("banner", "0.1.0", "Adds a response header")
///     .on_response(|_url, parts| {
///         parts.headers.insert("x-mirrored", "1".parse()?);
///         Ok(())
///     });
/// assert_eq!(plugin.name(), "banner");
/// ```
pub struct Plugin {
    name: String,
    version: String,
    description: String,
    flags_parsed: Vec<FlagsParsedFn>,
    request: Vec<RequestFn>,
    response: Vec<ResponseFn>,
    credentials: Vec<CredentialsFn>,
    violation: Vec<ViolationFn>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new(name: impl Into<String>, version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            flags_parsed: Vec::new(),
            request: Vec::new(),
            response: Vec::new(),
            credentials: Vec::new(),
            violation: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Runs once before listeners bind. May mutate the raw configuration.
    pub fn on_flags_parsed<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ProxyConfig) -> HookResult + Send + Sync + 'static,
    {
        self.flags_parsed.push(Box::new(f));
        self
    }

    /// Runs for every request with its client-facing head.
    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut http::request::Parts) -> HookResult + Send + Sync + 'static,
    {
        self.request.push(Box::new(f));
        self
    }

    /// Runs for every target response with the target-side URL.
    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &mut http::response::Parts) -> HookResult + Send + Sync + 'static,
    {
        self.response.push(Box::new(f));
        self
    }

    pub fn on_credentials_captured<F>(mut self, f: F) -> Self
    where
        F: Fn(&CapturedCredentials) -> HookResult + Send + Sync + 'static,
    {
        self.credentials.push(Box::new(f));
        self
    }

    pub fn on_security_violation<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, IpAddr) -> HookResult + Send + Sync + 'static,
    {
        self.violation.push(Box::new(f));
        self
    }
}

/// Collects plugins before the bus is frozen.
#[derive(Default)]
pub struct HookBusBuilder {
    plugins: Vec<Plugin>,
}

impl HookBusBuilder {
    pub fn register(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Keep only the plugins named in `enabled`, a comma-separated list or
    /// `all`. Registration order is preserved.
    pub fn build(self, enabled: &str) -> HookBus {
        let wanted: Vec<&str> = enabled
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let all = wanted.iter().any(|w| w.eq_ignore_ascii_case("all"));

        for name in &wanted {
            if !name.eq_ignore_ascii_case("all") && !self.plugins.iter().any(|p| p.name == *name) {
                tracing::warn!(plugin = %name, "enabled plugin is not registered");
            }
        }

        let plugins: Vec<Plugin> = self
            .plugins
            .into_iter()
            .filter(|p| all || wanted.contains(&p.name.as_str()))
            .collect();
        for plugin in &plugins {
            tracing::info!(
                plugin = %plugin.name,
                version = %plugin.version,
                "{}",
                plugin.description
            );
        }
        HookBus { plugins }
    }
}

/// Immutable registry of enabled plugins.
#[derive(Debug, Default)]
pub struct HookBus {
    plugins: Vec<Plugin>,
}

impl HookBus {
    pub fn builder() -> HookBusBuilder {
        HookBusBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn has_response_hooks(&self) -> bool {
        self.plugins.iter().any(|p| !p.response.is_empty())
    }

    pub(crate) fn has_request_hooks(&self) -> bool {
        self.plugins.iter().any(|p| !p.request.is_empty())
    }

    pub fn fire_flags_parsed(&self, config: &mut ProxyConfig) {
        for plugin in &self.plugins {
            for callback in &plugin.flags_parsed {
                invoke(plugin, HookPoint::FlagsParsed, || callback(config));
            }
        }
    }

    pub fn fire_request(&self, parts: &mut http::request::Parts) {
        for plugin in &self.plugins {
            for callback in &plugin.request {
                invoke(plugin, HookPoint::Request, || callback(parts));
            }
        }
    }

    pub fn fire_response(&self, url: &str, parts: &mut http::response::Parts) {
        for plugin in &self.plugins {
            for callback in &plugin.response {
                invoke(plugin, HookPoint::Response, || callback(url, parts));
            }
        }
    }

    pub fn fire_credentials_captured(&self, captured: &CapturedCredentials) {
        for plugin in &self.plugins {
            for callback in &plugin.credentials {
                invoke(plugin, HookPoint::CredentialsCaptured, || callback(captured));
            }
        }
    }

    pub fn fire_security_violation(&self, host: &str, addr: IpAddr) {
        for plugin in &self.plugins {
            for callback in &plugin.violation {
                invoke(plugin, HookPoint::SecurityViolation, || callback(host, addr));
            }
        }
    }
}

/// Run one callback, containing both errors and panics.
fn invoke(plugin: &Plugin, point: HookPoint, f: impl FnOnce() -> HookResult) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let err = Error::PluginCallback {
                plugin: plugin.name.clone(),
                hook: point.name(),
                message: e.to_string(),
            };
            tracing::warn!(plugin = %plugin.name, hook = %point, "{err}");
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let err = Error::PluginCallback {
                plugin: plugin.name.clone(),
                hook: point.name(),
                message: format!("panicked: {message}"),
            };
            tracing::error!(plugin = %plugin.name, hook = %point, "{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn request_parts() -> http::request::Parts {
        http::Request::builder()
            .uri("https://proxy.tld/")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let bus = HookBus::builder()
            .register(Plugin::new("first", "1", "").on_request(|parts| {
                parts.headers.insert("x-order", "first".parse()?);
                Ok(())
            }))
            .register(Plugin::new("second", "1", "").on_request(|parts| {
                let prev = parts.headers["x-order"].to_str()?.to_string();
                parts.headers.insert("x-order", format!("{prev},second").parse()?);
                Ok(())
            }))
            .build("all");

        let mut parts = request_parts();
        bus.fire_request(&mut parts);
        assert_eq!(parts.headers["x-order"], "first,second");
    }

    #[test]
    fn failing_and_panicking_callbacks_are_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let bus = HookBus::builder()
            .register(Plugin::new("errs", "1", "").on_request(|_| Err("boom".into())))
            .register(Plugin::new("panics", "1", "").on_request(|_| panic!("kaboom")))
            .register(Plugin::new("counts", "1", "").on_request(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .build("all");

        let mut parts = request_parts();
        bus.fire_request(&mut parts);
        bus.fire_request(&mut parts);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn enabled_list_filters_plugins() {
        let bus = HookBus::builder()
            .register(Plugin::new("a", "1", ""))
            .register(Plugin::new("b", "1", ""))
            .register(Plugin::new("c", "1", ""))
            .build("c, a,missing");
        assert_eq!(bus.plugins().collect::<Vec<_>>(), vec!["a", "c"]);

        let bus = HookBus::builder().register(Plugin::new("a", "1", "")).build("");
        assert!(bus.is_empty());
    }

    #[test]
    fn flags_parsed_can_mutate_config() {
        let bus = HookBus::builder()
            .register(Plugin::new("cfg", "1", "").on_flags_parsed(|config| {
                config.cert = Some("generated".into());
                Ok(())
            }))
            .build("all");
        let mut config = ProxyConfig::default();
        bus.fire_flags_parsed(&mut config);
        assert_eq!(config.cert.as_deref(), Some("generated"));
    }

    #[test]
    fn hook_names() {
        assert_eq!(HookPoint::FlagsParsed.to_string(), "OnFlagsParsed");
        assert_eq!(HookPoint::CredentialsCaptured.name(), "OnCredentialsCaptured");
    }
}
