use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::uri::Scheme;
use serde::Deserialize;

use crate::domain::{DEFAULT_MAX_LEARNED, DomainName};
use crate::error::{Error, Result};
use crate::rules::{JsInjectionRule, RuleSet, Substitution};
use crate::session::{DEFAULT_IDLE_TTL, is_valid_token};
use crate::upstream_proxy::UpstreamProxy;

const DEFAULT_TRACKING_NAME: &str = "id";
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw proxy configuration, as read from a TOML or JSON file and command-line
/// flags. Turned into immutable [`Settings`] by [`ProxyConfig::validate`].
///
/// Field names follow the camelCase option names (`proxyDomain`,
/// `targetResources`, `forceHTTPS`, ...).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Domain the mirrored site is served under, e.g. `proxy.tld`.
    pub proxy_domain: Option<String>,

    /// Target domain, e.g. `target.tld`, or a URL to pick the scheme and
    /// port (`http://target.tld:8080`).
    pub target: Option<String>,

    /// Comma-separated extra domains to translate, e.g. `static.target.tld`.
    #[serde(alias = "targetRes")]
    pub target_resources: Option<String>,

    /// Comma-separated `base64(pattern):base64(replacement)` pairs.
    pub rules: Option<String>,

    /// Comma-separated `urlpattern:base64(payload)` pairs.
    pub js_rules: Option<String>,

    /// Comma-separated target-side URL substrings that end a session.
    pub terminate_triggers: Option<String>,

    #[serde(alias = "terminateUrl")]
    pub terminate_redirect_url: Option<String>,

    pub tracking_cookie: Option<String>,
    pub tracking_param: Option<String>,

    #[serde(rename = "forceHTTPS", default)]
    pub force_https: bool,

    #[serde(rename = "forceHTTP", default)]
    pub force_http: bool,

    #[serde(default)]
    pub dynamic_mode: bool,

    /// Disable the anti-SSRF guard and upstream certificate verification.
    #[serde(default)]
    pub disable_security: bool,

    /// File fetched requests and captured credentials are appended to.
    pub log: Option<String>,

    #[serde(alias = "logPostOnly", default)]
    pub post_only: bool,

    /// Comma-separated enabled plugin names, or `all`.
    pub plugins: Option<String>,

    /// Certificate chain, PEM or base64-encoded PEM.
    pub cert: Option<String>,
    pub cert_key: Option<String>,
    /// Extra CA certificates appended to the served chain.
    pub cert_pool: Option<String>,

    /// Optional CA used by the `autocert` plugin, as PEM file paths.
    pub autocert_ca_cert: Option<String>,
    pub autocert_ca_key: Option<String>,

    pub listening_address: Option<String>,

    #[serde(rename = "listeningPortHTTP")]
    pub listening_port_http: Option<u16>,

    #[serde(rename = "listeningPortHTTPS")]
    pub listening_port_https: Option<u16>,

    /// Upstream request timeout, e.g. `"30s"`.
    pub upstream_timeout: Option<DurationValue>,

    /// Translate domains inside `Set-Cookie` values, not just attributes.
    #[serde(default)]
    pub rewrite_cookie_values: bool,

    /// Max idle upstream connections per host (0 disables pooling). Default: 8.
    pub pool_max_idle_per_host: Option<usize>,

    /// Proxy the target is reached through, e.g. `http://127.0.0.1:8080` or
    /// `socks5h://127.0.0.1:9050`.
    pub proxy_address: Option<String>,

    /// Sessions without requests for this long are forgotten. Default: 24h.
    pub session_idle_timeout: Option<DurationValue>,

    /// Dynamic mode stops learning names after this many. Default: 1024.
    pub max_learned_domains: Option<usize>,
}

/// A single duration, deserialized from a string like `"10s"` or `"200ms"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_millis(n))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: f64 = secs.parse().map_err(|e| format!("invalid duration: {e}"))?;
        if !n.is_finite() || n < 0.0 {
            return Err(format!("invalid duration: {s}"));
        }
        Ok(Duration::from_secs_f64(n))
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: u64 = mins.parse().map_err(|e| format!("invalid duration: {e}"))?;
        n.checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {s}"))
    } else if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.parse().map_err(|e| format!("invalid duration: {e}"))?;
        n.checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {s}"))
    } else {
        Err(format!("expected duration like '200ms', '1s', '5m' or '24h', got '{s}'"))
    }
}

/// Which listeners run and how URL schemes are rewritten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// HTTP and HTTPS listeners both serve the mirror.
    #[default]
    Dual,
    /// The HTTP listener only redirects to HTTPS.
    HttpsOnly,
    /// No TLS towards clients. Secure cookie attributes are stripped.
    HttpOnly,
}

impl TlsMode {
    /// Scheme forced onto translated URLs, if any.
    pub fn client_scheme(self) -> Option<&'static str> {
        match self {
            TlsMode::Dual => None,
            TlsMode::HttpsOnly => Some("https"),
            TlsMode::HttpOnly => Some("http"),
        }
    }

    pub fn needs_certificate(self) -> bool {
        self != TlsMode::HttpOnly
    }
}

/// PEM material for the client-facing HTTPS listener.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub pool_pem: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("pool", &self.pool_pem.is_some())
            .finish_non_exhaustive()
    }
}

/// Validated, immutable configuration shared by every component.
#[derive(Clone, Debug)]
pub struct Settings {
    pub proxy_domain: DomainName,
    pub target: DomainName,
    pub target_scheme: Scheme,
    /// Explicit port of the target host, when given in `target`.
    pub target_port: Option<u16>,
    pub target_resources: Vec<DomainName>,
    pub rules: RuleSet,
    pub terminate_triggers: Vec<String>,
    pub terminate_redirect_url: Option<String>,
    pub tracking_cookie: String,
    pub tracking_param: String,
    pub tls_mode: TlsMode,
    pub dynamic_mode: bool,
    pub disable_security: bool,
    pub log_file: Option<PathBuf>,
    pub post_only: bool,
    pub plugins: String,
    pub tls: Option<TlsMaterial>,
    pub listening_address: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub upstream_timeout: Duration,
    pub rewrite_cookie_values: bool,
    pub pool_max_idle_per_host: usize,
    pub upstream_proxy: Option<UpstreamProxy>,
    pub session_idle_timeout: Duration,
    pub max_learned_domains: usize,
}

impl ProxyConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parse config from a JSON string.
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load config from a file; `.json` files are JSON, anything else TOML.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        };
        parsed.with_context(|| format!("parsing configuration {}", path.display()))
    }

    /// Overlay values set in `overrides` (e.g. command-line flags) onto this
    /// configuration.
    pub fn merge(&mut self, overrides: ProxyConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if overrides.$field.is_some() { self.$field = overrides.$field; })*
            };
        }
        take!(
            proxy_domain,
            target,
            target_resources,
            rules,
            js_rules,
            terminate_triggers,
            terminate_redirect_url,
            tracking_cookie,
            tracking_param,
            log,
            plugins,
            cert,
            cert_key,
            cert_pool,
            autocert_ca_cert,
            autocert_ca_key,
            listening_address,
            listening_port_http,
            listening_port_https,
            upstream_timeout,
            pool_max_idle_per_host,
            proxy_address,
            session_idle_timeout,
            max_learned_domains,
        );
        self.force_https |= overrides.force_https;
        self.force_http |= overrides.force_http;
        self.dynamic_mode |= overrides.dynamic_mode;
        self.disable_security |= overrides.disable_security;
        self.post_only |= overrides.post_only;
        self.rewrite_cookie_values |= overrides.rewrite_cookie_values;
    }

    pub fn tls_mode(&self) -> TlsMode {
        match (self.force_http, self.force_https) {
            (true, _) => TlsMode::HttpOnly,
            (false, true) => TlsMode::HttpsOnly,
            (false, false) => TlsMode::Dual,
        }
    }

    /// Validate into immutable [`Settings`].
    pub fn validate(&self) -> Result<Settings> {
        if self.force_http && self.force_https {
            return Err(Error::config("forceHTTP and forceHTTPS are mutually exclusive"));
        }
        let tls_mode = self.tls_mode();

        let proxy_domain = required(&self.proxy_domain, "proxyDomain")?;
        let proxy_domain = DomainName::parse(proxy_domain)?;
        let (target, target_scheme, target_port) = parse_target(required(&self.target, "target")?)?;
        if target == proxy_domain {
            return Err(Error::config("proxyDomain and target must differ"));
        }

        let target_resources = split_list(self.target_resources.as_deref())
            .map(DomainName::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut rules = RuleSet::new();
        for rule in parse_substitutions(self.rules.as_deref())? {
            rules = rules.substitution(rule);
        }
        for rule in parse_js_rules(self.js_rules.as_deref())? {
            rules = rules.injection(rule);
        }

        let terminate_triggers: Vec<String> = split_list(self.terminate_triggers.as_deref())
            .map(str::to_string)
            .collect();
        let terminate_redirect_url = self
            .terminate_redirect_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        if let Some(url) = &terminate_redirect_url {
            url::Url::parse(url)
                .map_err(|e| Error::config(format!("invalid terminateRedirectUrl `{url}`: {e}")))?;
        }
        if !terminate_triggers.is_empty() && terminate_redirect_url.is_none() {
            return Err(Error::config("terminateTriggers require terminateRedirectUrl"));
        }

        let tracking_cookie = tracking_name(&self.tracking_cookie, "trackingCookie")?;
        let tracking_param = tracking_name(&self.tracking_param, "trackingParam")?;

        let tls = match (&self.cert, &self.cert_key) {
            (Some(cert), Some(key)) if !cert.trim().is_empty() && !key.trim().is_empty() => Some(TlsMaterial {
                cert_pem: decode_pem(cert, self.force_http),
                key_pem: decode_pem(key, self.force_http),
                pool_pem: self
                    .cert_pool
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .map(|p| decode_pem(p, self.force_http)),
            }),
            _ => None,
        };
        if tls_mode.needs_certificate() && tls.is_none() {
            return Err(Error::config(
                "HTTPS needs cert and certKey (or the autocert plugin, or forceHTTP)",
            ));
        }

        let listening_address = match self.listening_address.as_deref() {
            Some(addr) => addr
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("invalid listeningAddress `{addr}`")))?,
            None => IpAddr::from([127, 0, 0, 1]),
        };

        let upstream_proxy = self
            .proxy_address
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(UpstreamProxy::parse)
            .transpose()?;

        Ok(Settings {
            proxy_domain,
            target,
            target_scheme,
            target_port,
            target_resources,
            rules,
            terminate_triggers,
            terminate_redirect_url,
            tracking_cookie,
            tracking_param,
            tls_mode,
            dynamic_mode: self.dynamic_mode,
            disable_security: self.disable_security,
            log_file: self.log.as_deref().filter(|p| !p.is_empty()).map(PathBuf::from),
            post_only: self.post_only,
            plugins: self.plugins.clone().unwrap_or_else(|| "all".to_string()),
            tls: if tls_mode.needs_certificate() { tls } else { None },
            listening_address,
            http_port: self.listening_port_http.unwrap_or(80),
            https_port: self.listening_port_https.unwrap_or(443),
            upstream_timeout: self
                .upstream_timeout
                .map(|d| d.0)
                .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT),
            rewrite_cookie_values: self.rewrite_cookie_values,
            pool_max_idle_per_host: self.pool_max_idle_per_host.unwrap_or(8),
            upstream_proxy,
            session_idle_timeout: self
                .session_idle_timeout
                .map(|d| d.0)
                .unwrap_or(DEFAULT_IDLE_TTL),
            max_learned_domains: self.max_learned_domains.unwrap_or(DEFAULT_MAX_LEARNED),
        })
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config(format!("missing required option `{name}`")))
}

fn parse_target(raw: &str) -> Result<(DomainName, Scheme, Option<u16>)> {
    if !raw.contains("://") {
        return Ok((DomainName::parse(raw)?, Scheme::HTTPS, None));
    }
    let url = url::Url::parse(raw).map_err(|e| Error::config(format!("invalid target `{raw}`: {e}")))?;
    let scheme = match url.scheme() {
        "https" => Scheme::HTTPS,
        "http" => Scheme::HTTP,
        other => return Err(Error::config(format!("unsupported target scheme `{other}`"))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("target `{raw}` has no host")))?;
    Ok((DomainName::parse(host)?, scheme, url.port()))
}

fn split_list(value: Option<&str>) -> impl Iterator<Item = &str> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| Error::config(format!("invalid base64 in {what} `{value}`: {e}")))
}

/// Decode `base64(pattern):base64(replacement),...`.
pub fn parse_substitutions(descriptor: Option<&str>) -> Result<Vec<Substitution>> {
    split_list(descriptor)
        .map(|entry| {
            let (pattern, replacement) = entry
                .split_once(':')
                .ok_or_else(|| Error::config(format!("rule `{entry}` is not pattern:replacement")))?;
            Substitution::new(decode_b64(pattern, "rules")?, decode_b64(replacement, "rules")?)
        })
        .collect()
}

/// Decode `urlpattern:base64(payload),...`. The URL pattern may itself
/// contain `:`, so entries split at the last one.
pub fn parse_js_rules(descriptor: Option<&str>) -> Result<Vec<JsInjectionRule>> {
    split_list(descriptor)
        .map(|entry| {
            let (pattern, payload) = entry
                .rsplit_once(':')
                .ok_or_else(|| Error::config(format!("jsRule `{entry}` is not urlpattern:payload")))?;
            if pattern.is_empty() {
                return Err(Error::config(format!("jsRule `{entry}` has an empty URL pattern")));
            }
            Ok(JsInjectionRule {
                url_pattern: pattern.to_string(),
                payload: decode_b64(payload, "jsRules")?,
            })
        })
        .collect()
}

fn tracking_name(value: &Option<String>, option: &str) -> Result<String> {
    let name = value.as_deref().unwrap_or(DEFAULT_TRACKING_NAME).trim();
    if !is_valid_token(name) {
        return Err(Error::config(format!("invalid {option} `{name}`")));
    }
    Ok(name.to_string())
}

/// Certificates may be given as PEM or as base64-encoded PEM.
fn decode_pem(value: &str, force_http: bool) -> String {
    if force_http || value.contains("-----BEGIN") {
        return value.to_string();
    }
    STANDARD
        .decode(value.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    fn http_only(proxy: &str, target: &str) -> ProxyConfig {
        ProxyConfig {
            proxy_domain: Some(proxy.into()),
            target: Some(target.into()),
            force_http: true,
            ..Default::default()
        }
    }

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("2.5s").unwrap(), Duration::from_secs_f64(2.5));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("200").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn deserialize_toml_with_original_names() {
        let toml = r#"
            proxyDomain = "proxy.tld"
            target = "target.tld"
            targetResources = "static.target.tld, cdn.other.com"
            terminateTriggers = "/logout"
            terminateRedirectUrl = "https://example.org/"
            trackingCookie = "sid"
            forceHTTP = true
            dynamicMode = true
            listeningPortHTTP = 8080
            upstreamTimeout = "5s"
        "#;
        let config = ProxyConfig::from_toml(toml).unwrap();
        assert_eq!(config.listening_port_http, Some(8080));
        assert_eq!(config.upstream_timeout, Some(DurationValue(Duration::from_secs(5))));

        let settings = config.validate().unwrap();
        assert_eq!(settings.tls_mode, TlsMode::HttpOnly);
        assert_eq!(settings.target_resources.len(), 2);
        assert_eq!(settings.tracking_cookie, "sid");
        assert_eq!(settings.tracking_param, "id");
        assert_eq!(settings.upstream_timeout, Duration::from_secs(5));
        assert!(settings.dynamic_mode);
        assert!(settings.tls.is_none());
    }

    #[test]
    fn deserialize_json_with_aliases() {
        let json = r#"{
            "proxyDomain": "proxy.tld",
            "target": "target.tld",
            "targetRes": "static.target.tld",
            "terminateUrl": "https://example.org/",
            "logPostOnly": true,
            "forceHTTP": true
        }"#;
        let config = ProxyConfig::from_json(json).unwrap();
        assert_eq!(config.target_resources.as_deref(), Some("static.target.tld"));
        assert!(config.post_only);
        assert_eq!(config.terminate_redirect_url.as_deref(), Some("https://example.org/"));
    }

    #[test]
    fn defaults() {
        let settings = http_only("proxy.tld", "target.tld").validate().unwrap();
        assert_eq!(settings.listening_address, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(settings.http_port, 80);
        assert_eq!(settings.https_port, 443);
        assert_eq!(settings.plugins, "all");
        assert_eq!(settings.upstream_timeout, Duration::from_secs(30));
        assert_eq!(settings.target_scheme, Scheme::HTTPS);
        assert_eq!(settings.pool_max_idle_per_host, 8);
        assert!(settings.upstream_proxy.is_none());
        assert_eq!(settings.session_idle_timeout, Duration::from_secs(24 * 60 * 60));
        assert_eq!(settings.max_learned_domains, 1024);
    }

    #[test]
    fn upstream_proxy_and_limits() {
        let toml = r#"
            proxyDomain = "proxy.tld"
            target = "target.tld"
            forceHTTP = true
            proxyAddress = "socks5h://127.0.0.1:9050"
            sessionIdleTimeout = "3600s"
            maxLearnedDomains = 50
        "#;
        let settings = ProxyConfig::from_toml(toml).unwrap().validate().unwrap();
        assert_eq!(
            settings.upstream_proxy.map(|p| p.to_string()).as_deref(),
            Some("socks5h://127.0.0.1:9050")
        );
        assert_eq!(settings.session_idle_timeout, Duration::from_secs(3600));
        assert_eq!(settings.max_learned_domains, 50);

        let bad = ProxyConfig {
            proxy_address: Some("https://127.0.0.1:443".into()),
            ..http_only("proxy.tld", "target.tld")
        };
        assert!(matches!(bad.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn target_url_selects_scheme_and_port() {
        let settings = http_only("proxy.tld", "http://Target.tld:8080/")
            .validate()
            .unwrap();
        assert_eq!(settings.target.as_str(), "target.tld");
        assert_eq!(settings.target_scheme, Scheme::HTTP);
        assert_eq!(settings.target_port, Some(8080));
        assert!(http_only("proxy.tld", "ftp://target.tld").validate().is_err());
    }

    #[test]
    fn validation_failures() {
        let cases = [
            ProxyConfig::default(),
            http_only("proxy.tld", ""),
            http_only("same.tld", "same.tld"),
            http_only("bad domain", "target.tld"),
            ProxyConfig {
                force_https: true,
                ..http_only("proxy.tld", "target.tld")
            },
            ProxyConfig {
                terminate_triggers: Some("/logout".into()),
                ..http_only("proxy.tld", "target.tld")
            },
            ProxyConfig {
                tracking_cookie: Some("bad name;".into()),
                ..http_only("proxy.tld", "target.tld")
            },
            ProxyConfig {
                rules: Some(format!("{}:{}", b64(""), b64("x"))),
                ..http_only("proxy.tld", "target.tld")
            },
            ProxyConfig {
                rules: Some("not-base64!:also".into()),
                ..http_only("proxy.tld", "target.tld")
            },
            ProxyConfig {
                force_http: false,
                ..http_only("proxy.tld", "target.tld")
            },
        ];
        for (i, config) in cases.iter().enumerate() {
            assert!(
                matches!(config.validate(), Err(Error::Configuration(_))),
                "case {i} should fail"
            );
        }
    }

    #[test]
    fn descriptors_decode() {
        let rules = parse_substitutions(Some(&format!("{}:{}, {}:{}", b64("new.tld"), b64("old.tld"), b64("a"), b64(""))))
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].pattern(), b"new.tld");
        assert_eq!(rules[0].replacement(), b"old.tld");
        assert_eq!(rules[1].replacement(), b"");

        let js = parse_js_rules(Some(&format!("https://target.tld/login:{}", b64("alert(1)")))).unwrap();
        assert_eq!(js[0].url_pattern, "https://target.tld/login");
        assert_eq!(js[0].payload, b"alert(1)");
    }

    #[test]
    fn certificates_accept_base64_pem() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let config = ProxyConfig {
            cert: Some(b64(pem)),
            cert_key: Some(pem.into()),
            ..http_only("proxy.tld", "target.tld")
        };
        let config = ProxyConfig {
            force_http: false,
            ..config
        };
        let tls = config.validate().unwrap().tls.unwrap();
        assert_eq!(tls.cert_pem, pem);
        assert_eq!(tls.key_pem, pem);
    }

    #[test]
    fn merge_prefers_overrides() {
        let mut base = ProxyConfig::from_toml("proxyDomain = \"a.tld\"\ntarget = \"t.tld\"").unwrap();
        base.merge(ProxyConfig {
            proxy_domain: Some("b.tld".into()),
            force_http: true,
            ..Default::default()
        });
        assert_eq!(base.proxy_domain.as_deref(), Some("b.tld"));
        assert_eq!(base.target.as_deref(), Some("t.tld"));
        assert!(base.force_http);
    }
}
