//! Bidirectional translation between the target and proxy namespaces.
//!
//! A hostname is only ever replaced as a whole: an occurrence must start and
//! end on a hostname boundary, so `t.tld` never matches inside `evil-t.tld`
//! or `cdn.t.tld`. Names under the target domain keep their prefix
//! (`static.t.tld` ↔ `static.proxy.tld`); names outside it are carried as a
//! prefix of the proxy domain (`cdn.other.com` ↔ `cdn.other.com.proxy.tld`).

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{Error, Result};

/// Learned names kept by default before dynamic learning stops.
pub const DEFAULT_MAX_LEARNED: usize = 1024;

/// A validated, lowercase DNS name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainName(String);

impl DomainName {
    pub fn parse(input: &str) -> Result<Self> {
        let name = input.trim().trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() || name.len() > 253 {
            return Err(Error::config(format!("invalid domain name `{input}`")));
        }
        for label in name.split('.') {
            let valid = !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(is_label_byte);
            if !valid {
                return Err(Error::config(format!("invalid domain name `{input}`")));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if `self` equals `parent` or is one of its subdomains.
    pub fn is_within(&self, parent: &DomainName) -> bool {
        is_within(&self.0, &parent.0)
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_within(name: &str, parent: &str) -> bool {
    name == parent
        || (name.len() > parent.len()
            && name.ends_with(parent)
            && name.as_bytes()[name.len() - parent.len() - 1] == b'.')
}

fn is_label_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

fn is_host_byte(b: u8) -> bool {
    is_label_byte(b) || b == b'.'
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// A hostname may start at `i` when the preceding byte cannot be part of a
/// hostname. Percent escapes (`%2F`) and JSON escapes (`/`) of
/// delimiters count as delimiters.
fn boundary_before(input: &[u8], i: usize) -> bool {
    if i == 0 || !is_host_byte(input[i - 1]) {
        return true;
    }
    if i >= 3 && input[i - 3] == b'%' {
        if let (Some(hi), Some(lo)) = (hex_value(input[i - 2]), hex_value(input[i - 1])) {
            return !is_host_byte(hi << 4 | lo);
        }
    }
    if i >= 6 && &input[i - 6..i - 4] == b"\\u" {
        let digits = &input[i - 4..i];
        let value = digits
            .iter()
            .try_fold(0u32, |acc, &b| hex_value(b).map(|d| acc << 4 | u32::from(d)));
        if let Some(value) = value {
            return value > 0x7f || !is_host_byte(value as u8);
        }
    }
    false
}

/// A hostname may end at `j` when the next byte cannot continue it. A dot
/// followed by a label byte would extend the name into a longer one.
fn boundary_after(input: &[u8], j: usize) -> bool {
    match input.get(j) {
        None => true,
        Some(b'.') => !input.get(j + 1).copied().is_some_and(is_label_byte),
        Some(&b) => !is_label_byte(b),
    }
}

/// Which namespace text is translated into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Target names become proxy names (responses).
    ProxyWard,
    /// Proxy names become target names (requests).
    TargetWard,
}

/// How a translated name entered the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Configured,
    Learned,
}

/// Outcome of registering a target-side name at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    AlreadyKnown,
    /// The name's proxy form collides with a configured entry. The configured
    /// entry stays authoritative and the name is not added.
    Conflict { existing: String },
    /// The name is not within the target domain.
    Foreign,
    /// The learned table is full.
    Full,
}

#[derive(Clone, Debug)]
struct Mapping {
    target: String,
    proxy: String,
    origin: Origin,
}

/// Longest-first match tables for both directions.
#[derive(Default)]
struct Table {
    to_proxy: Vec<(Vec<u8>, Vec<u8>)>,
    to_target: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Table {
    fn build<'a>(mappings: impl Iterator<Item = &'a Mapping>) -> Self {
        let mut table = Table::default();
        for m in mappings {
            table
                .to_proxy
                .push((m.target.as_bytes().to_vec(), m.proxy.as_bytes().to_vec()));
            table
                .to_target
                .push((m.proxy.as_bytes().to_vec(), m.target.as_bytes().to_vec()));
        }
        table.to_proxy.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        table.to_target.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        table
    }

    fn patterns(&self, direction: Direction) -> &[(Vec<u8>, Vec<u8>)] {
        match direction {
            Direction::ProxyWard => &self.to_proxy,
            Direction::TargetWard => &self.to_target,
        }
    }
}

/// Translates hostnames between the target and proxy namespaces.
///
/// Configured names (the target domain and every TargetResource) are fixed at
/// construction. In dynamic mode, unseen names under the target domain are
/// learned at runtime with an idempotent insert-if-absent; configured names
/// always take precedence over learned ones.
pub struct Translator {
    target: DomainName,
    proxy: DomainName,
    dynamic: bool,
    client_scheme: Option<&'static str>,
    target_scheme: &'static str,
    configured: Vec<Mapping>,
    learned: DashMap<String, String>,
    max_learned: usize,
    full_warned: AtomicBool,
    table: RwLock<Arc<Table>>,
    rebuild: Mutex<()>,
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("target", &self.target)
            .field("proxy", &self.proxy)
            .field("dynamic", &self.dynamic)
            .field("configured", &self.configured.len())
            .field("learned", &self.learned.len())
            .finish()
    }
}

impl Translator {
    pub fn new(target: DomainName, proxy: DomainName, resources: &[DomainName]) -> Result<Self> {
        if target == proxy {
            return Err(Error::config("proxy domain and target domain must differ"));
        }
        let mut configured = vec![Mapping {
            target: target.0.clone(),
            proxy: proxy.0.clone(),
            origin: Origin::Configured,
        }];
        for name in resources {
            if configured.iter().any(|m| m.target == name.0) {
                continue;
            }
            let proxy_form = proxy_form(name.as_str(), &target, &proxy);
            if let Some(existing) = configured.iter().find(|m| m.proxy == proxy_form) {
                return Err(Error::config(format!(
                    "target resource `{name}` maps to `{proxy_form}`, already used by `{}`",
                    existing.target
                )));
            }
            configured.push(Mapping {
                target: name.0.clone(),
                proxy: proxy_form,
                origin: Origin::Configured,
            });
        }
        let table = Table::build(configured.iter());
        Ok(Self {
            target,
            proxy,
            dynamic: false,
            client_scheme: None,
            target_scheme: "https",
            configured,
            learned: DashMap::new(),
            max_learned: DEFAULT_MAX_LEARNED,
            full_warned: AtomicBool::new(false),
            table: RwLock::new(Arc::new(table)),
            rebuild: Mutex::new(()),
        })
    }

    /// Learn unseen names under the target domain at runtime.
    pub fn dynamic(mut self, enabled: bool) -> Self {
        self.dynamic = enabled;
        self
    }

    /// Force the URL scheme clients see (`"http"` or `"https"`). Translated
    /// URLs are rewritten to this scheme proxy-ward and back to the target
    /// scheme target-ward.
    pub fn client_scheme(mut self, scheme: Option<&'static str>) -> Self {
        self.client_scheme = scheme;
        self
    }

    /// Stop learning once `max` names have been learned.
    pub fn max_learned(mut self, max: usize) -> Self {
        self.max_learned = max;
        self
    }

    /// Scheme used to reach the target (`"https"` by default).
    pub fn target_scheme(mut self, scheme: &'static str) -> Self {
        self.target_scheme = scheme;
        self
    }

    pub fn target(&self) -> &DomainName {
        &self.target
    }

    pub fn proxy(&self) -> &DomainName {
        &self.proxy
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Number of names learned at runtime.
    pub fn learned_len(&self) -> usize {
        self.learned.len()
    }

    fn is_full(&self) -> bool {
        if self.learned.len() < self.max_learned {
            return false;
        }
        if !self.full_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(max = self.max_learned, "learned domain table is full, no further names are learned");
        }
        true
    }

    fn snapshot(&self) -> Arc<Table> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Where a target-side name came from, if it is known.
    pub fn origin_of(&self, target_name: &str) -> Option<Origin> {
        let name = target_name.to_ascii_lowercase();
        if let Some(m) = self.configured.iter().find(|m| m.target == name) {
            return Some(m.origin);
        }
        self.learned.contains_key(&name).then_some(Origin::Learned)
    }

    /// Register a target-side name seen at runtime. Duplicate registration is
    /// a no-op, so concurrent requests may race on the same name.
    pub fn register(&self, target_name: &str) -> Registration {
        let Ok(name) = DomainName::parse(target_name) else {
            return Registration::Foreign;
        };
        if !name.is_within(&self.target) {
            return Registration::Foreign;
        }
        if self.configured.iter().any(|m| m.target == name.0) {
            return Registration::AlreadyKnown;
        }
        let proxy_form = proxy_form(name.as_str(), &self.target, &self.proxy);
        if let Some(existing) = self.configured.iter().find(|m| m.proxy == proxy_form) {
            tracing::warn!(
                learned = %name,
                configured = %existing.target,
                proxy = %proxy_form,
                "learned domain collides with configured resource, keeping configured"
            );
            return Registration::Conflict {
                existing: existing.target.clone(),
            };
        }

        // Size check and insert happen under the rebuild lock so the cap holds
        let guard = self.rebuild.lock().unwrap_or_else(|e| e.into_inner());
        if self.learned.contains_key(&name.0) {
            return Registration::AlreadyKnown;
        }
        if self.is_full() {
            return Registration::Full;
        }
        match self.learned.entry(name.0.clone()) {
            Entry::Occupied(_) => return Registration::AlreadyKnown,
            Entry::Vacant(slot) => {
                slot.insert(proxy_form.clone());
            }
        }
        tracing::info!(target_host = %name, proxy_host = %proxy_form, "learned new target domain");
        self.rebuild_table(guard);
        Registration::Inserted
    }

    fn rebuild_table(&self, _guard: MutexGuard<'_, ()>) {
        let learned: Vec<Mapping> = self
            .learned
            .iter()
            .map(|entry| Mapping {
                target: entry.key().clone(),
                proxy: entry.value().clone(),
                origin: Origin::Learned,
            })
            .collect();
        let table = Table::build(self.configured.iter().chain(learned.iter()));
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    /// Scan target-side text for unseen names under the target domain and
    /// register them. Does nothing outside dynamic mode.
    pub fn learn_from(&self, text: &[u8]) {
        if !self.dynamic {
            return;
        }
        let suffix = format!(".{}", self.target);
        let suffix = suffix.as_bytes();
        let mut from = 0;
        while let Some(pos) = find(&text[from..], suffix) {
            let end = from + pos + suffix.len();
            from = from + pos + 1;
            if !boundary_after(text, end) {
                continue;
            }
            let mut start = end - suffix.len();
            while start > 0 && is_host_byte(text[start - 1]) {
                start -= 1;
            }
            // Skip forms like `%2Fcdn.t.tld` whose start is mid-escape
            while start < end && !boundary_before(text, start) {
                start += 1;
            }
            let Ok(candidate) = std::str::from_utf8(&text[start..end]) else {
                continue;
            };
            let candidate = candidate.trim_start_matches(['.', '-']);
            if candidate.len() > self.target.as_str().len() && self.origin_of(candidate).is_none() {
                self.register(candidate);
            }
        }
    }

    /// Translate text from the target namespace into the proxy namespace.
    pub fn to_proxy_domain(&self, text: &str) -> String {
        bytes_to_string(self.translate(text.as_bytes(), Direction::ProxyWard))
    }

    /// Translate text from the proxy namespace into the target namespace.
    pub fn to_target_domain(&self, text: &str) -> String {
        bytes_to_string(self.translate(text.as_bytes(), Direction::TargetWard))
    }

    /// Translate raw bytes. Returns `Cow::Borrowed` when nothing matched.
    pub fn translate<'a>(&self, input: &'a [u8], direction: Direction) -> Cow<'a, [u8]> {
        let table = self.snapshot();
        let patterns = table.patterns(direction);
        let scheme = match direction {
            Direction::ProxyWard => self.client_scheme,
            Direction::TargetWard => self.client_scheme.map(|_| self.target_scheme),
        };

        let mut out: Option<Vec<u8>> = None;
        let mut last = 0;
        let mut i = 0;
        while i < input.len() {
            if !boundary_before(input, i) {
                i += 1;
                continue;
            }
            let hit = patterns.iter().find(|(pattern, _)| {
                input[i..].starts_with(pattern) && boundary_after(input, i + pattern.len())
            });
            match hit {
                Some((pattern, replacement)) => {
                    let buf = out.get_or_insert_with(|| Vec::with_capacity(input.len() + 64));
                    buf.extend_from_slice(&input[last..i]);
                    if let Some(scheme) = scheme {
                        force_scheme(buf, scheme);
                    }
                    buf.extend_from_slice(replacement);
                    i += pattern.len();
                    last = i;
                }
                None => i += 1,
            }
        }

        match out {
            Some(mut buf) => {
                buf.extend_from_slice(&input[last..]);
                Cow::Owned(buf)
            }
            None => Cow::Borrowed(input),
        }
    }

    /// Map a client-facing `Host` (port allowed) to the target-side host.
    ///
    /// Returns `None` for malformed hosts, hosts outside the proxy domain, and
    /// unknown subdomains when dynamic mode is off. In dynamic mode an unknown
    /// `X.<proxy>` maps to `X.<target>` without being learned; the caller
    /// commits it with [`Translator::register`] once the target answered.
    pub fn resolve_request_host(&self, host: &str) -> Option<String> {
        let host = strip_port(host);
        let host = DomainName::parse(host).ok()?;
        let table = self.snapshot();
        if let Some((_, target)) = table
            .to_target
            .iter()
            .find(|(proxy, _)| proxy.as_slice() == host.as_str().as_bytes())
        {
            return String::from_utf8(target.clone()).ok();
        }
        if !self.dynamic || !host.is_within(&self.proxy) {
            return None;
        }
        if self.is_full() {
            return None;
        }
        let prefix = &host.as_str()[..host.as_str().len() - self.proxy.as_str().len() - 1];
        let candidate = DomainName::parse(&format!("{prefix}.{}", self.target)).ok()?;
        Some(candidate.0)
    }

    /// Translate a `Set-Cookie` `Domain` attribute proxy-ward. Any domain
    /// within the target maps by suffix; foreign names only when configured.
    pub fn cookie_domain_to_proxy(&self, domain: &str) -> Option<String> {
        let leading_dot = domain.starts_with('.');
        let name = DomainName::parse(domain.trim_start_matches('.')).ok()?;
        let mapped = if name.is_within(&self.target) {
            proxy_form(name.as_str(), &self.target, &self.proxy)
        } else {
            let known = self
                .configured
                .iter()
                .any(|m| m.target == name.0 && m.origin == Origin::Configured);
            if !known {
                return None;
            }
            proxy_form(name.as_str(), &self.target, &self.proxy)
        };
        Some(if leading_dot {
            format!(".{mapped}")
        } else {
            mapped
        })
    }
}

fn proxy_form(name: &str, target: &DomainName, proxy: &DomainName) -> String {
    if name == target.as_str() {
        proxy.0.clone()
    } else if is_within(name, target.as_str()) {
        let prefix = &name[..name.len() - target.as_str().len()];
        format!("{prefix}{proxy}")
    } else {
        format!("{name}.{proxy}")
    }
}

pub(crate) fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Rewrite a URL scheme that immediately precedes the hostname just about to
/// be emitted. Handles plain, JSON-escaped and percent-encoded separators.
fn force_scheme(buf: &mut Vec<u8>, scheme: &str) {
    const SEPARATORS: &[&[u8]] = &[b"://", b":\\/\\/", b"%3A%2F%2F", b"%3a%2f%2f"];
    for sep in SEPARATORS {
        if !buf.ends_with(sep) {
            continue;
        }
        let before = buf.len() - sep.len();
        for existing in [&b"https"[..], &b"http"[..]] {
            if buf[..before].ends_with(existing)
                && (before == existing.len() || !buf[before - existing.len() - 1].is_ascii_alphanumeric())
            {
                let start = before - existing.len();
                let tail = buf.split_off(before);
                buf.truncate(start);
                buf.extend_from_slice(scheme.as_bytes());
                buf.extend_from_slice(&tail);
                return;
            }
        }
        return;
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn bytes_to_string(bytes: Cow<'_, [u8]>) -> String {
    match bytes {
        Cow::Borrowed(b) => String::from_utf8_lossy(b).into_owned(),
        Cow::Owned(b) => String::from_utf8(b).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
    }
}
