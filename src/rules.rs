//! Operator-supplied literal substitutions and JavaScript injection rules.
//!
//! Substitutions scan left to right. At each position the first declared
//! rule whose pattern starts there wins, and scanning resumes after the
//! consumed match, so replacements are never rescanned.

use std::borrow::Cow;

use crate::domain::{Direction, find};
use crate::error::{Error, Result};

/// A literal `(pattern, replacement)` pair. Requests are rewritten from
/// `pattern` to `replacement`; responses the other way around.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Substitution {
    pattern: Vec<u8>,
    replacement: Vec<u8>,
}

impl Substitution {
    pub fn new(pattern: impl Into<Vec<u8>>, replacement: impl Into<Vec<u8>>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(Error::config("substitution pattern must not be empty"));
        }
        Ok(Self {
            pattern,
            replacement: replacement.into(),
        })
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    fn oriented(&self, direction: Direction) -> Option<(&[u8], &[u8])> {
        match direction {
            Direction::TargetWard => Some((&self.pattern, &self.replacement)),
            // An empty replacement has no inverse to look for
            Direction::ProxyWard if self.replacement.is_empty() => None,
            Direction::ProxyWard => Some((&self.replacement, &self.pattern)),
        }
    }
}

/// Script payload injected into responses whose target-side URL contains
/// `url_pattern`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsInjectionRule {
    pub url_pattern: String,
    pub payload: Vec<u8>,
}

/// Ordered substitutions plus JS injection rules.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    substitutions: Vec<Substitution>,
    injections: Vec<JsInjectionRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn substitution(mut self, rule: Substitution) -> Self {
        self.substitutions.push(rule);
        self
    }

    pub fn injection(mut self, rule: JsInjectionRule) -> Self {
        self.injections.push(rule);
        self
    }

    pub fn substitutions(&self) -> &[Substitution] {
        &self.substitutions
    }

    pub fn is_empty(&self) -> bool {
        self.substitutions.is_empty() && self.injections.is_empty()
    }

    /// Apply every substitution in one left-to-right pass.
    pub fn apply<'a>(&self, input: &'a [u8], direction: Direction) -> Cow<'a, [u8]> {
        let rules: Vec<(&[u8], &[u8])> = self
            .substitutions
            .iter()
            .filter_map(|rule| rule.oriented(direction))
            .collect();
        if rules.is_empty() {
            return Cow::Borrowed(input);
        }
        let mut first_bytes = [false; 256];
        for (pattern, _) in &rules {
            first_bytes[pattern[0] as usize] = true;
        }

        let mut out: Option<Vec<u8>> = None;
        let mut last = 0;
        let mut i = 0;
        while i < input.len() {
            if !first_bytes[input[i] as usize] {
                i += 1;
                continue;
            }
            match rules.iter().find(|(pattern, _)| input[i..].starts_with(pattern)) {
                Some((pattern, replacement)) => {
                    let buf = out.get_or_insert_with(|| Vec::with_capacity(input.len()));
                    buf.extend_from_slice(&input[last..i]);
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

    /// Payloads of every injection rule matching `url`, in declared order.
    pub fn injections_for(&self, url: &str) -> Vec<&[u8]> {
        self.injections
            .iter()
            .filter(|rule| url.contains(&rule.url_pattern))
            .map(|rule| rule.payload.as_slice())
            .collect()
    }
}

/// Where a payload goes in a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Document {
    Html,
    Script,
}

/// Insert `payload` once into `body`.
///
/// HTML gets a `<script>` block right after the opening `<head>` tag; without
/// one the raw payload goes after the first inline `<script>` tag (one
/// without `src`), and without either a script block is prepended. Script
/// documents get the payload prepended. An anchor whose tag never closes is a
/// [`Error::RewriteDegradation`] and the caller keeps the original bytes.
pub fn inject(body: &[u8], payload: &[u8], document: Document) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() + payload.len() + 48);
    if document == Document::Script {
        out.extend_from_slice(payload);
        out.push(b'\n');
        out.extend_from_slice(body);
        return Ok(out);
    }

    let lowered = body.to_ascii_lowercase();
    if let Some((_, end)) = opening_tag(&lowered, b"head", 0)? {
        out.extend_from_slice(&body[..end]);
        push_script_block(&mut out, payload);
        out.extend_from_slice(&body[end..]);
    } else if let Some(end) = inline_script_end(&lowered)? {
        out.extend_from_slice(&body[..end]);
        out.extend_from_slice(payload);
        out.push(b'\n');
        out.extend_from_slice(&body[end..]);
    } else {
        push_script_block(&mut out, payload);
        out.extend_from_slice(body);
    }
    Ok(out)
}

fn push_script_block(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(b"<script type=\"text/javascript\">");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"</script>");
}

/// Offset just past the first opening `<script>` tag that has no `src`
/// attribute. Browsers ignore inline content of external scripts.
fn inline_script_end(lowered: &[u8]) -> Result<Option<usize>> {
    let mut from = 0;
    while let Some((start, end)) = opening_tag(lowered, b"script", from)? {
        if !has_attribute(&lowered[start..end], b"src") {
            return Ok(Some(end));
        }
        from = end;
    }
    Ok(None)
}

/// `true` if the tag text carries attribute `name` (lowercase).
fn has_attribute(tag: &[u8], name: &[u8]) -> bool {
    let mut from = 0;
    while let Some(pos) = find(&tag[from..], name) {
        let at = from + pos;
        from = at + 1;
        let preceded = at > 0 && tag[at - 1].is_ascii_whitespace();
        let rest = &tag[at + name.len()..];
        let value = rest.iter().find(|b| !b.is_ascii_whitespace());
        if preceded && value == Some(&b'=') {
            return true;
        }
    }
    false
}

/// Start and end offsets of the first `<name ...>` tag at or after `from`.
/// `lowered` is the ASCII-lowercased document. `<header>` does not count as
/// `<head>`.
fn opening_tag(lowered: &[u8], name: &[u8], from: usize) -> Result<Option<(usize, usize)>> {
    let mut needle = Vec::with_capacity(name.len() + 1);
    needle.push(b'<');
    needle.extend_from_slice(name);

    let mut from = from;
    while let Some(pos) = find(&lowered[from..], &needle) {
        let start = from + pos;
        let after = start + needle.len();
        from = after;
        match lowered.get(after) {
            Some(b'>') => return Ok(Some((start, after + 1))),
            Some(b) if b.is_ascii_whitespace() || *b == b'/' => {
                return match lowered[after..].iter().position(|&b| b == b'>') {
                    Some(close) => Ok(Some((start, after + close + 1))),
                    None => Err(Error::RewriteDegradation(format!(
                        "unterminated <{}> tag",
                        String::from_utf8_lossy(name)
                    ))),
                };
            }
            None => {
                return Err(Error::RewriteDegradation(format!(
                    "document truncated inside <{}",
                    String::from_utf8_lossy(name)
                )));
            }
            Some(_) => continue,
        }
    }
    Ok(None)
}
