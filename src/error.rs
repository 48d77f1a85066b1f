use std::net::IpAddr;
use std::time::Duration;

use crate::http::BoxError;

/// Errors produced by the proxy core.
///
/// Only [`Error::Configuration`] is fatal. Every other variant is raised per
/// request and degrades to a generic client-visible failure or to passthrough
/// bytes, so a single bad request never takes the listener down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("upstream request to {target} failed")]
    Upstream {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("upstream request to {target} timed out after {elapsed:?}")]
    Timeout { target: String, elapsed: Duration },

    #[error("rewrite skipped: {0}")]
    RewriteDegradation(String),

    #[error("plugin `{plugin}` failed in {hook}: {message}")]
    PluginCallback {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("outbound request to {host} blocked: resolves to non-public address {addr}")]
    SecurityPolicyViolation { host: String, addr: IpAddr },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn upstream(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Upstream {
            target: target.into(),
            source: source.into(),
        }
    }

    /// Status code the engine answers with when this error escapes the
    /// pipeline. The body never carries the error text.
    pub fn client_status(&self) -> http::StatusCode {
        match self {
            Error::SecurityPolicyViolation { .. } => http::StatusCode::FORBIDDEN,
            Error::Timeout { .. } => http::StatusCode::GATEWAY_TIMEOUT,
            _ => http::StatusCode::BAD_GATEWAY,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
