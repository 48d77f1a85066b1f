use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::http::Body;

type PoolKey = String;
type Sender = hyper::client::conn::http1::SendRequest<Body>;

pub(crate) struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 8,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct Idle {
    sender: Sender,
    idle_since: Instant,
}

struct PoolInner {
    idle: HashMap<PoolKey, Vec<Idle>>,
    config: PoolConfig,
}

/// Idle HTTP/1.1 upstream connections, shared by every request of a proxy.
///
/// Keys are `scheme://host:port`. Each key holds a LIFO stack so the most
/// recently used (and most likely still open) connection is handed out first.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: HashMap::new(),
                config,
            })),
        }
    }

    pub(crate) fn checkout(&self, key: &str) -> Option<Sender> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.config.max_idle_per_host == 0 {
            return None;
        }

        // Pop from the back, skip expired/closed entries
        let timeout = inner.config.idle_timeout;
        let stack = inner.idle.get_mut(key)?;
        while let Some(idle) = stack.pop() {
            if idle.idle_since.elapsed() < timeout && !idle.sender.is_closed() {
                if stack.is_empty() {
                    inner.idle.remove(key);
                }
                return Some(idle.sender);
            }
        }
        inner.idle.remove(key);
        None
    }

    pub(crate) fn checkin(&self, key: String, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let max = inner.config.max_idle_per_host;
        if max == 0 {
            return;
        }
        let stack = inner.idle.entry(key).or_default();
        if stack.len() < max {
            stack.push(Idle {
                sender,
                idle_since: Instant::now(),
            });
        }
    }

    #[cfg(test)]
    fn idle_count(&self, key: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.idle.get(key).map_or(0, Vec::len)
    }
}
