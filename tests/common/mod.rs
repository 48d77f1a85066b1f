#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use mimic::resolve::StaticResolver;
use mimic::sink::LogSink;
use mimic::{HookBus, Proxy, ProxyConfig};
use tokio::net::TcpListener;

pub const PROXY: &str = "proxy.test";
pub const TARGET: &str = "target.test";

pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Serve `app` on an ephemeral port, standing in for the target site.
pub async fn start_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// HTTP-only config mirroring `target.test` over plain HTTP.
pub fn base_config() -> ProxyConfig {
    ProxyConfig {
        proxy_domain: Some(PROXY.into()),
        target: Some(format!("http://{TARGET}")),
        force_http: true,
        ..Default::default()
    }
}

/// Pins the target and any extra `hosts` to the local upstream.
pub fn resolver(upstream: SocketAddr, hosts: &[&str]) -> StaticResolver {
    hosts
        .iter()
        .fold(StaticResolver::new().pin(TARGET, upstream), |r, host| r.pin(*host, upstream))
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub proxy: Proxy,
}

impl TestProxy {
    /// Client-facing URL for `host` (a name under the proxy domain).
    pub fn url(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.addr.port())
    }

    /// A client that resolves `hosts` to this proxy and never follows
    /// redirects.
    pub fn client(&self, hosts: &[&str]) -> reqwest::Client {
        hosts
            .iter()
            .fold(reqwest::Client::builder(), |b, host| b.resolve(host, self.addr))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }
}

/// Build a proxy from `config` and serve its HTTP listener on an ephemeral
/// port.
pub async fn start_proxy(
    config: ProxyConfig,
    resolver: StaticResolver,
    hooks: Option<HookBus>,
    sink: Option<LogSink>,
) -> TestProxy {
    install_crypto_provider();
    let settings = config.validate().unwrap();
    let mut builder = Proxy::builder(settings).resolver(resolver);
    if let Some(hooks) = hooks {
        builder = builder.hooks(Arc::new(hooks));
    }
    if let Some(sink) = sink {
        builder = builder.log_sink(sink);
    }
    let proxy = builder.build().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = proxy.clone();
    tokio::spawn(async move {
        serving.serve_http(listener).await.unwrap();
    });
    TestProxy { addr, proxy }
}

/// In-memory writer for inspecting log sink output.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn lines(&self) -> Vec<serde_json::Value> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
