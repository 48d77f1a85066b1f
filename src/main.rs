use std::sync::Arc;

use clap::Parser;
use mimic::config::{DurationValue, ProxyConfig, TlsMode, parse_duration};
use mimic::{HookBus, Proxy, plugins};

#[derive(Parser)]
#[command(
    name = "mimic",
    about = "Domain-translating reverse proxy for phishing simulations",
    after_help = "Example: mimic --proxy-domain proxy.tld --target target.tld --force-http"
)]
struct Cli {
    /// Path to a TOML or JSON config file
    #[arg(short, long)]
    config: Option<String>,

    /// Domain the mirrored site is served under (e.g. proxy.tld)
    #[arg(long, alias = "proxyDomain")]
    proxy_domain: Option<String>,

    /// Target domain, or a URL to pick scheme and port (http://target.tld:8080)
    #[arg(long)]
    target: Option<String>,

    /// Comma-separated extra target domains to translate
    #[arg(long, alias = "targetRes")]
    target_resources: Option<String>,

    /// Comma-separated base64(pattern):base64(replacement) pairs
    #[arg(long)]
    rules: Option<String>,

    /// Comma-separated urlpattern:base64(payload) JavaScript injections
    #[arg(long, alias = "jsRules")]
    js_rules: Option<String>,

    /// Comma-separated target URL substrings that end a session
    #[arg(long, alias = "terminateTriggers")]
    terminate_triggers: Option<String>,

    /// Where terminated sessions are redirected
    #[arg(long, alias = "terminateUrl")]
    terminate_redirect_url: Option<String>,

    /// Tracking cookie name (default: id)
    #[arg(long, alias = "trackingCookie")]
    tracking_cookie: Option<String>,

    /// Tracking query parameter name (default: id)
    #[arg(long, alias = "trackingParam")]
    tracking_param: Option<String>,

    /// Redirect plain HTTP to HTTPS
    #[arg(long, alias = "forceHTTPS")]
    force_https: bool,

    /// Serve HTTP only and strip TLS from translated URLs
    #[arg(long, alias = "forceHTTP")]
    force_http: bool,

    /// Learn subdomains of the target from traffic
    #[arg(long, alias = "dynamicMode")]
    dynamic_mode: bool,

    /// Disable the anti-SSRF guard and upstream certificate checks
    #[arg(long, alias = "disableSecurity")]
    disable_security: bool,

    /// JSON-lines file for fetched requests and captured credentials
    #[arg(long)]
    log: Option<String>,

    /// Only log POST requests
    #[arg(long, alias = "logPostOnly")]
    post_only: bool,

    /// Comma-separated plugins to enable, or "all"
    #[arg(long)]
    plugins: Option<String>,

    /// Certificate chain (PEM or base64 PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Certificate private key (PEM or base64 PEM)
    #[arg(long, alias = "certKey")]
    cert_key: Option<String>,

    /// Extra CA certificates appended to the served chain
    #[arg(long, alias = "certPool")]
    cert_pool: Option<String>,

    /// CA certificate file the autocert plugin signs with
    #[arg(long)]
    autocert_ca_cert: Option<String>,

    /// CA private key file the autocert plugin signs with
    #[arg(long)]
    autocert_ca_key: Option<String>,

    /// Bind address (default: 127.0.0.1)
    #[arg(long, alias = "listeningAddress")]
    listening_address: Option<String>,

    /// HTTP port (default: 80)
    #[arg(long, alias = "listeningPortHTTP")]
    listening_port_http: Option<u16>,

    /// HTTPS port (default: 443)
    #[arg(long, alias = "listeningPortHTTPS")]
    listening_port_https: Option<u16>,

    /// Upstream request timeout (e.g. "30s", "500ms")
    #[arg(long, value_parser = parse_duration)]
    upstream_timeout: Option<std::time::Duration>,

    /// Also translate domains inside Set-Cookie values
    #[arg(long)]
    rewrite_cookie_values: bool,

    /// Max idle upstream connections per host (0 disables pooling)
    #[arg(long = "pool-max-idle")]
    pool_max_idle_per_host: Option<usize>,

    /// Proxy the target is reached through (http://, socks5:// or socks5h://)
    #[arg(long, alias = "proxyAddress")]
    proxy_address: Option<String>,

    /// Forget sessions idle for this long (e.g. "3600s")
    #[arg(long, value_parser = parse_duration)]
    session_idle_timeout: Option<std::time::Duration>,

    /// Stop learning new domains in dynamic mode after this many
    #[arg(long)]
    max_learned_domains: Option<usize>,

    /// Generate a CA certificate and key into the autocert CA paths and exit
    #[arg(long)]
    generate_ca: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn overrides(&self) -> ProxyConfig {
        ProxyConfig {
            proxy_domain: self.proxy_domain.clone(),
            target: self.target.clone(),
            target_resources: self.target_resources.clone(),
            rules: self.rules.clone(),
            js_rules: self.js_rules.clone(),
            terminate_triggers: self.terminate_triggers.clone(),
            terminate_redirect_url: self.terminate_redirect_url.clone(),
            tracking_cookie: self.tracking_cookie.clone(),
            tracking_param: self.tracking_param.clone(),
            force_https: self.force_https,
            force_http: self.force_http,
            dynamic_mode: self.dynamic_mode,
            disable_security: self.disable_security,
            log: self.log.clone(),
            post_only: self.post_only,
            plugins: self.plugins.clone(),
            cert: self.cert.clone(),
            cert_key: self.cert_key.clone(),
            cert_pool: self.cert_pool.clone(),
            autocert_ca_cert: self.autocert_ca_cert.clone(),
            autocert_ca_key: self.autocert_ca_key.clone(),
            listening_address: self.listening_address.clone(),
            listening_port_http: self.listening_port_http,
            listening_port_https: self.listening_port_https,
            upstream_timeout: self.upstream_timeout.map(DurationValue),
            rewrite_cookie_values: self.rewrite_cookie_values,
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            proxy_address: self.proxy_address.clone(),
            session_idle_timeout: self.session_idle_timeout.map(DurationValue),
            max_learned_domains: self.max_learned_domains,
        }
    }
}

fn generate_ca(config: &ProxyConfig) -> anyhow::Result<()> {
    let cert_path = config.autocert_ca_cert.as_deref().unwrap_or("ca-cert.pem");
    let key_path = config.autocert_ca_key.as_deref().unwrap_or("ca-key.pem");
    let ca = mimic::CertificateAuthority::generate("mimic CA")?;
    std::fs::write(cert_path, ca.cert_pem())?;
    std::fs::write(key_path, ca.key_pem())?;
    tracing::info!(path = %cert_path, "generated CA certificate");
    tracing::info!(path = %key_path, "generated CA private key");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "mimic=debug" } else { "mimic=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let mut config = match cli.config.as_deref() {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    config.merge(cli.overrides());

    if cli.generate_ca {
        return generate_ca(&config);
    }

    let mut bus = HookBus::builder();
    for plugin in plugins::builtin() {
        bus = bus.register(plugin);
    }
    let bus = bus.build(config.plugins.as_deref().unwrap_or("all"));
    for name in bus.plugins() {
        tracing::info!(plugin = %name, "plugin enabled");
    }
    bus.fire_flags_parsed(&mut config);

    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            eprintln!("{e}\n\nRun `mimic --help` for usage.");
            std::process::exit(2);
        }
    };

    if settings.dynamic_mode {
        tracing::warn!("dynamic mode enabled: subdomains of the target are learned from traffic");
    }
    match settings.tls_mode {
        TlsMode::HttpOnly => tracing::warn!("forceHTTP enabled: TLS is stripped from every translated URL"),
        TlsMode::HttpsOnly => tracing::warn!("forceHTTPS enabled: plain HTTP requests are redirected to HTTPS"),
        TlsMode::Dual => {}
    }
    if settings.disable_security {
        tracing::warn!("security disabled: upstream certificates and addresses are not checked");
    }

    let proxy = Proxy::builder(settings).hooks(Arc::new(bus)).build()?;
    proxy
        .listen_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}
