use crate::config::ProxyConfig;
use crate::hooks::{HookResult, Plugin};
use crate::tls::CertificateAuthority;

/// Generates a certificate for `<proxy>` and `*.<proxy>` when HTTPS is
/// needed and no certificate was configured.
///
/// Signs with the CA named by `autocertCaCert`/`autocertCaKey` when both are
/// set, otherwise with a throwaway CA no client will trust.
pub fn autocert() -> Plugin {
    Plugin::new(
        "autocert",
        "0.1.0",
        "Auto-generates a TLS certificate for the proxy domain",
    )
    .on_flags_parsed(provision)
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn provision(config: &mut ProxyConfig) -> HookResult {
    if !config.tls_mode().needs_certificate() || is_set(&config.cert) || is_set(&config.cert_key) {
        return Ok(());
    }
    let Some(proxy) = config.proxy_domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) else {
        return Err("proxyDomain is not set".into());
    };
    let proxy = proxy.to_ascii_lowercase();

    let ca = match (&config.autocert_ca_cert, &config.autocert_ca_key) {
        (Some(cert), Some(key)) => CertificateAuthority::from_pem_files(cert, key)
            .map_err(|e| format!("loading autocert CA: {e:#}"))?,
        _ => {
            tracing::warn!("autocert: no CA configured, signing with an ephemeral CA that clients will not trust");
            CertificateAuthority::generate("mimic ephemeral CA")?
        }
    };

    tracing::info!(domain = %proxy, "autocert: generating TLS certificate");
    let issued = ca.issue(&[proxy.clone(), format!("*.{proxy}")])?;
    tracing::debug!(domain = %proxy, "autocert: certificate issued");

    config.cert = Some(issued.cert_pem);
    config.cert_key = Some(issued.key_pem);
    config.cert_pool = None;
    Ok(())
}
