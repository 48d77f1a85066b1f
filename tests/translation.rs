mod common;

use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, Uri, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use common::*;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use mimic::config::DurationValue;

const PAGE: &str = r#"<html><head><title>Welcome</title></head><body>
<a href="https://target.test/login">login</a>
<img src="//target.test/logo.png">
<span>contact: support@target.test</span>
<a href="https://nottarget.test/">other</a>
</body></html>"#;

async fn page() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], PAGE)
}

async fn echo(headers: HeaderMap, uri: Uri) -> impl IntoResponse {
    let value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    let body = format!(
        "host={}\norigin={}\nreferer={}\ncookie={}\nuri={}",
        value(header::HOST),
        value(header::ORIGIN),
        value(header::REFERER),
        value(header::COOKIE),
        uri
    );
    ([(header::CONTENT_TYPE, "application/octet-stream")], body)
}

async fn redirect() -> impl IntoResponse {
    (
        axum::http::StatusCode::FOUND,
        [
            (header::LOCATION, "https://target.test/account?next=https%3A%2F%2Ftarget.test%2Fhome"),
            (header::SET_COOKIE, "sid=abc; Domain=target.test; Path=/; Secure; HttpOnly"),
        ],
    )
}

async fn echo_body(body: String) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/octet-stream")], body)
}

fn app() -> Router {
    Router::new()
        .route("/", get(page))
        .route("/echo", get(echo))
        .route("/redirect", get(redirect))
        .route("/submit", post(echo_body))
}

#[tokio::test]
async fn html_is_translated_to_proxy_domain() {
    let upstream = start_upstream(app()).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;

    let resp = proxy
        .client(&[PROXY])
        .get(proxy.url(PROXY, "/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();

    assert!(body.contains(r#"href="http://proxy.test/login""#), "{body}");
    assert!(body.contains(r#"src="//proxy.test/logo.png""#), "{body}");
    assert!(body.contains("support@proxy.test"), "{body}");
    // Only whole host names are translated
    assert!(body.contains("https://nottarget.test/"), "{body}");
}

#[tokio::test]
async fn request_headers_reach_target_translated() {
    let upstream = start_upstream(app()).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;

    let body = proxy
        .client(&[PROXY])
        .get(proxy.url(PROXY, "/echo?back=http%3A%2F%2Fproxy.test%2Fdone"))
        .header("origin", "http://proxy.test")
        .header("referer", "http://proxy.test/page")
        .header("cookie", "pref=1; id=0123456789abcdef")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("host=target.test\n"), "{body}");
    assert!(body.contains("origin=http://target.test\n"), "{body}");
    assert!(body.contains("referer=http://target.test/page\n"), "{body}");
    // The tracking cookie never reaches the target
    assert!(body.contains("cookie=pref=1\n"), "{body}");
    assert!(body.contains("uri=/echo?back=http%3A%2F%2Ftarget.test%2Fdone"), "{body}");
}

#[tokio::test]
async fn redirects_and_cookies_stay_on_proxy_domain() {
    let upstream = start_upstream(app()).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;

    let resp = proxy
        .client(&[PROXY])
        .get(proxy.url(PROXY, "/redirect"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 302);
    assert_eq!(
        resp.headers()["location"],
        "http://proxy.test/account?next=http%3A%2F%2Fproxy.test%2Fhome"
    );
    let sid = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .find(|c| c.starts_with("sid="))
        .unwrap();
    assert!(sid.contains("Domain=proxy.test"), "{sid}");
    assert!(!sid.contains("Secure"), "{sid}");
}

#[tokio::test]
async fn unknown_hosts_are_not_proxied() {
    let upstream = start_upstream(app()).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;
    let client = proxy.client(&["evil.test", "unknown.proxy.test"]);

    let resp = client.get(proxy.url("evil.test", "/")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(proxy.url("unknown.proxy.test", "/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn rules_and_injection_apply_to_matching_pages() {
    let upstream = start_upstream(app()).await;
    let config = mimic::ProxyConfig {
        rules: Some(format!("{}:{}", STANDARD.encode("Welcome"), STANDARD.encode("Hello"))),
        js_rules: Some(format!("target.test/:{}", STANDARD.encode("window.mirrored=true;"))),
        ..base_config()
    };
    let proxy = start_proxy(config, resolver(upstream, &[]), None, None).await;

    let body = proxy
        .client(&[PROXY])
        .get(proxy.url(PROXY, "/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("<title>Hello</title>"), "{body}");
    assert!(
        body.contains(r#"<head><script type="text/javascript">window.mirrored=true;</script><title>"#),
        "{body}"
    );
}

#[tokio::test]
async fn form_bodies_are_translated_target_ward() {
    let upstream = start_upstream(app()).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;

    let body = proxy
        .client(&[PROXY])
        .post(proxy.url(PROXY, "/submit"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("user=alice&return=http%3A%2F%2Fproxy.test%2Fhome")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(body, "user=alice&return=http%3A%2F%2Ftarget.test%2Fhome");
}

#[tokio::test]
async fn stalled_text_body_times_out() {
    let app = Router::new().route(
        "/stalled",
        get(|| async {
            let head = futures_util::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"<html><head>")) });
            let body = axum::body::Body::from_stream(head.chain(futures_util::stream::pending()));
            ([(header::CONTENT_TYPE, "text/html")], body)
        }),
    );
    let upstream = start_upstream(app).await;
    let config = mimic::ProxyConfig {
        upstream_timeout: Some(DurationValue(Duration::from_millis(300))),
        ..base_config()
    };
    let proxy = start_proxy(config, resolver(upstream, &[]), None, None).await;

    let resp = tokio::time::timeout(
        Duration::from_secs(5),
        proxy.client(&[PROXY]).get(proxy.url(PROXY, "/stalled")).send(),
    )
    .await
    .expect("no response after the upstream timeout")
    .unwrap();
    assert_eq!(resp.status(), 504);
    assert_eq!(resp.text().await.unwrap(), "Gateway Timeout");
}

#[tokio::test]
async fn one_connection_serves_many_requests() {
    let upstream = start_upstream(app()).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;

    let tcp = tokio::net::TcpStream::connect(proxy.addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp)).await.unwrap();
    tokio::spawn(conn);

    let exchanges = [(PROXY, "/", 200), ("evil.test", "/", 404), (PROXY, "/redirect", 302)];
    for (host, path, status) in exchanges.into_iter().cycle().take(12) {
        sender.ready().await.unwrap();
        let req = http::Request::get(path)
            .header("host", host)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        assert_eq!(resp.status().as_u16(), status, "{host}{path}");
        resp.into_body().collect().await.unwrap();
    }
}
