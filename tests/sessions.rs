mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::IntoResponse;
use axum::routing::get;
use common::*;
use mimic::ProxyConfig;
use mimic::config::DurationValue;
use mimic::session::SessionState;

const GOODBYE: &str = "https://example.org/bye";

fn tracking_token(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|c| c.split(';').next())
        .find_map(|pair| pair.strip_prefix("id="))
        .map(str::to_string)
}

async fn echo_uri(uri: Uri) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/octet-stream")], uri.to_string())
}

fn app(hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "home"
            }),
        )
        .route("/echo", get(echo_uri))
        .route("/done", get(|| async { "all done" }))
        .route(
            "/signin",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "https://target.test/done?ok=1")]) }),
        )
        .with_state(hits)
}

fn terminating_config() -> ProxyConfig {
    ProxyConfig {
        terminate_triggers: Some("target.test/done".into()),
        terminate_redirect_url: Some(GOODBYE.into()),
        ..base_config()
    }
}

#[tokio::test]
async fn tracking_cookie_is_issued_once() {
    let upstream = start_upstream(app(Arc::default())).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;
    let client = proxy.client(&[PROXY]);

    let resp = client.get(proxy.url(PROXY, "/")).send().await.unwrap();
    let token = tracking_token(&resp).unwrap();
    assert_eq!(token.len(), 32);
    let cookie = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap())
        .find(|c| c.starts_with("id="))
        .unwrap()
        .to_string();
    assert!(cookie.contains("Domain=proxy.test"), "{cookie}");
    assert!(cookie.contains("HttpOnly"), "{cookie}");

    let resp = client
        .get(proxy.url(PROXY, "/"))
        .header("cookie", format!("id={token}"))
        .send()
        .await
        .unwrap();
    assert!(tracking_token(&resp).is_none());
    assert_eq!(proxy.proxy.sessions().len(), 1);
}

#[tokio::test]
async fn query_token_is_adopted_and_hidden_from_target() {
    let upstream = start_upstream(app(Arc::default())).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;

    let resp = proxy
        .client(&[PROXY])
        .get(proxy.url(PROXY, "/echo?id=campaign-42&page=2"))
        .send()
        .await
        .unwrap();

    assert_eq!(tracking_token(&resp).as_deref(), Some("campaign-42"));
    assert_eq!(resp.text().await.unwrap(), "/echo?page=2");
    assert!(proxy.proxy.sessions().get("campaign-42").is_some());
}

#[tokio::test]
async fn trigger_terminates_session_and_redirects() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = start_upstream(app(hits.clone())).await;
    let proxy = start_proxy(terminating_config(), resolver(upstream, &[]), None, None).await;
    let client = proxy.client(&[PROXY]);
    let cookie = "id=victim01";

    let resp = client
        .get(proxy.url(PROXY, "/"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let resp = client
        .get(proxy.url(PROXY, "/done"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(resp.headers()["location"], GOODBYE);
    assert_eq!(
        proxy.proxy.sessions().get("victim01").unwrap().state,
        SessionState::Terminated
    );

    // Terminated sessions never reach the target again
    let resp = client
        .get(proxy.url(PROXY, "/"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(resp.headers()["location"], GOODBYE);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Other sessions are unaffected
    let resp = client.get(proxy.url(PROXY, "/")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn trigger_in_target_redirect_location_terminates() {
    let upstream = start_upstream(app(Arc::default())).await;
    let proxy = start_proxy(terminating_config(), resolver(upstream, &[]), None, None).await;

    let resp = proxy
        .client(&[PROXY])
        .get(proxy.url(PROXY, "/signin?id=victim02"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 302);
    assert_eq!(resp.headers()["location"], GOODBYE);
    // The cookie still lands so the terminated state sticks
    assert_eq!(tracking_token(&resp).as_deref(), Some("victim02"));
    assert_eq!(
        proxy.proxy.sessions().get("victim02").unwrap().state,
        SessionState::Terminated
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_stay_isolated() {
    const CLIENTS: usize = 1000;
    let upstream = start_upstream(app(Arc::default())).await;
    let proxy = start_proxy(base_config(), resolver(upstream, &[]), None, None).await;
    let client = proxy.client(&[PROXY]);

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..CLIENTS {
        let client = client.clone();
        let url = proxy.url(PROXY, &format!("/echo?n={n}"));
        tasks.spawn(async move {
            let first = client.get(&url).send().await.unwrap();
            let token = tracking_token(&first).unwrap();
            assert_eq!(first.text().await.unwrap(), format!("/echo?n={n}"));

            let second = client
                .get(&url)
                .header("cookie", format!("id={token}"))
                .send()
                .await
                .unwrap();
            assert!(tracking_token(&second).is_none());
            token
        });
    }

    let mut tokens = HashSet::new();
    while let Some(token) = tasks.join_next().await {
        tokens.insert(token.unwrap());
    }
    assert_eq!(tokens.len(), CLIENTS);
    assert_eq!(proxy.proxy.sessions().len(), CLIENTS);
}

#[tokio::test]
async fn idle_sessions_are_forgotten() {
    let upstream = start_upstream(app(Arc::default())).await;
    let config = ProxyConfig {
        session_idle_timeout: Some(DurationValue(Duration::from_millis(200))),
        ..base_config()
    };
    let proxy = start_proxy(config, resolver(upstream, &[]), None, None).await;
    let client = proxy.client(&[PROXY]);

    for _ in 0..50 {
        let resp = client.get(proxy.url(PROXY, "/")).send().await.unwrap();
        assert!(tracking_token(&resp).is_some());
    }
    assert!(!proxy.proxy.sessions().is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    client.get(proxy.url(PROXY, "/")).send().await.unwrap();
    assert_eq!(proxy.proxy.sessions().len(), 1);
}
