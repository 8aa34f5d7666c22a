use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::StatusCode;
use http::header::{LOCATION, RETRY_AFTER};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::gateway::handle_request;
use crate::registry::Registry;
use crate::tunnel::{ForcedClose, Tunnel};

// -- Test helpers --

/// Spawns a local HTTP origin that echoes "origin {method} {path}[: {body}]".
async fn spawn_origin_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(origin_server::run(listener));
    addr
}

const SUB: &str = "happy-tiger-abcdef01";

async fn setup_tunnel(registry: &Arc<Registry>) -> Arc<Tunnel> {
    let origin = spawn_origin_server().await;
    registry.register_tunnel(SUB, origin, "localhost", 80, "203.0.113.7".parse().unwrap())
}

fn gw_request(host: &str, path: &str, user_agent: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("user-agent", user_agent)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn body_string(body: crate::gateway::ProxyBody) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

struct CountingCloser(AtomicUsize);

impl ForcedClose for CountingCloser {
    fn force_close(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// -- Gateway end-to-end --

#[tokio::test]
async fn proxies_non_browser_requests_to_the_origin() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    setup_tunnel(&registry).await;

    let req = gw_request(&format!("{SUB}.tunnl.gg"), "/hello", "curl/8.0");
    let response = handle_request(registry.clone(), config, req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    assert_eq!(body_string(response.into_body()).await, "origin GET /hello");
    registry.stop().await;
}

#[tokio::test]
async fn streams_request_bodies_to_the_origin() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    setup_tunnel(&registry).await;

    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header("host", format!("{SUB}.tunnl.gg"))
        .header("user-agent", "curl/8.0")
        .header("content-length", "4")
        .body(Full::new(Bytes::from_static(b"ping")))
        .unwrap();
    let response = handle_request(registry.clone(), config, req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response.into_body()).await,
        "origin POST /echo: ping"
    );
    registry.stop().await;
}

#[tokio::test]
async fn browsers_get_the_warning_interstitial() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    setup_tunnel(&registry).await;

    let req = gw_request(&format!("{SUB}.tunnl.gg"), "/", "Mozilla/5.0 (X11; Linux)");
    let response = handle_request(registry.clone(), config, req).await.unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(LOCATION).unwrap(),
        &format!(
            "https://tunnl.gg/#/warning?redirect=https%3A%2F%2F{SUB}.tunnl.gg%2F&subdomain={SUB}.tunnl.gg"
        )
    );
    registry.stop().await;
}

#[tokio::test]
async fn skip_header_and_cookie_bypass_the_interstitial() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    setup_tunnel(&registry).await;
    let host = format!("{SUB}.tunnl.gg");

    let mut req = gw_request(&host, "/", "Mozilla/5.0");
    req.headers_mut().insert(
        "tunnl-skip-browser-warning",
        http::HeaderValue::from_static("yes"),
    );
    let response = handle_request(registry.clone(), config.clone(), req)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut req = gw_request(&host, "/", "Mozilla/5.0");
    req.headers_mut().insert(
        "cookie",
        http::HeaderValue::from_str(&format!("tunnl_warned_{SUB}=1")).unwrap(),
    );
    let response = handle_request(registry.clone(), config, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    registry.stop().await;
}

#[tokio::test]
async fn unknown_hosts_and_subdomains_are_refused() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());

    // host outside the domain
    let req = gw_request("example.com", "/", "curl/8.0");
    let response = handle_request(registry.clone(), config.clone(), req)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // malformed subdomain is rejected before any lookup
    let req = gw_request("not-a-subdomain.tunnl.gg", "/", "curl/8.0");
    let response = handle_request(registry.clone(), config.clone(), req)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // valid shape but no live tunnel
    let req = gw_request("happy-tiger-00000000.tunnl.gg", "/", "curl/8.0");
    let response = handle_request(registry.clone(), config, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    registry.stop().await;
}

#[tokio::test]
async fn oversized_declared_bodies_are_refused() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    setup_tunnel(&registry).await;

    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("host", format!("{SUB}.tunnl.gg"))
        .header("content-length", (129 * 1024 * 1024u64).to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = handle_request(registry.clone(), config, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    registry.stop().await;
}

#[tokio::test]
async fn rate_limited_tunnels_get_429_and_repeat_offenders_are_killed() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    let tunnel = setup_tunnel(&registry).await;
    let closer = Arc::new(CountingCloser(AtomicUsize::new(0)));
    tunnel.set_ssh(closer.clone());
    let host = format!("{SUB}.tunnl.gg");

    // drain the burst allowance
    while tunnel.allow_request() {}

    let response = handle_request(
        registry.clone(),
        config.clone(),
        gw_request(&host, "/", "curl/8.0"),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
    assert_eq!(closer.0.load(Ordering::SeqCst), 0);

    // nine more violations reach the kill threshold
    for _ in 0..8 {
        assert!(!tunnel.record_violation());
    }
    // drop any token that refilled while the test was running
    while tunnel.allow_request() {}
    let response = handle_request(
        registry.clone(),
        config,
        gw_request(&host, "/", "curl/8.0"),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    assert_eq!(closer.0.load(Ordering::SeqCst), 1);
    assert!(registry.abuse().block_expiry(tunnel.client_ip()).is_some());
    registry.stop().await;
}

#[tokio::test]
async fn backend_failure_yields_bad_gateway() {
    let registry = Registry::new();
    let config = Arc::new(Config::default());
    // register a tunnel pointing at a closed port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);
    registry.register_tunnel(SUB, dead_addr, "localhost", 80, "203.0.113.7".parse().unwrap());

    let req = gw_request(&format!("{SUB}.tunnl.gg"), "/", "curl/8.0");
    let response = handle_request(registry.clone(), config, req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    registry.stop().await;
}

// A minimal hyper origin, also exercised by the reverse-proxy path.
mod origin_server {
    use std::convert::Infallible;

    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };
        let reply = if body.is_empty() {
            format!("origin {method} {path}")
        } else {
            format!("origin {method} {path}: {}", String::from_utf8_lossy(&body))
        };
        Ok(Response::new(Full::new(Bytes::from(reply))))
    }

    pub(super) async fn run(listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service_fn(echo))
                    .await
                {
                    eprintln!("origin connection error: {err:?}");
                }
            });
        }
    }
}
