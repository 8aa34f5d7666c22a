//! Loopback-only JSON stats endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{ProxyBody, full_body, text_response};
use crate::registry::Registry;

/// Serves the stats endpoint until cancelled.
pub async fn run_stats_listener(
    registry: Arc<Registry>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                accepted.std_context("failed to accept stats connection")?
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let registry = registry.clone();
                async move { handle_stats(registry, peer, req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, "stats connection ended: {err:#}");
            }
        });
    }
    Ok(())
}

/// Returns the JSON snapshot; non-loopback peers are refused.
pub async fn handle_stats<B>(
    registry: Arc<Registry>,
    peer: SocketAddr,
    req: Request<B>,
) -> Result<Response<ProxyBody>, Infallible> {
    if !peer.ip().is_loopback() {
        return Ok(text_response(StatusCode::FORBIDDEN, "Forbidden"));
    }

    let include_subdomains = req
        .uri()
        .query()
        .map(|q| q.split('&').any(|pair| pair == "subdomains=true"))
        .unwrap_or(false);
    let stats = registry.stats(include_subdomains);

    let body = match serde_json::to_string(&stats) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to encode stats: {err:#}");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ));
        }
    };
    let mut response = Response::new(full_body(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> Request<()> {
        Request::builder().uri(target).body(()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_non_loopback_peers() {
        let registry = Registry::new();
        let peer: SocketAddr = "203.0.113.7:4242".parse().unwrap();
        let response = handle_stats(registry.clone(), peer, request("/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn serves_json_snapshot_to_loopback() {
        let registry = Registry::new();
        registry.register_tunnel(
            "happy-tiger-abcdef01",
            "127.0.0.1:1".parse().unwrap(),
            "localhost",
            80,
            "203.0.113.7".parse().unwrap(),
        );
        let peer: SocketAddr = "127.0.0.1:4242".parse().unwrap();

        let response = handle_stats(registry.clone(), peer, request("/?subdomains=true"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["active_tunnels"], 1);
        assert_eq!(value["subdomains"][0], "happy-tiger-abcdef01");
        assert!(value.get("blocked_ips").is_some());

        // without the flag the list is omitted entirely
        let response = handle_stats(registry.clone(), peer, request("/"))
            .await
            .unwrap();
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.get("subdomains").is_none());
        registry.stop().await;
    }
}
