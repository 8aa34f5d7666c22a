//! Plain-HTTP listener that 301-redirects gateway hosts to HTTPS.

use std::convert::Infallible;
use std::sync::Arc;

use http::header::{HOST, LOCATION};
use http::{HeaderValue, StatusCode};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::gateway::{ProxyBody, text_response};

/// Accepts plain-HTTP connections and redirects them until cancelled.
pub async fn run_redirect_listener(
    config: Arc<Config>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                accepted.std_context("failed to accept HTTP connection")?
            }
        };
        let config = config.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let config = config.clone();
                async move { handle_redirect(config, req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, "HTTP connection ended: {err:#}");
            }
        });
    }
    Ok(())
}

/// Redirects hosts under the configured domain to `https://`; anything else
/// is a bad request.
pub async fn handle_redirect<B>(
    config: Arc<Config>,
    req: Request<B>,
) -> Result<Response<ProxyBody>, Infallible> {
    let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
    };
    let bare_host = strip_port(host);
    let suffix = format!(".{}", config.domain);
    if bare_host != config.domain && !bare_host.ends_with(suffix.as_str()) {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
    }

    let target = format!(
        "https://{}{}",
        host,
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "Moved Permanently");
    if let Ok(value) = HeaderValue::from_str(&target) {
        response.headers_mut().insert(LOCATION, value);
    }
    Ok(response)
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}
