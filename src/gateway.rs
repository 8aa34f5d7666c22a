//! The HTTPS gateway: subdomain lookup, admission, browser interstitial,
//! reverse proxy, and the WebSocket hijack path.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, RETRY_AFTER,
    TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body::{Body, Frame};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use n0_error::{Result, StackResultExt, StdResultExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn, warn_span};

use crate::config::{
    Config, MAX_HEADER_BYTES, MAX_REQUEST_BODY_BYTES, MAX_RESPONSE_BODY_BYTES,
    MAX_WEBSOCKET_TRANSFER, SKIP_WARNING_HEADER, WARNING_COOKIE_NAME, WEBSOCKET_DIAL_TIMEOUT,
    WEBSOCKET_IDLE_TIMEOUT,
};
use crate::registry::Registry;
use crate::subdomain;
use crate::tunnel::Tunnel;
use crate::util::{Prebuffered, copy_with_limits};

/// Response body type used across the HTTP listeners.
pub(crate) type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Characters escaped in redirect query parameters; everything outside the
/// URL-safe set.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const BROWSER_KEYWORDS: &[&str] = &["mozilla", "chrome", "safari", "firefox", "edge", "opera"];

/// Accepts TLS connections and serves the gateway until cancelled.
pub async fn run_https_listener(
    registry: Arc<Registry>,
    config: Arc<Config>,
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    let mut conn_id: u64 = 0;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                accepted.std_context("failed to accept HTTPS connection")?
            }
        };
        conn_id += 1;
        let registry = registry.clone();
        let config = config.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(
            async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(%peer, "TLS accept failed: {err:#}");
                        return;
                    }
                };
                let io = TokioIo::new(tls_stream);
                let service =
                    service_fn(move |req| handle_request(registry.clone(), config.clone(), req));
                let conn = http1::Builder::new()
                    .max_buf_size(MAX_HEADER_BYTES)
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(err) = conn.await {
                    debug!(%peer, "HTTPS connection ended: {err:#}");
                }
            }
            .instrument(warn_span!("gw-conn", id = conn_id)),
        );
    }
    Ok(())
}

/// Serves one gateway request. Every response leaves with the standard
/// security header set.
pub async fn handle_request<B>(
    registry: Arc<Registry>,
    config: Arc<Config>,
    req: Request<B>,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let mut response = route_request(registry, config, req).await;
    apply_security_headers(response.headers_mut());
    Ok(response)
}

async fn route_request<B>(
    registry: Arc<Registry>,
    config: Arc<Config>,
    req: Request<B>,
) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    // declared request body cap; chunked bodies are capped in-stream below
    if declared_content_length(req.headers()).is_some_and(|len| len > MAX_REQUEST_BODY_BYTES) {
        return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Request Entity Too Large");
    }

    let Some(host) = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return text_response(StatusCode::BAD_REQUEST, "Bad Request");
    };
    let bare_host = strip_port(&host);
    let suffix = format!(".{}", config.domain);
    let Some(sub) = bare_host.strip_suffix(suffix.as_str()).map(str::to_owned) else {
        return text_response(StatusCode::BAD_REQUEST, "Bad Request");
    };
    if !subdomain::is_valid(&sub) {
        return text_response(StatusCode::BAD_REQUEST, "Bad Request");
    }
    let Some(tunnel) = registry.get_tunnel(&sub) else {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    };

    if !tunnel.allow_request() {
        if tunnel.record_violation() {
            warn!(
                subdomain = %sub,
                ip = %tunnel.client_ip(),
                "tunnel killed for rate-limit abuse, blocking client IP"
            );
            registry.block_ip(tunnel.client_ip());
            tunnel.close_ssh();
        }
        let mut response = text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        return response;
    }

    tunnel.touch();
    registry.increment_requests();

    let skip_warning = req
        .headers()
        .get(SKIP_WARNING_HEADER)
        .is_some_and(|v| !v.is_empty());
    if is_browser_request(req.headers())
        && !skip_warning
        && !has_warning_cookie(req.headers(), &sub)
    {
        return redirect_to_warning(&config, &host, req.uri(), &sub);
    }

    if is_websocket_request(req.headers()) {
        return handle_websocket(req, tunnel).await;
    }
    proxy_request(req, tunnel).await
}

/// Reverse-proxies one request to the tunnel's loopback listener, streaming
/// both bodies and logging the outcome.
async fn proxy_request<B>(req: Request<B>, tunnel: Arc<Tunnel>) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let started = tokio::time::Instant::now();
    let method = req.method().clone();
    let log_path = req.uri().path().to_string();

    let response = forward_to_backend(req, &tunnel).await;

    if let Some(logger) = tunnel.logger() {
        logger.log_request(
            method.as_str(),
            &log_path,
            response.status().as_u16(),
            started.elapsed(),
        );
    }
    response
}

async fn forward_to_backend<B>(req: Request<B>, tunnel: &Arc<Tunnel>) -> Response<ProxyBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let url = format!("http://{}{}", tunnel.local_addr(), path_and_query);
    let method = req.method().clone();

    // The original Host header rides through; hop-by-hop headers do not.
    let mut headers = req.headers().clone();
    filter_hop_by_hop_headers(&mut headers);
    headers.remove(CONTENT_LENGTH);

    let has_body = request_has_body(req.headers());
    let builder = tunnel
        .http_client()
        .request(method, url)
        .headers(headers);
    let sent = if has_body {
        builder
            .body(reqwest::Body::wrap_stream(capped_request_body(
                req.into_body(),
            )))
            .send()
            .await
    } else {
        builder.send().await
    };

    let upstream = match sent {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(subdomain = %tunnel.subdomain(), "proxy error: {err:#}");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    if upstream
        .content_length()
        .is_some_and(|len| len > MAX_RESPONSE_BODY_BYTES)
    {
        warn!(subdomain = %tunnel.subdomain(), "response exceeds size limit");
        return text_response(StatusCode::BAD_GATEWAY, "Response Too Large");
    }

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    filter_hop_by_hop_headers(&mut headers);

    let mut response = Response::new(capped_response_body(upstream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn request_has_body(headers: &HeaderMap) -> bool {
    declared_content_length(headers).is_some_and(|len| len > 0)
        || headers.contains_key(TRANSFER_ENCODING)
}

fn capped_request_body<B>(body: B) -> impl futures::Stream<Item = io::Result<Bytes>> + Send
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let mut observed: u64 = 0;
    BodyStream::new(body).map(move |frame| match frame {
        Ok(frame) => match frame.into_data() {
            Ok(data) => {
                observed += data.len() as u64;
                if observed > MAX_REQUEST_BODY_BYTES {
                    Err(io::Error::other("request body exceeds limit"))
                } else {
                    Ok(data)
                }
            }
            Err(_) => Ok(Bytes::new()),
        },
        Err(err) => Err(io::Error::other(err)),
    })
}

fn capped_response_body(upstream: reqwest::Response) -> ProxyBody {
    let mut observed: u64 = 0;
    let stream = upstream.bytes_stream().map(move |chunk| match chunk {
        Ok(data) => {
            observed += data.len() as u64;
            if observed > MAX_RESPONSE_BODY_BYTES {
                Err(io::Error::other("response body exceeds limit"))
            } else {
                Ok(Frame::data(data))
            }
        }
        Err(err) => Err(io::Error::other(err)),
    });
    StreamBody::new(stream).boxed_unsync()
}

/// The WebSocket hijack path: dial the backend, replay the request head,
/// mirror the backend's response, and on 101 pipe bytes both ways under
/// idle and transfer limits.
async fn handle_websocket<B>(mut req: Request<B>, tunnel: Arc<Tunnel>) -> Response<ProxyBody>
where
    B: Send + 'static,
{
    let backend = match timeout(
        WEBSOCKET_DIAL_TIMEOUT,
        TcpStream::connect(tunnel.local_addr()),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(subdomain = %tunnel.subdomain(), "websocket backend dial failed: {err:#}");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
        Err(_) => {
            warn!(subdomain = %tunnel.subdomain(), "websocket backend dial timed out");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let upgrade = hyper::upgrade::on(&mut req);
    let path = req.uri().path().to_string();
    let head = serialize_request_head(&req);

    let (backend_read, mut backend_write) = backend.into_split();
    if let Err(err) = backend_write.write_all(&head).await {
        warn!(subdomain = %tunnel.subdomain(), "websocket request write failed: {err:#}");
        return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
    }

    let mut backend_read = Prebuffered::new(backend_read, MAX_HEADER_BYTES);
    let head = match read_response_head(&mut backend_read).await {
        Ok(head) => head,
        Err(err) => {
            warn!(subdomain = %tunnel.subdomain(), "websocket backend response invalid: {err:#}");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let status = head.status;
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    *response.headers_mut() = head.headers;
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return response;
    }

    let logger = tunnel.logger();
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                debug!("client upgrade failed: {err:#}");
                return;
            }
        };
        if let Some(logger) = &logger {
            logger.log_ws_open(&path);
        }
        let started = tokio::time::Instant::now();
        let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
        let ((client_bytes, to_backend), (backend_bytes, to_client)) = tokio::join!(
            async {
                let res = copy_with_limits(
                    &mut client_read,
                    &mut backend_write,
                    MAX_WEBSOCKET_TRANSFER,
                    WEBSOCKET_IDLE_TIMEOUT,
                )
                .await;
                // half-close toward the backend so it observes EOF
                backend_write.shutdown().await.ok();
                res
            },
            async {
                let res = copy_with_limits(
                    &mut backend_read,
                    &mut client_write,
                    MAX_WEBSOCKET_TRANSFER,
                    WEBSOCKET_IDLE_TIMEOUT,
                )
                .await;
                client_write.shutdown().await.ok();
                res
            },
        );
        if let Err(err) = to_backend {
            debug!("websocket client-to-backend copy ended: {err:#}");
        }
        if let Err(err) = to_client {
            debug!("websocket backend-to-client copy ended: {err:#}");
        }
        if let Some(logger) = &logger {
            logger.log_ws_close(&path, started.elapsed(), client_bytes + backend_bytes);
        }
    });
    response
}

struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut Prebuffered<R>,
) -> Result<ResponseHead> {
    loop {
        if let Some((len, head)) = parse_response_head(reader.buffer())? {
            reader.discard(len);
            return Ok(head);
        }
        if reader.is_full() {
            return Err(n0_error::anyerr!("response header section too large"));
        }
        let n = reader.buffer_more().await.anyerr()?;
        if n == 0 {
            return Err(n0_error::anyerr!("backend closed before responding"));
        }
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(usize, ResponseHead)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf).std_context("invalid backend response")? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(len) => {
            let code = res.code.context("missing response status code")?;
            let status = StatusCode::from_u16(code).std_context("invalid response status code")?;
            let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                let value = HeaderValue::from_bytes(h.value).ok()?;
                Some((name, value))
            }));
            Ok(Some((len, ResponseHead { status, headers })))
        }
    }
}

fn serialize_request_head<B>(req: &Request<B>) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), target).into_bytes();
    for (name, value) in req.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn redirect_to_warning(config: &Config, host: &str, uri: &http::Uri, sub: &str) -> Response<ProxyBody> {
    let original = format!(
        "https://{}{}",
        host,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    let full_subdomain = format!("{}.{}", sub, config.domain);
    let location = format!(
        "https://{}/#/warning?redirect={}&subdomain={}",
        config.domain,
        utf8_percent_encode(&original, QUERY_ENCODE),
        utf8_percent_encode(&full_subdomain, QUERY_ENCODE),
    );
    let mut response = text_response(StatusCode::TEMPORARY_REDIRECT, "Temporary Redirect");
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_browser_request(headers: &HeaderMap) -> bool {
    let Some(ua) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let ua = ua.to_ascii_lowercase();
    BROWSER_KEYWORDS.iter().any(|kw| ua.contains(kw))
}

fn has_warning_cookie(headers: &HeaderMap, sub: &str) -> bool {
    let name = format!("{WARNING_COOKIE_NAME}_{sub}");
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name && bool::from(value.as_bytes().ct_eq(b"1")) {
                    return true;
                }
            }
        }
    }
    false
}

fn is_websocket_request(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    upgrade.eq_ignore_ascii_case("websocket")
        && connection.to_ascii_lowercase().contains("upgrade")
}

/// Strips hop-by-hop headers, including any named by `Connection`, per
/// RFC 9110.
fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in connection_named {
        headers.remove(name.as_str());
    }
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub(crate) fn full_body(text: String) -> ProxyBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
