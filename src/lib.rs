//! SSH-based reverse-tunneling gateway.
//!
//! External SSH clients request a remote TCP forward (`ssh -R`), the server
//! assigns each connection a unique public subdomain, terminates TLS for that
//! subdomain on a shared HTTPS listener, and proxies HTTP/WebSocket traffic
//! back to the client over the SSH connection.

/// Per-IP connection-rate tracking, violation counting, and temporary blocks.
pub mod abuse;
/// Environment-driven configuration and server-wide tuning constants.
pub mod config;
/// The HTTPS reverse-proxy and WebSocket gateway.
pub mod gateway;
/// Per-tunnel token-bucket request admission.
pub mod limiter;
/// Non-blocking request log sink draining onto the SSH session channel.
pub mod logsink;
/// HTTP-to-HTTPS redirect listener.
pub mod redirect;
/// Subdomain-keyed tunnel registry and admission control.
pub mod registry;
/// The SSH acceptor: remote-forward negotiation and tunnel lifetime.
pub mod ssh;
/// Loopback-only JSON stats endpoint.
pub mod stats;
/// Memorable subdomain minting and validation.
pub mod subdomain;
/// TLS server configuration from certificate files.
pub mod tls;
/// A registered tunnel: listener address, rate limiter, SSH back-handle.
pub mod tunnel;

pub(crate) mod util;

#[cfg(test)]
mod tests;
