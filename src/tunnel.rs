use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{
    BURST_SIZE, INACTIVITY_TIMEOUT, MAX_TUNNEL_LIFETIME, RATE_LIMIT_VIOLATIONS_MAX,
    REQUESTS_PER_SECOND,
};
use crate::limiter::RateLimiter;
use crate::logsink::RequestLogger;

/// Capability to force-close the SSH connection that owns a tunnel.
///
/// The tunnel never owns the SSH session's lifetime; it only holds this
/// back-reference, nilled under lock on use so at most one close happens.
pub trait ForcedClose: Send + Sync {
    fn force_close(&self);
}

/// An active tunnel: a registered subdomain bound to a loopback listener
/// that proxies to a specific SSH connection.
#[derive(derive_more::Debug)]
pub struct Tunnel {
    subdomain: String,
    local_addr: SocketAddr,
    bind_addr: String,
    bind_port: u32,
    client_ip: IpAddr,
    created_at: Instant,
    expires_at: DateTime<Utc>,
    limiter: RateLimiter,
    #[debug(skip)]
    http_client: reqwest::Client,
    shutdown: CancellationToken,
    #[debug(skip)]
    state: Mutex<TunnelState>,
}

struct TunnelState {
    last_active: Instant,
    violations: u32,
    ssh: Option<Arc<dyn ForcedClose>>,
    logger: Option<Arc<RequestLogger>>,
}

impl Tunnel {
    pub fn new(
        subdomain: &str,
        local_addr: SocketAddr,
        bind_addr: &str,
        bind_port: u32,
        client_ip: IpAddr,
    ) -> Self {
        let now = Instant::now();
        Self {
            subdomain: subdomain.to_string(),
            local_addr,
            bind_addr: bind_addr.to_string(),
            bind_port,
            client_ip,
            created_at: now,
            expires_at: Utc::now() + MAX_TUNNEL_LIFETIME,
            limiter: RateLimiter::new(REQUESTS_PER_SECOND, BURST_SIZE),
            http_client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build proxy HTTP client"),
            shutdown: CancellationToken::new(),
            state: Mutex::new(TunnelState {
                last_active: now,
                violations: 0,
                ssh: None,
                logger: None,
            }),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Address of the loopback listener the gateway dials.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bind address requested in the client's `tcpip-forward`.
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Bind port requested in the client's `tcpip-forward`.
    pub fn bind_port(&self) -> u32 {
        self.bind_port
    }

    /// IP of the SSH client that created this tunnel.
    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    /// Wall-clock instant at which the lifetime budget runs out.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// HTTP client used to proxy requests into this tunnel.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Cancelled when the tunnel closes; gates the listener accept loop.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Advances the last-activity timestamp.
    pub fn touch(&self) {
        self.state.lock().unwrap().last_active = Instant::now();
    }

    /// Admits or denies one HTTP request via the token bucket.
    pub fn allow_request(&self) -> bool {
        self.limiter.allow()
    }

    /// Records one rate-limit violation; returns true when the kill
    /// threshold has been reached.
    pub fn record_violation(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.violations += 1;
        state.violations >= RATE_LIMIT_VIOLATIONS_MAX
    }

    /// Whether the idle or lifetime budget has run out.
    pub fn is_expired(&self) -> bool {
        let idle = self.state.lock().unwrap().last_active.elapsed();
        idle > INACTIVITY_TIMEOUT || self.created_at.elapsed() > MAX_TUNNEL_LIFETIME
    }

    /// The smaller of the two remaining budgets, for display.
    pub fn time_remaining(&self) -> Duration {
        let idle = self.state.lock().unwrap().last_active.elapsed();
        let idle_remaining = INACTIVITY_TIMEOUT.saturating_sub(idle);
        let lifetime_remaining = MAX_TUNNEL_LIFETIME.saturating_sub(self.created_at.elapsed());
        idle_remaining.min(lifetime_remaining)
    }

    /// Captures the owning SSH connection for forced closure.
    pub fn set_ssh(&self, conn: Arc<dyn ForcedClose>) {
        self.state.lock().unwrap().ssh = Some(conn);
    }

    /// Force-closes the owning SSH connection. Safe to call any number of
    /// times; the handle is taken under lock so at most one close occurs.
    pub fn close_ssh(&self) {
        let conn = self.state.lock().unwrap().ssh.take();
        if let Some(conn) = conn {
            conn.force_close();
        }
    }

    pub fn set_logger(&self, logger: Arc<RequestLogger>) {
        self.state.lock().unwrap().logger = Some(logger);
    }

    pub fn logger(&self) -> Option<Arc<RequestLogger>> {
        self.state.lock().unwrap().logger.clone()
    }

    /// Closes the tunnel: stops the listener accept loop (which drops the
    /// listener) and closes the request logger.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let logger = self.state.lock().unwrap().logger.take();
        if let Some(logger) = logger {
            logger.close().await;
        }
    }
}
