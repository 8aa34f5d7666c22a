use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use n0_error::{Result, anyerr, e, stack_error};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info};

use crate::abuse::AbuseTracker;
use crate::config::{MAX_TOTAL_TUNNELS, MAX_TUNNELS_PER_IP};
use crate::logsink::format_duration;
use crate::subdomain;
use crate::tunnel::{ForcedClose, Tunnel};

/// Why a new SSH connection was refused admission.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum AdmissionError {
    #[error("IP is temporarily blocked. Try again in {remaining}")]
    Blocked { remaining: String },
    #[error(
        "connection rate limit exceeded: max {max} connections per minute. Repeated violations will result in a temporary block"
    )]
    RateLimited { max: usize },
    #[error("rate limit exceeded: max {max} tunnels per IP")]
    PerIpLimit { max: usize },
    #[error("server capacity reached: max {max} total tunnels")]
    Capacity { max: usize },
}

/// JSON snapshot served by the stats endpoint.
#[derive(Debug, Serialize)]
pub struct Stats {
    pub active_tunnels: usize,
    pub unique_ips: usize,
    pub total_connections: u64,
    pub total_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomains: Option<Vec<String>>,
    pub blocked_ips: usize,
    pub total_blocked: u64,
    pub total_rate_limited: u64,
}

#[derive(derive_more::Debug)]
struct RegisteredConn {
    id: u64,
    #[debug("Arc<dyn ForcedClose>")]
    closer: Arc<dyn ForcedClose>,
}

#[derive(Debug, Default)]
struct State {
    tunnels: HashMap<String, Arc<Tunnel>>,
    ip_connections: HashMap<IpAddr, usize>,
    ssh_conns: HashMap<IpAddr, Vec<RegisteredConn>>,
}

/// The tunnel registry: subdomain-keyed tunnels, per-IP reservation counts,
/// per-IP SSH handles for forced teardown, and global counters.
#[derive(derive_more::Debug)]
pub struct Registry {
    state: RwLock<State>,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
    abuse: AbuseTracker,
}

impl Registry {
    /// Creates the registry and wires the abuse tracker's block callback to
    /// force-close every SSH connection of a newly blocked IP.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            state: RwLock::new(State::default()),
            total_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            abuse: AbuseTracker::new(),
        });

        // The callback holds a weak reference and runs on its own task so a
        // misbehaving teardown cannot take the tracker down with it.
        let weak: Weak<Registry> = Arc::downgrade(&registry);
        registry.abuse.set_on_block(Box::new(move |ip| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let closed = registry.close_all_for_ip(ip);
                if closed > 0 {
                    info!(%ip, closed, "closed SSH connections for blocked IP");
                }
            });
        }));

        registry
    }

    /// Atomically admits a new SSH connection from `ip` and reserves a
    /// tunnel slot. Every success must be paired with one [`decrement_ip`].
    ///
    /// [`decrement_ip`]: Registry::decrement_ip
    pub fn check_and_reserve(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        if let Some(expiry) = self.abuse.block_expiry(ip) {
            let remaining = expiry.saturating_duration_since(Instant::now());
            return Err(e_blocked(remaining));
        }
        if !self.abuse.check_connection_rate(ip) {
            return Err(e!(AdmissionError::RateLimited {
                max: crate::config::MAX_CONNECTIONS_PER_MINUTE
            }));
        }

        let mut state = self.state.write().unwrap();
        let count = state.ip_connections.get(&ip).copied().unwrap_or(0);
        if count >= MAX_TUNNELS_PER_IP {
            return Err(e!(AdmissionError::PerIpLimit {
                max: MAX_TUNNELS_PER_IP
            }));
        }
        if state.tunnels.len() >= MAX_TOTAL_TUNNELS {
            return Err(e!(AdmissionError::Capacity {
                max: MAX_TOTAL_TUNNELS
            }));
        }
        *state.ip_connections.entry(ip).or_insert(0) += 1;
        Ok(())
    }

    /// Releases a reservation made by a successful `check_and_reserve`.
    pub fn decrement_ip(&self, ip: IpAddr) {
        let mut state = self.state.write().unwrap();
        if let Some(count) = state.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.ip_connections.remove(&ip);
            }
        }
    }

    /// Constructs and inserts a tunnel for an already reserved slot.
    pub fn register_tunnel(
        &self,
        sub: &str,
        local_addr: SocketAddr,
        bind_addr: &str,
        bind_port: u32,
        client_ip: IpAddr,
    ) -> Arc<Tunnel> {
        let tunnel = Arc::new(Tunnel::new(sub, local_addr, bind_addr, bind_port, client_ip));
        let mut state = self.state.write().unwrap();
        state.tunnels.insert(sub.to_string(), tunnel.clone());
        tunnel
    }

    /// Closes and removes a tunnel if present. Idempotent.
    pub async fn remove_tunnel(&self, sub: &str) {
        let tunnel = self.state.write().unwrap().tunnels.remove(sub);
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
        }
    }

    pub fn get_tunnel(&self, sub: &str) -> Option<Arc<Tunnel>> {
        self.state.read().unwrap().tunnels.get(sub).cloned()
    }

    /// Tracks an SSH connection so it can be force-closed if its IP is
    /// blocked. Paired with [`unregister_ssh_conn`] by connection id.
    ///
    /// [`unregister_ssh_conn`]: Registry::unregister_ssh_conn
    pub fn register_ssh_conn(&self, ip: IpAddr, id: u64, closer: Arc<dyn ForcedClose>) {
        let mut state = self.state.write().unwrap();
        state
            .ssh_conns
            .entry(ip)
            .or_default()
            .push(RegisteredConn { id, closer });
    }

    pub fn unregister_ssh_conn(&self, ip: IpAddr, id: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(conns) = state.ssh_conns.get_mut(&ip) {
            conns.retain(|c| c.id != id);
            if conns.is_empty() {
                state.ssh_conns.remove(&ip);
            }
        }
    }

    /// Takes every tracked SSH connection for `ip` and force-closes it,
    /// returning the count. Each connection's own teardown then removes its
    /// tunnel and releases its reservation.
    pub fn close_all_for_ip(&self, ip: IpAddr) -> usize {
        let conns = self.state.write().unwrap().ssh_conns.remove(&ip);
        let conns = conns.unwrap_or_default();
        for conn in &conns {
            conn.closer.force_close();
        }
        conns.len()
    }

    /// Mints a subdomain absent from the live map, giving up after a few
    /// collisions.
    pub fn generate_unique_subdomain(&self) -> Result<String> {
        const MAX_ATTEMPTS: usize = 10;
        for _ in 0..MAX_ATTEMPTS {
            let sub = subdomain::generate()?;
            if !self.state.read().unwrap().tunnels.contains_key(&sub) {
                return Ok(sub);
            }
        }
        error!("subdomain space exhausted after {MAX_ATTEMPTS} attempts");
        Err(anyerr!(
            "failed to generate unique subdomain after {MAX_ATTEMPTS} attempts"
        ))
    }

    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Blocks `ip` via the abuse tracker, cascading into SSH teardown.
    pub fn block_ip(&self, ip: IpAddr) {
        self.abuse.block(ip);
    }

    pub fn abuse(&self) -> &AbuseTracker {
        &self.abuse
    }

    /// Snapshot for the stats endpoint.
    pub fn stats(&self, include_subdomains: bool) -> Stats {
        let (blocked_ips, total_blocked, total_rate_limited) = self.abuse.stats();
        let state = self.state.read().unwrap();
        Stats {
            active_tunnels: state.tunnels.len(),
            unique_ips: state.ip_connections.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            subdomains: include_subdomains
                .then(|| state.tunnels.keys().cloned().collect()),
            blocked_ips,
            total_blocked,
            total_rate_limited,
        }
    }

    /// Stops background work (the abuse eviction loop).
    pub async fn stop(&self) {
        self.abuse.stop().await;
    }
}

fn e_blocked(remaining: std::time::Duration) -> AdmissionError {
    // round up so a nearly elapsed block still reads as at least a minute
    let minutes = remaining.as_secs().div_ceil(60).max(1) * 60;
    e!(AdmissionError::Blocked {
        remaining: format_duration(std::time::Duration::from_secs(minutes))
    })
}
