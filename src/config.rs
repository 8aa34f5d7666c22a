use std::env;
use std::time::Duration;

/// Maximum number of concurrently reserved tunnels per client IP.
pub const MAX_TUNNELS_PER_IP: usize = 3;
/// Server-wide cap on live tunnels.
pub const MAX_TOTAL_TUNNELS: usize = 1000;

/// A tunnel with no data-plane traffic for this long is expired.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
/// Hard lifetime cap per tunnel regardless of activity.
pub const MAX_TUNNEL_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Token-bucket refill rate for HTTP requests, per tunnel.
pub const REQUESTS_PER_SECOND: f64 = 10.0;
/// Token-bucket burst capacity, per tunnel.
pub const BURST_SIZE: usize = 20;
/// Rate-limit violations before a tunnel is killed or an IP is blocked.
pub const RATE_LIMIT_VIOLATIONS_MAX: u32 = 10;

/// New SSH connections allowed per IP within [`CONNECTION_RATE_WINDOW`].
pub const MAX_CONNECTIONS_PER_MINUTE: usize = 10;
/// Sliding window for the per-IP connection rate.
pub const CONNECTION_RATE_WINDOW: Duration = Duration::from_secs(60);
/// How long a blocked IP stays blocked.
pub const BLOCK_DURATION: Duration = Duration::from_secs(60 * 60);
/// Interval of the abuse tracker's eviction loop.
pub const ABUSE_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Cap on HTTP request bodies entering a tunnel.
pub const MAX_REQUEST_BODY_BYTES: u64 = 128 * 1024 * 1024;
/// Cap on HTTP response bodies leaving a tunnel.
pub const MAX_RESPONSE_BODY_BYTES: u64 = 128 * 1024 * 1024;
/// Per-direction byte cap for WebSocket connections.
pub const MAX_WEBSOCKET_TRANSFER: u64 = 1024 * 1024 * 1024;
/// Per-read idle timeout for WebSocket copies.
pub const WEBSOCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
/// Dial timeout for the WebSocket backend connection.
pub const WEBSOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest accepted HTTP header section.
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Budget for the SSH protocol handshake.
pub const SSH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget from handshake to the first `tcpip-forward` request.
pub const FIRST_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget from the first forward to the client's `session` channel.
pub const SESSION_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a rejected connection may wait for a session channel to
/// receive its error message.
pub const REJECTED_SESSION_TIMEOUT: Duration = Duration::from_secs(3);
/// Interval of the per-connection tunnel expiry check.
pub const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for in-flight work at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Capacity of the per-session request log channel.
pub const LOG_BUFFER_SIZE: usize = 128;

/// Cookie prefix recording that the browser warning was acknowledged.
pub const WARNING_COOKIE_NAME: &str = "tunnl_warned";
/// Request header that bypasses the browser warning interstitial.
pub const SKIP_WARNING_HEADER: &str = "tunnl-skip-browser-warning";

/// Runtime configuration, loaded from the environment with compiled defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub ssh_addr: String,
    pub http_addr: String,
    pub https_addr: String,
    pub stats_addr: String,
    pub host_key_path: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh_addr: ":22".into(),
            http_addr: ":80".into(),
            https_addr: ":443".into(),
            stats_addr: "127.0.0.1:9090".into(),
            host_key_path: "host_key".into(),
            tls_cert: "/etc/letsencrypt/live/tunnl.gg/fullchain.pem".into(),
            tls_key: "/etc/letsencrypt/live/tunnl.gg/privkey.pem".into(),
            domain: "tunnl.gg".into(),
        }
    }
}

impl Config {
    /// Loads configuration, overriding defaults from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let overrides = [
            ("SSH_ADDR", &mut config.ssh_addr),
            ("HTTP_ADDR", &mut config.http_addr),
            ("HTTPS_ADDR", &mut config.https_addr),
            ("STATS_ADDR", &mut config.stats_addr),
            ("HOST_KEY_PATH", &mut config.host_key_path),
            ("TLS_CERT", &mut config.tls_cert),
            ("TLS_KEY", &mut config.tls_key),
            ("DOMAIN", &mut config.domain),
        ];
        for (name, slot) in overrides {
            if let Ok(value) = env::var(name) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
        config
    }

    /// Normalizes a listen address: a bare `:port` binds all interfaces.
    pub fn bind_addr(addr: &str) -> String {
        if let Some(port) = addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            addr.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_expands_bare_port() {
        assert_eq!(Config::bind_addr(":443"), "0.0.0.0:443");
        assert_eq!(Config::bind_addr("127.0.0.1:9090"), "127.0.0.1:9090");
    }
}
