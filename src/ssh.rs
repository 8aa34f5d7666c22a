//! The SSH acceptor.
//!
//! Each inbound connection walks a small state machine: handshake →
//! admission → `tcpip-forward` → session channel → live → teardown. The
//! per-connection task drives the deadlines and owns the teardown; the
//! russh handler feeds it events as the client negotiates.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use n0_error::{Result, StdResultExt};
use russh::keys::PrivateKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::config::{
    Config, EXPIRY_CHECK_INTERVAL, FIRST_FORWARD_TIMEOUT, INACTIVITY_TIMEOUT, LOG_BUFFER_SIZE,
    REJECTED_SESSION_TIMEOUT, SESSION_CHANNEL_TIMEOUT, SSH_HANDSHAKE_TIMEOUT,
};
use crate::logsink::{RequestLogger, format_duration};
use crate::registry::Registry;
use crate::tunnel::{ForcedClose, Tunnel};
use crate::util::forward_bidi;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_GRAY: &str = "\x1b[38;5;245m";
const ANSI_BOLD_GREEN: &str = "\x1b[1;32m";
const ANSI_PURPLE: &str = "\x1b[38;5;141m";

/// Loads the Ed25519 host key, generating and persisting one (0600) on
/// first start.
pub async fn load_or_generate_host_key(path: &str) -> Result<PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    let path = Path::new(path);
    if path.exists() {
        russh::keys::load_secret_key(path, None).std_context("failed to load host key")
    } else {
        info!(path = %path.display(), "generating new host key");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .std_context("failed to generate host key")?;
        let encoded = key
            .to_openssh(LineEnding::LF)
            .std_context("failed to encode host key")?;
        tokio::fs::write(path, encoded.as_bytes())
            .await
            .std_context("failed to write host key")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .std_context("failed to restrict host key permissions")?;
        }
        Ok(key)
    }
}

/// SSH server configuration: no client auth, server-side keepalives.
pub fn server_config(key: PrivateKey) -> Arc<russh::server::Config> {
    Arc::new(russh::server::Config {
        methods: MethodSet::from(&[MethodKind::None][..]),
        keepalive_interval: Some(Duration::from_secs(15)),
        keepalive_max: 4,
        inactivity_timeout: None,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    })
}

/// Accepts SSH connections until cancelled, spawning one task each.
pub async fn run_ssh_listener(
    registry: Arc<Registry>,
    config: Arc<Config>,
    ssh_config: Arc<russh::server::Config>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut conn_id: u64 = 0;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                accepted.std_context("failed to accept SSH connection")?
            }
        };
        conn_id += 1;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, "failed to set TCP_NODELAY: {err:#}");
        }
        tokio::spawn(
            handle_connection(
                registry.clone(),
                config.clone(),
                ssh_config.clone(),
                stream,
                peer,
                conn_id,
                shutdown.clone(),
            )
            .instrument(error_span!("ssh-conn", id = conn_id)),
        );
    }
    Ok(())
}

/// Events the russh handler reports to its connection task.
enum ConnEvent {
    Reserved,
    Rejected,
    Registered(Arc<Tunnel>),
    SessionOpened(Arc<RequestLogger>),
}

/// The owning SSH connection as a force-close capability.
pub(crate) struct SshConnHandle {
    handle: russh::server::Handle,
}

impl ForcedClose for SshConnHandle {
    fn force_close(&self) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                .await;
        });
    }
}

async fn handle_connection(
    registry: Arc<Registry>,
    config: Arc<Config>,
    ssh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    shutdown: CancellationToken,
) {
    let client_ip = peer.ip();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let handler = ClientHandler {
        registry: registry.clone(),
        config: config.clone(),
        client_ip,
        events: events_tx,
        rejection: None,
        reserved: false,
        tunnel: None,
        logger: None,
        banner_sent: false,
    };

    let mut session = match timeout(
        SSH_HANDSHAKE_TIMEOUT,
        russh::server::run_stream(ssh_config, stream, handler),
    )
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            debug!(%peer, "SSH handshake failed: {err:#}");
            return;
        }
        Err(_) => {
            debug!(%peer, "SSH handshake timed out");
            return;
        }
    };
    let handle = session.handle();
    registry.register_ssh_conn(
        client_ip,
        conn_id,
        Arc::new(SshConnHandle {
            handle: handle.clone(),
        }),
    );

    let mut reserved = false;
    let mut rejected = false;
    let mut tunnel: Option<Arc<Tunnel>> = None;
    let mut logger: Option<Arc<RequestLogger>> = None;
    let mut live = false;
    let mut events_closed = false;

    let mut deadline = Box::pin(tokio::time::sleep(FIRST_FORWARD_TIMEOUT));
    let mut expiry_ticker = tokio::time::interval(EXPIRY_CHECK_INTERVAL);
    expiry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut session => {
                if let Err(err) = result {
                    debug!(%peer, "SSH session ended: {err:#}");
                }
                break;
            }
            _ = shutdown.cancelled() => {
                let _ = handle
                    .disconnect(
                        russh::Disconnect::ByApplication,
                        "server shutting down".into(),
                        "English".into(),
                    )
                    .await;
                break;
            }
            event = events.recv(), if !events_closed => {
                match event {
                    Some(ConnEvent::Reserved) => {
                        reserved = true;
                    }
                    Some(ConnEvent::Rejected) => {
                        rejected = true;
                        reset_deadline(&mut deadline, REJECTED_SESSION_TIMEOUT);
                    }
                    Some(ConnEvent::Registered(tun)) => {
                        if logger.is_some() {
                            live = true;
                            park_deadline(&mut deadline);
                        } else {
                            reset_deadline(&mut deadline, SESSION_CHANNEL_TIMEOUT);
                        }
                        tunnel = Some(tun);
                    }
                    Some(ConnEvent::SessionOpened(l)) => {
                        logger = Some(l);
                        if rejected {
                            // let the error line flush, then drop the client
                            reset_deadline(&mut deadline, Duration::from_millis(500));
                        } else if tunnel.is_some() {
                            live = true;
                            park_deadline(&mut deadline);
                        }
                    }
                    None => {
                        events_closed = true;
                    }
                }
            }
            _ = deadline.as_mut(), if !live => {
                debug!(%peer, rejected, "connection deadline elapsed, disconnecting");
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
                park_deadline(&mut deadline);
            }
            _ = expiry_ticker.tick(), if live => {
                if let Some(tun) = &tunnel {
                    if tun.is_expired() {
                        info!(subdomain = %tun.subdomain(), "tunnel expired, closing SSH connection");
                        let _ = handle
                            .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                            .await;
                        live = false;
                        park_deadline(&mut deadline);
                    }
                }
            }
        }
    }

    // Teardown: every registration above is released exactly once, on every
    // exit path.
    if let Some(tun) = &tunnel {
        registry.remove_tunnel(tun.subdomain()).await;
        info!(subdomain = %tun.subdomain(), %peer, "SSH connection closed");
    }
    if let Some(logger) = &logger {
        logger.close().await;
    }
    registry.unregister_ssh_conn(client_ip, conn_id);
    if reserved {
        registry.decrement_ip(client_ip);
    }
}

fn reset_deadline(deadline: &mut std::pin::Pin<Box<tokio::time::Sleep>>, after: Duration) {
    deadline
        .as_mut()
        .reset(tokio::time::Instant::now() + after);
}

/// Pushes the deadline far enough out that it cannot fire again.
fn park_deadline(deadline: &mut std::pin::Pin<Box<tokio::time::Sleep>>) {
    reset_deadline(deadline, Duration::from_secs(7 * 24 * 3600));
}

struct ClientHandler {
    registry: Arc<Registry>,
    config: Arc<Config>,
    client_ip: IpAddr,
    events: mpsc::UnboundedSender<ConnEvent>,
    rejection: Option<String>,
    reserved: bool,
    tunnel: Option<Arc<Tunnel>>,
    logger: Option<Arc<RequestLogger>>,
    banner_sent: bool,
}

impl ClientHandler {
    /// Once both the tunnel and the session channel exist, print the banner
    /// and wire the request log onto the tunnel.
    fn maybe_go_live(&mut self) {
        if self.banner_sent {
            return;
        }
        let (Some(tunnel), Some(logger)) = (&self.tunnel, &self.logger) else {
            return;
        };
        logger.post(build_banner(&self.config.domain, tunnel));
        tunnel.set_logger(logger.clone());
        self.banner_sent = true;
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        // Admission runs post-handshake so rejections can be shown to the
        // client on its session channel.
        match self.registry.check_and_reserve(self.client_ip) {
            Ok(()) => {
                self.reserved = true;
                self.registry.increment_connections();
                let _ = self.events.send(ConnEvent::Reserved);
            }
            Err(err) => {
                info!(ip = %self.client_ip, "connection rejected: {err}");
                self.rejection = Some(err.to_string());
                let _ = self.events.send(ConnEvent::Rejected);
            }
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.logger.is_some() {
            return Ok(false);
        }
        let (read_half, write_half) = tokio::io::split(channel.into_stream());
        let logger = Arc::new(RequestLogger::new(write_half, LOG_BUFFER_SIZE));
        if let Some(reason) = &self.rejection {
            logger.post(format!("\r\n  ERROR: {reason}\r\n\r\n"));
        }
        // read the channel one byte at a time to catch Ctrl-C or EOF
        tokio::spawn(watch_session_input(read_half, session.handle()));
        self.logger = Some(logger.clone());
        let _ = self.events.send(ConnEvent::SessionOpened(logger));
        self.maybe_go_live();
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.rejection.is_some() || !self.reserved {
            return Ok(false);
        }
        if self.tunnel.is_some() {
            debug!(ip = %self.client_ip, "additional tcpip-forward refused");
            return Ok(false);
        }

        let sub = match self.registry.generate_unique_subdomain() {
            Ok(sub) => sub,
            Err(err) => {
                warn!("failed to mint subdomain: {err:#}");
                return Ok(false);
            }
        };
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("failed to bind tunnel listener: {err:#}");
                return Ok(false);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("failed to read tunnel listener address: {err:#}");
                return Ok(false);
            }
        };

        let tunnel =
            self.registry
                .register_tunnel(&sub, local_addr, address, *port, self.client_ip);
        let handle = session.handle();
        tunnel.set_ssh(Arc::new(SshConnHandle {
            handle: handle.clone(),
        }));
        tokio::spawn(
            accept_loop(listener, tunnel.clone(), handle)
                .instrument(error_span!("tunnel", subdomain = %sub)),
        );

        info!(subdomain = %sub, ip = %self.client_ip, bind_port = *port, "tunnel registered");
        self.tunnel = Some(tunnel.clone());
        let _ = self.events.send(ConnEvent::Registered(tunnel));
        self.maybe_go_live();
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // acknowledged, but the tunnel stays up until the connection ends
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn signal(
        &mut self,
        _channel: ChannelId,
        _signal: russh::Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Err(russh::Error::Disconnect)
    }
}

/// Blocks on the session channel one byte at a time and disconnects the
/// connection on Ctrl-C (0x03) or when the channel reaches EOF.
async fn watch_session_input(
    mut read_half: tokio::io::ReadHalf<russh::ChannelStream<Msg>>,
    handle: russh::server::Handle,
) {
    let mut buf = [0u8; 1];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if buf[0] == 0x03 {
                    break;
                }
            }
        }
    }
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
        .await;
}

/// Accepts connections on the tunnel's loopback listener and forwards each
/// through a `forwarded-tcpip` channel to the SSH client.
async fn accept_loop(listener: TcpListener, tunnel: Arc<Tunnel>, handle: russh::server::Handle) {
    let closed = tunnel.closed();
    loop {
        let (stream, peer) = tokio::select! {
            _ = closed.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    debug!("tunnel listener accept failed: {err:#}");
                    break;
                }
            },
        };
        tunnel.touch();
        let handle = handle.clone();
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            if let Err(err) = forward_connection(handle, stream, peer, tunnel).await {
                debug!("forwarded connection failed: {err:#}");
            }
        });
    }
    // the listener drops here, closing the local port exactly once
}

async fn forward_connection(
    handle: russh::server::Handle,
    stream: TcpStream,
    peer: SocketAddr,
    tunnel: Arc<Tunnel>,
) -> Result<()> {
    let channel = handle
        .channel_open_forwarded_tcpip(
            tunnel.bind_addr().to_string(),
            tunnel.bind_port(),
            peer.ip().to_string(),
            peer.port() as u32,
        )
        .await
        .std_context("failed to open forwarded-tcpip channel")?;

    let (mut ssh_read, mut ssh_write) = tokio::io::split(channel.into_stream());
    let (mut tcp_read, mut tcp_write) = stream.into_split();
    forward_bidi(&mut tcp_read, &mut tcp_write, &mut ssh_read, &mut ssh_write).await;
    Ok(())
}

fn build_banner(domain: &str, tunnel: &Tunnel) -> String {
    let url = format!("https://{}.{}", tunnel.subdomain(), domain);
    let expires = tunnel.expires_at().format("%b %d, %Y at %H:%M UTC");
    let idle = format_duration(INACTIVITY_TIMEOUT);
    format!(
        "\r\n{ANSI_GRAY}Connected to {domain}.{ANSI_RESET}\r\n\
         {ANSI_BOLD_GREEN}Tunnel is live!{ANSI_RESET}\r\n\
         {ANSI_GRAY}Public URL: {ANSI_PURPLE}{url}{ANSI_RESET}\r\n\
         {ANSI_GRAY}Expires:    {expires} (or {idle} idle){ANSI_RESET}\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn banner_names_url_and_budgets() {
        let tunnel = Tunnel::new(
            "happy-tiger-abcdef01",
            "127.0.0.1:1".parse().unwrap(),
            "localhost",
            80,
            "203.0.113.7".parse().unwrap(),
        );
        let banner = build_banner("tunnl.gg", &tunnel);
        assert!(banner.contains("https://happy-tiger-abcdef01.tunnl.gg"));
        assert!(banner.contains("Tunnel is live!"));
        assert!(banner.contains("(or 2h idle)"));
        assert!(banner.contains("Expires:"));
    }
}
