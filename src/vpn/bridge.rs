//! In-process dual UDP relay for sponsored sessions
//!
//! Two bridges, four unidirectional forwarding loops:
//!
//! - **Tunnel↔Raw**: whole IP packets read from the tunnel descriptor are
//!   sent to the engine's raw relay endpoint; datagrams arriving on the
//!   same socket are written back into the tunnel. Both directions feed
//!   the session traffic counters.
//! - **Middleware↔Remote rewrite**: datagrams from the local middleware
//!   hop are relayed verbatim to the discovered remote endpoint; the
//!   first observed middleware sender is latched and remote-origin
//!   datagrams are delivered only to that peer. Until a peer is latched,
//!   remote-origin traffic is dropped.
//!
//! Each loop runs as its own blocking worker with a bounded receive
//! timeout so every one of them observes the session's shared shutdown
//! signal. There is no bridge-level queue beyond the OS socket buffers;
//! under load packets drop silently.

use super::protector::SocketProtection;
use super::tunnel::{TunnelHandle, VPN_MTU};
use super::{join_with_timeout, ShutdownSignal};
use crate::settings::Settings;
use crate::vpn::profile::TunnelProfile;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use nix::poll::{PollFd, PollFlags};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Bounded receive timeout; every loop wakes at least this often to
/// observe shutdown.
const BRIDGE_RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// Poll timeout for tunnel descriptor reads (ms)
const TUN_POLL_TIMEOUT_MS: i32 = 1000;

/// Idle backoff of the tunnel↔raw loops
const RAW_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Idle backoff of the rewrite loops; these stay tight, middleware
/// traffic is latency-sensitive
const REWRITE_IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Session traffic counters, written by one worker and read by the
/// statistics collaborator.
#[derive(Debug, Default)]
pub struct TrafficStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl TrafficStats {
    fn add_tx(&self, n: usize) {
        self.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_rx(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Endpoints of the two bridges.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum packet size moved per read
    pub mtu: usize,
    /// Engine's raw relay endpoint, destination of tunnel-origin packets
    pub raw_endpoint: SocketAddr,
    /// Local middleware hop bind address
    pub middleware_addr: SocketAddr,
    /// Bind address of the remote-facing socket (discovered source port)
    pub source_bind: SocketAddr,
    /// Resolved remote endpoint
    pub remote: SocketAddr,
}

impl BridgeConfig {
    /// Assemble the bridge endpoints for a sponsored session. `remote_ip`
    /// is the already-resolved profile host.
    pub fn from_profile(profile: &TunnelProfile, settings: &Settings, remote_ip: IpAddr) -> Self {
        let source_bind = if remote_ip.is_ipv6() {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), profile.source_port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), profile.source_port)
        };
        Self {
            mtu: VPN_MTU as usize,
            raw_endpoint: SocketAddr::new(
                IpAddr::V4(settings.listen_address),
                settings.port_local_raw,
            ),
            middleware_addr: SocketAddr::new(
                IpAddr::V4(settings.listen_address),
                settings.port_local_middleware,
            ),
            source_bind,
            remote: SocketAddr::new(remote_ip, profile.remote_port),
        }
    }
}

/// The running relay: four workers under one shutdown signal.
pub struct DirectUdpBridge {
    shutdown: ShutdownSignal,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    stats: Arc<TrafficStats>,
    latched_peer: Arc<ArcSwap<Option<SocketAddr>>>,
    raw_local_addr: SocketAddr,
    middleware_local_addr: SocketAddr,
    rewrite_local_addr: SocketAddr,
}

impl DirectUdpBridge {
    /// Bind and protect the relay sockets, then start all four workers.
    ///
    /// The tunnel descriptor is duplicated for the workers; the handle
    /// itself stays with the session and outlives the bridge.
    pub fn start(
        tunnel: &TunnelHandle,
        config: &BridgeConfig,
        protection: &dyn SocketProtection,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let stats = Arc::new(TrafficStats::default());
        let latched_peer: Arc<ArcSwap<Option<SocketAddr>>> =
            Arc::new(ArcSwap::from_pointee(None));

        // tunnel<->raw bridge: one unbound protected socket, both directions
        let raw_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .context("Failed to bind raw relay socket")?;
        raw_socket
            .set_read_timeout(Some(BRIDGE_RECV_TIMEOUT))
            .context("Failed to set raw relay timeout")?;
        protection
            .protect(raw_socket.as_fd())
            .context("Failed to protect raw relay socket")?;
        let raw_local_addr = raw_socket
            .local_addr()
            .context("Failed to read raw relay address")?;

        // middleware<->remote rewrite bridge: two protected sockets
        let middleware_socket = UdpSocket::bind(config.middleware_addr)
            .context("Failed to bind middleware socket")?;
        middleware_socket
            .set_read_timeout(Some(BRIDGE_RECV_TIMEOUT))
            .context("Failed to set middleware timeout")?;
        protection
            .protect(middleware_socket.as_fd())
            .context("Failed to protect middleware socket")?;
        let middleware_local_addr = middleware_socket
            .local_addr()
            .context("Failed to read middleware address")?;

        let remote_socket = UdpSocket::bind(config.source_bind)
            .context("Failed to bind remote-facing socket")?;
        remote_socket
            .set_read_timeout(Some(BRIDGE_RECV_TIMEOUT))
            .context("Failed to set remote-facing timeout")?;
        protection
            .protect(remote_socket.as_fd())
            .context("Failed to protect remote-facing socket")?;
        let rewrite_local_addr = remote_socket
            .local_addr()
            .context("Failed to read remote-facing address")?;

        let tun_reader = tunnel.dup().context("Failed to dup tunnel descriptor")?;
        let tun_writer = tunnel.dup().context("Failed to dup tunnel descriptor")?;
        let raw_recv = raw_socket
            .try_clone()
            .context("Failed to clone raw relay socket")?;
        let middleware_send = middleware_socket
            .try_clone()
            .context("Failed to clone middleware socket")?;
        let remote_recv = remote_socket
            .try_clone()
            .context("Failed to clone remote-facing socket")?;

        let mtu = config.mtu;
        let mut workers = Vec::with_capacity(4);

        {
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let raw_endpoint = config.raw_endpoint;
            let handle = std::thread::Builder::new()
                .name("driller-tun-send".to_string())
                .spawn(move || {
                    run_tunnel_to_raw(tun_reader, raw_socket, raw_endpoint, mtu, stats, shutdown)
                })
                .context("Failed to spawn tunnel send worker")?;
            workers.push(("tunnel send", handle));
        }
        {
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name("driller-tun-recv".to_string())
                .spawn(move || run_raw_to_tunnel(raw_recv, tun_writer, mtu, stats, shutdown))
                .context("Failed to spawn tunnel recv worker")?;
            workers.push(("tunnel recv", handle));
        }
        {
            let shutdown = shutdown.clone();
            let latched = latched_peer.clone();
            let remote = config.remote;
            let remote_send = remote_socket
                .try_clone()
                .context("Failed to clone remote-facing socket")?;
            let handle = std::thread::Builder::new()
                .name("driller-mw-send".to_string())
                .spawn(move || {
                    run_middleware_to_remote(
                        middleware_socket,
                        remote_send,
                        remote,
                        latched,
                        mtu,
                        shutdown,
                    )
                })
                .context("Failed to spawn middleware send worker")?;
            workers.push(("middleware send", handle));
        }
        {
            let shutdown = shutdown.clone();
            let latched = latched_peer.clone();
            let handle = std::thread::Builder::new()
                .name("driller-mw-recv".to_string())
                .spawn(move || {
                    run_remote_to_middleware(remote_recv, middleware_send, latched, mtu, shutdown)
                })
                .context("Failed to spawn middleware recv worker")?;
            workers.push(("middleware recv", handle));
        }

        log::info!(
            "Bridge: relaying tunnel via {} and middleware {} <-> remote {}",
            config.raw_endpoint,
            middleware_local_addr,
            config.remote
        );

        Ok(Self {
            shutdown,
            workers,
            stats,
            latched_peer,
            raw_local_addr,
            middleware_local_addr,
            rewrite_local_addr,
        })
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        self.stats.clone()
    }

    /// The latched middleware peer, if any sender has been observed yet.
    pub fn latched_peer(&self) -> Option<SocketAddr> {
        **self.latched_peer.load()
    }

    /// Local address of the raw relay socket.
    pub fn raw_local_addr(&self) -> SocketAddr {
        self.raw_local_addr
    }

    /// Actual bind address of the middleware socket.
    pub fn middleware_local_addr(&self) -> SocketAddr {
        self.middleware_local_addr
    }

    /// Actual bind address of the remote-facing socket.
    pub fn rewrite_local_addr(&self) -> SocketAddr {
        self.rewrite_local_addr
    }

    /// Signal all four workers and join them with a bounded wait. The
    /// sockets close as their owning workers exit. Returns false if any
    /// worker had to be detached.
    pub fn stop(&mut self) -> bool {
        self.shutdown.trigger();
        let mut all_joined = true;
        for (name, handle) in self.workers.drain(..) {
            all_joined &= join_with_timeout(handle, name);
        }
        let snapshot = self.stats.snapshot();
        log::info!(
            "Bridge: stopped (tx {} bytes, rx {} bytes)",
            snapshot.tx_bytes,
            snapshot.rx_bytes
        );
        all_joined
    }
}

impl Drop for DirectUdpBridge {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

/// Wait for the tunnel descriptor to become readable, bounded so the
/// loop can observe shutdown.
fn poll_readable(file: &File) -> io::Result<bool> {
    let mut fds = [PollFd::new(file, PollFlags::POLLIN)];
    let n = nix::poll::poll(&mut fds, TUN_POLL_TIMEOUT_MS).map_err(io::Error::from)?;
    Ok(n > 0)
}

/// Tunnel -> raw endpoint: whole packets out of the tunnel descriptor.
fn run_tunnel_to_raw(
    tun: OwnedFd,
    socket: UdpSocket,
    raw_endpoint: SocketAddr,
    mtu: usize,
    stats: Arc<TrafficStats>,
    shutdown: ShutdownSignal,
) {
    let mut tun = File::from(tun);
    let mut buf = vec![0u8; mtu];
    while !shutdown.is_triggered() {
        match poll_readable(&tun) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                log::error!("Bridge: tunnel poll failed: {}", e);
                break;
            }
        }
        match tun.read(&mut buf) {
            Ok(0) => std::thread::sleep(RAW_IDLE_BACKOFF),
            Ok(n) => {
                if let Err(e) = socket.send_to(&buf[..n], raw_endpoint) {
                    log::warn!("Bridge: raw send failed: {}", e);
                    continue;
                }
                stats.add_tx(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                log::error!("Bridge: tunnel read failed: {}", e);
                break;
            }
        }
    }
    log::debug!("Bridge: tunnel send loop closed");
}

/// Raw endpoint -> tunnel: datagrams written back into the descriptor.
fn run_raw_to_tunnel(
    socket: UdpSocket,
    tun: OwnedFd,
    mtu: usize,
    stats: Arc<TrafficStats>,
    shutdown: ShutdownSignal,
) {
    let mut tun = File::from(tun);
    let mut buf = vec![0u8; mtu];
    while !shutdown.is_triggered() {
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => std::thread::sleep(RAW_IDLE_BACKOFF),
            Ok((n, _)) => {
                if let Err(e) = tun.write_all(&buf[..n]) {
                    log::error!("Bridge: tunnel write failed: {}", e);
                    break;
                }
                stats.add_rx(n);
            }
            Err(e) if is_recv_timeout(&e) => continue,
            Err(e) => {
                log::error!("Bridge: raw receive failed: {}", e);
                break;
            }
        }
    }
    log::debug!("Bridge: tunnel recv loop closed");
}

/// Middleware -> remote: relay verbatim, latching the first sender.
fn run_middleware_to_remote(
    local: UdpSocket,
    remote_socket: UdpSocket,
    remote: SocketAddr,
    latched: Arc<ArcSwap<Option<SocketAddr>>>,
    mtu: usize,
    shutdown: ShutdownSignal,
) {
    let mut buf = vec![0u8; mtu];
    while !shutdown.is_triggered() {
        match local.recv_from(&mut buf) {
            Ok((0, _)) => std::thread::sleep(REWRITE_IDLE_BACKOFF),
            Ok((n, from)) => {
                if let Err(e) = remote_socket.send_to(&buf[..n], remote) {
                    log::warn!("Bridge: remote send failed: {}", e);
                    continue;
                }
                if latched.load().is_none() {
                    latched.store(Arc::new(Some(from)));
                    log::info!("Bridge: middleware peer latched: {}", from);
                }
            }
            Err(e) if is_recv_timeout(&e) => continue,
            Err(e) => {
                log::error!("Bridge: middleware receive failed: {}", e);
                break;
            }
        }
    }
    log::debug!("Bridge: middleware send loop closed");
}

/// Remote -> middleware: deliver only to the latched peer, drop otherwise.
fn run_remote_to_middleware(
    remote_socket: UdpSocket,
    local: UdpSocket,
    latched: Arc<ArcSwap<Option<SocketAddr>>>,
    mtu: usize,
    shutdown: ShutdownSignal,
) {
    let mut buf = vec![0u8; mtu];
    while !shutdown.is_triggered() {
        match remote_socket.recv_from(&mut buf) {
            Ok((0, _)) => std::thread::sleep(REWRITE_IDLE_BACKOFF),
            Ok((n, _)) => match **latched.load() {
                Some(peer) => {
                    if let Err(e) = local.send_to(&buf[..n], peer) {
                        log::warn!("Bridge: middleware delivery failed: {}", e);
                    }
                }
                None => {
                    log::debug!("Bridge: no middleware peer latched, dropping datagram");
                }
            },
            Err(e) if is_recv_timeout(&e) => continue,
            Err(e) => {
                log::error!("Bridge: remote receive failed: {}", e);
                break;
            }
        }
    }
    log::debug!("Bridge: middleware recv loop closed");
}

fn is_recv_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
