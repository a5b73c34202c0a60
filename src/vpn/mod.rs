//! VPN Module for Driller
//!
//! This module establishes the virtual network interface and relays raw
//! IP/UDP traffic between it and an external proxying engine. Sponsored
//! sessions additionally discover a dynamic remote endpoint via a
//! rendezvous file and bridge traffic through a local middleware hop.
//!
//! ## Architecture
//!
//! - profile.rs: tunnel profile and route policy types
//! - resolver.rs: capability-aware host resolution
//! - protector.rs: socket protection IPC service (bypasses tunnel capture)
//! - tunnel.rs: virtual interface construction and the tunnel handle
//! - rendezvous.rs: one-shot rendezvous file consumption (sponsored bootstrap)
//! - handoff.rs: tunnel descriptor handoff to the proxying engine
//! - bridge.rs: in-process dual UDP relay with address latching
//! - proxy.rs: generated engine config and command lines
//! - connection.rs: session state machine and lifecycle management

pub mod bridge;
pub mod connection;
pub mod handoff;
pub mod profile;
pub mod protector;
pub mod proxy;
pub mod rendezvous;
pub mod resolver;
pub mod tunnel;

pub use bridge::{DirectUdpBridge, TrafficStats};
pub use connection::{ConnectionState, VpnConnection};
pub use handoff::send_fd;
pub use profile::{RoutePolicy, TunnelProfile};
pub use protector::{NoProtection, ProtectService, SocketProtection};
pub use rendezvous::RendezvousEndpoint;
pub use resolver::{HostResolver, HostsFile, NetworkCapability, NetworkMonitor};
pub use tunnel::{TunnelConfig, TunnelHandle, TunnelState};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// VPN-related errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("Failed to establish tunnel interface")]
    NoTunnel,

    #[error("No active network")]
    NoNetwork,

    #[error("Failed to resolve host: {0}")]
    HostUnresolved(String),

    #[error("Rendezvous file missing: {0}")]
    RendezvousMissing(PathBuf),

    #[error("Malformed rendezvous line: {0}")]
    RendezvousMalformed(String),

    #[error("Rendezvous file is empty")]
    RendezvousEmpty,

    #[error("Tunnel descriptor handoff failed: {0}")]
    Handoff(#[source] std::io::Error),

    #[error("Relay bridge error: {0}")]
    Bridge(String),

    #[error("Socket protector error: {0}")]
    Protector(String),

    #[error("Tunnel permission revoked")]
    Revoked,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VpnError {
    /// Environment-driven disconnects (e.g. the platform revoking tunnel
    /// consent) are reported as an expected, non-crash disconnect. All
    /// other fatal errors propagate as failures requiring attention.
    pub fn is_expected_disconnect(&self) -> bool {
        matches!(self, VpnError::Revoked)
    }
}

pub type VpnResult<T> = Result<T, VpnError>;

/// One shared cancellation signal per session.
///
/// Every relay worker and the protector service observe the same signal;
/// teardown triggers it once instead of interrupting threads one by one.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal all observers to stop. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Timeout for worker join operations during teardown
pub(crate) const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Join a worker thread with a bounded wait.
///
/// JoinHandle has no native timeout, so poll `is_finished` until the
/// deadline. On timeout the handle is forgotten to detach the thread;
/// blocking on drop would hang teardown indefinitely.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, name: &str) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(20);

    while start.elapsed() < WORKER_JOIN_TIMEOUT {
        if handle.is_finished() {
            let _ = handle.join();
            log::debug!("{} worker joined", name);
            return true;
        }
        std::thread::sleep(poll_interval);
    }

    log::error!(
        "{} worker did not stop within {:?}, detaching",
        name,
        WORKER_JOIN_TIMEOUT
    );
    std::mem::forget(handle);
    false
}
