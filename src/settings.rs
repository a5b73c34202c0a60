//! Runtime settings for the VPN service
//!
//! Ports and filesystem locations shared across the service. Values are
//! supplied by the embedding platform layer at startup; nothing here is
//! persisted to disk.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Local DNS forwarder port.
pub const DEFAULT_PORT_LOCAL_DNS: u16 = 5450;
/// Port the proxying engine listens on for raw tunneled UDP.
pub const DEFAULT_PORT_LOCAL_RAW: u16 = 5462;
/// Port the middleware hop is reachable on.
pub const DEFAULT_PORT_LOCAL_MIDDLEWARE: u16 = 5461;

/// Service-wide settings.
///
/// `private_dir` holds the control sockets (`protect_path`, `sock_path`);
/// `shared_storage_dir` is where rendezvous files are dropped by the
/// sponsoring peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address local helpers bind and are addressed on
    pub listen_address: Ipv4Addr,
    /// Local DNS forwarder port
    pub port_local_dns: u16,
    /// Raw relay port of the proxying engine
    pub port_local_raw: u16,
    /// Middleware hop port
    pub port_local_middleware: u16,
    /// Directory for control sockets, private to this service
    pub private_dir: PathBuf,
    /// Shared storage root for rendezvous files
    pub shared_storage_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: Ipv4Addr::LOCALHOST,
            port_local_dns: DEFAULT_PORT_LOCAL_DNS,
            port_local_raw: DEFAULT_PORT_LOCAL_RAW,
            port_local_middleware: DEFAULT_PORT_LOCAL_MIDDLEWARE,
            private_dir: PathBuf::from("/run/driller"),
            shared_storage_dir: PathBuf::from("/var/lib/driller"),
        }
    }
}

impl Settings {
    /// Path of the socket-protection IPC socket.
    pub fn protect_path(&self) -> PathBuf {
        self.private_dir.join("protect_path")
    }

    /// Path of the tunnel-descriptor handoff socket.
    pub fn sock_path(&self) -> PathBuf {
        self.private_dir.join("sock_path")
    }

    /// Directory rendezvous files are dropped in.
    pub fn rendezvous_dir(&self) -> PathBuf {
        self.shared_storage_dir.join("driller_remote")
    }
}
