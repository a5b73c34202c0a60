//! Connection state machine and lifecycle management
//!
//! One session object owns everything alive during a session: the
//! protector service, the tunnel handle, and the relay workers, all
//! governed by a single shutdown signal. Setup order: sponsored
//! endpoint discovery, host resolution, tunnel construction, then the
//! relay engine (descriptor handoff, or the in-process bridge for
//! sponsored sessions). Teardown runs strictly in reverse: stop
//! accepting protection requests, signal and join the relay workers,
//! release the tunnel descriptor last.

use super::bridge::{BridgeConfig, DirectUdpBridge, TrafficSnapshot};
use super::handoff;
use super::profile::TunnelProfile;
use super::protector::{ProtectService, SocketProtection};
use super::rendezvous;
use super::resolver::HostResolver;
use super::tunnel::{self, TunnelConfig, TunnelHandle};
use super::{ShutdownSignal, VpnError, VpnResult};
use crate::settings::Settings;
use parking_lot::Mutex;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Instant;

/// VPN connection state
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// Consuming the rendezvous file (sponsored sessions)
    Discovering,
    Resolving,
    CreatingTunnel,
    /// Starting the relay engine
    Connecting,
    Connected {
        since: Instant,
        remote: String,
        sponsored: bool,
    },
    Disconnecting,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Discovering
                | ConnectionState::Resolving
                | ConnectionState::CreatingTunnel
                | ConnectionState::Connecting
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConnectionState::Error(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Discovering => "Discovering endpoint...",
            ConnectionState::Resolving => "Resolving host...",
            ConnectionState::CreatingTunnel => "Creating tunnel interface...",
            ConnectionState::Connecting => "Starting relay...",
            ConnectionState::Connected { .. } => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Error(_) => "Error",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// VPN session manager
pub struct VpnConnection {
    settings: Settings,
    own_package: String,
    state: Arc<Mutex<ConnectionState>>,
    resolver: HostResolver,
    protection: Arc<dyn SocketProtection>,
    shutdown: ShutdownSignal,
    protect_service: Option<ProtectService>,
    tunnel: Option<TunnelHandle>,
    bridge: Option<DirectUdpBridge>,
}

impl VpnConnection {
    pub fn new(
        settings: Settings,
        own_package: impl Into<String>,
        resolver: HostResolver,
        protection: Arc<dyn SocketProtection>,
    ) -> Self {
        Self {
            settings,
            own_package: own_package.into(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            resolver,
            protection,
            shutdown: ShutdownSignal::new(),
            protect_service: None,
            tunnel: None,
            bridge: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Traffic counters of the running bridge, if any.
    pub fn traffic_stats(&self) -> Option<TrafficSnapshot> {
        self.bridge.as_ref().map(|b| b.stats().snapshot())
    }

    /// Bring the session up. Sponsored profiles are patched by endpoint
    /// discovery before the tunnel is built; the resolved remote literal
    /// replaces the profile host either way.
    pub fn connect(&mut self, profile: &mut TunnelProfile) -> VpnResult<()> {
        if self.state().is_connected() || self.state().is_connecting() {
            return Err(VpnError::Connection("Already connected".to_string()));
        }

        let result = self.establish_session(profile);
        match &result {
            Ok(()) => {
                *self.state.lock() = ConnectionState::Connected {
                    since: Instant::now(),
                    remote: format!("{}:{}", profile.host, profile.remote_port),
                    sponsored: profile.sponsored,
                };
                log::info!(
                    "Connection: established to {}:{} (sponsored: {})",
                    profile.host,
                    profile.remote_port,
                    profile.sponsored
                );
            }
            Err(e) if e.is_expected_disconnect() => {
                log::info!("Connection: expected disconnect during setup: {}", e);
                self.teardown();
                *self.state.lock() = ConnectionState::Disconnected;
            }
            Err(e) => {
                log::error!("Connection: setup failed: {}", e);
                self.teardown();
                *self.state.lock() = ConnectionState::Error(e.to_string());
            }
        }
        result
    }

    fn establish_session(&mut self, profile: &mut TunnelProfile) -> VpnResult<()> {
        let service = ProtectService::start(
            &self.settings.protect_path(),
            self.protection.clone(),
        )
        .map_err(|e| VpnError::Protector(e.to_string()))?;
        self.protect_service = Some(service);

        if profile.sponsored {
            *self.state.lock() = ConnectionState::Discovering;
            rendezvous::consume_rendezvous(&self.settings.rendezvous_dir(), profile)?;
        }

        *self.state.lock() = ConnectionState::Resolving;
        let remote_ip = self.resolver.resolve(&profile.host)?;
        profile.host = remote_ip.to_string();

        *self.state.lock() = ConnectionState::CreatingTunnel;
        let config = TunnelConfig::from_profile(profile, &self.own_package);
        let handle = tunnel::establish(&config)?;

        *self.state.lock() = ConnectionState::Connecting;
        if profile.sponsored {
            let bridge_config = BridgeConfig::from_profile(profile, &self.settings, remote_ip);
            let bridge = DirectUdpBridge::start(
                &handle,
                &bridge_config,
                self.protection.as_ref(),
                self.shutdown.clone(),
            )
            .map_err(|e| VpnError::Bridge(format!("{:#}", e)))?;
            self.bridge = Some(bridge);
        } else {
            handoff::send_fd(&self.settings.sock_path(), handle.as_fd())?;
        }
        self.tunnel = Some(handle);
        Ok(())
    }

    /// Tear the session down in order and return to Disconnected.
    pub fn disconnect(&mut self) {
        *self.state.lock() = ConnectionState::Disconnecting;
        self.teardown();
        *self.state.lock() = ConnectionState::Disconnected;
        log::info!("Connection: disconnected");
    }

    /// The platform revoked tunnel consent; treated as an expected
    /// disconnect, not an error.
    pub fn on_revoked(&mut self) {
        log::info!("Connection: tunnel consent revoked");
        self.disconnect();
    }

    fn teardown(&mut self) {
        // 1. stop accepting new protection requests
        if let Some(mut service) = self.protect_service.take() {
            service.stop();
        }
        // 2. signal every relay worker, then join with a bounded wait
        self.shutdown.trigger();
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
        }
        // 3. release the tunnel descriptor last
        if let Some(handle) = self.tunnel.take() {
            handle.close();
        }
        // fresh signal for the next session
        self.shutdown = ShutdownSignal::new();
    }
}

impl Drop for VpnConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::protector::NoProtection;
    use crate::vpn::resolver::{
        DnsLookup, HostsFile, Network, NetworkCapability, NetworkMonitor,
    };
    use std::io;
    use std::net::{IpAddr, SocketAddr, UdpSocket};
    use std::os::unix::net::UnixDatagram;

    struct EmptyHosts;
    impl HostsFile for EmptyHosts {
        fn resolve(&self, _host: &str) -> Vec<IpAddr> {
            Vec::new()
        }
    }

    struct OfflineMonitor;
    impl NetworkMonitor for OfflineMonitor {
        fn active_network(&self) -> Option<Network> {
            None
        }
        fn capability(&self, _network: &Network) -> NetworkCapability {
            NetworkCapability {
                has_v4: false,
                has_v6: false,
            }
        }
    }

    struct NoDns;
    impl DnsLookup for NoDns {
        fn lookup(&self, _host: &str, _bind: Option<IpAddr>) -> io::Result<Vec<IpAddr>> {
            Err(io::Error::other("no dns in tests"))
        }
    }

    fn test_connection() -> VpnConnection {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings {
            private_dir: dir.into_path(),
            ..Default::default()
        };
        let resolver = HostResolver::new(
            Arc::new(EmptyHosts),
            Arc::new(OfflineMonitor),
            Arc::new(NoDns),
        );
        VpnConnection::new(settings, "io.driller.app", resolver, Arc::new(NoProtection))
    }

    #[test]
    fn state_machine_helpers() {
        assert!(ConnectionState::default() == ConnectionState::Disconnected);
        assert!(ConnectionState::Resolving.is_connecting());
        assert!(!ConnectionState::Disconnected.is_connecting());
        let state = ConnectionState::Connected {
            since: Instant::now(),
            remote: "203.0.113.5:8388".to_string(),
            sponsored: true,
        };
        assert!(state.is_connected());
        assert_eq!(state.status_text(), "Connected");
        assert_eq!(
            ConnectionState::Error("boom".to_string()).error_message(),
            Some("boom")
        );
    }

    #[test]
    fn disconnect_tears_down_in_order_and_releases_descriptor() {
        let mut conn = test_connection();

        // inject a live session: pipe-backed tunnel plus a running bridge
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let handle = TunnelHandle::from_fd(ours.into(), "tun-test");

        let raw_sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote_sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let bridge_config = BridgeConfig {
            mtu: 1500,
            raw_endpoint: raw_sink.local_addr().unwrap(),
            middleware_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            source_bind: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            remote: remote_sink.local_addr().unwrap(),
        };
        let bridge = DirectUdpBridge::start(
            &handle,
            &bridge_config,
            &NoProtection,
            conn.shutdown.clone(),
        )
        .unwrap();
        let protect_path = conn.settings.protect_path();
        let service = ProtectService::start(&protect_path, Arc::new(NoProtection)).unwrap();

        conn.tunnel = Some(handle);
        conn.bridge = Some(bridge);
        conn.protect_service = Some(service);
        *conn.state.lock() = ConnectionState::Connected {
            since: Instant::now(),
            remote: "test".to_string(),
            sponsored: true,
        };

        conn.disconnect();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.tunnel.is_none());
        assert!(conn.bridge.is_none());
        assert!(conn.protect_service.is_none());
        assert!(!protect_path.exists());
        // every duplicate of the tunnel descriptor is closed: the peer
        // end now has nowhere to deliver
        assert!(theirs.send(b"\x45orphan").is_err());
    }

    #[test]
    fn connect_refuses_when_already_connected() {
        let mut conn = test_connection();
        *conn.state.lock() = ConnectionState::Connected {
            since: Instant::now(),
            remote: "test".to_string(),
            sponsored: false,
        };
        let mut profile = TunnelProfile::default();
        assert!(matches!(
            conn.connect(&mut profile),
            Err(VpnError::Connection(_))
        ));
    }

    #[test]
    fn sponsored_connect_without_rendezvous_fails_before_any_tunnel() {
        let mut conn = test_connection();
        let mut profile = TunnelProfile {
            sponsored: true,
            peer_id: "missing-peer".to_string(),
            ..Default::default()
        };
        let err = conn.connect(&mut profile).unwrap_err();
        assert!(matches!(err, VpnError::RendezvousMissing(_)));
        assert!(conn.tunnel.is_none());
        assert!(matches!(conn.state(), ConnectionState::Error(_)));
    }

    #[test]
    fn unresolvable_host_with_no_network_is_fatal_setup() {
        let mut conn = test_connection();
        let mut profile = TunnelProfile {
            host: "proxy.example.com".to_string(),
            ..Default::default()
        };
        let err = conn.connect(&mut profile).unwrap_err();
        assert!(matches!(err, VpnError::NoNetwork));
        assert!(conn.tunnel.is_none());
    }
}
