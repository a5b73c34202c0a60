//! Tunnel profile types
//!
//! The profile describes one remote endpoint and the local tunnel policy
//! for a session. Persistence and editing live in the platform layer;
//! during a session the profile is read-only except for the sponsored
//! bootstrap, which patches in the dynamically negotiated endpoint before
//! the tunnel is built.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Route selection policy for the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutePolicy {
    All,
    BypassLan,
    BypassChina,
    BypassLanChina,
    Gfwlist,
    ChinaList,
    Custom,
}

impl RoutePolicy {
    /// Policies that install a default route instead of enumerated subnets.
    pub fn routes_everything(self) -> bool {
        matches!(
            self,
            RoutePolicy::All | RoutePolicy::BypassChina | RoutePolicy::Custom
        )
    }
}

/// One remote endpoint plus local tunnel policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Display name, used as the tunnel session name
    pub name: String,
    /// Remote hostname or literal address
    pub host: String,
    /// Remote port
    pub remote_port: u16,
    /// Local IPv4 address assigned to the tunnel interface
    pub local_ip: Ipv4Addr,
    /// Whether to configure IPv6 on the tunnel
    pub ipv6: bool,
    /// DNS server pushed to the tunnel
    pub remote_dns: IpAddr,
    /// Route selection policy
    pub route: RoutePolicy,
    /// Whether the per-app list below is applied at all
    pub proxy_apps: bool,
    /// true: per-app list is a deny list; false: an allow list
    pub bypass: bool,
    /// Per-app allow/deny set (package names)
    pub individual: Vec<String>,
    /// Underlying network is metered
    pub metered: bool,
    /// Sponsored session: endpoint comes from a rendezvous file and
    /// traffic is bridged through the local middleware hop
    pub sponsored: bool,
    /// Source port for the rewrite bridge, assigned by rendezvous
    pub source_port: u16,
    /// Peer identifier keying the rendezvous file
    pub peer_id: String,
    /// Local port the engine forwards raw relay traffic to
    pub socat_port: u16,
    /// Cipher name for the proxying engine
    pub method: String,
    /// Shared secret for the proxying engine
    pub password: String,
    /// Optional engine plugin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Optional engine plugin options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_opts: Option<String>,
}

impl Default for TunnelProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            remote_port: 8388,
            local_ip: Ipv4Addr::new(172, 19, 0, 1),
            ipv6: false,
            remote_dns: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            route: RoutePolicy::All,
            proxy_apps: false,
            bypass: false,
            individual: Vec::new(),
            metered: false,
            sponsored: false,
            source_port: 0,
            peer_id: String::new(),
            socat_port: 5463,
            method: "chacha20-ietf-poly1305".to_string(),
            password: String::new(),
            plugin: None,
            plugin_opts: None,
        }
    }
}
