//! Virtual interface construction
//!
//! Builds the tun device for a session: addresses, routes, DNS, and the
//! per-app policy, all derived from the profile. Route and address
//! computation is pure (`TunnelConfig`); establishment creates the device
//! via tun-rs and applies the configuration with `ip` commands.
//!
//! REQUIREMENTS:
//! - CAP_NET_ADMIN (or root) to create tun interfaces

use super::profile::{RoutePolicy, TunnelProfile};
use super::{VpnError, VpnResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::process::Command;
use std::str::FromStr;
use tun_rs::DeviceBuilder;

/// Fixed tunnel MTU
pub const VPN_MTU: u16 = 1500;

/// Private-range IPv6 address assigned to the client side of the tunnel
pub const PRIVATE_VLAN6_CLIENT: Ipv6Addr = Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 1);
/// Router side of the private IPv6 range, handed to the proxying engine
pub const PRIVATE_VLAN6_ROUTER: Ipv6Addr = Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 2);

/// IPv4 subnets routed into the tunnel by selective policies: everything
/// except private, loopback, link-local, CGNAT, and multicast ranges.
const BYPASS_PRIVATE_ROUTES: &[&str] = &[
    "1.0.0.0/8",
    "2.0.0.0/7",
    "4.0.0.0/6",
    "8.0.0.0/7",
    "11.0.0.0/8",
    "12.0.0.0/6",
    "16.0.0.0/4",
    "32.0.0.0/3",
    "64.0.0.0/3",
    "96.0.0.0/6",
    "100.0.0.0/10",
    "100.128.0.0/9",
    "101.0.0.0/8",
    "102.0.0.0/7",
    "104.0.0.0/5",
    "112.0.0.0/5",
    "120.0.0.0/6",
    "124.0.0.0/7",
    "126.0.0.0/8",
    "128.0.0.0/3",
    "160.0.0.0/5",
    "168.0.0.0/8",
    "169.0.0.0/9",
    "169.128.0.0/10",
    "169.192.0.0/11",
    "169.224.0.0/12",
    "169.240.0.0/13",
    "169.248.0.0/14",
    "169.252.0.0/15",
    "169.255.0.0/16",
    "170.0.0.0/7",
    "172.0.0.0/12",
    "172.32.0.0/11",
    "172.64.0.0/10",
    "172.128.0.0/9",
    "173.0.0.0/8",
    "174.0.0.0/7",
    "176.0.0.0/4",
    "192.0.0.0/9",
    "192.128.0.0/11",
    "192.160.0.0/13",
    "192.169.0.0/16",
    "192.170.0.0/15",
    "192.172.0.0/14",
    "192.176.0.0/12",
    "192.192.0.0/10",
    "193.0.0.0/8",
    "194.0.0.0/7",
    "196.0.0.0/6",
    "200.0.0.0/5",
    "208.0.0.0/4",
];

/// An address/prefix pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        Self { addr, prefix }
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| format!("invalid address in subnet: {}", s))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_str {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| format!("invalid prefix in subnet: {}", s))?,
            None => max,
        };
        if prefix > max {
            return Err(format!("prefix out of range in subnet: {}", s));
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Inactive,
    Establishing,
    Active,
    Closing,
}

/// Owned descriptor to the virtual interface.
///
/// Exactly one handle exists per active session; the session owns it
/// exclusively and releases it only after all relay workers have stopped.
#[derive(Debug)]
pub struct TunnelHandle {
    fd: OwnedFd,
    name: String,
    state: TunnelState,
    metered: bool,
}

impl TunnelHandle {
    /// Wrap an already-open descriptor. The handle starts Active; this is
    /// the seam the relay tests use in place of a real tun device.
    pub fn from_fd(fd: OwnedFd, name: impl Into<String>) -> Self {
        Self {
            fd,
            name: name.into(),
            state: TunnelState::Active,
            metered: false,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_metered(&self) -> bool {
        self.metered
    }

    /// Duplicate the descriptor for a relay worker. The handle itself
    /// stays with the session.
    pub fn dup(&self) -> std::io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Release the descriptor. Must only be called after every relay
    /// worker has stopped.
    pub fn close(mut self) {
        self.state = TunnelState::Closing;
        log::info!("Tunnel: releasing descriptor for {}", self.name);
        // fd drops here
    }
}

impl AsFd for TunnelHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for TunnelHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Fully computed tunnel configuration, derived from a profile.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub session_name: String,
    pub mtu: u16,
    pub address4: (Ipv4Addr, u8),
    pub address6: Option<(Ipv6Addr, u8)>,
    pub dns: IpAddr,
    pub routes: Vec<Subnet>,
    pub allowed_apps: Vec<String>,
    pub disallowed_apps: Vec<String>,
    pub metered: bool,
}

impl TunnelConfig {
    /// Derive the full interface configuration from a profile.
    ///
    /// `own_package` is the controlling application's own process name; it
    /// is excluded from the per-app set except in allow mode, where the
    /// controller must be able to reach the engine through the tunnel.
    pub fn from_profile(profile: &TunnelProfile, own_package: &str) -> Self {
        let mut allowed_apps = Vec::new();
        let mut disallowed_apps = Vec::new();
        if profile.proxy_apps {
            let individual: Vec<String> = profile
                .individual
                .iter()
                .filter(|pkg| pkg.as_str() != own_package)
                .cloned()
                .collect();
            if profile.bypass {
                disallowed_apps = individual;
            } else {
                allowed_apps = individual;
                allowed_apps.push(own_package.to_string());
            }
        }

        Self {
            session_name: profile.name.clone(),
            mtu: VPN_MTU,
            address4: (profile.local_ip, 24),
            address6: profile.ipv6.then_some((PRIVATE_VLAN6_CLIENT, 126)),
            dns: profile.remote_dns,
            routes: compute_routes(profile),
            allowed_apps,
            disallowed_apps,
            metered: profile.metered,
        }
    }
}

fn compute_routes(profile: &TunnelProfile) -> Vec<Subnet> {
    let mut routes = Vec::new();
    if profile.route.routes_everything() {
        routes.push(Subnet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        if profile.ipv6 {
            routes.push(Subnet::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0));
        }
    } else {
        for cidr in BYPASS_PRIVATE_ROUTES {
            routes.push(cidr.parse().expect("static route table entry"));
        }
        let dns_prefix = if profile.remote_dns.is_ipv4() { 32 } else { 128 };
        routes.push(Subnet::new(profile.remote_dns, dns_prefix));
        if profile.ipv6 {
            // broad fallback covering globally routable IPv6
            routes.push(Subnet::new(
                IpAddr::V6(Ipv6Addr::new(0x2000, 0, 0, 0, 0, 0, 0, 0)),
                3,
            ));
        }
    }
    routes
}

/// Create the tun device and apply a configuration to it.
///
/// Establishment failure is fatal (`NoTunnel`); the caller distinguishes
/// it from expected environment-driven disconnects.
pub fn establish(config: &TunnelConfig) -> VpnResult<TunnelHandle> {
    log::info!(
        "Tunnel: establishing interface for session '{}'",
        config.session_name
    );

    let device = DeviceBuilder::new()
        .mtu(config.mtu)
        .build_sync()
        .map_err(|e| {
            log::error!("Tunnel: failed to create tun device: {}", e);
            VpnError::NoTunnel
        })?;

    let name = device.name().map_err(|e| {
        log::error!("Tunnel: failed to read interface name: {}", e);
        VpnError::NoTunnel
    })?;

    // Keep our own reference to the packet endpoint; the device wrapper
    // is dropped once configuration is done.
    let raw = nix::unistd::dup(device.as_raw_fd()).map_err(|e| {
        log::error!("Tunnel: failed to duplicate tun descriptor: {}", e);
        VpnError::NoTunnel
    })?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut handle = TunnelHandle {
        fd,
        name: name.clone(),
        state: TunnelState::Establishing,
        metered: config.metered,
    };

    configure_interface(&name, config)?;
    drop(device);

    handle.state = TunnelState::Active;
    log::info!(
        "Tunnel: {} active (mtu {}, {} routes, dns {})",
        name,
        config.mtu,
        config.routes.len(),
        config.dns
    );
    Ok(handle)
}

/// Apply addresses and routes with `ip` commands, the same way the
/// platform tooling does.
fn configure_interface(name: &str, config: &TunnelConfig) -> VpnResult<()> {
    let (addr4, prefix4) = config.address4;
    run_ip(&[
        "addr",
        "add",
        &format!("{}/{}", addr4, prefix4),
        "dev",
        name,
    ])?;

    if let Some((addr6, prefix6)) = config.address6 {
        run_ip(&[
            "-6",
            "addr",
            "add",
            &format!("{}/{}", addr6, prefix6),
            "dev",
            name,
        ])?;
    }

    run_ip(&["link", "set", name, "up"])?;

    for route in &config.routes {
        let cidr = route.to_string();
        if route.addr.is_ipv4() {
            run_ip(&["route", "add", &cidr, "dev", name])?;
        } else {
            run_ip(&["-6", "route", "add", &cidr, "dev", name])?;
        }
    }
    Ok(())
}

fn run_ip(args: &[&str]) -> VpnResult<()> {
    let output = Command::new("ip").args(args).output().map_err(|e| {
        log::error!("Tunnel: failed to run ip {:?}: {}", args, e);
        VpnError::NoTunnel
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::error!("Tunnel: ip {:?} failed: {}", args, stderr.trim());
        return Err(VpnError::NoTunnel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_profile() -> TunnelProfile {
        TunnelProfile {
            name: "test".to_string(),
            host: "203.0.113.5".to_string(),
            remote_dns: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ..Default::default()
        }
    }

    #[test]
    fn subnet_parses_with_and_without_prefix() {
        let s: Subnet = "192.168.0.0/16".parse().unwrap();
        assert_eq!(s.prefix, 16);
        let s: Subnet = "8.8.8.8".parse().unwrap();
        assert_eq!(s.prefix, 32);
        let s: Subnet = "2000::/3".parse().unwrap();
        assert_eq!(s.prefix, 3);
        assert!("300.0.0.0/8".parse::<Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
    }

    #[test]
    fn route_everything_policy_installs_default_routes() {
        let mut profile = base_profile();
        profile.route = RoutePolicy::All;
        profile.ipv6 = true;
        let config = TunnelConfig::from_profile(&profile, "io.driller.app");
        assert_eq!(
            config.routes,
            vec![
                Subnet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                Subnet::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            ]
        );
    }

    #[test]
    fn selective_policy_installs_bypass_subnets_and_dns_host_route() {
        let mut profile = base_profile();
        profile.route = RoutePolicy::BypassLan;
        profile.ipv6 = true;
        let config = TunnelConfig::from_profile(&profile, "io.driller.app");
        // enumerated subnets + dns host route + v6 fallback
        assert_eq!(config.routes.len(), BYPASS_PRIVATE_ROUTES.len() + 2);
        assert!(config
            .routes
            .contains(&Subnet::new(profile.remote_dns, 32)));
        assert!(config.routes.iter().any(|s| s.prefix == 3));
        // private ranges are not routed into the tunnel
        assert!(!config
            .routes
            .contains(&Subnet::new("192.168.0.0".parse().unwrap(), 16)));
    }

    #[test]
    fn per_app_deny_list_excludes_own_package() {
        let mut profile = base_profile();
        profile.proxy_apps = true;
        profile.bypass = true;
        profile.individual = vec![
            "com.example.game".to_string(),
            "io.driller.app".to_string(),
        ];
        let config = TunnelConfig::from_profile(&profile, "io.driller.app");
        assert_eq!(config.disallowed_apps, vec!["com.example.game"]);
        assert!(config.allowed_apps.is_empty());
    }

    #[test]
    fn per_app_allow_list_adds_own_package_back() {
        let mut profile = base_profile();
        profile.proxy_apps = true;
        profile.bypass = false;
        profile.individual = vec![
            "com.example.game".to_string(),
            "io.driller.app".to_string(),
        ];
        let config = TunnelConfig::from_profile(&profile, "io.driller.app");
        assert_eq!(
            config.allowed_apps,
            vec!["com.example.game", "io.driller.app"]
        );
        assert!(config.disallowed_apps.is_empty());
    }

    #[test]
    fn ipv6_address_only_when_enabled() {
        let mut profile = base_profile();
        profile.ipv6 = false;
        let config = TunnelConfig::from_profile(&profile, "io.driller.app");
        assert!(config.address6.is_none());

        profile.ipv6 = true;
        let config = TunnelConfig::from_profile(&profile, "io.driller.app");
        assert_eq!(config.address6, Some((PRIVATE_VLAN6_CLIENT, 126)));
    }

    #[test]
    fn handle_duplicates_descriptor_for_workers() {
        let (a, _b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        let handle = TunnelHandle::from_fd(a.into(), "tun-test");
        assert_eq!(handle.state(), TunnelState::Active);
        let dup = handle.dup().unwrap();
        assert_ne!(dup.as_raw_fd(), handle.as_raw_fd());
        handle.close();
    }
}
