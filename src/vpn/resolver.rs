//! Capability-aware host resolution
//!
//! Resolving DNS on a specific network is awkward at the platform level,
//! so the profile host is turned into a literal address up front, before
//! the tunnel is built. Resolution is staged: literal passthrough, hosts
//! override, a general unbound lookup, and finally a lookup bound to the
//! active network with the results filtered by its IPv4/IPv6 capability.

use super::{VpnError, VpnResult};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// IPv4/IPv6 capability snapshot of a network.
///
/// Consulted per resolution call, never cached beyond it; the active
/// network can change between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkCapability {
    pub has_v4: bool,
    pub has_v6: bool,
}

/// Handle to a physical network, as reported by the platform monitor.
#[derive(Debug, Clone)]
pub struct Network {
    /// Interface name, e.g. "wlan0"
    pub interface: String,
    /// Local IPv4 address to bind network-specific sockets to
    pub bind_v4: Option<Ipv4Addr>,
    /// Local IPv6 address to bind network-specific sockets to
    pub bind_v6: Option<Ipv6Addr>,
}

impl Network {
    /// Preferred local address for binding resolver sockets.
    pub fn bind_addr(&self) -> Option<IpAddr> {
        self.bind_v4
            .map(IpAddr::V4)
            .or(self.bind_v6.map(IpAddr::V6))
    }
}

/// Read-only hosts override table. No side effects.
pub trait HostsFile: Send + Sync {
    fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// Static in-memory hosts table.
#[derive(Debug, Default)]
pub struct StaticHostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticHostsFile {
    pub fn new(entries: HashMap<String, Vec<IpAddr>>) -> Self {
        Self { entries }
    }
}

impl HostsFile for StaticHostsFile {
    fn resolve(&self, host: &str) -> Vec<IpAddr> {
        self.entries.get(host).cloned().unwrap_or_default()
    }
}

/// Platform network monitor: supplies the active physical network and
/// its capability.
pub trait NetworkMonitor: Send + Sync {
    fn active_network(&self) -> Option<Network>;
    fn capability(&self, network: &Network) -> NetworkCapability;
}

/// DNS backend seam. `bind` of None resolves unbound to any interface.
pub trait DnsLookup: Send + Sync {
    fn lookup(&self, host: &str, bind: Option<IpAddr>) -> io::Result<Vec<IpAddr>>;
}

/// Production DNS backend.
///
/// Uses the system resolver configuration when readable, falling back to
/// a public resolver. The public API stays blocking; lookups run on a
/// small owned current-thread runtime.
pub struct SystemDns {
    runtime: tokio::runtime::Runtime,
}

impl SystemDns {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    fn resolver_config(bind: Option<IpAddr>) -> (ResolverConfig, ResolverOpts) {
        let (config, opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Resolver: system config unreadable ({}), using public DNS", e);
                (public_resolver_config(), ResolverOpts::default())
            }
        };

        let config = match bind {
            None => config,
            Some(bind_ip) => {
                let mut bound = ResolverConfig::new();
                for ns in config.name_servers() {
                    let mut ns = ns.clone();
                    ns.bind_addr = Some(SocketAddr::new(bind_ip, 0));
                    bound.add_name_server(ns);
                }
                bound
            }
        };
        (config, opts)
    }
}

impl DnsLookup for SystemDns {
    fn lookup(&self, host: &str, bind: Option<IpAddr>) -> io::Result<Vec<IpAddr>> {
        let (config, opts) = Self::resolver_config(bind);
        let host = host.to_string();
        self.runtime.block_on(async move {
            let resolver = TokioAsyncResolver::tokio(config, opts);
            let lookup = resolver
                .lookup_ip(host.as_str())
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(lookup.iter().collect())
        })
    }
}

fn public_resolver_config() -> ResolverConfig {
    let mut config = ResolverConfig::new();
    for ip in [
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
        IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
    ] {
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(ip, 53),
            Protocol::Udp,
        ));
    }
    config
}

/// Resolves a profile host to one usable literal address.
pub struct HostResolver {
    hosts: Arc<dyn HostsFile>,
    monitor: Arc<dyn NetworkMonitor>,
    dns: Arc<dyn DnsLookup>,
}

impl HostResolver {
    pub fn new(
        hosts: Arc<dyn HostsFile>,
        monitor: Arc<dyn NetworkMonitor>,
        dns: Arc<dyn DnsLookup>,
    ) -> Self {
        Self {
            hosts,
            monitor,
            dns,
        }
    }

    /// Resolve `host` to a single literal address.
    ///
    /// Stages, first hit wins:
    /// 1. literal addresses pass through unchanged, no network activity;
    /// 2. the hosts override table;
    /// 3. a general lookup unbound to any interface, where I/O failure
    ///    means "no result" rather than a fatal error;
    /// 4. a lookup bound to the active network, with candidates that the
    ///    network cannot carry filtered out. No active network at this
    ///    stage is fatal (`NoNetwork`).
    ///
    /// Exhausting all stages fails `HostUnresolved`.
    pub fn resolve(&self, host: &str) -> VpnResult<IpAddr> {
        if let Ok(literal) = host.parse::<IpAddr>() {
            return Ok(literal);
        }

        if let Some(addr) = self.hosts.resolve(host).into_iter().next() {
            log::debug!("Resolver: {} found in hosts override", host);
            return Ok(addr);
        }

        match self.dns.lookup(host, None) {
            Ok(addrs) => {
                if let Some(addr) = addrs.into_iter().next() {
                    return Ok(addr);
                }
            }
            Err(e) => log::debug!("Resolver: general lookup for {} failed: {}", host, e),
        }

        let network = self.monitor.active_network().ok_or(VpnError::NoNetwork)?;
        let capability = self.monitor.capability(&network);
        let addrs = self
            .dns
            .lookup(host, network.bind_addr())
            .unwrap_or_default();
        addrs
            .into_iter()
            .find(|addr| match addr {
                IpAddr::V4(_) => capability.has_v4,
                IpAddr::V6(_) => capability.has_v6,
            })
            .ok_or_else(|| VpnError::HostUnresolved(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EmptyHosts;
    impl HostsFile for EmptyHosts {
        fn resolve(&self, _host: &str) -> Vec<IpAddr> {
            Vec::new()
        }
    }

    struct FakeMonitor {
        network: Option<Network>,
        capability: NetworkCapability,
    }
    impl NetworkMonitor for FakeMonitor {
        fn active_network(&self) -> Option<Network> {
            self.network.clone()
        }
        fn capability(&self, _network: &Network) -> NetworkCapability {
            self.capability
        }
    }

    /// Records lookups; `unbound` answers bind=None, `bound` answers the rest.
    struct FakeDns {
        unbound: io::Result<Vec<IpAddr>>,
        bound: io::Result<Vec<IpAddr>>,
        calls: Mutex<Vec<Option<IpAddr>>>,
    }
    impl FakeDns {
        fn new(unbound: io::Result<Vec<IpAddr>>, bound: io::Result<Vec<IpAddr>>) -> Self {
            Self {
                unbound,
                bound,
                calls: Mutex::new(Vec::new()),
            }
        }
        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }
    impl DnsLookup for FakeDns {
        fn lookup(&self, _host: &str, bind: Option<IpAddr>) -> io::Result<Vec<IpAddr>> {
            self.calls.lock().unwrap().push(bind);
            let source = if bind.is_none() {
                &self.unbound
            } else {
                &self.bound
            };
            match source {
                Ok(addrs) => Ok(addrs.clone()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn io_fail() -> io::Result<Vec<IpAddr>> {
        Err(io::Error::new(io::ErrorKind::Other, "lookup failed"))
    }

    fn wifi(bind: Option<Ipv4Addr>) -> Network {
        Network {
            interface: "wlan0".to_string(),
            bind_v4: bind,
            bind_v6: None,
        }
    }

    #[test]
    fn literal_addresses_pass_through_without_network_activity() {
        let dns = Arc::new(FakeDns::new(io_fail(), io_fail()));
        let resolver = HostResolver::new(
            Arc::new(EmptyHosts),
            Arc::new(FakeMonitor {
                network: None,
                capability: NetworkCapability {
                    has_v4: true,
                    has_v6: true,
                },
            }),
            dns.clone(),
        );
        assert_eq!(
            resolver.resolve("198.51.100.7").unwrap(),
            "198.51.100.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolver.resolve("2001:db8::1").unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(dns.call_count(), 0);
    }

    #[test]
    fn hosts_override_wins_over_dns() {
        let mut entries = HashMap::new();
        entries.insert(
            "proxy.example.com".to_string(),
            vec!["203.0.113.9".parse().unwrap(), "203.0.113.10".parse().unwrap()],
        );
        let dns = Arc::new(FakeDns::new(io_fail(), io_fail()));
        let resolver = HostResolver::new(
            Arc::new(StaticHostsFile::new(entries)),
            Arc::new(FakeMonitor {
                network: None,
                capability: NetworkCapability {
                    has_v4: true,
                    has_v6: true,
                },
            }),
            dns.clone(),
        );
        assert_eq!(
            resolver.resolve("proxy.example.com").unwrap(),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(dns.call_count(), 0);
    }

    #[test]
    fn no_network_and_no_hosts_entry_fails_no_network() {
        let resolver = HostResolver::new(
            Arc::new(EmptyHosts),
            Arc::new(FakeMonitor {
                network: None,
                capability: NetworkCapability {
                    has_v4: true,
                    has_v6: true,
                },
            }),
            Arc::new(FakeDns::new(io_fail(), io_fail())),
        );
        assert!(matches!(
            resolver.resolve("proxy.example.com"),
            Err(VpnError::NoNetwork)
        ));
    }

    #[test]
    fn capability_filter_drops_unsupported_families() {
        // v4-only results on a v6-only network: nothing survives
        let bound = Ok(vec!["203.0.113.9".parse().unwrap()]);
        let resolver = HostResolver::new(
            Arc::new(EmptyHosts),
            Arc::new(FakeMonitor {
                network: Some(wifi(Some(Ipv4Addr::new(192, 168, 1, 5)))),
                capability: NetworkCapability {
                    has_v4: false,
                    has_v6: true,
                },
            }),
            Arc::new(FakeDns::new(io_fail(), bound)),
        );
        assert!(matches!(
            resolver.resolve("proxy.example.com"),
            Err(VpnError::HostUnresolved(_))
        ));
    }

    #[test]
    fn bound_lookup_returns_first_capable_candidate() {
        let bound = Ok(vec![
            "203.0.113.9".parse().unwrap(),
            "2001:db8::9".parse().unwrap(),
        ]);
        let resolver = HostResolver::new(
            Arc::new(EmptyHosts),
            Arc::new(FakeMonitor {
                network: Some(wifi(Some(Ipv4Addr::new(192, 168, 1, 5)))),
                capability: NetworkCapability {
                    has_v4: false,
                    has_v6: true,
                },
            }),
            Arc::new(FakeDns::new(io_fail(), bound)),
        );
        assert_eq!(
            resolver.resolve("proxy.example.com").unwrap(),
            "2001:db8::9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn general_lookup_failure_is_not_fatal() {
        // unbound lookup errors, bound lookup succeeds
        let bound = Ok(vec!["203.0.113.9".parse().unwrap()]);
        let dns = Arc::new(FakeDns::new(io_fail(), bound));
        let resolver = HostResolver::new(
            Arc::new(EmptyHosts),
            Arc::new(FakeMonitor {
                network: Some(wifi(Some(Ipv4Addr::new(192, 168, 1, 5)))),
                capability: NetworkCapability {
                    has_v4: true,
                    has_v6: true,
                },
            }),
            dns.clone(),
        );
        assert_eq!(
            resolver.resolve("proxy.example.com").unwrap(),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(dns.call_count(), 2);
    }
}
