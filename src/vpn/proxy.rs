//! Generated engine configuration and command lines
//!
//! The proxying engine runs as an external process; this module derives
//! its JSON configuration and argv from the profile. For sponsored
//! sessions the configuration points the engine at the local middleware
//! hop instead of the configured remote — the substitution happens on a
//! serialization view, the profile itself is never touched. Process
//! supervision belongs to the external process manager.

use super::profile::TunnelProfile;
use super::tunnel::{PRIVATE_VLAN6_ROUTER, VPN_MTU};
use super::{VpnError, VpnResult};
use crate::settings::Settings;
use serde_json::json;
use std::fs;
use std::path::Path;

/// Engine configuration document, remote substituted with the local
/// middleware hop.
pub fn engine_config_json(profile: &TunnelProfile, settings: &Settings) -> serde_json::Value {
    let mut config = json!({
        "server": settings.listen_address.to_string(),
        "server_port": settings.port_local_middleware,
        "password": profile.password,
        "method": profile.method,
    });
    if let Some(plugin) = &profile.plugin {
        config["plugin"] = json!(plugin);
        config["plugin_opts"] = json!(profile.plugin_opts.as_deref().unwrap_or(""));
    }
    config
}

/// Write the engine configuration to `path`.
///
/// The file carries credentials; callers place it inside the private
/// directory.
pub fn write_engine_config(
    profile: &TunnelProfile,
    settings: &Settings,
    path: &Path,
) -> VpnResult<()> {
    let config = engine_config_json(profile, settings);
    let text = serde_json::to_string_pretty(&config)
        .map_err(|e| VpnError::Connection(format!("failed to serialize engine config: {}", e)))?;
    fs::write(path, text)?;
    log::debug!("Proxy: engine config written to {}", path.display());
    Ok(())
}

/// Argv for the proxying engine. `extra_args` is the per-service-mode
/// suffix (the tunnel service appends "-V").
pub fn engine_command(
    profile: &TunnelProfile,
    settings: &Settings,
    config_path: &Path,
    extra_args: &[&str],
) -> Vec<String> {
    let mut cmd = vec![
        "-b".to_string(),
        settings.listen_address.to_string(),
        "-u".to_string(),
        "-l".to_string(),
        settings.port_local_raw.to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{}", profile.socat_port),
        "-c".to_string(),
        config_path.display().to_string(),
    ];
    cmd.extend(extra_args.iter().map(|s| s.to_string()));
    cmd
}

/// Argv for the tun2socks helper used on non-sponsored sessions, which
/// consumes the handed-off tunnel descriptor.
pub fn tun2socks_command(profile: &TunnelProfile, settings: &Settings) -> Vec<String> {
    let mut cmd = vec![
        "--netif-ipaddr".to_string(),
        profile.local_ip.to_string(),
        "--socks-server-addr".to_string(),
        format!("{}:{}", profile.host, profile.remote_port),
        "--tunmtu".to_string(),
        VPN_MTU.to_string(),
        "--sock-path".to_string(),
        "sock_path".to_string(),
        "--dnsgw".to_string(),
        format!("127.0.0.1:{}", settings.port_local_dns),
        "--loglevel".to_string(),
        "warning".to_string(),
    ];
    if profile.ipv6 {
        cmd.push("--netif-ip6addr".to_string());
        cmd.push(PRIVATE_VLAN6_ROUTER.to_string());
    }
    cmd.push("--enable-udprelay".to_string());
    cmd
}
