//! Sponsored bootstrap: rendezvous file consumption
//!
//! A sponsoring peer drops a one-shot file at
//! `<shared-storage>/driller_remote/<peerID>` containing the negotiated
//! remote endpoint and our source port, one line:
//!
//! ```text
//! <scheme>://[host]:port,key=<sourcePort>
//! ```
//!
//! The line is validated into a typed endpoint before the profile is
//! touched, so a malformed file can never leave a partially updated
//! profile behind. On success the file is deleted; it is consumed
//! exactly once per session.

use super::profile::TunnelProfile;
use super::{VpnError, VpnResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Fully validated rendezvous endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousEndpoint {
    pub host: String,
    pub remote_port: u16,
    pub source_port: u16,
}

/// Path of the rendezvous file for a peer.
pub fn rendezvous_path(rendezvous_dir: &Path, peer_id: &str) -> PathBuf {
    rendezvous_dir.join(peer_id)
}

/// Parse one rendezvous line into a typed endpoint.
///
/// `udp://[::1]:51820,key=4000` yields host `::1`, remote port 51820,
/// source port 4000. Exactly two comma-separated fields are required.
pub fn parse_rendezvous_line(line: &str) -> VpnResult<RendezvousEndpoint> {
    if line.trim().is_empty() {
        return Err(VpnError::RendezvousEmpty);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 2 {
        return Err(VpnError::RendezvousMalformed(line.to_string()));
    }

    // field 0: scheme://[host]:port, host between scheme separator and the
    // last colon, brackets stripped
    let endpoint = fields[0];
    let host_port = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let (host_raw, port_str) = host_port
        .rsplit_once(':')
        .ok_or_else(|| VpnError::RendezvousMalformed(line.to_string()))?;
    let host = host_raw
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(VpnError::RendezvousMalformed(line.to_string()));
    }
    let remote_port: u16 = port_str
        .parse()
        .map_err(|_| VpnError::RendezvousMalformed(line.to_string()))?;

    // field 1: key=<sourcePort>, numeric suffix after the last '='
    let source_port: u16 = fields[1]
        .rsplit_once('=')
        .map(|(_, port)| port)
        .ok_or_else(|| VpnError::RendezvousMalformed(line.to_string()))?
        .parse()
        .map_err(|_| VpnError::RendezvousMalformed(line.to_string()))?;

    Ok(RendezvousEndpoint {
        host,
        remote_port,
        source_port,
    })
}

/// Consume the rendezvous file for the profile's peer and patch the
/// negotiated endpoint into the profile.
///
/// The file must exist (`RendezvousMissing`) and hold one well-formed,
/// non-blank line (`RendezvousEmpty` / `RendezvousMalformed`). Validation
/// happens before any mutation; the file is deleted only after a fully
/// valid parse.
pub fn consume_rendezvous(
    rendezvous_dir: &Path,
    profile: &mut TunnelProfile,
) -> VpnResult<RendezvousEndpoint> {
    let path = rendezvous_path(rendezvous_dir, &profile.peer_id);
    if !path.exists() {
        return Err(VpnError::RendezvousMissing(path));
    }

    let contents = fs::read_to_string(&path)?;
    let line = contents.lines().next().unwrap_or("");
    let endpoint = parse_rendezvous_line(line)?;

    profile.host = endpoint.host.clone();
    profile.remote_port = endpoint.remote_port;
    profile.source_port = endpoint.source_port;
    log::info!(
        "Rendezvous: peer {} negotiated {}:{} (source port {})",
        profile.peer_id,
        endpoint.host,
        endpoint.remote_port,
        endpoint.source_port
    );

    if let Err(e) = fs::remove_file(&path) {
        log::warn!("Rendezvous: failed to delete {}: {}", path.display(), e);
    }
    Ok(endpoint)
}
