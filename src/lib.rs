//! Driller Core Library
//!
//! Core functionality for the Driller VPN service: virtual interface
//! construction, socket protection, host resolution, and the relay
//! engines that move packets once the tunnel is up. Used by the
//! platform service layer.

pub mod settings;
pub mod vpn;

// Re-export commonly used items
pub use settings::Settings;
pub use vpn::ShutdownSignal;
pub use vpn::VpnError;
pub use vpn::VpnResult;
pub use vpn::bridge::DirectUdpBridge;
pub use vpn::connection::{ConnectionState, VpnConnection};
pub use vpn::profile::{RoutePolicy, TunnelProfile};
pub use vpn::resolver::HostResolver;
pub use vpn::tunnel::{TunnelHandle, TunnelState};
