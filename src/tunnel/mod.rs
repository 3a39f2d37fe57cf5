//! Tunnel adapter components
//!
//! Leaves first: [`NetworkSettings`] is built from a configuration,
//! [`UdpSessionManager`] pools the peer sessions, [`PacketRelayEngine`]
//! moves packets between the interface, the protocol core and those
//! sessions, and [`TunnelAdapter`] is the facade on top.
//! [`ExcludedUdpSessionBridge`] serves sessions that bypass the tunnel.

mod adapter;
mod excluded;
mod plan;
mod relay;
mod sessions;
mod settings;

pub use adapter::{TunnelAdapter, TunnelState};
pub use excluded::{ExcludedSessionCallbacks, ExcludedUdpSessionBridge};
pub use plan::TunnelPlan;
pub use relay::PacketRelayEngine;
pub use sessions::{AddressKey, EventSink, SessionEvent, SessionLifecycle, UdpSessionManager};
pub use settings::{
    clamp_ipv6_prefix, DnsSettings, Ipv4InterfaceAddress, Ipv4Settings, Ipv6Settings,
    NetworkSettings, MIN_IPV6_PREFIX, PLACEHOLDER_REMOTE_ADDRESS,
};
