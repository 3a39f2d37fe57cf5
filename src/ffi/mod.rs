//! Protocol core boundary
//!
//! The WireGuard engine sits behind this boundary. The adapter only ever
//! talks to it through [`ProtocolCore`]: hand it packets, receive an
//! [`IoBatch`] back, drain that batch completely. A core instance is owned
//! by value by the relay's serial context, so the `&mut self` receivers are
//! the only synchronisation it gets and the only one it needs.

mod batch;
mod handle;

pub use batch::{AddressFamily, Frame, IoBatch, Transport, UdpBatch};
pub use handle::{Handle, HandleTable};

use crate::error::Result;
use crate::wireguard::{PresharedKey, PrivateKey, PublicKey};
use bytes::Bytes;
use ipnet::IpNet;
use std::net::SocketAddr;

/// Key material and addressing for one peer the core talks to
#[derive(Debug, Clone)]
pub struct PeerParams {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Optional pre-shared key
    pub preshared_key: Option<PresharedKey>,
    /// Concrete peer endpoint
    pub endpoint: SocketAddr,
    /// Ranges routed to this peer
    pub allowed_ips: Vec<IpNet>,
    /// Persistent keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

/// Entry hop of a multihop tunnel
#[derive(Debug, Clone)]
pub struct EntryParams {
    /// Private key used towards the entry relay
    pub private_key: PrivateKey,
    /// Tunnel addresses assigned by the entry relay
    pub interface_addresses: Vec<IpNet>,
    /// The entry relay
    pub peer: PeerParams,
}

/// Everything `init_tunnel` needs
#[derive(Debug, Clone)]
pub struct TunnelParams {
    /// Local private key
    pub private_key: PrivateKey,
    /// Addresses of the virtual interface
    pub interface_addresses: Vec<IpNet>,
    /// Peers reached directly, or the exit peer when `entry` is set
    pub peers: Vec<PeerParams>,
    /// Entry hop for multihop tunnels
    pub entry: Option<EntryParams>,
}

impl TunnelParams {
    /// Whether traffic is wrapped through an entry hop
    pub fn is_multihop(&self) -> bool {
        self.entry.is_some()
    }
}

/// A live protocol instance (`drop` releases it)
pub trait ProtocolCore: Send {
    /// Packets read from the virtual interface
    fn handle_host_traffic(&mut self, packets: &[Bytes]) -> IoBatch;

    /// Datagrams received from the UDP session to `from`
    fn handle_tunnel_traffic(&mut self, from: SocketAddr, datagrams: &[Bytes]) -> IoBatch;

    /// Periodic maintenance (keepalives, handshake retries)
    fn handle_timer_event(&mut self) -> IoBatch;
}

/// Creates protocol instances
pub trait ProtocolCoreFactory: Send + Sync {
    /// Initialise a new instance for the given parameters
    fn init_tunnel(&self, params: &TunnelParams) -> Result<Box<dyn ProtocolCore>>;
}
