//! boringtun-backed protocol core
//!
//! One boringtun `Tunn` per peer, since a `Tunn` is a single pairwise
//! session. Outbound packets are routed to the peer whose allowed IPs
//! hold the longest matching prefix for the destination; inbound datagrams
//! are matched to a peer by the endpoint they came from.
//!
//! In multihop mode the exit hop's ciphertext is wrapped into an IP/UDP
//! packet addressed to the exit relay and encrypted a second time for the
//! entry relay. Only the entry relay is ever contacted directly.

use crate::error::{AdapterError, Result};
use crate::ffi::{
    AddressFamily, Frame, IoBatch, PeerParams, ProtocolCore, ProtocolCoreFactory, TunnelParams,
};
use crate::wireguard::packet::{build_udp_packet, destination_ip, parse_udp_packet};
use crate::wireguard::PrivateKey;
use boringtun::noise::{Tunn, TunnResult};
use bytes::Bytes;
use ipnet::IpNet;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, trace};

/// Scratch buffer size; large enough for any IP packet plus WireGuard overhead
const MAX_PACKET_SIZE: usize = 65535 + 256;

/// Something boringtun asked us to deliver
enum Output {
    Network(Bytes),
    Tunnel(AddressFamily, Bytes),
}

struct PeerTunnel {
    endpoint: SocketAddr,
    allowed_ips: Vec<IpNet>,
    tunn: Tunn,
}

impl PeerTunnel {
    fn new(private_key: &PrivateKey, peer: &PeerParams, index: u32) -> Result<Self> {
        let tunn = Tunn::new(
            private_key.to_static_secret(),
            peer.public_key.to_x25519(),
            peer.preshared_key.as_ref().map(|psk| *psk.as_bytes()),
            peer.persistent_keepalive.filter(|secs| *secs > 0),
            index,
            None,
        )
        .map_err(|e| {
            AdapterError::Core(format!(
                "Failed to create tunnel for peer {}: {}",
                peer.endpoint, e
            ))
        })?;

        Ok(Self {
            endpoint: peer.endpoint,
            allowed_ips: peer.allowed_ips.clone(),
            tunn,
        })
    }

    fn encapsulate(&mut self, packet: &[u8], buf: &mut [u8]) -> Option<Bytes> {
        match self.tunn.encapsulate(packet, buf) {
            TunnResult::WriteToNetwork(data) => Some(Bytes::copy_from_slice(data)),
            TunnResult::Err(e) => {
                debug!("Encapsulation for {} failed: {:?}", self.endpoint, e);
                None
            }
            _ => None,
        }
    }

    fn decapsulate(&mut self, datagram: &[u8], buf: &mut [u8], out: &mut Vec<Output>) {
        match self.tunn.decapsulate(Some(self.endpoint.ip()), datagram, buf) {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                debug!("Decapsulation from {} failed: {:?}", self.endpoint, e);
            }
            TunnResult::WriteToNetwork(data) => {
                out.push(Output::Network(Bytes::copy_from_slice(data)));
                // Flush anything queued behind the handshake
                while let TunnResult::WriteToNetwork(data) = self.tunn.decapsulate(None, &[], buf) {
                    out.push(Output::Network(Bytes::copy_from_slice(data)));
                }
            }
            TunnResult::WriteToTunnelV4(data, _) => {
                out.push(Output::Tunnel(AddressFamily::V4, Bytes::copy_from_slice(data)));
            }
            TunnResult::WriteToTunnelV6(data, _) => {
                out.push(Output::Tunnel(AddressFamily::V6, Bytes::copy_from_slice(data)));
            }
        }
    }

    fn update_timers(&mut self, buf: &mut [u8]) -> Option<Bytes> {
        match self.tunn.update_timers(buf) {
            TunnResult::WriteToNetwork(data) => Some(Bytes::copy_from_slice(data)),
            TunnResult::Err(e) => {
                trace!("Timer update for {}: {:?}", self.endpoint, e);
                None
            }
            _ => None,
        }
    }

    fn longest_match(&self, destination: IpAddr) -> Option<u8> {
        self.allowed_ips
            .iter()
            .filter(|net| net.contains(&destination))
            .map(IpNet::prefix_len)
            .max()
    }
}

/// Entry relay plus the inner source address exit traffic is sent from
struct EntryHop {
    tunnel: PeerTunnel,
    source: SocketAddr,
}

/// [`ProtocolCore`] implemented on boringtun
pub struct BoringtunCore {
    peers: Vec<PeerTunnel>,
    entry: Option<EntryHop>,
    buffer: Vec<u8>,
}

impl BoringtunCore {
    /// Build a core for the given tunnel parameters
    pub fn new(params: &TunnelParams) -> Result<Self> {
        if params.peers.is_empty() {
            return Err(AdapterError::Core("Tunnel has no peers".to_string()));
        }

        let mut peers = Vec::with_capacity(params.peers.len());
        for (index, peer) in params.peers.iter().enumerate() {
            peers.push(PeerTunnel::new(&params.private_key, peer, index as u32)?);
        }

        let entry = match &params.entry {
            Some(entry) => {
                let exit_endpoint = peers[0].endpoint;
                let source_ip = entry
                    .interface_addresses
                    .iter()
                    .map(IpNet::addr)
                    .find(|ip| ip.is_ipv4() == exit_endpoint.is_ipv4())
                    .ok_or_else(|| {
                        AdapterError::Core(format!(
                            "Entry interface has no address of the same family as exit endpoint {}",
                            exit_endpoint
                        ))
                    })?;
                let port = rand::thread_rng().gen_range(1024..=u16::MAX);
                let tunnel = PeerTunnel::new(&entry.private_key, &entry.peer, peers.len() as u32)?;
                info!(
                    "Multihop core: entry {} -> exit {}",
                    tunnel.endpoint, exit_endpoint
                );
                Some(EntryHop {
                    tunnel,
                    source: SocketAddr::new(source_ip, port),
                })
            }
            None => {
                info!("Single-hop core with {} peer(s)", peers.len());
                None
            }
        };

        Ok(Self {
            peers,
            entry,
            buffer: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    fn route(&self, packet: &[u8]) -> Option<usize> {
        if self.entry.is_some() || self.peers.len() == 1 {
            return Some(0);
        }

        let destination = destination_ip(packet)?;
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(index, peer)| peer.longest_match(destination).map(|len| (index, len)))
            .max_by_key(|(_, len)| *len)
            .map(|(index, _)| index)
    }

    /// Wrap exit-hop ciphertext for the entry relay
    fn send_via_entry(entry: &mut EntryHop, exit: SocketAddr, ciphertext: &[u8], buf: &mut [u8], batch: &mut IoBatch) {
        let Some(inner) = build_udp_packet(entry.source, exit, ciphertext) else {
            debug!("Dropping {} bytes for exit relay: cannot wrap", ciphertext.len());
            return;
        };
        if let Some(outer) = entry.tunnel.encapsulate(&inner, buf) {
            batch.push(Frame::udp(entry.tunnel.endpoint, outer));
        }
    }

    fn emit_exit_output(&mut self, outputs: Vec<Output>, batch: &mut IoBatch) {
        let Self {
            peers,
            entry,
            buffer,
        } = &mut *self;
        let exit = &peers[0];

        for output in outputs {
            match (output, entry.as_mut()) {
                (Output::Network(data), Some(entry)) => {
                    Self::send_via_entry(entry, exit.endpoint, &data, buffer, batch);
                }
                (Output::Network(data), None) => batch.push(Frame::udp(exit.endpoint, data)),
                (Output::Tunnel(family, data), _) => batch.push(Frame::host(family, data)),
            }
        }
    }
}

impl ProtocolCore for BoringtunCore {
    fn handle_host_traffic(&mut self, packets: &[Bytes]) -> IoBatch {
        let mut batch = IoBatch::new();

        for packet in packets {
            let Some(index) = self.route(packet) else {
                trace!("No peer for outbound packet of {} bytes", packet.len());
                continue;
            };

            let Self {
                peers,
                entry,
                buffer,
            } = &mut *self;
            let peer = &mut peers[index];
            let Some(ciphertext) = peer.encapsulate(packet, buffer) else {
                continue;
            };

            match entry {
                Some(entry) => Self::send_via_entry(entry, peer.endpoint, &ciphertext, buffer, &mut batch),
                None => batch.push(Frame::udp(peer.endpoint, ciphertext)),
            }
        }

        batch
    }

    fn handle_tunnel_traffic(&mut self, from: SocketAddr, datagrams: &[Bytes]) -> IoBatch {
        let mut batch = IoBatch::new();

        if let Some(entry) = self.entry.as_mut() {
            if from != entry.tunnel.endpoint {
                debug!("Ignoring {} datagram(s) from non-entry endpoint {}", datagrams.len(), from);
                return batch;
            }

            let mut entry_out = Vec::new();
            for datagram in datagrams {
                entry.tunnel.decapsulate(datagram, &mut self.buffer, &mut entry_out);
            }

            let exit_endpoint = self.peers[0].endpoint;
            let mut exit_in = Vec::new();
            for output in entry_out {
                match output {
                    Output::Network(data) => batch.push(Frame::udp(from, data)),
                    Output::Tunnel(_, packet) => match parse_udp_packet(&packet) {
                        Some(udp) if udp.source == exit_endpoint => {
                            exit_in.push(Bytes::copy_from_slice(udp.payload));
                        }
                        _ => trace!("Dropping non-exit packet from entry relay"),
                    },
                }
            }

            let mut exit_out = Vec::new();
            for datagram in &exit_in {
                self.peers[0].decapsulate(datagram, &mut self.buffer, &mut exit_out);
            }
            self.emit_exit_output(exit_out, &mut batch);
            return batch;
        }

        let index = self
            .peers
            .iter()
            .position(|peer| peer.endpoint == from)
            .or_else(|| (self.peers.len() == 1).then_some(0));
        let Some(index) = index else {
            debug!("Received {} datagram(s) from unknown endpoint {}", datagrams.len(), from);
            return batch;
        };

        let peer = &mut self.peers[index];
        let mut outputs = Vec::new();
        for datagram in datagrams {
            peer.decapsulate(datagram, &mut self.buffer, &mut outputs);
        }
        let endpoint = peer.endpoint;
        for output in outputs {
            match output {
                Output::Network(data) => batch.push(Frame::udp(endpoint, data)),
                Output::Tunnel(family, data) => batch.push(Frame::host(family, data)),
            }
        }

        batch
    }

    fn handle_timer_event(&mut self) -> IoBatch {
        let mut batch = IoBatch::new();
        let Self {
            peers,
            entry,
            buffer,
        } = &mut *self;

        if let Some(entry) = entry.as_mut() {
            if let Some(data) = entry.tunnel.update_timers(buffer) {
                batch.push(Frame::udp(entry.tunnel.endpoint, data));
            }
        }

        for peer in peers.iter_mut() {
            let Some(data) = peer.update_timers(buffer) else {
                continue;
            };
            match entry.as_mut() {
                Some(entry) => Self::send_via_entry(entry, peer.endpoint, &data, buffer, &mut batch),
                None => batch.push(Frame::udp(peer.endpoint, data)),
            }
        }

        batch
    }
}

/// Creates [`BoringtunCore`] instances
#[derive(Debug, Default, Clone, Copy)]
pub struct BoringtunCoreFactory;

impl ProtocolCoreFactory for BoringtunCoreFactory {
    fn init_tunnel(&self, params: &TunnelParams) -> Result<Box<dyn ProtocolCore>> {
        Ok(Box::new(BoringtunCore::new(params)?))
    }
}
