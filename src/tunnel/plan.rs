//! Turning configurations into what a start needs
//!
//! A start touches three collaborators: the protocol core wants key
//! material and concrete endpoints, the OS wants a settings descriptor,
//! and the session pool wants the endpoints it has to open. All three are
//! derived here, up front, so a bad configuration fails before anything
//! has side effects.

use crate::config::{MtuSetting, PeerConfiguration, TunnelConfiguration};
use crate::error::{AdapterError, Result};
use crate::ffi::{EntryParams, PeerParams, TunnelParams};
use crate::tunnel::NetworkSettings;
use std::net::SocketAddr;

/// Everything derived from the configuration(s) of one start
#[derive(Debug, Clone)]
pub struct TunnelPlan {
    /// Protocol core parameters
    pub params: TunnelParams,
    /// Descriptor for the OS
    pub settings: NetworkSettings,
    /// Endpoints the session pool must open
    pub session_endpoints: Vec<SocketAddr>,
}

fn peer_params(peer: &PeerConfiguration) -> Option<PeerParams> {
    let endpoint = peer.resolved_endpoint()?;
    Some(PeerParams {
        public_key: peer.public_key.clone(),
        preshared_key: peer.preshared_key.clone(),
        endpoint,
        allowed_ips: peer.allowed_ips.clone(),
        persistent_keepalive: peer.persistent_keepalive,
    })
}

fn first_resolved_peer(config: &TunnelConfiguration, role: &str) -> Result<PeerParams> {
    config.peers.iter().find_map(peer_params).ok_or_else(|| {
        AdapterError::Configuration(format!("{} has no peer with a resolved endpoint", role))
    })
}

impl TunnelPlan {
    /// Plan a single-hop tunnel to every peer with a concrete endpoint
    pub fn single(config: &TunnelConfiguration, mtu_fallback: MtuSetting) -> Result<Self> {
        let peers: Vec<PeerParams> = config.peers.iter().filter_map(peer_params).collect();
        if peers.is_empty() {
            return Err(AdapterError::Configuration(
                "Tunnel has no peer with a resolved endpoint".to_string(),
            ));
        }

        let session_endpoints = peers.iter().map(|peer| peer.endpoint).collect();
        Ok(Self {
            params: TunnelParams {
                private_key: config.interface.private_key.clone(),
                interface_addresses: config.interface.addresses.clone(),
                peers,
                entry: None,
            },
            settings: NetworkSettings::build(config, mtu_fallback),
            session_endpoints,
        })
    }

    /// Plan a tunnel through `entry` (when given) to `exit`. Only the
    /// entry relay gets a session; exit traffic is wrapped inside it.
    pub fn multihop(
        entry: Option<&TunnelConfiguration>,
        exit: &TunnelConfiguration,
        mtu_fallback: MtuSetting,
    ) -> Result<Self> {
        let exit_peer = first_resolved_peer(exit, "Exit configuration")?;

        let entry_params = entry
            .map(|entry| -> Result<EntryParams> {
                Ok(EntryParams {
                    private_key: entry.interface.private_key.clone(),
                    interface_addresses: entry.interface.addresses.clone(),
                    peer: first_resolved_peer(entry, "Entry configuration")?,
                })
            })
            .transpose()?;

        let session_endpoint = entry_params
            .as_ref()
            .map_or(exit_peer.endpoint, |entry| entry.peer.endpoint);

        Ok(Self {
            params: TunnelParams {
                private_key: exit.interface.private_key.clone(),
                interface_addresses: exit.interface.addresses.clone(),
                peers: vec![exit_peer],
                entry: entry_params,
            },
            settings: NetworkSettings::build_multihop(entry, exit, mtu_fallback),
            session_endpoints: vec![session_endpoint],
        })
    }
}
