//! Configuration management
//!
//! Typed tunnel configuration as handed to the adapter on every
//! start/update, the adapter's own tunables, and TOML loading for both.

mod toml_parser;
mod validation;

pub use toml_parser::TomlConfig;

use crate::error::{AdapterError, Result};
use crate::wireguard::{PresharedKey, PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Complete description of one tunnel (single hop, or one hop of a multihop pair)
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfiguration {
    /// Local interface settings
    pub interface: InterfaceConfiguration,

    /// Remote peers
    #[serde(default)]
    pub peers: Vec<PeerConfiguration>,
}

/// The virtual interface side of a tunnel
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfiguration {
    /// Interface private key
    pub private_key: PrivateKey,

    /// Interface addresses (CIDR notation)
    #[serde(default)]
    pub addresses: Vec<IpNet>,

    /// DNS servers
    #[serde(default)]
    pub dns: Vec<IpAddr>,

    /// DNS search domains
    #[serde(default)]
    pub dns_search: Vec<String>,

    /// MTU; absent or 0 means the platform default
    #[serde(default)]
    pub mtu: Option<u16>,
}

/// One WireGuard peer
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfiguration {
    /// Peer's public key
    pub public_key: PublicKey,

    /// Optional pre-shared key
    #[serde(default)]
    pub preshared_key: Option<PresharedKey>,

    /// Peer endpoint (host:port)
    #[serde(default)]
    pub endpoint: Option<Endpoint>,

    /// Allowed IP ranges (CIDR notation)
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,

    /// Persistent keepalive interval in seconds
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

impl TunnelConfiguration {
    /// Create a configuration with an interface key and nothing else
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            interface: InterfaceConfiguration {
                private_key,
                addresses: Vec::new(),
                dns: Vec::new(),
                dns_search: Vec::new(),
                mtu: None,
            },
            peers: Vec::new(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_tunnel(self)
    }

    /// Concrete endpoints of all peers, in peer order
    pub fn resolved_endpoints(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter_map(|peer| peer.endpoint.as_ref().and_then(Endpoint::resolved))
            .collect()
    }
}

impl PeerConfiguration {
    /// Create a peer with only a public key
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    /// Concrete endpoint, if the peer has one
    pub fn resolved_endpoint(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(Endpoint::resolved)
    }
}

/// Host part of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// Concrete address
    Ip(IpAddr),
    /// Hostname that still needs resolving
    Name(String),
}

/// Peer endpoint; resolution happens before the adapter sees it, so only
/// `Host::Ip` endpoints are usable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Address or hostname
    pub host: Host,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Endpoint for a concrete socket address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: Host::Ip(addr.ip()),
            port: addr.port(),
        }
    }

    /// Socket address when the host is already an address
    pub fn resolved(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::Ip(ip) => Some(SocketAddr::new(*ip, self.port)),
            Host::Name(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl FromStr for Endpoint {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            validation::validate_port(addr.port(), s)?;
            return Ok(Self::from_socket_addr(addr));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            AdapterError::Configuration(format!(
                "Invalid endpoint format: {} (expected format: host:port)",
                s
            ))
        })?;

        let port: u16 = port
            .parse()
            .map_err(|_| AdapterError::Configuration(format!("Invalid port in endpoint: {}", s)))?;
        validation::validate_port(port, s)?;

        if host.is_empty() {
            return Err(AdapterError::Configuration(
                "Host cannot be empty in endpoint".to_string(),
            ));
        }
        // Bare IPv6 addresses must be bracketed
        if host.contains(':') {
            return Err(AdapterError::Configuration(format!(
                "Invalid endpoint host: {}",
                host
            )));
        }

        Ok(Self {
            host: Host::Name(host.to_string()),
            port,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = AdapterError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Name(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// How the interface MTU is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtuSetting {
    /// A fixed MTU
    Fixed(u16),
    /// Let the platform derive the MTU from the physical link, minus this overhead
    TunnelOverhead(u16),
}

/// Adapter tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// Bound for the OS to confirm network settings (milliseconds)
    #[serde(default = "default_settings_timeout_ms")]
    pub settings_timeout_ms: u64,

    /// Bound for peer sessions to become ready (milliseconds)
    #[serde(default = "default_session_ready_timeout_ms")]
    pub session_ready_timeout_ms: u64,

    /// Bound for a stats query (milliseconds)
    #[serde(default = "default_stats_timeout_ms")]
    pub stats_timeout_ms: u64,

    /// Delay before the first timer tick (milliseconds)
    #[serde(default = "default_timer_initial_delay_ms")]
    pub timer_initial_delay_ms: u64,

    /// Period of the maintenance timer (milliseconds)
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,

    /// Maximum datagrams delivered per read callback
    #[serde(default = "default_max_read_datagrams")]
    pub max_read_datagrams: usize,

    /// Inbound read batches queued for the relay before new ones are dropped
    #[serde(default = "default_inbound_queue_batches")]
    pub inbound_queue_batches: usize,

    /// MTU used when the configuration has none
    #[serde(default = "default_mtu_fallback")]
    pub mtu_fallback: MtuSetting,
}

impl AdapterOptions {
    /// Network-settings confirmation bound
    pub fn settings_timeout(&self) -> Duration {
        Duration::from_millis(self.settings_timeout_ms)
    }

    /// Session readiness bound
    pub fn session_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.session_ready_timeout_ms)
    }

    /// Stats query bound
    pub fn stats_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_timeout_ms)
    }

    /// First timer tick delay
    pub fn timer_initial_delay(&self) -> Duration {
        Duration::from_millis(self.timer_initial_delay_ms)
    }

    /// Timer period
    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        validation::validate_options(self)
    }
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            settings_timeout_ms: default_settings_timeout_ms(),
            session_ready_timeout_ms: default_session_ready_timeout_ms(),
            stats_timeout_ms: default_stats_timeout_ms(),
            timer_initial_delay_ms: default_timer_initial_delay_ms(),
            timer_interval_ms: default_timer_interval_ms(),
            max_read_datagrams: default_max_read_datagrams(),
            inbound_queue_batches: default_inbound_queue_batches(),
            mtu_fallback: default_mtu_fallback(),
        }
    }
}

// Default value functions for serde
fn default_settings_timeout_ms() -> u64 {
    5000
}

fn default_session_ready_timeout_ms() -> u64 {
    5000
}

fn default_stats_timeout_ms() -> u64 {
    1000
}

fn default_timer_initial_delay_ms() -> u64 {
    10
}

fn default_timer_interval_ms() -> u64 {
    100
}

fn default_max_read_datagrams() -> usize {
    2000
}

fn default_inbound_queue_batches() -> usize {
    256
}

fn default_mtu_fallback() -> MtuSetting {
    MtuSetting::Fixed(1280)
}
