//! Platform seams
//!
//! The adapter never touches the OS directly. Everything it needs from the
//! host (the virtual interface's packet flow, network-settings
//! application, and OS-managed UDP sessions) goes through the traits in
//! this module. A sandboxed host app supplies its own implementations;
//! the desktop ones here are built on the `tun` crate and tokio sockets.

mod tun_device;
mod udp;

#[cfg(target_os = "linux")]
mod linux;

pub use tun_device::TunInterface;
pub use udp::{TokioUdpSession, TokioUdpSessionFactory};

#[cfg(target_os = "linux")]
pub use linux::LinuxSettingsApplier;

use crate::error::Result;
use crate::ffi::AddressFamily;
use crate::tunnel::NetworkSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Raw IP packet read from or written to the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Address family the packet flow tags the packet with
    pub family: AddressFamily,
    /// Packet bytes
    pub data: Bytes,
}

impl Packet {
    /// Tag a raw packet by its IP version nibble (IPv4 when unreadable)
    pub fn new(data: Bytes) -> Self {
        let family = AddressFamily::of_packet(&data).unwrap_or(AddressFamily::V4);
        Self { family, data }
    }
}

/// The virtual interface's packet queue
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait for the next batch of outbound packets; `None` once the flow is closed
    async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>>;

    /// Inject inbound packets
    async fn write_packets(&self, packets: &[Packet]) -> io::Result<()>;
}

/// Applies a network-settings descriptor to the OS
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkSettingsApplier: Send + Sync {
    /// Apply and wait for the OS to confirm
    async fn apply(&self, settings: &NetworkSettings) -> Result<()>;
}

/// Connection state of an OS-managed UDP session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Still being set up
    Connecting,
    /// Usable for reads and writes
    Ready,
    /// Failed (terminal)
    Failed,
    /// Cancelled (terminal)
    Cancelled,
}

impl SessionState {
    /// Whether the session can never become ready again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The three independently changing properties the OS reports for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Connection state
    pub state: SessionState,
    /// Whether the current path can carry traffic
    pub viable: bool,
    /// Whether the OS found a better path
    pub has_better_path: bool,
}

impl SessionStatus {
    /// Fresh session status
    pub fn connecting() -> Self {
        Self {
            state: SessionState::Connecting,
            viable: false,
            has_better_path: false,
        }
    }

    /// Ready on a viable path
    pub fn ready() -> Self {
        Self {
            state: SessionState::Ready,
            viable: true,
            has_better_path: false,
        }
    }

    /// Terminal status
    pub fn terminal(state: SessionState) -> Self {
        Self {
            state,
            viable: false,
            has_better_path: false,
        }
    }

    /// Ready, viable, and not about to be superseded
    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Ready && self.viable && !self.has_better_path
    }
}

/// Callback receiving inbound datagrams (or a read error)
pub type ReadHandler = Arc<dyn Fn(io::Result<Vec<Bytes>>) + Send + Sync>;

/// An OS-managed UDP session to one remote endpoint
#[async_trait]
pub trait UdpSession: Send + Sync {
    /// Remote endpoint
    fn remote(&self) -> SocketAddr;

    /// Observe status changes
    fn status(&self) -> watch::Receiver<SessionStatus>;

    /// Write a batch of datagrams in one call
    async fn write_datagrams(&self, datagrams: &[Bytes]) -> io::Result<()>;

    /// Install the read handler; at most `max_datagrams` per invocation
    fn set_read_handler(&self, handler: ReadHandler, max_datagrams: usize);

    /// Cancel the session; it moves to `SessionState::Cancelled`
    fn cancel(&self);
}

/// Creates OS-managed UDP sessions
pub trait UdpSessionFactory: Send + Sync {
    /// Open a session to `remote`
    fn create_session(&self, remote: SocketAddr) -> Result<Arc<dyn UdpSession>>;

    /// Open a successor session on the better path the OS reported
    fn upgrade_session(&self, session: &Arc<dyn UdpSession>) -> Result<Arc<dyn UdpSession>>;
}

/// Everything the adapter needs from the host
#[derive(Clone)]
pub struct PlatformServices {
    /// Virtual interface packet flow
    pub packet_flow: Arc<dyn PacketFlow>,
    /// Network-settings application
    pub settings: Arc<dyn NetworkSettingsApplier>,
    /// UDP session creation
    pub sessions: Arc<dyn UdpSessionFactory>,
}

impl fmt::Debug for PlatformServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformServices").finish_non_exhaustive()
    }
}

/// Desktop services on Linux: a `tun` interface configured with `ip`, and
/// tokio UDP sessions
#[cfg(target_os = "linux")]
pub fn desktop_services(interface: &str, mtu: u16) -> Result<PlatformServices> {
    let tun = Arc::new(TunInterface::create(interface, mtu)?);
    let name = tun.name().to_string();

    Ok(PlatformServices {
        packet_flow: tun,
        settings: Arc::new(LinuxSettingsApplier::new(name)),
        sessions: Arc::new(TokioUdpSessionFactory::new()),
    })
}
