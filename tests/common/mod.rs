//! Shared fakes for the integration suites
//!
//! Every platform seam gets an in-memory stand-in that records what the
//! adapter did to it and lets a test drive it from the outside.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;
use wg_tunnel_adapter::config::{AdapterOptions, PeerConfiguration, TunnelConfiguration};
use wg_tunnel_adapter::ffi::{
    AddressFamily, Frame, IoBatch, ProtocolCore, ProtocolCoreFactory, TunnelParams,
};
use wg_tunnel_adapter::platform::{
    NetworkSettingsApplier, Packet, PacketFlow, PlatformServices, ReadHandler, SessionState,
    SessionStatus, UdpSession, UdpSessionFactory,
};
use wg_tunnel_adapter::tunnel::{NetworkSettings, TunnelAdapter};
use wg_tunnel_adapter::wireguard::PrivateKey;
use wg_tunnel_adapter::{AdapterError, Result};

/// Interface that yields injected packets and records writes
pub struct FakePacketFlow {
    inbound: mpsc::UnboundedSender<Vec<Packet>>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Packet>>>,
    written: Mutex<Vec<Packet>>,
}

impl FakePacketFlow {
    pub fn new() -> Self {
        let (inbound, queue) = mpsc::unbounded_channel();
        Self {
            inbound,
            queue: tokio::sync::Mutex::new(queue),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Make `packets` readable as one batch
    pub fn inject(&self, packets: Vec<Bytes>) {
        let _ = self
            .inbound
            .send(packets.into_iter().map(Packet::new).collect());
    }

    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl PacketFlow for FakePacketFlow {
    async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>> {
        Ok(self.queue.lock().await.recv().await)
    }

    async fn write_packets(&self, packets: &[Packet]) -> io::Result<()> {
        self.written.lock().unwrap().extend_from_slice(packets);
        Ok(())
    }
}

/// How [`FakeSettings`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsMode {
    Accept,
    Reject,
    Hang,
}

/// Settings applier recording every accepted descriptor
pub struct FakeSettings {
    mode: Mutex<SettingsMode>,
    applied: Mutex<Vec<NetworkSettings>>,
}

impl FakeSettings {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(SettingsMode::Accept),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: SettingsMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn applied(&self) -> Vec<NetworkSettings> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkSettingsApplier for FakeSettings {
    async fn apply(&self, settings: &NetworkSettings) -> Result<()> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            SettingsMode::Accept => {
                self.applied.lock().unwrap().push(settings.clone());
                Ok(())
            }
            SettingsMode::Reject => Err(AdapterError::NetworkSettings(
                "rejected by fake".to_string(),
            )),
            SettingsMode::Hang => std::future::pending().await,
        }
    }
}

/// Session whose status and inbound traffic the test controls
pub struct FakeSession {
    remote: SocketAddr,
    status: watch::Sender<SessionStatus>,
    handler: Mutex<Option<ReadHandler>>,
    writes: Mutex<Vec<Vec<Bytes>>>,
    ready_when_wired: AtomicBool,
}

impl FakeSession {
    fn new(remote: SocketAddr, initial: SessionStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            remote,
            status,
            handler: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            ready_when_wired: AtomicBool::new(false),
        }
    }

    /// Feed datagrams through the installed read handler
    pub fn deliver(&self, datagrams: Vec<Bytes>) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(Ok(datagrams));
        }
    }

    /// Report a read error through the installed read handler
    pub fn deliver_error(&self, errno: i32) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(Err(io::Error::from_raw_os_error(errno)));
        }
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    pub fn current_status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_status().state == SessionState::Cancelled
    }

    /// Batches written, one entry per `write_datagrams` call
    pub fn writes(&self) -> Vec<Vec<Bytes>> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl UdpSession for FakeSession {
    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    async fn write_datagrams(&self, datagrams: &[Bytes]) -> io::Result<()> {
        self.writes.lock().unwrap().push(datagrams.to_vec());
        Ok(())
    }

    fn set_read_handler(&self, handler: ReadHandler, _max_datagrams: usize) {
        *self.handler.lock().unwrap() = Some(handler);
        if self.ready_when_wired.load(Ordering::SeqCst) {
            self.status.send_replace(SessionStatus::ready());
        }
    }

    fn cancel(&self) {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            *status = SessionStatus::terminal(SessionState::Cancelled);
            true
        });
    }
}

/// Factory keeping every session it ever created
pub struct FakeSessionFactory {
    initial: Mutex<SessionStatus>,
    created: Mutex<Vec<Arc<FakeSession>>>,
    upgrades: AtomicUsize,
    upgrade_connects_while_wired: AtomicBool,
}

impl FakeSessionFactory {
    pub fn new() -> Self {
        Self {
            initial: Mutex::new(SessionStatus::ready()),
            created: Mutex::new(Vec::new()),
            upgrades: AtomicUsize::new(0),
            upgrade_connects_while_wired: AtomicBool::new(false),
        }
    }

    /// Successors start connecting and turn ready as their read handler
    /// is installed
    pub fn upgrade_connects_while_wired(&self) {
        self.upgrade_connects_while_wired.store(true, Ordering::SeqCst);
    }

    /// Status new sessions start in
    pub fn set_initial(&self, status: SessionStatus) {
        *self.initial.lock().unwrap() = status;
    }

    pub fn created(&self) -> Vec<Arc<FakeSession>> {
        self.created.lock().unwrap().clone()
    }

    /// Most recent session to `remote`
    pub fn latest(&self, remote: SocketAddr) -> Option<Arc<FakeSession>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|session| session.remote == remote)
            .cloned()
    }

    /// Sessions not cancelled or failed
    pub fn open_count(&self) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|session| !session.current_status().state.is_terminal())
            .count()
    }

    pub fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }

    fn open(&self, remote: SocketAddr, status: SessionStatus) -> Arc<FakeSession> {
        let session = Arc::new(FakeSession::new(remote, status));
        self.created.lock().unwrap().push(Arc::clone(&session));
        session
    }
}

impl UdpSessionFactory for FakeSessionFactory {
    fn create_session(&self, remote: SocketAddr) -> Result<Arc<dyn UdpSession>> {
        let initial = *self.initial.lock().unwrap();
        Ok(self.open(remote, initial))
    }

    fn upgrade_session(&self, session: &Arc<dyn UdpSession>) -> Result<Arc<dyn UdpSession>> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        if self.upgrade_connects_while_wired.load(Ordering::SeqCst) {
            let successor = self.open(session.remote(), SessionStatus::connecting());
            successor.ready_when_wired.store(true, Ordering::SeqCst);
            return Ok(successor);
        }
        Ok(self.open(session.remote(), SessionStatus::ready()))
    }
}

/// Destination for packets starting with this byte is a peer nobody pooled
pub const UNROUTED_MARKER: u8 = 0xff;

/// Address [`FakeCore`] sends marked packets to
pub const UNROUTED_PEER: &str = "192.0.2.1:9";

/// Core that forwards host packets verbatim to the first peer and tunnel
/// datagrams verbatim to the interface
pub struct FakeCore {
    peer: SocketAddr,
    alive: Arc<AtomicUsize>,
}

impl ProtocolCore for FakeCore {
    fn handle_host_traffic(&mut self, packets: &[Bytes]) -> IoBatch {
        packets
            .iter()
            .map(|packet| {
                let endpoint = if packet.first() == Some(&UNROUTED_MARKER) {
                    UNROUTED_PEER.parse().unwrap()
                } else {
                    self.peer
                };
                Frame::udp(endpoint, packet.clone())
            })
            .collect()
    }

    fn handle_tunnel_traffic(&mut self, _from: SocketAddr, datagrams: &[Bytes]) -> IoBatch {
        datagrams
            .iter()
            .map(|datagram| Frame::host(AddressFamily::V4, datagram.clone()))
            .collect()
    }

    fn handle_timer_event(&mut self) -> IoBatch {
        IoBatch::new()
    }
}

impl Drop for FakeCore {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory counting live cores; can refuse the first init as busy
pub struct FakeCoreFactory {
    pub alive: Arc<AtomicUsize>,
    pub inits: AtomicUsize,
    busy_once: AtomicBool,
}

impl FakeCoreFactory {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicUsize::new(0)),
            inits: AtomicUsize::new(0),
            busy_once: AtomicBool::new(false),
        }
    }

    /// Next init fails with `InvalidState`
    pub fn refuse_next(&self) {
        self.busy_once.store(true, Ordering::SeqCst);
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }
}

impl ProtocolCoreFactory for FakeCoreFactory {
    fn init_tunnel(&self, params: &TunnelParams) -> Result<Box<dyn ProtocolCore>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.busy_once.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::InvalidState("previous instance busy".to_string()));
        }

        let peer = params
            .entry
            .as_ref()
            .map_or(params.peers[0].endpoint, |entry| entry.peer.endpoint);
        self.alive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCore {
            peer,
            alive: Arc::clone(&self.alive),
        }))
    }
}

/// All fakes wired together
pub struct Harness {
    pub flow: Arc<FakePacketFlow>,
    pub settings: Arc<FakeSettings>,
    pub sessions: Arc<FakeSessionFactory>,
    pub cores: Arc<FakeCoreFactory>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            flow: Arc::new(FakePacketFlow::new()),
            settings: Arc::new(FakeSettings::new()),
            sessions: Arc::new(FakeSessionFactory::new()),
            cores: Arc::new(FakeCoreFactory::new()),
        }
    }

    pub fn services(&self) -> PlatformServices {
        PlatformServices {
            packet_flow: Arc::clone(&self.flow) as Arc<dyn PacketFlow>,
            settings: Arc::clone(&self.settings) as Arc<dyn NetworkSettingsApplier>,
            sessions: Arc::clone(&self.sessions) as Arc<dyn UdpSessionFactory>,
        }
    }

    pub fn adapter(&self, options: AdapterOptions) -> TunnelAdapter {
        TunnelAdapter::new(self.services(), Arc::clone(&self.cores) as Arc<dyn ProtocolCoreFactory>, options)
    }
}

/// Log to the test writer, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options with short deadlines so failure paths finish quickly
pub fn fast_options() -> AdapterOptions {
    AdapterOptions {
        settings_timeout_ms: 200,
        session_ready_timeout_ms: 200,
        stats_timeout_ms: 200,
        ..AdapterOptions::default()
    }
}

/// Tunnel at 10.64.0.2/32 with one peer per endpoint, all routing 0.0.0.0/0
pub fn tunnel_config(endpoints: &[&str]) -> TunnelConfiguration {
    let mut config = TunnelConfiguration::new(PrivateKey::generate());
    config.interface.addresses = vec!["10.64.0.2/32".parse().unwrap()];
    config.peers = endpoints
        .iter()
        .map(|endpoint| {
            let mut peer = PeerConfiguration::new(PrivateKey::generate().public_key());
            peer.endpoint = Some(endpoint.parse().unwrap());
            peer.allowed_ips = vec!["0.0.0.0/0".parse().unwrap()];
            peer
        })
        .collect();
    config
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
