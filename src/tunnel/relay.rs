//! Packet relay engine
//!
//! Architecture: one actor task owns the protocol core, the session pool
//! and the byte counters. Control arrives as a [`RelayCommand`] on an
//! unbounded channel: interface batches from the reader task, session
//! status changes, stats queries, and stop. Inbound datagrams use a
//! separate bounded queue; when it is full the batch is dropped and
//! tallied, like any other lost UDP datagram. Timer ticks fire inside the
//! same `select!` loop. Stopping enqueues `Stop` behind the queued commands
//! and awaits the actor, so the core is dropped only after they drain.

use crate::config::{AdapterOptions, TunnelConfiguration};
use crate::error::{AdapterError, Result};
use crate::ffi::{IoBatch, ProtocolCore, ProtocolCoreFactory};
use crate::monitoring::{DropCounter, StatsCollector, WgStats};
use crate::platform::{Packet, PacketFlow, PlatformServices, SessionStatus};
use crate::tunnel::plan::TunnelPlan;
use crate::tunnel::settings::NetworkSettings;
use crate::tunnel::sessions::{AddressKey, EventSink, SessionEvent, UdpSessionManager};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Back-off after a failed interface read
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Commands processed by the relay actor, in arrival order
#[derive(Debug)]
enum RelayCommand {
    /// Packets read from the interface; `done` re-arms the reader
    HostTraffic {
        packets: Vec<Packet>,
        done: oneshot::Sender<()>,
    },
    /// A peer session's status changed
    SessionStatus {
        key: AddressKey,
        id: u64,
        status: SessionStatus,
    },
    /// Current counters
    GetStats(oneshot::Sender<WgStats>),
    /// Current session pool keys
    GetSessionKeys(oneshot::Sender<Vec<AddressKey>>),
    /// Drain and exit
    Stop,
}

/// Datagrams one session read delivered
#[derive(Debug)]
struct InboundBatch {
    remote: SocketAddr,
    datagrams: Vec<Bytes>,
}

impl InboundBatch {
    fn total_len(&self) -> usize {
        self.datagrams.iter().map(Bytes::len).sum()
    }
}

/// Route session events into the actor. Status changes always go through;
/// datagrams are dropped into `drops` when the inbound queue is full.
fn session_sink(
    commands: mpsc::UnboundedSender<RelayCommand>,
    inbound: mpsc::Sender<InboundBatch>,
    drops: Arc<DropCounter>,
) -> EventSink {
    Arc::new(move |event| match event {
        SessionEvent::Datagrams { remote, datagrams } => {
            match inbound.try_send(InboundBatch { remote, datagrams }) {
                Ok(()) => {}
                Err(TrySendError::Full(batch)) => drops.record(batch.total_len()),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        SessionEvent::Status { key, id, status } => {
            let _ = commands.send(RelayCommand::SessionStatus { key, id, status });
        }
    })
}

/// State owned by the actor
struct RelayState {
    core: Box<dyn ProtocolCore>,
    sessions: UdpSessionManager,
    stats: StatsCollector,
    inbound_drops: Arc<DropCounter>,
    packet_flow: Arc<dyn PacketFlow>,
}

impl RelayState {
    /// Interface batch -> core -> UDP sessions
    async fn read_packet_tunnel_bytes(&mut self, packets: Vec<Packet>) {
        let data: Vec<Bytes> = packets.into_iter().map(|packet| packet.data).collect();
        let batch = self.core.handle_host_traffic(&data);
        self.drain(batch).await;
    }

    /// Inbound datagrams -> core -> interface and UDP sessions
    async fn receive_tunnel_traffic(&mut self, remote: SocketAddr, datagrams: Vec<Bytes>) {
        let total: usize = datagrams.iter().map(Bytes::len).sum();
        self.stats.add_received(total);

        let batch = self.core.handle_tunnel_traffic(remote, &datagrams);
        self.drain(batch).await;
    }

    /// Periodic maintenance
    async fn handle_timer_event(&mut self) {
        let batch = self.core.handle_timer_event();
        self.drain(batch).await;
    }

    /// Consume a whole batch before returning
    async fn drain(&mut self, batch: IoBatch) {
        if batch.is_empty() {
            return;
        }

        let (udp, host) = batch.split();
        for out in udp {
            self.sessions
                .send(out.endpoint, out.datagrams, &mut self.stats)
                .await;
        }

        if !host.is_empty() {
            let packets: Vec<Packet> = host
                .into_iter()
                .map(|frame| Packet {
                    family: frame.family,
                    data: frame.payload,
                })
                .collect();
            if let Err(e) = self.packet_flow.write_packets(&packets).await {
                warn!("Failed to write {} packet(s) to the interface: {}", packets.len(), e);
            }
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RelayCommand>,
        mut inbound: mpsc::Receiver<InboundBatch>,
        initial_delay: Duration,
        interval: Duration,
    ) {
        let mut timer = time::interval_at(Instant::now() + initial_delay, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RelayCommand::HostTraffic { packets, done }) => {
                        self.read_packet_tunnel_bytes(packets).await;
                        let _ = done.send(());
                    }
                    Some(RelayCommand::SessionStatus { key, id, status }) => {
                        self.sessions.handle_status(key, id, status);
                    }
                    Some(RelayCommand::GetStats(reply)) => {
                        self.stats.absorb_inbound_drops(&self.inbound_drops);
                        let _ = reply.send(self.stats.snapshot());
                    }
                    Some(RelayCommand::GetSessionKeys(reply)) => {
                        let _ = reply.send(self.sessions.keys());
                    }
                    Some(RelayCommand::Stop) | None => break,
                },
                Some(batch) = inbound.recv() => {
                    self.receive_tunnel_traffic(batch.remote, batch.datagrams).await;
                }
                _ = timer.tick() => self.handle_timer_event().await,
            }
        }

        self.sessions.close_all();
        self.stats.absorb_inbound_drops(&self.inbound_drops);
        info!(
            "Relay stopped after {:?}: {} ({} outbound, {} inbound batch(es) dropped)",
            self.stats.uptime(),
            self.stats.snapshot(),
            self.stats.dropped_batches(),
            self.stats.inbound_dropped_batches()
        );
    }
}

/// Interface read loop. The next read is only issued once the actor has
/// finished with the previous batch, whatever happened to it.
async fn read_loop(packet_flow: Arc<dyn PacketFlow>, commands: mpsc::UnboundedSender<RelayCommand>) {
    loop {
        match packet_flow.read_packets().await {
            Ok(Some(packets)) => {
                if packets.is_empty() {
                    continue;
                }
                let (done, processed) = oneshot::channel();
                if commands
                    .send(RelayCommand::HostTraffic { packets, done })
                    .is_err()
                {
                    break;
                }
                let _ = processed.await;
            }
            Ok(None) => {
                debug!("Packet flow closed");
                break;
            }
            Err(e) => {
                error!("Interface read error: {}", e);
                time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
}

struct RunningRelay {
    commands: mpsc::UnboundedSender<RelayCommand>,
    actor: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Owns one protocol core instance at a time and relays traffic for it
pub struct PacketRelayEngine {
    services: PlatformServices,
    core_factory: Arc<dyn ProtocolCoreFactory>,
    options: AdapterOptions,
    running: Option<RunningRelay>,
}

impl PacketRelayEngine {
    /// Create a stopped engine
    pub fn new(
        services: PlatformServices,
        core_factory: Arc<dyn ProtocolCoreFactory>,
        options: AdapterOptions,
    ) -> Self {
        Self {
            services,
            core_factory,
            options,
            running: None,
        }
    }

    /// Whether a tunnel is running
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start a single-hop tunnel
    pub async fn start(&mut self, config: &TunnelConfiguration) -> Result<()> {
        let plan = TunnelPlan::single(config, self.options.mtu_fallback)?;
        self.start_plan(plan).await
    }

    /// Start a tunnel through an optional entry hop to `exit`
    pub async fn start_multihop(
        &mut self,
        entry: Option<&TunnelConfiguration>,
        exit: &TunnelConfiguration,
    ) -> Result<()> {
        let plan = TunnelPlan::multihop(entry, exit, self.options.mtu_fallback)?;
        self.start_plan(plan).await
    }

    /// Restart with a new configuration; counters start again from zero
    pub async fn update(&mut self, config: &TunnelConfiguration) -> Result<()> {
        self.stop().await;
        self.start(config).await
    }

    async fn start_plan(&mut self, plan: TunnelPlan) -> Result<()> {
        if self.running.is_some() {
            return Err(AdapterError::InvalidState(
                "Relay is already running".to_string(),
            ));
        }

        info!(
            "Starting relay: {} peer(s), {} session(s){}",
            plan.params.peers.len(),
            plan.session_endpoints.len(),
            if plan.params.is_multihop() { ", multihop" } else { "" }
        );

        let core = self.core_factory.init_tunnel(&plan.params)?;

        apply_settings(&self.services, &plan.settings, self.options.settings_timeout()).await?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let (inbound, inbound_receiver) = mpsc::channel(self.options.inbound_queue_batches.max(1));
        let inbound_drops = Arc::new(DropCounter::new());
        let sink = session_sink(commands.clone(), inbound, Arc::clone(&inbound_drops));

        let mut sessions = UdpSessionManager::new(
            Arc::clone(&self.services.sessions),
            sink,
            self.options.max_read_datagrams,
        );
        sessions
            .initialize_sessions(&plan.session_endpoints, self.options.session_ready_timeout())
            .await?;

        let state = RelayState {
            core,
            sessions,
            stats: StatsCollector::new(),
            inbound_drops,
            packet_flow: Arc::clone(&self.services.packet_flow),
        };

        let actor = tokio::spawn(state.run(
            receiver,
            inbound_receiver,
            self.options.timer_initial_delay(),
            self.options.timer_interval(),
        ));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.services.packet_flow),
            commands.clone(),
        ));

        self.running = Some(RunningRelay {
            commands,
            actor,
            reader,
        });
        info!("Relay started");
        Ok(())
    }

    /// Stop the relay and release the core; does nothing when stopped
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.reader.abort();
        let _ = running.commands.send(RelayCommand::Stop);
        if let Err(e) = running.actor.await {
            error!("Relay task failed: {}", e);
        }
    }

    /// Current counters; zero when stopped
    pub async fn stats(&self) -> WgStats {
        let Some(running) = &self.running else {
            return WgStats::default();
        };

        let (reply, response) = oneshot::channel();
        if running.commands.send(RelayCommand::GetStats(reply)).is_err() {
            return WgStats::default();
        }
        response.await.unwrap_or_default()
    }

    /// Keys of the pooled peer sessions; empty when stopped
    pub async fn session_keys(&self) -> Vec<AddressKey> {
        let Some(running) = &self.running else {
            return Vec::new();
        };

        let (reply, response) = oneshot::channel();
        if running.commands.send(RelayCommand::GetSessionKeys(reply)).is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }
}

impl Drop for PacketRelayEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.reader.abort();
            let _ = running.commands.send(RelayCommand::Stop);
        }
    }
}

/// Apply a descriptor, bounded by `timeout`
pub(crate) async fn apply_settings(
    services: &PlatformServices,
    settings: &NetworkSettings,
    timeout: Duration,
) -> Result<()> {
    debug!("Applying network settings: {:?}", settings);

    match time::timeout(timeout, services.settings.apply(settings)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ AdapterError::NetworkSettings(_))) => Err(e),
        Ok(Err(e)) => Err(AdapterError::NetworkSettings(e.to_string())),
        Err(_) => Err(AdapterError::NetworkSettings(format!(
            "Settings not confirmed within {:?}",
            timeout
        ))),
    }
}
