//! Tunnel adapter facade
//!
//! The public surface the host app drives: start, stop, update, multihop,
//! stats. Calls are serialised on the engine lock; stats queries are
//! bounded so a wedged start can never hang the caller. Excluded session
//! bridges handed out here are shut down by `stop`.

use crate::config::{AdapterOptions, TunnelConfiguration};
use crate::error::{AdapterError, Result};
use crate::ffi::ProtocolCoreFactory;
use crate::monitoring::WgStats;
use crate::platform::PlatformServices;
use crate::tunnel::excluded::{ExcludedSessionCallbacks, ExcludedUdpSessionBridge};
use crate::tunnel::relay::{apply_settings, PacketRelayEngine};
use crate::tunnel::sessions::AddressKey;
use crate::tunnel::settings::NetworkSettings;
use crate::wireguard::BoringtunCoreFactory;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tracing::{error, info, warn};

/// Tunnel state as seen by the host app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Not running
    Stopped,
    /// Being set up
    Starting,
    /// Relaying traffic
    Active,
    /// Settings applied without an engine; traffic goes nowhere
    Blocked,
    /// Last start failed
    Error,
}

impl TunnelState {
    /// Check if the tunnel is relaying traffic
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Active)
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Stopped => write!(f, "stopped"),
            TunnelState::Starting => write!(f, "starting"),
            TunnelState::Active => write!(f, "active"),
            TunnelState::Blocked => write!(f, "blocked"),
            TunnelState::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Copy)]
enum StartRequest<'a> {
    Single(&'a TunnelConfiguration),
    Multihop {
        entry: Option<&'a TunnelConfiguration>,
        exit: &'a TunnelConfiguration,
    },
}

impl StartRequest<'_> {
    async fn run(self, engine: &mut PacketRelayEngine) -> Result<()> {
        match self {
            StartRequest::Single(config) => engine.start(config).await,
            StartRequest::Multihop { entry, exit } => engine.start_multihop(entry, exit).await,
        }
    }
}

/// Packet-tunnel adapter
pub struct TunnelAdapter {
    engine: Mutex<PacketRelayEngine>,
    state: RwLock<TunnelState>,
    services: PlatformServices,
    options: AdapterOptions,
    bridges: std::sync::Mutex<Vec<Weak<ExcludedUdpSessionBridge>>>,
}

impl TunnelAdapter {
    /// Create a stopped adapter
    pub fn new(
        services: PlatformServices,
        core_factory: Arc<dyn ProtocolCoreFactory>,
        options: AdapterOptions,
    ) -> Self {
        Self {
            engine: Mutex::new(PacketRelayEngine::new(
                services.clone(),
                core_factory,
                options.clone(),
            )),
            state: RwLock::new(TunnelState::Stopped),
            services,
            options,
            bridges: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a stopped adapter backed by the boringtun protocol core
    pub fn with_boringtun(services: PlatformServices, options: AdapterOptions) -> Self {
        Self::new(services, Arc::new(BoringtunCoreFactory), options)
    }

    /// Current state
    pub async fn state(&self) -> TunnelState {
        *self.state.read().await
    }

    async fn set_state(&self, state: TunnelState) {
        *self.state.write().await = state;
    }

    /// Start a single-hop tunnel, replacing any running one
    pub async fn start(&self, config: &TunnelConfiguration) -> Result<()> {
        self.start_request(StartRequest::Single(config)).await
    }

    /// Start a tunnel to `exit`, through `entry` when given
    pub async fn start_multihop(
        &self,
        entry: Option<&TunnelConfiguration>,
        exit: &TunnelConfiguration,
    ) -> Result<()> {
        self.start_request(StartRequest::Multihop { entry, exit }).await
    }

    async fn start_request(&self, request: StartRequest<'_>) -> Result<()> {
        let mut engine = self.engine.lock().await;
        self.set_state(TunnelState::Starting).await;
        engine.stop().await;

        let result = match request.run(&mut engine).await {
            Err(e) if e.is_invalid_state() => {
                warn!("Start refused ({}), retrying once", e);
                engine.stop().await;
                request.run(&mut engine).await
            }
            other => other,
        };

        self.finish_start(result).await
    }

    async fn finish_start(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.set_state(TunnelState::Active).await;
                info!("Tunnel active");
                Ok(())
            }
            Err(e) => {
                error!("Failed to start tunnel: {}", e);
                self.set_state(TunnelState::Error).await;
                Err(e)
            }
        }
    }

    /// Restart with a new configuration; counters reset to zero
    pub async fn update(&self, config: &TunnelConfiguration) -> Result<()> {
        let mut engine = self.engine.lock().await;
        self.set_state(TunnelState::Starting).await;
        let result = engine.update(config).await;
        self.finish_start(result).await
    }

    /// Tear down the engine, its sessions and every excluded session;
    /// safe when not running
    pub async fn stop(&self) {
        let mut engine = self.engine.lock().await;
        engine.stop().await;
        for bridge in self.live_bridges() {
            bridge.shutdown().await;
        }
        self.set_state(TunnelState::Stopped).await;
        info!("Tunnel stopped");
    }

    fn live_bridges(&self) -> Vec<Arc<ExcludedUdpSessionBridge>> {
        let mut bridges = self.bridges.lock().unwrap_or_else(PoisonError::into_inner);
        bridges.retain(|bridge| bridge.strong_count() > 0);
        bridges.iter().filter_map(Weak::upgrade).collect()
    }

    /// Apply `config`'s network settings without relaying, so traffic is
    /// captured by the interface and dropped
    pub async fn block(&self, config: &TunnelConfiguration) -> Result<()> {
        let mut engine = self.engine.lock().await;
        engine.stop().await;

        let settings = NetworkSettings::build(config, self.options.mtu_fallback);
        match apply_settings(&self.services, &settings, self.options.settings_timeout()).await {
            Ok(()) => {
                self.set_state(TunnelState::Blocked).await;
                warn!("Tunnel blocked");
                Ok(())
            }
            Err(e) => {
                self.set_state(TunnelState::Error).await;
                Err(e)
            }
        }
    }

    /// Current counters, or `StatsTimeout` if they cannot be read in time
    pub async fn get_stats(&self) -> Result<WgStats> {
        let timeout = self.options.stats_timeout();
        time::timeout(timeout, async {
            let engine = self.engine.lock().await;
            engine.stats().await
        })
        .await
        .map_err(|_| AdapterError::StatsTimeout(timeout))
    }

    /// Keys of the pooled peer sessions
    pub async fn session_keys(&self) -> Vec<AddressKey> {
        self.engine.lock().await.session_keys().await
    }

    /// Bridge for sessions that bypass the tunnel, sharing this adapter's
    /// session factory. Its sessions are destroyed by [`stop`](Self::stop).
    pub fn excluded_session_bridge(
        &self,
        callbacks: Arc<dyn ExcludedSessionCallbacks>,
    ) -> Arc<ExcludedUdpSessionBridge> {
        let bridge = Arc::new(ExcludedUdpSessionBridge::new(
            Arc::clone(&self.services.sessions),
            callbacks,
            self.options.max_read_datagrams,
        ));
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&bridge));
        bridge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_state_display() {
        assert_eq!(TunnelState::Stopped.to_string(), "stopped");
        assert_eq!(TunnelState::Blocked.to_string(), "blocked");
        assert!(TunnelState::Active.is_running());
        assert!(!TunnelState::Starting.is_running());
    }
}
