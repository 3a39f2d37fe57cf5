//! Peer UDP session pool
//!
//! One OS-managed session per distinct peer address. The pool is owned by
//! the relay's serial context: status changes and inbound datagrams are
//! reported through an [`EventSink`] and applied back here by that context,
//! so the map itself needs no lock.

use crate::error::{AdapterError, Result};
use crate::monitoring::StatsCollector;
use crate::platform::{
    ReadHandler, SessionState, SessionStatus, UdpSession, UdpSessionFactory,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Packed peer address: IPv4 as one 32-bit word, IPv6 as eight 16-bit groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressKey {
    /// IPv4 address
    V4(u32),
    /// IPv6 address
    V6([u16; 8]),
}

impl AddressKey {
    /// Key for an IP address
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => AddressKey::V4(u32::from(v4)),
            IpAddr::V6(v6) => AddressKey::V6(v6.segments()),
        }
    }

    /// Address the key was packed from
    pub fn to_ip(self) -> IpAddr {
        match self {
            AddressKey::V4(word) => IpAddr::from(word.to_be_bytes()),
            AddressKey::V6(groups) => IpAddr::from(groups),
        }
    }
}

impl From<SocketAddr> for AddressKey {
    fn from(addr: SocketAddr) -> Self {
        Self::of(addr.ip())
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

/// Where a pooled session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    /// Waiting for the OS
    Connecting,
    /// Carrying traffic
    Ready,
    /// Carrying traffic while a successor is set up
    BetterPathAvailable,
    /// Cancelled (terminal)
    Cancelled,
    /// Failed (terminal)
    Failed,
}

impl SessionLifecycle {
    /// Whether sends go out
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionLifecycle::Ready | SessionLifecycle::BetterPathAvailable)
    }

    fn from_status(status: &SessionStatus) -> Self {
        match status.state {
            SessionState::Connecting => SessionLifecycle::Connecting,
            SessionState::Ready if status.has_better_path => SessionLifecycle::BetterPathAvailable,
            SessionState::Ready => SessionLifecycle::Ready,
            SessionState::Cancelled => SessionLifecycle::Cancelled,
            SessionState::Failed => SessionLifecycle::Failed,
        }
    }
}

/// Something a pooled session reported
#[derive(Debug)]
pub enum SessionEvent {
    /// Inbound datagrams from a peer
    Datagrams {
        /// Peer the datagrams came from
        remote: SocketAddr,
        /// Datagram payloads
        datagrams: Vec<Bytes>,
    },
    /// A session's status changed
    Status {
        /// Pool key
        key: AddressKey,
        /// Session generation; stale generations are ignored
        id: u64,
        /// New status
        status: SessionStatus,
    },
}

/// Delivers session events to the owning serial context
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

struct SessionEntry {
    id: u64,
    session: Arc<dyn UdpSession>,
    lifecycle: SessionLifecycle,
    watcher: JoinHandle<()>,
}

/// Pool of peer sessions keyed by [`AddressKey`]
pub struct UdpSessionManager {
    factory: Arc<dyn UdpSessionFactory>,
    sessions: HashMap<AddressKey, SessionEntry>,
    events: EventSink,
    max_datagrams: usize,
    next_id: u64,
}

impl UdpSessionManager {
    /// Create an empty pool
    pub fn new(factory: Arc<dyn UdpSessionFactory>, events: EventSink, max_datagrams: usize) -> Self {
        Self {
            factory,
            sessions: HashMap::new(),
            events,
            max_datagrams,
            next_id: 0,
        }
    }

    /// Open one session per distinct address and wait for all new ones to
    /// become ready. On any failure every session is closed.
    pub async fn initialize_sessions(&mut self, endpoints: &[SocketAddr], timeout: Duration) -> Result<()> {
        let mut pending = Vec::new();

        for endpoint in endpoints {
            let key = AddressKey::from(*endpoint);
            if self.sessions.contains_key(&key) {
                continue;
            }

            let session = match self.factory.create_session(*endpoint) {
                Ok(session) => session,
                Err(e) => {
                    self.close_all();
                    return Err(match e {
                        AdapterError::Session(_) => e,
                        other => AdapterError::Session(format!(
                            "Failed to open session to {}: {}",
                            endpoint, other
                        )),
                    });
                }
            };

            debug!("Opened session to {}", endpoint);
            pending.push((key, session.status()));
            self.insert(key, session);
        }

        let outcome = time::timeout(timeout, wait_until_settled(pending)).await;
        let settled = match outcome {
            Ok(Ok(settled)) => settled,
            Ok(Err(e)) => {
                self.close_all();
                return Err(e);
            }
            Err(_) => {
                warn!("Peer sessions not ready after {:?}", timeout);
                self.close_all();
                return Err(AdapterError::SessionTimeout(timeout));
            }
        };

        for (key, status) in settled {
            if let Some(entry) = self.sessions.get_mut(&key) {
                entry.lifecycle = SessionLifecycle::from_status(&status);
            }
        }

        info!("{} peer session(s) ready", self.sessions.len());
        Ok(())
    }

    /// Write a batch to the session for `endpoint`'s address.
    ///
    /// Batches for sessions that are not ready are dropped; unknown
    /// addresses are ignored.
    pub async fn send(&mut self, endpoint: SocketAddr, datagrams: Vec<Bytes>, stats: &mut StatsCollector) {
        let key = AddressKey::from(endpoint);
        let total: usize = datagrams.iter().map(Bytes::len).sum();

        let Some(entry) = self.sessions.get(&key) else {
            trace!("No session for {}, ignoring {} bytes", key, total);
            return;
        };

        if !entry.lifecycle.is_ready() {
            trace!("Session to {} is {:?}, dropping {} bytes", key, entry.lifecycle, total);
            stats.add_dropped(total);
            return;
        }

        let session = Arc::clone(&entry.session);
        match session.write_datagrams(&datagrams).await {
            Ok(()) => stats.add_sent(total),
            Err(e) => warn!("Write of {} datagram(s) to {} failed: {}", datagrams.len(), key, e),
        }
    }

    /// Apply a status change reported by a session watcher
    pub fn handle_status(&mut self, key: AddressKey, id: u64, status: SessionStatus) {
        let Some(entry) = self.sessions.get_mut(&key) else {
            return;
        };
        if entry.id != id {
            trace!("Ignoring status from superseded session to {}", key);
            return;
        }

        let lifecycle = SessionLifecycle::from_status(&status);
        if lifecycle != entry.lifecycle {
            debug!("Session to {}: {:?} -> {:?}", key, entry.lifecycle, lifecycle);
        }
        entry.lifecycle = lifecycle;

        if lifecycle == SessionLifecycle::BetterPathAvailable {
            self.migrate(key);
        }
    }

    /// Replace the session for `key` with one on the better path
    fn migrate(&mut self, key: AddressKey) {
        let Some(entry) = self.sessions.get(&key) else {
            return;
        };

        let successor = match self.factory.upgrade_session(&entry.session) {
            Ok(successor) => successor,
            Err(e) => {
                warn!("Failed to migrate session to {}: {}", key, e);
                return;
            }
        };

        info!("Migrating session to {} onto a better path", key);
        if let Some(old) = self.insert(key, successor) {
            old.watcher.abort();
            old.session.cancel();
        }
    }

    /// Wire `session` into the pool. The status receiver is taken before
    /// wiring so a change made while wiring is either read here or seen by
    /// the watcher.
    fn insert(&mut self, key: AddressKey, session: Arc<dyn UdpSession>) -> Option<SessionEntry> {
        self.next_id += 1;
        let id = self.next_id;
        let mut status = session.status();

        let remote = session.remote();
        let events = Arc::clone(&self.events);
        let handler: ReadHandler = Arc::new(move |result| match result {
            Ok(datagrams) if !datagrams.is_empty() => {
                events(SessionEvent::Datagrams { remote, datagrams });
            }
            Ok(_) => {}
            Err(e) => debug!("Read from {} failed: {}", remote, e),
        });
        session.set_read_handler(handler, self.max_datagrams);

        let lifecycle = SessionLifecycle::from_status(&status.borrow_and_update());
        let watcher = tokio::spawn(watch_status(key, id, status, Arc::clone(&self.events)));

        self.sessions.insert(
            key,
            SessionEntry {
                id,
                session,
                lifecycle,
                watcher,
            },
        )
    }

    /// Cancel every session
    pub fn close_all(&mut self) {
        for (key, entry) in self.sessions.drain() {
            trace!("Closing session to {}", key);
            entry.watcher.abort();
            entry.session.cancel();
        }
    }

    /// Number of pooled sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Pool keys, sorted
    pub fn keys(&self) -> Vec<AddressKey> {
        let mut keys: Vec<_> = self.sessions.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Lifecycle of the session for `key`
    pub fn lifecycle(&self, key: AddressKey) -> Option<SessionLifecycle> {
        self.sessions.get(&key).map(|entry| entry.lifecycle)
    }
}

impl Drop for UdpSessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Wait until every session has left `Connecting`; fail on a terminal state
async fn wait_until_settled(
    pending: Vec<(AddressKey, watch::Receiver<SessionStatus>)>,
) -> Result<Vec<(AddressKey, SessionStatus)>> {
    let mut settled = Vec::with_capacity(pending.len());

    for (key, mut status) in pending {
        let current = *status
            .wait_for(|s| s.state != SessionState::Connecting)
            .await
            .map_err(|_| AdapterError::Session(format!("Session to {} went away", key)))?;

        if current.state.is_terminal() {
            return Err(AdapterError::Session(format!(
                "Session to {} {} during setup",
                key, current.state
            )));
        }
        settled.push((key, current));
    }

    Ok(settled)
}

async fn watch_status(key: AddressKey, id: u64, mut status: watch::Receiver<SessionStatus>, events: EventSink) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        events(SessionEvent::Status {
            key,
            id,
            status: current,
        });
        if current.state.is_terminal() {
            break;
        }
    }
}
