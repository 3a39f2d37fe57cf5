//! UDP sessions that bypass the tunnel
//!
//! The protocol core occasionally needs to talk to the outside world
//! directly (bootstrap DNS, obfuscation control traffic). It opens such a
//! session with [`ExcludedUdpSessionBridge::create`] and gets back a raw
//! handle; everything that happens on the session is reported through
//! [`ExcludedSessionCallbacks`].
//!
//! Each session has a private worker task. Sends, inbound datagrams and
//! status changes are all processed there, in order, so callbacks for one
//! handle never overlap. `destroy` queues a shutdown behind any pending
//! work and waits for the worker to exit: once it returns, no callback for
//! that handle can fire.

use crate::error::{AdapterError, Result};
use crate::ffi::{Handle, HandleTable};
use crate::platform::{SessionStatus, UdpSession, UdpSessionFactory};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Notifications raised towards the protocol core
pub trait ExcludedSessionCallbacks: Send + Sync {
    /// Session became usable
    fn session_ready(&self, handle: u64);

    /// Session stopped being usable
    fn session_not_ready(&self, handle: u64);

    /// Datagrams arrived
    fn session_recv(&self, handle: u64, datagrams: Vec<Bytes>);

    /// Reading failed with `errno`
    fn session_recv_err(&self, handle: u64, errno: i32);

    /// The send tagged `token` finished; `status` is 0 or an errno
    fn send_complete(&self, handle: u64, token: u64, status: i32);
}

enum Work {
    Send { datagrams: Vec<Bytes>, token: u64 },
    Received(io::Result<Vec<Bytes>>),
    Shutdown,
}

struct ExcludedSession {
    queue: mpsc::UnboundedSender<Work>,
    worker: Option<JoinHandle<()>>,
}

/// Owns every bypass session opened by the protocol core
pub struct ExcludedUdpSessionBridge {
    factory: Arc<dyn UdpSessionFactory>,
    callbacks: Arc<dyn ExcludedSessionCallbacks>,
    max_datagrams: usize,
    sessions: Mutex<HandleTable<ExcludedSession>>,
}

fn errno_of(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

impl ExcludedUdpSessionBridge {
    /// Create a bridge opening sessions through `factory`
    pub fn new(
        factory: Arc<dyn UdpSessionFactory>,
        callbacks: Arc<dyn ExcludedSessionCallbacks>,
        max_datagrams: usize,
    ) -> Self {
        Self {
            factory,
            callbacks,
            max_datagrams,
            sessions: Mutex::new(HandleTable::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HandleTable<ExcludedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session to `address:port` and return its handle
    pub fn create(&self, address: IpAddr, port: u16) -> Result<u64> {
        let remote = SocketAddr::new(address, port);
        let session = self.factory.create_session(remote)?;

        let (queue, work) = mpsc::unbounded_channel();
        let reads = queue.clone();
        session.set_read_handler(
            Arc::new(move |result| {
                let _ = reads.send(Work::Received(result));
            }),
            self.max_datagrams,
        );

        let mut table = self.table();
        let handle = table.insert(ExcludedSession {
            queue,
            worker: None,
        });
        let raw = handle.to_raw();

        let worker = tokio::spawn(run_worker(
            raw,
            Arc::clone(&session),
            session.status(),
            work,
            Arc::clone(&self.callbacks),
        ));
        if let Some(slot) = table.get_mut(handle) {
            slot.worker = Some(worker);
        }

        debug!("Excluded session {} to {}", handle, remote);
        Ok(raw)
    }

    /// Queue a batch; completion is reported through `send_complete`
    pub fn send(&self, handle: u64, datagrams: Vec<Bytes>, token: u64) -> Result<()> {
        let table = self.table();
        let session = table
            .get(Handle::from_raw(handle))
            .ok_or(AdapterError::InvalidHandle(handle))?;

        session
            .queue
            .send(Work::Send { datagrams, token })
            .map_err(|_| AdapterError::InvalidHandle(handle))
    }

    /// Release a session once its pending callbacks have run.
    /// Unknown or already destroyed handles are ignored.
    pub async fn destroy(&self, handle: u64) {
        let Some(session) = self.table().remove(Handle::from_raw(handle)) else {
            trace!("Excluded session {:#x} already destroyed", handle);
            return;
        };

        let _ = session.queue.send(Work::Shutdown);
        if let Some(worker) = session.worker {
            let _ = worker.await;
        }
        debug!("Excluded session {:#x} destroyed", handle);
    }

    /// Destroy every live session
    pub async fn shutdown(&self) {
        let handles = self.table().handles();
        if !handles.is_empty() {
            info!("Destroying {} excluded session(s)", handles.len());
        }
        for handle in handles {
            self.destroy(handle.to_raw()).await;
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.table().len()
    }
}

/// Dropping only signals the workers to stop; a callback already under way
/// may still run afterwards. Await [`ExcludedUdpSessionBridge::shutdown`]
/// first when that matters.
impl Drop for ExcludedUdpSessionBridge {
    fn drop(&mut self) {
        let mut table = self.table();
        for handle in table.handles() {
            if let Some(session) = table.remove(handle) {
                let _ = session.queue.send(Work::Shutdown);
            }
        }
    }
}

async fn run_worker(
    handle: u64,
    session: Arc<dyn UdpSession>,
    mut status: watch::Receiver<SessionStatus>,
    mut work: mpsc::UnboundedReceiver<Work>,
    callbacks: Arc<dyn ExcludedSessionCallbacks>,
) {
    // Sessions start out not ready
    let mut ready = false;
    let mut status_open = true;
    report_status(handle, &mut ready, status.borrow_and_update().is_usable(), &*callbacks);

    loop {
        tokio::select! {
            biased;
            next = work.recv() => match next {
                Some(Work::Send { datagrams, token }) => {
                    let code = match session.write_datagrams(&datagrams).await {
                        Ok(()) => 0,
                        Err(e) => {
                            debug!("Excluded send on {:#x} failed: {}", handle, e);
                            errno_of(&e)
                        }
                    };
                    callbacks.send_complete(handle, token, code);
                }
                Some(Work::Received(Ok(datagrams))) => callbacks.session_recv(handle, datagrams),
                Some(Work::Received(Err(e))) => callbacks.session_recv_err(handle, errno_of(&e)),
                Some(Work::Shutdown) | None => break,
            },
            changed = status.changed(), if status_open => match changed {
                Ok(()) => {
                    let usable = status.borrow_and_update().is_usable();
                    report_status(handle, &mut ready, usable, &*callbacks);
                }
                Err(_) => status_open = false,
            },
        }
    }

    session.cancel();
}

fn report_status(handle: u64, ready: &mut bool, usable: bool, callbacks: &dyn ExcludedSessionCallbacks) {
    if usable == *ready {
        return;
    }
    *ready = usable;
    if usable {
        callbacks.session_ready(handle);
    } else {
        callbacks.session_not_ready(handle);
    }
}
