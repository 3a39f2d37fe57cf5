//! Desktop UDP sessions on connected tokio sockets

use crate::error::{AdapterError, Result};
use crate::platform::{ReadHandler, SessionState, SessionStatus, UdpSession, UdpSessionFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const UDP_BUFFER_SIZE: usize = 65535;

/// UDP session to one remote endpoint on its own connected socket
pub struct TokioUdpSession {
    remote: SocketAddr,
    socket: Arc<TokioUdpSocket>,
    status: watch::Sender<SessionStatus>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TokioUdpSession {
    /// Bind an ephemeral port and connect it to `remote`
    pub fn connect(remote: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let std_socket = UdpSocket::bind(local).map_err(|e| {
            AdapterError::Session(format!("Failed to bind UDP socket for {}: {}", remote, e))
        })?;
        std_socket.connect(remote).map_err(|e| {
            AdapterError::Session(format!("Failed to connect UDP socket to {}: {}", remote, e))
        })?;
        std_socket.set_nonblocking(true).map_err(|e| {
            AdapterError::Session(format!("Failed to set socket non-blocking: {}", e))
        })?;
        let socket = TokioUdpSocket::from_std(std_socket).map_err(|e| {
            AdapterError::Session(format!("Failed to create tokio UdpSocket: {}", e))
        })?;

        // A connected datagram socket is usable straight away
        let (status, _) = watch::channel(SessionStatus::ready());

        debug!("UDP session to {} on {:?}", remote, socket.local_addr().ok());
        Ok(Self {
            remote,
            socket: Arc::new(socket),
            status,
            reader: Mutex::new(None),
        })
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn replace_reader(&self, reader: Option<JoinHandle<()>>) {
        let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = std::mem::replace(&mut *slot, reader) {
            old.abort();
        }
    }
}

/// Receive one datagram, then whatever else is already queued, up to `max`
async fn recv_batch(socket: &TokioUdpSocket, buffer: &mut [u8], max: usize) -> io::Result<Vec<Bytes>> {
    let n = socket.recv(buffer).await?;
    let mut datagrams = vec![Bytes::copy_from_slice(&buffer[..n])];

    while datagrams.len() < max {
        match socket.try_recv(buffer) {
            Ok(n) => datagrams.push(Bytes::copy_from_slice(&buffer[..n])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    Ok(datagrams)
}

#[async_trait]
impl UdpSession for TokioUdpSession {
    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    async fn write_datagrams(&self, datagrams: &[Bytes]) -> io::Result<()> {
        for datagram in datagrams {
            self.socket.send(datagram).await?;
        }
        Ok(())
    }

    fn set_read_handler(&self, handler: ReadHandler, max_datagrams: usize) {
        let socket = Arc::clone(&self.socket);
        let remote = self.remote;
        let max = max_datagrams.max(1);

        let reader = tokio::spawn(async move {
            let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                let result = recv_batch(&socket, &mut buffer, max).await;
                if let Ok(datagrams) = &result {
                    trace!("Read {} datagram(s) from {}", datagrams.len(), remote);
                }
                handler(result);
            }
        });

        self.replace_reader(Some(reader));
    }

    fn cancel(&self) {
        self.replace_reader(None);
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            *status = SessionStatus::terminal(SessionState::Cancelled);
            true
        });
    }
}

impl Drop for TokioUdpSession {
    fn drop(&mut self) {
        self.replace_reader(None);
    }
}

/// Opens [`TokioUdpSession`]s
#[derive(Debug, Default, Clone)]
pub struct TokioUdpSessionFactory;

impl TokioUdpSessionFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

impl UdpSessionFactory for TokioUdpSessionFactory {
    fn create_session(&self, remote: SocketAddr) -> Result<Arc<dyn UdpSession>> {
        Ok(Arc::new(TokioUdpSession::connect(remote)?))
    }

    fn upgrade_session(&self, session: &Arc<dyn UdpSession>) -> Result<Arc<dyn UdpSession>> {
        // A fresh socket picks up whatever route is current
        self.create_session(session.remote())
    }
}
