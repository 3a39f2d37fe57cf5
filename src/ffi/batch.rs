//! Structured packet batches exchanged with the protocol core
//!
//! Every call into the core returns one [`IoBatch`]: an ordered list of
//! frames, each tagged with where it must go (a UDP peer or the host
//! interface) and its address family. The relay drains the whole batch by
//! value before the call that produced it returns.

use crate::error::{AdapterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Fixed per-frame header size in the wire encoding
const FRAME_HEADER_LEN: usize = 1 + 1 + 1 + 16 + 2 + 4;

/// IP address family of a packet or endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    /// Family of an IP address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Family of a raw IP packet, read from its version nibble
    pub fn of_packet(packet: &[u8]) -> Option<Self> {
        match packet.first().map(|b| b >> 4) {
            Some(4) => Some(AddressFamily::V4),
            Some(6) => Some(AddressFamily::V6),
            _ => None,
        }
    }

    /// Protocol number the platform packet flow tags packets with
    pub fn protocol_number(self) -> i32 {
        match self {
            AddressFamily::V4 => libc::AF_INET,
            AddressFamily::V6 => libc::AF_INET6,
        }
    }

    fn wire_tag(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }

    fn from_wire_tag(tag: u8) -> Result<Self> {
        match tag {
            4 => Ok(AddressFamily::V4),
            6 => Ok(AddressFamily::V6),
            other => Err(AdapterError::Serialization(format!(
                "Unknown address family tag: {}",
                other
            ))),
        }
    }
}

/// Where a frame has to be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// Encrypted datagram for a UDP peer session
    Udp,
    /// Decrypted IP packet for the virtual interface
    Host,
}

/// One packet inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Delivery target
    pub transport: Transport,
    /// Address family
    pub family: AddressFamily,
    /// Destination endpoint (UDP frames only)
    pub endpoint: Option<SocketAddr>,
    /// Raw bytes
    pub payload: Bytes,
}

impl Frame {
    /// Datagram bound for a UDP peer
    pub fn udp(endpoint: SocketAddr, payload: Bytes) -> Self {
        Self {
            transport: Transport::Udp,
            family: AddressFamily::of(&endpoint.ip()),
            endpoint: Some(endpoint),
            payload,
        }
    }

    /// IP packet bound for the virtual interface
    pub fn host(family: AddressFamily, payload: Bytes) -> Self {
        Self {
            transport: Transport::Host,
            family,
            endpoint: None,
            payload,
        }
    }
}

/// Datagrams for one UDP peer, in output order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpBatch {
    /// Destination endpoint
    pub endpoint: SocketAddr,
    /// Datagrams to write in a single call
    pub datagrams: Vec<Bytes>,
}

impl UdpBatch {
    /// Sum of datagram sizes
    pub fn total_len(&self) -> usize {
        self.datagrams.iter().map(Bytes::len).sum()
    }
}

/// Output of one protocol-core call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoBatch {
    frames: Vec<Frame>,
}

impl IoBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the batch has no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in output order
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Sum of all payload sizes
    pub fn total_len(&self) -> usize {
        self.frames.iter().map(|f| f.payload.len()).sum()
    }

    /// Consume the batch, grouping UDP frames per endpoint (first-seen
    /// order) and collecting host frames separately.
    pub fn split(self) -> (Vec<UdpBatch>, Vec<Frame>) {
        let mut udp: Vec<UdpBatch> = Vec::new();
        let mut host = Vec::new();

        for frame in self.frames {
            match (frame.transport, frame.endpoint) {
                (Transport::Udp, Some(endpoint)) => {
                    match udp.iter_mut().find(|b| b.endpoint == endpoint) {
                        Some(batch) => batch.datagrams.push(frame.payload),
                        None => udp.push(UdpBatch {
                            endpoint,
                            datagrams: vec![frame.payload],
                        }),
                    }
                }
                (Transport::Udp, None) => {
                    tracing::debug!("Dropping UDP frame without endpoint");
                }
                (Transport::Host, _) => host.push(frame),
            }
        }

        (udp, host)
    }

    /// Serialize for crossing a C boundary
    pub fn encode(&self) -> Bytes {
        let capacity = 4 + self.frames.len() * FRAME_HEADER_LEN + self.total_len();
        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_u32(self.frames.len() as u32);

        for frame in &self.frames {
            buf.put_u8(match frame.transport {
                Transport::Udp => 0,
                Transport::Host => 1,
            });
            buf.put_u8(frame.family.wire_tag());
            match frame.endpoint {
                Some(endpoint) => {
                    buf.put_u8(1);
                    let octets = match endpoint.ip() {
                        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
                        IpAddr::V6(v6) => v6.octets(),
                    };
                    buf.put_slice(&octets);
                    buf.put_u16(endpoint.port());
                }
                None => {
                    buf.put_u8(0);
                    buf.put_bytes(0, 16 + 2);
                }
            }
            buf.put_u32(frame.payload.len() as u32);
            buf.put_slice(&frame.payload);
        }

        buf.freeze()
    }

    /// Parse a batch produced by [`IoBatch::encode`]
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(AdapterError::Serialization(
                "Batch is shorter than its frame count".to_string(),
            ));
        }
        let count = buf.get_u32() as usize;
        let mut frames = Vec::with_capacity(count.min(4096));

        for index in 0..count {
            if buf.remaining() < FRAME_HEADER_LEN {
                return Err(AdapterError::Serialization(format!(
                    "Frame {} header truncated",
                    index
                )));
            }

            let transport = match buf.get_u8() {
                0 => Transport::Udp,
                1 => Transport::Host,
                other => {
                    return Err(AdapterError::Serialization(format!(
                        "Unknown transport tag: {}",
                        other
                    )))
                }
            };
            let family = AddressFamily::from_wire_tag(buf.get_u8())?;
            let has_endpoint = buf.get_u8() != 0;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            let len = buf.get_u32() as usize;

            if buf.remaining() < len {
                return Err(AdapterError::Serialization(format!(
                    "Frame {} payload truncated: {} of {} bytes",
                    index,
                    buf.remaining(),
                    len
                )));
            }
            let payload = buf.split_to(len);

            let endpoint = has_endpoint.then(|| {
                let ip = match family {
                    AddressFamily::V4 => {
                        let v6 = Ipv6Addr::from(octets);
                        IpAddr::V4(v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED))
                    }
                    AddressFamily::V6 => IpAddr::V6(Ipv6Addr::from(octets)),
                };
                SocketAddr::new(ip, port)
            });

            frames.push(Frame {
                transport,
                family,
                endpoint,
                payload,
            });
        }

        if buf.has_remaining() {
            return Err(AdapterError::Serialization(format!(
                "{} trailing bytes after batch",
                buf.remaining()
            )));
        }

        Ok(Self { frames })
    }
}

impl FromIterator<Frame> for IoBatch {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}
