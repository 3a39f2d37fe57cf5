//! Desktop packet flow on a `tun` device

use crate::error::{AdapterError, Result};
use crate::platform::{Packet, PacketFlow};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};
use tun::Device;

const TUN_BUFFER_SIZE: usize = 65535;

/// Most packets returned by one `read_packets` call
const MAX_READ_BATCH: usize = 64;

/// A `tun` device exposed as a [`PacketFlow`]
pub struct TunInterface {
    name: String,
    device: Arc<Mutex<tun::platform::Device>>,
}

impl TunInterface {
    /// Create and bring up a TUN device
    pub fn create(name: &str, mtu: u16) -> Result<Self> {
        info!("Creating TUN device '{}' with MTU {}", name, mtu);

        let mut config = tun::Configuration::default();
        config.name(name).mtu(i32::from(mtu)).up();

        #[cfg(target_os = "linux")]
        config.platform(|config| {
            config.packet_information(false);
        });

        let device = tun::create(&config).map_err(|e| {
            AdapterError::Interface(format!("Failed to create TUN device '{}': {}", name, e))
        })?;

        let actual = device.name().map_err(|e| {
            AdapterError::Interface(format!("Failed to get TUN device name: {}", e))
        })?;

        device.set_nonblock().map_err(|e| {
            AdapterError::Interface(format!("Failed to set TUN device to non-blocking: {}", e))
        })?;

        info!("TUN device '{}' created", actual);
        Ok(Self {
            name: actual,
            device: Arc::new(Mutex::new(device)),
        })
    }

    /// Interface name assigned by the OS
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, tun::platform::Device>> {
        self.device
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "TUN device lock poisoned"))
    }

    /// Drain whatever is readable right now without blocking
    fn try_read_batch(&self, buffer: &mut [u8]) -> io::Result<Vec<Packet>> {
        let mut device = self.lock()?;
        let mut packets = Vec::new();

        while packets.len() < MAX_READ_BATCH {
            match device.read(buffer) {
                Ok(0) => break,
                Ok(n) => packets.push(Packet::new(Bytes::copy_from_slice(&buffer[..n]))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(packets)
    }
}

#[async_trait]
impl PacketFlow for TunInterface {
    async fn read_packets(&self) -> io::Result<Option<Vec<Packet>>> {
        let mut buffer = vec![0u8; TUN_BUFFER_SIZE];

        loop {
            let packets = self.try_read_batch(&mut buffer)?;
            if !packets.is_empty() {
                debug!("Read {} packet(s) from {}", packets.len(), self.name);
                return Ok(Some(packets));
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn write_packets(&self, packets: &[Packet]) -> io::Result<()> {
        let mut device = self.lock()?;
        for packet in packets {
            match device.write(&packet.data) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!("TUN write would block, dropping {} bytes", packet.data.len());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
