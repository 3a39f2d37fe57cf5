//! wg-tunnel-adapter: WireGuard packet-tunnel adapter
//!
//! Turns a sandboxed virtual network interface into a working WireGuard
//! tunnel. The host app hands over its platform services (interface packet
//! flow, network-settings application, OS-managed UDP sessions); the adapter
//! pushes the network settings, opens one UDP session per peer, and relays
//! packets between the interface and a protocol core.
//!
//! # Architecture
//!
//! A single actor task owns the protocol core, the peer session pool and
//! the byte counters. Interface reads, UDP reads and timer ticks are all
//! funnelled into it, so none of that state needs a lock.
//!
//! # Modules
//!
//! - `config`: Tunnel configuration, adapter options and TOML loading
//! - `tunnel`: Settings builder, session pool, relay engine and facade
//! - `ffi`: Protocol core boundary (batches, handles, traits)
//! - `wireguard`: Keys, packet helpers and the boringtun-backed core
//! - `platform`: OS seams and their desktop implementations
//! - `monitoring`: Traffic statistics
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ffi;
pub mod monitoring;
pub mod platform;
pub mod tunnel;
pub mod wireguard;

// Re-export commonly used types
pub use error::{AdapterError, Result};
pub use tunnel::{TunnelAdapter, TunnelState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
