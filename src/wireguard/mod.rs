//! WireGuard protocol core
//!
//! Key handling and the boringtun-backed implementation of the
//! [`ProtocolCore`](crate::ffi::ProtocolCore) boundary.

mod core;
mod keys;
pub mod packet;

pub use self::core::{BoringtunCore, BoringtunCoreFactory};
pub use keys::{PresharedKey, PrivateKey, PublicKey};
