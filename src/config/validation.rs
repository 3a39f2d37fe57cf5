//! Configuration validation functions
//!
//! Field-level checks for tunnel configuration and adapter options. Key
//! and CIDR syntax is already enforced while deserialising, so these only
//! cover ranges and cross-field rules.

use crate::config::{AdapterOptions, MtuSetting, PeerConfiguration, TunnelConfiguration};
use crate::error::{AdapterError, Result};
use std::collections::HashSet;

/// Validate MTU value (1280-1500 range for WireGuard)
pub fn validate_mtu(mtu: u16) -> Result<()> {
    if !(1280..=1500).contains(&mtu) {
        return Err(AdapterError::Configuration(format!(
            "MTU value {} is out of valid range (1280-1500)",
            mtu
        )));
    }
    Ok(())
}

/// Validate an endpoint port
pub fn validate_port(port: u16, endpoint: &str) -> Result<()> {
    if port == 0 {
        return Err(AdapterError::Configuration(format!(
            "Port number cannot be 0 in endpoint {}",
            endpoint
        )));
    }
    Ok(())
}

/// Validate keepalive interval
pub fn validate_keepalive(secs: u16) -> Result<()> {
    // 0 disables keepalives
    if secs > 0 && secs < 10 {
        return Err(AdapterError::Configuration(format!(
            "Keepalive interval {} is too short (minimum 10 seconds or 0 to disable)",
            secs
        )));
    }

    if secs > 300 {
        return Err(AdapterError::Configuration(format!(
            "Keepalive interval {} is too long (maximum 300 seconds)",
            secs
        )));
    }

    Ok(())
}

/// Validate a DNS search domain
pub fn validate_search_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(AdapterError::Configuration(format!(
            "Invalid DNS search domain: '{}'",
            domain
        )));
    }

    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(AdapterError::Configuration(format!(
            "DNS search domain '{}' contains invalid characters",
            domain
        )));
    }

    Ok(())
}

fn validate_peer(peer: &PeerConfiguration) -> Result<()> {
    if let Some(secs) = peer.persistent_keepalive {
        validate_keepalive(secs)?;
    }
    Ok(())
}

/// Validate a whole tunnel configuration
pub fn validate_tunnel(config: &TunnelConfiguration) -> Result<()> {
    if let Some(mtu) = config.interface.mtu.filter(|mtu| *mtu != 0) {
        validate_mtu(mtu)?;
    }

    for domain in &config.interface.dns_search {
        validate_search_domain(domain)?;
    }

    let mut seen = HashSet::new();
    for peer in &config.peers {
        if !seen.insert(peer.public_key.clone()) {
            return Err(AdapterError::Configuration(format!(
                "Duplicate peer public key: {}",
                peer.public_key
            )));
        }
        validate_peer(peer)?;
    }

    Ok(())
}

/// Validate adapter options
pub fn validate_options(options: &AdapterOptions) -> Result<()> {
    if options.timer_interval_ms == 0 {
        return Err(AdapterError::Configuration(
            "Timer interval cannot be 0".to_string(),
        ));
    }

    if options.max_read_datagrams == 0 {
        return Err(AdapterError::Configuration(
            "max_read_datagrams cannot be 0".to_string(),
        ));
    }

    if options.inbound_queue_batches == 0 {
        return Err(AdapterError::Configuration(
            "inbound_queue_batches cannot be 0".to_string(),
        ));
    }

    for (name, value) in [
        ("settings_timeout_ms", options.settings_timeout_ms),
        ("session_ready_timeout_ms", options.session_ready_timeout_ms),
        ("stats_timeout_ms", options.stats_timeout_ms),
    ] {
        if value == 0 {
            return Err(AdapterError::Configuration(format!("{} cannot be 0", name)));
        }
    }

    if let MtuSetting::Fixed(mtu) = options.mtu_fallback {
        validate_mtu(mtu)?;
    }

    Ok(())
}
