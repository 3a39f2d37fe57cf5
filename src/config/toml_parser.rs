//! TOML configuration file parser
//!
//! A file holds the adapter tunables, the tunnel to bring up and, for
//! multihop, the entry hop:
//!
//! ```toml
//! [adapter]
//! stats_timeout_ms = 1000
//!
//! [tunnel.interface]
//! private_key = "..."
//! addresses = ["10.64.0.2/32"]
//!
//! [[tunnel.peers]]
//! public_key = "..."
//! endpoint = "51.15.0.1:51820"
//! allowed_ips = ["0.0.0.0/0"]
//! ```

use crate::config::{AdapterOptions, TunnelConfiguration};
use crate::error::{AdapterError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// TOML configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Adapter tunables
    #[serde(default)]
    pub adapter: AdapterOptions,

    /// Tunnel (exit hop when `entry` is present)
    pub tunnel: TunnelConfiguration,

    /// Entry hop for multihop
    #[serde(default)]
    pub entry: Option<TunnelConfiguration>,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            AdapterError::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(toml)
            .map_err(|e| AdapterError::Configuration(format!("Failed to parse TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.adapter.validate()?;
        self.tunnel
            .validate()
            .map_err(|e| AdapterError::Configuration(format!("[tunnel] {}", e)))?;
        if let Some(entry) = &self.entry {
            entry
                .validate()
                .map_err(|e| AdapterError::Configuration(format!("[entry] {}", e)))?;
        }
        Ok(())
    }

    /// Whether the file describes a multihop tunnel
    pub fn is_multihop(&self) -> bool {
        self.entry.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Host, MtuSetting};
    use crate::wireguard::PrivateKey;

    fn key() -> String {
        PrivateKey::generate().to_base64()
    }

    fn public() -> String {
        PrivateKey::generate().public_key().to_base64()
    }

    #[test]
    fn test_parse_basic_toml() {
        let toml = format!(
            r#"
            [tunnel.interface]
            private_key = "{}"
            addresses = ["10.64.0.2/32", "fc00:bbbb:bbbb:bb01::2/128"]
            dns = ["10.64.0.1"]
            dns_search = ["corp.example"]
            mtu = 1420

            [[tunnel.peers]]
            public_key = "{}"
            endpoint = "51.15.0.1:51820"
            allowed_ips = ["0.0.0.0/0", "::/0"]
            persistent_keepalive = 25
        "#,
            key(),
            public()
        );

        let config = TomlConfig::parse(&toml).expect("Failed to parse TOML");
        assert!(!config.is_multihop());
        assert_eq!(config.adapter, AdapterOptions::default());

        let interface = &config.tunnel.interface;
        assert_eq!(interface.addresses.len(), 2);
        assert_eq!(interface.dns.len(), 1);
        assert_eq!(interface.mtu, Some(1420));

        let peer = &config.tunnel.peers[0];
        assert_eq!(peer.resolved_endpoint(), Some("51.15.0.1:51820".parse().unwrap()));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.persistent_keepalive, Some(25));
    }

    #[test]
    fn test_parse_adapter_section_and_entry() {
        let toml = format!(
            r#"
            [adapter]
            stats_timeout_ms = 250
            mtu_fallback = {{ tunnel_overhead = 80 }}

            [tunnel.interface]
            private_key = "{}"

            [[tunnel.peers]]
            public_key = "{}"
            endpoint = "exit.relays.example:51820"

            [entry.interface]
            private_key = "{}"

            [[entry.peers]]
            public_key = "{}"
            endpoint = "[2a03:1b20::1]:51820"
        "#,
            key(),
            public(),
            key(),
            public()
        );

        let config = TomlConfig::parse(&toml).expect("Failed to parse TOML");
        assert!(config.is_multihop());
        assert_eq!(config.adapter.stats_timeout_ms, 250);
        assert_eq!(config.adapter.settings_timeout_ms, 5000);
        assert_eq!(config.adapter.mtu_fallback, MtuSetting::TunnelOverhead(80));

        let exit = config.tunnel.peers[0].endpoint.as_ref().unwrap();
        assert_eq!(exit.host, Host::Name("exit.relays.example".to_string()));
    }

    #[test]
    fn test_parse_with_defaults() {
        let toml = format!(
            r#"
            [tunnel.interface]
            private_key = "{}"
        "#,
            key()
        );

        let config = TomlConfig::parse(&toml).expect("Failed to parse TOML");
        assert!(config.tunnel.peers.is_empty());
        assert!(config.tunnel.interface.addresses.is_empty());
        assert_eq!(config.tunnel.interface.mtu, None);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        let bad_key = r#"
            [tunnel.interface]
            private_key = "not-a-key"
        "#;
        assert!(matches!(
            TomlConfig::parse(bad_key),
            Err(AdapterError::Configuration(_))
        ));

        let bad_mtu = format!(
            r#"
            [tunnel.interface]
            private_key = "{}"
            mtu = 100
        "#,
            key()
        );
        let err = TomlConfig::parse(&bad_mtu).unwrap_err();
        assert!(err.to_string().contains("[tunnel]"));
    }

    #[test]
    fn test_missing_file() {
        assert!(TomlConfig::from_file("/nonexistent/adapter.toml").is_err());
    }
}
