//! Network settings descriptor
//!
//! Pure translation from a [`TunnelConfiguration`] into the addresses,
//! routes, DNS and MTU the OS is asked to apply to the virtual interface.

use crate::config::{Host, MtuSetting, TunnelConfiguration};
use crate::error::Result;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

/// Least specific IPv6 prefix the platform honours for addresses and routes
pub const MIN_IPV6_PREFIX: u8 = 120;

/// Remote address reported when no peer has a concrete IPv4 endpoint
pub const PLACEHOLDER_REMOTE_ADDRESS: &str = "127.0.0.1";

/// IPv6 prefix as advertised to the OS. `::/0` stays the default route.
pub fn clamp_ipv6_prefix(prefix: u8) -> u8 {
    if prefix == 0 {
        0
    } else {
        prefix.max(MIN_IPV6_PREFIX)
    }
}

fn clamp_ipv6(network: Ipv6Net) -> Ipv6Net {
    let prefix = clamp_ipv6_prefix(network.prefix_len());
    // Clamped prefixes never exceed 128
    Ipv6Net::new(network.addr(), prefix).unwrap_or(network)
}

/// An IPv4 interface address in address/mask form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4InterfaceAddress {
    /// Address
    pub address: Ipv4Addr,
    /// Subnet mask
    pub subnet_mask: Ipv4Addr,
}

/// IPv4 part of the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ipv4Settings {
    /// Interface addresses
    pub addresses: Vec<Ipv4InterfaceAddress>,
    /// Routes sent through the tunnel
    pub included_routes: Vec<Ipv4Net>,
}

/// IPv6 part of the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ipv6Settings {
    /// Interface addresses with (clamped) prefix lengths
    pub addresses: Vec<Ipv6Net>,
    /// Routes sent through the tunnel (clamped)
    pub included_routes: Vec<Ipv6Net>,
}

/// Resolver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsSettings {
    /// DNS servers
    pub servers: Vec<IpAddr>,
    /// Search domains
    pub search_domains: Vec<String>,
    /// Domains routed to these servers; `[""]` means all of them
    pub match_domains: Vec<String>,
}

/// Everything the OS applies to the virtual interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSettings {
    /// Address shown as the tunnel's remote end
    pub remote_address: String,
    /// MTU choice
    pub mtu: MtuSetting,
    /// DNS, when any server or search domain is configured
    pub dns: Option<DnsSettings>,
    /// IPv4 addresses and routes
    pub ipv4: Ipv4Settings,
    /// IPv6 addresses and routes
    pub ipv6: Ipv6Settings,
}

impl NetworkSettings {
    /// Build the descriptor for a single-hop tunnel
    pub fn build(config: &TunnelConfiguration, mtu_fallback: MtuSetting) -> Self {
        Self::from_parts(remote_address(config), config, mtu_fallback)
    }

    /// Build the descriptor for a multihop tunnel: addressing, DNS and
    /// routes come from the exit hop, the remote address from the entry
    pub fn build_multihop(
        entry: Option<&TunnelConfiguration>,
        exit: &TunnelConfiguration,
        mtu_fallback: MtuSetting,
    ) -> Self {
        let remote = remote_address(entry.unwrap_or(exit));
        Self::from_parts(remote, exit, mtu_fallback)
    }

    fn from_parts(remote_address: String, config: &TunnelConfiguration, mtu_fallback: MtuSetting) -> Self {
        let interface = &config.interface;

        let dns = (!interface.dns.is_empty() || !interface.dns_search.is_empty()).then(|| {
            DnsSettings {
                servers: interface.dns.clone(),
                search_domains: interface.dns_search.clone(),
                match_domains: if interface.dns.is_empty() {
                    Vec::new()
                } else {
                    vec![String::new()]
                },
            }
        });

        let mtu = match interface.mtu {
            Some(mtu) if mtu != 0 => MtuSetting::Fixed(mtu),
            _ => mtu_fallback,
        };

        let mut ipv4 = Ipv4Settings::default();
        let mut ipv6 = Ipv6Settings::default();

        for network in &interface.addresses {
            match network {
                IpNet::V4(v4) => ipv4.addresses.push(Ipv4InterfaceAddress {
                    address: v4.addr(),
                    subnet_mask: v4.netmask(),
                }),
                IpNet::V6(v6) => ipv6.addresses.push(clamp_ipv6(*v6)),
            }
        }

        for peer in &config.peers {
            for network in &peer.allowed_ips {
                match network {
                    IpNet::V4(v4) => ipv4.included_routes.push(*v4),
                    IpNet::V6(v6) => ipv6.included_routes.push(clamp_ipv6(*v6)),
                }
            }
        }

        Self {
            remote_address,
            mtu,
            dns,
            ipv4,
            ipv6,
        }
    }

    /// JSON form handed to platform glue
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn remote_address(config: &TunnelConfiguration) -> String {
    config
        .peers
        .iter()
        .filter_map(|peer| peer.endpoint.as_ref())
        .find_map(|endpoint| match &endpoint.host {
            Host::Ip(ip) if ip.is_ipv4() => Some(ip.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| PLACEHOLDER_REMOTE_ADDRESS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfiguration;
    use crate::wireguard::PrivateKey;
    use proptest::prelude::*;

    fn peer(endpoint: Option<&str>, allowed: &[&str]) -> PeerConfiguration {
        let mut peer = PeerConfiguration::new(PrivateKey::generate().public_key());
        peer.endpoint = endpoint.map(|e| e.parse().unwrap());
        peer.allowed_ips = allowed.iter().map(|s| s.parse().unwrap()).collect();
        peer
    }

    fn config(addresses: &[&str], peers: Vec<PeerConfiguration>) -> TunnelConfiguration {
        let mut config = TunnelConfiguration::new(PrivateKey::generate());
        config.interface.addresses = addresses.iter().map(|s| s.parse().unwrap()).collect();
        config.peers = peers;
        config
    }

    #[test]
    fn test_single_peer_scenario() {
        let config = config(
            &["10.64.0.2/32"],
            vec![peer(Some("51.15.0.1:51820"), &["0.0.0.0/0"])],
        );
        let settings = NetworkSettings::build(&config, MtuSetting::Fixed(1280));

        assert_eq!(settings.remote_address, "51.15.0.1");
        assert_eq!(settings.mtu, MtuSetting::Fixed(1280));
        assert_eq!(settings.dns, None);
        assert_eq!(
            settings.ipv4.addresses,
            vec![Ipv4InterfaceAddress {
                address: "10.64.0.2".parse().unwrap(),
                subnet_mask: "255.255.255.255".parse().unwrap(),
            }]
        );
        assert_eq!(settings.ipv4.included_routes, vec!["0.0.0.0/0".parse().unwrap()]);
        assert!(settings.ipv6.included_routes.is_empty());
    }

    #[test]
    fn test_remote_address_prefers_first_ipv4() {
        let config = config(
            &[],
            vec![
                peer(Some("[2a03:1b20::1]:51820"), &[]),
                peer(Some("relay.example:51820"), &[]),
                peer(Some("185.65.134.1:51820"), &[]),
                peer(Some("51.15.0.1:51820"), &[]),
            ],
        );
        assert_eq!(NetworkSettings::build(&config, MtuSetting::Fixed(1280)).remote_address, "185.65.134.1");

        let no_v4 = self::config(&[], vec![peer(Some("[2a03:1b20::1]:51820"), &[])]);
        assert_eq!(
            NetworkSettings::build(&no_v4, MtuSetting::Fixed(1280)).remote_address,
            PLACEHOLDER_REMOTE_ADDRESS
        );
    }

    #[test]
    fn test_ipv6_prefixes_clamped_ipv4_untouched() {
        let config = config(
            &["fc00:bbbb:bbbb:bb01::2/64", "10.64.0.2/32"],
            vec![peer(None, &["2001:db8::/64", "::/0", "192.168.0.0/16", "10.0.0.1/32"])],
        );
        let settings = NetworkSettings::build(&config, MtuSetting::Fixed(1280));

        assert_eq!(settings.ipv6.addresses[0].prefix_len(), 120);
        let v6_routes: Vec<u8> = settings.ipv6.included_routes.iter().map(|n| n.prefix_len()).collect();
        assert_eq!(v6_routes, vec![120, 0]);
        let v4_routes: Vec<u8> = settings.ipv4.included_routes.iter().map(|n| n.prefix_len()).collect();
        assert_eq!(v4_routes, vec![16, 32]);
    }

    #[test]
    fn test_dns_settings() {
        let mut with_servers = config(&[], vec![]);
        with_servers.interface.dns = vec!["10.64.0.1".parse().unwrap()];
        let dns = NetworkSettings::build(&with_servers, MtuSetting::Fixed(1280)).dns.unwrap();
        assert_eq!(dns.match_domains, vec![String::new()]);

        let mut search_only = config(&[], vec![]);
        search_only.interface.dns_search = vec!["corp.example".to_string()];
        let dns = NetworkSettings::build(&search_only, MtuSetting::Fixed(1280)).dns.unwrap();
        assert!(dns.servers.is_empty());
        assert!(dns.match_domains.is_empty());
        assert_eq!(dns.search_domains, vec!["corp.example".to_string()]);
    }

    #[test]
    fn test_mtu_selection() {
        let mut config = config(&[], vec![]);
        assert_eq!(
            NetworkSettings::build(&config, MtuSetting::TunnelOverhead(80)).mtu,
            MtuSetting::TunnelOverhead(80)
        );

        config.interface.mtu = Some(0);
        assert_eq!(NetworkSettings::build(&config, MtuSetting::Fixed(1280)).mtu, MtuSetting::Fixed(1280));

        config.interface.mtu = Some(1420);
        assert_eq!(NetworkSettings::build(&config, MtuSetting::Fixed(1280)).mtu, MtuSetting::Fixed(1420));
    }

    #[test]
    fn test_multihop_uses_exit_addressing_and_entry_remote() {
        let entry = config(&["10.64.1.2/32"], vec![peer(Some("51.15.0.1:51820"), &["185.65.134.1/32"])]);
        let exit = config(&["10.64.0.2/32"], vec![peer(Some("185.65.134.1:51820"), &["0.0.0.0/0"])]);

        let settings = NetworkSettings::build_multihop(Some(&entry), &exit, MtuSetting::Fixed(1280));
        assert_eq!(settings.remote_address, "51.15.0.1");
        assert_eq!(settings.ipv4.addresses[0].address, "10.64.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(settings.ipv4.included_routes, vec!["0.0.0.0/0".parse().unwrap()]);

        let without_entry = NetworkSettings::build_multihop(None, &exit, MtuSetting::Fixed(1280));
        assert_eq!(without_entry.remote_address, "185.65.134.1");
    }

    #[test]
    fn test_to_json() {
        let config = config(&["10.64.0.2/32"], vec![peer(Some("51.15.0.1:51820"), &["0.0.0.0/0"])]);
        let json = NetworkSettings::build(&config, MtuSetting::Fixed(1280)).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["remote_address"], "51.15.0.1");
        assert_eq!(value["mtu"]["fixed"], 1280);
        assert_eq!(value["ipv4"]["included_routes"][0], "0.0.0.0/0");
    }

    proptest! {
        #[test]
        fn test_clamped_prefix_is_default_or_at_least_min(prefix in 0u8..=128) {
            let clamped = clamp_ipv6_prefix(prefix);
            prop_assert!(clamped == 0 || clamped >= MIN_IPV6_PREFIX);
            prop_assert!(clamped >= prefix);
            prop_assert_eq!(clamped == 0, prefix == 0);
        }
    }
}
