//! Raw IP/UDP packet helpers
//!
//! Only what the protocol core needs: reading the destination of an
//! outbound packet for peer routing, and wrapping/unwrapping the UDP
//! datagrams an exit hop exchanges through the entry hop. Header layout
//! and checksums come from `smoltcp::wire`.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr,
    UdpPacket, UdpRepr,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const DEFAULT_TTL: u8 = 64;

/// A UDP datagram found inside an IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    /// Source endpoint
    pub source: SocketAddr,
    /// Destination endpoint
    pub destination: SocketAddr,
    /// UDP payload
    pub payload: &'a [u8],
}

fn to_std_v4(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

fn to_std_v6(addr: Ipv6Address) -> Ipv6Addr {
    Ipv6Addr::from(addr.0)
}

/// Destination address of a raw IP packet
pub fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let ipv4 = Ipv4Packet::new_checked(packet).ok()?;
            Some(IpAddr::V4(to_std_v4(ipv4.dst_addr())))
        }
        6 => {
            let ipv6 = Ipv6Packet::new_checked(packet).ok()?;
            Some(IpAddr::V6(to_std_v6(ipv6.dst_addr())))
        }
        _ => None,
    }
}

/// Build an IP packet carrying one UDP datagram.
///
/// Returns `None` when the endpoints belong to different families or the
/// payload does not fit a single datagram.
pub fn build_udp_packet(source: SocketAddr, destination: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp = UdpRepr {
        src_port: source.port(),
        dst_port: destination.port(),
    };
    let udp_len = udp.header_len() + payload.len();
    let checksums = ChecksumCapabilities::default();

    match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let ip = Ipv4Repr {
                src_addr: Ipv4Address::from_bytes(&src.octets()),
                dst_addr: Ipv4Address::from_bytes(&dst.octets()),
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: DEFAULT_TTL,
            };
            let total_len = ip.buffer_len() + udp_len;
            if total_len > usize::from(u16::MAX) {
                return None;
            }

            let mut buffer = vec![0u8; total_len];
            let mut packet = Ipv4Packet::new_unchecked(&mut buffer[..]);
            ip.emit(&mut packet, &checksums);
            udp.emit(
                &mut UdpPacket::new_unchecked(packet.payload_mut()),
                &IpAddress::Ipv4(ip.src_addr),
                &IpAddress::Ipv4(ip.dst_addr),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &checksums,
            );
            Some(buffer)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            if udp_len > usize::from(u16::MAX) {
                return None;
            }
            let ip = Ipv6Repr {
                src_addr: Ipv6Address::from_bytes(&src.octets()),
                dst_addr: Ipv6Address::from_bytes(&dst.octets()),
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: DEFAULT_TTL,
            };

            let mut buffer = vec![0u8; ip.buffer_len() + udp_len];
            let mut packet = Ipv6Packet::new_unchecked(&mut buffer[..]);
            ip.emit(&mut packet);
            udp.emit(
                &mut UdpPacket::new_unchecked(packet.payload_mut()),
                &IpAddress::Ipv6(ip.src_addr),
                &IpAddress::Ipv6(ip.dst_addr),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &checksums,
            );
            Some(buffer)
        }
        _ => None,
    }
}

/// Extract the UDP datagram carried by an IP packet, if it carries one
pub fn parse_udp_packet(packet: &[u8]) -> Option<UdpDatagram<'_>> {
    let (source, destination, udp) = match packet.first()? >> 4 {
        4 => {
            let ipv4 = Ipv4Packet::new_checked(packet).ok()?;
            if ipv4.next_header() != IpProtocol::Udp {
                return None;
            }
            (
                IpAddr::V4(to_std_v4(ipv4.src_addr())),
                IpAddr::V4(to_std_v4(ipv4.dst_addr())),
                ipv4.payload(),
            )
        }
        6 => {
            let ipv6 = Ipv6Packet::new_checked(packet).ok()?;
            if ipv6.next_header() != IpProtocol::Udp {
                return None;
            }
            (
                IpAddr::V6(to_std_v6(ipv6.src_addr())),
                IpAddr::V6(to_std_v6(ipv6.dst_addr())),
                ipv6.payload(),
            )
        }
        _ => return None,
    };

    let datagram = UdpPacket::new_checked(udp).ok()?;
    Some(UdpDatagram {
        source: SocketAddr::new(source, datagram.src_port()),
        destination: SocketAddr::new(destination, datagram.dst_port()),
        payload: datagram.payload(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ip_address(addr: IpAddr) -> IpAddress {
        match addr {
            IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
            IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
        }
    }

    #[test]
    fn test_ipv4_packet_layout() {
        let src = addr("10.64.0.2:40000");
        let dst = addr("185.65.134.1:51820");
        let packet = build_udp_packet(src, dst, b"hello").unwrap();

        assert_eq!(packet.len(), 20 + 8 + 5);
        let ipv4 = Ipv4Packet::new_checked(&packet[..]).unwrap();
        assert_eq!(ipv4.version(), 4);
        assert_eq!(ipv4.total_len(), 33);
        assert_eq!(ipv4.next_header(), IpProtocol::Udp);
        assert!(ipv4.verify_checksum());

        let udp = UdpPacket::new_checked(ipv4.payload()).unwrap();
        assert!(udp.verify_checksum(&ip_address(src.ip()), &ip_address(dst.ip())));
        assert_eq!(destination_ip(&packet), Some(dst.ip()));
    }

    #[test]
    fn test_parse_recovers_endpoints_and_payload() {
        let src = addr("10.64.0.2:40000");
        let dst = addr("185.65.134.1:51820");
        let packet = build_udp_packet(src, dst, b"wireguard").unwrap();

        let datagram = parse_udp_packet(&packet).unwrap();
        assert_eq!(datagram.source, src);
        assert_eq!(datagram.destination, dst);
        assert_eq!(datagram.payload, b"wireguard");
    }

    #[test]
    fn test_ipv6_packet() {
        let src = addr("[fc00:bbbb:bbbb:bb01::2]:40000");
        let dst = addr("[2a03:1b20::1]:51820");
        let packet = build_udp_packet(src, dst, &[1, 2, 3]).unwrap();

        assert_eq!(packet.len(), 40 + 8 + 3);
        assert_eq!(packet[0] >> 4, 6);
        assert_eq!(destination_ip(&packet), Some(dst.ip()));

        let datagram = parse_udp_packet(&packet).unwrap();
        assert_eq!(datagram.source, src);
        assert_eq!(datagram.payload, &[1, 2, 3]);

        // The UDP checksum is mandatory over IPv6
        let ipv6 = Ipv6Packet::new_checked(&packet[..]).unwrap();
        let udp = UdpPacket::new_checked(ipv6.payload()).unwrap();
        assert_ne!(udp.checksum(), 0);
        assert!(udp.verify_checksum(&ip_address(src.ip()), &ip_address(dst.ip())));
    }

    #[test]
    fn test_mixed_families_rejected() {
        assert!(build_udp_packet(addr("10.0.0.1:1"), addr("[::1]:2"), b"x").is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; usize::from(u16::MAX)];
        assert!(build_udp_packet(addr("10.0.0.1:1"), addr("10.0.0.2:2"), &payload).is_none());
    }

    #[test]
    fn test_parse_rejects_non_udp_and_truncated() {
        let mut packet = build_udp_packet(addr("10.0.0.1:1"), addr("10.0.0.2:2"), b"abc").unwrap();
        assert!(parse_udp_packet(&packet[..24]).is_none());

        packet[9] = 6; // TCP
        assert!(parse_udp_packet(&packet).is_none());
        assert!(parse_udp_packet(&[]).is_none());
    }

    #[test]
    fn test_destination_of_short_packet() {
        assert_eq!(destination_ip(&[0x45, 0, 0]), None);
        assert_eq!(destination_ip(&[0x00; 40]), None);
    }
}
