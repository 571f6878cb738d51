use byteorder::{BigEndian, ByteOrder};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::SystemTime;
use tracing::debug;

use crate::packet::CapturedDatagram;

const LINUX_SLL_HEADER_LEN: usize = 16;

/// How to peel the link layer off a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    RawIp,
    LinuxSll,
}

impl LinkKind {
    /// Map a libpcap datalink number; unsupported types yield `None`.
    pub fn from_datalink(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkKind::Ethernet),
            12 | 14 | 101 | 228 => Some(LinkKind::RawIp),
            113 => Some(LinkKind::LinuxSll),
            _ => None,
        }
    }
}

/// Decode a link-layer frame down to its UDP payload.
///
/// Anything that is not UDP over IPv4/IPv6 returns `None`.
pub fn decode_frame(
    kind: LinkKind,
    frame: &[u8],
    wire_len: u32,
    timestamp: SystemTime,
) -> Option<CapturedDatagram> {
    let (source, dest_port, payload) = match kind {
        LinkKind::Ethernet => {
            let ethernet = EthernetPacket::new(frame)?;
            decode_network(ethernet.get_ethertype(), ethernet.payload())?
        }
        LinkKind::RawIp => match frame.first()? >> 4 {
            4 => decode_ipv4(frame)?,
            6 => decode_ipv6(frame)?,
            _ => return None,
        },
        LinkKind::LinuxSll => {
            if frame.len() < LINUX_SLL_HEADER_LEN {
                return None;
            }
            let proto = u16::from_be_bytes([frame[14], frame[15]]);
            decode_network(EtherType(proto), &frame[LINUX_SLL_HEADER_LEN..])?
        }
    };

    Some(CapturedDatagram::new(source, dest_port, payload, timestamp).with_frame(frame.to_vec(), wire_len))
}

fn decode_network(ethertype: EtherType, bytes: &[u8]) -> Option<(SocketAddr, u16, Vec<u8>)> {
    match ethertype {
        EtherTypes::Ipv4 => decode_ipv4(bytes),
        EtherTypes::Ipv6 => decode_ipv6(bytes),
        _ => None,
    }
}

fn decode_ipv4(bytes: &[u8]) -> Option<(SocketAddr, u16, Vec<u8>)> {
    let ipv4 = Ipv4Packet::new(bytes)?;

    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < 20 || (ipv4.get_total_length() as usize) < header_len {
        debug!("Dropping malformed IPv4 header");
        return None;
    }
    // Only the first fragment carries the UDP header
    if ipv4.get_fragment_offset() != 0 {
        return None;
    }
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }

    let udp = UdpPacket::new(ipv4.payload())?;
    if (udp.get_length() as usize) < 8 {
        return None;
    }
    let source = SocketAddr::new(IpAddr::V4(ipv4.get_source()), udp.get_source());
    Some((source, udp.get_destination(), udp.payload().to_vec()))
}

fn decode_ipv6(bytes: &[u8]) -> Option<(SocketAddr, u16, Vec<u8>)> {
    let ipv6 = Ipv6Packet::new(bytes)?;
    if ipv6.get_next_header() != IpNextHeaderProtocols::Udp {
        return None;
    }

    let udp = UdpPacket::new(ipv6.payload())?;
    if (udp.get_length() as usize) < 8 {
        return None;
    }
    let source = SocketAddr::new(IpAddr::V6(ipv6.get_source()), udp.get_source());
    Some((source, udp.get_destination(), udp.payload().to_vec()))
}

/// Build a raw IPv4/UDP packet around a payload received on a socket, so it
/// can be stored in a capture file with the IPv4 link type.
pub fn build_ipv4_udp(src: SocketAddr, dest_ip: Ipv4Addr, dest_port: u16, payload: &[u8]) -> Option<Vec<u8>> {
    let src_ip = match src.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped()?,
    };
    let payload_len = u16::try_from(payload.len()).ok().filter(|len| *len <= u16::MAX - 28)?;

    let mut packet = Vec::with_capacity(28 + payload.len());
    packet.extend_from_slice(&create_ip_header(src_ip, dest_ip, payload_len));
    packet.extend_from_slice(&create_udp_header(src.port(), dest_port, payload_len));
    packet.extend_from_slice(payload);
    Some(packet)
}

fn create_ip_header(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, payload_len: u16) -> [u8; 20] {
    let mut header = [0u8; 20];

    header[0] = 0x45;
    BigEndian::write_u16(&mut header[2..4], 20 + 8 + payload_len);
    BigEndian::write_u16(&mut header[6..8], 0x4000); // don't fragment
    header[8] = 0x40;
    header[9] = 0x11;
    header[12..16].copy_from_slice(&src_ip.octets());
    header[16..20].copy_from_slice(&dest_ip.octets());

    let checksum = calculate_ip_checksum(&header);
    BigEndian::write_u16(&mut header[10..12], checksum);

    header
}

fn create_udp_header(src_port: u16, dest_port: u16, payload_len: u16) -> [u8; 8] {
    let mut header = [0u8; 8];

    BigEndian::write_u16(&mut header[0..2], src_port);
    BigEndian::write_u16(&mut header[2..4], dest_port);
    BigEndian::write_u16(&mut header[4..6], 8 + payload_len);
    // Checksum left at zero, which UDP over IPv4 allows

    header
}

fn calculate_ip_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        if chunk.len() == 2 {
            sum += ((chunk[0] as u32) << 8) + (chunk[1] as u32);
        } else {
            sum += (chunk[0] as u32) << 8;
        }
    }

    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    pub(crate) fn ethernet_frame(src: SocketAddr, dest_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x08, 0x00];
        frame.extend(build_ipv4_udp(src, Ipv4Addr::new(192, 0, 2, 1), dest_port, payload).unwrap());
        frame
    }

    #[test]
    fn test_decode_ethernet_udp() {
        let src: SocketAddr = "203.0.113.7:40123".parse().unwrap();
        let frame = ethernet_frame(src, 123, &[0x23; 48]);

        let dgram = decode_frame(LinkKind::Ethernet, &frame, frame.len() as u32, UNIX_EPOCH).unwrap();
        assert_eq!(dgram.source, src);
        assert_eq!(dgram.dest_port, 123);
        assert_eq!(dgram.payload, vec![0x23; 48]);
        assert_eq!(dgram.frame, frame);
        assert_eq!(dgram.wire_len, frame.len() as u32);
    }

    #[test]
    fn test_decode_raw_ip() {
        let src: SocketAddr = "198.51.100.2:123".parse().unwrap();
        let packet = build_ipv4_udp(src, Ipv4Addr::new(192, 0, 2, 1), 123, &[1, 2, 3]).unwrap();
        let dgram = decode_frame(LinkKind::RawIp, &packet, packet.len() as u32, UNIX_EPOCH).unwrap();
        assert_eq!(dgram.payload, vec![1, 2, 3]);
        assert_eq!(dgram.source, src);
    }

    #[test]
    fn test_decode_rejects_non_udp() {
        let src: SocketAddr = "203.0.113.7:40123".parse().unwrap();
        let mut frame = ethernet_frame(src, 123, &[0; 48]);
        frame[14 + 9] = 6; // TCP
        assert!(decode_frame(LinkKind::Ethernet, &frame, 0, UNIX_EPOCH).is_none());

        let mut arp = ethernet_frame(src, 123, &[0; 48]);
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert!(decode_frame(LinkKind::Ethernet, &arp, 0, UNIX_EPOCH).is_none());

        assert!(decode_frame(LinkKind::Ethernet, &frame[..10], 0, UNIX_EPOCH).is_none());
        assert!(decode_frame(LinkKind::LinuxSll, &[0; 8], 0, UNIX_EPOCH).is_none());
    }

    #[test]
    fn test_ip_checksum_verifies() {
        let src: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let packet = build_ipv4_udp(src, Ipv4Addr::new(10, 9, 8, 7), 123, &[0; 48]).unwrap();
        // Summing a header that includes its checksum yields zero after complement
        assert_eq!(calculate_ip_checksum(&packet[..20]), 0);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 20 + 8 + 48);
    }

    #[test]
    fn test_link_kind_mapping() {
        assert_eq!(LinkKind::from_datalink(1), Some(LinkKind::Ethernet));
        assert_eq!(LinkKind::from_datalink(228), Some(LinkKind::RawIp));
        assert_eq!(LinkKind::from_datalink(113), Some(LinkKind::LinuxSll));
        assert_eq!(LinkKind::from_datalink(105), None);
    }
}
