//! Frame crafting for the paths that bypass the stack's output pipeline.
//!
//! UDP replies, re-injected ICMP packets and synthesized TCP resets are
//! written to the link as complete Ethernet frames. Emission uses smoltcp's
//! wire representations so the result is always parseable by the same stack
//! that would otherwise have produced it.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Packet,
    Ipv4Repr, Ipv6Packet, Ipv6Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket,
    UdpRepr,
};
use std::net::SocketAddr;

pub(crate) const ETHERNET_HEADER_LEN: usize = 14;
pub(crate) const IPV4_HEADER_LEN: usize = 20;
pub(crate) const IPV6_HEADER_LEN: usize = 40;
pub(crate) const UDP_HEADER_LEN: usize = 8;

const REPLY_HOP_LIMIT: u8 = 64;

/// Craft a UDP frame from `src` to `dst` carrying `payload`.
///
/// Returns `None` when the families of the two addresses disagree.
pub(crate) fn udp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    caps: &ChecksumCapabilities,
) -> Option<Vec<u8>> {
    match (src, dst) {
        (SocketAddr::V4(src4), SocketAddr::V4(dst4)) => {
            let udp_len = UDP_HEADER_LEN + payload.len();
            let ip_len = IPV4_HEADER_LEN + udp_len;
            let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

            emit_ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);

            let ip_repr = Ipv4Repr {
                src_addr: *src4.ip(),
                dst_addr: *dst4.ip(),
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: REPLY_HOP_LIMIT,
            };
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet, caps);

            let udp_repr = UdpRepr {
                src_port: src.port(),
                dst_port: dst.port(),
            };
            let mut udp_packet =
                UdpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
            udp_repr.emit(
                &mut udp_packet,
                &(*src4.ip()).into(),
                &(*dst4.ip()).into(),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                caps,
            );
            Some(frame)
        }
        (SocketAddr::V6(src6), SocketAddr::V6(dst6)) => {
            let udp_len = UDP_HEADER_LEN + payload.len();
            let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV6_HEADER_LEN + udp_len];

            emit_ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv6);

            let ip_repr = Ipv6Repr {
                src_addr: *src6.ip(),
                dst_addr: *dst6.ip(),
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: REPLY_HOP_LIMIT,
            };
            let mut ip_packet = Ipv6Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);

            let udp_repr = UdpRepr {
                src_port: src.port(),
                dst_port: dst.port(),
            };
            let mut udp_packet =
                UdpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV6_HEADER_LEN..]);
            udp_repr.emit(
                &mut udp_packet,
                &(*src6.ip()).into(),
                &(*dst6.ip()).into(),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                caps,
            );
            Some(frame)
        }
        _ => None,
    }
}

/// Craft a TCP RST answering a connection attempt. `src`/`dst` are from the
/// responder's point of view; `isn` is the sequence number of the SYN being
/// refused.
pub(crate) fn tcp_rst_frame(
    src: SocketAddr,
    dst: SocketAddr,
    isn: TcpSeqNumber,
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    caps: &ChecksumCapabilities,
) -> Option<Vec<u8>> {
    let tcp_repr = TcpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
        control: TcpControl::Rst,
        seq_number: TcpSeqNumber(0),
        ack_number: Some(isn + 1),
        window_len: 0,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload: &[],
    };
    let tcp_len = tcp_repr.header_len();

    match (src, dst) {
        (SocketAddr::V4(src4), SocketAddr::V4(dst4)) => {
            let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_len];
            emit_ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);

            let ip_repr = Ipv4Repr {
                src_addr: *src4.ip(),
                dst_addr: *dst4.ip(),
                next_header: IpProtocol::Tcp,
                payload_len: tcp_len,
                hop_limit: REPLY_HOP_LIMIT,
            };
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet, caps);

            let mut tcp_packet =
                TcpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
            tcp_repr.emit(
                &mut tcp_packet,
                &(*src4.ip()).into(),
                &(*dst4.ip()).into(),
                caps,
            );
            Some(frame)
        }
        (SocketAddr::V6(src6), SocketAddr::V6(dst6)) => {
            let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV6_HEADER_LEN + tcp_len];
            emit_ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv6);

            let ip_repr = Ipv6Repr {
                src_addr: *src6.ip(),
                dst_addr: *dst6.ip(),
                next_header: IpProtocol::Tcp,
                payload_len: tcp_len,
                hop_limit: REPLY_HOP_LIMIT,
            };
            let mut ip_packet = Ipv6Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);

            let mut tcp_packet =
                TcpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV6_HEADER_LEN..]);
            tcp_repr.emit(
                &mut tcp_packet,
                &(*src6.ip()).into(),
                &(*dst6.ip()).into(),
                caps,
            );
            Some(frame)
        }
        _ => None,
    }
}

/// Wrap an already-complete IP packet in an Ethernet frame.
pub(crate) fn ethernet_wrap(
    packet: &[u8],
    protocol: EthernetProtocol,
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + packet.len()];
    emit_ethernet(&mut frame, src_mac, dst_mac, protocol);
    frame[ETHERNET_HEADER_LEN..].copy_from_slice(packet);
    frame
}

fn emit_ethernet(
    frame: &mut [u8],
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    ethertype: EthernetProtocol,
) {
    let eth_repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(frame);
    eth_repr.emit(&mut eth_frame);
}

/// RFC 1071 Internet checksum over `data`.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data))
}

/// Incrementally adjust a checksum after rewriting `old` bytes to `new`
/// (RFC 1624). Both slices must cover the same 16-bit-aligned field(s).
pub(crate) fn checksum_adjust(checksum: u16, old: &[u8], new: &[u8]) -> u16 {
    debug_assert_eq!(old.len(), new.len());
    let mut sum = (!checksum) as u32;
    for chunk in old.chunks(2) {
        sum += (!word(chunk)) as u32;
    }
    sum = fold(sum) as u32;
    sum = fold(sum_words(sum, new)) as u32;
    !(sum as u16)
}

fn word(chunk: &[u8]) -> u16 {
    if chunk.len() == 2 {
        u16::from_be_bytes([chunk[0], chunk[1]])
    } else {
        u16::from_be_bytes([chunk[0], 0])
    }
}

fn sum_words(start: u32, data: &[u8]) -> u32 {
    let mut sum = start;
    for chunk in data.chunks(2) {
        sum += word(chunk) as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::checksum_capabilities;
    use smoltcp::wire::IpAddress;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn caps() -> ChecksumCapabilities {
        ChecksumCapabilities::default()
    }

    const GW_MAC: EthernetAddress = EthernetAddress([0x24, 0xd2, 0xf4, 0x58, 0x34, 0xd7]);
    const GUEST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

    #[test]
    fn udp_frame_v4_parses_back() {
        let src = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 53));
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 19, 248, 2), 40000));
        let payload = b"answer";

        let frame = udp_frame(src, dst, payload, GW_MAC, GUEST_MAC, &caps()).unwrap();

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.src_addr(), GW_MAC);
        assert_eq!(eth.dst_addr(), GUEST_MAC);
        assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);

        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), Ipv4Addr::new(1, 1, 1, 1));
        assert!(ip.verify_checksum());

        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 40000);
        assert_eq!(udp.payload(), payload);
        // A full parse validates the transport checksum.
        let src_ip: IpAddress = ip.src_addr().into();
        let dst_ip: IpAddress = ip.dst_addr().into();
        UdpRepr::parse(&udp, &src_ip, &dst_ip, &caps()).unwrap();
    }

    #[test]
    fn udp_frame_v6_parses_back() {
        let src: SocketAddr = "[fd00::254]:7".parse().unwrap();
        let dst: SocketAddr = "[fd00::2]:50000".parse().unwrap();

        let frame = udp_frame(src, dst, b"pong", GW_MAC, GUEST_MAC, &caps()).unwrap();

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Ipv6);
        let ip = Ipv6Packet::new_checked(eth.payload()).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        let src_ip: IpAddress = ip.src_addr().into();
        let dst_ip: IpAddress = ip.dst_addr().into();
        UdpRepr::parse(&udp, &src_ip, &dst_ip, &caps()).unwrap();
    }

    #[test]
    fn full_offload_still_fills_the_ip_header_checksum() {
        // Transport checksums may be offloaded, the header checksum never
        // is; a guest verifies it on every frame.
        let offloaded = checksum_capabilities(true, true);
        let src: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let dst: SocketAddr = "198.19.248.2:40000".parse().unwrap();

        let frame = udp_frame(src, dst, b"answer", GW_MAC, GUEST_MAC, &offloaded).unwrap();
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());

        let rst = tcp_rst_frame(src, dst, TcpSeqNumber(7), GW_MAC, GUEST_MAC, &offloaded).unwrap();
        let eth = EthernetFrame::new_checked(&rst[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
    }

    #[test]
    fn udp_frame_rejects_mixed_families() {
        let src: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let dst: SocketAddr = "[fd00::2]:9".parse().unwrap();
        assert!(udp_frame(src, dst, b"", GW_MAC, GUEST_MAC, &caps()).is_none());
    }

    #[test]
    fn rst_frame_refuses_the_syn() {
        let src: SocketAddr = "198.19.248.254:55555".parse().unwrap();
        let dst: SocketAddr = "198.19.248.2:40000".parse().unwrap();
        let isn = TcpSeqNumber(0x1000);

        let frame = tcp_rst_frame(src, dst, isn, GW_MAC, GUEST_MAC, &caps()).unwrap();

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.rst());
        assert_eq!(tcp.src_port(), 55555);
        assert_eq!(tcp.dst_port(), 40000);
        assert_eq!(tcp.ack_number(), isn + 1);
    }

    #[test]
    fn internet_checksum_verifies_itself() {
        let mut header = vec![
            0x45, 0x00, 0x00, 0x28, 0x12, 0x34, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc6, 0x13,
            0xf8, 0x02, 0x01, 0x01, 0x01, 0x01,
        ];
        let checksum = internet_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(fold(sum_words(0, &header)), 0xffff);
    }

    #[test]
    fn incremental_adjust_matches_recomputation() {
        // A fake transport header whose checksum covers all of it.
        let mut data = vec![
            0x0a, 0x00, 0x00, 0x07, 0x30, 0x39, 0xd4, 0x31, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
        ];
        let checksum = internet_checksum(&data);
        data[8..10].copy_from_slice(&checksum.to_be_bytes());

        // Rewrite bytes 0..4 and patch the checksum incrementally.
        let old = data[0..4].to_vec();
        let new = [0xc6, 0x13, 0xf8, 0x02];
        data[0..4].copy_from_slice(&new);
        let adjusted = checksum_adjust(checksum, &old, &new);
        data[8..10].copy_from_slice(&adjusted.to_be_bytes());

        // Recomputing from scratch with the checksum field zeroed must agree.
        let mut scratch = data.clone();
        scratch[8..10].copy_from_slice(&[0, 0]);
        assert_eq!(internet_checksum(&scratch), adjusted);
    }

    #[test]
    fn ethernet_wrap_prepends_header() {
        let packet = vec![0x45u8; 20];
        let frame = ethernet_wrap(&packet, EthernetProtocol::Ipv4, GW_MAC, GUEST_MAC);
        assert_eq!(frame.len(), 34);
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.payload(), &packet[..]);
    }
}
