//! Frame parsing
//!
//! Reduces a raw ethernet frame to a `PacketSummary`. Non-IP frames and
//! malformed packets yield `None`; the caller counts them as dropped.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use crate::core::packet::{PacketSummary, TcpFlags};

/// Parse an ethernet frame into a packet summary.
///
/// `mono_ns` and `wall` come from the capture layer so replayed captures
/// keep their original timing.
pub fn parse_frame(data: &[u8], mono_ns: u64, wall: f64) -> Option<PacketSummary> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let (src_ip, dst_ip, protocol, ttl, is_ipv4) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                header.protocol().0,
                Some(header.ttl()),
                true,
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                header.next_header().0,
                None,
                false,
            )
        }
        // ARP and other non-IP frames are not flow material
        _ => return None,
    };

    let (src_port, dst_port, tcp_flags, transport_header_len, payload_len) =
        match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                let flags = TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                    ece: tcp.ece(),
                    cwr: tcp.cwr(),
                };
                // Data offset below 5 is malformed; treat as a bare 20-byte header
                let header_len = (tcp.data_offset().max(5) as u16) * 4;
                (
                    tcp.source_port(),
                    tcp.destination_port(),
                    Some(flags),
                    header_len,
                    tcp.payload().len() as u32,
                )
            }
            Some(TransportSlice::Udp(udp)) => (
                udp.source_port(),
                udp.destination_port(),
                None,
                8,
                udp.payload().len() as u32,
            ),
            Some(TransportSlice::Icmpv4(icmp)) => {
                (0, 0, None, 8, icmp.payload().len() as u32)
            }
            Some(TransportSlice::Icmpv6(icmp)) => {
                (0, 0, None, 8, icmp.payload().len() as u32)
            }
            _ => (0, 0, None, 0, 0),
        };

    Some(PacketSummary {
        mono_ns,
        wall,
        src_ip,
        dst_ip,
        protocol,
        src_port,
        dst_port,
        tcp_flags,
        total_len: data.len() as u32,
        transport_header_len,
        payload_len,
        ttl,
        is_ipv4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn test_parse_tcp_syn() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 10], [10, 0, 0, 1], 64)
            .tcp(54321, 80, 1000, 64240)
            .syn();
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let pkt = parse_frame(&frame, 42, 1_700_000_000.0).unwrap();
        assert_eq!(pkt.src_ip.to_string(), "192.168.1.10");
        assert_eq!(pkt.dst_ip.to_string(), "10.0.0.1");
        assert_eq!(pkt.protocol, 6);
        assert_eq!(pkt.src_port, 54321);
        assert_eq!(pkt.dst_port, 80);
        assert!(pkt.tcp_flags.unwrap().syn);
        assert!(!pkt.tcp_flags.unwrap().ack);
        assert_eq!(pkt.transport_header_len, 20);
        assert_eq!(pkt.ttl, Some(64));
        assert!(pkt.is_ipv4);
        assert_eq!(pkt.mono_ns, 42);
    }

    #[test]
    fn test_parse_udp_with_payload() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 10], [8, 8, 8, 8], 64)
            .udp(40000, 53);
        let payload = [0u8; 33];
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, &payload).unwrap();

        let pkt = parse_frame(&frame, 0, 0.0).unwrap();
        assert_eq!(pkt.protocol, 17);
        assert_eq!(pkt.dst_port, 53);
        assert_eq!(pkt.payload_len, 33);
        assert_eq!(pkt.transport_header_len, 8);
        assert!(pkt.tcp_flags.is_none());
    }

    #[test]
    fn test_truncated_frame_dropped() {
        assert!(parse_frame(&[0u8; 10], 0, 0.0).is_none());
    }

    #[test]
    fn test_non_ip_frame_dropped() {
        // ARP ethertype
        let mut frame = vec![0u8; 42];
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(parse_frame(&frame, 0, 0.0).is_none());
    }
}
