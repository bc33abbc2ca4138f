//! Synthetic packet builders shared by unit and integration tests.

use std::net::IpAddr;

use crate::core::packet::{PacketSummary, TcpFlags, PROTO_TCP};

/// Build a packet summary with sensible header defaults.
pub fn packet(
    src_ip: &str,
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    protocol: u8,
    mono_ns: u64,
) -> PacketSummary {
    let src: IpAddr = src_ip.parse().expect("valid src ip");
    let dst: IpAddr = dst_ip.parse().expect("valid dst ip");
    PacketSummary {
        mono_ns,
        wall: 1_700_000_000.0 + mono_ns as f64 / 1e9,
        src_ip: src,
        dst_ip: dst,
        protocol,
        src_port,
        dst_port,
        tcp_flags: if protocol == PROTO_TCP {
            Some(TcpFlags::default())
        } else {
            None
        },
        total_len: 60,
        transport_header_len: if protocol == PROTO_TCP { 20 } else { 8 },
        payload_len: 0,
        ttl: if src.is_ipv4() { Some(64) } else { None },
        is_ipv4: src.is_ipv4(),
    }
}

/// TCP packet with explicit flags
pub fn tcp_packet(
    src_ip: &str,
    src_port: u16,
    dst_ip: &str,
    dst_port: u16,
    flags: TcpFlags,
    mono_ns: u64,
) -> PacketSummary {
    let mut pkt = packet(src_ip, src_port, dst_ip, dst_port, PROTO_TCP, mono_ns);
    pkt.tcp_flags = Some(flags);
    pkt
}

/// A SYN-flood style burst on a single flow: `count` SYN packets at
/// `rate_per_sec` from one source port.
pub fn syn_flood(
    src_ip: &str,
    dst_ip: &str,
    dst_port: u16,
    count: u64,
    rate_per_sec: f64,
    start_ns: u64,
) -> Vec<PacketSummary> {
    let spacing_ns = (1e9 / rate_per_sec) as u64;
    (0..count)
        .map(|i| {
            tcp_packet(
                src_ip,
                40_000,
                dst_ip,
                dst_port,
                TcpFlags {
                    syn: true,
                    ..Default::default()
                },
                start_ns + i * spacing_ns,
            )
        })
        .collect()
}
