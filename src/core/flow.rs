//! Bidirectional flow state
//!
//! A flow owns compact per-packet records and incrementally maintained
//! counters. All mutation happens in the aggregator task; everything that
//! leaves the table is an immutable `FlowSnapshot`.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::packet::{AppProtocol, PacketSummary, TcpFlags, PROTO_ICMP, PROTO_TCP, PROTO_UDP};

/// Canonical flow key: the (src, dst) order first observed for the pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_packet(pkt: &PacketSummary) -> Self {
        Self {
            src_ip: pkt.src_ip,
            dst_ip: pkt.dst_ip,
            protocol: pkt.protocol,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
        }
    }

    /// The same flow observed from the opposite direction
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            protocol: self.protocol,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

/// Per-flag packet counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCounts {
    pub fin: u64,
    pub syn: u64,
    pub rst: u64,
    pub psh: u64,
    pub ack: u64,
    pub urg: u64,
    pub ece: u64,
    pub cwr: u64,
}

impl FlagCounts {
    pub fn record(&mut self, flags: &TcpFlags) {
        if flags.fin {
            self.fin = self.fin.saturating_add(1);
        }
        if flags.syn {
            self.syn = self.syn.saturating_add(1);
        }
        if flags.rst {
            self.rst = self.rst.saturating_add(1);
        }
        if flags.psh {
            self.psh = self.psh.saturating_add(1);
        }
        if flags.ack {
            self.ack = self.ack.saturating_add(1);
        }
        if flags.urg {
            self.urg = self.urg.saturating_add(1);
        }
        if flags.ece {
            self.ece = self.ece.saturating_add(1);
        }
        if flags.cwr {
            self.cwr = self.cwr.saturating_add(1);
        }
    }

    pub fn total(&self) -> u64 {
        self.fin
            .saturating_add(self.syn)
            .saturating_add(self.rst)
            .saturating_add(self.psh)
            .saturating_add(self.ack)
            .saturating_add(self.urg)
            .saturating_add(self.ece)
            .saturating_add(self.cwr)
    }
}

/// Protocols observed anywhere in the flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSeen {
    pub http: bool,
    pub https: bool,
    pub dns: bool,
    pub telnet: bool,
    pub smtp: bool,
    pub ssh: bool,
    pub irc: bool,
    pub tcp: bool,
    pub udp: bool,
    pub icmp: bool,
    pub dhcp: bool,
    pub arp: bool,
    pub ipv4: bool,
}

impl ProtocolSeen {
    pub fn observe(&mut self, pkt: &PacketSummary) {
        match pkt.app_protocol() {
            AppProtocol::Http => self.http = true,
            AppProtocol::Https => self.https = true,
            AppProtocol::Dns => self.dns = true,
            AppProtocol::Telnet => self.telnet = true,
            AppProtocol::Smtp => self.smtp = true,
            AppProtocol::Ssh => self.ssh = true,
            AppProtocol::Irc => self.irc = true,
            AppProtocol::Unknown => {}
        }
        match pkt.protocol {
            PROTO_TCP => self.tcp = true,
            PROTO_UDP => self.udp = true,
            PROTO_ICMP => self.icmp = true,
            _ => {}
        }
        if pkt.is_dhcp() {
            self.dhcp = true;
        }
        if pkt.is_ipv4 {
            self.ipv4 = true;
        }
    }
}

/// Retained per-packet record (headers already reduced to scalars)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub mono_ns: u64,
    /// Total frame length
    pub size: u32,
    /// Transport header length
    pub header_len: u16,
    pub payload_len: u32,
    /// Raw TCP flag bits (0 for non-TCP)
    pub flags: u8,
    /// Packet traveled toward the flow's canonical destination
    pub to_dst: bool,
}

/// Mutable flow state, owned by the aggregator
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    /// Wall time of the first packet, epoch seconds
    pub first_wall: f64,

    pub records: Vec<PacketRecord>,

    pub packet_count: u64,
    pub byte_total: u64,
    pub payload_total: u64,
    pub flag_counts: FlagCounts,
    pub seen: ProtocolSeen,
    /// Smallest TTL observed on IPv4 packets
    pub min_ttl: Option<u8>,
    /// Packets traveling toward the canonical destination
    pub dst_packets: u64,

    /// Packet count at the last scoring pass
    pub last_scored_packet_count: u64,
}

impl Flow {
    /// Create a flow from its first packet; the packet's direction becomes
    /// the canonical direction.
    pub fn new(pkt: &PacketSummary) -> Self {
        let mut flow = Self {
            key: FlowKey::from_packet(pkt),
            first_seen_ns: pkt.mono_ns,
            last_seen_ns: pkt.mono_ns,
            first_wall: pkt.wall,
            records: Vec::new(),
            packet_count: 0,
            byte_total: 0,
            payload_total: 0,
            flag_counts: FlagCounts::default(),
            seen: ProtocolSeen::default(),
            min_ttl: None,
            dst_packets: 0,
            last_scored_packet_count: 0,
        };
        flow.update(pkt);
        flow
    }

    /// Append a packet from either direction
    pub fn update(&mut self, pkt: &PacketSummary) {
        if pkt.mono_ns > self.last_seen_ns {
            self.last_seen_ns = pkt.mono_ns;
        }

        let to_dst = pkt.dst_ip == self.key.dst_ip && pkt.dst_port == self.key.dst_port;

        self.packet_count = self.packet_count.saturating_add(1);
        self.byte_total = self.byte_total.saturating_add(pkt.total_len as u64);
        self.payload_total = self.payload_total.saturating_add(pkt.payload_len as u64);
        if to_dst {
            self.dst_packets = self.dst_packets.saturating_add(1);
        }

        if let Some(flags) = &pkt.tcp_flags {
            self.flag_counts.record(flags);
        }
        self.seen.observe(pkt);

        if let Some(ttl) = pkt.ttl {
            self.min_ttl = Some(match self.min_ttl {
                Some(current) => current.min(ttl),
                None => ttl,
            });
        }

        self.records.push(PacketRecord {
            mono_ns: pkt.mono_ns,
            size: pkt.total_len,
            header_len: pkt.transport_header_len,
            payload_len: pkt.payload_len,
            flags: pkt.tcp_flags.map(|f| f.to_u8()).unwrap_or(0),
            to_dst,
        });
    }

    /// Packets arrived since the last scoring pass
    pub fn packets_since_scored(&self) -> u64 {
        self.packet_count.saturating_sub(self.last_scored_packet_count)
    }

    pub fn mark_scored(&mut self) {
        self.last_scored_packet_count = self.packet_count;
    }

    /// Immutable view for extraction, scoring and the query surface
    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            key: self.key.clone(),
            first_seen_ns: self.first_seen_ns,
            last_seen_ns: self.last_seen_ns,
            first_wall: self.first_wall,
            packet_count: self.packet_count,
            byte_total: self.byte_total,
            payload_total: self.payload_total,
            flag_counts: self.flag_counts,
            seen: self.seen,
            min_ttl: self.min_ttl,
            dst_packets: self.dst_packets,
            records: self.records.clone(),
        }
    }

    /// Compact row for the flow list view
    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            key: self.key.clone(),
            packet_count: self.packet_count,
            byte_total: self.byte_total,
            last_seen_ns: self.last_seen_ns,
        }
    }
}

/// Point-in-time immutable copy of a flow
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    pub first_wall: f64,
    pub packet_count: u64,
    pub byte_total: u64,
    pub payload_total: u64,
    pub flag_counts: FlagCounts,
    pub seen: ProtocolSeen,
    pub min_ttl: Option<u8>,
    pub dst_packets: u64,
    pub records: Vec<PacketRecord>,
}

impl FlowSnapshot {
    /// Flow duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.last_seen_ns.saturating_sub(self.first_seen_ns) as f64 / 1e9
    }

    /// Mean packet size
    pub fn mean_packet_size(&self) -> f64 {
        if self.packet_count == 0 {
            0.0
        } else {
            self.byte_total as f64 / self.packet_count as f64
        }
    }

    /// Packets per second over the flow lifetime (epsilon-floored)
    pub fn packet_rate(&self) -> f64 {
        self.packet_count as f64 / self.duration_secs().max(1e-6)
    }
}

/// Compact flow row for snapshots handed to the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub key: FlowKey,
    pub packet_count: u64,
    pub byte_total: u64,
    pub last_seen_ns: u64,
}
