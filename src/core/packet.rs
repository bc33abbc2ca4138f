//! Parsed packet summary
//!
//! Capture parses each frame into a `PacketSummary`: headers only, payload
//! bytes discarded. Flows retain a further-compacted per-packet record.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// IP protocol numbers used throughout the pipeline
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// TCP flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        if self.urg {
            flags |= 0x20;
        }
        if self.ece {
            flags |= 0x40;
        }
        if self.cwr {
            flags |= 0x80;
        }
        flags
    }

    pub fn is_syn_only(&self) -> bool {
        self.syn && !self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn {
            s.push('S');
        }
        if self.ack {
            s.push('A');
        }
        if self.fin {
            s.push('F');
        }
        if self.rst {
            s.push('R');
        }
        if self.psh {
            s.push('P');
        }
        if self.urg {
            s.push('U');
        }
        if self.ece {
            s.push('E');
        }
        if self.cwr {
            s.push('C');
        }
        if s.is_empty() {
            s.push('.');
        }
        write!(f, "{}", s)
    }
}

/// Application protocol recognized by well-known port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppProtocol {
    Http,
    Https,
    Dns,
    Telnet,
    Smtp,
    Ssh,
    Irc,
    Unknown,
}

impl AppProtocol {
    /// Classify by either endpoint port
    pub fn from_ports(src_port: u16, dst_port: u16) -> Self {
        for port in [dst_port, src_port] {
            match port {
                80 => return AppProtocol::Http,
                443 => return AppProtocol::Https,
                53 => return AppProtocol::Dns,
                23 => return AppProtocol::Telnet,
                25 => return AppProtocol::Smtp,
                22 => return AppProtocol::Ssh,
                194 => return AppProtocol::Irc,
                _ => {}
            }
        }
        AppProtocol::Unknown
    }
}

/// Parsed packet, headers only
#[derive(Debug, Clone)]
pub struct PacketSummary {
    /// Monotonic capture timestamp, nanoseconds since capture start
    pub mono_ns: u64,
    /// Wall-clock capture time, seconds since epoch
    pub wall: f64,

    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// IP protocol number (6=TCP, 17=UDP, 1=ICMP)
    pub protocol: u8,
    /// 0 for protocols without ports
    pub src_port: u16,
    pub dst_port: u16,

    pub tcp_flags: Option<TcpFlags>,

    /// Total frame length on the wire
    pub total_len: u32,
    /// Transport header length (TCP data offset * 4, 8 for UDP and ICMP)
    pub transport_header_len: u16,
    /// Bytes after the transport header
    pub payload_len: u32,

    /// IPv4 TTL (None for IPv6)
    pub ttl: Option<u8>,
    pub is_ipv4: bool,
}

impl PacketSummary {
    /// Application protocol heuristic for this packet
    pub fn app_protocol(&self) -> AppProtocol {
        AppProtocol::from_ports(self.src_port, self.dst_port)
    }

    /// DHCP heuristic: UDP to/from port 67 or 68
    pub fn is_dhcp(&self) -> bool {
        self.protocol == PROTO_UDP
            && (matches!(self.src_port, 67 | 68) || matches!(self.dst_port, 67 | 68))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn summary(protocol: u8, src_port: u16, dst_port: u16) -> PacketSummary {
        PacketSummary {
            mono_ns: 0,
            wall: 0.0,
            src_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            protocol,
            src_port,
            dst_port,
            tcp_flags: None,
            total_len: 60,
            transport_header_len: 20,
            payload_len: 0,
            ttl: Some(64),
            is_ipv4: true,
        }
    }

    #[test]
    fn test_tcp_flags_round_trip() {
        let flags = TcpFlags::from_u8(0x12); // SYN+ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert!(!flags.is_syn_only());
        assert_eq!(flags.to_u8(), 0x12);

        let all = TcpFlags::from_u8(0xff);
        assert_eq!(all.to_u8(), 0xff);
    }

    #[test]
    fn test_app_protocol_from_ports() {
        assert_eq!(AppProtocol::from_ports(54321, 443), AppProtocol::Https);
        assert_eq!(AppProtocol::from_ports(80, 54321), AppProtocol::Http);
        assert_eq!(AppProtocol::from_ports(54321, 53), AppProtocol::Dns);
        assert_eq!(AppProtocol::from_ports(1234, 4321), AppProtocol::Unknown);
        // Destination port wins when both are well-known
        assert_eq!(AppProtocol::from_ports(80, 22), AppProtocol::Ssh);
    }

    #[test]
    fn test_dhcp_heuristic() {
        assert!(summary(PROTO_UDP, 68, 67).is_dhcp());
        assert!(summary(PROTO_UDP, 54321, 67).is_dhcp());
        assert!(!summary(PROTO_TCP, 68, 67).is_dhcp());
        assert!(!summary(PROTO_UDP, 54321, 53).is_dhcp());
    }
}
