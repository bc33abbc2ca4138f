//! Packet capture sources
//!
//! Three sources feed the pipeline: a live pcap handle on a named
//! interface, an offline pcap file (the `replay` subcommand), and an
//! in-memory script used by tests. All of them yield parsed
//! `PacketSummary` values; payload bytes never leave this module.

pub mod parser;

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::Result;
use tracing::warn;

use crate::core::packet::PacketSummary;
use crate::error::StartupError;

/// One poll of a packet source
#[derive(Debug)]
pub enum Poll {
    /// A parsed packet
    Packet(PacketSummary),
    /// Nothing right now (read timeout); poll again
    Idle,
    /// The source is exhausted (file/replay) or closed
    Finished,
}

/// Capture counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    /// Frames received from the source
    pub received: u64,
    /// Frames dropped by the parser (malformed, truncated, non-IP)
    pub parse_dropped: u64,
}

/// A source of parsed packets
pub trait PacketSource: Send {
    fn poll_packet(&mut self) -> Result<Poll>;

    fn stats(&self) -> CaptureStats;

    fn close(&mut self) {}
}

/// Live promiscuous capture on a named interface
pub struct LiveCapture {
    cap: pcap::Capture<pcap::Active>,
    interface: String,
    stats: CaptureStats,
    base_wall: Option<f64>,
    last_drop_warn: Option<Instant>,
}

impl LiveCapture {
    /// Open the interface read-only in promiscuous mode.
    ///
    /// Classifies open failures: an unknown device name is
    /// `InterfaceNotFound`, an OS refusal is `CapturePrivilege`. Both are
    /// fatal and must propagate to the process exit code.
    pub fn open(interface: &str) -> Result<Self> {
        if let Ok(devices) = pcap::Device::list() {
            if !devices.iter().any(|d| d.name == interface) {
                return Err(StartupError::InterfaceNotFound {
                    interface: interface.to_string(),
                }
                .into());
            }
        }

        let inactive = pcap::Capture::from_device(interface).map_err(|e| {
            classify_open_error(&e, interface)
        })?;

        let cap = inactive
            .promisc(true)
            .snaplen(65_535)
            .timeout(100)
            .open()
            .map_err(|e| classify_open_error(&e, interface))?;

        Ok(Self {
            cap,
            interface: interface.to_string(),
            stats: CaptureStats::default(),
            base_wall: None,
            last_drop_warn: None,
        })
    }

    fn note_parse_drop(&mut self) {
        self.stats.parse_dropped += 1;
        let now = Instant::now();
        let should_warn = self
            .last_drop_warn
            .map(|t| now.duration_since(t).as_secs() >= 1)
            .unwrap_or(true);
        if should_warn {
            warn!(
                interface = %self.interface,
                dropped = self.stats.parse_dropped,
                "dropping unparseable frames"
            );
            self.last_drop_warn = Some(now);
        }
    }
}

impl PacketSource for LiveCapture {
    fn poll_packet(&mut self) -> Result<Poll> {
        match self.cap.next_packet() {
            Ok(frame) => {
                self.stats.received += 1;
                let wall =
                    frame.header.ts.tv_sec as f64 + frame.header.ts.tv_usec as f64 / 1e6;
                let base = *self.base_wall.get_or_insert(wall);
                let mono_ns = ((wall - base).max(0.0) * 1e9) as u64;

                match parser::parse_frame(frame.data, mono_ns, wall) {
                    Some(pkt) => Ok(Poll::Packet(pkt)),
                    None => {
                        self.note_parse_drop();
                        Ok(Poll::Idle)
                    }
                }
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Poll::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(Poll::Finished),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

fn classify_open_error(err: &pcap::Error, interface: &str) -> anyhow::Error {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission") || msg.contains("not permitted") {
        StartupError::CapturePrivilege {
            interface: interface.to_string(),
        }
        .into()
    } else if msg.contains("no such device") {
        StartupError::InterfaceNotFound {
            interface: interface.to_string(),
        }
        .into()
    } else {
        anyhow::anyhow!("failed to open capture on {interface}: {err}")
    }
}

/// Offline capture from a pcap file
pub struct FileCapture {
    cap: pcap::Capture<pcap::Offline>,
    stats: CaptureStats,
    base_wall: Option<f64>,
}

impl FileCapture {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let cap = pcap::Capture::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to open pcap file {}: {e}", path.display()))?;
        Ok(Self {
            cap,
            stats: CaptureStats::default(),
            base_wall: None,
        })
    }
}

impl PacketSource for FileCapture {
    fn poll_packet(&mut self) -> Result<Poll> {
        match self.cap.next_packet() {
            Ok(frame) => {
                self.stats.received += 1;
                let wall =
                    frame.header.ts.tv_sec as f64 + frame.header.ts.tv_usec as f64 / 1e6;
                let base = *self.base_wall.get_or_insert(wall);
                let mono_ns = ((wall - base).max(0.0) * 1e9) as u64;

                match parser::parse_frame(frame.data, mono_ns, wall) {
                    Some(pkt) => Ok(Poll::Packet(pkt)),
                    None => {
                        self.stats.parse_dropped += 1;
                        Ok(Poll::Idle)
                    }
                }
            }
            Err(pcap::Error::NoMorePackets) => Ok(Poll::Finished),
            Err(pcap::Error::TimeoutExpired) => Ok(Poll::Idle),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

/// Scripted in-memory source for tests and demos
pub struct ReplaySource {
    queue: VecDeque<PacketSummary>,
    stats: CaptureStats,
}

impl ReplaySource {
    pub fn new(packets: Vec<PacketSummary>) -> Self {
        Self {
            queue: packets.into(),
            stats: CaptureStats::default(),
        }
    }
}

impl PacketSource for ReplaySource {
    fn poll_packet(&mut self) -> Result<Poll> {
        match self.queue.pop_front() {
            Some(pkt) => {
                self.stats.received += 1;
                Ok(Poll::Packet(pkt))
            }
            None => Ok(Poll::Finished),
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}
