//! Core data model: parsed packet summaries and bidirectional flows.

pub mod flow;
pub mod packet;

pub use flow::{Flow, FlowKey, FlowSnapshot, FlowSummary, PacketRecord};
pub use packet::{AppProtocol, PacketSummary, TcpFlags, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
