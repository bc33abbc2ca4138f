//! Flow feature extraction
//!
//! Produces the 37-dimensional vector the frozen models were trained on.
//! Column order is load-bearing: the scaler and both models consume the
//! vector positionally, so the order here never changes. When the model
//! directory ships a `feature_info.json`, startup cross-checks it against
//! this list and refuses to run on mismatch.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::core::flow::FlowSnapshot;
use crate::core::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::error::StartupError;

/// Number of model input features
pub const NUM_FEATURES: usize = 37;

/// Canonical feature names, in model input order
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "flow_duration",
    "Header_Length",
    "Protocol Type",
    "Duration",
    "Rate",
    "Drate",
    "fin_flag_number",
    "syn_flag_number",
    "psh_flag_number",
    "ack_flag_number",
    "ece_flag_number",
    "cwr_flag_number",
    "syn_count",
    "fin_count",
    "urg_count",
    "rst_count",
    "HTTP",
    "HTTPS",
    "DNS",
    "Telnet",
    "SMTP",
    "SSH",
    "IRC",
    "TCP",
    "UDP",
    "DHCP",
    "ARP",
    "ICMP",
    "IPv",
    "Tot sum",
    "Min",
    "Max",
    "AVG",
    "Tot size",
    "IAT",
    "Covariance",
    "Variance",
];

/// Duration floor for rate features
const EPSILON: f64 = 1e-6;

/// An extracted 37-feature vector, always finite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    #[serde(with = "BigArray")]
    pub values: [f64; NUM_FEATURES],
}

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Look up a feature by canonical name
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|&n| n == name)
            .map(|idx| self.values[idx])
    }
}

/// Extract the canonical feature vector from a flow snapshot.
///
/// Pure function of the snapshot; the same snapshot always yields a
/// bit-identical vector.
pub fn extract(snap: &FlowSnapshot) -> FeatureVector {
    let duration = snap.duration_secs();
    let packet_count = snap.packet_count as f64;

    let header_length: f64 = snap
        .records
        .iter()
        .map(|r| r.header_len as u64)
        .sum::<u64>() as f64;

    let protocol_type = match snap.key.protocol {
        PROTO_TCP | PROTO_UDP | PROTO_ICMP => snap.key.protocol as f64,
        _ => 0.0,
    };

    let ttl_surrogate = snap.min_ttl.map(|t| t as f64).unwrap_or(0.0);

    let rate = packet_count / duration.max(EPSILON);
    let drate = snap.dst_packets as f64 / duration.max(EPSILON);

    let fc = &snap.flag_counts;
    let indicator = |count: u64| if count > 0 { 1.0 } else { 0.0 };
    let seen = |flag: bool| if flag { 1.0 } else { 0.0 };

    let sizes: Vec<f64> = snap.records.iter().map(|r| r.size as f64).collect();
    let min_size = sizes.iter().copied().fold(f64::INFINITY, f64::min);
    let max_size = sizes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_size = if sizes.is_empty() { 0.0 } else { min_size };
    let max_size = if sizes.is_empty() { 0.0 } else { max_size };
    let avg_size = if sizes.is_empty() {
        0.0
    } else {
        sizes.iter().sum::<f64>() / sizes.len() as f64
    };

    // Adjacent inter-arrival samples: iat[i] pairs with the size of the
    // packet that ended the gap.
    let (iat_mean, covariance) = if snap.records.len() >= 2 {
        let mut iats = Vec::with_capacity(snap.records.len() - 1);
        for w in snap.records.windows(2) {
            iats.push(w[1].mono_ns.saturating_sub(w[0].mono_ns) as f64 / 1e9);
        }
        let iat_mean = iats.iter().sum::<f64>() / iats.len() as f64;

        let paired_sizes: Vec<f64> = snap.records[1..].iter().map(|r| r.size as f64).collect();
        let size_mean = paired_sizes.iter().sum::<f64>() / paired_sizes.len() as f64;
        let cov = paired_sizes
            .iter()
            .zip(iats.iter())
            .map(|(s, t)| (s - size_mean) * (t - iat_mean))
            .sum::<f64>()
            / iats.len() as f64;

        (iat_mean, cov)
    } else {
        (0.0, 0.0)
    };

    let variance = if sizes.len() >= 2 {
        sizes.iter().map(|s| (s - avg_size) * (s - avg_size)).sum::<f64>() / sizes.len() as f64
    } else {
        0.0
    };

    let mut values = [
        duration,
        header_length,
        protocol_type,
        ttl_surrogate,
        rate,
        drate,
        indicator(fc.fin),
        indicator(fc.syn),
        indicator(fc.psh),
        indicator(fc.ack),
        indicator(fc.ece),
        indicator(fc.cwr),
        fc.syn as f64,
        fc.fin as f64,
        fc.urg as f64,
        fc.rst as f64,
        seen(snap.seen.http),
        seen(snap.seen.https),
        seen(snap.seen.dns),
        seen(snap.seen.telnet),
        seen(snap.seen.smtp),
        seen(snap.seen.ssh),
        seen(snap.seen.irc),
        seen(snap.seen.tcp),
        seen(snap.seen.udp),
        seen(snap.seen.dhcp),
        seen(snap.seen.arp),
        seen(snap.seen.icmp),
        seen(snap.seen.ipv4),
        snap.byte_total as f64,
        min_size,
        max_size,
        avg_size,
        snap.payload_total as f64,
        iat_mean,
        covariance,
        variance,
    ];

    // The models only accept finite input
    for v in values.iter_mut() {
        if !v.is_finite() {
            *v = 0.0;
        }
    }

    FeatureVector { values }
}

#[derive(Debug, Deserialize)]
struct FeatureInfo {
    feature_names: Vec<String>,
}

/// Cross-check a `feature_info.json` shipped with the models against the
/// canonical feature list. A missing file is fine; a mismatch is fatal.
pub fn verify_feature_info(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let content = std::fs::read_to_string(path).map_err(|e| StartupError::ModelArtifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let info: FeatureInfo =
        serde_json::from_str(&content).map_err(|e| StartupError::ModelArtifact {
            path: path.to_path_buf(),
            reason: format!("invalid feature_info: {e}"),
        })?;

    let expected: Vec<&str> = FEATURE_NAMES.to_vec();
    if info.feature_names != expected {
        return Err(StartupError::ModelArtifact {
            path: path.to_path_buf(),
            reason: format!(
                "feature list mismatch: artifact has {} features, this build expects {}",
                info.feature_names.len(),
                NUM_FEATURES
            ),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow::Flow;
    use crate::core::packet::TcpFlags;
    use crate::testutil::{packet, tcp_packet};

    fn https_flow() -> FlowSnapshot {
        let mut pkt = tcp_packet(
            "192.168.1.10",
            54321,
            "140.82.113.26",
            443,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            0,
        );
        pkt.total_len = 74;
        let mut flow = Flow::new(&pkt);

        for i in 1..20u64 {
            let mut p = tcp_packet(
                "192.168.1.10",
                54321,
                "140.82.113.26",
                443,
                TcpFlags {
                    ack: true,
                    psh: i % 4 == 0,
                    ..Default::default()
                },
                i * 10_000_000,
            );
            p.total_len = 100 + (i as u32 % 7) * 50;
            p.payload_len = p.total_len - 54;
            flow.update(&p);
        }
        flow.snapshot()
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let snap = https_flow();
        let a = extract(&snap);
        let b = extract(&snap);
        // Bit-identical, not approximately equal
        for (x, y) in a.values.iter().zip(b.values.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_all_values_finite() {
        let snap = https_flow();
        let v = extract(&snap);
        assert!(v.values.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_canonical_order_spot_checks() {
        assert_eq!(FEATURE_NAMES[0], "flow_duration");
        assert_eq!(FEATURE_NAMES[2], "Protocol Type");
        assert_eq!(FEATURE_NAMES[16], "HTTP");
        assert_eq!(FEATURE_NAMES[29], "Tot sum");
        assert_eq!(FEATURE_NAMES[34], "IAT");
        assert_eq!(FEATURE_NAMES[36], "Variance");
        assert_eq!(FEATURE_NAMES.len(), NUM_FEATURES);
    }

    #[test]
    fn test_https_indicators_and_counts() {
        let snap = https_flow();
        let v = extract(&snap);

        assert_eq!(v.get("HTTPS"), Some(1.0));
        assert_eq!(v.get("HTTP"), Some(0.0));
        assert_eq!(v.get("TCP"), Some(1.0));
        assert_eq!(v.get("UDP"), Some(0.0));
        assert_eq!(v.get("IPv"), Some(1.0));
        assert_eq!(v.get("Protocol Type"), Some(6.0));
        assert_eq!(v.get("syn_flag_number"), Some(1.0));
        assert_eq!(v.get("syn_count"), Some(1.0));
        assert!(v.get("ack_flag_number") == Some(1.0));
    }

    #[test]
    fn test_single_packet_flow_edge_cases() {
        let pkt = packet("10.0.0.1", 1234, "10.0.0.2", 4321, crate::core::packet::PROTO_UDP, 0);
        let flow = Flow::new(&pkt);
        let v = extract(&flow.snapshot());

        assert_eq!(v.get("flow_duration"), Some(0.0));
        // Rate uses the epsilon floor
        assert_eq!(v.get("Rate"), Some(1.0 / EPSILON));
        assert_eq!(v.get("IAT"), Some(0.0));
        assert_eq!(v.get("Covariance"), Some(0.0));
        assert_eq!(v.get("Variance"), Some(0.0));
        assert_eq!(v.get("Min"), v.get("Max"));
    }

    #[test]
    fn test_header_length_is_sum() {
        let snap = https_flow();
        let v = extract(&snap);
        let expected: f64 = snap.records.iter().map(|r| r.header_len as f64).sum();
        assert_eq!(v.get("Header_Length"), Some(expected));
    }

    #[test]
    fn test_duration_is_min_ttl() {
        let mut pkt = packet("10.0.0.1", 1, "10.0.0.2", 2, crate::core::packet::PROTO_UDP, 0);
        pkt.ttl = Some(64);
        let mut flow = Flow::new(&pkt);
        pkt.ttl = Some(48);
        pkt.mono_ns = 1_000;
        flow.update(&pkt);

        let v = extract(&flow.snapshot());
        assert_eq!(v.get("Duration"), Some(48.0));
    }

    #[test]
    fn test_feature_info_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature_info.json");

        // Missing file is accepted
        verify_feature_info(&path).unwrap();

        std::fs::write(
            &path,
            serde_json::json!({ "feature_names": FEATURE_NAMES.to_vec() }).to_string(),
        )
        .unwrap();
        verify_feature_info(&path).unwrap();

        std::fs::write(
            &path,
            serde_json::json!({ "feature_names": ["flow_duration", "Rate"] }).to_string(),
        )
        .unwrap();
        let err = verify_feature_info(&path).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 65);
    }
}
