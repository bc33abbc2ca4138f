//! False-positive suppression cascade
//!
//! Consumes (flow snapshot, prediction) and decides emit or suppress. The
//! seven layers run in order and short-circuit on the first suppression.
//! In `pure_ml` mode only layer 1 (threat class) applies. Every
//! suppression lands in a bounded newest-wins ring for threshold tuning.

pub mod baseline;

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::config::{DetectionConfig, DetectionMode};
use crate::core::flow::{FlowKey, FlowSnapshot};
use crate::model::Prediction;

pub use baseline::AdaptiveBaseline;

/// Why a flow was not alerted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    NotAThreat,
    LowConfidence,
    InsufficientTraffic,
    CloudTraffic,
    WhitelistedIp,
    PrivateNetwork,
    LegitimateLowVolume,
    BaselineMatch,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::NotAThreat => "not_a_threat",
            SuppressReason::LowConfidence => "low_confidence",
            SuppressReason::InsufficientTraffic => "insufficient_traffic",
            SuppressReason::CloudTraffic => "cloud_traffic",
            SuppressReason::WhitelistedIp => "whitelisted_ip",
            SuppressReason::PrivateNetwork => "private_network",
            SuppressReason::LegitimateLowVolume => "legitimate_low_volume",
            SuppressReason::BaselineMatch => "baseline_match",
        }
    }
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cascade outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Emit,
    Suppress(SuppressReason),
}

impl Verdict {
    pub fn is_emit(&self) -> bool {
        matches!(self, Verdict::Emit)
    }
}

/// One suppressed detection, kept for tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionRecord {
    pub reason: SuppressReason,
    pub key: FlowKey,
    pub label: String,
    pub confidence: f64,
    pub packet_count: u64,
}

/// Bounded newest-wins ring of suppression records
#[derive(Debug)]
pub struct SuppressionRing {
    buf: VecDeque<SuppressionRecord>,
    capacity: usize,
}

impl SuppressionRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, record: SuppressionRecord) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(record);
    }

    pub fn records(&self) -> impl Iterator<Item = &SuppressionRecord> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// The 7-layer filter cascade
pub struct FilterCascade {
    mode: DetectionMode,
    confidence_threshold: f64,
    min_packet_threshold: u64,
    filter_localhost: bool,
    filter_private_networks: bool,
    whitelist_ports: HashSet<u16>,
    whitelist_networks: Vec<IpNetwork>,
    cloud_prefixes: Vec<String>,
    ignored_labels: HashSet<String>,
    legitimate_port_packet_threshold: u64,
    baseline: AdaptiveBaseline,
    ring: SuppressionRing,
}

impl FilterCascade {
    pub fn new(
        config: &DetectionConfig,
        whitelist_networks: Vec<IpNetwork>,
        baseline: AdaptiveBaseline,
    ) -> Self {
        Self {
            mode: config.mode,
            confidence_threshold: config.confidence_threshold,
            min_packet_threshold: config.min_packet_threshold,
            filter_localhost: config.filter_localhost,
            filter_private_networks: config.filter_private_networks,
            whitelist_ports: config.whitelist_ports.iter().copied().collect(),
            whitelist_networks,
            cloud_prefixes: config.cloud_prefixes.clone(),
            ignored_labels: config.ignored_attack_types.iter().cloned().collect(),
            legitimate_port_packet_threshold: config.legitimate_port_packet_threshold,
            baseline,
            ring: SuppressionRing::new(512),
        }
    }

    pub fn baseline(&self) -> &AdaptiveBaseline {
        &self.baseline
    }

    pub fn baseline_mut(&mut self) -> &mut AdaptiveBaseline {
        &mut self.baseline
    }

    pub fn ring(&self) -> &SuppressionRing {
        &self.ring
    }

    /// Run the cascade. Also feeds the adaptive baseline while it learns.
    pub fn evaluate(&mut self, snap: &FlowSnapshot, pred: &Prediction) -> Verdict {
        // Learning happens for every snapshot that reaches the suppressor,
        // before any layer can short-circuit it away.
        self.baseline.observe(snap);

        let verdict = self.evaluate_layers(snap, pred);
        if let Verdict::Suppress(reason) = verdict {
            self.ring.push(SuppressionRecord {
                reason,
                key: snap.key.clone(),
                label: pred.label.clone(),
                confidence: pred.confidence,
                packet_count: snap.packet_count,
            });
        }
        verdict
    }

    fn evaluate_layers(&self, snap: &FlowSnapshot, pred: &Prediction) -> Verdict {
        // Layer 1: threat class
        if pred.is_benign() || self.ignored_labels.contains(&pred.label) {
            return Verdict::Suppress(SuppressReason::NotAThreat);
        }

        if self.mode == DetectionMode::PureMl {
            return Verdict::Emit;
        }

        // Layer 2: confidence (equal to the threshold passes)
        if pred.confidence < self.confidence_threshold {
            return Verdict::Suppress(SuppressReason::LowConfidence);
        }

        // Layer 3: packet volume
        if snap.packet_count < self.min_packet_threshold {
            return Verdict::Suppress(SuppressReason::InsufficientTraffic);
        }

        // Layer 4: cloud-provider prefixes, both endpoints
        let src = snap.key.src_ip.to_string();
        let dst = snap.key.dst_ip.to_string();
        if self
            .cloud_prefixes
            .iter()
            .any(|p| src.starts_with(p.as_str()) || dst.starts_with(p.as_str()))
        {
            return Verdict::Suppress(SuppressReason::CloudTraffic);
        }

        // Layer 4.5: explicit CIDR whitelist
        if self
            .whitelist_networks
            .iter()
            .any(|net| net.contains(snap.key.src_ip) || net.contains(snap.key.dst_ip))
        {
            return Verdict::Suppress(SuppressReason::WhitelistedIp);
        }

        // Layer 5: private-network filter
        if self.filter_localhost
            && (snap.key.src_ip.is_loopback() || snap.key.dst_ip.is_loopback())
        {
            return Verdict::Suppress(SuppressReason::PrivateNetwork);
        }
        if self.filter_private_networks
            && is_private(&snap.key.src_ip)
            && is_private(&snap.key.dst_ip)
        {
            return Verdict::Suppress(SuppressReason::PrivateNetwork);
        }

        // Layer 6: legitimate port with low volume
        if self.whitelist_ports.contains(&snap.key.dst_port)
            && snap.packet_count < self.legitimate_port_packet_threshold
        {
            return Verdict::Suppress(SuppressReason::LegitimateLowVolume);
        }

        // Layer 7: adaptive baseline (inactive while learning)
        if self.baseline.matches(snap) {
            return Verdict::Suppress(SuppressReason::BaselineMatch);
        }

        Verdict::Emit
    }
}

/// RFC1918, link-local, loopback, multicast and their IPv6 equivalents
fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || v6.is_multicast()
                || (seg0 & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (seg0 & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaselineConfig;
    use crate::core::flow::Flow;
    use crate::core::packet::PROTO_TCP;
    use crate::model::{severity_for, ModelVote, Prediction, METHOD_CONSENSUS};
    use crate::testutil::packet;

    fn prediction(label: &str, confidence: f64) -> Prediction {
        Prediction {
            label: label.to_string(),
            severity: severity_for(label),
            confidence,
            method: METHOD_CONSENSUS.to_string(),
            tree: ModelVote {
                label: label.to_string(),
                confidence,
            },
            nn: ModelVote {
                label: label.to_string(),
                confidence,
            },
        }
    }

    fn flow_snapshot(src: &str, dst: &str, dst_port: u16, packets: u64) -> FlowSnapshot {
        let mut flow = Flow::new(&packet(src, 40000, dst, dst_port, PROTO_TCP, 0));
        for i in 1..packets {
            flow.update(&packet(src, 40000, dst, dst_port, PROTO_TCP, i * 1_000_000));
        }
        flow.snapshot()
    }

    fn baseline_off(dir: &std::path::Path) -> AdaptiveBaseline {
        AdaptiveBaseline::load(BaselineConfig {
            enabled: false,
            learning_period: 0,
            baseline_min_occurrences: 3,
            path: dir.join("baseline.json"),
        })
    }

    fn cascade(config: DetectionConfig) -> (FilterCascade, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let networks = config
            .whitelist_ips
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect();
        let baseline = baseline_off(dir.path());
        (FilterCascade::new(&config, networks, baseline), dir)
    }

    fn open_config() -> DetectionConfig {
        // No private-network filtering so layer outcomes are isolated
        DetectionConfig {
            filter_private_networks: false,
            filter_localhost: false,
            cloud_prefixes: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_benign_suppressed_as_not_a_threat() {
        let (mut c, _d) = cascade(open_config());
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 8080, 500);
        let verdict = c.evaluate(&snap, &prediction("BenignTraffic", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::NotAThreat));
    }

    #[test]
    fn test_ignored_label_suppressed() {
        let mut config = open_config();
        config.ignored_attack_types = vec!["DoS-TCP_Flood".into()];
        let (mut c, _d) = cascade(config);
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 8080, 500);
        let verdict = c.evaluate(&snap, &prediction("DoS-TCP_Flood", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::NotAThreat));
    }

    #[test]
    fn test_confidence_boundary_passes_at_threshold() {
        let (mut c, _d) = cascade(open_config());
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 8080, 500);

        // Exactly the threshold passes layer 2
        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.95));
        assert_eq!(verdict, Verdict::Emit);

        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.9499));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::LowConfidence));
    }

    #[test]
    fn test_packet_count_boundary() {
        let (mut c, _d) = cascade(open_config());

        // min_packet_threshold - 1 with high confidence must suppress
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 8080, 199);
        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::InsufficientTraffic));

        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 8080, 200);
        assert_eq!(c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99)), Verdict::Emit);
    }

    #[test]
    fn test_cloud_prefix_suppression() {
        let mut config = open_config();
        config.cloud_prefixes = vec!["140.82.".into()];
        let (mut c, _d) = cascade(config);

        let snap = flow_snapshot("10.0.0.50", "140.82.113.26", 8443, 500);
        let verdict = c.evaluate(&snap, &prediction("DDoS-RSTFINFlood", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::CloudTraffic));
    }

    #[test]
    fn test_whitelist_cidr_first_address() {
        let mut config = open_config();
        config.whitelist_ips = vec!["203.0.113.0/24".into()];
        let (mut c, _d) = cascade(config);

        // The network address itself is whitelisted
        let snap = flow_snapshot("10.0.0.50", "203.0.113.0", 8080, 500);
        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::WhitelistedIp));
    }

    #[test]
    fn test_private_network_filter() {
        let mut config = open_config();
        config.filter_private_networks = true;
        let (mut c, _d) = cascade(config);

        let snap = flow_snapshot("192.168.1.10", "192.168.1.20", 8080, 500);
        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::PrivateNetwork));

        // One public endpoint passes
        let snap = flow_snapshot("192.168.1.10", "198.51.100.7", 8080, 500);
        assert_eq!(c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99)), Verdict::Emit);
    }

    #[test]
    fn test_legitimate_port_low_volume() {
        let (mut c, _d) = cascade(open_config());

        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 443, 300);
        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99));
        assert_eq!(
            verdict,
            Verdict::Suppress(SuppressReason::LegitimateLowVolume)
        );

        // At the volume threshold the layer passes
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 443, 500);
        assert_eq!(c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99)), Verdict::Emit);
    }

    #[test]
    fn test_pure_ml_mode_applies_only_layer_one() {
        let mut config = open_config();
        config.mode = DetectionMode::PureMl;
        let (mut c, _d) = cascade(config);

        // Low confidence, tiny flow, whitelisted port: all ignored in pure_ml
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 443, 3);
        assert_eq!(c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.10)), Verdict::Emit);

        let verdict = c.evaluate(&snap, &prediction("BenignTraffic", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::NotAThreat));
    }

    #[test]
    fn test_baseline_match_suppresses_after_learning() {
        let dir = tempfile::tempdir().unwrap();
        let learn_config = BaselineConfig {
            enabled: true,
            learning_period: 3600,
            baseline_min_occurrences: 3,
            path: dir.path().join("baseline.json"),
        };

        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 9999, 500);

        // Learn the fingerprint three times
        let mut learning = AdaptiveBaseline::load(learn_config.clone());
        for _ in 0..3 {
            learning.observe(&snap);
        }
        learning.save().unwrap();

        // Reload in post-learning state
        let post = AdaptiveBaseline::load(BaselineConfig {
            learning_period: 0,
            ..learn_config
        });
        let mut c = FilterCascade::new(&open_config(), Vec::new(), post);

        let verdict = c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.99));
        assert_eq!(verdict, Verdict::Suppress(SuppressReason::BaselineMatch));

        // A novel fingerprint still emits
        let novel = flow_snapshot("10.0.0.51", "10.0.0.100", 12345, 400);
        assert_eq!(c.evaluate(&novel, &prediction("DDoS-SYN_Flood", 0.99)), Verdict::Emit);
    }

    #[test]
    fn test_suppressions_recorded_in_ring() {
        let (mut c, _d) = cascade(open_config());
        let snap = flow_snapshot("10.0.0.50", "10.0.0.100", 8080, 500);

        c.evaluate(&snap, &prediction("BenignTraffic", 0.99));
        c.evaluate(&snap, &prediction("DDoS-SYN_Flood", 0.10));

        assert_eq!(c.ring().len(), 2);
        let reasons: Vec<SuppressReason> = c.ring().records().map(|r| r.reason).collect();
        assert_eq!(
            reasons,
            vec![SuppressReason::NotAThreat, SuppressReason::LowConfidence]
        );
    }

    #[test]
    fn test_ring_is_bounded_newest_wins() {
        let mut ring = SuppressionRing::new(2);
        for i in 0..5u64 {
            ring.push(SuppressionRecord {
                reason: SuppressReason::NotAThreat,
                key: FlowKey::from_packet(&packet("10.0.0.1", 1, "10.0.0.2", 2, PROTO_TCP, 0)),
                label: format!("label-{i}"),
                confidence: 0.5,
                packet_count: i,
            });
        }
        assert_eq!(ring.len(), 2);
        let labels: Vec<&str> = ring.records().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["label-3", "label-4"]);
    }

    #[test]
    fn test_private_detection() {
        assert!(is_private(&"192.168.1.1".parse().unwrap()));
        assert!(is_private(&"10.255.0.1".parse().unwrap()));
        assert!(is_private(&"172.16.0.1".parse().unwrap()));
        assert!(is_private(&"127.0.0.1".parse().unwrap()));
        assert!(is_private(&"169.254.0.5".parse().unwrap()));
        assert!(is_private(&"224.0.0.1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private(&"198.51.100.1".parse().unwrap()));
        assert!(is_private(&"fe80::1".parse().unwrap()));
        assert!(is_private(&"fd00::1".parse().unwrap()));
        assert!(is_private(&"::1".parse().unwrap()));
        assert!(!is_private(&"2001:4860:4860::8888".parse().unwrap()));
    }
}
