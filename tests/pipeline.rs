//! End-to-end pipeline scenarios driven by scripted captures.
//!
//! Synthetic model artifacts are written to a tempdir: a decision stump
//! keyed on the flow's SYN count and a single-layer network mirroring it,
//! so SYN floods classify as DDoS-SYN_Flood with consensus confidence and
//! everything else as benign.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowsentry::capture::ReplaySource;
use flowsentry::config::Config;
use flowsentry::core::packet::{PacketSummary, TcpFlags};
use flowsentry::engine::Engine;
use flowsentry::features::NUM_FEATURES;
use flowsentry::model::forest::{Tree, TreeForest, TreeNode};
use flowsentry::model::network::{Activation, DenseLayer, FeedForward};
use flowsentry::model::{ModelEnsemble, StandardScaler};
use flowsentry::testutil::{syn_flood, tcp_packet};

/// Canonical 34-label alphabet, in training order
const LABELS: [&str; 34] = [
    "BenignTraffic",
    "DDoS-ACK_Fragmentation",
    "DDoS-HTTP_Flood",
    "DDoS-ICMP_Flood",
    "DDoS-ICMP_Fragmentation",
    "DDoS-PSHACK_Flood",
    "DDoS-RSTFINFlood",
    "DDoS-SYN_Flood",
    "DDoS-SlowLoris",
    "DDoS-SynonymousIP_Flood",
    "DDoS-TCP_Flood",
    "DDoS-UDP_Flood",
    "DDoS-UDP_Fragmentation",
    "DoS-HTTP_Flood",
    "DoS-SYN_Flood",
    "DoS-TCP_Flood",
    "DoS-UDP_Flood",
    "Recon-HostDiscovery",
    "Recon-OSScan",
    "Recon-PingSweep",
    "Recon-PortScan",
    "Mirai-greeth_flood",
    "Mirai-greip_flood",
    "Mirai-udpplain",
    "SqlInjection",
    "XSS",
    "CommandInjection",
    "MITM-ArpSpoofing",
    "DNS_Spoofing",
    "DictionaryBruteForce",
    "Backdoor_Malware",
    "BrowserHijacking",
    "VulnerabilityScan",
    "Uploading_Attack",
];

const SYN_FLOOD_IDX: usize = 7;
const SYN_COUNT_FEATURE: usize = 12;

/// Write scaler/forest/network/class-mapping artifacts into `dir`.
fn write_artifacts(dir: &Path) {
    let scaler = StandardScaler::identity();
    std::fs::write(
        dir.join("scaler.json"),
        serde_json::to_string(&scaler).unwrap(),
    )
    .unwrap();

    let mut benign_leaf = vec![0.0; LABELS.len()];
    benign_leaf[0] = 1.0;
    let mut flood_leaf = vec![0.0; LABELS.len()];
    flood_leaf[SYN_FLOOD_IDX] = 1.0;
    let forest = TreeForest {
        n_classes: LABELS.len(),
        trees: vec![Tree {
            nodes: vec![
                TreeNode::Split {
                    feature: SYN_COUNT_FEATURE,
                    threshold: 100.0,
                    left: 1,
                    right: 2,
                },
                TreeNode::Leaf { probs: benign_leaf },
                TreeNode::Leaf { probs: flood_leaf },
            ],
        }],
        calibration: None,
    };
    std::fs::write(
        dir.join("forest.json"),
        serde_json::to_string(&forest).unwrap(),
    )
    .unwrap();

    // Single softmax layer: benign unless syn_count is large
    let mut weights = vec![vec![0.0; NUM_FEATURES]; LABELS.len()];
    let mut bias = vec![-1000.0; LABELS.len()];
    bias[0] = 0.0;
    weights[SYN_FLOOD_IDX][SYN_COUNT_FEATURE] = 0.5;
    bias[SYN_FLOOD_IDX] = -60.0;
    let network = FeedForward {
        layers: vec![DenseLayer {
            weights,
            bias,
            activation: Activation::Softmax,
        }],
    };
    std::fs::write(
        dir.join("ffnn.json"),
        serde_json::to_string(&network).unwrap(),
    )
    .unwrap();

    let mapping: serde_json::Map<String, serde_json::Value> = LABELS
        .iter()
        .enumerate()
        .map(|(i, l)| (i.to_string(), serde_json::Value::String(l.to_string())))
        .collect();
    std::fs::write(
        dir.join("class_mapping.json"),
        serde_json::to_string(&mapping).unwrap(),
    )
    .unwrap();
}

/// Config rooted entirely inside `dir`
fn test_config(dir: &Path) -> Config {
    let raw = format!(
        r#"
        [network]
        interface = "test0"

        [models]
        ml_path = "{d}/forest.json"
        dl_path = "{d}/ffnn.json"
        scaler_path = "{d}/scaler.json"
        class_mapping_path = "{d}/class_mapping.json"

        [detection.adaptive_baseline]
        enabled = true
        learning_period = 3600
        path = "{d}/baseline.json"

        [database]
        directory = "{d}/db"

        [alerts]
        log_path = "{d}/alerts.jsonl"

        [statistics]
        snapshot_path = "{d}/statistics.json"
        "#,
        d = dir.display()
    );
    let config: Config = toml::from_str(&raw).unwrap();
    config.validate().unwrap();
    config
}

async fn run_replay(config: Config, packets: Vec<PacketSummary>) -> Engine {
    let ensemble = Arc::new(ModelEnsemble::load(&config.models).unwrap());
    let source = ReplaySource::new(packets);
    let mut engine = Engine::start(config, ensemble, Box::new(source))
        .await
        .unwrap();
    engine.done().await;
    // Let the flow writer drain its shutdown flush
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine
}

/// 300-packet HTTPS browsing flow to a cloud provider
fn benign_https(start_ns: u64) -> Vec<PacketSummary> {
    let mut packets = Vec::new();
    packets.push(tcp_packet(
        "192.168.1.10",
        54321,
        "140.82.113.26",
        443,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        start_ns,
    ));
    for i in 1..300u64 {
        let flags = if i % 3 == 0 {
            TcpFlags {
                psh: true,
                ack: true,
                ..Default::default()
            }
        } else {
            TcpFlags {
                ack: true,
                ..Default::default()
            }
        };
        let (src, sport, dst, dport) = if i % 2 == 0 {
            ("192.168.1.10", 54321, "140.82.113.26", 443)
        } else {
            ("140.82.113.26", 443, "192.168.1.10", 54321)
        };
        let mut pkt = tcp_packet(src, sport, dst, dport, flags, start_ns + i * 10_000_000);
        pkt.total_len = 120 + (i as u32 % 5) * 100;
        pkt.payload_len = pkt.total_len - 54;
        packets.push(pkt);
    }
    packets
}

#[tokio::test]
async fn scenario_benign_https_browsing() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = test_config(dir.path());

    let engine = run_replay(config, benign_https(0)).await;
    let query = engine.query();

    // Zero alerts
    let alerts = query.list_alerts(&Default::default());
    assert!(alerts.is_empty(), "expected no alerts, got {alerts:?}");

    // One persisted record, benign, not emitted
    let flows = query.recent_flows(10).unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].predicted_label, "BenignTraffic");
    assert!(!flows[0].emitted);
}

fn flood_config(dir: &Path) -> Config {
    let mut config = test_config(dir);
    config.detection.filter_private_networks = false;
    config
}

#[tokio::test]
async fn scenario_syn_flood_alerts_once() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = flood_config(dir.path());

    let packets = syn_flood("10.0.0.50", "10.0.0.100", 80, 1000, 500.0, 0);
    let engine = run_replay(config, packets).await;
    let query = engine.query();

    let alerts = query.list_alerts(&Default::default());
    assert_eq!(alerts.len(), 1, "expected exactly one alert");

    let alert = &alerts[0];
    assert_eq!(alert.id, 1);
    assert!(
        alert.threat == "DDoS-SYN_Flood" || alert.threat == "DoS-SYN_Flood",
        "unexpected threat {}",
        alert.threat
    );
    assert_eq!(alert.severity, flowsentry::model::Severity::Medium);
    assert!(alert.confidence >= 0.95);
    assert_eq!(alert.status, flowsentry::alert::AlertStatus::New);
    assert_eq!(alert.src_ip.to_string(), "10.0.0.50");

    // Statistics counted it
    let stats = query.statistics("hour").unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.top_threats[0].0, alert.threat);
}

#[tokio::test]
async fn scenario_deduplication_back_to_back() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = flood_config(dir.path());

    // The same flood replayed twice within the dedupe window
    let mut packets = syn_flood("10.0.0.50", "10.0.0.100", 80, 1000, 500.0, 0);
    packets.extend(syn_flood("10.0.0.50", "10.0.0.100", 80, 1000, 500.0, 2_100_000_000));

    let engine = run_replay(config, packets).await;
    let query = engine.query();

    let alerts = query.list_alerts(&Default::default());
    assert_eq!(alerts.len(), 1, "dedupe failed: {alerts:?}");
    assert_eq!(alerts[0].id, 1);
    assert!(alerts[0].last_updated > alerts[0].timestamp);
    assert!(alerts[0].packet_count > 1000);
}

#[tokio::test]
async fn scenario_adaptive_baseline_learning() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());

    // Phase A: learn three same-shaped benign flows to port 9999
    let mut learn_packets = Vec::new();
    for (i, src) in ["172.20.0.11", "172.20.0.12", "172.20.0.13"].iter().enumerate() {
        let start = i as u64 * 1_000_000_000;
        for j in 0..250u64 {
            let mut pkt = tcp_packet(
                src,
                41000,
                "198.51.100.9",
                9999,
                TcpFlags {
                    ack: true,
                    ..Default::default()
                },
                start + j * (1_000_000_000 / 512),
            );
            pkt.total_len = 60;
            learn_packets.push(pkt);
        }
    }
    let config_a = flood_config(dir.path());
    let engine_a = run_replay(config_a, learn_packets).await;
    // Learning phase: flows scored and persisted, no alerts
    assert!(engine_a.query().list_alerts(&Default::default()).is_empty());
    assert!(engine_a.query().recent_flows(10).unwrap().len() >= 3);
    drop(engine_a);

    // Phase B: learning window over (persisted baseline + zero period)
    let mut config_b = flood_config(dir.path());
    config_b.detection.adaptive_baseline.learning_period = 0;
    config_b.database.directory = dir.path().join("db-b");
    config_b.alerts.log_path = dir.path().join("alerts-b.jsonl");

    // An attack matching the learned shape: SYN burst, same port, same
    // rate and packet size as the learned flows
    let mut matching = syn_flood("172.20.0.50", "198.51.100.9", 9999, 250, 512.0, 0);
    for pkt in matching.iter_mut() {
        pkt.total_len = 60;
    }
    // And a novel flood on a different port and rate
    let novel = syn_flood("10.0.0.50", "10.0.0.100", 8080, 1000, 2000.0, 10_000_000_000);
    let mut packets = matching;
    packets.extend(novel);

    let engine_b = run_replay(config_b, packets).await;
    let query = engine_b.query();

    let alerts = query.list_alerts(&Default::default());
    assert_eq!(alerts.len(), 1, "expected only the novel flood: {alerts:?}");
    assert_eq!(alerts[0].dst_port, 8080);
    assert!(engine_b.counters().suppressed.load(std::sync::atomic::Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn scenario_acknowledgement_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = flood_config(dir.path());

    let packets = syn_flood("10.0.0.50", "10.0.0.100", 80, 1000, 500.0, 0);
    let engine = run_replay(config, packets).await;
    let query = engine.query();

    let acked = query.acknowledge(1, "alice", Some("under review")).unwrap();
    assert!(acked.acknowledged);
    assert_eq!(acked.ack_user.as_deref(), Some("alice"));

    let resolved = query.set_status(1, "resolved", Some("firewall blocked")).unwrap();
    assert_eq!(resolved.status, flowsentry::alert::AlertStatus::Resolved);

    // Explicit reopen: recorded in notes, same id, no new alert
    let reopened = query.set_status(1, "new", None).unwrap();
    assert_eq!(reopened.status, flowsentry::alert::AlertStatus::New);
    assert!(reopened.notes.unwrap().contains("reopened"));
    assert_eq!(query.list_alerts(&Default::default()).len(), 1);
}

#[tokio::test]
async fn scenario_capture_privilege_denied_touches_nothing() {
    use flowsentry::capture::LiveCapture;
    use flowsentry::error::exit_code_for;

    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = test_config(dir.path());

    // The composition root opens capture before any storage; a denied
    // interface must leave no alert log or flow store behind.
    let ensemble = ModelEnsemble::load(&config.models).unwrap();
    drop(ensemble);
    let err = match LiveCapture::open("flowsentry-test-no-such-if0") {
        Err(e) => e,
        Ok(_) => return,
    };
    assert_eq!(exit_code_for(&err), 77);

    assert!(!config.alerts.log_path.exists());
    assert!(!config.database.directory.join("flows.db").exists());
}

/// Replay that pauses before the first packet so tests can subscribe
/// before any alert can fire.
struct DelayedReplay {
    inner: ReplaySource,
    started: bool,
}

impl flowsentry::capture::PacketSource for DelayedReplay {
    fn poll_packet(&mut self) -> anyhow::Result<flowsentry::capture::Poll> {
        if !self.started {
            self.started = true;
            std::thread::sleep(Duration::from_millis(100));
        }
        self.inner.poll_packet()
    }

    fn stats(&self) -> flowsentry::capture::CaptureStats {
        self.inner.stats()
    }
}

#[tokio::test]
async fn alert_subscription_sees_new_alerts() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = flood_config(dir.path());

    let ensemble = Arc::new(ModelEnsemble::load(&config.models).unwrap());
    let packets = syn_flood("10.0.0.50", "10.0.0.100", 80, 1000, 500.0, 0);
    let source = DelayedReplay {
        inner: ReplaySource::new(packets),
        started: false,
    };
    let mut engine = Engine::start(config, ensemble, Box::new(source))
        .await
        .unwrap();
    let mut rx = engine.query().subscribe_alerts();

    engine.done().await;

    let alert = rx.try_recv().expect("subscriber should see the alert");
    assert_eq!(alert.id, 1);

    let wire = flowsentry::query::alert_wire_json(&alert, true);
    assert_eq!(wire["new"], serde_json::json!(true));
    assert_eq!(wire["id"], serde_json::json!(1));
}

#[tokio::test]
async fn flow_store_round_trip_through_export() {
    let dir = tempfile::tempdir().unwrap();
    write_artifacts(dir.path());
    let config = flood_config(dir.path());

    let packets = benign_https(0);
    let engine = run_replay(config, packets).await;

    let flows = engine.query().recent_flows(10).unwrap();
    assert_eq!(flows.len(), 1);
    // All 37 features persisted finite
    assert!(flows[0].features.values.iter().all(|v| v.is_finite()));
}
