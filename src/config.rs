use anyhow::Result;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StartupError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    pub models: ModelConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub statistics: StatisticsConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            StartupError::Config(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            StartupError::Config(format!(
                "failed to parse {}: {e}",
                path.as_ref().display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load config from default locations
    pub fn load_default_locations() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowsentry/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowsentry/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(StartupError::Config("no configuration file found".into()).into())
    }

    /// Validate the configuration; every violation is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.network.interface.trim().is_empty() {
            return Err(StartupError::Config("network.interface must be set".into()).into());
        }

        let d = &self.detection;
        if !(0.0..=1.0).contains(&d.confidence_threshold) {
            return Err(StartupError::Config(format!(
                "detection.confidence_threshold {} outside [0, 1]",
                d.confidence_threshold
            ))
            .into());
        }
        for cidr in &d.whitelist_ips {
            cidr.parse::<IpNetwork>().map_err(|e| {
                StartupError::Config(format!(
                    "invalid CIDR in detection.whitelist_ips: {cidr}: {e}"
                ))
            })?;
        }
        if d.score_packet_interval == 0 {
            return Err(
                StartupError::Config("detection.score_packet_interval must be >= 1".into()).into(),
            );
        }
        if d.max_flows == 0 {
            return Err(StartupError::Config("detection.max_flows must be >= 1".into()).into());
        }

        let m = &self.models;
        for (key, weight) in [("ml_weight", m.ml_weight), ("dl_weight", m.dl_weight)] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(
                    StartupError::Config(format!("models.{key} {weight} outside [0, 1]")).into(),
                );
            }
        }
        if !(0.0..=1.0).contains(&m.optimal_threshold) {
            return Err(StartupError::Config(format!(
                "models.optimal_threshold {} outside [0, 1]",
                m.optimal_threshold
            ))
            .into());
        }
        for (key, path) in [
            ("ml_path", &m.ml_path),
            ("dl_path", &m.dl_path),
            ("scaler_path", &m.scaler_path),
            ("class_mapping_path", &m.class_mapping_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(StartupError::Config(format!("models.{key} must be set")).into());
            }
        }

        if self.database.enabled && self.database.backend == DatabaseBackend::Postgresql {
            return Err(StartupError::Config(
                "database.type = \"postgresql\" is not supported by this build; use sqlite".into(),
            )
            .into());
        }

        if self.runtime.inference_workers == 0 {
            return Err(
                StartupError::Config("runtime.inference_workers must be >= 1".into()).into(),
            );
        }

        Ok(())
    }

    /// Parsed whitelist CIDRs (validated at load, so parse cannot fail here)
    pub fn whitelist_networks(&self) -> Vec<IpNetwork> {
        self.detection
            .whitelist_ips
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect()
    }
}

/// Capture interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to capture on (e.g. "eth0", "wlan0")
    pub interface: String,
}

/// Detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Full 7-layer suppression cascade
    Threshold,
    /// Model verdicts only (cascade layer 1)
    PureMl,
}

impl Default for DetectionMode {
    fn default() -> Self {
        DetectionMode::Threshold
    }
}

/// Detection and suppression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub mode: DetectionMode,

    /// Minimum ensemble confidence for an alert (cascade layer 2)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Minimum packets in a flow before alerting (cascade layer 3)
    #[serde(default = "default_min_packet_threshold")]
    pub min_packet_threshold: u64,

    /// Suppress flows touching loopback addresses
    #[serde(default = "default_true")]
    pub filter_localhost: bool,

    /// Suppress flows where both endpoints are private (cascade layer 5)
    #[serde(default = "default_true")]
    pub filter_private_networks: bool,

    /// Ports considered legitimate services (cascade layer 6)
    #[serde(default = "default_whitelist_ports")]
    pub whitelist_ports: Vec<u16>,

    /// CIDRs never alerted on (cascade layer 4.5)
    #[serde(default)]
    pub whitelist_ips: Vec<String>,

    /// Dotted-decimal prefixes of known cloud providers (cascade layer 4)
    #[serde(default = "default_cloud_prefixes")]
    pub cloud_prefixes: Vec<String>,

    /// Threat labels that never alert (cascade layer 1)
    #[serde(default)]
    pub ignored_attack_types: Vec<String>,

    /// Packet count below which whitelisted-port traffic is suppressed
    #[serde(default = "default_legitimate_port_packet_threshold")]
    pub legitimate_port_packet_threshold: u64,

    /// Score a flow every N new packets
    #[serde(default = "default_score_packet_interval")]
    pub score_packet_interval: u64,

    /// Evict flows idle longer than this
    #[serde(default = "default_flow_idle_timeout")]
    pub flow_idle_timeout_secs: u64,

    /// Maximum tracked flows (LRU eviction above)
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    #[serde(default)]
    pub adaptive_baseline: BaselineConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            confidence_threshold: default_confidence_threshold(),
            min_packet_threshold: default_min_packet_threshold(),
            filter_localhost: true,
            filter_private_networks: true,
            whitelist_ports: default_whitelist_ports(),
            whitelist_ips: Vec::new(),
            cloud_prefixes: default_cloud_prefixes(),
            ignored_attack_types: Vec::new(),
            legitimate_port_packet_threshold: default_legitimate_port_packet_threshold(),
            score_packet_interval: default_score_packet_interval(),
            flow_idle_timeout_secs: default_flow_idle_timeout(),
            max_flows: default_max_flows(),
            adaptive_baseline: BaselineConfig::default(),
        }
    }
}

/// Adaptive baseline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds of uptime spent learning normal traffic
    #[serde(default = "default_learning_period")]
    pub learning_period: u64,

    /// Occurrences during learning for a fingerprint to suppress afterwards
    #[serde(default = "default_baseline_min_occurrences")]
    pub baseline_min_occurrences: u32,

    /// Where the fingerprint map is persisted
    #[serde(default = "default_baseline_path")]
    pub path: PathBuf,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_period: default_learning_period(),
            baseline_min_occurrences: default_baseline_min_occurrences(),
            path: default_baseline_path(),
        }
    }
}

/// Frozen model artifact locations and ensemble parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Calibrated tree classifier artifact
    pub ml_path: PathBuf,
    /// Feed-forward network artifact
    pub dl_path: PathBuf,
    /// Standard scaler artifact
    pub scaler_path: PathBuf,
    /// Class index -> label mapping
    pub class_mapping_path: PathBuf,

    /// Below this combined confidence the prediction falls back to benign
    #[serde(default = "default_optimal_threshold")]
    pub optimal_threshold: f64,

    #[serde(default = "default_ml_weight")]
    pub ml_weight: f64,

    #[serde(default = "default_dl_weight")]
    pub dl_weight: f64,
}

/// Flow store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    Sqlite,
    Postgresql,
}

impl Default for DatabaseBackend {
    fn default() -> Self {
        DatabaseBackend::Sqlite
    }
}

/// Flow store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "type", default)]
    pub backend: DatabaseBackend,

    /// Directory for the sqlite file
    #[serde(default = "default_db_directory")]
    pub directory: PathBuf,

    /// Connection URL (postgresql backend only)
    #[serde(default)]
    pub url: Option<String>,

    /// Delete rows older than this many days (0 = keep forever)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_true")]
    pub save_benign_flows: bool,

    #[serde(default = "default_true")]
    pub save_attack_flows: bool,

    /// Flows scored below this confidence are not persisted
    #[serde(default)]
    pub min_confidence_to_save: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: DatabaseBackend::default(),
            directory: default_db_directory(),
            url: None,
            retention_days: default_retention_days(),
            save_benign_flows: true,
            save_attack_flows: true,
            min_confidence_to_save: 0.0,
        }
    }
}

/// Alert manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// JSON-per-line durable alert log
    #[serde(default = "default_alert_log_path")]
    pub log_path: PathBuf,

    /// Repeat (flow, threat) within this window updates the existing alert
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_seconds: u64,

    /// In-memory alert table bound
    #[serde(default = "default_max_alerts")]
    pub max_in_memory: usize,

    /// Drop terminal alerts older than this on load (0 = keep forever)
    #[serde(default = "default_alert_retention_days")]
    pub retention_days: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            log_path: default_alert_log_path(),
            dedupe_window_seconds: default_dedupe_window(),
            max_in_memory: default_max_alerts(),
            retention_days: default_alert_retention_days(),
        }
    }
}

/// Inference pool and shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Blocking inference worker threads
    #[serde(default = "default_inference_workers")]
    pub inference_workers: usize,

    /// Abandon an inference call after this long
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,

    /// Bound on queue draining at shutdown
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inference_workers: default_inference_workers(),
            inference_timeout_secs: default_inference_timeout(),
            shutdown_deadline_secs: default_shutdown_deadline(),
        }
    }
}

/// Statistics tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default = "default_stats_snapshot_path")]
    pub snapshot_path: PathBuf,

    #[serde(default = "default_stats_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_stats_snapshot_path(),
            snapshot_interval_secs: default_stats_snapshot_interval(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.95
}

fn default_min_packet_threshold() -> u64 {
    200
}

fn default_whitelist_ports() -> Vec<u16> {
    vec![80, 443, 53, 22, 3389]
}

fn default_cloud_prefixes() -> Vec<String> {
    // GitHub, Microsoft, Google, Cloudflare, public DNS
    [
        "140.82.", "192.30.", "13.107.", "142.250.", "172.217.", "104.16.", "172.64.", "8.8.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_legitimate_port_packet_threshold() -> u64 {
    500
}

fn default_score_packet_interval() -> u64 {
    10
}

fn default_flow_idle_timeout() -> u64 {
    60
}

fn default_max_flows() -> usize {
    50_000
}

fn default_learning_period() -> u64 {
    3600
}

fn default_baseline_min_occurrences() -> u32 {
    3
}

fn default_baseline_path() -> PathBuf {
    PathBuf::from("/var/lib/flowsentry/baseline.json")
}

fn default_optimal_threshold() -> f64 {
    0.55
}

fn default_ml_weight() -> f64 {
    0.6
}

fn default_dl_weight() -> f64 {
    0.4
}

fn default_db_directory() -> PathBuf {
    PathBuf::from("/var/lib/flowsentry")
}

fn default_retention_days() -> u32 {
    30
}

fn default_alert_log_path() -> PathBuf {
    PathBuf::from("/var/lib/flowsentry/alerts.jsonl")
}

fn default_dedupe_window() -> u64 {
    10
}

fn default_max_alerts() -> usize {
    10_000
}

fn default_alert_retention_days() -> u32 {
    30
}

fn default_inference_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_inference_timeout() -> u64 {
    2
}

fn default_shutdown_deadline() -> u64 {
    10
}

fn default_stats_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/flowsentry/statistics.json")
}

fn default_stats_snapshot_interval() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [network]
            interface = "eth0"

            [models]
            ml_path = "models/forest.json"
            dl_path = "models/ffnn.json"
            scaler_path = "models/scaler.json"
            class_mapping_path = "models/class_mapping.json"
        "#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.network.interface, "eth0");
        assert_eq!(config.detection.mode, DetectionMode::Threshold);
        assert_eq!(config.detection.confidence_threshold, 0.95);
        assert_eq!(config.detection.min_packet_threshold, 200);
        assert_eq!(config.detection.whitelist_ports, vec![80, 443, 53, 22, 3389]);
        assert_eq!(config.detection.score_packet_interval, 10);
        assert_eq!(config.models.optimal_threshold, 0.55);
        assert_eq!(config.models.ml_weight, 0.6);
        assert_eq!(config.models.dl_weight, 0.4);
        assert_eq!(config.database.retention_days, 30);
        assert_eq!(config.alerts.dedupe_window_seconds, 10);
        assert!(config.detection.adaptive_baseline.enabled);
        assert_eq!(config.detection.adaptive_baseline.learning_period, 3600);
    }

    #[test]
    fn test_missing_interface_rejected() {
        let toml_str = minimal_toml().replace("eth0", "  ");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.detection.whitelist_ips = vec!["300.1.2.3/24".into()];
        let err = config.validate().unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 64);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let toml_str = format!("{}\n[detection]\nmode = \"hybrid\"\n", minimal_toml());
        assert!(toml::from_str::<Config>(&toml_str).is_err());
    }

    #[test]
    fn test_postgresql_rejected() {
        let toml_str = format!("{}\n[database]\ntype = \"postgresql\"\n", minimal_toml());
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weight_out_of_range_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.models.ml_weight = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_whitelist_networks_parsed() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.detection.whitelist_ips = vec!["10.1.0.0/16".into(), "192.168.7.7/32".into()];
        config.validate().unwrap();
        let networks = config.whitelist_networks();
        assert_eq!(networks.len(), 2);
        assert!(networks[0].contains("10.1.200.3".parse().unwrap()));
    }

    #[test]
    fn test_config_round_trip() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.network.interface, config.network.interface);
        assert_eq!(
            parsed.detection.whitelist_ports,
            config.detection.whitelist_ports
        );
    }
}
