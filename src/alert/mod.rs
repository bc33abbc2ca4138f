//! Alert lifecycle: creation, deduplication, acknowledgement, fan-out
//!
//! The manager owns the monotonic id counter and the bounded in-memory
//! table. Every mutation is appended to a JSON-per-line log which is
//! replayed on startup (last record per id wins). New alerts broadcast to
//! subscribers and fan out to the configured sinks.

pub mod sink;

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::AlertConfig;
use crate::core::flow::FlowKey;
use crate::error::StartupError;
use crate::model::{Prediction, Severity};

pub use sink::{AlertSink, TracingSink};

/// Alert workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    /// Terminal states absorb automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalsePositive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(AlertStatus::New),
            "investigating" => Ok(AlertStatus::Investigating),
            "resolved" => Ok(AlertStatus::Resolved),
            "false_positive" => Ok(AlertStatus::FalsePositive),
            _ => Err(()),
        }
    }
}

/// A tracked alert. Serialized form is the durable JSONL record and the
/// subscription wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    /// Creation wall time, seconds since epoch
    pub timestamp: f64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub threat: String,
    pub severity: Severity,
    pub confidence: f64,
    pub context: String,
    pub acknowledged: bool,
    pub ack_user: Option<String>,
    pub ack_time: Option<f64>,
    pub status: AlertStatus,
    pub notes: Option<String>,
    /// Bumped when a dedupe window repeat updates this alert
    #[serde(default)]
    pub last_updated: f64,
    /// Flow packet count at the latest scoring event
    #[serde(default)]
    pub packet_count: u64,
}

impl Alert {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            protocol: self.protocol,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }
}

/// Query filters for the alert table
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub threat: Option<String>,
    pub acknowledged: Option<bool>,
    pub status: Option<AlertStatus>,
    pub src_ip: Option<IpAddr>,
    pub limit: Option<usize>,
}

struct AlertTable {
    alerts: BTreeMap<u64, Alert>,
    next_id: u64,
    /// (canonical flow key, threat) -> (alert id, last event wall time)
    dedupe: HashMap<(String, String), (u64, f64)>,
    log: Option<File>,
    log_failures: u64,
}

impl AlertTable {
    fn append_log(&mut self, alert: &Alert) {
        if let Some(log) = self.log.as_mut() {
            let result = serde_json::to_string(alert)
                .map_err(anyhow::Error::from)
                .and_then(|line| writeln!(log, "{line}").map_err(Into::into));
            if let Err(e) = result {
                self.log_failures += 1;
                if self.log_failures == 1 || self.log_failures % 100 == 0 {
                    warn!("failed to append alert log ({}): {e}", self.log_failures);
                }
            }
        }
    }

    fn evict_over(&mut self, max: usize) {
        while self.alerts.len() > max {
            // Oldest non-new first; oldest overall as a last resort
            let victim = self
                .alerts
                .values()
                .find(|a| a.status != AlertStatus::New)
                .map(|a| a.id)
                .or_else(|| self.alerts.keys().next().copied());
            match victim {
                Some(id) => {
                    self.alerts.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Alert manager: single logical writer, lock-free-ish snapshot reads.
pub struct AlertManager {
    inner: RwLock<AlertTable>,
    broadcast: broadcast::Sender<Alert>,
    sinks: Vec<Arc<dyn AlertSink>>,
    config: AlertConfig,
}

impl AlertManager {
    /// Open (creating if needed) the durable log and replay it.
    pub fn new(config: AlertConfig, sinks: Vec<Arc<dyn AlertSink>>) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StartupError::Storage(format!("alert log dir: {e}")))?;
        }

        let mut table = AlertTable {
            alerts: BTreeMap::new(),
            next_id: 1,
            dedupe: HashMap::new(),
            log: None,
            log_failures: 0,
        };

        if config.log_path.exists() {
            replay_log(&config, &mut table)?;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .map_err(|e| StartupError::Storage(format!("alert log: {e}")))?;
        table.log = Some(log);

        let (broadcast, _) = broadcast::channel(1024);

        Ok(Self {
            inner: RwLock::new(table),
            broadcast,
            sinks,
            config,
        })
    }

    /// In-memory manager for tests and `check-config`
    pub fn ephemeral(config: AlertConfig) -> Self {
        let (broadcast, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(AlertTable {
                alerts: BTreeMap::new(),
                next_id: 1,
                dedupe: HashMap::new(),
                log: None,
                log_failures: 0,
            }),
            broadcast,
            sinks: Vec::new(),
            config,
        }
    }

    /// Ingest a detection. Within the dedupe window a repeat
    /// (flow key, threat) updates the existing alert; otherwise a new
    /// alert is created, broadcast, and delivered to sinks.
    ///
    /// Returns (alert id, created).
    pub async fn ingest(
        &self,
        key: &FlowKey,
        prediction: &Prediction,
        context: String,
        packet_count: u64,
        now_wall: f64,
    ) -> (u64, bool) {
        let created = {
            let mut table = self.inner.write();
            let dedupe_key = (key.to_string(), prediction.label.clone());

            if let Some(&(existing_id, last_seen)) = table.dedupe.get(&dedupe_key) {
                let in_window =
                    now_wall - last_seen <= self.config.dedupe_window_seconds as f64;
                if in_window && table.alerts.contains_key(&existing_id) {
                    table.dedupe.insert(dedupe_key, (existing_id, now_wall));
                    let alert = table.alerts.get_mut(&existing_id).expect("checked");
                    alert.confidence = alert.confidence.max(prediction.confidence);
                    alert.last_updated = now_wall;
                    alert.packet_count = packet_count;
                    let snapshot = alert.clone();
                    table.append_log(&snapshot);
                    debug!(id = existing_id, threat = %prediction.label, "deduplicated alert");
                    return (existing_id, false);
                }
            }

            let id = table.next_id;
            table.next_id += 1;

            let alert = Alert {
                id,
                timestamp: now_wall,
                src_ip: key.src_ip,
                dst_ip: key.dst_ip,
                src_port: key.src_port,
                dst_port: key.dst_port,
                protocol: key.protocol,
                threat: prediction.label.clone(),
                severity: prediction.severity,
                confidence: prediction.confidence,
                context,
                acknowledged: false,
                ack_user: None,
                ack_time: None,
                status: AlertStatus::New,
                notes: None,
                last_updated: now_wall,
                packet_count,
            };

            table.dedupe.insert(dedupe_key, (id, now_wall));
            table.append_log(&alert);
            table.alerts.insert(id, alert.clone());
            table.evict_over(self.config.max_in_memory);
            alert
        };

        let _ = self.broadcast.send(created.clone());
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&created).await {
                warn!(sink = sink.name(), "alert sink failed: {e}");
            }
        }
        (created.id, true)
    }

    /// Create an operational alert not tied to captured traffic (e.g. the
    /// flow store entering bypass mode).
    pub async fn operational(&self, threat: &str, severity: Severity, context: String) -> u64 {
        let unspecified: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);
        let key = FlowKey {
            src_ip: unspecified,
            dst_ip: unspecified,
            protocol: 0,
            src_port: 0,
            dst_port: 0,
        };
        let prediction = Prediction {
            label: threat.to_string(),
            severity,
            confidence: 1.0,
            method: "operational".to_string(),
            tree: crate::model::ModelVote {
                label: threat.to_string(),
                confidence: 1.0,
            },
            nn: crate::model::ModelVote {
                label: threat.to_string(),
                confidence: 1.0,
            },
        };
        let now = wall_now();
        self.ingest(&key, &prediction, context, 0, now).await.0
    }

    /// Mark an alert acknowledged. Idempotent; `None` for unknown ids.
    pub fn acknowledge(&self, id: u64, user: &str, notes: Option<&str>) -> Option<Alert> {
        let mut table = self.inner.write();
        let alert = table.alerts.get_mut(&id)?;

        alert.acknowledged = true;
        alert.ack_user = Some(user.to_string());
        if alert.ack_time.is_none() {
            alert.ack_time = Some(wall_now());
        }
        if let Some(n) = notes {
            alert.notes = Some(n.to_string());
        }

        let snapshot = alert.clone();
        table.append_log(&snapshot);
        Some(snapshot)
    }

    /// Transition alert status. Idempotent per status. Leaving a terminal
    /// state is an explicit operator override and is recorded in notes.
    pub fn set_status(&self, id: u64, status: AlertStatus, notes: Option<&str>) -> Option<Alert> {
        let mut table = self.inner.write();
        let alert = table.alerts.get_mut(&id)?;

        if alert.status == status {
            if let Some(n) = notes {
                alert.notes = Some(n.to_string());
            }
        } else {
            if alert.status.is_terminal() {
                let reopen = format!(
                    "reopened from {} to {}{}",
                    alert.status.as_str(),
                    status.as_str(),
                    notes.map(|n| format!(": {n}")).unwrap_or_default()
                );
                alert.notes = Some(match alert.notes.take() {
                    Some(existing) => format!("{existing}; {reopen}"),
                    None => reopen,
                });
            } else if let Some(n) = notes {
                alert.notes = Some(n.to_string());
            }
            alert.status = status;
        }

        let snapshot = alert.clone();
        table.append_log(&snapshot);
        Some(snapshot)
    }

    /// Single alert by id
    pub fn get(&self, id: u64) -> Option<Alert> {
        self.inner.read().alerts.get(&id).cloned()
    }

    /// Filtered query, newest first
    pub fn query(&self, filter: &AlertFilter) -> Vec<Alert> {
        let table = self.inner.read();
        let mut matches: Vec<Alert> = table
            .alerts
            .values()
            .rev()
            .filter(|a| filter.severity.map_or(true, |s| a.severity == s))
            .filter(|a| filter.threat.as_ref().map_or(true, |t| &a.threat == t))
            .filter(|a| filter.acknowledged.map_or(true, |ack| a.acknowledged == ack))
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .filter(|a| filter.src_ip.map_or(true, |ip| a.src_ip == ip))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        matches
    }

    pub fn len(&self) -> usize {
        self.inner.read().alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().alerts.is_empty()
    }

    /// Per-subscriber lossy stream of newly created alerts, in id order.
    /// A lagged receiver dropped its oldest entries and is marked degraded
    /// by the broadcast error it observes.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.broadcast.subscribe()
    }
}

fn wall_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn replay_log(config: &AlertConfig, table: &mut AlertTable) -> Result<()> {
    let file = File::open(&config.log_path)
        .map_err(|e| StartupError::Storage(format!("alert log replay: {e}")))?;
    let reader = BufReader::new(file);

    let mut replayed = 0usize;
    let mut skipped = 0usize;
    let retention_secs = config.retention_days as f64 * 86_400.0;
    let now = wall_now();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Alert>(&line) {
            Ok(alert) => {
                // Drop aged-out terminal records at load
                if config.retention_days > 0
                    && alert.status.is_terminal()
                    && now - alert.timestamp > retention_secs
                {
                    skipped += 1;
                    continue;
                }
                if alert.id >= table.next_id {
                    table.next_id = alert.id + 1;
                }
                // Last record per id wins
                table.alerts.insert(alert.id, alert);
                replayed += 1;
            }
            Err(_) => skipped += 1,
        }
    }

    table.evict_over(config.max_in_memory);
    info!(replayed, skipped, next_id = table.next_id, "replayed alert log");
    Ok(())
}
