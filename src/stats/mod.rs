//! Rolling alert statistics
//!
//! Four windows: hour, day, week, all-time. The bounded windows keep their
//! events and evict by age on every update, so their counters are exact.
//! The unbounded all-time window cannot evict, so its top-K maps use a
//! space-saving counter: exact until K distinct keys, then replace-min.
//! A JSON snapshot persists periodically and reloads on startup.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alert::Alert;
use crate::model::Severity;

/// Retained top entries per window
pub const TOP_K: usize = 20;

const HOUR_SECS: u64 = 3600;
const DAY_SECS: u64 = 86_400;
const WEEK_SECS: u64 = 604_800;

/// Query window selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsWindow {
    Hour,
    Day,
    Week,
    AllTime,
}

impl std::str::FromStr for StatsWindow {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" | "hourly" => Ok(StatsWindow::Hour),
            "day" | "daily" => Ok(StatsWindow::Day),
            "week" | "weekly" => Ok(StatsWindow::Week),
            "all" | "all_time" => Ok(StatsWindow::AllTime),
            _ => Err(()),
        }
    }
}

/// Space-saving frequency counter: exact until `capacity` distinct keys,
/// then new keys replace the current minimum, inheriting its count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceSaving {
    capacity: usize,
    counts: HashMap<String, u64>,
}

impl SpaceSaving {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            counts: HashMap::with_capacity(capacity + 1),
        }
    }

    pub fn record(&mut self, key: &str) {
        if let Some(count) = self.counts.get_mut(key) {
            *count += 1;
            return;
        }
        if self.counts.len() < self.capacity {
            self.counts.insert(key.to_string(), 1);
            return;
        }
        // Replace the minimum, inheriting its count
        if let Some((min_key, min_count)) = self
            .counts
            .iter()
            .min_by_key(|(_, &c)| c)
            .map(|(k, &c)| (k.clone(), c))
        {
            self.counts.remove(&min_key);
            self.counts.insert(key.to_string(), min_count + 1);
        }
    }

    pub fn top(&self, k: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> =
            self.counts.iter().map(|(k, &c)| (k.clone(), c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(k);
        entries
    }
}

/// One counted alert event
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlertEvent {
    wall: f64,
    severity: Severity,
    threat: String,
    src_ip: String,
}

/// Exact counters over a bounded trailing window
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    window_secs: u64,
    events: VecDeque<AlertEvent>,
    by_severity: HashMap<String, u64>,
    threats: HashMap<String, u64>,
    sources: HashMap<String, u64>,
}

impl WindowState {
    fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            events: VecDeque::new(),
            by_severity: HashMap::new(),
            threats: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    fn record(&mut self, event: AlertEvent) {
        *self
            .by_severity
            .entry(event.severity.as_str().to_string())
            .or_insert(0) += 1;
        *self.threats.entry(event.threat.clone()).or_insert(0) += 1;
        *self.sources.entry(event.src_ip.clone()).or_insert(0) += 1;
        self.events.push_back(event);
    }

    fn rollover(&mut self, now: f64) {
        let cutoff = now - self.window_secs as f64;
        while let Some(front) = self.events.front() {
            if front.wall >= cutoff {
                break;
            }
            let event = self.events.pop_front().expect("front checked");
            decrement(&mut self.by_severity, event.severity.as_str());
            decrement(&mut self.threats, &event.threat);
            decrement(&mut self.sources, &event.src_ip);
        }
    }

    fn top_of(map: &HashMap<String, u64>, k: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = map.iter().map(|(k, &c)| (k.clone(), c)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(k);
        entries
    }
}

fn decrement(map: &mut HashMap<String, u64>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// All-time counters (no eviction, sketched top-K)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllTimeState {
    total: u64,
    by_severity: HashMap<String, u64>,
    threats: SpaceSaving,
    sources: SpaceSaving,
}

impl AllTimeState {
    fn new() -> Self {
        Self {
            total: 0,
            by_severity: HashMap::new(),
            threats: SpaceSaving::new(TOP_K),
            sources: SpaceSaving::new(TOP_K),
        }
    }
}

/// Summary handed to the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSummary {
    pub window: StatsWindow,
    pub total: u64,
    pub by_severity: HashMap<String, u64>,
    pub top_threats: Vec<(String, u64)>,
    pub top_sources: Vec<(String, u64)>,
    pub uptime_secs: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    started_wall: f64,
    all: AllTimeState,
    week_events: Vec<AlertEvent>,
    saved_at: DateTime<Utc>,
}

/// The tracker. Single writer; readers get cloned summaries.
pub struct StatisticsTracker {
    hour: WindowState,
    day: WindowState,
    week: WindowState,
    all: AllTimeState,
    started_wall: f64,
    snapshot_path: PathBuf,
}

impl StatisticsTracker {
    /// Load the persisted snapshot if present, else start fresh.
    pub fn load(snapshot_path: PathBuf, now: f64) -> Self {
        let mut tracker = Self {
            hour: WindowState::new(HOUR_SECS),
            day: WindowState::new(DAY_SECS),
            week: WindowState::new(WEEK_SECS),
            all: AllTimeState::new(),
            started_wall: now,
            snapshot_path,
        };

        if tracker.snapshot_path.exists() {
            match std::fs::read_to_string(&tracker.snapshot_path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<PersistedStats>(&s).map_err(Into::into))
            {
                Ok(persisted) => {
                    tracker.started_wall = persisted.started_wall;
                    tracker.all = persisted.all;
                    // Rebuild the bounded windows from the persisted week
                    for event in persisted.week_events {
                        tracker.hour.record(event.clone());
                        tracker.day.record(event.clone());
                        tracker.week.record(event);
                    }
                    tracker.rollover(now);
                    info!(
                        week_events = tracker.week.events.len(),
                        "restored statistics snapshot"
                    );
                }
                Err(e) => debug!("could not restore statistics snapshot: {e}"),
            }
        }

        tracker
    }

    /// Count an emitted alert.
    pub fn record(&mut self, alert: &Alert, now: f64) {
        let event = AlertEvent {
            wall: alert.timestamp,
            severity: alert.severity,
            threat: alert.threat.clone(),
            src_ip: alert.src_ip.to_string(),
        };

        self.hour.record(event.clone());
        self.day.record(event.clone());
        self.week.record(event.clone());

        self.all.total += 1;
        *self
            .all
            .by_severity
            .entry(event.severity.as_str().to_string())
            .or_insert(0) += 1;
        self.all.threats.record(&event.threat);
        self.all.sources.record(&event.src_ip);

        self.rollover(now);
    }

    fn rollover(&mut self, now: f64) {
        self.hour.rollover(now);
        self.day.rollover(now);
        self.week.rollover(now);
    }

    /// Summary for one window
    pub fn summary(&self, window: StatsWindow, now: f64) -> WindowSummary {
        let uptime_secs = (now - self.started_wall).max(0.0);
        match window {
            StatsWindow::AllTime => WindowSummary {
                window,
                total: self.all.total,
                by_severity: self.all.by_severity.clone(),
                top_threats: self.all.threats.top(TOP_K),
                top_sources: self.all.sources.top(TOP_K),
                uptime_secs,
            },
            bounded => {
                let state = match bounded {
                    StatsWindow::Hour => &self.hour,
                    StatsWindow::Day => &self.day,
                    _ => &self.week,
                };
                WindowSummary {
                    window,
                    total: state.events.len() as u64,
                    by_severity: state.by_severity.clone(),
                    top_threats: WindowState::top_of(&state.threats, TOP_K),
                    top_sources: WindowState::top_of(&state.sources, TOP_K),
                    uptime_secs,
                }
            }
        }
    }

    /// Persist the snapshot.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedStats {
            started_wall: self.started_wall,
            all: self.all.clone(),
            week_events: self.week.events.iter().cloned().collect(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string(&persisted)?;
        std::fs::write(&self.snapshot_path, json)
            .with_context(|| format!("writing statistics to {:?}", self.snapshot_path))?;
        Ok(())
    }
}
