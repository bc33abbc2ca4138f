//! Adaptive baseline learning
//!
//! For the first `learning_period` seconds of (cumulative) uptime the
//! baseline counts fingerprints of observed traffic. Afterwards a
//! fingerprint seen often enough during learning suppresses matching flows.
//! The map persists across restarts, including elapsed learning time, so a
//! restart resumes the remaining window instead of starting over.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::BaselineConfig;
use crate::core::flow::FlowSnapshot;

/// Traffic fingerprint: protocol, destination port, log2 rate bucket,
/// log2 mean-packet-size bucket. Encoded as a string key so the persisted
/// map stays a plain JSON object.
pub fn fingerprint(snap: &FlowSnapshot) -> String {
    let rate_bucket = log2_bucket(snap.packet_rate());
    let size_bucket = log2_bucket(snap.mean_packet_size());
    format!(
        "{}|{}|{}|{}",
        snap.key.protocol, snap.key.dst_port, rate_bucket, size_bucket
    )
}

fn log2_bucket(value: f64) -> i32 {
    value.max(1.0).log2().floor() as i32
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBaseline {
    /// Learning seconds already consumed before this process started
    elapsed_secs: f64,
    learning_period: u64,
    counts: HashMap<String, u32>,
    total_observed: u64,
    saved_at: DateTime<Utc>,
}

/// The baseline fingerprint map. Single writer (the suppressor).
pub struct AdaptiveBaseline {
    config: BaselineConfig,
    counts: HashMap<String, u32>,
    total_observed: u64,
    elapsed_at_load: f64,
    started: Instant,
}

impl AdaptiveBaseline {
    /// Load persisted state if present, otherwise start a fresh window.
    pub fn load(config: BaselineConfig) -> Self {
        let mut elapsed_at_load = 0.0;
        let mut counts = HashMap::new();
        let mut total_observed = 0;

        if config.path.exists() {
            match std::fs::read_to_string(&config.path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<PersistedBaseline>(&s).map_err(Into::into))
            {
                Ok(persisted) => {
                    elapsed_at_load = persisted.elapsed_secs;
                    counts = persisted.counts;
                    total_observed = persisted.total_observed;
                    info!(
                        fingerprints = counts.len(),
                        elapsed_secs = elapsed_at_load,
                        "resumed adaptive baseline"
                    );
                }
                Err(e) => {
                    debug!("could not load baseline from {:?}: {e}", config.path);
                }
            }
        }

        Self {
            config,
            counts,
            total_observed,
            elapsed_at_load,
            started: Instant::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cumulative learning seconds, across restarts
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_at_load + self.started.elapsed().as_secs_f64()
    }

    pub fn is_learning(&self) -> bool {
        self.elapsed_secs() < self.config.learning_period as f64
    }

    /// Record a snapshot's fingerprint while learning. No-op afterwards.
    pub fn observe(&mut self, snap: &FlowSnapshot) {
        if !self.config.enabled || !self.is_learning() {
            return;
        }
        *self.counts.entry(fingerprint(snap)).or_insert(0) += 1;
        self.total_observed += 1;
    }

    /// Post-learning: does this snapshot match a learned-normal pattern?
    pub fn matches(&self, snap: &FlowSnapshot) -> bool {
        if !self.config.enabled || self.is_learning() {
            return false;
        }
        self.counts
            .get(&fingerprint(snap))
            .map(|&c| c >= self.config.baseline_min_occurrences)
            .unwrap_or(false)
    }

    pub fn fingerprint_count(&self) -> usize {
        self.counts.len()
    }

    /// Persist the map and elapsed window time.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedBaseline {
            elapsed_secs: self.elapsed_secs(),
            learning_period: self.config.learning_period,
            counts: self.counts.clone(),
            total_observed: self.total_observed,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string(&persisted)?;
        std::fs::write(&self.config.path, json)
            .with_context(|| format!("writing baseline to {:?}", self.config.path))?;
        Ok(())
    }
}
