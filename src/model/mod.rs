//! Model serving: frozen artifacts and the ensemble rule
//!
//! Three artifacts load at startup (scaler, calibrated tree forest,
//! feed-forward network) plus the class mapping. Any load failure is fatal;
//! after that the ensemble is immutable and freely shared across inference
//! workers.

pub mod forest;
pub mod network;
pub mod scaler;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::core::flow::FlowSnapshot;
use crate::error::StartupError;
use crate::features::{self, FeatureVector};

pub use forest::TreeForest;
pub use network::FeedForward;
pub use scaler::StandardScaler;

/// The benign class label
pub const BENIGN_LABEL: &str = "BenignTraffic";

pub const METHOD_CONSENSUS: &str = "ensemble_consensus";
pub const METHOD_WEIGHTED: &str = "ensemble_weighted";
pub const METHOD_FALLBACK: &str = "error_fallback";

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity for a threat label: benign is low; DDoS/DoS/Recon families and
/// vulnerability scanning are medium; everything else is high.
pub fn severity_for(label: &str) -> Severity {
    if label == BENIGN_LABEL {
        Severity::Low
    } else if label.starts_with("DDoS-")
        || label.starts_with("DoS-")
        || label.starts_with("Recon-")
        || label == "VulnerabilityScan"
    {
        Severity::Medium
    } else {
        Severity::High
    }
}

/// Class index -> label mapping, loaded from the training artifact and
/// trusted as-is.
#[derive(Debug, Clone)]
pub struct ClassMapping {
    labels: Vec<String>,
    benign_index: usize,
}

impl ClassMapping {
    pub fn load(path: &Path) -> Result<Self> {
        let raw: HashMap<String, String> = load_json(path)?;

        let mut labels = vec![String::new(); raw.len()];
        for (key, label) in raw {
            let idx: usize = key.parse().map_err(|_| StartupError::ModelArtifact {
                path: path.to_path_buf(),
                reason: format!("non-integer class index {key:?}"),
            })?;
            if idx >= labels.len() {
                return Err(StartupError::ModelArtifact {
                    path: path.to_path_buf(),
                    reason: format!("class indices are not contiguous (index {idx})"),
                }
                .into());
            }
            labels[idx] = label;
        }

        if labels.iter().any(|l| l.is_empty()) {
            return Err(StartupError::ModelArtifact {
                path: path.to_path_buf(),
                reason: "class indices are not contiguous".into(),
            }
            .into());
        }

        let benign_index = labels
            .iter()
            .position(|l| l == BENIGN_LABEL)
            .ok_or_else(|| StartupError::ModelArtifact {
                path: path.to_path_buf(),
                reason: format!("class mapping has no {BENIGN_LABEL} entry"),
            })?;

        Ok(Self {
            labels,
            benign_index,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, idx: usize) -> &str {
        &self.labels[idx]
    }

    pub fn benign_index(&self) -> usize {
        self.benign_index
    }
}

/// One model's individual verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVote {
    pub label: String,
    pub confidence: f64,
}

/// Final ensemble verdict for a scoring event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub severity: Severity,
    pub confidence: f64,
    pub method: String,
    pub tree: ModelVote,
    pub nn: ModelVote,
}

impl Prediction {
    pub fn is_benign(&self) -> bool {
        self.label == BENIGN_LABEL
    }

    /// Synthetic benign verdict for inference failures and timeouts
    pub fn synthetic_benign() -> Self {
        let vote = ModelVote {
            label: BENIGN_LABEL.to_string(),
            confidence: 0.0,
        };
        Self {
            label: BENIGN_LABEL.to_string(),
            severity: Severity::Low,
            confidence: 0.0,
            method: METHOD_FALLBACK.to_string(),
            tree: vote.clone(),
            nn: vote,
        }
    }
}

/// The frozen two-model ensemble
pub struct ModelEnsemble {
    scaler: StandardScaler,
    forest: TreeForest,
    network: FeedForward,
    mapping: ClassMapping,
    optimal_threshold: f64,
    ml_weight: f64,
    dl_weight: f64,
}

impl ModelEnsemble {
    /// Load all artifacts. Any failure refuses startup.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let mapping = ClassMapping::load(&config.class_mapping_path)?;

        // Optional feature list shipped with the models must agree with ours
        if let Some(dir) = config.class_mapping_path.parent() {
            features::verify_feature_info(&dir.join("feature_info.json"))?;
        }

        let scaler: StandardScaler = load_json(&config.scaler_path)?;
        scaler.validate().map_err(|reason| StartupError::ModelArtifact {
            path: config.scaler_path.clone(),
            reason,
        })?;

        let forest: TreeForest = load_json(&config.ml_path)?;
        forest
            .validate(mapping.len())
            .map_err(|reason| StartupError::ModelArtifact {
                path: config.ml_path.clone(),
                reason,
            })?;

        let network: FeedForward = load_json(&config.dl_path)?;
        network
            .validate(mapping.len())
            .map_err(|reason| StartupError::ModelArtifact {
                path: config.dl_path.clone(),
                reason,
            })?;

        info!(
            classes = mapping.len(),
            trees = forest.trees.len(),
            layers = network.layers.len(),
            "loaded model artifacts"
        );

        Ok(Self {
            scaler,
            forest,
            network,
            mapping,
            optimal_threshold: config.optimal_threshold,
            ml_weight: config.ml_weight,
            dl_weight: config.dl_weight,
        })
    }

    pub fn class_mapping(&self) -> &ClassMapping {
        &self.mapping
    }

    /// Run the ensemble rule on an extracted feature vector.
    pub fn predict(&self, features: &FeatureVector) -> Prediction {
        // The models only accept finite input
        let mut x = features.values;
        for v in x.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }

        let scaled = self.scaler.transform(&x);
        let p_tree = self.forest.predict_proba(&scaled);
        let p_nn = self.network.predict_proba(&scaled);

        let combined: Vec<f64> = p_tree
            .iter()
            .zip(p_nn.iter())
            .map(|(t, n)| self.ml_weight * t + self.dl_weight * n)
            .collect();

        let (best, raw_conf) = argmax(&combined);
        let (tree_best, tree_conf) = argmax(&p_tree);
        let (nn_best, nn_conf) = argmax(&p_nn);

        let tree_vote = ModelVote {
            label: self.mapping.label(tree_best).to_string(),
            confidence: tree_conf,
        };
        let nn_vote = ModelVote {
            label: self.mapping.label(nn_best).to_string(),
            confidence: nn_conf,
        };

        let raw_conf = raw_conf.clamp(0.0, 1.0);

        let (label_idx, method, confidence) = if raw_conf < self.optimal_threshold {
            (self.mapping.benign_index(), METHOD_WEIGHTED, raw_conf)
        } else if tree_best == best && nn_best == best {
            (best, METHOD_CONSENSUS, (raw_conf * 1.05).min(1.0))
        } else {
            (best, METHOD_WEIGHTED, raw_conf)
        };

        let label = self.mapping.label(label_idx).to_string();
        let severity = severity_for(&label);

        Prediction {
            label,
            severity,
            confidence,
            method: method.to_string(),
            tree: tree_vote,
            nn: nn_vote,
        }
    }
}

fn argmax(values: &[f64]) -> (usize, f64) {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    (best, best_val)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| StartupError::ModelArtifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| {
        StartupError::ModelArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Inference counters
#[derive(Debug, Default)]
pub struct InferenceStats {
    pub scored: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Bounded blocking-worker pool in front of the ensemble.
///
/// Capture must never stall on model calls: inference runs on blocking
/// threads, concurrency is capped by a semaphore, and a call that exceeds
/// the timeout is abandoned in favor of a synthetic benign verdict.
#[derive(Clone)]
pub struct InferencePool {
    ensemble: Arc<ModelEnsemble>,
    permits: Arc<tokio::sync::Semaphore>,
    timeout: Duration,
    stats: Arc<InferenceStats>,
}

impl InferencePool {
    pub fn new(ensemble: Arc<ModelEnsemble>, workers: usize, timeout: Duration) -> Self {
        Self {
            ensemble,
            permits: Arc::new(tokio::sync::Semaphore::new(workers.max(1))),
            timeout,
            stats: Arc::new(InferenceStats::default()),
        }
    }

    pub fn stats(&self) -> &InferenceStats {
        &self.stats
    }

    /// Extract features and score a snapshot. Never fails: inference
    /// problems degrade to a synthetic benign prediction.
    pub async fn score(&self, snapshot: &FlowSnapshot) -> Prediction {
        let features = features::extract(snapshot);
        self.stats.scored.fetch_add(1, Ordering::Relaxed);

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Prediction::synthetic_benign(),
        };

        let ensemble = self.ensemble.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            ensemble.predict(&features)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(prediction)) => prediction,
            Ok(Err(e)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!("inference task failed: {e}");
                Prediction::synthetic_benign()
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("inference timed out after {:?}", self.timeout);
                Prediction::synthetic_benign()
            }
        }
    }
}
