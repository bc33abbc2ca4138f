//! Calibrated tree classifier artifact
//!
//! A forest of decision trees with per-leaf class distributions. Votes are
//! averaged across trees, optionally passed through per-class sigmoid
//! calibration, and renormalized to a probability vector.

use serde::{Deserialize, Serialize};

use crate::features::NUM_FEATURES;

/// A single tree node: either an internal split or a leaf distribution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        probs: Vec<f64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    /// Walk the tree to a leaf. Returns None on a malformed tree (index out
    /// of range or a cycle), which validation rejects at load time.
    fn leaf_for(&self, x: &[f64; NUM_FEATURES]) -> Option<&[f64]> {
        let mut idx = 0usize;
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(idx)? {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = *x.get(*feature)?;
                    idx = if value <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { probs } => return Some(probs),
            }
        }
        None
    }
}

/// Per-class sigmoid calibration parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SigmoidCalibration {
    pub a: f64,
    pub b: f64,
}

impl SigmoidCalibration {
    fn apply(&self, p: f64) -> f64 {
        1.0 / (1.0 + (self.a * p + self.b).exp())
    }
}

/// The frozen forest artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeForest {
    pub n_classes: usize,
    pub trees: Vec<Tree>,
    #[serde(default)]
    pub calibration: Option<Vec<SigmoidCalibration>>,
}

impl TreeForest {
    /// Validate structure: non-empty, consistent leaf widths, in-range
    /// features and child indices, reachable leaves.
    pub fn validate(&self, expected_classes: usize) -> Result<(), String> {
        if self.n_classes != expected_classes {
            return Err(format!(
                "forest has {} classes, class mapping has {expected_classes}",
                self.n_classes
            ));
        }
        if self.trees.is_empty() {
            return Err("forest has no trees".into());
        }
        for (ti, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(format!("tree {ti} is empty"));
            }
            for (ni, node) in tree.nodes.iter().enumerate() {
                match node {
                    TreeNode::Split {
                        feature,
                        left,
                        right,
                        ..
                    } => {
                        if *feature >= NUM_FEATURES {
                            return Err(format!(
                                "tree {ti} node {ni} splits on feature {feature} (max {})",
                                NUM_FEATURES - 1
                            ));
                        }
                        if *left >= tree.nodes.len() || *right >= tree.nodes.len() {
                            return Err(format!("tree {ti} node {ni} child out of range"));
                        }
                    }
                    TreeNode::Leaf { probs } => {
                        if probs.len() != self.n_classes {
                            return Err(format!(
                                "tree {ti} node {ni} leaf has {} probs, expected {}",
                                probs.len(),
                                self.n_classes
                            ));
                        }
                    }
                }
            }
            // Every input must reach a leaf
            if tree.leaf_for(&[0.0; NUM_FEATURES]).is_none() {
                return Err(format!("tree {ti} does not terminate"));
            }
        }
        if let Some(cal) = &self.calibration {
            if cal.len() != self.n_classes {
                return Err(format!(
                    "calibration has {} entries, expected {}",
                    cal.len(),
                    self.n_classes
                ));
            }
        }
        Ok(())
    }

    /// Class probability vector for a scaled feature vector
    pub fn predict_proba(&self, x: &[f64; NUM_FEATURES]) -> Vec<f64> {
        let mut acc = vec![0.0f64; self.n_classes];
        let mut voters = 0usize;

        for tree in &self.trees {
            if let Some(leaf) = tree.leaf_for(x) {
                for (a, p) in acc.iter_mut().zip(leaf.iter()) {
                    *a += p;
                }
                voters += 1;
            }
        }

        if voters == 0 {
            return uniform(self.n_classes);
        }
        for a in acc.iter_mut() {
            *a /= voters as f64;
        }

        if let Some(cal) = &self.calibration {
            for (a, c) in acc.iter_mut().zip(cal.iter()) {
                *a = c.apply(*a);
            }
            normalize(&mut acc);
        }

        acc
    }
}

fn uniform(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

fn normalize(probs: &mut [f64]) {
    let sum: f64 = probs.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    } else {
        let n = probs.len();
        probs.copy_from_slice(&uniform(n));
    }
}
