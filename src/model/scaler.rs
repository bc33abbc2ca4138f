//! Standard scaler artifact
//!
//! Per-feature affine transform fitted at training time: subtract the mean,
//! divide by the standard deviation.

use serde::{Deserialize, Serialize};

use crate::features::NUM_FEATURES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Validate shape against the feature contract
    pub fn validate(&self) -> Result<(), String> {
        if self.mean.len() != NUM_FEATURES {
            return Err(format!(
                "scaler mean has {} entries, expected {NUM_FEATURES}",
                self.mean.len()
            ));
        }
        if self.scale.len() != NUM_FEATURES {
            return Err(format!(
                "scaler scale has {} entries, expected {NUM_FEATURES}",
                self.scale.len()
            ));
        }
        if self.mean.iter().chain(self.scale.iter()).any(|v| !v.is_finite()) {
            return Err("scaler contains non-finite values".into());
        }
        Ok(())
    }

    /// Apply the transform. A zero or negative scale entry divides by 1
    /// (constant feature in training data).
    pub fn transform(&self, x: &[f64; NUM_FEATURES]) -> [f64; NUM_FEATURES] {
        let mut out = [0.0; NUM_FEATURES];
        for i in 0..NUM_FEATURES {
            let scale = if self.scale[i] > 0.0 { self.scale[i] } else { 1.0 };
            out[i] = (x[i] - self.mean[i]) / scale;
        }
        out
    }

    /// Identity scaler (testing and degenerate artifacts)
    pub fn identity() -> Self {
        Self {
            mean: vec![0.0; NUM_FEATURES],
            scale: vec![1.0; NUM_FEATURES],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let scaler = StandardScaler::identity();
        scaler.validate().unwrap();
        let x = [2.5; NUM_FEATURES];
        assert_eq!(scaler.transform(&x), x);
    }

    #[test]
    fn test_transform_applies_mean_and_scale() {
        let mut scaler = StandardScaler::identity();
        scaler.mean[0] = 10.0;
        scaler.scale[0] = 2.0;
        let mut x = [0.0; NUM_FEATURES];
        x[0] = 14.0;
        assert_eq!(scaler.transform(&x)[0], 2.0);
    }

    #[test]
    fn test_zero_scale_guard() {
        let mut scaler = StandardScaler::identity();
        scaler.scale[3] = 0.0;
        let mut x = [0.0; NUM_FEATURES];
        x[3] = 7.0;
        // Divides by 1, not 0
        assert_eq!(scaler.transform(&x)[3], 7.0);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let scaler = StandardScaler {
            mean: vec![0.0; 5],
            scale: vec![1.0; NUM_FEATURES],
        };
        assert!(scaler.validate().is_err());
    }
}
