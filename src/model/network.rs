//! Feed-forward network artifact
//!
//! Dense layers with relu hidden activations and a softmax head, stored as
//! plain weight matrices. Inference is a straightforward forward pass in
//! double precision.

use serde::{Deserialize, Serialize};

use crate::features::NUM_FEATURES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Softmax,
    Linear,
}

/// One dense layer; `weights[out][in]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: Activation,
}

impl DenseLayer {
    fn output_dim(&self) -> usize {
        self.weights.len()
    }

    fn input_dim(&self) -> usize {
        self.weights.first().map(|row| row.len()).unwrap_or(0)
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        let mut out: Vec<f64> = self
            .weights
            .iter()
            .zip(self.bias.iter())
            .map(|(row, b)| row.iter().zip(input.iter()).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect();

        match self.activation {
            Activation::Relu => {
                for v in out.iter_mut() {
                    if *v < 0.0 {
                        *v = 0.0;
                    }
                }
            }
            Activation::Softmax => softmax(&mut out),
            Activation::Linear => {}
        }
        out
    }
}

/// Numerically stable softmax
fn softmax(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 && sum.is_finite() {
        for v in values.iter_mut() {
            *v /= sum;
        }
    } else {
        let n = values.len() as f64;
        for v in values.iter_mut() {
            *v = 1.0 / n;
        }
    }
}

/// The frozen network artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForward {
    pub layers: Vec<DenseLayer>,
}

impl FeedForward {
    /// Validate dimensional consistency: 37 in, `expected_classes` out,
    /// consecutive layers chained, every row rectangular.
    pub fn validate(&self, expected_classes: usize) -> Result<(), String> {
        if self.layers.is_empty() {
            return Err("network has no layers".into());
        }

        let mut dim = NUM_FEATURES;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.input_dim() != dim {
                return Err(format!(
                    "layer {i} expects input {} but receives {dim}",
                    layer.input_dim()
                ));
            }
            if layer.weights.iter().any(|row| row.len() != layer.input_dim()) {
                return Err(format!("layer {i} weight matrix is not rectangular"));
            }
            if layer.bias.len() != layer.output_dim() {
                return Err(format!(
                    "layer {i} has {} biases for {} outputs",
                    layer.bias.len(),
                    layer.output_dim()
                ));
            }
            dim = layer.output_dim();
        }

        if dim != expected_classes {
            return Err(format!(
                "network outputs {dim} classes, class mapping has {expected_classes}"
            ));
        }
        Ok(())
    }

    /// Class probability vector for a scaled feature vector
    pub fn predict_proba(&self, x: &[f64; NUM_FEATURES]) -> Vec<f64> {
        let mut current: Vec<f64> = x.to_vec();
        for layer in &self.layers {
            current = layer.forward(&current);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-layer net: class 0 favored when feature 0 is large
    fn tiny_net() -> FeedForward {
        let mut w0 = vec![0.0; NUM_FEATURES];
        w0[0] = 5.0;
        let w1 = vec![0.0; NUM_FEATURES];
        FeedForward {
            layers: vec![DenseLayer {
                weights: vec![w0, w1],
                bias: vec![0.0, 1.0],
                activation: Activation::Softmax,
            }],
        }
    }

    #[test]
    fn test_forward_pass_softmax() {
        let net = tiny_net();
        net.validate(2).unwrap();

        let mut x = [0.0; NUM_FEATURES];
        let p = net.predict_proba(&x);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        // bias favors class 1 at zero input
        assert!(p[1] > p[0]);

        x[0] = 10.0;
        let p = net.predict_proba(&x);
        assert!(p[0] > 0.99);
    }

    #[test]
    fn test_relu_hidden_layer() {
        let mut hidden_w = vec![vec![0.0; NUM_FEATURES]; 3];
        hidden_w[0][0] = -1.0; // clipped to zero by relu for positive input
        hidden_w[1][1] = 1.0;
        let net = FeedForward {
            layers: vec![
                DenseLayer {
                    weights: hidden_w,
                    bias: vec![0.0; 3],
                    activation: Activation::Relu,
                },
                DenseLayer {
                    weights: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
                    bias: vec![0.0, 0.0],
                    activation: Activation::Softmax,
                },
            ],
        };
        net.validate(2).unwrap();

        let mut x = [0.0; NUM_FEATURES];
        x[0] = 4.0;
        x[1] = 2.0;
        let p = net.predict_proba(&x);
        // Negative pre-activation was clipped, so class 1 wins
        assert!(p[1] > p[0]);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let net = tiny_net();
        assert!(net.validate(34).is_err());

        let bad = FeedForward {
            layers: vec![DenseLayer {
                weights: vec![vec![0.0; 5]],
                bias: vec![0.0],
                activation: Activation::Softmax,
            }],
        };
        assert!(bad.validate(1).is_err());
    }

    #[test]
    fn test_softmax_handles_extremes() {
        let mut values = vec![1000.0, -1000.0, 999.0];
        softmax(&mut values);
        assert!((values.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(values[0] > values[2]);
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
