//! Probability head: scores to probabilities, optionally reweighted by a prior.

use candle_core::{Tensor, D};

use crate::config::OutputActivation;
use crate::error::{tensor_err, LossError};
use crate::numeric::{PROB_CEIL, PROB_FLOOR};

/// Applies `activation` over the class axis. Stays differentiable.
pub fn activate(scores: &Tensor, activation: OutputActivation) -> Result<Tensor, LossError> {
    let out = match activation {
        OutputActivation::Softmax => candle_nn::ops::softmax(scores, D::Minus1),
        OutputActivation::Sigmoid => sigmoid(scores),
        OutputActivation::Exp => scores.exp(),
        OutputActivation::Gauss => scores.sqr().and_then(|s| s.neg()).and_then(|s| s.exp()),
        OutputActivation::Identity => Ok(scores.clone()),
    };
    out.map_err(tensor_err("activate"))
}

pub(crate) fn sigmoid(scores: &Tensor) -> candle_core::Result<Tensor> {
    (scores.neg()?.exp()? + 1.0)?.recip()
}

/// `ln(clip(p, 1e-20, 1e20))`.
pub fn clipped_log(probs: &Tensor) -> Result<Tensor, LossError> {
    probs
        .clamp(PROB_FLOOR, PROB_CEIL)
        .and_then(|p| p.log())
        .map_err(tensor_err("clipped log"))
}

/// `exp(ln(p) - scale * log_prior)`, left unnormalized.
pub fn subtract_prior(probs: &Tensor, log_prior: &Tensor, scale: f32) -> Result<Tensor, LossError> {
    let log_out = clipped_log(probs)?;
    log_prior
        .affine(f64::from(scale), 0.0)
        .and_then(|bias| log_out.broadcast_sub(&bias))
        .and_then(|t| t.exp())
        .map_err(tensor_err("subtract prior"))
}

/// Divides every frame by a per-class vector.
pub fn divide_by_classes(probs: &Tensor, per_class: &Tensor) -> Result<Tensor, LossError> {
    probs
        .broadcast_div(per_class)
        .map_err(tensor_err("priori division"))
}

/// Head configuration resolved from the layer config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityHead {
    pub activation: OutputActivation,
    pub smoothing: f32,
}

impl ProbabilityHead {
    pub fn new(activation: OutputActivation, smoothing: f32) -> Self {
        Self {
            activation,
            smoothing,
        }
    }

    /// Scores after the smoothing factor.
    pub fn scale_scores(&self, scores: &Tensor) -> Result<Tensor, LossError> {
        if self.smoothing == 1.0 {
            return Ok(scores.clone());
        }
        scores
            .affine(f64::from(self.smoothing), 0.0)
            .map_err(tensor_err("softmax smoothing"))
    }

    pub fn forward(&self, scaled_scores: &Tensor) -> Result<Tensor, LossError> {
        activate(scaled_scores, self.activation)
    }
}
