//! Label prior state: running estimates, loaded priors, trainable softmax
//! priors and the loop/forward distortion estimate of the two-state HMM.

use std::path::Path;

use crate::alignment::two_state::Transitions;
use crate::config::PriorConfig;
use crate::error::LossError;
use crate::host::Frames;
use crate::numeric::{safe_ln, softmax_row, PROB_FLOOR};
use crate::types::{DenseLabels, ValidityMask};

/// Reads a whitespace separated `+log` prior vector of exactly `n_out` values.
pub fn load_log_prior(path: &Path, n_out: usize) -> Result<Vec<f32>, LossError> {
    let text = std::fs::read_to_string(path).map_err(|e| LossError::io("read log prior", e))?;
    let values = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f32>().map_err(|e| {
                LossError::config(format!("log prior {}: bad value '{tok}': {e}", path.display()))
            })
        })
        .collect::<Result<Vec<f32>, LossError>>()?;
    if values.len() != n_out {
        return Err(LossError::config(format!(
            "log prior {} has {} values, expected {n_out}",
            path.display(),
            values.len()
        )));
    }
    Ok(values)
}

fn normalize(values: &mut [f32]) {
    let total: f32 = values.iter().sum();
    if total > 0.0 && total.is_finite() {
        values.iter_mut().for_each(|v| *v /= total);
    }
}

/// Running per-class prior in probability space.
#[derive(Debug, Clone)]
pub struct PriorEstimator {
    config: PriorConfig,
    priors: Vec<f32>,
    accumulated: Vec<f32>,
    accumulated_batches: usize,
}

impl PriorEstimator {
    /// Starts from the uniform distribution.
    pub fn new(n_out: usize, config: PriorConfig) -> Self {
        Self {
            config,
            priors: vec![1.0 / n_out as f32; n_out],
            accumulated: vec![0.0; n_out],
            accumulated_batches: 0,
        }
    }

    pub fn from_log_prior(log_prior: &[f32], config: PriorConfig) -> Self {
        let mut estimator = Self::new(log_prior.len(), config);
        estimator.priors = log_prior.iter().map(|lp| lp.exp()).collect();
        estimator
    }

    pub fn n_out(&self) -> usize {
        self.priors.len()
    }

    pub fn priors(&self) -> &[f32] {
        &self.priors
    }

    /// `ln(max(p, 1e-20))`.
    pub fn log_prior(&self) -> Vec<f32> {
        self.priors.iter().map(|&p| p.max(PROB_FLOOR).ln()).collect()
    }

    /// Mean class distribution of one step: network output over the valid
    /// cells, or one-hot reference labels while `epoch <= use_label_priors`.
    pub fn batch_statistic(
        &self,
        probs: &Frames,
        mask: &ValidityMask,
        labels: Option<&DenseLabels>,
        epoch: u32,
    ) -> Vec<f32> {
        let n_out = self.n_out();
        let mut sum = vec![0.0f32; n_out];
        let mut count = 0usize;
        let use_labels = self.config.use_label_priors > 0 && epoch <= self.config.use_label_priors;
        match labels {
            Some(labels) if use_labels => {
                for (t, b) in mask.valid_cells() {
                    if t >= labels.time() || b >= labels.batch() {
                        continue;
                    }
                    let label = labels.get(t, b) as usize;
                    if label < n_out {
                        sum[label] += 1.0;
                        count += 1;
                    }
                }
            }
            _ => {
                for (t, b) in mask.valid_cells() {
                    for (acc, &p) in sum.iter_mut().zip(&probs[t][b]) {
                        *acc += p;
                    }
                    count += 1;
                }
            }
        }
        if count == 0 {
            tracing::warn!("prior statistic over an empty cell set");
            return self.priors.clone();
        }
        sum.iter_mut().for_each(|v| *v /= count as f32);
        sum
    }

    /// Folds one step statistic into the prior. Returns whether the prior
    /// changed (accumulation may defer the update).
    pub fn update(&mut self, statistic: &[f32]) -> Result<bool, LossError> {
        if statistic.len() != self.n_out() {
            return Err(LossError::shape(
                "prior update",
                format!("{} values for {} classes", statistic.len(), self.n_out()),
            ));
        }
        let statistic = match self.config.accumulate_batches {
            Some(k) if k > 1 => {
                for (acc, &v) in self.accumulated.iter_mut().zip(statistic) {
                    *acc += v;
                }
                self.accumulated_batches += 1;
                if self.accumulated_batches < k {
                    return Ok(false);
                }
                let n = self.accumulated_batches as f32;
                let mean: Vec<f32> = self.accumulated.iter().map(|v| v / n).collect();
                self.accumulated.fill(0.0);
                self.accumulated_batches = 0;
                mean
            }
            _ => statistic.to_vec(),
        };

        if self.config.exp_average > 0.0 {
            let alpha = (1.0 / self.config.exp_average).min(1.0);
            for (p, &v) in self.priors.iter_mut().zip(&statistic) {
                *p = (1.0 - alpha) * *p + alpha * v;
            }
        } else {
            self.priors.copy_from_slice(&statistic);
        }
        normalize(&mut self.priors);
        tracing::debug!(
            exp_average = self.config.exp_average,
            max_prior = self.priors.iter().copied().fold(0.0f32, f32::max),
            "prior updated"
        );
        Ok(true)
    }
}

/// Prior learned through a softmax over free logits.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedSoftmaxPrior {
    logits: Vec<f32>,
}

impl TrainedSoftmaxPrior {
    /// Zero logits (uniform prior) unless a `+log` prior seeds them.
    pub fn new(n_out: usize, init: Option<&[f32]>) -> Result<Self, LossError> {
        let logits = match init {
            Some(lp) if lp.len() != n_out => {
                return Err(LossError::config(format!(
                    "trained prior seed has {} values, expected {n_out}",
                    lp.len()
                )))
            }
            Some(lp) => lp.to_vec(),
            None => vec![0.0; n_out],
        };
        Ok(Self { logits })
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn priors(&self) -> Vec<f32> {
        softmax_row(&self.logits)
    }

    pub fn log_prior(&self) -> Vec<f32> {
        self.priors().into_iter().map(safe_ln).collect()
    }

    /// Plain SGD step on the logits.
    pub fn apply_gradient(&mut self, grad: &[f32], learning_rate: f32) -> Result<(), LossError> {
        if grad.len() != self.logits.len() {
            return Err(LossError::shape(
                "trained prior gradient",
                format!("{} values for {} logits", grad.len(), self.logits.len()),
            ));
        }
        for (w, g) in self.logits.iter_mut().zip(grad) {
            *w -= learning_rate * g;
        }
        Ok(())
    }
}

/// Loop/forward probabilities of the two-state HMM, re-estimated from the
/// network output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distortions {
    pub self_loop: f32,
    pub forward: f32,
}

impl Default for Distortions {
    fn default() -> Self {
        Self {
            self_loop: 0.5,
            forward: 0.5,
        }
    }
}

impl Distortions {
    /// Mean of `sum_c p[t][c] * p[t+1][c]` over consecutive valid frames of
    /// the same sequence. `None` when no such pair exists.
    pub fn estimate_loop(probs: &Frames, mask: &ValidityMask) -> Option<f32> {
        let mut total = 0.0f32;
        let mut pairs = 0usize;
        for b in 0..mask.batch() {
            for t in 1..mask.time() {
                if mask.get(t - 1, b) && mask.get(t, b) {
                    total += probs[t - 1][b]
                        .iter()
                        .zip(&probs[t][b])
                        .map(|(a, c)| a * c)
                        .sum::<f32>();
                    pairs += 1;
                }
            }
        }
        (pairs > 0).then(|| total / pairs as f32)
    }

    pub fn update(&mut self, probs: &Frames, mask: &ValidityMask) {
        if let Some(self_loop) = Self::estimate_loop(probs, mask) {
            self.self_loop = self_loop;
            self.forward = 1.0 - self_loop;
        }
    }

    pub fn transitions(&self) -> Transitions {
        Transitions {
            self_loop: safe_ln(self.self_loop),
            forward: safe_ln(self.forward),
        }
    }
}
