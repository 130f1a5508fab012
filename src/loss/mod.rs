//! One handler per [`LossKind`]. Every handler returns a [`LossOutput`]: a
//! differentiable scalar when candle can derive the gradient, otherwise a
//! detached scalar plus explicit gradients.

pub mod external;
pub mod fast_bw;
pub mod framewise;
pub mod sequence;

use candle_core::{Device, Tensor};

use crate::alignment::two_state::Transitions;
use crate::config::{LossKind, OutputLayerConfig};
use crate::error::{tensor_err, LossError};
use crate::host::Frames;
use crate::layer::schedule::StepAlignments;
use crate::layer::traits::{AutomatonProvider, ExternalLossDelegate};
use crate::types::{DenseLabels, LossOutput, Targets, ValidityMask};

/// Prior state visible to a loss evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorView<'a> {
    /// `+log` prior (running, loaded or trained).
    pub log_prior: Option<&'a [f32]>,
    /// Prior in probability space.
    pub priors: Option<&'a [f32]>,
    /// The prior is a trained softmax whose logits take an explicit gradient.
    pub trained: bool,
}

/// Everything a loss handler reads for one step.
pub struct LossInput<'a> {
    pub config: &'a OutputLayerConfig,
    /// Scores after time limiting and smoothing, `[time, batch, class]`.
    pub scores: &'a Tensor,
    /// Head output for `scores`.
    pub probs: &'a Tensor,
    pub targets: &'a Targets,
    /// Cells entering framewise reductions.
    pub loss_mask: &'a ValidityMask,
    /// Frames owned by each sequence.
    pub source_mask: &'a ValidityMask,
    pub norm: f32,
    pub prior: PriorView<'a>,
    pub transitions: Transitions,
    pub automaton_provider: Option<&'a dyn AutomatonProvider>,
    pub delegate: Option<&'a dyn ExternalLossDelegate>,
    pub alignments: &'a StepAlignments,
    pub tags: &'a [String],
}

impl<'a> LossInput<'a> {
    pub fn device(&self) -> &Device {
        self.scores.device()
    }

    pub fn n_out(&self) -> usize {
        self.config.n_out
    }

    pub(crate) fn dense_labels(&self, context: &'static str) -> Result<&'a DenseLabels, LossError> {
        match self.targets {
            Targets::Dense(labels) => Ok(labels),
            _ => Err(LossError::shape(
                context,
                "integer reference labels are required",
            )),
        }
    }

    /// Reference label list of every sequence.
    pub(crate) fn label_sequences(&self, context: &'static str) -> Result<Vec<Vec<usize>>, LossError> {
        Ok(self.dense_labels(context)?.sequences())
    }

    pub(crate) fn tags_or_default(&self) -> Vec<String> {
        let batch = self.source_mask.batch();
        if self.tags.len() == batch {
            return self.tags.to_vec();
        }
        (0..batch).map(|b| format!("seq-{b}")).collect()
    }

    /// `+log` prior scaled by `prior_scale`, when a scale is active.
    pub(crate) fn scaled_log_prior(&self) -> Option<Vec<f32>> {
        let scale = self.config.prior_scale;
        if scale == 0.0 {
            return None;
        }
        self.prior
            .log_prior
            .map(|lp| lp.iter().map(|v| v * scale).collect())
    }
}

pub fn compute_loss(input: &LossInput<'_>) -> Result<Option<LossOutput>, LossError> {
    let kind = input.config.loss;
    let output = match kind {
        LossKind::None => return Ok(None),
        LossKind::Ce => framewise::cross_entropy(input)?,
        LossKind::Priori => framewise::priori(input)?,
        LossKind::Sse => framewise::sse(input)?,
        LossKind::Entropy => framewise::entropy(input)?,
        LossKind::CeCtc => framewise::ce_ctc(input)?,
        LossKind::Ctc => sequence::ctc(input)?,
        LossKind::Ctc2 => sequence::ctc2(input)?,
        LossKind::Hmm => sequence::hmm(input)?,
        LossKind::Viterbi => sequence::viterbi(input)?,
        LossKind::Inv => sequence::inv(input)?,
        LossKind::FastBw => fast_bw::fast_bw(input)?,
        LossKind::Sprint => external::sprint(input)?,
        LossKind::WarpCtc => external::warp_ctc(input)?,
    };
    let value = output.value()?;
    if !value.is_finite() {
        return Err(LossError::degenerate(
            "loss",
            format!("{kind} loss evaluated to {value}"),
        ));
    }
    tracing::debug!(
        layer = %input.config.name,
        loss = %kind,
        value,
        norm = input.norm,
        explicit_grads = output.known_grads.len(),
        "loss computed"
    );
    Ok(Some(output))
}

pub(crate) fn scalar(value: f32, device: &Device) -> Result<Tensor, LossError> {
    Tensor::new(value, device).map_err(tensor_err("scalar loss"))
}

/// `[time, batch, 1]` float mask for broadcasting over classes.
pub(crate) fn mask3(mask: &ValidityMask, device: &Device) -> Result<Tensor, LossError> {
    mask.to_tensor(device)?
        .unsqueeze(2)
        .map_err(tensor_err("mask unsqueeze"))
}

/// One-hot `[time, batch, class]` tensor; cells where `label_at` is `None`
/// stay zero.
pub(crate) fn one_hot(
    time: usize,
    batch: usize,
    n_out: usize,
    device: &Device,
    label_at: impl Fn(usize, usize) -> Option<usize>,
) -> Result<Tensor, LossError> {
    let mut data = vec![0.0f32; time * batch * n_out];
    for t in 0..time {
        for b in 0..batch {
            if let Some(label) = label_at(t, b) {
                if label >= n_out {
                    return Err(LossError::shape(
                        "one-hot",
                        format!("label {label} at ({t}, {b}) out of range for {n_out} classes"),
                    ));
                }
                data[(t * batch + b) * n_out + label] = 1.0;
            }
        }
    }
    Tensor::from_vec(data, (time, batch, n_out), device).map_err(tensor_err("one-hot"))
}

/// One-hot of framewise dense labels restricted to `mask`.
pub(crate) fn dense_one_hot(
    labels: &DenseLabels,
    mask: &ValidityMask,
    n_out: usize,
    device: &Device,
) -> Result<Tensor, LossError> {
    one_hot(mask.time(), mask.batch(), n_out, device, |t, b| {
        (mask.get(t, b) && t < labels.time()).then(|| labels.get(t, b) as usize)
    })
}

/// Sum over the class axis of `-log_softmax(scores) * weights`.
pub(crate) fn softmax_cross_entropy(scores: &Tensor, weights: &Tensor) -> Result<Tensor, LossError> {
    candle_nn::ops::log_softmax(scores, candle_core::D::Minus1)
        .and_then(|lp| lp.mul(weights))
        .and_then(|t| t.sum_all())
        .and_then(|t| t.neg())
        .map_err(tensor_err("softmax cross-entropy"))
}

/// Host gradient frames as a tensor on `device`.
pub(crate) fn grad_tensor(frames: &Frames, device: &Device) -> Result<Tensor, LossError> {
    crate::host::from_frames(frames, device)
}

pub(crate) fn class_sum_tensor(occupancy: &[f32], device: &Device) -> Result<Tensor, LossError> {
    Tensor::new(occupancy, device).map_err(tensor_err("class occupancy"))
}
