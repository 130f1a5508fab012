use candle_core::{Tensor, D};

use crate::error::{tensor_err, LossError};
use crate::host::{to_frames, zeros_like_frames};
use crate::loss::{
    dense_one_hot, grad_tensor, mask3, scalar, softmax_cross_entropy, LossInput,
};
use crate::numeric::{softmax_row, CE_FLOOR, ENTROPY_CEIL, ENTROPY_FLOOR, PROB_CEIL};
use crate::types::{GradTarget, GradientOverrides, LossOutput, SparseTargets, Targets};

fn scale(loss: Tensor, norm: f32) -> Result<Tensor, LossError> {
    if norm == 1.0 {
        return Ok(loss);
    }
    loss.affine(f64::from(norm), 0.0)
        .map_err(tensor_err("loss norm"))
}

/// `-sum(targets * ln(clip(p, 1e-38, 1e20)))` over `mask`.
fn soft_cross_entropy(input: &LossInput<'_>, probs: &Tensor, soft: &Tensor) -> Result<Tensor, LossError> {
    let mask = mask3(input.loss_mask, input.device())?;
    probs
        .clamp(CE_FLOOR, PROB_CEIL)
        .and_then(|p| p.log())
        .and_then(|lp| lp.mul(soft))
        .and_then(|t| t.broadcast_mul(&mask))
        .and_then(|t| t.sum_all())
        .and_then(|t| t.neg())
        .map_err(tensor_err("soft-target cross-entropy"))
}

/// Framewise cross-entropy against dense, soft or sparse targets.
pub fn cross_entropy(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    if !input.config.apply_softmax {
        return identity_head_cross_entropy(input);
    }
    match input.targets {
        Targets::Dense(labels) => {
            let onehot = dense_one_hot(labels, input.loss_mask, input.n_out(), input.device())?;
            let loss = softmax_cross_entropy(input.scores, &onehot)?;
            Ok(LossOutput::new(scale(loss, input.norm)?))
        }
        Targets::Soft(soft) => {
            let loss = soft_cross_entropy(input, input.probs, soft)?;
            Ok(LossOutput::new(scale(loss, input.norm)?))
        }
        Targets::Sparse(sparse) => sparse_cross_entropy(input, sparse),
        Targets::None => Err(LossError::shape("ce", "cross-entropy needs a reference")),
    }
}

/// Alignment-free weighted targets. The gradient with respect to the scores
/// is `(sum_w) * softmax(z) - w` on every valid frame.
fn sparse_cross_entropy(input: &LossInput<'_>, sparse: &SparseTargets) -> Result<LossOutput, LossError> {
    let scores = to_frames(input.scores)?;
    let (time, batch, n_out) = (input.loss_mask.time(), input.loss_mask.batch(), input.n_out());
    if sparse.batch() != batch || sparse.time() > time {
        return Err(LossError::shape(
            "sparse ce",
            format!(
                "sparse targets {}x{} for {time}x{batch} scores",
                sparse.time(),
                sparse.batch()
            ),
        ));
    }
    sparse.check_range(n_out)?;

    let mut weights = zeros_like_frames(time, batch, n_out);
    for b in 0..batch {
        for entry in sparse.column(b) {
            weights[entry.time][b][entry.class] += entry.weight;
        }
    }
    let mut grad = zeros_like_frames(time, batch, n_out);
    let mut total = 0.0f32;
    for (t, b) in input.loss_mask.valid_cells() {
        let w = &weights[t][b];
        let w_sum: f32 = w.iter().sum();
        if w_sum == 0.0 {
            continue;
        }
        let p = softmax_row(&scores[t][b]);
        for c in 0..n_out {
            if w[c] != 0.0 {
                total -= w[c] * p[c].max(CE_FLOOR).ln();
            }
            grad[t][b][c] = w_sum * p[c] - w[c];
        }
    }
    let device = input.device();
    let known = GradientOverrides::new().with(GradTarget::Scores, grad_tensor(&grad, device)?);
    Ok(LossOutput::with_grads(scalar(input.norm * total, device)?, known))
}

/// `apply_softmax = false`: the head output is used as probabilities
/// directly and its gradient is `-onehot / p` on valid cells.
fn identity_head_cross_entropy(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let labels = input.dense_labels("ce")?;
    let probs = to_frames(input.probs)?;
    let (time, batch, n_out) = (input.loss_mask.time(), input.loss_mask.batch(), input.n_out());
    let mut grad = zeros_like_frames(time, batch, n_out);
    let mut nll = 0.0f32;
    for (t, b) in input.loss_mask.valid_cells() {
        let label = labels.get(t, b) as usize;
        let p = probs[t][b][label].clamp(CE_FLOOR, PROB_CEIL);
        nll -= p.ln();
        grad[t][b][label] = -1.0 / p;
    }
    let device = input.device();
    let known =
        GradientOverrides::new().with(GradTarget::Probabilities, grad_tensor(&grad, device)?);
    Ok(LossOutput::with_grads(scalar(input.norm * nll, device)?, known))
}

/// Cross-entropy on the prior-divided head output.
pub fn priori(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    match input.targets {
        Targets::Dense(labels) => {
            let onehot = dense_one_hot(labels, input.loss_mask, input.n_out(), input.device())?;
            let loss = soft_cross_entropy(input, input.probs, &onehot)?;
            Ok(LossOutput::new(scale(loss, input.norm)?))
        }
        Targets::Soft(soft) => {
            let loss = soft_cross_entropy(input, input.probs, soft)?;
            Ok(LossOutput::new(scale(loss, input.norm)?))
        }
        _ => Err(LossError::shape("priori", "dense or soft targets are required")),
    }
}

/// Squared error of the identity head. Integer labels: mean over
/// `cells x classes` against one-hot. Real targets: per-cell class mean,
/// summed over cells.
pub fn sse(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let device = input.device();
    let mask = mask3(input.loss_mask, device)?;
    let n_out = input.n_out() as f64;
    match input.targets {
        Targets::Dense(labels) => {
            let onehot = dense_one_hot(labels, input.loss_mask, input.n_out(), device)?;
            let cells = input.loss_mask.count().max(1) as f64;
            let loss = input
                .probs
                .sub(&onehot)
                .and_then(|d| d.broadcast_mul(&mask))
                .and_then(|d| d.sqr())
                .and_then(|d| d.sum_all())
                .and_then(|s| s.affine(1.0 / (cells * n_out), 0.0))
                .map_err(tensor_err("sse"))?;
            Ok(LossOutput::new(loss))
        }
        Targets::Soft(soft) => {
            let loss = input
                .probs
                .sub(soft)
                .and_then(|d| d.broadcast_mul(&mask))
                .and_then(|d| d.sqr())
                .and_then(|d| d.sum_all())
                .and_then(|s| s.affine(1.0 / n_out, 0.0))
                .map_err(tensor_err("sse"))?;
            Ok(LossOutput::new(loss))
        }
        _ => Err(LossError::shape("sse", "dense or soft targets are required")),
    }
}

/// Per sequence: cross-entropy when the column holds any positive label,
/// otherwise the self-entropy of the clipped softmax output.
pub fn entropy(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let labels = input.dense_labels("entropy")?;
    let device = input.device();
    let (time, batch) = (input.loss_mask.time(), input.loss_mask.batch());
    let labelled: Vec<bool> = (0..batch)
        .map(|b| (0..time.min(labels.time())).any(|t| input.loss_mask.get(t, b) && labels.get(t, b) > 0))
        .collect();

    let mut ce_weight = vec![0.0f32; time * batch];
    let mut ee_weight = vec![0.0f32; time * batch];
    for (t, b) in input.loss_mask.valid_cells() {
        if labelled[b] {
            ce_weight[t * batch + b] = 1.0;
        } else {
            ee_weight[t * batch + b] = 1.0;
        }
    }
    let to_tensor = |w: Vec<f32>| {
        Tensor::from_vec(w, (time, batch, 1), device).map_err(tensor_err("entropy weights"))
    };
    let ce_weight = to_tensor(ce_weight)?;
    let ee_weight = to_tensor(ee_weight)?;

    let onehot = dense_one_hot(labels, input.loss_mask, input.n_out(), device)?
        .broadcast_mul(&ce_weight)
        .map_err(tensor_err("entropy one-hot"))?;
    let ce = softmax_cross_entropy(input.scores, &onehot)?;
    let ee = candle_nn::ops::softmax(input.scores, D::Minus1)
        .and_then(|p| p.clamp(ENTROPY_FLOOR, ENTROPY_CEIL))
        .and_then(|p| p.log().and_then(|lp| lp.mul(&p)))
        .and_then(|t| t.broadcast_mul(&ee_weight))
        .and_then(|t| t.sum_all())
        .and_then(|t| t.neg())
        .map_err(tensor_err("self entropy"))?;
    let loss = (ce + ee).map_err(tensor_err("entropy sum"))?;
    Ok(LossOutput::new(loss))
}

/// Plain framewise softmax cross-entropy, without the time-limit norm.
pub fn ce_ctc(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let labels = input.dense_labels("ce_ctc")?;
    let onehot = dense_one_hot(labels, input.loss_mask, input.n_out(), input.device())?;
    Ok(LossOutput::new(softmax_cross_entropy(input.scores, &onehot)?))
}
