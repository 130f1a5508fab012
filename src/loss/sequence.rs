//! Sequence losses over per-column DP kernels: `ctc`, `ctc2`, `hmm`,
//! `viterbi` and `inv`.

use crate::alignment::ctc::ctc_forward_backward;
use crate::alignment::decode::collapse_repeats;
use crate::alignment::frame_align::align_frames;
use crate::alignment::inv_align::inv_align;
use crate::alignment::two_state::two_state_forward_backward;
use crate::alignment::{column_rows, column_rows_map, SequencePosterior};
use crate::error::LossError;
use crate::host::{to_frames, zeros_like_frames, Frames};
use crate::loss::{
    class_sum_tensor, grad_tensor, one_hot, scalar, softmax_cross_entropy, LossInput,
};
use crate::numeric::{log_sum_exp, safe_ln, HMM_PRIOR_FLOOR};
use crate::types::{GradTarget, GradientOverrides, LossOutput};

/// Sum of per-sequence posteriors turned into a loss with the explicit
/// gradient `y - occupancy` and the per-class occupancy total.
///
/// `frames[b]` lists the frames sequence `b` was scored on, in order; row `k`
/// of its occupancy belongs to frame `frames[b][k]`.
fn posterior_loss(
    input: &LossInput<'_>,
    probs: &Frames,
    frames: &[Vec<usize>],
    posteriors: Vec<SequencePosterior>,
) -> Result<LossOutput, LossError> {
    let (time, batch, n_out) = (input.source_mask.time(), input.source_mask.batch(), input.n_out());
    let mut grad = zeros_like_frames(time, batch, n_out);
    let mut occupancy_sum = vec![0.0f32; n_out];
    let mut total = 0.0f32;
    for (b, posterior) in posteriors.into_iter().enumerate() {
        total += posterior.nll;
        for (&t, occ_row) in frames[b].iter().zip(&posterior.occupancy) {
            for c in 0..n_out {
                let occ = occ_row[c];
                grad[t][b][c] = probs[t][b][c] - occ;
                occupancy_sum[c] += occ;
            }
        }
    }
    let device = input.device();
    let known = GradientOverrides::new().with(GradTarget::Scores, grad_tensor(&grad, device)?);
    let mut output = LossOutput::with_grads(scalar(total, device)?, known);
    output.class_occupancy = Some(class_sum_tensor(&occupancy_sum, device)?);
    Ok(output)
}

fn leading_frames(lengths: &[usize]) -> Vec<Vec<usize>> {
    lengths.iter().map(|&len| (0..len).collect()).collect()
}

/// CTC over the blank-augmented reference of every sequence.
pub fn ctc(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let sequences = input.label_sequences("ctc")?;
    let probs = to_frames(input.probs)?;
    let lengths = input.source_mask.lengths();
    check_batch(&sequences, &lengths, "ctc")?;
    let blank = input.config.blank();
    let posteriors = sequences
        .iter()
        .enumerate()
        .map(|(b, labels)| {
            let log_probs = column_rows_map(&probs, b, lengths[b], safe_ln);
            ctc_forward_backward(&log_probs, labels, blank)
        })
        .collect::<Result<Vec<_>, _>>()?;
    posterior_loss(input, &probs, &leading_frames(&lengths), posteriors)
}

/// Two-state HMM forward-backward, optionally dividing emissions by the
/// scaled prior.
pub fn hmm(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let sequences = input.label_sequences("hmm")?;
    let probs = to_frames(input.probs)?;
    let lengths = input.source_mask.lengths();
    check_batch(&sequences, &lengths, "hmm")?;
    let log_emissions = hmm_log_emissions(input, &probs)?;
    let posteriors = sequences
        .iter()
        .enumerate()
        .map(|(b, labels)| {
            let rows = column_rows(&log_emissions, b, lengths[b]);
            two_state_forward_backward(&rows, labels, input.transitions)
        })
        .collect::<Result<Vec<_>, _>>()?;
    posterior_loss(input, &probs, &leading_frames(&lengths), posteriors)
}

/// `ln(p) - prior_scale * ln(max(prior, 1e-10))` with `compute_priors`,
/// plain `ln(p)` otherwise.
pub(crate) fn hmm_log_emissions(input: &LossInput<'_>, probs: &Frames) -> Result<Frames, LossError> {
    let bias: Option<Vec<f32>> = match (input.config.priors.compute_priors, input.prior.priors) {
        (true, Some(priors)) => Some(
            priors
                .iter()
                .map(|&p| input.config.prior_scale * p.max(HMM_PRIOR_FLOOR).ln())
                .collect(),
        ),
        (true, None) => {
            return Err(LossError::config("hmm with compute_priors needs a prior estimate"))
        }
        (false, _) => None,
    };
    Ok(probs
        .iter()
        .map(|frame| {
            frame
                .iter()
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .map(|(c, &p)| safe_ln(p) - bias.as_ref().map_or(0.0, |bias| bias[c]))
                        .collect()
                })
                .collect()
        })
        .collect())
}

/// CTC on framewise labels: every column's valid labels are collapsed into
/// a sequence and scored under a per-frame log-softmax. Frames outside the
/// loss mask are skipped for both the labels and the scores.
pub fn ctc2(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let labels = input.dense_labels("ctc2")?;
    let scores = to_frames(input.scores)?;
    let mask = input.loss_mask;
    let blank = input.config.blank();
    let log_softmax: Frames = scores
        .iter()
        .map(|frame| {
            frame
                .iter()
                .map(|row| {
                    let lse = log_sum_exp(row);
                    row.iter().map(|&z| z - lse).collect()
                })
                .collect()
        })
        .collect();
    let probs: Frames = log_softmax
        .iter()
        .map(|frame| frame.iter().map(|row| row.iter().map(|lp| lp.exp()).collect()).collect())
        .collect();
    let frames: Vec<Vec<usize>> = (0..mask.batch())
        .map(|b| (0..mask.time()).filter(|&t| mask.get(t, b)).collect())
        .collect();
    let posteriors = frames
        .iter()
        .enumerate()
        .map(|(b, column)| {
            let framewise: Vec<usize> = column.iter().map(|&t| labels.get(t, b) as usize).collect();
            let target: Vec<usize> = collapse_repeats(&framewise)
                .into_iter()
                .filter(|&l| l != blank)
                .collect();
            let rows: Vec<Vec<f32>> = column.iter().map(|&t| log_softmax[t][b].clone()).collect();
            ctc_forward_backward(&rows, &target, blank)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut output = posterior_loss(input, &probs, &frames, posteriors)?;
    output.class_occupancy = None;
    Ok(output)
}

/// `-log` costs for the alignment losses, optionally prior-corrected.
fn alignment_costs(input: &LossInput<'_>, with_prior: bool) -> Result<Frames, LossError> {
    let probs = to_frames(input.probs)?;
    let bias = if with_prior {
        input.scaled_log_prior()
    } else {
        None
    };
    Ok(probs
        .iter()
        .map(|frame| {
            frame
                .iter()
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .map(|(c, &p)| {
                            -(safe_ln(p) - bias.as_ref().map_or(0.0, |bias| bias[c]))
                        })
                        .collect()
                })
                .collect()
        })
        .collect())
}

/// Hard Viterbi path of every sequence, one label per valid frame.
pub(crate) fn viterbi_paths(input: &LossInput<'_>) -> Result<Vec<Vec<usize>>, LossError> {
    let sequences = input.label_sequences("viterbi")?;
    let lengths = input.source_mask.lengths();
    check_batch(&sequences, &lengths, "viterbi")?;
    let costs = alignment_costs(input, true)?;
    sequences
        .iter()
        .enumerate()
        .map(|(b, labels)| align_frames(&column_rows(&costs, b, lengths[b]), labels))
        .collect()
}

/// Hard alignment followed by framewise cross-entropy against it.
pub fn viterbi(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let paths = viterbi_paths(input)?;
    let mask = input.source_mask;
    let onehot = one_hot(mask.time(), mask.batch(), input.n_out(), input.device(), |t, b| {
        paths[b].get(t).copied()
    })?;
    let mut output = LossOutput::new(softmax_cross_entropy(input.scores, &onehot)?);
    output.alignment = Some(onehot);
    Ok(output)
}

/// Sparse alignment; only claimed frames enter the cross-entropy.
pub fn inv(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let sequences = input.label_sequences("inv")?;
    let lengths = input.source_mask.lengths();
    check_batch(&sequences, &lengths, "inv")?;
    let costs = alignment_costs(input, false)?;
    let penalties = &input.config.sequence.inv_penalties;
    let paths = sequences
        .iter()
        .enumerate()
        .map(|(b, labels)| inv_align(&column_rows(&costs, b, lengths[b]), labels, penalties))
        .collect::<Result<Vec<_>, _>>()?;
    let claimed: usize = paths.iter().map(|p| p.iter().flatten().count()).sum();
    tracing::debug!(claimed, frames = input.source_mask.count(), "inv alignment");
    let mask = input.source_mask;
    let onehot = one_hot(mask.time(), mask.batch(), input.n_out(), input.device(), |t, b| {
        paths[b].get(t).copied().flatten()
    })?;
    Ok(LossOutput::new(softmax_cross_entropy(input.scores, &onehot)?))
}

fn check_batch(
    sequences: &[Vec<usize>],
    lengths: &[usize],
    context: &'static str,
) -> Result<(), LossError> {
    if sequences.len() != lengths.len() {
        return Err(LossError::shape(
            context,
            format!("{} label sequences for {} score columns", sequences.len(), lengths.len()),
        ));
    }
    Ok(())
}
