//! Losses whose value and score gradient come from an [`ExternalLossDelegate`].

use crate::error::LossError;
use crate::host::{to_frames, Frames};
use crate::layer::traits::{DelegateRequest, DelegateResponse, ExternalLossDelegate};
use crate::loss::{grad_tensor, scalar, LossInput};
use crate::numeric::{clip, log_sum_exp, safe_ln};
use crate::types::{GradTarget, GradientOverrides, LossOutput};

/// Reference label lists padded with `-1` to a common length.
pub(crate) fn padded_labels(sequences: &[Vec<usize>]) -> Vec<Vec<i32>> {
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    sequences
        .iter()
        .map(|seq| {
            let mut row: Vec<i32> = seq.iter().map(|&l| l as i32).collect();
            row.resize(max_len, -1);
            row
        })
        .collect()
}

fn call_delegate(
    input: &LossInput<'_>,
    delegate: &dyn ExternalLossDelegate,
    log_posteriors: &Frames,
) -> Result<DelegateResponse, LossError> {
    let sequences = input.label_sequences(input.config.loss.as_str())?;
    let labels = padded_labels(&sequences);
    let lengths = input.source_mask.lengths();
    let tags = input.tags_or_default();
    let request = DelegateRequest {
        log_posteriors,
        seq_lengths: &lengths,
        tags: &tags,
        labels: &labels,
    };
    let response = delegate.loss_and_grad(&request)?;
    let (time, batch, n_out) = (input.source_mask.time(), lengths.len(), input.n_out());
    if response.losses.len() != batch {
        return Err(LossError::external(
            "loss delegate",
            format!(
                "{} returned {} losses for {batch} sequences",
                delegate.name(),
                response.losses.len()
            ),
        ));
    }
    let grad_ok = response.grad.len() == time
        && response
            .grad
            .iter()
            .all(|frame| frame.len() == batch && frame.iter().all(|row| row.len() == n_out));
    if !grad_ok {
        return Err(LossError::external(
            "loss delegate",
            format!(
                "{} returned a gradient not shaped [{time}, {batch}, {n_out}]",
                delegate.name()
            ),
        ));
    }
    tracing::debug!(
        delegate = delegate.name(),
        sequences = batch,
        "loss delegate answered"
    );
    Ok(response)
}

/// Delegate-scored sequence training on prior-corrected log posteriors,
/// optionally interpolated with framewise cross-entropy.
pub fn sprint(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let delegate = input
        .delegate
        .ok_or_else(|| LossError::config("loss 'sprint' needs a loss delegate"))?;
    let probs = to_frames(input.probs)?;
    let bias = input.scaled_log_prior();
    let log_probs: Frames = probs
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
        .collect();
    let DelegateResponse { losses, mut grad } = call_delegate(input, delegate, &log_probs)?;
    let mask = input.source_mask;
    let n_out = input.n_out();

    let mut err: f32 = losses.iter().sum();
    if input.config.sequence.loss_like_ce {
        err = 0.0;
        for (t, b) in mask.valid_cells() {
            for c in 0..n_out {
                let p = probs[t][b][c];
                err -= clip(p - grad[t][b][c], 0.0, 1.0) * safe_ln(p);
            }
        }
    }

    let s = input.config.sequence.ce_smoothing;
    if s > 0.0 {
        err *= 1.0 - s;
        for v in grad.iter_mut().flatten().flatten() {
            *v *= 1.0 - s;
        }
        let labels = input.dense_labels("sprint ce smoothing")?;
        let scores = to_frames(input.scores)?;
        for (t, b) in input.loss_mask.valid_cells() {
            let label = (t < labels.time())
                .then(|| labels.valid_label(t, b))
                .flatten()
                .map(|l| l as usize);
            let Some(label) = label else {
                continue;
            };
            if label >= n_out {
                return Err(LossError::shape(
                    "sprint ce smoothing",
                    format!("label {label} out of range for {n_out} classes"),
                ));
            }
            // With an active prior scale the scores were biased by the log prior
            // beforehand, so the cross-entropy adds it back.
            let row: Vec<f32> = scores[t][b]
                .iter()
                .enumerate()
                .map(|(c, &z)| z + bias.as_ref().map_or(0.0, |bias| bias[c]))
                .collect();
            let lse = log_sum_exp(&row);
            err += s * (lse - row[label]);
            for c in 0..n_out {
                let target = if c == label { 1.0 } else { 0.0 };
                grad[t][b][c] += s * ((row[c] - lse).exp() - target);
            }
        }
    }

    let device = input.device();
    let known = GradientOverrides::new().with(GradTarget::Scores, grad_tensor(&grad, device)?);
    Ok(LossOutput::with_grads(scalar(err, device)?, known))
}

/// Batch-mean CTC computed by the delegate on `log(y)`.
pub fn warp_ctc(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let delegate = input
        .delegate
        .ok_or_else(|| LossError::config("loss 'warp_ctc' needs a loss delegate"))?;
    let probs = to_frames(input.probs)?;
    let log_probs: Frames = probs
        .iter()
        .map(|frame| frame.iter().map(|row| row.iter().map(|&p| safe_ln(p)).collect()).collect())
        .collect();
    let DelegateResponse { losses, mut grad } = call_delegate(input, delegate, &log_probs)?;
    let batch = losses.len().max(1) as f32;
    let cost = losses.iter().sum::<f32>() / batch;
    for v in grad.iter_mut().flatten().flatten() {
        *v /= batch;
    }
    let device = input.device();
    let known = GradientOverrides::new().with(GradTarget::Scores, grad_tensor(&grad, device)?);
    Ok(LossOutput::with_grads(scalar(cost, device)?, known))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossKind, OutputLayerConfig};
    use crate::head::activate;
    use crate::layer::defaults::NativeCtcDelegate;
    use crate::layer::schedule::StepAlignments;
    use crate::loss::PriorView;
    use crate::types::{DenseLabels, Targets, ValidityMask};
    use candle_core::{Device, Tensor};

    struct Failing;

    impl ExternalLossDelegate for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn loss_and_grad(&self, _: &DelegateRequest<'_>) -> Result<DelegateResponse, LossError> {
            Err(LossError::external("failing", "connection closed"))
        }
    }

    /// Returns a loss of 1 per sequence and a zero gradient.
    struct Constant;

    impl ExternalLossDelegate for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn loss_and_grad(&self, request: &DelegateRequest<'_>) -> Result<DelegateResponse, LossError> {
            let grad = request
                .log_posteriors
                .iter()
                .map(|frame| frame.iter().map(|row| vec![0.0; row.len()]).collect())
                .collect();
            Ok(DelegateResponse {
                losses: vec![1.0; request.seq_lengths.len()],
                grad,
            })
        }
    }

    struct Fixture {
        config: OutputLayerConfig,
        scores: Tensor,
        probs: Tensor,
        targets: Targets,
        mask: ValidityMask,
        alignments: StepAlignments,
    }

    impl Fixture {
        fn new(loss: LossKind, targets: Targets) -> Self {
            let logits = vec![0.5f32, 0.1, 0.2, 0.1, 0.9, 0.3, 0.3, 0.2, 1.1];
            let scores = Tensor::from_vec(logits, (3, 1, 3), &Device::Cpu).expect("scores");
            let probs = activate(&scores, Default::default()).expect("probs");
            Self {
                config: OutputLayerConfig::new("out", 3, loss),
                scores,
                probs,
                targets,
                mask: ValidityMask::all_valid(3, 1),
                alignments: StepAlignments::default(),
            }
        }

        fn input<'a>(&'a self, delegate: &'a dyn ExternalLossDelegate) -> LossInput<'a> {
            LossInput {
                config: &self.config,
                scores: &self.scores,
                probs: &self.probs,
                targets: &self.targets,
                loss_mask: &self.mask,
                source_mask: &self.mask,
                norm: 1.0,
                prior: PriorView::default(),
                transitions: Default::default(),
                automaton_provider: None,
                delegate: Some(delegate),
                alignments: &self.alignments,
                tags: &[],
            }
        }
    }

    fn sequence(labels: &[u32]) -> Targets {
        Targets::Dense(DenseLabels::from_sequences(&[labels.to_vec()]).expect("labels"))
    }

    #[test]
    fn labels_are_padded_with_minus_one() {
        let padded = padded_labels(&[vec![2, 1], vec![0]]);
        assert_eq!(padded, vec![vec![2, 1], vec![0, -1]]);
    }

    #[test]
    fn warp_ctc_matches_the_native_kernel() {
        let fx = Fixture::new(LossKind::WarpCtc, sequence(&[0, 1]));
        let delegate = NativeCtcDelegate { blank: 2 };
        let out = warp_ctc(&fx.input(&delegate)).expect("warp_ctc");
        let log_probs: Vec<Vec<f32>> = crate::head::clipped_log(&fx.probs)
            .and_then(|t| to_frames(&t))
            .expect("log probs")
            .into_iter()
            .map(|frame| frame[0].clone())
            .collect();
        let nll = crate::alignment::ctc::ctc_nll(&log_probs, &[0, 1], 2).expect("nll");
        assert!((out.value().expect("value") - nll).abs() < 1e-4);
        assert!(out.known_grads.contains(GradTarget::Scores));
    }

    #[test]
    fn delegate_failures_surface_as_external_errors() {
        let fx = Fixture::new(LossKind::Sprint, sequence(&[0]));
        let err = sprint(&fx.input(&Failing)).expect_err("failure");
        assert!(matches!(err, LossError::ExternalDelegate { .. }));
    }

    #[test]
    fn sprint_sums_delegate_losses() {
        let fx = Fixture::new(LossKind::Sprint, sequence(&[0]));
        let out = sprint(&fx.input(&Constant)).expect("sprint");
        assert_eq!(out.value().expect("value"), 1.0);
    }

    #[test]
    fn sprint_ce_smoothing_mixes_in_cross_entropy() {
        let labels = DenseLabels::framewise(&[vec![0], vec![1], vec![2]]).expect("labels");
        let mut fx = Fixture::new(LossKind::Sprint, Targets::Dense(labels));
        fx.config.sequence.ce_smoothing = 0.5;
        let out = sprint(&fx.input(&Constant)).expect("sprint");
        let probs = to_frames(&fx.probs).expect("host");
        let ce: f32 = -(probs[0][0][0].ln() + probs[1][0][1].ln() + probs[2][0][2].ln());
        let expected = 0.5 * 1.0 + 0.5 * ce;
        assert!((out.value().expect("value") - expected).abs() < 1e-4);
    }
}
