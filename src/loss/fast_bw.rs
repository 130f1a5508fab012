//! Full-sum training over a provider-supplied automaton.
//!
//! The soft alignment `bw` comes from Baum-Welch on `-log` scores derived from
//! the head output; the loss is `sum(bw * -log y)` over valid frames and the
//! score gradient is supplied explicitly as `y - bw`.

use crate::alignment::baum_welch::baum_welch;
use crate::error::LossError;
use crate::host::{to_frames, Frames};
use crate::layer::defaults::LabelTopologyProvider;
use crate::layer::traits::{AutomatonProvider, AutomatonRequest};
use crate::loss::{grad_tensor, scalar, LossInput};
use crate::numeric::{clip, gaussian_kernel, softmax_row, PROB_CEIL, PROB_FLOOR};
use crate::types::{GradTarget, GradientOverrides, LossOutput, ValidityMask};
use candle_core::Tensor;

pub fn fast_bw(input: &LossInput<'_>) -> Result<LossOutput, LossError> {
    let sequence = &input.config.sequence;
    let opts = &sequence.fast_bw;
    let mask = input.source_mask;
    let lengths = mask.lengths();
    let n_out = input.n_out();
    let device = input.device();

    let mut y = to_frames(input.probs)?;
    if let Some(sigma) = opts.y_gauss_blur_sigma {
        let radius = opts.y_gauss_blur_window.unwrap_or(sigma as usize);
        y = gauss_blur_time(&y, &lengths, sigma, radius);
    }
    if let Some(lower) = opts.y_lower_clip {
        map_in_place(&mut y, |v| v.max(lower));
    }
    map_in_place(&mut y, |v| clip(v, PROB_FLOOR, PROB_CEIL));
    let mut nlog = map_frames(&y, |v| -v.ln());

    let prior_bias = if input.config.substract_prior_from_output {
        None
    } else {
        input.scaled_log_prior()
    };
    let am_scores: Frames = nlog
        .iter()
        .map(|frame| {
            frame
                .iter()
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .map(|(c, &v)| {
                            v * sequence.am_scale + prior_bias.as_ref().map_or(0.0, |bias| bias[c])
                        })
                        .collect()
                })
                .collect()
        })
        .collect();

    let sequences = input.label_sequences("fast_bw")?;
    let tags = input.tags_or_default();
    let fallback = LabelTopologyProvider {
        blank: input.config.blank(),
    };
    let provider: &dyn AutomatonProvider = match input.automaton_provider {
        Some(provider) => provider,
        None => &fallback,
    };
    let automaton = provider.automaton(&AutomatonRequest {
        tags: &tags,
        label_sequences: &sequences,
        n_classes: n_out,
    })?;
    let result = baum_welch(&am_scores, &lengths, &automaton)?;
    tracing::trace!(
        layer = %input.config.name,
        states = automaton.num_states,
        edges = automaton.edges.len(),
        obs = ?result.obs_scores,
        "baum-welch"
    );

    // Priors and the class average read the raw occupancy; rows are
    // renormalized once afterwards.
    let mut bw = map_frames(&result.fwdbwd, |v| (-v * sequence.gamma).exp());
    zero_padding(&mut bw, mask);
    let mut need_renorm = sequence.gamma != 1.0;

    let prior_update = input
        .config
        .priors
        .via_baum_welch
        .then(|| class_average(&bw, mask));

    if sequence.bw_norm_class_avg || opts.bw_norm_class_avg {
        let avg = class_average(&bw, mask);
        for frame in bw.iter_mut() {
            for row in frame.iter_mut() {
                for (v, a) in row.iter_mut().zip(&avg) {
                    *v /= clip(*a, PROB_FLOOR, PROB_CEIL);
                }
            }
        }
        need_renorm = true;
    }
    if need_renorm {
        normalize_rows(&mut bw);
    }
    let alignment = grad_tensor(&bw, device)?;

    if sequence.ce_smoothing > 0.0 {
        let s = sequence.ce_smoothing;
        let other = cached_alignment(input)?;
        for (frame, other_frame) in bw.iter_mut().zip(&other) {
            for (row, other_row) in frame.iter_mut().zip(other_frame) {
                for (v, o) in row.iter_mut().zip(other_row) {
                    *v = s * o + (1.0 - s) * *v;
                }
            }
        }
    }

    if opts.loss_with_softmax_prob || opts.loss_with_sigmoid_prob {
        let scores = to_frames(input.scores)?;
        y = if opts.loss_with_softmax_prob {
            scores
                .iter()
                .map(|frame| frame.iter().map(|row| softmax_row(row)).collect())
                .collect()
        } else {
            map_frames(&scores, |z| 1.0 / (1.0 + (-z).exp()))
        };
        map_in_place(&mut y, |v| clip(v, PROB_FLOOR, PROB_CEIL));
        nlog = map_frames(&y, |v| -v.ln());
    }

    let penalty = opts.log_score_penalty.unwrap_or(0.0);
    let mut err = 0.0f32;
    for (t, b) in mask.valid_cells() {
        for c in 0..n_out {
            err += (bw[t][b][c] - penalty) * nlog[t][b][c];
        }
    }

    let mut known = GradientOverrides::new();
    if !opts.no_explicit_z_grad {
        let scores = if opts.gauss_grad {
            Some(to_frames(input.scores)?)
        } else {
            None
        };
        let mut grad = bw.clone();
        for (t, frame) in grad.iter_mut().enumerate() {
            for (b, row) in frame.iter_mut().enumerate() {
                let valid = mask.get(t, b);
                for (c, g) in row.iter_mut().enumerate() {
                    *g = if valid { y[t][b][c] - *g } else { 0.0 };
                    if let Some(z) = &scores {
                        *g *= -2.0 * z[t][b][c];
                    }
                }
            }
        }
        known.insert(GradTarget::Scores, grad_tensor(&grad, device)?);
    }
    if input.prior.trained && input.config.prior_scale != 0.0 {
        let priors = input
            .prior
            .priors
            .ok_or_else(|| LossError::config("trained prior requested without prior state"))?;
        let occupancy = class_sum(&bw, mask);
        let frames = mask.count() as f32;
        let grad: Vec<f32> = occupancy
            .iter()
            .zip(priors)
            .map(|(o, p)| input.config.prior_scale * (o - p * frames))
            .collect();
        let grad = Tensor::new(grad.as_slice(), device)
            .map_err(crate::error::tensor_err("trained prior gradient"))?;
        known.insert(GradTarget::TrainedPrior, grad);
    }

    let mut output = LossOutput::with_grads(scalar(err, device)?, known);
    output.alignment = Some(alignment);
    output.prior_update = prior_update;
    Ok(output)
}

/// Alignment cached earlier in the step by the layer named in
/// `ce_target_layer_align`.
fn cached_alignment(input: &LossInput<'_>) -> Result<Frames, LossError> {
    let name = input
        .config
        .sequence
        .ce_target_layer_align
        .as_deref()
        .ok_or_else(|| LossError::config("ce_smoothing needs ce_target_layer_align"))?;
    let tensor = input.alignments.get(name).ok_or_else(|| {
        LossError::config(format!(
            "no alignment cached for layer '{name}' in this step"
        ))
    })?;
    if tensor.dims() != input.probs.dims() {
        return Err(LossError::shape(
            "fast_bw smoothing",
            format!(
                "alignment of '{name}' has shape {:?}, expected {:?}",
                tensor.dims(),
                input.probs.dims()
            ),
        ));
    }
    to_frames(tensor)
}

/// Gaussian smoothing along time within each sequence, replicating the edge
/// frames.
fn gauss_blur_time(y: &Frames, lengths: &[usize], sigma: f32, radius: usize) -> Frames {
    let kernel = gaussian_kernel(sigma, radius);
    let mut out = y.clone();
    for (b, &len) in lengths.iter().enumerate() {
        if len == 0 {
            continue;
        }
        for t in 0..len {
            for (c, v) in out[t][b].iter_mut().enumerate() {
                *v = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let src = (t + k).saturating_sub(radius).min(len - 1);
                        w * y[src][b][c]
                    })
                    .sum();
            }
        }
    }
    out
}

fn map_frames(frames: &Frames, f: impl Fn(f32) -> f32) -> Frames {
    frames
        .iter()
        .map(|frame| frame.iter().map(|row| row.iter().map(|&v| f(v)).collect()).collect())
        .collect()
}

fn map_in_place(frames: &mut Frames, f: impl Fn(f32) -> f32) {
    for v in frames.iter_mut().flatten().flatten() {
        *v = f(*v);
    }
}

fn normalize_rows(frames: &mut Frames) {
    for row in frames.iter_mut().flatten() {
        let total = clip(row.iter().sum(), PROB_FLOOR, PROB_CEIL);
        for v in row.iter_mut() {
            *v /= total;
        }
    }
}

fn zero_padding(frames: &mut Frames, mask: &ValidityMask) {
    for (t, frame) in frames.iter_mut().enumerate() {
        for (b, row) in frame.iter_mut().enumerate() {
            if !mask.get(t, b) {
                row.iter_mut().for_each(|v| *v = 0.0);
            }
        }
    }
}

fn class_sum(frames: &Frames, mask: &ValidityMask) -> Vec<f32> {
    let n = frames
        .first()
        .and_then(|f| f.first())
        .map_or(0, Vec::len);
    let mut sum = vec![0.0f32; n];
    for (t, b) in mask.valid_cells() {
        for (s, v) in sum.iter_mut().zip(&frames[t][b]) {
            *s += v;
        }
    }
    sum
}

fn class_average(frames: &Frames, mask: &ValidityMask) -> Vec<f32> {
    let count = mask.count().max(1) as f32;
    class_sum(frames, mask).into_iter().map(|s| s / count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossKind, OutputLayerConfig};
    use crate::head::activate;
    use crate::layer::schedule::StepAlignments;
    use crate::loss::PriorView;
    use crate::types::{DenseLabels, Targets};
    use candle_core::Device;

    struct Fixture {
        config: OutputLayerConfig,
        scores: Tensor,
        probs: Tensor,
        targets: Targets,
        mask: ValidityMask,
        alignments: StepAlignments,
    }

    impl Fixture {
        /// Two sequences of 4 and 3 frames over classes {a, b, blank}.
        fn new() -> Self {
            let logits: Vec<f32> = vec![
                1.0, 0.1, 0.3, 0.2, 0.4, 0.9, //
                0.1, 0.2, 1.2, 1.1, 0.3, 0.2, //
                0.2, 1.3, 0.1, 0.3, 0.2, 1.0, //
                0.0, 0.1, 1.1, 0.0, 0.0, 0.0,
            ];
            let scores = Tensor::from_vec(logits, (4, 2, 3), &Device::Cpu).expect("scores");
            let probs = activate(&scores, Default::default()).expect("probs");
            let targets = Targets::Dense(
                DenseLabels::from_sequences(&[vec![0, 1], vec![1]]).expect("labels"),
            );
            Self {
                config: OutputLayerConfig::new("out", 3, LossKind::FastBw),
                scores,
                probs,
                targets,
                mask: ValidityMask::from_lengths(&[4, 3], 4).expect("mask"),
                alignments: StepAlignments::default(),
            }
        }

        fn input(&self) -> LossInput<'_> {
            self.input_with(PriorView::default())
        }

        fn input_with<'a>(&'a self, prior: PriorView<'a>) -> LossInput<'a> {
            LossInput {
                config: &self.config,
                scores: &self.scores,
                probs: &self.probs,
                targets: &self.targets,
                loss_mask: &self.mask,
                source_mask: &self.mask,
                norm: 1.0,
                prior,
                transitions: Default::default(),
                automaton_provider: None,
                delegate: None,
                alignments: &self.alignments,
                tags: &[],
            }
        }
    }

    #[test]
    fn alignment_rows_sum_to_one_on_valid_frames() {
        let fx = Fixture::new();
        let out = fast_bw(&fx.input()).expect("fast_bw");
        let bw = to_frames(out.alignment.as_ref().expect("alignment")).expect("host");
        for t in 0..4 {
            for b in 0..2 {
                let total: f32 = bw[t][b].iter().sum();
                if fx.mask.get(t, b) {
                    assert!((total - 1.0).abs() < 1e-4, "({t}, {b}) sums to {total}");
                } else {
                    assert_eq!(total, 0.0);
                }
            }
        }
        assert!(out.value().expect("value") > 0.0);
    }

    #[test]
    fn explicit_gradient_is_zero_on_padding_and_rows_cancel() {
        let fx = Fixture::new();
        let out = fast_bw(&fx.input()).expect("fast_bw");
        let grad = to_frames(out.known_grads.get(GradTarget::Scores).expect("grad")).expect("host");
        assert!(grad[3][1].iter().all(|&g| g == 0.0));
        for t in 0..4 {
            assert!(grad[t][0].iter().sum::<f32>().abs() < 1e-4);
        }
    }

    #[test]
    fn no_explicit_z_grad_leaves_scores_to_autodiff() {
        let mut fx = Fixture::new();
        fx.config.sequence.fast_bw.no_explicit_z_grad = true;
        let out = fast_bw(&fx.input()).expect("fast_bw");
        assert!(!out.known_grads.contains(GradTarget::Scores));
    }

    #[test]
    fn baum_welch_priors_form_a_distribution() {
        let mut fx = Fixture::new();
        fx.config.priors.via_baum_welch = true;
        let out = fast_bw(&fx.input()).expect("fast_bw");
        let prior = out.prior_update.expect("prior update");
        assert_eq!(prior.len(), 3);
        assert!((prior.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn ce_smoothing_requires_a_cached_alignment() {
        let mut fx = Fixture::new();
        fx.config.sequence.ce_smoothing = 0.5;
        fx.config.sequence.ce_target_layer_align = Some("align".to_string());
        assert!(matches!(
            fast_bw(&fx.input()),
            Err(LossError::Config { .. })
        ));

    }

    fn alignment_of(out: &LossOutput) -> Frames {
        to_frames(out.alignment.as_ref().expect("alignment")).expect("host")
    }

    fn score_grad_of(out: &LossOutput) -> Frames {
        to_frames(out.known_grads.get(GradTarget::Scores).expect("grad")).expect("host")
    }

    /// `sum over valid cells of bw * -ln y`.
    fn weighted_nlog(bw: &Frames, y: &Frames, mask: &ValidityMask) -> f32 {
        mask.valid_cells()
            .map(|(t, b)| {
                bw[t][b]
                    .iter()
                    .zip(&y[t][b])
                    .map(|(w, p)| -w * p.ln())
                    .sum::<f32>()
            })
            .sum()
    }

    #[test]
    fn gamma_sharpens_rows_and_priors_read_the_raw_occupancy() {
        let mut fx = Fixture::new();
        let occupancy = alignment_of(&fast_bw(&fx.input()).expect("base"));

        fx.config.sequence.gamma = 2.0;
        fx.config.priors.via_baum_welch = true;
        let out = fast_bw(&fx.input()).expect("gamma");
        let bw = alignment_of(&out);
        let valid = fx.mask.count() as f32;
        let mut raw_mean = vec![0.0f32; 3];
        for (t, b) in fx.mask.valid_cells() {
            let squared: Vec<f32> = occupancy[t][b].iter().map(|v| v * v).collect();
            let total: f32 = squared.iter().sum();
            for c in 0..3 {
                raw_mean[c] += squared[c] / valid;
                assert!((bw[t][b][c] - squared[c] / total).abs() < 1e-4);
            }
        }
        let prior = out.prior_update.expect("prior update");
        for c in 0..3 {
            assert!((prior[c] - raw_mean[c]).abs() < 1e-4, "class {c}");
        }
        assert!(prior.iter().sum::<f32>() < 1.0 - 1e-3);
    }

    #[test]
    fn class_average_normalization_divides_by_the_mean_occupancy() {
        let mut fx = Fixture::new();
        let occupancy = alignment_of(&fast_bw(&fx.input()).expect("base"));
        let avg = class_average(&occupancy, &fx.mask);

        fx.config.sequence.fast_bw.bw_norm_class_avg = true;
        let bw = alignment_of(&fast_bw(&fx.input()).expect("class avg"));
        for (t, b) in fx.mask.valid_cells() {
            let scaled: Vec<f32> = occupancy[t][b]
                .iter()
                .zip(&avg)
                .map(|(o, a)| o / a.max(PROB_FLOOR))
                .collect();
            let total: f32 = scaled.iter().sum();
            for c in 0..3 {
                assert!((bw[t][b][c] - scaled[c] / total).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn gauss_grad_scales_the_gradient_by_minus_two_z() {
        let mut fx = Fixture::new();
        let base = score_grad_of(&fast_bw(&fx.input()).expect("base"));
        fx.config.sequence.fast_bw.gauss_grad = true;
        let grad = score_grad_of(&fast_bw(&fx.input()).expect("gauss"));
        let z = to_frames(&fx.scores).expect("scores");
        for t in 0..4 {
            for b in 0..2 {
                for c in 0..3 {
                    let expected = base[t][b][c] * -2.0 * z[t][b][c];
                    assert!((grad[t][b][c] - expected).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn lower_clip_floors_the_probabilities() {
        let mut fx = Fixture::new();
        fx.config.sequence.fast_bw.y_lower_clip = Some(0.4);
        let out = fast_bw(&fx.input()).expect("clipped");
        let bw = alignment_of(&out);
        let grad = score_grad_of(&out);
        let probs = to_frames(&fx.probs).expect("probs");
        for (t, b) in fx.mask.valid_cells() {
            for c in 0..3 {
                let y = grad[t][b][c] + bw[t][b][c];
                assert!((y - probs[t][b][c].max(0.4)).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn softmax_prob_recomputes_the_loss_from_the_scores() {
        let mut fx = Fixture::new();
        fx.probs = (fx.probs.ones_like().expect("ones") / 3.0).expect("uniform");
        fx.config.sequence.fast_bw.loss_with_softmax_prob = true;
        let out = fast_bw(&fx.input()).expect("softmax prob");
        let bw = alignment_of(&out);
        let z = to_frames(&fx.scores).expect("scores");
        let y: Frames = z
            .iter()
            .map(|frame| frame.iter().map(|row| softmax_row(row)).collect())
            .collect();
        let expected = weighted_nlog(&bw, &y, &fx.mask);
        assert!((out.value().expect("value") - expected).abs() < 1e-3);
        let grad = score_grad_of(&out);
        assert!((grad[0][0][0] - (y[0][0][0] - bw[0][0][0])).abs() < 1e-5);
    }

    #[test]
    fn sigmoid_prob_recomputes_the_loss_from_the_scores() {
        let mut fx = Fixture::new();
        fx.config.sequence.fast_bw.loss_with_sigmoid_prob = true;
        let out = fast_bw(&fx.input()).expect("sigmoid prob");
        let bw = alignment_of(&out);
        let y = map_frames(&to_frames(&fx.scores).expect("scores"), |z| {
            1.0 / (1.0 + (-z).exp())
        });
        let expected = weighted_nlog(&bw, &y, &fx.mask);
        assert!((out.value().expect("value") - expected).abs() < 1e-3);
    }

    #[test]
    fn log_score_penalty_subtracts_the_plain_nlog_sum() {
        let mut fx = Fixture::new();
        let base = fast_bw(&fx.input()).expect("base").value().expect("value");
        fx.config.sequence.fast_bw.log_score_penalty = Some(0.1);
        let penalized = fast_bw(&fx.input()).expect("penalty").value().expect("value");
        let probs = to_frames(&fx.probs).expect("probs");
        let nlog_sum: f32 = fx
            .mask
            .valid_cells()
            .map(|(t, b)| probs[t][b].iter().map(|p| -p.ln()).sum::<f32>())
            .sum();
        assert!((penalized - (base - 0.1 * nlog_sum)).abs() < 1e-3);
    }

    #[test]
    fn ce_smoothing_blends_with_the_cached_alignment() {
        let mut fx = Fixture::new();
        fx.config.sequence.ce_smoothing = 0.5;
        fx.config.sequence.ce_target_layer_align = Some("align".to_string());
        let uniform = (fx.probs.ones_like().expect("ones") / 3.0).expect("uniform");
        fx.alignments.insert("align", uniform);
        let out = fast_bw(&fx.input()).expect("smoothed");

        let bw = alignment_of(&out);
        let blended = map_frames(&bw, |v| 0.5 / 3.0 + 0.5 * v);
        let probs = to_frames(&fx.probs).expect("probs");
        let expected = weighted_nlog(&blended, &probs, &fx.mask);
        assert!((out.value().expect("value") - expected).abs() < 1e-3);
        let grad = score_grad_of(&out);
        assert!((grad[1][0][2] - (probs[1][0][2] - blended[1][0][2])).abs() < 1e-5);
    }

    #[test]
    fn trained_prior_receives_the_occupancy_gradient() {
        let mut fx = Fixture::new();
        fx.config.prior_scale = 0.5;
        let priors = [0.2f32, 0.3, 0.5];
        let log_prior: Vec<f32> = priors.iter().map(|p| p.ln()).collect();
        let out = fast_bw(&fx.input_with(PriorView {
            log_prior: Some(&log_prior),
            priors: Some(&priors),
            trained: true,
        }))
        .expect("trained prior");

        let occupancy = class_sum(&alignment_of(&out), &fx.mask);
        let grad: Vec<f32> = out
            .known_grads
            .get(GradTarget::TrainedPrior)
            .expect("prior grad")
            .to_vec1()
            .expect("host");
        for c in 0..3 {
            let expected = 0.5 * (occupancy[c] - priors[c] * 7.0);
            assert!((grad[c] - expected).abs() < 1e-4, "class {c}");
        }
        assert!(grad.iter().sum::<f32>().abs() < 1e-3);
    }

    #[test]
    fn blur_keeps_a_constant_signal() {
        let y = vec![vec![vec![0.25f32, 0.75]]; 5];
        let blurred = gauss_blur_time(&y, &[5], 1.0, 2);
        for frame in blurred {
            assert!((frame[0][0] - 0.25).abs() < 1e-6);
        }
    }
}
