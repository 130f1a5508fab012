use candle_core::{Device, Tensor};

use crate::alignment::two_state::Transitions;
use crate::config::{LossKind, OutputActivation, OutputLayerConfig, TimeLimit};
use crate::error::{tensor_err, LossError};
use crate::head::{divide_by_classes, subtract_prior, ProbabilityHead};
use crate::host::{dims3, to_frames, vector_to_host};
use crate::layer::schedule::StepAlignments;
use crate::layer::traits::{AutomatonProvider, ExternalLossDelegate};
use crate::loss::{compute_loss, LossInput, PriorView};
use crate::metrics::count_errors;
use crate::prior::{Distortions, PriorEstimator, TrainedSoftmaxPrior};
use crate::types::{GradTarget, LossOutput, ScoreGradTransform, StepPhase, Targets, ValidityMask};

/// Inputs of one step for one output layer.
#[derive(Debug, Clone)]
pub struct StepInput<'a> {
    /// Raw scores `[time, batch, class]`; may be a candle `Var`.
    pub scores: &'a Tensor,
    /// Source validity `[time, batch]`.
    pub index: &'a ValidityMask,
    pub targets: Targets,
    pub phase: StepPhase,
    /// Sequence tags handed to automaton providers and loss delegates.
    pub tags: &'a [String],
}

/// Scores, probabilities and cell sets the loss is evaluated on.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub scores: Tensor,
    pub probs: Tensor,
    pub targets: Targets,
    pub loss_mask: ValidityMask,
    pub source_mask: ValidityMask,
    /// Normalization factor from time limiting (`1` otherwise).
    pub norm: f32,
    pub score_grad: ScoreGradTransform,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub prepared: PreparedStep,
    /// `None` for loss `none`.
    pub loss: Option<LossOutput>,
    pub errors: Option<f32>,
}

impl StepOutput {
    pub fn loss_value(&self) -> Result<Option<f32>, LossError> {
        self.loss.as_ref().map(LossOutput::value).transpose()
    }

    /// Gradient of the loss with respect to the caller's raw scores.
    pub fn score_gradient(&self, scores: &Tensor) -> Result<Option<Tensor>, LossError> {
        match &self.loss {
            Some(loss) => loss.gradient_for_scores(scores),
            None => Ok(None),
        }
    }
}

pub struct OutputLayer {
    config: OutputLayerConfig,
    head: ProbabilityHead,
    /// Running or loaded prior; `None` when the layer has no prior at all.
    prior: Option<PriorEstimator>,
    trained_prior: Option<TrainedSoftmaxPrior>,
    /// Per-class divisor of the `priori` loss.
    priori: Vec<f32>,
    distortions: Distortions,
    automaton_provider: Option<Box<dyn AutomatonProvider>>,
    delegate: Option<Box<dyn ExternalLossDelegate>>,
    epoch: u32,
}

pub(crate) struct OutputLayerParts {
    pub config: OutputLayerConfig,
    pub prior: Option<PriorEstimator>,
    pub trained_prior: Option<TrainedSoftmaxPrior>,
    pub automaton_provider: Option<Box<dyn AutomatonProvider>>,
    pub delegate: Option<Box<dyn ExternalLossDelegate>>,
}

impl OutputLayer {
    pub(crate) fn from_parts(parts: OutputLayerParts) -> Self {
        let config = parts.config;
        let activation = if config.loss == LossKind::Sse || !config.apply_softmax {
            OutputActivation::Identity
        } else {
            config.activation
        };
        Self {
            head: ProbabilityHead::new(activation, config.softmax_smoothing),
            priori: vec![1.0; config.n_out],
            config,
            prior: parts.prior,
            trained_prior: parts.trained_prior,
            distortions: Distortions::default(),
            automaton_provider: parts.automaton_provider,
            delegate: parts.delegate,
            epoch: 1,
        }
    }

    pub fn config(&self) -> &OutputLayerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn head(&self) -> ProbabilityHead {
        self.head
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Epoch of the coming steps (1-based); drives `use_label_priors`.
    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
    }

    pub fn prior(&self) -> Option<&PriorEstimator> {
        self.prior.as_ref()
    }

    pub fn trained_prior(&self) -> Option<&TrainedSoftmaxPrior> {
        self.trained_prior.as_ref()
    }

    pub fn distortions(&self) -> Distortions {
        self.distortions
    }

    /// Current `+log` prior, trained prior first.
    pub fn log_prior(&self) -> Option<Vec<f32>> {
        match (&self.trained_prior, &self.prior) {
            (Some(trained), _) => Some(trained.log_prior()),
            (None, Some(prior)) => Some(prior.log_prior()),
            (None, None) => None,
        }
    }

    fn prior_probabilities(&self) -> Option<Vec<f32>> {
        match (&self.trained_prior, &self.prior) {
            (Some(trained), _) => Some(trained.priors()),
            (None, Some(prior)) => Some(prior.priors().to_vec()),
            (None, None) => None,
        }
    }

    fn transitions(&self) -> Transitions {
        if self.config.compute_distortions {
            self.distortions.transitions()
        } else {
            Transitions::default()
        }
    }

    /// Validates shapes, applies the time limit and label exclusion, and runs
    /// the probability head.
    pub fn prepare(&self, input: &StepInput<'_>) -> Result<PreparedStep, LossError> {
        let config = &self.config;
        let (time, batch, n_out) = dims3(input.scores, "scores")?;
        if n_out != config.n_out {
            return Err(LossError::shape(
                "scores",
                format!("{n_out} classes, layer '{}' has {}", config.name, config.n_out),
            ));
        }
        input.index.check_shape(time, batch, "source index")?;
        check_targets(config, &input.targets, time, batch)?;

        let device = input.scores.device();
        let mut scores = input.scores.clone();
        let mut targets = input.targets.clone();
        let mut source_mask = input.index.clone();
        let mut score_grad = ScoreGradTransform {
            scale: config.softmax_smoothing,
            clip: config.grad_clip_z,
            discard_out_of_bound: config.grad_discard_out_of_bound_z,
            ..ScoreGradTransform::default()
        };
        let mut norm = 1.0f32;

        match config.time_limit {
            TimeLimit::None => {}
            TimeLimit::Frames(limit) => {
                let end = time.min(limit);
                if end < time {
                    let before = self.loss_mask(&targets, &source_mask).count();
                    scores = zero_frames_from(&scores, end, device)?;
                    source_mask.truncate(end);
                    if let Targets::Dense(labels) = &mut targets {
                        if frame_aligned(config.loss) {
                            labels.mask_mut().truncate(end);
                        }
                    }
                    let after = self.loss_mask(&targets, &source_mask).count();
                    norm = ratio(before, after);
                    tracing::debug!(
                        layer = %config.name,
                        limit,
                        frames = time,
                        norm,
                        "time limit truncated the step"
                    );
                }
            }
            TimeLimit::Inf if !frame_aligned(config.loss) => {}
            TimeLimit::Inf => {
                if let Targets::Dense(labels) = &mut targets {
                    let label_frames = labels.time();
                    match input.phase {
                        StepPhase::Eval => {
                            if label_frames < time {
                                labels.extend(time - label_frames, false);
                            }
                        }
                        StepPhase::Train if label_frames > time => {
                            let pad = label_frames - time;
                            scores = pad_with_last_frame(&scores, pad)?;
                            source_mask.extend(pad, false);
                            score_grad.source_frames = Some(time);
                            tracing::warn!(
                                layer = %config.name,
                                pad,
                                "scores padded to the target length"
                            );
                        }
                        StepPhase::Train if label_frames < time => {
                            let before = labels.mask().count();
                            labels.extend(time - label_frames, true);
                            norm = ratio(before, labels.mask().count());
                            tracing::warn!(
                                layer = %config.name,
                                pad = time - label_frames,
                                norm,
                                "targets padded to the score length"
                            );
                        }
                        StepPhase::Train => {}
                    }
                }
            }
        }

        let mut loss_mask = match (input.phase, config.time_limit) {
            (StepPhase::Eval, TimeLimit::Inf) => source_mask.clone(),
            _ => self.loss_mask(&targets, &source_mask),
        };
        if let Targets::Dense(labels) = &targets {
            if !config.exclude_labels.is_empty() {
                let excluded: Vec<(usize, usize)> = loss_mask
                    .valid_cells()
                    .filter(|&(t, b)| {
                        t < labels.time() && config.exclude_labels.contains(&labels.get(t, b))
                    })
                    .collect();
                for (t, b) in excluded {
                    loss_mask.set(t, b, false);
                }
            }
        }
        if loss_mask.count() == 0 {
            tracing::warn!(layer = %config.name, "no valid loss cells in this step");
        }

        if config.softmax_smoothing != 1.0 {
            tracing::debug!(
                layer = %config.name,
                smoothing = config.softmax_smoothing,
                "softmax smoothing active"
            );
        }
        let scores = self.head.scale_scores(&scores)?;
        let mut probs = self.head.forward(&scores)?;
        if config.loss == LossKind::Priori {
            let priori = Tensor::new(self.priori.as_slice(), device)
                .map_err(tensor_err("priori vector"))?;
            probs = divide_by_classes(&probs, &priori)?;
        }
        if config.substract_prior_from_output {
            if let Some(log_prior) = self.log_prior() {
                let log_prior = Tensor::new(log_prior.as_slice(), device)
                    .map_err(tensor_err("log prior tensor"))?;
                probs = subtract_prior(&probs, &log_prior, config.output_prior_scale())?;
            }
        }

        Ok(PreparedStep {
            scores,
            probs,
            targets,
            loss_mask,
            source_mask,
            norm,
            score_grad,
        })
    }

    /// Cells of the framewise reductions: the target index for framewise
    /// integer labels unless `use_source_index`, the source index otherwise.
    fn loss_mask(&self, targets: &Targets, source_mask: &ValidityMask) -> ValidityMask {
        match targets {
            Targets::Dense(labels)
                if !self.config.use_source_index && frame_aligned(self.config.loss) =>
            {
                labels.mask().clone()
            }
            _ => source_mask.clone(),
        }
    }

    /// Prepares the step, evaluates the loss and counts errors. A produced
    /// soft alignment is cached in `alignments` under the layer name.
    pub fn step(
        &self,
        input: &StepInput<'_>,
        alignments: &mut StepAlignments,
    ) -> Result<StepOutput, LossError> {
        let prepared = self.prepare(input)?;
        let log_prior = self.log_prior();
        let priors = self.prior_probabilities();
        let loss_input = LossInput {
            config: &self.config,
            scores: &prepared.scores,
            probs: &prepared.probs,
            targets: &prepared.targets,
            loss_mask: &prepared.loss_mask,
            source_mask: &prepared.source_mask,
            norm: prepared.norm,
            prior: PriorView {
                log_prior: log_prior.as_deref(),
                priors: priors.as_deref(),
                trained: self.trained_prior.is_some(),
            },
            transitions: self.transitions(),
            automaton_provider: self.automaton_provider.as_deref(),
            delegate: self.delegate.as_deref(),
            alignments: &*alignments,
            tags: input.tags,
        };
        let mut loss = compute_loss(&loss_input)?;
        let errors = count_errors(&loss_input)?;
        if let Some(loss) = loss.as_mut() {
            loss.score_grad = prepared.score_grad;
        }
        if let Some(alignment) = loss.as_ref().and_then(|l| l.alignment.clone()) {
            alignments.insert(self.config.name.clone(), alignment);
        }
        Ok(StepOutput {
            prepared,
            loss,
            errors,
        })
    }

    /// Folds the step into the running prior and distortion estimates.
    /// Reads the same probabilities the step's loss was computed from.
    pub fn update_priors(&mut self, step: &StepOutput) -> Result<bool, LossError> {
        let prepared = &step.prepared;
        let needs_probs = self.config.priors.compute_priors || self.config.compute_distortions;
        if !needs_probs {
            return Ok(false);
        }
        let probs = to_frames(&prepared.probs)?;
        if self.config.compute_distortions {
            self.distortions.update(&probs, &prepared.source_mask);
        }
        if !self.config.priors.compute_priors {
            return Ok(false);
        }
        let Some(prior) = self.prior.as_mut() else {
            return Ok(false);
        };
        let from_bw = step.loss.as_ref().and_then(|l| l.prior_update.clone());
        let statistic = match from_bw {
            Some(statistic) => statistic,
            None => {
                let labels = match &prepared.targets {
                    Targets::Dense(labels) if frame_aligned(self.config.loss) => Some(labels),
                    _ => None,
                };
                prior.batch_statistic(&probs, &prepared.loss_mask, labels, self.epoch)
            }
        };
        prior.update(&statistic)
    }

    /// SGD step on the trained prior logits from the step's explicit prior
    /// gradient. Returns whether a gradient was applied.
    pub fn apply_prior_gradient(
        &mut self,
        step: &StepOutput,
        learning_rate: f32,
    ) -> Result<bool, LossError> {
        let grad = step
            .loss
            .as_ref()
            .and_then(|l| l.known_grads.get(GradTarget::TrainedPrior));
        match (self.trained_prior.as_mut(), grad) {
            (Some(trained), Some(grad)) => {
                trained.apply_gradient(&vector_to_host(grad)?, learning_rate)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Kinds whose integer labels carry one label per frame.
fn frame_aligned(kind: LossKind) -> bool {
    !kind.uses_label_sequences() && kind != LossKind::FastBw
}

fn check_targets(
    config: &OutputLayerConfig,
    targets: &Targets,
    time: usize,
    batch: usize,
) -> Result<(), LossError> {
    let strict_time = config.time_limit != TimeLimit::Inf
        && (!config.loss.is_sequence() || matches!(config.loss, LossKind::CeCtc | LossKind::Ctc2));
    match targets {
        Targets::None => {
            if config.loss != LossKind::None && !config.has_null_target() {
                return Err(LossError::shape(
                    "targets",
                    format!("loss '{}' needs a reference", config.loss),
                ));
            }
        }
        Targets::Dense(labels) => {
            if labels.batch() != batch {
                return Err(LossError::shape(
                    "targets",
                    format!("{} label columns for a batch of {batch}", labels.batch()),
                ));
            }
            if strict_time && labels.time() != time {
                return Err(LossError::shape(
                    "targets",
                    format!("{} label frames for {time} score frames", labels.time()),
                ));
            }
            labels.check_range(config.n_out)?;
        }
        Targets::Sparse(sparse) => {
            if sparse.batch() != batch || sparse.time() != time {
                return Err(LossError::shape(
                    "sparse targets",
                    format!(
                        "{}x{} targets for {time}x{batch} scores",
                        sparse.time(),
                        sparse.batch()
                    ),
                ));
            }
            sparse.check_range(config.n_out)?;
        }
        Targets::Soft(soft) => {
            let dims = soft.dims();
            if dims != [time, batch, config.n_out] {
                return Err(LossError::shape(
                    "soft targets",
                    format!("shape {dims:?}, expected [{time}, {batch}, {}]", config.n_out),
                ));
            }
        }
    }
    Ok(())
}

fn ratio(before: usize, after: usize) -> f32 {
    if after == 0 {
        tracing::warn!(before, "time limit left no valid cells");
        return 1.0;
    }
    before as f32 / after as f32
}

/// Zeros frames `end..` of `scores` (kept differentiable).
fn zero_frames_from(scores: &Tensor, end: usize, device: &Device) -> Result<Tensor, LossError> {
    let time = scores.dim(0).map_err(tensor_err("time limit"))?;
    let keep: Vec<f32> = (0..time).map(|t| if t < end { 1.0 } else { 0.0 }).collect();
    Tensor::from_vec(keep, (time, 1, 1), device)
        .and_then(|keep| scores.broadcast_mul(&keep))
        .map_err(tensor_err("time limit"))
}

/// Appends `pad` copies of the last frame.
fn pad_with_last_frame(scores: &Tensor, pad: usize) -> Result<Tensor, LossError> {
    let pad_scores = || -> candle_core::Result<Tensor> {
        let time = scores.dim(0)?;
        let last = scores.narrow(0, time - 1, 1)?;
        let (_, batch, classes) = scores.dims3()?;
        let repeated = last.broadcast_as((pad, batch, classes))?.contiguous()?;
        Tensor::cat(&[scores, &repeated], 0)
    };
    pad_scores().map_err(tensor_err("time padding"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::builder::OutputLayerBuilder;
    use crate::types::DenseLabels;
    use candle_core::{Device, Var};

    fn scores(rows: &[[f32; 2]]) -> Tensor {
        let data: Vec<f32> = rows.iter().flat_map(|r| r.map(f32::ln)).collect();
        Tensor::from_vec(data, (rows.len(), 1, 2), &Device::Cpu).expect("scores")
    }

    fn framewise(labels: &[u32]) -> Targets {
        let rows: Vec<Vec<u32>> = labels.iter().map(|&l| vec![l]).collect();
        Targets::Dense(DenseLabels::framewise(&rows).expect("labels"))
    }

    fn layer(config: OutputLayerConfig) -> OutputLayer {
        OutputLayerBuilder::new(config).build().expect("layer")
    }

    #[test]
    fn frame_limit_truncates_and_rescales() {
        let mut config = OutputLayerConfig::new("out", 2, LossKind::Ce);
        config.time_limit = TimeLimit::Frames(3);
        let layer = layer(config);
        let z = scores(&[[0.9, 0.1]; 5]);
        let index = ValidityMask::all_valid(5, 1);
        let input = StepInput {
            scores: &z,
            index: &index,
            targets: framewise(&[0; 5]),
            phase: StepPhase::Train,
            tags: &[],
        };
        let prepared = layer.prepare(&input).expect("prepare");
        assert_eq!(prepared.loss_mask.count(), 3);
        assert!((prepared.norm - 5.0 / 3.0).abs() < 1e-6);
        let tail = prepared.scores.narrow(0, 3, 2).expect("tail");
        let tail: Vec<f32> = tail.flatten_all().and_then(|t| t.to_vec1()).expect("host");
        assert!(tail.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn inf_limit_pads_scores_in_training_and_folds_the_gradient_back() {
        let mut config = OutputLayerConfig::new("out", 2, LossKind::Ce);
        config.time_limit = TimeLimit::Inf;
        let layer = layer(config);
        let z = Var::from_tensor(&scores(&[[0.6, 0.4], [0.3, 0.7]])).expect("var");
        let index = ValidityMask::all_valid(2, 1);
        let input = StepInput {
            scores: z.as_tensor(),
            index: &index,
            targets: framewise(&[0, 1, 1]),
            phase: StepPhase::Train,
            tags: &[],
        };
        let mut alignments = StepAlignments::default();
        let out = layer.step(&input, &mut alignments).expect("step");
        assert_eq!(out.prepared.scores.dims(), &[3, 1, 2]);
        assert_eq!(out.prepared.score_grad.source_frames, Some(2));
        let grad = out
            .score_gradient(z.as_tensor())
            .expect("grad")
            .expect("some grad");
        assert_eq!(grad.dims(), &[2, 1, 2]);
    }

    #[test]
    fn inf_limit_pads_targets_and_adjusts_norm() {
        let mut config = OutputLayerConfig::new("out", 2, LossKind::Ce);
        config.time_limit = TimeLimit::Inf;
        let layer = layer(config);
        let z = scores(&[[0.6, 0.4]; 4]);
        let index = ValidityMask::all_valid(4, 1);
        let input = StepInput {
            scores: &z,
            index: &index,
            targets: framewise(&[0, 1]),
            phase: StepPhase::Train,
            tags: &[],
        };
        let prepared = layer.prepare(&input).expect("prepare");
        assert_eq!(prepared.loss_mask.count(), 4);
        assert!((prepared.norm - 0.5).abs() < 1e-6);

        let eval = StepInput {
            phase: StepPhase::Eval,
            ..input
        };
        let prepared = layer.prepare(&eval).expect("prepare");
        assert_eq!(prepared.loss_mask, index);
    }

    #[test]
    fn excluded_labels_leave_the_loss() {
        let mut config = OutputLayerConfig::new("out", 2, LossKind::Ce);
        config.exclude_labels = vec![1];
        let layer = layer(config);
        let z = scores(&[[0.9, 0.1], [0.2, 0.8], [0.95, 0.05]]);
        let index = ValidityMask::all_valid(3, 1);
        let input = StepInput {
            scores: &z,
            index: &index,
            targets: framewise(&[0, 1, 0]),
            phase: StepPhase::Train,
            tags: &[],
        };
        let prepared = layer.prepare(&input).expect("prepare");
        assert!(!prepared.loss_mask.get(1, 0));
        assert_eq!(prepared.loss_mask.count(), 2);
    }

    #[test]
    fn shape_violations_are_rejected() {
        let layer = layer(OutputLayerConfig::new("out", 2, LossKind::Ce));
        let z = scores(&[[0.9, 0.1], [0.2, 0.8]]);
        let index = ValidityMask::all_valid(3, 1);
        let input = StepInput {
            scores: &z,
            index: &index,
            targets: framewise(&[0, 1]),
            phase: StepPhase::Train,
            tags: &[],
        };
        assert!(matches!(
            layer.prepare(&input),
            Err(LossError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn prior_update_reads_the_step_probabilities() {
        let mut config = OutputLayerConfig::new("out", 2, LossKind::Ce);
        config.priors.compute_priors = true;
        let mut layer = layer(config);
        let z = scores(&[[0.9, 0.1], [0.7, 0.3]]);
        let index = ValidityMask::all_valid(2, 1);
        let input = StepInput {
            scores: &z,
            index: &index,
            targets: framewise(&[0, 0]),
            phase: StepPhase::Train,
            tags: &[],
        };
        let out = layer
            .step(&input, &mut StepAlignments::default())
            .expect("step");
        assert!(layer.update_priors(&out).expect("update"));
        let priors = layer.prior().expect("prior").priors().to_vec();
        assert!((priors[0] - 0.8).abs() < 1e-5);
        assert!((priors[1] - 0.2).abs() < 1e-5);
    }

    #[test]
    fn fast_bw_caches_its_alignment_for_dependent_layers() {
        let layer = layer(OutputLayerConfig::new("bw", 3, LossKind::FastBw));
        let data = vec![0.5f32, 0.1, 0.2, 0.1, 0.9, 0.3, 0.3, 0.2, 1.1];
        let z = Tensor::from_vec(data, (3, 1, 3), &Device::Cpu).expect("scores");
        let index = ValidityMask::all_valid(3, 1);
        let input = StepInput {
            scores: &z,
            index: &index,
            targets: Targets::Dense(DenseLabels::from_sequences(&[vec![0, 1]]).expect("labels")),
            phase: StepPhase::Train,
            tags: &[],
        };
        let mut alignments = StepAlignments::default();
        layer.step(&input, &mut alignments).expect("step");
        assert_eq!(
            alignments.get("bw").map(|t| t.dims().to_vec()),
            Some(vec![3, 1, 3])
        );
    }
}
