use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::error::{tensor_err, LossError};

/// Boolean `[time, batch]` grid of cells that carry real (non-padded) frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityMask {
    time: usize,
    batch: usize,
    cells: Vec<bool>,
}

impl ValidityMask {
    pub fn new(time: usize, batch: usize, cells: Vec<bool>) -> Result<Self, LossError> {
        if cells.len() != time * batch {
            return Err(LossError::shape(
                "validity mask",
                format!("{} cells for a {time}x{batch} grid", cells.len()),
            ));
        }
        Ok(Self { time, batch, cells })
    }

    pub fn all_valid(time: usize, batch: usize) -> Self {
        Self {
            time,
            batch,
            cells: vec![true; time * batch],
        }
    }

    /// Left-aligned sequences: column `b` is valid for `t < lengths[b]`.
    pub fn from_lengths(lengths: &[usize], time: usize) -> Result<Self, LossError> {
        let batch = lengths.len();
        if let Some(&too_long) = lengths.iter().find(|&&len| len > time) {
            return Err(LossError::shape(
                "validity mask",
                format!("sequence length {too_long} exceeds {time} frames"),
            ));
        }
        let mut cells = vec![false; time * batch];
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len {
                cells[t * batch + b] = true;
            }
        }
        Ok(Self { time, batch, cells })
    }

    /// Any non-zero entry of a `[time, batch]` tensor marks a valid cell.
    pub fn from_tensor(index: &Tensor) -> Result<Self, LossError> {
        let (time, batch) = index
            .dims2()
            .map_err(|e| LossError::shape("validity mask", e.to_string()))?;
        let rows: Vec<Vec<f32>> = index
            .to_dtype(candle_core::DType::F32)
            .and_then(|t| t.to_vec2())
            .map_err(tensor_err("validity mask to_vec2"))?;
        let cells = rows.into_iter().flatten().map(|v| v > 0.0).collect();
        Ok(Self { time, batch, cells })
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn get(&self, t: usize, b: usize) -> bool {
        self.cells[t * self.batch + b]
    }

    #[inline]
    pub fn set(&mut self, t: usize, b: usize, valid: bool) {
        self.cells[t * self.batch + b] = valid;
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&v| v).count()
    }

    /// Valid cells per batch column.
    pub fn lengths(&self) -> Vec<usize> {
        (0..self.batch)
            .map(|b| (0..self.time).filter(|&t| self.get(t, b)).count())
            .collect()
    }

    /// Valid `(t, b)` pairs in time-major order.
    pub fn valid_cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let batch = self.batch;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, &v)| v)
            .map(move |(i, _)| (i / batch, i % batch))
    }

    pub fn check_shape(
        &self,
        time: usize,
        batch: usize,
        context: &'static str,
    ) -> Result<(), LossError> {
        if self.time != time || self.batch != batch {
            return Err(LossError::shape(
                context,
                format!(
                    "mask is {}x{}, expected {time}x{batch}",
                    self.time, self.batch
                ),
            ));
        }
        Ok(())
    }

    /// Invalidates every frame at or after `end`.
    pub fn truncate(&mut self, end: usize) {
        for t in end.min(self.time)..self.time {
            for b in 0..self.batch {
                self.set(t, b, false);
            }
        }
    }

    /// Appends `frames` rows, all set to `valid`.
    pub fn extend(&mut self, frames: usize, valid: bool) {
        self.cells
            .extend(std::iter::repeat(valid).take(frames * self.batch));
        self.time += frames;
    }

    /// `[time, batch]` f32 tensor of zeros and ones.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor, LossError> {
        let data: Vec<f32> = self
            .cells
            .iter()
            .map(|&v| if v { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(data, (self.time, self.batch), device)
            .map_err(tensor_err("validity mask to tensor"))
    }
}

/// Integer labels laid out `[position, batch]` with their own validity mask.
///
/// Framewise losses expect one position per frame; sequence losses read each
/// column's valid positions as that sequence's label list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseLabels {
    labels: Vec<u32>,
    mask: ValidityMask,
}

impl DenseLabels {
    pub fn new(labels: Vec<u32>, mask: ValidityMask) -> Result<Self, LossError> {
        if labels.len() != mask.time() * mask.batch() {
            return Err(LossError::shape(
                "dense labels",
                format!(
                    "{} labels for a {}x{} mask",
                    labels.len(),
                    mask.time(),
                    mask.batch()
                ),
            ));
        }
        Ok(Self { labels, mask })
    }

    /// Framewise labels whose mask is fully valid.
    pub fn framewise(rows: &[Vec<u32>]) -> Result<Self, LossError> {
        let time = rows.len();
        let batch = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != batch) {
            return Err(LossError::shape("dense labels", "ragged label rows"));
        }
        let labels = rows.iter().flatten().copied().collect();
        Self::new(labels, ValidityMask::all_valid(time, batch))
    }

    /// Pads per-sequence label lists to `[max_len, batch]`.
    pub fn from_sequences(sequences: &[Vec<u32>]) -> Result<Self, LossError> {
        let batch = sequences.len();
        let time = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let mask = ValidityMask::from_lengths(&lengths, time)?;
        let mut labels = vec![0u32; time * batch];
        for (b, seq) in sequences.iter().enumerate() {
            for (t, &label) in seq.iter().enumerate() {
                labels[t * batch + b] = label;
            }
        }
        Self::new(labels, mask)
    }

    pub fn from_tensor(labels: &Tensor, mask: ValidityMask) -> Result<Self, LossError> {
        let (time, batch) = labels
            .dims2()
            .map_err(|e| LossError::shape("dense labels", e.to_string()))?;
        mask.check_shape(time, batch, "dense labels")?;
        let rows: Vec<Vec<u32>> = labels
            .to_dtype(candle_core::DType::U32)
            .and_then(|t| t.to_vec2())
            .map_err(tensor_err("dense labels to_vec2"))?;
        Self::new(rows.into_iter().flatten().collect(), mask)
    }

    pub fn time(&self) -> usize {
        self.mask.time()
    }

    pub fn batch(&self) -> usize {
        self.mask.batch()
    }

    pub fn mask(&self) -> &ValidityMask {
        &self.mask
    }

    pub(crate) fn mask_mut(&mut self) -> &mut ValidityMask {
        &mut self.mask
    }

    #[inline]
    pub fn get(&self, t: usize, b: usize) -> u32 {
        self.labels[t * self.batch() + b]
    }

    /// Label at a valid cell, `None` for padding.
    pub fn valid_label(&self, t: usize, b: usize) -> Option<u32> {
        self.mask.get(t, b).then(|| self.get(t, b))
    }

    /// Each column's valid labels in position order.
    pub fn sequences(&self) -> Vec<Vec<usize>> {
        (0..self.batch())
            .map(|b| {
                (0..self.time())
                    .filter(|&t| self.mask.get(t, b))
                    .map(|t| self.get(t, b) as usize)
                    .collect()
            })
            .collect()
    }

    pub fn check_range(&self, n_out: usize) -> Result<(), LossError> {
        for (t, b) in self.mask.valid_cells() {
            let label = self.get(t, b);
            if label as usize >= n_out {
                return Err(LossError::shape(
                    "dense labels",
                    format!("label {label} at ({t}, {b}) out of range for {n_out} classes"),
                ));
            }
        }
        Ok(())
    }

    /// Appends `frames` positions with label 0 and the given validity.
    pub(crate) fn extend(&mut self, frames: usize, valid: bool) {
        self.labels
            .extend(std::iter::repeat(0).take(frames * self.batch()));
        self.mask.extend(frames, valid);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseEntry {
    pub time: usize,
    pub class: usize,
    pub weight: f32,
}

/// Alignment-free weighted targets, one COO entry list per batch column.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTargets {
    time: usize,
    entries: Vec<Vec<SparseEntry>>,
}

impl SparseTargets {
    pub fn new(time: usize, entries: Vec<Vec<SparseEntry>>) -> Result<Self, LossError> {
        for (b, column) in entries.iter().enumerate() {
            if let Some(bad) = column.iter().find(|e| e.time >= time) {
                return Err(LossError::shape(
                    "sparse targets",
                    format!("entry at frame {} of column {b} beyond {time} frames", bad.time),
                ));
            }
        }
        Ok(Self { time, entries })
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn batch(&self) -> usize {
        self.entries.len()
    }

    pub fn column(&self, b: usize) -> &[SparseEntry] {
        &self.entries[b]
    }

    pub fn check_range(&self, n_out: usize) -> Result<(), LossError> {
        for column in &self.entries {
            if let Some(bad) = column.iter().find(|e| e.class >= n_out) {
                return Err(LossError::shape(
                    "sparse targets",
                    format!("class {} out of range for {n_out} classes", bad.class),
                ));
            }
        }
        Ok(())
    }

    /// Highest-weight class per frame; frames without entries get class 0.
    pub fn argmax_labels(&self) -> Vec<u32> {
        let batch = self.batch();
        let mut best = vec![(0u32, -1e16f32); self.time * batch];
        for (b, column) in self.entries.iter().enumerate() {
            for entry in column {
                let slot = &mut best[entry.time * batch + b];
                if entry.weight > slot.1 {
                    *slot = (entry.class as u32, entry.weight);
                }
            }
        }
        best.into_iter().map(|(class, _)| class).collect()
    }
}

/// Reference supplied alongside the scores of one step.
#[derive(Debug, Clone)]
pub enum Targets {
    /// No reference (the `"null"` target).
    None,
    Dense(DenseLabels),
    Sparse(SparseTargets),
    /// Real-valued `[time, batch, class]` targets.
    Soft(Tensor),
}

/// Tensors an explicit gradient can be supplied for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradTarget {
    /// Pre-activation scores `z`.
    Scores,
    /// Head output, used when the head is the identity.
    Probabilities,
    /// Logits of a trained softmax prior.
    TrainedPrior,
}

/// Gradients that replace ordinary differentiation of the scalar loss for
/// the named tensors.
#[derive(Debug, Clone, Default)]
pub struct GradientOverrides {
    grads: HashMap<GradTarget, Tensor>,
}

impl GradientOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: GradTarget, grad: Tensor) -> Self {
        self.grads.insert(target, grad);
        self
    }

    pub fn insert(&mut self, target: GradTarget, grad: Tensor) -> Option<Tensor> {
        self.grads.insert(target, grad)
    }

    pub fn remove(&mut self, target: GradTarget) -> Option<Tensor> {
        self.grads.remove(&target)
    }

    pub fn get(&self, target: GradTarget) -> Option<&Tensor> {
        self.grads.get(&target)
    }

    pub fn contains(&self, target: GradTarget) -> bool {
        self.grads.contains_key(&target)
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }
}

/// Maps an explicit gradient computed against the prepared scores back onto
/// the caller's scores, then applies the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreGradTransform {
    /// Factor the caller's scores were multiplied by (`softmax_smoothing`).
    pub scale: f32,
    /// Caller frame count when the prepared scores were padded in time.
    pub source_frames: Option<usize>,
    pub clip: Option<f32>,
    pub discard_out_of_bound: Option<f32>,
}

impl Default for ScoreGradTransform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            source_frames: None,
            clip: None,
            discard_out_of_bound: None,
        }
    }
}

impl ScoreGradTransform {
    pub fn has_bounds(&self) -> bool {
        self.clip.is_some() || self.discard_out_of_bound.is_some()
    }

    /// Chain rule through time padding (padded frames replicate the last
    /// caller frame) and the score scaling.
    pub fn to_source(&self, grad: &Tensor) -> Result<Tensor, LossError> {
        let map = || -> candle_core::Result<Tensor> {
            let mut grad = grad.clone();
            if let Some(frames) = self.source_frames {
                let time = grad.dim(0)?;
                if frames > 0 && time > frames {
                    let last = grad.narrow(0, frames - 1, time - frames + 1)?.sum_keepdim(0)?;
                    grad = if frames == 1 {
                        last
                    } else {
                        Tensor::cat(&[&grad.narrow(0, 0, frames - 1)?, &last], 0)?
                    };
                }
            }
            if self.scale != 1.0 {
                grad = grad.affine(f64::from(self.scale), 0.0)?;
            }
            Ok(grad)
        };
        map().map_err(tensor_err("score gradient to source"))
    }

    pub fn apply_bounds(&self, grad: &Tensor, scores: &Tensor) -> Result<Tensor, LossError> {
        let mut grad = grad.clone();
        if let Some(c) = self.clip {
            grad = grad.clamp(-c, c).map_err(tensor_err("grad_clip_z"))?;
        }
        if let Some(c) = self.discard_out_of_bound {
            let in_bound = scores
                .abs()
                .and_then(|a| a.le(c))
                .and_then(|m| m.to_dtype(grad.dtype()))
                .map_err(tensor_err("grad_discard_out_of_bound_z"))?;
            grad = (grad * in_bound).map_err(tensor_err("grad_discard_out_of_bound_z"))?;
        }
        Ok(grad)
    }
}

/// Result of one loss evaluation.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Rank-0 loss. Differentiable through candle when `known_grads` is empty.
    pub loss: Tensor,
    pub known_grads: GradientOverrides,
    /// Per-class occupancy summed over frames and sequences (`ctc`, `hmm`).
    pub class_occupancy: Option<Tensor>,
    /// Soft alignment `[time, batch, class]` produced by `fast_bw`.
    pub alignment: Option<Tensor>,
    /// Prior update source replacing the output mean (Baum-Welch priors).
    pub prior_update: Option<Vec<f32>>,
    pub score_grad: ScoreGradTransform,
}

impl LossOutput {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            known_grads: GradientOverrides::new(),
            class_occupancy: None,
            alignment: None,
            prior_update: None,
            score_grad: ScoreGradTransform::default(),
        }
    }

    pub fn with_grads(loss: Tensor, known_grads: GradientOverrides) -> Self {
        Self {
            known_grads,
            ..Self::new(loss)
        }
    }

    pub fn value(&self) -> Result<f32, LossError> {
        self.loss
            .to_dtype(candle_core::DType::F32)
            .and_then(|t| t.to_scalar::<f32>())
            .map_err(tensor_err("loss to_scalar"))
    }

    /// Gradient for `tensor`: the supplied override when there is one,
    /// otherwise candle backpropagation of the scalar loss. `None` when
    /// `tensor` is not a variable of the loss graph. For
    /// [`GradTarget::Scores`], `tensor` is the caller's score tensor.
    pub fn gradient(
        &self,
        target: GradTarget,
        tensor: &Tensor,
    ) -> Result<Option<Tensor>, LossError> {
        let grad = match (target, self.known_grads.get(target)) {
            (GradTarget::Scores, Some(grad)) => Some(self.score_grad.to_source(grad)?),
            (_, Some(grad)) => Some(grad.clone()),
            (_, None) => {
                let store = self.loss.backward().map_err(tensor_err("backward"))?;
                store.get(tensor).cloned()
            }
        };
        match (target, grad) {
            (GradTarget::Scores, Some(grad)) if self.score_grad.has_bounds() => {
                Ok(Some(self.score_grad.apply_bounds(&grad, tensor)?))
            }
            (_, grad) => Ok(grad),
        }
    }

    pub fn gradient_for_scores(&self, scores: &Tensor) -> Result<Option<Tensor>, LossError> {
        self.gradient(GradTarget::Scores, scores)
    }
}

/// Training steps pad mismatched lengths; evaluation falls back to the
/// source index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPhase {
    #[default]
    Train,
    Eval,
}
