//! Error counting over the decode path matching each loss kind.

use crate::alignment::column_rows;
use crate::alignment::decode::{collapse_repeats, ctc_best_path, edit_distance};
use crate::alignment::inv_align::inv_errors;
use crate::alignment::two_state::two_state_errors;
use crate::config::LossKind;
use crate::error::LossError;
use crate::host::{to_frames, Frames};
use crate::loss::sequence::{hmm_log_emissions, viterbi_paths};
use crate::loss::LossInput;
use crate::numeric::{argmax, safe_ln};
use crate::types::Targets;

/// Error count of one step, `None` when the layer defines no error measure
/// (`sse`, a `"null"` target, or no reference at all).
///
/// Framewise kinds count argmax mismatches over the loss cells, scaled by the
/// time-limit norm. Sequence kinds count edit distance (or per-frame
/// mismatches for `viterbi`) against the decode path their loss uses.
pub fn count_errors(input: &LossInput<'_>) -> Result<Option<f32>, LossError> {
    let config = input.config;
    if config.has_null_target() || config.loss == LossKind::Sse {
        return Ok(None);
    }
    if matches!(input.targets, Targets::None) {
        return Ok(None);
    }
    let probs = to_frames(input.probs)?;
    let errors = match config.loss {
        LossKind::Ctc | LossKind::WarpCtc => {
            ctc_errors(input, &probs, input.label_sequences("ctc errors")?)?
        }
        LossKind::CeCtc => {
            let blank = config.blank();
            let references = input
                .label_sequences("ce_ctc errors")?
                .iter()
                .map(|seq| {
                    collapse_repeats(seq)
                        .into_iter()
                        .filter(|&l| l != blank)
                        .collect()
                })
                .collect();
            ctc_errors(input, &probs, references)?
        }
        LossKind::Hmm => two_state_error_count(input, &probs)?,
        LossKind::FastBw if config.sequence.fast_bw.decode => two_state_error_count(input, &probs)?,
        LossKind::Viterbi => {
            let paths = viterbi_paths(input)?;
            let mut errors = 0usize;
            for (b, path) in paths.iter().enumerate() {
                for (t, &label) in path.iter().enumerate() {
                    if argmax(&probs[t][b]) != label {
                        errors += 1;
                    }
                }
            }
            errors as f32
        }
        LossKind::Inv => {
            let references = input.label_sequences("inv errors")?;
            let lengths = input.source_mask.lengths();
            let costs: Frames = probs
                .iter()
                .map(|frame| {
                    frame
                        .iter()
                        .map(|row| row.iter().map(|&p| -safe_ln(p)).collect())
                        .collect()
                })
                .collect();
            let mut errors = 0usize;
            for (b, reference) in references.iter().enumerate() {
                let rows = column_rows(&costs, b, lengths[b]);
                errors += inv_errors(&rows, reference, &config.sequence.inv_penalties)?;
            }
            errors as f32
        }
        _ => return framewise_errors(input, &probs),
    };
    tracing::debug!(layer = %config.name, loss = %config.loss, errors, "errors counted");
    Ok(Some(errors))
}

fn ctc_errors(
    input: &LossInput<'_>,
    probs: &Frames,
    references: Vec<Vec<usize>>,
) -> Result<f32, LossError> {
    let lengths = input.source_mask.lengths();
    let blank = input.config.blank();
    if references.len() != lengths.len() {
        return Err(LossError::shape(
            "ctc errors",
            format!("{} references for {} sequences", references.len(), lengths.len()),
        ));
    }
    let errors: usize = references
        .iter()
        .enumerate()
        .map(|(b, reference)| {
            let decoded = ctc_best_path(&column_rows(probs, b, lengths[b]), blank);
            edit_distance(&decoded, reference)
        })
        .sum();
    Ok(errors as f32)
}

fn two_state_error_count(input: &LossInput<'_>, probs: &Frames) -> Result<f32, LossError> {
    let references = input.label_sequences("hmm errors")?;
    let lengths = input.source_mask.lengths();
    let log_emissions = hmm_log_emissions(input, probs)?;
    let errors: usize = references
        .iter()
        .enumerate()
        .map(|(b, reference)| {
            let rows = column_rows(&log_emissions, b, lengths[b]);
            two_state_errors(&rows, reference, input.transitions)
        })
        .sum();
    Ok(errors as f32)
}

fn framewise_errors(input: &LossInput<'_>, probs: &Frames) -> Result<Option<f32>, LossError> {
    let mask = input.loss_mask;
    let reference: Box<dyn Fn(usize, usize) -> usize + '_> = match input.targets {
        Targets::None => return Ok(None),
        Targets::Dense(labels) => {
            if labels.time() < mask.time() || labels.batch() != mask.batch() {
                return Err(LossError::shape(
                    "frame errors",
                    format!(
                        "labels {}x{} for a {}x{} loss mask",
                        labels.time(),
                        labels.batch(),
                        mask.time(),
                        mask.batch()
                    ),
                ));
            }
            Box::new(move |t, b| labels.get(t, b) as usize)
        }
        Targets::Sparse(sparse) => {
            if sparse.time() < mask.time() || sparse.batch() != mask.batch() {
                return Err(LossError::shape(
                    "frame errors",
                    "sparse targets do not cover the loss mask",
                ));
            }
            let labels = sparse.argmax_labels();
            let batch = sparse.batch();
            Box::new(move |t, b| labels[t * batch + b] as usize)
        }
        Targets::Soft(soft) => {
            let soft = to_frames(soft)?;
            let mut sum = 0.0f32;
            let mut cells = 0usize;
            for (t, b) in mask.valid_cells() {
                for (p, y) in probs[t][b].iter().zip(&soft[t][b]) {
                    sum += (p - y) * (p - y);
                }
                cells += 1;
            }
            let n_out = input.n_out().max(1);
            return Ok(Some(sum / (cells.max(1) * n_out) as f32));
        }
    };

    if input.config.normalize_length {
        let sequences = (0..mask.batch())
            .filter(|&b| {
                (0..mask.time()).any(|t| mask.get(t, b) && argmax(&probs[t][b]) != reference(t, b))
            })
            .count();
        return Ok(Some(sequences as f32));
    }
    let mismatches = mask
        .valid_cells()
        .filter(|&(t, b)| argmax(&probs[t][b]) != reference(t, b))
        .count();
    tracing::debug!(
        layer = %input.config.name,
        mismatches,
        cells = mask.count(),
        norm = input.norm,
        "frame errors"
    );
    Ok(Some(input.norm * mismatches as f32))
}
