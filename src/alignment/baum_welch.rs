use std::collections::HashSet;

use crate::alignment::automaton::{Automaton, Edge};
use crate::error::LossError;
use crate::numeric::log_add;

/// Forward-backward result in `-log` space.
#[derive(Debug, Clone, PartialEq)]
pub struct BaumWelchOutput {
    /// `[time][batch][class]` negative log occupancy; `+inf` where a class
    /// carries no mass and on padded frames.
    pub fwdbwd: Vec<Vec<Vec<f32>>>,
    /// Negative log-likelihood of each sequence under the automaton.
    pub obs_scores: Vec<f32>,
}

/// Runs forward-backward for every batch item of `automaton`.
///
/// `am_scores[t][b][c]` are `-log` emission scores; sequence `b` consumes its
/// first `lengths[b]` frames, one edge per frame. Zero-length sequences are
/// skipped and report a score of zero.
pub fn baum_welch(
    am_scores: &[Vec<Vec<f32>>],
    lengths: &[usize],
    automaton: &Automaton,
) -> Result<BaumWelchOutput, LossError> {
    let t_len = am_scores.len();
    let batch = lengths.len();
    let n_classes = am_scores
        .first()
        .and_then(|frame| frame.first())
        .map_or(0, Vec::len);
    automaton.validate(batch, n_classes)?;
    if let Some(&len) = lengths.iter().find(|&&len| len > t_len) {
        return Err(LossError::shape(
            "baum-welch",
            format!("sequence length {len} exceeds {t_len} frames"),
        ));
    }

    let mut fwdbwd = vec![vec![vec![f32::INFINITY; n_classes]; batch]; t_len];
    let mut obs_scores = vec![0.0f32; batch];
    let mut per_sequence: Vec<Vec<&Edge>> = vec![Vec::new(); batch];
    for edge in &automaton.edges {
        per_sequence[edge.sequence].push(edge);
    }

    for (b, edges) in per_sequence.iter().enumerate() {
        let len = lengths[b];
        if len == 0 {
            continue;
        }
        let (start, end) = automaton.start_end_states[b];
        let states: HashSet<usize> = edges
            .iter()
            .flat_map(|e| [e.from, e.to])
            .chain([start, end])
            .collect();
        let lo = states.iter().copied().min().unwrap_or(start);
        let hi = states.iter().copied().max().unwrap_or(end);
        let width = hi - lo + 1;
        let emit = |t: usize, edge: &Edge| -edge.weight - am_scores[t][b][edge.emission];

        let mut alpha = vec![vec![f32::NEG_INFINITY; width]; len + 1];
        alpha[0][start - lo] = 0.0;
        for t in 0..len {
            for edge in edges {
                let from = alpha[t][edge.from - lo];
                if from == f32::NEG_INFINITY {
                    continue;
                }
                let slot = &mut alpha[t + 1][edge.to - lo];
                *slot = log_add(*slot, from + emit(t, edge));
            }
        }

        let mut beta = vec![vec![f32::NEG_INFINITY; width]; len + 1];
        beta[len][end - lo] = 0.0;
        for t in (0..len).rev() {
            for edge in edges {
                let to = beta[t + 1][edge.to - lo];
                if to == f32::NEG_INFINITY {
                    continue;
                }
                let slot = &mut beta[t][edge.from - lo];
                *slot = log_add(*slot, to + emit(t, edge));
            }
        }

        let log_z = alpha[len][end - lo];
        if !log_z.is_finite() {
            return Err(LossError::shape(
                "baum-welch",
                format!("sequence {b} has no path through {len} frames"),
            ));
        }
        obs_scores[b] = -log_z;

        let mut occupancy = vec![f32::NEG_INFINITY; n_classes];
        for t in 0..len {
            occupancy.fill(f32::NEG_INFINITY);
            for edge in edges {
                let mass = alpha[t][edge.from - lo] + emit(t, edge) + beta[t + 1][edge.to - lo];
                if mass == f32::NEG_INFINITY {
                    continue;
                }
                occupancy[edge.emission] = log_add(occupancy[edge.emission], mass);
            }
            for (c, &lp) in occupancy.iter().enumerate() {
                fwdbwd[t][b][c] = if lp == f32::NEG_INFINITY {
                    f32::INFINITY
                } else {
                    log_z - lp
                };
            }
        }
        tracing::trace!(sequence = b, frames = len, obs_score = -log_z, "baum-welch sequence");
    }

    Ok(BaumWelchOutput { fwdbwd, obs_scores })
}
