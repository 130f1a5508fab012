//! Sparse frame selection: every label claims exactly one frame, frames in
//! between stay unaligned.
//!
//! The frame gap `j` between consecutive claimed frames (and from the virtual
//! frame `-1` to the first, and from the last to `T`) is charged
//! `penalties[min(j, 6)]`. Equal totals resolve towards the smaller gap.

use crate::error::LossError;
use crate::numeric::argmin;

pub type InvPenalties = [f32; 7];

const LONG_GAP: usize = 6;

#[inline]
fn gap_penalty(penalties: &InvPenalties, gap: usize) -> f32 {
    penalties[gap.min(LONG_GAP)]
}

/// Chooses one frame per position `k < n`, strictly increasing.
fn select_frames(
    t_len: usize,
    n: usize,
    penalties: &InvPenalties,
    emit: impl Fn(usize, usize) -> f32,
) -> Result<Vec<usize>, LossError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    if t_len < n {
        return Err(LossError::shape(
            "inv align",
            format!("{t_len} frames cannot carry {n} labels"),
        ));
    }
    let slack = t_len - n;
    let mut score = vec![f32::INFINITY; n * t_len];
    let mut bp = vec![0usize; n * t_len];

    for t in 0..=slack {
        score[t] = emit(0, t) + gap_penalty(penalties, t + 1);
    }
    for k in 1..n {
        let prev_row = (k - 1) * t_len;
        let row = k * t_len;
        // (value, frame) of the cheapest predecessor at least LONG_GAP back.
        let mut far: Option<(f32, usize)> = None;
        for t in k..=slack + k {
            if t >= LONG_GAP + k - 1 {
                let tp = t - LONG_GAP;
                let v = score[prev_row + tp];
                if far.map_or(true, |(best, _)| v <= best) {
                    far = Some((v, tp));
                }
            }
            let mut best = f32::INFINITY;
            let mut from = t - 1;
            for gap in 1..LONG_GAP {
                if gap > t || t - gap < k - 1 {
                    break;
                }
                let cand = score[prev_row + t - gap] + penalties[gap];
                if cand < best {
                    best = cand;
                    from = t - gap;
                }
            }
            if let Some((v, tp)) = far {
                let cand = v + penalties[LONG_GAP];
                if cand < best {
                    best = cand;
                    from = tp;
                }
            }
            score[row + t] = best + emit(k, t);
            bp[row + t] = from;
        }
    }

    let last_row = (n - 1) * t_len;
    let mut best = f32::INFINITY;
    let mut end = t_len - 1;
    for t in (n - 1..t_len).rev() {
        let cand = score[last_row + t] + gap_penalty(penalties, t_len - t);
        if cand < best {
            best = cand;
            end = t;
        }
    }
    if !best.is_finite() {
        return Err(LossError::degenerate(
            "inv align",
            format!("no finite selection of {n} frames out of {t_len}"),
        ));
    }

    let mut frames = vec![0usize; n];
    let mut t = end;
    for k in (0..n).rev() {
        frames[k] = t;
        if k > 0 {
            t = bp[k * t_len + t];
        }
    }
    Ok(frames)
}

/// Places each label of `labels` on one frame of `costs` (`-log` scores).
/// Unclaimed frames are `None` and carry no loss.
pub fn inv_align(
    costs: &[Vec<f32>],
    labels: &[usize],
    penalties: &InvPenalties,
) -> Result<Vec<Option<usize>>, LossError> {
    let n_classes = costs.first().map_or(0, Vec::len);
    if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(LossError::shape(
            "inv align",
            format!("label {bad} out of range for {n_classes} classes"),
        ));
    }
    let frames = select_frames(costs.len(), labels.len(), penalties, |k, t| {
        costs[t][labels[k]]
    })?;
    let mut path = vec![None; costs.len()];
    for (k, t) in frames.into_iter().enumerate() {
        path[t] = Some(labels[k]);
    }
    Ok(path)
}

/// Reference-free variant: selects `n_labels` frames under each frame's
/// cheapest class and emits that class.
pub fn inv_decode(
    costs: &[Vec<f32>],
    n_labels: usize,
    penalties: &InvPenalties,
) -> Result<Vec<Option<usize>>, LossError> {
    let frame_best: Vec<(usize, f32)> = costs
        .iter()
        .map(|row| {
            let c = argmin(row);
            (c, row.get(c).copied().unwrap_or(f32::INFINITY))
        })
        .collect();
    let frames = select_frames(costs.len(), n_labels, penalties, |_, t| frame_best[t].1)?;
    let mut path = vec![None; costs.len()];
    for t in frames {
        path[t] = Some(frame_best[t].0);
    }
    Ok(path)
}

/// Labels of the claimed frames in time order.
pub fn claimed_labels(path: &[Option<usize>]) -> Vec<usize> {
    path.iter().flatten().copied().collect()
}

/// Position-wise mismatches between the decoded labels and `reference`.
pub fn inv_errors(
    costs: &[Vec<f32>],
    reference: &[usize],
    penalties: &InvPenalties,
) -> Result<usize, LossError> {
    let decoded = claimed_labels(&inv_decode(costs, reference.len(), penalties)?);
    Ok(decoded
        .iter()
        .zip(reference)
        .filter(|(d, r)| d != r)
        .count())
}
