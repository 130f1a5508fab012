use crate::alignment::SequencePosterior;
use crate::error::LossError;
use crate::numeric::{log_add, log_sum_exp};

/// `[blank, l1, blank, l2, ..., lN, blank]`.
pub fn extend_with_blanks(labels: &[usize], blank: usize) -> Vec<usize> {
    let mut extended = Vec::with_capacity(2 * labels.len() + 1);
    extended.push(blank);
    for &label in labels {
        extended.push(label);
        extended.push(blank);
    }
    extended
}

/// Fewest frames a CTC path over `labels` can occupy: one per label plus a
/// separating blank between equal neighbours.
pub fn min_frames(labels: &[usize]) -> usize {
    labels.len() + labels.windows(2).filter(|w| w[0] == w[1]).count()
}

#[inline]
fn can_skip(extended: &[usize], s: usize, blank: usize) -> bool {
    s >= 2 && extended[s] != blank && extended[s] != extended[s - 2]
}

/// Rejects labels that are the blank or out of range, a blank outside the
/// classes, and sequences too short for their labels.
fn check_inputs(log_probs: &[Vec<f32>], labels: &[usize], blank: usize) -> Result<(), LossError> {
    let t_len = log_probs.len();
    let n_classes = log_probs.first().map_or(0, Vec::len);
    if t_len > 0 && blank >= n_classes {
        return Err(LossError::shape(
            "ctc",
            format!("blank {blank} outside {n_classes} classes"),
        ));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes.max(1) || l == blank) {
        return Err(LossError::shape(
            "ctc",
            format!("label {bad} is the blank or outside {n_classes} classes"),
        ));
    }
    let required = min_frames(labels);
    if t_len < required || (t_len == 0 && !labels.is_empty()) {
        return Err(LossError::shape(
            "ctc",
            format!("{t_len} frames cannot carry {} labels ({required} frames needed)", labels.len()),
        ));
    }
    Ok(())
}

/// CTC forward-backward over one sequence.
///
/// `log_probs` are per-frame class log-probabilities (already floored). The
/// returned occupancy is the posterior of each class at each frame; for a
/// softmax head the gradient with respect to the scores is `y - occupancy`.
pub fn ctc_forward_backward(
    log_probs: &[Vec<f32>],
    labels: &[usize],
    blank: usize,
) -> Result<SequencePosterior, LossError> {
    let t_len = log_probs.len();
    let n_classes = log_probs.first().map_or(0, Vec::len);
    check_inputs(log_probs, labels, blank)?;
    if t_len == 0 {
        return Ok(SequencePosterior {
            nll: 0.0,
            occupancy: Vec::new(),
        });
    }

    let extended = extend_with_blanks(labels, blank);
    let s_len = extended.len();

    let mut alpha = vec![vec![f32::NEG_INFINITY; s_len]; t_len];
    alpha[0][0] = log_probs[0][extended[0]];
    if s_len > 1 {
        alpha[0][1] = log_probs[0][extended[1]];
    }
    for t in 1..t_len {
        for s in 0..s_len {
            let mut acc = alpha[t - 1][s];
            if s >= 1 {
                acc = log_add(acc, alpha[t - 1][s - 1]);
            }
            if can_skip(&extended, s, blank) {
                acc = log_add(acc, alpha[t - 1][s - 2]);
            }
            alpha[t][s] = acc + log_probs[t][extended[s]];
        }
    }

    let mut beta = vec![vec![f32::NEG_INFINITY; s_len]; t_len];
    beta[t_len - 1][s_len - 1] = 0.0;
    if s_len > 1 {
        beta[t_len - 1][s_len - 2] = 0.0;
    }
    for t in (0..t_len - 1).rev() {
        for s in 0..s_len {
            let mut acc = beta[t + 1][s] + log_probs[t + 1][extended[s]];
            if s + 1 < s_len {
                acc = log_add(acc, beta[t + 1][s + 1] + log_probs[t + 1][extended[s + 1]]);
            }
            if s + 2 < s_len && can_skip(&extended, s + 2, blank) {
                acc = log_add(acc, beta[t + 1][s + 2] + log_probs[t + 1][extended[s + 2]]);
            }
            beta[t][s] = acc;
        }
    }

    let log_likelihood = if s_len > 1 {
        log_add(alpha[t_len - 1][s_len - 1], alpha[t_len - 1][s_len - 2])
    } else {
        alpha[t_len - 1][0]
    };
    if !log_likelihood.is_finite() {
        return Err(LossError::degenerate(
            "ctc",
            format!("log-likelihood {log_likelihood} for {} labels", labels.len()),
        ));
    }

    let mut occupancy = vec![vec![0.0f32; n_classes]; t_len];
    let mut per_class = vec![f32::NEG_INFINITY; n_classes];
    for t in 0..t_len {
        per_class.fill(f32::NEG_INFINITY);
        for s in 0..s_len {
            let c = extended[s];
            per_class[c] = log_add(per_class[c], alpha[t][s] + beta[t][s]);
        }
        for (c, &lp) in per_class.iter().enumerate() {
            occupancy[t][c] = (lp - log_likelihood).exp();
        }
    }

    Ok(SequencePosterior {
        nll: -log_likelihood,
        occupancy,
    })
}

/// Forward pass only: `-log p(labels | frames)` by log-sum-exp reduction.
pub fn ctc_nll(log_probs: &[Vec<f32>], labels: &[usize], blank: usize) -> Result<f32, LossError> {
    let t_len = log_probs.len();
    check_inputs(log_probs, labels, blank)?;
    if t_len == 0 {
        return Ok(0.0);
    }
    let extended = extend_with_blanks(labels, blank);
    let s_len = extended.len();
    let mut prev = vec![f32::NEG_INFINITY; s_len];
    let mut curr = vec![f32::NEG_INFINITY; s_len];
    prev[0] = log_probs[0][extended[0]];
    if s_len > 1 {
        prev[1] = log_probs[0][extended[1]];
    }
    for row in &log_probs[1..] {
        for s in 0..s_len {
            let mut terms = [f32::NEG_INFINITY; 3];
            terms[0] = prev[s];
            if s >= 1 {
                terms[1] = prev[s - 1];
            }
            if can_skip(&extended, s, blank) {
                terms[2] = prev[s - 2];
            }
            curr[s] = log_sum_exp(&terms) + row[extended[s]];
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let tail = if s_len > 1 {
        log_add(prev[s_len - 1], prev[s_len - 2])
    } else {
        prev[0]
    };
    Ok(-tail)
}
