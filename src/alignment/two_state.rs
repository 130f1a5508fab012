//! Two-state HMM: every label is modelled by an entry state followed by an
//! exit state, each with a self loop.

use crate::alignment::decode::edit_distance;
use crate::alignment::SequencePosterior;
use crate::error::LossError;
use crate::numeric::log_add;

/// Log-space transition scores shared by every label.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transitions {
    pub self_loop: f32,
    pub forward: f32,
}

/// Forward-backward over the linear `2N`-state chain of `labels`.
///
/// `log_emissions[t][c]` is the log emission score of class `c` at frame `t`.
/// The path must start in the first state and end in the last one.
pub fn two_state_forward_backward(
    log_emissions: &[Vec<f32>],
    labels: &[usize],
    tdp: Transitions,
) -> Result<SequencePosterior, LossError> {
    let t_len = log_emissions.len();
    let n_classes = log_emissions.first().map_or(0, Vec::len);
    let s_len = 2 * labels.len();
    if labels.is_empty() {
        if t_len == 0 {
            return Ok(SequencePosterior {
                nll: 0.0,
                occupancy: Vec::new(),
            });
        }
        return Err(LossError::shape(
            "hmm",
            format!("{t_len} frames with an empty label sequence"),
        ));
    }
    if t_len < s_len {
        return Err(LossError::shape(
            "hmm",
            format!("{t_len} frames cannot visit {s_len} states"),
        ));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(LossError::shape(
            "hmm",
            format!("label {bad} out of range for {n_classes} classes"),
        ));
    }
    let emit = |t: usize, s: usize| log_emissions[t][labels[s / 2]];

    let mut alpha = vec![vec![f32::NEG_INFINITY; s_len]; t_len];
    alpha[0][0] = emit(0, 0);
    for t in 1..t_len {
        for s in 0..s_len {
            let mut acc = alpha[t - 1][s] + tdp.self_loop;
            if s >= 1 {
                acc = log_add(acc, alpha[t - 1][s - 1] + tdp.forward);
            }
            alpha[t][s] = acc + emit(t, s);
        }
    }

    let mut beta = vec![vec![f32::NEG_INFINITY; s_len]; t_len];
    beta[t_len - 1][s_len - 1] = 0.0;
    for t in (0..t_len - 1).rev() {
        for s in 0..s_len {
            let mut acc = beta[t + 1][s] + tdp.self_loop + emit(t + 1, s);
            if s + 1 < s_len {
                acc = log_add(acc, beta[t + 1][s + 1] + tdp.forward + emit(t + 1, s + 1));
            }
            beta[t][s] = acc;
        }
    }

    let log_likelihood = alpha[t_len - 1][s_len - 1];
    if !log_likelihood.is_finite() {
        return Err(LossError::degenerate(
            "hmm",
            format!("log-likelihood {log_likelihood} for {} labels", labels.len()),
        ));
    }

    let mut occupancy = vec![vec![0.0f32; n_classes]; t_len];
    for t in 0..t_len {
        let mut per_class = vec![f32::NEG_INFINITY; n_classes];
        for s in 0..s_len {
            let c = labels[s / 2];
            per_class[c] = log_add(per_class[c], alpha[t][s] + beta[t][s]);
        }
        for (c, lp) in per_class.into_iter().enumerate() {
            occupancy[t][c] = (lp - log_likelihood).exp();
        }
    }

    Ok(SequencePosterior {
        nll: -log_likelihood,
        occupancy,
    })
}

/// Unconstrained best path over `(class, entry|exit)` states.
///
/// A class label is emitted whenever the path enters an entry state from an
/// exit state (or starts in one). Self loops win ties against transitions.
pub fn two_state_best_path(log_emissions: &[Vec<f32>], tdp: Transitions) -> Vec<usize> {
    let t_len = log_emissions.len();
    let n_classes = log_emissions.first().map_or(0, Vec::len);
    if t_len == 0 || n_classes == 0 {
        return Vec::new();
    }

    let mut entry = log_emissions[0].clone();
    let mut exit = vec![f32::NEG_INFINITY; n_classes];
    // entry_bp: None = self loop, Some(c) = came from exit state of class c.
    let mut entry_bp: Vec<Vec<Option<usize>>> = vec![vec![None; n_classes]; t_len];
    // exit_bp: true = self loop, false = came from the class's entry state.
    let mut exit_bp = vec![vec![true; n_classes]; t_len];

    for t in 1..t_len {
        let row = &log_emissions[t];
        let (best_exit_class, best_exit) = exit
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (c, v)| {
                if v > best.1 {
                    (c, v)
                } else {
                    best
                }
            });
        let mut next_entry = vec![f32::NEG_INFINITY; n_classes];
        let mut next_exit = vec![f32::NEG_INFINITY; n_classes];
        for c in 0..n_classes {
            let stay = entry[c] + tdp.self_loop;
            let enter = best_exit + tdp.forward;
            if stay >= enter {
                next_entry[c] = stay + row[c];
            } else {
                next_entry[c] = enter + row[c];
                entry_bp[t][c] = Some(best_exit_class);
            }

            let stay = exit[c] + tdp.self_loop;
            let advance = entry[c] + tdp.forward;
            if stay >= advance {
                next_exit[c] = stay + row[c];
            } else {
                next_exit[c] = advance + row[c];
                exit_bp[t][c] = false;
            }
        }
        entry = next_entry;
        exit = next_exit;
    }

    // (class, is_exit)
    let mut state = (0usize, false);
    let mut best = f32::NEG_INFINITY;
    for c in 0..n_classes {
        if entry[c] > best {
            best = entry[c];
            state = (c, false);
        }
        if exit[c] > best {
            best = exit[c];
            state = (c, true);
        }
    }

    let mut labels = Vec::new();
    for t in (0..t_len).rev() {
        let (c, is_exit) = state;
        if is_exit {
            if !exit_bp[t][c] {
                state = (c, false);
            }
            continue;
        }
        match entry_bp[t][c] {
            Some(prev) => {
                labels.push(c);
                state = (prev, true);
            }
            None if t == 0 => labels.push(c),
            None => {}
        }
    }
    labels.reverse();
    labels
}

/// Edit distance between the two-state best path and `reference`.
pub fn two_state_errors(
    log_emissions: &[Vec<f32>],
    reference: &[usize],
    tdp: Transitions,
) -> usize {
    edit_distance(&two_state_best_path(log_emissions, tdp), reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ln_rows(rows: &[&[f32]]) -> Vec<Vec<f32>> {
        rows.iter()
            .map(|row| row.iter().map(|p| p.ln()).collect())
            .collect()
    }

    #[test]
    fn single_label_two_frames_is_deterministic() {
        let lp = ln_rows(&[&[0.6, 0.4], &[0.3, 0.7]]);
        let post = two_state_forward_backward(&lp, &[1], Transitions::default()).expect("hmm");
        assert!((post.nll + (0.4f32 * 0.7).ln()).abs() < 1e-5);
        assert!((post.occupancy[0][1] - 1.0).abs() < 1e-5);
        assert!(post.occupancy[1][0].abs() < 1e-6);
    }

    #[test]
    fn occupancy_rows_sum_to_one() {
        let lp = ln_rows(&[
            &[0.5, 0.3, 0.2],
            &[0.2, 0.6, 0.2],
            &[0.1, 0.2, 0.7],
            &[0.3, 0.3, 0.4],
            &[0.2, 0.1, 0.7],
        ]);
        let tdp = Transitions {
            self_loop: 0.5f32.ln(),
            forward: 0.5f32.ln(),
        };
        let post = two_state_forward_backward(&lp, &[0, 2], tdp).expect("hmm");
        assert!(post.nll > 0.0);
        for row in &post.occupancy {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn rejects_short_or_empty_sequences() {
        let lp = ln_rows(&[&[0.5, 0.5], &[0.5, 0.5], &[0.5, 0.5]]);
        assert!(two_state_forward_backward(&lp, &[0, 1], Transitions::default()).is_err());
        assert!(two_state_forward_backward(&lp, &[], Transitions::default()).is_err());
    }

    #[test]
    fn best_path_reads_entry_transitions() {
        let lp = ln_rows(&[
            &[0.9, 0.1],
            &[0.9, 0.1],
            &[0.1, 0.9],
            &[0.1, 0.9],
        ]);
        let path = two_state_best_path(&lp, Transitions::default());
        assert_eq!(path, vec![0, 1]);
        assert_eq!(two_state_errors(&lp, &[0, 1], Transitions::default()), 0);
        assert_eq!(two_state_errors(&lp, &[1], Transitions::default()), 1);
    }

    #[test]
    fn best_path_of_empty_input() {
        assert!(two_state_best_path(&[], Transitions::default()).is_empty());
    }
}
