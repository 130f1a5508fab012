use crate::error::LossError;

/// Monotonic hard alignment of `labels` to every frame.
///
/// `costs[t][c]` is a `-log` score. Each frame either repeats the previous
/// label or advances to the next one; the path starts on the first label and
/// ends on the last. Staying wins ties. Returns one label id per frame.
pub fn align_frames(costs: &[Vec<f32>], labels: &[usize]) -> Result<Vec<usize>, LossError> {
    let t_len = costs.len();
    let s_len = labels.len();
    if t_len == 0 && s_len == 0 {
        return Ok(Vec::new());
    }
    if s_len == 0 || t_len < s_len {
        return Err(LossError::shape(
            "viterbi align",
            format!("{t_len} frames cannot carry {s_len} labels"),
        ));
    }
    let n_classes = costs[0].len();
    if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(LossError::shape(
            "viterbi align",
            format!("label {bad} out of range for {n_classes} classes"),
        ));
    }

    let mut prev = vec![f32::INFINITY; s_len];
    let mut curr = vec![f32::INFINITY; s_len];
    // 0 = stay, 1 = advance
    let mut bp = vec![0u8; t_len * s_len];
    prev[0] = costs[0][labels[0]];

    for t in 1..t_len {
        let row = &costs[t];
        let remaining = t_len - 1 - t;
        let curr_start = (s_len - 1).saturating_sub(remaining);
        let curr_end = t.min(s_len - 1);
        curr.fill(f32::INFINITY);
        let bp_offset = t * s_len;
        for s in curr_start..=curr_end {
            let (best, step) = best_step(&prev, s);
            curr[s] = best + row[labels[s]];
            bp[bp_offset + s] = step;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    if !prev[s_len - 1].is_finite() {
        return Err(LossError::degenerate(
            "viterbi align",
            format!("no finite path over {t_len} frames"),
        ));
    }

    let mut s = s_len - 1;
    let mut path = Vec::with_capacity(t_len);
    path.push(labels[s]);
    for t in (1..t_len).rev() {
        if bp[t * s_len + s] == 1 {
            s -= 1;
        }
        path.push(labels[s]);
    }
    path.reverse();
    Ok(path)
}

#[inline(always)]
fn best_step(prev: &[f32], s: usize) -> (f32, u8) {
    let stay = prev[s];
    if s >= 1 && prev[s - 1] < stay {
        (prev[s - 1], 1)
    } else {
        (stay, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlog(rows: &[&[f32]]) -> Vec<Vec<f32>> {
        rows.iter()
            .map(|row| row.iter().map(|p| -p.ln()).collect())
            .collect()
    }

    #[test]
    fn follows_the_cheapest_monotonic_path() {
        let costs = nlog(&[
            &[0.8, 0.1, 0.1],
            &[0.7, 0.2, 0.1],
            &[0.1, 0.8, 0.1],
            &[0.1, 0.1, 0.8],
        ]);
        let path = align_frames(&costs, &[0, 1, 2]).expect("align");
        assert_eq!(path, vec![0, 0, 1, 2]);
    }

    #[test]
    fn every_label_is_visited_even_against_scores() {
        let costs = nlog(&[&[0.9, 0.1], &[0.9, 0.1], &[0.9, 0.1]]);
        let path = align_frames(&costs, &[0, 1]).expect("align");
        assert_eq!(path, vec![0, 0, 1]);
    }

    #[test]
    fn ties_prefer_staying() {
        // The last frame keeps label 1 rather than advancing into it late.
        let costs = nlog(&[&[0.5, 0.5], &[0.5, 0.5], &[0.5, 0.5]]);
        let path = align_frames(&costs, &[0, 1]).expect("align");
        assert_eq!(path, vec![0, 1, 1]);
    }

    #[test]
    fn rejects_more_labels_than_frames() {
        let costs = nlog(&[&[0.5, 0.5]]);
        let err = align_frames(&costs, &[0, 1]).unwrap_err();
        assert!(matches!(err, LossError::ShapeMismatch { .. }));
    }
}
