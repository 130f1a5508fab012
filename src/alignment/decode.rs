use crate::numeric::argmax;

/// Greedy CTC decoding: per-frame argmax, repeats collapsed, blanks dropped.
///
/// Example: `[a, a, blank, b, b, blank, a] -> [a, b, a]`
pub fn ctc_best_path(frames: &[Vec<f32>], blank: usize) -> Vec<usize> {
    let mut labels = Vec::new();
    let mut prev = blank;
    for row in frames {
        let label = argmax(row);
        if label != blank && label != prev {
            labels.push(label);
        }
        prev = label;
    }
    labels
}

/// Collapses runs of identical labels (no blank handling).
pub fn collapse_repeats(labels: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::with_capacity(labels.len());
    for &label in labels {
        if out.last() != Some(&label) {
            out.push(label);
        }
    }
    out
}

/// Levenshtein distance with unit insertion, deletion and substitution costs.
pub fn edit_distance(hyp: &[usize], reference: &[usize]) -> usize {
    if hyp.is_empty() {
        return reference.len();
    }
    let mut prev: Vec<usize> = (0..=reference.len()).collect();
    let mut curr = vec![0usize; reference.len() + 1];
    for (i, &h) in hyp.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &r) in reference.iter().enumerate() {
            let substitution = prev[j] + usize::from(h != r);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[reference.len()]
}
