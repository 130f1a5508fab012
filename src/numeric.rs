//! Floors, ceilings and log-space helpers shared by the heads, kernels and losses.
//!
//! The floor values are part of the observable behavior: they bound the
//! gradient magnitude near saturation, so each loss uses the one listed here.

/// Floor for probabilities entering a framewise cross-entropy logarithm.
pub const CE_FLOOR: f32 = 1e-38;
/// Floor/ceiling pair used when a probability tensor is taken to log space.
pub const PROB_FLOOR: f32 = 1e-20;
pub const PROB_CEIL: f32 = 1e20;
/// Floor applied to priors before they divide two-state HMM emissions.
pub const HMM_PRIOR_FLOOR: f32 = 1e-10;
/// Clip range of the self-entropy term of the `entropy` loss.
pub const ENTROPY_FLOOR: f32 = 1e-6;
pub const ENTROPY_CEIL: f32 = 1e6;

#[inline]
pub fn clip(x: f32, lo: f32, hi: f32) -> f32 {
    x.max(lo).min(hi)
}

/// `ln(clip(p, PROB_FLOOR, PROB_CEIL))`.
#[inline]
pub fn safe_ln(p: f32) -> f32 {
    clip(p, PROB_FLOOR, PROB_CEIL).ln()
}

/// `log(exp(a) + exp(b))`, exact for negative infinities.
#[inline]
pub fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

pub fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + xs.iter().map(|&x| (x - max).exp()).sum::<f32>().ln()
}

/// Index of the first maximum.
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Index of the first minimum.
pub fn argmin(row: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v < row[best] {
            best = i;
        }
    }
    best
}

pub fn softmax_row(row: &[f32]) -> Vec<f32> {
    let lse = log_sum_exp(row);
    row.iter().map(|&x| (x - lse).exp()).collect()
}

/// Normalized Gaussian window of radius `radius` (length `2 * radius + 1`).
pub fn gaussian_kernel(sigma: f32, radius: usize) -> Vec<f32> {
    let sigma = sigma.max(f32::EPSILON);
    let weights: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}
