//! Dynamic-programming kernels over host rows (`frames x classes` per sequence).
//!
//! Every kernel works on a single sequence; the loss layer slices batch
//! columns out of the `[time, batch, class]` tensors and calls them per column.

pub mod automaton;
pub mod baum_welch;
pub mod ctc;
pub mod decode;
pub mod frame_align;
pub mod inv_align;
pub mod two_state;

/// Negative log-likelihood of one sequence together with its per-frame
/// class occupancy (each valid frame sums to one).
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePosterior {
    pub nll: f32,
    pub occupancy: Vec<Vec<f32>>,
}

/// Frames `0..len` of batch column `b`, as owned rows.
pub(crate) fn column_rows(data: &[Vec<Vec<f32>>], b: usize, len: usize) -> Vec<Vec<f32>> {
    data.iter().take(len).map(|frame| frame[b].clone()).collect()
}

/// Frames `0..len` of batch column `b`, mapped through `f` elementwise.
pub(crate) fn column_rows_map(
    data: &[Vec<Vec<f32>>],
    b: usize,
    len: usize,
    f: impl Fn(f32) -> f32,
) -> Vec<Vec<f32>> {
    data.iter()
        .take(len)
        .map(|frame| frame[b].iter().map(|&v| f(v)).collect())
        .collect()
}
