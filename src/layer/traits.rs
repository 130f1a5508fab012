use crate::alignment::automaton::Automaton;
use crate::error::LossError;
use crate::host::Frames;

/// What an automaton provider gets to build one step's batch automaton.
#[derive(Debug, Clone, Copy)]
pub struct AutomatonRequest<'a> {
    /// Sequence tags, one per batch item (may be empty strings).
    pub tags: &'a [String],
    /// Reference labels of each batch item.
    pub label_sequences: &'a [Vec<usize>],
    pub n_classes: usize,
}

pub trait AutomatonProvider: Send + Sync {
    fn automaton(&self, request: &AutomatonRequest<'_>) -> Result<Automaton, LossError>;
}

/// Inputs handed to an external scorer (`sprint` / `warp_ctc` style).
#[derive(Debug, Clone, Copy)]
pub struct DelegateRequest<'a> {
    /// `[time][batch][class]` log-posteriors with the prior bias already applied.
    pub log_posteriors: &'a Frames,
    pub seq_lengths: &'a [usize],
    pub tags: &'a [String],
    /// `[batch][max_len]` reference labels padded with `-1`.
    pub labels: &'a [Vec<i32>],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelegateResponse {
    /// One loss per batch item.
    pub losses: Vec<f32>,
    /// `[time][batch][class]` gradient with respect to the scores.
    pub grad: Frames,
}

pub trait ExternalLossDelegate: Send + Sync {
    fn name(&self) -> &str;

    fn loss_and_grad(&self, request: &DelegateRequest<'_>) -> Result<DelegateResponse, LossError>;
}
