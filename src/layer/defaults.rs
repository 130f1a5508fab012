use crate::alignment::automaton::{ctc_topology, Automaton};
use crate::alignment::column_rows;
use crate::alignment::ctc::ctc_forward_backward;
use crate::error::LossError;
use crate::layer::traits::{
    AutomatonProvider, AutomatonRequest, DelegateRequest, DelegateResponse, ExternalLossDelegate,
};
use crate::numeric::{safe_ln, softmax_row};

/// Builds a CTC topology straight from the reference labels.
pub struct LabelTopologyProvider {
    pub blank: usize,
}

impl AutomatonProvider for LabelTopologyProvider {
    fn automaton(&self, request: &AutomatonRequest<'_>) -> Result<Automaton, LossError> {
        if self.blank >= request.n_classes {
            return Err(LossError::config(format!(
                "blank {} out of range for {} classes",
                self.blank, request.n_classes
            )));
        }
        Ok(ctc_topology(request.label_sequences, self.blank))
    }
}

/// `warp_ctc` style delegate running this crate's CTC kernel.
///
/// The log-posteriors are renormalized per frame, so the returned gradient is
/// `softmax(x) - occupancy` for every valid frame.
pub struct NativeCtcDelegate {
    pub blank: usize,
}

impl ExternalLossDelegate for NativeCtcDelegate {
    fn name(&self) -> &str {
        "native-ctc"
    }

    fn loss_and_grad(&self, request: &DelegateRequest<'_>) -> Result<DelegateResponse, LossError> {
        let frames = request.log_posteriors;
        let time = frames.len();
        let batch = request.seq_lengths.len();
        let classes = frames
            .first()
            .and_then(|f| f.first())
            .map_or(0, Vec::len);
        if request.labels.len() != batch {
            return Err(LossError::external(
                "native ctc",
                format!("{} label rows for {batch} sequences", request.labels.len()),
            ));
        }
        let mut losses = Vec::with_capacity(batch);
        let mut grad = vec![vec![vec![0.0f32; classes]; batch]; time];
        for b in 0..batch {
            let len = request.seq_lengths[b];
            let labels: Vec<usize> = request.labels[b]
                .iter()
                .take_while(|&&l| l >= 0)
                .map(|&l| l as usize)
                .collect();
            let probs: Vec<Vec<f32>> = column_rows(frames, b, len)
                .iter()
                .map(|row| softmax_row(row))
                .collect();
            let log_probs: Vec<Vec<f32>> = probs
                .iter()
                .map(|row| row.iter().map(|&p| safe_ln(p)).collect())
                .collect();
            let posterior = ctc_forward_backward(&log_probs, &labels, self.blank)
                .map_err(|e| LossError::external("native ctc", e))?;
            for t in 0..len {
                for c in 0..classes {
                    grad[t][b][c] = probs[t][c] - posterior.occupancy[t][c];
                }
            }
            losses.push(posterior.nll);
        }
        Ok(DelegateResponse { losses, grad })
    }
}
