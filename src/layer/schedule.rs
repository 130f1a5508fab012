use std::collections::HashMap;

use candle_core::Tensor;

use crate::config::OutputLayerConfig;
use crate::error::LossError;

/// Soft alignments produced during one step, keyed by layer name.
///
/// A layer reading another layer's alignment through `ce_target_layer_align`
/// finds it here, provided [`schedule_layers`] put the producer first.
#[derive(Debug, Clone, Default)]
pub struct StepAlignments {
    alignments: HashMap<String, Tensor>,
}

impl StepAlignments {
    pub fn get(&self, layer: &str) -> Option<&Tensor> {
        self.alignments.get(layer)
    }

    pub fn insert(&mut self, layer: impl Into<String>, alignment: Tensor) -> Option<Tensor> {
        self.alignments.insert(layer.into(), alignment)
    }

    pub fn len(&self) -> usize {
        self.alignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alignments.is_empty()
    }

    /// Drops every cached alignment; called between steps.
    pub fn clear(&mut self) {
        self.alignments.clear();
    }
}

/// Evaluation order for `layers` such that every CE-smoothing consumer comes
/// after the layer whose alignment it reads. Ties keep the input order.
pub fn schedule_layers(layers: &[OutputLayerConfig]) -> Result<Vec<usize>, LossError> {
    let mut by_name = HashMap::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        if by_name.insert(layer.name.as_str(), i).is_some() {
            return Err(LossError::config(format!(
                "duplicate layer name '{}'",
                layer.name
            )));
        }
    }

    let mut dependency: Vec<Option<usize>> = Vec::with_capacity(layers.len());
    for layer in layers {
        let source = match layer.sequence.ce_target_layer_align.as_deref() {
            Some(source) if layer.sequence.ce_smoothing > 0.0 => source,
            _ => {
                dependency.push(None);
                continue;
            }
        };
        let &index = by_name.get(source).ok_or_else(|| {
            LossError::config(format!(
                "layer '{}' smooths towards unknown layer '{source}'",
                layer.name
            ))
        })?;
        dependency.push(Some(index));
    }

    let mut order = Vec::with_capacity(layers.len());
    let mut placed = vec![false; layers.len()];
    while order.len() < layers.len() {
        let ready = (0..layers.len())
            .find(|&i| !placed[i] && dependency[i].map_or(true, |d| placed[d]));
        let Some(next) = ready else {
            let stuck: Vec<&str> = (0..layers.len())
                .filter(|&i| !placed[i])
                .map(|i| layers[i].name.as_str())
                .collect();
            return Err(LossError::config(format!(
                "alignment dependency cycle between layers {stuck:?}"
            )));
        };
        placed[next] = true;
        order.push(next);
    }
    tracing::debug!(?order, "layer schedule");
    Ok(order)
}
