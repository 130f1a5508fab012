use std::path::Path;

use crate::config::{LossKind, OutputLayerConfig};
use crate::error::LossError;
use crate::layer::defaults::{LabelTopologyProvider, NativeCtcDelegate};
use crate::layer::runtime::{OutputLayer, OutputLayerParts};
use crate::layer::traits::{AutomatonProvider, ExternalLossDelegate};
use crate::prior::{load_log_prior, PriorEstimator, TrainedSoftmaxPrior};

pub struct OutputLayerBuilder {
    config: OutputLayerConfig,
    automaton_provider: Option<Box<dyn AutomatonProvider>>,
    loss_delegate: Option<Box<dyn ExternalLossDelegate>>,
    log_prior: Option<Vec<f32>>,
}

impl OutputLayerBuilder {
    pub fn new(config: OutputLayerConfig) -> Self {
        Self {
            config,
            automaton_provider: None,
            loss_delegate: None,
            log_prior: None,
        }
    }

    pub fn with_automaton_provider(mut self, provider: Box<dyn AutomatonProvider>) -> Self {
        self.automaton_provider = Some(provider);
        self
    }

    pub fn with_loss_delegate(mut self, delegate: Box<dyn ExternalLossDelegate>) -> Self {
        self.loss_delegate = Some(delegate);
        self
    }

    /// `+log` prior used instead of `log_prior_path`.
    pub fn with_log_prior(mut self, log_prior: Vec<f32>) -> Self {
        self.log_prior = Some(log_prior);
        self
    }

    pub fn build(self) -> Result<OutputLayer, LossError> {
        let config = self.config;
        config.validate()?;
        let n_out = config.n_out;

        let loaded = match (self.log_prior, config.log_prior_path.as_deref()) {
            (Some(log_prior), _) => {
                if log_prior.len() != n_out {
                    return Err(LossError::config(format!(
                        "log prior has {} values, expected {n_out}",
                        log_prior.len()
                    )));
                }
                Some(log_prior)
            }
            (None, Some(path)) => Some(load_log_prior(Path::new(path), n_out)?),
            (None, None) => None,
        };

        let trained_prior = if config.sequence.trained_softmax_prior {
            Some(TrainedSoftmaxPrior::new(n_out, loaded.as_deref())?)
        } else {
            None
        };
        // A running estimate always starts uniform; a loaded prior only
        // serves layers that do not compute their own.
        let prior = match (&trained_prior, loaded.as_deref()) {
            (Some(_), _) => None,
            (None, loaded) if config.priors.compute_priors => {
                if loaded.is_some() {
                    tracing::warn!(
                        layer = %config.name,
                        "compute_priors is set; the loaded log prior is ignored"
                    );
                }
                Some(PriorEstimator::new(n_out, config.priors.clone()))
            }
            (None, Some(log_prior)) => Some(PriorEstimator::from_log_prior(
                log_prior,
                config.priors.clone(),
            )),
            (None, None) => None,
        };
        if config.substract_prior_from_output && prior.is_none() && trained_prior.is_none() {
            return Err(LossError::config(
                "substract_prior_from_output needs a loaded, computed or trained prior",
            ));
        }

        let automaton_provider = match (config.loss, self.automaton_provider) {
            (_, Some(provider)) => Some(provider),
            (LossKind::FastBw, None) => Some(Box::new(LabelTopologyProvider {
                blank: config.blank(),
            }) as Box<dyn AutomatonProvider>),
            (_, None) => None,
        };
        let delegate = match (config.loss, self.loss_delegate) {
            (_, Some(delegate)) => Some(delegate),
            (LossKind::WarpCtc, None) => Some(Box::new(NativeCtcDelegate {
                blank: config.blank(),
            }) as Box<dyn ExternalLossDelegate>),
            (LossKind::Sprint, None) => {
                return Err(LossError::config("loss 'sprint' needs a loss delegate"));
            }
            (_, None) => None,
        };

        let prior_source = match (&trained_prior, &prior) {
            (Some(_), _) => "trained",
            (None, Some(_)) if config.priors.compute_priors => "running",
            (None, Some(_)) if loaded.is_some() => "loaded",
            (None, Some(_)) => "running",
            (None, None) => "none",
        };
        tracing::info!(
            layer = %config.name,
            loss = %config.loss,
            n_out,
            prior = prior_source,
            delegate = delegate.as_ref().map(|d| d.name()).unwrap_or("none"),
            "output layer built"
        );

        Ok(OutputLayer::from_parts(OutputLayerParts {
            config,
            prior,
            trained_prior,
            automaton_provider,
            delegate,
        }))
    }
}
