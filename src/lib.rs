pub mod alignment;
pub mod config;
pub mod error;
pub mod head;
pub mod host;
pub mod layer;
pub mod loss;
pub mod metrics;
pub mod numeric;
pub mod prior;
pub mod types;

pub use alignment::automaton::{ctc_topology, hmm_topology, Automaton, Edge};
pub use alignment::two_state::Transitions;
pub use config::{
    FastBwOptions, LossKind, OutputActivation, OutputLayerConfig, PriorConfig, SequenceConfig,
    TimeLimit,
};
pub use error::LossError;
pub use head::{activate, ProbabilityHead};
pub use layer::builder::OutputLayerBuilder;
pub use layer::defaults::{LabelTopologyProvider, NativeCtcDelegate};
pub use layer::runtime::{OutputLayer, PreparedStep, StepInput, StepOutput};
pub use layer::schedule::{schedule_layers, StepAlignments};
pub use layer::traits::{
    AutomatonProvider, AutomatonRequest, DelegateRequest, DelegateResponse, ExternalLossDelegate,
};
pub use prior::{Distortions, PriorEstimator, TrainedSoftmaxPrior};
pub use types::{
    DenseLabels, GradTarget, GradientOverrides, LossOutput, SparseEntry, SparseTargets,
    StepPhase, Targets, ValidityMask,
};
