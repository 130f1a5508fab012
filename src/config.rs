use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::LossError;

/// Loss selector, fixed when the layer is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    None,
    Ce,
    Priori,
    Sse,
    Entropy,
    CeCtc,
    Ctc,
    Ctc2,
    Hmm,
    FastBw,
    Viterbi,
    Inv,
    Sprint,
    WarpCtc,
}

impl LossKind {
    pub const ALL: [LossKind; 14] = [
        LossKind::None,
        LossKind::Ce,
        LossKind::Priori,
        LossKind::Sse,
        LossKind::Entropy,
        LossKind::CeCtc,
        LossKind::Ctc,
        LossKind::Ctc2,
        LossKind::Hmm,
        LossKind::FastBw,
        LossKind::Viterbi,
        LossKind::Inv,
        LossKind::Sprint,
        LossKind::WarpCtc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LossKind::None => "none",
            LossKind::Ce => "ce",
            LossKind::Priori => "priori",
            LossKind::Sse => "sse",
            LossKind::Entropy => "entropy",
            LossKind::CeCtc => "ce_ctc",
            LossKind::Ctc => "ctc",
            LossKind::Ctc2 => "ctc2",
            LossKind::Hmm => "hmm",
            LossKind::FastBw => "fast_bw",
            LossKind::Viterbi => "viterbi",
            LossKind::Inv => "inv",
            LossKind::Sprint => "sprint",
            LossKind::WarpCtc => "warp_ctc",
        }
    }

    /// Sequence losses read their frames through the source index and their
    /// labels as a per-sequence label list rather than one label per frame.
    pub fn is_sequence(self) -> bool {
        matches!(
            self,
            LossKind::CeCtc
                | LossKind::Ctc
                | LossKind::Ctc2
                | LossKind::Hmm
                | LossKind::FastBw
                | LossKind::Viterbi
                | LossKind::Inv
                | LossKind::Sprint
                | LossKind::WarpCtc
        )
    }

    /// Losses whose labels are not aligned to frames.
    pub fn uses_label_sequences(self) -> bool {
        matches!(
            self,
            LossKind::Ctc
                | LossKind::Hmm
                | LossKind::Viterbi
                | LossKind::Inv
                | LossKind::WarpCtc
        )
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = LossError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LossKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LossError::config(format!("unknown loss kind '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    #[default]
    Softmax,
    Sigmoid,
    Exp,
    Gauss,
    Identity,
}

/// Frame budget applied to the loss cells before the loss is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawTimeLimit")]
pub enum TimeLimit {
    #[default]
    None,
    Frames(usize),
    /// Reconcile differing source/target lengths by padding the shorter side.
    Inf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimeLimit {
    Frames(usize),
    Named(String),
}

impl TryFrom<RawTimeLimit> for TimeLimit {
    type Error = String;

    fn try_from(raw: RawTimeLimit) -> Result<Self, Self::Error> {
        match raw {
            RawTimeLimit::Frames(0) => Ok(TimeLimit::None),
            RawTimeLimit::Frames(n) => Ok(TimeLimit::Frames(n)),
            RawTimeLimit::Named(name) if name == "inf" => Ok(TimeLimit::Inf),
            RawTimeLimit::Named(name) if name == "none" => Ok(TimeLimit::None),
            RawTimeLimit::Named(name) => Err(format!("invalid time_limit '{name}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorConfig {
    pub compute_priors: bool,
    /// Exponential average horizon; `0` selects the normalized batch mean.
    pub exp_average: f32,
    pub accumulate_batches: Option<usize>,
    /// Epochs (1-based, inclusive) during which one-hot label frequencies are
    /// used instead of the network output.
    pub use_label_priors: u32,
    pub via_baum_welch: bool,
}

/// Score shaping switches of the `fast_bw` loss. Unknown keys are rejected so
/// that every supplied option is guaranteed to be consumed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FastBwOptions {
    pub y_gauss_blur_sigma: Option<f32>,
    pub y_gauss_blur_window: Option<usize>,
    pub y_lower_clip: Option<f32>,
    pub loss_with_softmax_prob: bool,
    pub loss_with_sigmoid_prob: bool,
    pub log_score_penalty: Option<f32>,
    pub gauss_grad: bool,
    pub no_explicit_z_grad: bool,
    pub bw_norm_class_avg: bool,
    pub decode: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequenceConfig {
    pub ce_smoothing: f32,
    pub ce_target_layer_align: Option<String>,
    pub am_scale: f32,
    pub gamma: f32,
    pub bw_norm_class_avg: bool,
    pub loss_like_ce: bool,
    pub trained_softmax_prior: bool,
    pub fast_bw: FastBwOptions,
    pub inv_penalties: [f32; 7],
}

impl SequenceConfig {
    pub const DEFAULT_INV_PENALTIES: [f32; 7] = [1e10, 0.0, 1.9, 3.0, 2.5, 2.0, 1.4];
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            ce_smoothing: 0.0,
            ce_target_layer_align: None,
            am_scale: 1.0,
            gamma: 1.0,
            bw_norm_class_avg: false,
            loss_like_ce: false,
            trained_softmax_prior: false,
            fast_bw: FastBwOptions::default(),
            inv_penalties: Self::DEFAULT_INV_PENALTIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputLayerConfig {
    pub name: String,
    pub n_out: usize,
    pub loss: LossKind,
    pub activation: OutputActivation,
    pub apply_softmax: bool,
    pub time_limit: TimeLimit,
    pub use_source_index: bool,
    pub exclude_labels: Vec<u32>,
    pub softmax_smoothing: f32,
    pub grad_clip_z: Option<f32>,
    pub grad_discard_out_of_bound_z: Option<f32>,
    pub normalize_length: bool,
    pub prior_scale: f32,
    pub log_prior_path: Option<String>,
    pub substract_prior_from_output: bool,
    pub priors: PriorConfig,
    pub compute_distortions: bool,
    /// Defaults to the last class.
    pub blank_index: Option<usize>,
    /// `"null"` marks a layer without a reference; error counting is skipped.
    pub target: String,
    pub sequence: SequenceConfig,
}

impl Default for OutputLayerConfig {
    fn default() -> Self {
        Self {
            name: "output".to_string(),
            n_out: 0,
            loss: LossKind::Ce,
            activation: OutputActivation::Softmax,
            apply_softmax: true,
            time_limit: TimeLimit::None,
            use_source_index: false,
            exclude_labels: Vec::new(),
            softmax_smoothing: 1.0,
            grad_clip_z: None,
            grad_discard_out_of_bound_z: None,
            normalize_length: false,
            prior_scale: 0.0,
            log_prior_path: None,
            substract_prior_from_output: false,
            priors: PriorConfig::default(),
            compute_distortions: false,
            blank_index: None,
            target: "classes".to_string(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl OutputLayerConfig {
    pub const NULL_TARGET: &'static str = "null";

    pub fn new(name: impl Into<String>, n_out: usize, loss: LossKind) -> Self {
        Self {
            name: name.into(),
            n_out,
            loss,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, LossError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| LossError::io("read layer config", e))?;
        serde_json::from_str(&data).map_err(|e| LossError::json("parse layer config", e))
    }

    pub fn blank(&self) -> usize {
        self.blank_index.unwrap_or(self.n_out.saturating_sub(1))
    }

    pub fn has_null_target(&self) -> bool {
        self.target == Self::NULL_TARGET
    }

    /// Scale used when the prior is subtracted from the output; an unset
    /// scale means a plain division by the prior.
    pub(crate) fn output_prior_scale(&self) -> f32 {
        if self.prior_scale == 0.0 {
            1.0
        } else {
            self.prior_scale
        }
    }

    pub fn validate(&self) -> Result<(), LossError> {
        if self.n_out == 0 {
            return Err(LossError::config("n_out must be > 0"));
        }
        if !self.apply_softmax && self.loss != LossKind::Ce {
            return Err(LossError::config(format!(
                "apply_softmax = false is only supported for loss 'ce', got '{}'",
                self.loss
            )));
        }
        if !(self.softmax_smoothing.is_finite() && self.softmax_smoothing > 0.0) {
            return Err(LossError::config(format!(
                "softmax_smoothing must be a positive finite factor, got {}",
                self.softmax_smoothing
            )));
        }
        if self.blank() >= self.n_out {
            return Err(LossError::config(format!(
                "blank index {} out of range for {} classes",
                self.blank(),
                self.n_out
            )));
        }
        if let Some(bad) = self
            .exclude_labels
            .iter()
            .find(|&&label| label as usize >= self.n_out)
        {
            return Err(LossError::config(format!(
                "excluded label {bad} out of range for {} classes",
                self.n_out
            )));
        }
        if self.priors.via_baum_welch && !self.priors.compute_priors {
            return Err(LossError::config(
                "priors.via_baum_welch requires priors.compute_priors",
            ));
        }
        if self.priors.exp_average < 0.0 {
            return Err(LossError::config("priors.exp_average must be >= 0"));
        }
        if self.priors.accumulate_batches == Some(0) {
            return Err(LossError::config("priors.accumulate_batches must be >= 1"));
        }
        let seq = &self.sequence;
        if seq.trained_softmax_prior && self.priors.compute_priors {
            return Err(LossError::config(
                "sequence.trained_softmax_prior cannot be combined with priors.compute_priors",
            ));
        }
        if !(0.0..=1.0).contains(&seq.ce_smoothing) {
            return Err(LossError::config(format!(
                "sequence.ce_smoothing must lie in [0, 1], got {}",
                seq.ce_smoothing
            )));
        }
        if self.loss == LossKind::FastBw
            && seq.ce_smoothing > 0.0
            && seq.ce_target_layer_align.is_none()
        {
            return Err(LossError::config(
                "fast_bw with ce_smoothing needs sequence.ce_target_layer_align",
            ));
        }
        if seq.fast_bw.loss_with_softmax_prob && seq.fast_bw.loss_with_sigmoid_prob {
            return Err(LossError::config(
                "fast_bw options loss_with_softmax_prob and loss_with_sigmoid_prob are exclusive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_layer_config_default() {
        let config = OutputLayerConfig::default();
        assert_eq!(config.loss, LossKind::Ce);
        assert_eq!(config.activation, OutputActivation::Softmax);
        assert!(config.apply_softmax);
        assert_eq!(config.time_limit, TimeLimit::None);
        assert_eq!(config.softmax_smoothing, 1.0);
        assert_eq!(config.sequence.am_scale, 1.0);
        assert_eq!(
            config.sequence.inv_penalties,
            SequenceConfig::DEFAULT_INV_PENALTIES
        );
    }

    #[test]
    fn blank_defaults_to_last_class() {
        let config = OutputLayerConfig::new("out", 5, LossKind::Ctc);
        assert_eq!(config.blank(), 4);
        let config = OutputLayerConfig {
            blank_index: Some(0),
            ..config
        };
        assert_eq!(config.blank(), 0);
    }

    #[test]
    fn parses_loss_kind_and_time_limit() {
        let json = r#"{
            "name": "output",
            "n_out": 10,
            "loss": "fast_bw",
            "time_limit": "inf",
            "sequence": {
                "am_scale": 0.7,
                "fast_bw": { "y_gauss_blur_sigma": 1.5, "gauss_grad": true }
            }
        }"#;
        let config: OutputLayerConfig = serde_json::from_str(json).expect("valid config json");
        assert_eq!(config.loss, LossKind::FastBw);
        assert_eq!(config.time_limit, TimeLimit::Inf);
        assert!((config.sequence.am_scale - 0.7).abs() < 1e-6);
        assert_eq!(config.sequence.fast_bw.y_gauss_blur_sigma, Some(1.5));
        assert!(config.sequence.fast_bw.gauss_grad);

        let config: OutputLayerConfig =
            serde_json::from_str(r#"{"n_out": 3, "time_limit": 7}"#).expect("frames");
        assert_eq!(config.time_limit, TimeLimit::Frames(7));
        let config: OutputLayerConfig =
            serde_json::from_str(r#"{"n_out": 3, "time_limit": 0}"#).expect("zero");
        assert_eq!(config.time_limit, TimeLimit::None);
    }

    #[test]
    fn rejects_unknown_loss_and_unknown_fast_bw_option() {
        let unknown_loss = serde_json::from_str::<OutputLayerConfig>(r#"{"loss": "mmi"}"#);
        assert!(unknown_loss.is_err());
        let unknown_opt = serde_json::from_str::<OutputLayerConfig>(
            r#"{"sequence": {"fast_bw": {"y_upper_clip": 1.0}}}"#,
        );
        assert!(unknown_opt.is_err());
        assert!("mmi".parse::<LossKind>().is_err());
        assert_eq!("warp_ctc".parse::<LossKind>().expect("known"), LossKind::WarpCtc);
    }

    #[test]
    fn loss_kind_tags_round_trip_through_from_str() {
        for kind in LossKind::ALL {
            assert_eq!(kind.as_str().parse::<LossKind>().expect("tag"), kind);
        }
    }

    #[test]
    fn validate_rejects_inconsistent_options() {
        let mut config = OutputLayerConfig::new("out", 4, LossKind::Ctc);
        config.apply_softmax = false;
        assert!(matches!(config.validate(), Err(LossError::Config { .. })));

        let mut config = OutputLayerConfig::new("out", 4, LossKind::FastBw);
        config.sequence.trained_softmax_prior = true;
        config.priors.compute_priors = true;
        assert!(config.validate().is_err());

        let mut config = OutputLayerConfig::new("out", 4, LossKind::FastBw);
        config.sequence.ce_smoothing = 0.5;
        assert!(config.validate().is_err());
        config.sequence.ce_target_layer_align = Some("other".to_string());
        assert!(config.validate().is_ok());

        let mut config = OutputLayerConfig::new("out", 4, LossKind::Ce);
        config.priors.via_baum_welch = true;
        assert!(config.validate().is_err());

        let config = OutputLayerConfig::new("out", 0, LossKind::Ce);
        assert!(config.validate().is_err());
    }
}
