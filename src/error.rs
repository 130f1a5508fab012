use thiserror::Error;

#[derive(Debug, Error)]
pub enum LossError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("tensor error during {context}: {source}")]
    Tensor {
        context: &'static str,
        #[source]
        source: candle_core::Error,
    },
    #[error("invalid layer configuration: {message}")]
    Config { message: String },
    #[error("shape mismatch in {context}: {message}")]
    ShapeMismatch {
        context: &'static str,
        message: String,
    },
    #[error("non-finite value in {context}: {message}")]
    NumericDegenerate {
        context: &'static str,
        message: String,
    },
    #[error("external delegate failed during {context}: {message}")]
    ExternalDelegate {
        context: &'static str,
        message: String,
    },
}

impl LossError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn tensor(context: &'static str, source: candle_core::Error) -> Self {
        Self::Tensor { context, source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn shape(context: &'static str, message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context,
            message: message.into(),
        }
    }

    pub(crate) fn degenerate(context: &'static str, message: impl Into<String>) -> Self {
        Self::NumericDegenerate {
            context,
            message: message.into(),
        }
    }

    /// Wraps a failure reported by a pluggable collaborator (automaton provider,
    /// sprint or warp-ctc style delegate). Never retried by this crate.
    pub fn external(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ExternalDelegate {
            context,
            message: err.to_string(),
        }
    }
}

/// Adapter for `map_err` on candle results.
pub(crate) fn tensor_err(context: &'static str) -> impl Fn(candle_core::Error) -> LossError {
    move |e| LossError::tensor(context, e)
}
