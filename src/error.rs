//! Error taxonomy shared by every layer of the engine.

use thiserror::Error;

use crate::units::UnitError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A value does not satisfy the specification of the field it was written to.
    #[error("invalid value provided for {container} {key}: {reason}")]
    Validation {
        container: String,
        key: String,
        reason: String,
    },

    /// A declared field was read before anything was stored under it.
    #[error("{container} {key} has not been set")]
    Missing { container: String, key: String },

    /// A selector could not be resolved against the current model.
    #[error("cannot resolve {selector}: {reason}")]
    Lookup { selector: String, reason: String },

    /// The component a variable writes into no longer exists.
    #[error("target {selector} of variable {item} no longer exists")]
    Target { selector: String, item: String },

    #[error("individual still invalid after {passes} repair passes (first failing variable: {variable})")]
    RepairFailure { variable: String, passes: usize },

    /// The model raised while running; the only locally recovered kind.
    #[error("model evaluation failed in {component}: {reason}")]
    ModelEvaluation { component: String, reason: String },

    #[error("sampling gave up after {failed} failed runs with {successes}/{requested} successful samples")]
    SamplingExhausted {
        failed: usize,
        successes: usize,
        requested: usize,
    },

    #[error("configuration rejected: {0}")]
    Config(String),

    #[error("{0} is not allowed once the run has started")]
    AlreadyStarted(&'static str),

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error("result serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(
        container: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Validation {
            container: container.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn lookup(selector: impl ToString, reason: impl Into<String>) -> Self {
        Error::Lookup {
            selector: selector.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the optimiser should score the individual as a failure rather
    /// than abort: a model that raised, a nested analysis that ran out of
    /// retries, or an objective that was never produced.
    pub fn is_evaluation_failure(&self) -> bool {
        matches!(
            self,
            Error::ModelEvaluation { .. } | Error::SamplingExhausted { .. } | Error::Missing { .. }
        )
    }
}
