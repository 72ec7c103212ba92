use polres_core::ModelError;
use polres_selector::SelectorError;
use thiserror::Error;

pub type CalcResult<T> = Result<T, CalcError>;

#[derive(Debug, Error)]
pub enum CalcError {
    #[error("invalid selector {selector:?}: {source}")]
    InvalidSelector {
        selector: String,
        #[source]
        source: SelectorError,
    },

    #[error("computed data kind {kind:?} is already bound to selector {selector:?}")]
    KindInUse { kind: String, selector: String },

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl CalcError {
    pub(crate) fn invalid_selector(selector: &str, source: SelectorError) -> Self {
        CalcError::InvalidSelector { selector: selector.to_string(), source }
    }
}
