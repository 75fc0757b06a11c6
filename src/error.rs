use thiserror::Error;

use crate::db::store::StoreError;
use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("translation unavailable: {0}")]
    Unavailable(#[source] LlmError),

    /// `raw` is the model text as received, kept for logs only.
    #[error("malformed translation: {reason}")]
    Malformed { reason: String, raw: String },
}

#[derive(Debug, Error)]
#[error("answer synthesis unavailable: {0}")]
pub struct SynthesisError(#[from] pub LlmError);

/// Failures that abort a request before any envelope exists.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("translation unavailable: {0}")]
    TranslationUnavailable(#[source] LlmError),

    #[error("malformed translation: {reason}")]
    MalformedTranslation { reason: String, raw: String },
}

impl From<TranslationError> for PipelineError {
    fn from(err: TranslationError) -> Self {
        match err {
            TranslationError::Unavailable(e) => PipelineError::TranslationUnavailable(e),
            TranslationError::Malformed { reason, raw } => {
                PipelineError::MalformedTranslation { reason, raw }
            }
        }
    }
}

impl PipelineError {
    /// Text safe to show an end user. Model output is never included.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::StoreUnavailable(e) => e.to_string(),
            PipelineError::TranslationUnavailable(_) => {
                "The language model could not be reached. Please try again.".to_string()
            }
            PipelineError::MalformedTranslation { .. } => {
                "The language model returned a response that could not be understood. Please try again."
                    .to_string()
            }
        }
    }
}
