use crate::codec::CodecError;

/// Errors from the typed-payload boundary. `UnknownStage` and `Validation`
/// are data-integrity failures: a persisted row that cannot be reconstructed
/// must surface loudly, never silently default.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("unknown stage name: {0}")]
    UnknownStage(String),

    #[error("invalid {stage} output: {detail}")]
    Validation {
        stage: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<CodecError> for TraceError {
    fn from(e: CodecError) -> Self {
        TraceError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Serialization(e.to_string())
    }
}
