use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Per-stage failure taxonomy.
///
/// The orchestrator decides from the variant whether an error aborts the
/// invocation (input/model errors) or degrades the pipeline (upload and
/// notification errors).
#[derive(Debug, Error)]
pub enum StageError {
    #[error("image not found: {0}")]
    MissingInput(PathBuf),

    #[error("unsupported image extension '{0}'")]
    UnsupportedFormat(String),

    #[error("image is {actual} bytes, limit is {limit}")]
    OversizedInput { actual: u64, limit: u64 },

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("classifier unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference did not complete within {0:?}")]
    InferenceTimeout(Duration),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("notification rejected by API: {0}")]
    NotifyTerminal(String),

    #[error("notification failed after all retries: {0}")]
    NotifyExhausted(String),
}

impl StageError {
    /// True for errors where the image itself could not be read.
    /// These abort the per-image invocation with a non-zero exit.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            StageError::MissingInput(_)
                | StageError::UnsupportedFormat(_)
                | StageError::OversizedInput { .. }
                | StageError::Decode(_)
        )
    }
}
