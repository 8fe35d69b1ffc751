use image::RgbImage;
use std::time::Duration;

use crate::classify::{Classification, Classifier};
use crate::error::StageError;

/// Stub classifier returning a fixed result.
///
/// Selected with a `stub:<label>:<confidence>` model path; used by tests and
/// by `--test` self-checks on devices without a model deployed.
pub struct StubClassifier {
    label: String,
    confidence: f32,
}

impl StubClassifier {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// Parse a `stub:<label>:<confidence>` model-path spec.
    pub fn from_spec(spec: &str) -> Result<Self, StageError> {
        let rest = spec
            .strip_prefix("stub:")
            .ok_or_else(|| StageError::ModelUnavailable(format!("not a stub spec: {spec}")))?;
        let (label, confidence) = match rest.split_once(':') {
            Some((label, raw)) => {
                let confidence: f32 = raw.parse().map_err(|_| {
                    StageError::ModelUnavailable(format!("invalid stub confidence '{raw}'"))
                })?;
                (label, confidence)
            }
            None => (rest, 0.0),
        };
        if label.is_empty() {
            return Err(StageError::ModelUnavailable(
                "stub spec is missing a label".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(StageError::ModelUnavailable(format!(
                "stub confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(Self::new(label, confidence))
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&self, _image: &RgbImage) -> Result<Classification, StageError> {
        Ok(Classification {
            label: self.label.clone(),
            confidence: self.confidence,
            inference_time: Duration::ZERO,
        })
    }
}
