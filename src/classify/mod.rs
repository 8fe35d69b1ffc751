//! Inference stage.
//!
//! Input images are validated and decoded up front so a corrupt file surfaces
//! as a `Decode` error rather than a classifier failure, then handed to a
//! [`Classifier`]. The tract backend runs the model on a dedicated worker
//! thread, which both enforces the inference timeout and guarantees at most
//! one inference in flight per process.

mod stub;
#[cfg(feature = "backend-tract")]
mod tract;
mod worker;

pub use stub::StubClassifier;
#[cfg(feature = "backend-tract")]
pub use tract::TractClassifier;

use image::RgbImage;
use std::path::Path;
use std::time::Duration;

use crate::error::StageError;

/// Result of classifying one image. Immutable; exactly one is produced per
/// successfully-read input image.
#[derive(Clone, Debug)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
    pub inference_time: Duration,
}

/// Classifier seam.
///
/// Implementations must return a label drawn from the configured class list
/// and a confidence in `[0, 1]`, and must not mutate shared state.
pub trait Classifier {
    fn name(&self) -> &'static str;

    fn classify(&self, image: &RgbImage) -> Result<Classification, StageError>;
}

/// Read and decode an input image, enforcing the format and size limits.
pub fn load_image(
    path: &Path,
    max_bytes: u64,
    extensions: &[String],
) -> Result<RgbImage, StageError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !extensions.iter().any(|allowed| allowed == &ext) {
        return Err(StageError::UnsupportedFormat(ext));
    }

    let meta = std::fs::metadata(path)
        .map_err(|_| StageError::MissingInput(path.to_path_buf()))?;
    if meta.len() > max_bytes {
        return Err(StageError::OversizedInput {
            actual: meta.len(),
            limit: max_bytes,
        });
    }

    let bytes =
        std::fs::read(path).map_err(|_| StageError::MissingInput(path.to_path_buf()))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| StageError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Index of the highest score.
pub(crate) fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if *score > scores[best] {
            best = i;
        }
    }
    best
}

/// Models exported without a softmax head emit logits; detect and normalize
/// so confidence is always a probability.
pub(crate) fn needs_softmax(scores: &[f32]) -> bool {
    scores.iter().any(|s| *s < 0.0 || *s > 1.0)
}

pub(crate) fn softmax(scores: &mut [f32]) {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for score in scores.iter_mut() {
        *score = (*score - max).exp();
        sum += *score;
    }
    if sum > 0.0 {
        for score in scores.iter_mut() {
            *score /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_highest_score() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[0.9, 0.05, 0.05]), 0);
        assert_eq!(argmax(&[0.0]), 0);
    }

    #[test]
    fn softmax_normalizes_logits() {
        let mut scores = vec![2.0f32, 1.0, 0.1];
        assert!(needs_softmax(&scores));
        softmax(&mut scores);
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(argmax(&scores), 0);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn probabilities_skip_softmax() {
        assert!(!needs_softmax(&[0.8, 0.15, 0.05]));
    }

    #[test]
    fn load_image_rejects_unknown_extension() {
        let err = load_image(
            Path::new("/tmp/capture.gif"),
            1024,
            &["jpg".to_string(), "png".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, StageError::UnsupportedFormat(_)));
    }

    #[test]
    fn load_image_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let err = load_image(&path, 1024, &["jpg".to_string()]).unwrap_err();
        assert!(matches!(err, StageError::OversizedInput { .. }));
    }

    #[test]
    fn load_image_reports_corrupt_file_as_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg at all").unwrap();
        let err = load_image(&path, 1024, &["jpg".to_string()]).unwrap_err();
        assert!(matches!(err, StageError::Decode(_)));
    }

    #[test]
    fn load_image_decodes_valid_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.png");
        let img = RgbImage::from_pixel(8, 8, image::Rgb([120u8, 30, 200]));
        img.save(&path).unwrap();
        let loaded = load_image(&path, 1024 * 1024, &["png".to_string()]).unwrap();
        assert_eq!(loaded.dimensions(), (8, 8));
    }

    #[test]
    fn load_image_reports_missing_file() {
        let err = load_image(
            Path::new("/nonexistent/capture.jpg"),
            1024,
            &["jpg".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, StageError::MissingInput(_)));
        assert!(err.is_input_error());
    }
}
