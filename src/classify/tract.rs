#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::time::{Duration, Instant};

use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::classify::worker::InferenceWorker;
use crate::classify::{argmax, needs_softmax, softmax, Classification, Classifier};
use crate::error::StageError;

type RunnableModel = TypedSimplePlan<TypedModel>;

/// Tract-based ONNX classifier.
///
/// The model is loaded once, at startup, on the [`InferenceWorker`] thread;
/// a model-load failure is fatal at construction, never per call.
pub struct TractClassifier {
    worker: InferenceWorker,
}

impl TractClassifier {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        class_names: Vec<String>,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<Self, StageError> {
        let model_path = model_path.as_ref().to_path_buf();
        let worker = InferenceWorker::spawn(timeout, move || {
            let model = load_model(&model_path, width, height)?;
            Ok(move |image: &RgbImage| {
                let started = Instant::now();
                run_once(&model, &class_names, width, height, image).map(
                    |(label, confidence)| Classification {
                        label,
                        confidence,
                        inference_time: started.elapsed(),
                    },
                )
            })
        })?;
        Ok(Self { worker })
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn classify(&self, image: &RgbImage) -> Result<Classification, StageError> {
        self.worker.classify(image)
    }
}

fn load_model(model_path: &Path, width: u32, height: u32) -> Result<RunnableModel, String> {
    tract_onnx::onnx()
        .model_for_path(model_path)
        .map_err(|e| format!("failed to load ONNX model from {}: {e}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, height as usize, width as usize),
            ),
        )
        .map_err(|e| format!("failed to set input fact: {e}"))?
        .into_optimized()
        .map_err(|e| format!("failed to optimize ONNX model: {e}"))?
        .into_runnable()
        .map_err(|e| format!("failed to build runnable ONNX model: {e}"))
}

fn run_once(
    model: &RunnableModel,
    class_names: &[String],
    width: u32,
    height: u32,
    image: &RgbImage,
) -> Result<(String, f32), StageError> {
    let input = build_input(image, width, height);
    let outputs = model
        .run(tvec!(input.into()))
        .map_err(|e| StageError::Inference(format!("forward pass failed: {e}")))?;
    let output = outputs
        .first()
        .ok_or_else(|| StageError::Inference("model produced no outputs".to_string()))?;
    let view = output
        .to_array_view::<f32>()
        .map_err(|_| StageError::Inference("model output tensor was not f32".to_string()))?;

    let mut scores: Vec<f32> = view.iter().cloned().collect();
    if scores.len() != class_names.len() {
        return Err(StageError::Inference(format!(
            "model produced {} scores for {} configured classes",
            scores.len(),
            class_names.len()
        )));
    }
    if needs_softmax(&scores) {
        softmax(&mut scores);
    }

    let best = argmax(&scores);
    Ok((class_names[best].clone(), scores[best].clamp(0.0, 1.0)))
}

/// Resize to the model input shape and lay pixels out NCHW, scaled to [0, 1].
fn build_input(image: &RgbImage, width: u32, height: u32) -> Tensor {
    let resized = if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width, height, imageops::FilterType::Lanczos3)
    };

    let width = width as usize;
    let input = tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width),
        |(_, channel, y, x)| {
            let pixel = resized.get_pixel(x as u32, y as u32);
            pixel[channel] as f32 / 255.0
        },
    );
    input.into_tensor()
}
