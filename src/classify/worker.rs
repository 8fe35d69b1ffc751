//! Dedicated inference thread.
//!
//! The worker owns whatever state `init` builds (for the tract backend, the
//! loaded model) and serializes all inference, so at most one forward pass
//! is in flight per process. Callers wait on a reply channel with a bounded
//! timeout; a slow pass surfaces as `InferenceTimeout` instead of stalling
//! the orchestrator.

use image::RgbImage;
use std::sync::mpsc;
use std::time::Duration;

use crate::classify::Classification;
use crate::error::StageError;

struct Job {
    image: RgbImage,
    reply: mpsc::Sender<Result<Classification, StageError>>,
}

#[derive(Debug)]
pub(crate) struct InferenceWorker {
    jobs: mpsc::Sender<Job>,
    timeout: Duration,
}

impl InferenceWorker {
    /// Spawn the worker thread. `init` runs on the thread before any job and
    /// builds the per-job handler; an init failure is reported back as
    /// `ModelUnavailable` and the thread exits.
    pub(crate) fn spawn<I, H>(timeout: Duration, init: I) -> Result<Self, StageError>
    where
        I: FnOnce() -> Result<H, String> + Send + 'static,
        H: FnMut(&RgbImage) -> Result<Classification, StageError>,
    {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        std::thread::Builder::new()
            .name("classifier".to_string())
            .spawn(move || {
                let mut handler = match init() {
                    Ok(handler) => {
                        let _ = ready_tx.send(Ok(()));
                        handler
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for job in jobs_rx {
                    // Receiver may have timed out and gone away; nothing to
                    // do then.
                    let _ = job.reply.send(handler(&job.image));
                }
            })
            .map_err(|e| StageError::ModelUnavailable(format!("spawn worker: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                jobs: jobs_tx,
                timeout,
            }),
            Ok(Err(e)) => Err(StageError::ModelUnavailable(e)),
            Err(_) => Err(StageError::ModelUnavailable(
                "classifier worker exited during startup".to_string(),
            )),
        }
    }

    pub(crate) fn classify(&self, image: &RgbImage) -> Result<Classification, StageError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.jobs
            .send(Job {
                image: image.clone(),
                reply: reply_tx,
            })
            .map_err(|_| {
                StageError::ModelUnavailable("classifier worker is gone".to_string())
            })?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(StageError::InferenceTimeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StageError::ModelUnavailable(
                "classifier worker died mid-inference".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(label: &str) -> Classification {
        Classification {
            label: label.to_string(),
            confidence: 0.9,
            inference_time: Duration::ZERO,
        }
    }

    #[test]
    fn fast_handler_replies_within_the_timeout() {
        let worker = InferenceWorker::spawn(Duration::from_secs(5), || {
            Ok(|_: &RgbImage| Ok(fixed("chige")))
        })
        .unwrap();
        let result = worker.classify(&RgbImage::new(1, 1)).unwrap();
        assert_eq!(result.label, "chige");
    }

    #[test]
    fn slow_handler_surfaces_as_inference_timeout() {
        let timeout = Duration::from_millis(20);
        let worker = InferenceWorker::spawn(timeout, move || {
            Ok(move |_: &RgbImage| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(fixed("chige"))
            })
        })
        .unwrap();

        let err = worker.classify(&RgbImage::new(1, 1)).unwrap_err();
        assert!(matches!(err, StageError::InferenceTimeout(t) if t == timeout));
    }

    #[test]
    fn init_failure_is_model_unavailable_at_startup() {
        let result = InferenceWorker::spawn(Duration::from_secs(1), || {
            Err::<fn(&RgbImage) -> Result<Classification, StageError>, _>(
                "model file is garbage".to_string(),
            )
        });
        match result {
            Err(StageError::ModelUnavailable(msg)) => assert!(msg.contains("garbage")),
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn worker_recovers_after_a_timed_out_job() {
        let worker = InferenceWorker::spawn(Duration::from_millis(20), || {
            let mut first = true;
            Ok(move |_: &RgbImage| {
                if first {
                    first = false;
                    std::thread::sleep(Duration::from_millis(100));
                }
                Ok(fixed("motsu"))
            })
        })
        .unwrap();

        assert!(matches!(
            worker.classify(&RgbImage::new(1, 1)).unwrap_err(),
            StageError::InferenceTimeout(_)
        ));
        // Let the worker finish draining the abandoned slow job.
        std::thread::sleep(Duration::from_millis(200));
        let result = worker.classify(&RgbImage::new(1, 1)).unwrap();
        assert_eq!(result.label, "motsu");
    }
}
