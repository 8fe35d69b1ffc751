//! Pipeline orchestrator.
//!
//! Sequences one motion capture through load, classify, decide, upload,
//! notify, and record. Each invocation is independent: failures in the
//! storage or notification stages degrade the outcome for that image but
//! never crash the process or leak into the next image.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

use crate::classify::{load_image, Classification, Classifier};
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::history::DetectionHistory;
use crate::notify::{detection_message, error_message, NotificationRequest, Notifier};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::ObjectStore;

/// Consecutive classify failures before a higher-severity alert goes out.
/// Distinguishes a corrupted model from a one-off bad frame.
const SYSTEMIC_FAILURE_THRESHOLD: u32 = 3;

/// Decision policy and input limits, frozen at startup.
#[derive(Clone, Debug)]
pub struct PipelinePolicy {
    pub confidence_threshold: f32,
    pub background_label: String,
    pub max_file_size: u64,
    pub extensions: Vec<String>,
    pub suppression_window: Duration,
}

impl PipelinePolicy {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            confidence_threshold: cfg.model.confidence_threshold,
            background_label: cfg.model.background_label.clone(),
            max_file_size: cfg.motion.max_file_size,
            extensions: cfg.motion.extensions.clone(),
            suppression_window: cfg.notify.suppression_window,
        }
    }

    /// Notify iff the label is not the background class and the confidence
    /// clears the threshold.
    pub fn should_notify(&self, result: &Classification) -> bool {
        result.label != self.background_label && result.confidence >= self.confidence_threshold
    }
}

/// Terminal state of one pipeline invocation.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Detection met the policy and the notification was delivered.
    Notified {
        classification: Classification,
        image_url: Option<String>,
    },
    /// Detection met the policy but every send attempt failed; the detection
    /// itself still counts as a success.
    NotifyFailed { classification: Classification },
    /// Background class: recorded, never notified.
    Background(Classification),
    /// Confidence below threshold: recorded, not notified.
    BelowThreshold(Classification),
    /// Same label was already notified within the suppression window.
    Suppressed(Classification),
    /// Notifications disabled or no credentials available.
    NotificationsDisabled(Classification),
}

impl PipelineOutcome {
    pub fn classification(&self) -> &Classification {
        match self {
            PipelineOutcome::Notified { classification, .. }
            | PipelineOutcome::NotifyFailed { classification }
            | PipelineOutcome::Background(classification)
            | PipelineOutcome::BelowThreshold(classification)
            | PipelineOutcome::Suppressed(classification)
            | PipelineOutcome::NotificationsDisabled(classification) => classification,
        }
    }

    pub fn notified(&self) -> bool {
        matches!(self, PipelineOutcome::Notified { .. })
    }
}

pub struct Pipeline {
    policy: PipelinePolicy,
    classifier: Box<dyn Classifier>,
    notifier: Option<Box<dyn Notifier>>,
    store: Option<Box<dyn ObjectStore>>,
    history: DetectionHistory,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        policy: PipelinePolicy,
        classifier: Box<dyn Classifier>,
        notifier: Option<Box<dyn Notifier>>,
        store: Option<Box<dyn ObjectStore>>,
        history: DetectionHistory,
    ) -> Self {
        Self {
            policy,
            classifier,
            notifier,
            store,
            history,
            stats: PipelineStats::new(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn history(&self) -> &DetectionHistory {
        &self.history
    }

    pub fn notifier(&self) -> Option<&dyn Notifier> {
        self.notifier.as_deref()
    }

    pub fn store(&self) -> Option<&dyn ObjectStore> {
        self.store.as_deref()
    }

    /// Run one capture through the full pipeline.
    ///
    /// Errors are returned only when the image could not be classified at
    /// all; upload and notification failures are folded into the outcome.
    pub fn process(&mut self, image_path: &Path) -> Result<PipelineOutcome> {
        self.stats.record_processed();
        log::info!("processing capture {}", image_path.display());

        let image = match load_image(
            image_path,
            self.policy.max_file_size,
            &self.policy.extensions,
        ) {
            Ok(image) => image,
            Err(e) => {
                self.stats.record_error();
                log::error!("failed to read {}: {}", image_path.display(), e);
                return Err(e.into());
            }
        };

        let classification = match self.classifier.classify(&image) {
            Ok(result) => {
                if let Err(db_err) = self.history.reset_classify_failures() {
                    log::warn!("failed to reset classify-failure counter: {:#}", db_err);
                }
                result
            }
            Err(e) => {
                self.stats.record_error();
                // The counter lives in the history DB so it accumulates
                // across the one-process-per-capture invocations.
                match self.history.record_classify_failure() {
                    Ok(failures) => {
                        log::error!("classification failed ({} consecutive): {}", failures, e);
                        if failures == SYSTEMIC_FAILURE_THRESHOLD {
                            self.alert_systemic_failure(&e);
                        }
                    }
                    Err(db_err) => {
                        log::error!(
                            "classification failed: {}; failure counter unavailable: {:#}",
                            e,
                            db_err
                        );
                    }
                }
                return Err(e.into());
            }
        };

        log::info!(
            "classified {} as {} (confidence {:.3}, {:?})",
            image_path.display(),
            classification.label,
            classification.confidence,
            classification.inference_time
        );
        self.stats.record_detection(&classification.label);

        let path_str = image_path.to_string_lossy();

        if classification.label == self.policy.background_label {
            log::info!("background class, skipping notification");
            self.history
                .record(&classification.label, classification.confidence, Some(&path_str), false)?;
            return Ok(PipelineOutcome::Background(classification));
        }

        if classification.confidence < self.policy.confidence_threshold {
            log::info!(
                "confidence {:.3} below threshold {:.3}, skipping notification",
                classification.confidence,
                self.policy.confidence_threshold
            );
            self.history
                .record(&classification.label, classification.confidence, Some(&path_str), false)?;
            return Ok(PipelineOutcome::BelowThreshold(classification));
        }

        let Some(notifier) = self.notifier.as_deref() else {
            log::info!("notifications disabled, recording detection only");
            self.history
                .record(&classification.label, classification.confidence, Some(&path_str), false)?;
            return Ok(PipelineOutcome::NotificationsDisabled(classification));
        };

        if self
            .history
            .recently_notified(&classification.label, self.policy.suppression_window)?
        {
            log::info!(
                "{} already notified within {:?}, suppressing",
                classification.label,
                self.policy.suppression_window
            );
            self.history
                .record(&classification.label, classification.confidence, Some(&path_str), false)?;
            return Ok(PipelineOutcome::Suppressed(classification));
        }

        // Upload failure degrades to a text-only notification.
        let image_url = match self.store.as_deref() {
            Some(store) => match store.upload(image_path) {
                Ok(result) => {
                    log::info!("uploaded evidence to {}", result.public_url);
                    Some(result.public_url)
                }
                Err(e) => {
                    self.stats.record_error();
                    log::warn!("upload failed, sending text-only notification: {}", e);
                    None
                }
            },
            None => None,
        };

        let request = NotificationRequest {
            text: detection_message(&classification),
            image_url: image_url.clone(),
        };
        match notifier.send(&request) {
            Ok(()) => {
                self.stats.record_notified();
                self.history
                    .record(&classification.label, classification.confidence, Some(&path_str), true)?;
                log::info!("notification sent for {}", classification.label);
                Ok(PipelineOutcome::Notified {
                    classification,
                    image_url,
                })
            }
            Err(e) => {
                self.stats.record_error();
                self.history
                    .record(&classification.label, classification.confidence, Some(&path_str), false)?;
                log::error!("notification failed: {}", e);
                Ok(PipelineOutcome::NotifyFailed { classification })
            }
        }
    }

    /// Best-effort alert when classification keeps failing; the failure
    /// itself has already been returned to the caller.
    fn alert_systemic_failure(&self, err: &StageError) {
        let Some(notifier) = self.notifier.as_deref() else {
            return;
        };
        let request = NotificationRequest::text_only(error_message(&format!(
            "classifier failed {} times in a row: {}",
            SYSTEMIC_FAILURE_THRESHOLD, err
        )));
        if let Err(e) = notifier.send(&request) {
            log::error!("failed to deliver systemic-failure alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PipelinePolicy {
        PipelinePolicy {
            confidence_threshold: 0.75,
            background_label: "other".to_string(),
            max_file_size: 1024,
            extensions: vec!["jpg".to_string()],
            suppression_window: Duration::from_secs(300),
        }
    }

    fn classification(label: &str, confidence: f32) -> Classification {
        Classification {
            label: label.to_string(),
            confidence,
            inference_time: Duration::ZERO,
        }
    }

    #[test]
    fn notify_requires_non_background_label_above_threshold() {
        let policy = policy();
        assert!(policy.should_notify(&classification("chige", 0.9)));
        assert!(policy.should_notify(&classification("motsu", 0.75)));
        assert!(!policy.should_notify(&classification("other", 0.95)));
        assert!(!policy.should_notify(&classification("motsu", 0.6)));
    }
}
