//! Notification stage.
//!
//! Serializes a [`NotificationRequest`] into the push API's payload and posts
//! it with the shared retry policy. Images are always passed by reference
//! (public URL); when upload failed or storage is disabled the request simply
//! carries no URL and degrades to a text-only message.

use chrono::Local;
use std::time::Duration;

use crate::classify::Classification;
use crate::config::{NotifyCredentials, NotifySettings};
use crate::error::StageError;
use crate::history::DailyStats;
use crate::retry::{Attempt, RetryPolicy};
use crate::stats::StatsSnapshot;

/// One message to deliver, built by the orchestrator and discarded after the
/// send attempt.
#[derive(Clone, Debug)]
pub struct NotificationRequest {
    pub text: String,
    pub image_url: Option<String>,
}

impl NotificationRequest {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_url: None,
        }
    }
}

/// Notifier seam. The push implementation is [`PushNotifier`]; tests swap in
/// recording fakes.
pub trait Notifier {
    fn send(&self, request: &NotificationRequest) -> Result<(), StageError>;
}

/// How an HTTP status from the push API is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusDisposition {
    Success,
    Retryable,
    Terminal,
}

pub fn status_disposition(status: u16) -> StatusDisposition {
    match status {
        200..=299 => StatusDisposition::Success,
        429 => StatusDisposition::Retryable,
        500..=599 => StatusDisposition::Retryable,
        _ => StatusDisposition::Terminal,
    }
}

/// HTTPS push-message client with bearer-token auth and bounded retries.
pub struct PushNotifier {
    agent: ureq::Agent,
    api_url: String,
    access_token: String,
    recipient: String,
    retry: RetryPolicy,
}

impl PushNotifier {
    pub fn new(settings: &NotifySettings, credentials: &NotifyCredentials) -> Self {
        Self::with_retry_policy(
            &settings.api_url,
            credentials,
            settings.timeout,
            settings.retry_policy(),
        )
    }

    pub fn with_retry_policy(
        api_url: &str,
        credentials: &NotifyCredentials,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            api_url: api_url.to_string(),
            access_token: credentials.access_token.clone(),
            recipient: credentials.recipient.clone(),
            retry,
        }
    }

    fn payload(&self, request: &NotificationRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "type": "text",
            "text": request.text,
        })];
        if let Some(url) = &request.image_url {
            messages.push(serde_json::json!({
                "type": "image",
                "originalContentUrl": url,
                "previewImageUrl": url,
            }));
        }
        serde_json::json!({ "to": self.recipient, "messages": messages })
    }
}

impl Notifier for PushNotifier {
    fn send(&self, request: &NotificationRequest) -> Result<(), StageError> {
        let payload = self.payload(request);
        self.retry.run(|attempt| {
            if attempt > 0 {
                log::warn!(
                    "retrying notification (attempt {}/{})",
                    attempt + 1,
                    self.retry.max_retries + 1
                );
            }
            let response = self
                .agent
                .post(&self.api_url)
                .set("Authorization", &format!("Bearer {}", self.access_token))
                .send_json(payload.clone());
            match response {
                Ok(_) => Attempt::Done(()),
                Err(ureq::Error::Status(code, _)) => match status_disposition(code) {
                    StatusDisposition::Success => Attempt::Done(()),
                    StatusDisposition::Retryable => Attempt::Retry(StageError::NotifyExhausted(
                        format!("push API returned HTTP {code}"),
                    )),
                    StatusDisposition::Terminal => Attempt::Fatal(StageError::NotifyTerminal(
                        format!("push API returned HTTP {code}"),
                    )),
                },
                Err(ureq::Error::Transport(t)) => {
                    Attempt::Retry(StageError::NotifyExhausted(t.to_string()))
                }
            }
        })
    }
}

/// Detection message shown to the operator.
pub fn detection_message(result: &Classification) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!(
        "Detected {} (confidence {:.1}%)\nat {}",
        result.label,
        result.confidence * 100.0,
        timestamp
    )
}

pub fn startup_message() -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("catwatch started at {timestamp}\nmonitoring for motion captures")
}

pub fn error_message(detail: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("catwatch error at {timestamp}\n{detail}\ncheck the device logs")
}

/// Daily digest built from the durable history plus process counters.
pub fn summary_message(daily: &DailyStats, stats: &StatsSnapshot) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M");
    let mut lines = vec![
        format!("Daily detection summary ({timestamp})"),
        String::new(),
    ];
    for (label, count) in &daily.per_label {
        lines.push(format!("  {label}: {count}"));
    }
    lines.push(format!("  total: {}", daily.total));
    lines.push(format!("  notifications sent: {}", daily.notified));
    lines.push(String::new());
    lines.push(format!(
        "process uptime {:.1}h, {} errors",
        stats.uptime_hours(),
        stats.errors
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn notifier() -> PushNotifier {
        PushNotifier::with_retry_policy(
            "https://push.example/v1/send",
            &NotifyCredentials {
                access_token: "token".to_string(),
                recipient: "user-1".to_string(),
            },
            Duration::from_secs(5),
            RetryPolicy::new(3, Duration::ZERO),
        )
    }

    #[test]
    fn status_classification_matches_api_contract() {
        assert_eq!(status_disposition(200), StatusDisposition::Success);
        assert_eq!(status_disposition(204), StatusDisposition::Success);
        assert_eq!(status_disposition(429), StatusDisposition::Retryable);
        assert_eq!(status_disposition(500), StatusDisposition::Retryable);
        assert_eq!(status_disposition(503), StatusDisposition::Retryable);
        assert_eq!(status_disposition(400), StatusDisposition::Terminal);
        assert_eq!(status_disposition(401), StatusDisposition::Terminal);
        assert_eq!(status_disposition(404), StatusDisposition::Terminal);
    }

    #[test]
    fn payload_includes_image_reference_when_present() {
        let n = notifier();
        let payload = n.payload(&NotificationRequest {
            text: "cat!".to_string(),
            image_url: Some("https://cdn.example/captures/a.jpg".to_string()),
        });
        assert_eq!(payload["to"], "user-1");
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["type"], "text");
        assert_eq!(messages[0]["text"], "cat!");
        assert_eq!(messages[1]["type"], "image");
        assert_eq!(
            messages[1]["originalContentUrl"],
            "https://cdn.example/captures/a.jpg"
        );
    }

    #[test]
    fn payload_degrades_to_text_only() {
        let n = notifier();
        let payload = n.payload(&NotificationRequest::text_only("no image today"));
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "text");
    }

    #[test]
    fn detection_message_carries_label_and_percent() {
        let message = detection_message(&Classification {
            label: "chige".to_string(),
            confidence: 0.913,
            inference_time: Duration::from_millis(120),
        });
        assert!(message.contains("chige"));
        assert!(message.contains("91.3%"));
    }

    #[test]
    fn summary_message_lists_per_label_counts() {
        let mut daily = DailyStats::default();
        daily.per_label.insert("chige".to_string(), 5);
        daily.per_label.insert("other".to_string(), 2);
        daily.total = 7;
        daily.notified = 4;
        let stats = crate::stats::PipelineStats::new().snapshot();
        let message = summary_message(&daily, &stats);
        assert!(message.contains("chige: 5"));
        assert!(message.contains("other: 2"));
        assert!(message.contains("total: 7"));
        assert!(message.contains("notifications sent: 4"));
    }
}
