//! catwatch
//!
//! Detection-to-notification pipeline for an edge camera. A motion daemon
//! drops JPEG captures on disk; `catwatch <image>` classifies each capture
//! with a small image model, decides whether it is worth telling a human
//! about, uploads the evidence to S3-compatible storage, and pushes a chat
//! notification. A cron-driven maintenance mode handles the daily summary,
//! retention cleanup, and the nightly reboot.
//!
//! # Module Structure
//!
//! - `classify`: image loading and the [`classify::Classifier`] backends
//! - `pipeline`: the per-capture orchestrator and decision policy
//! - `notify`: push notifications with retry and message formatting
//! - `store`: S3-compatible evidence storage and retention cleanup
//! - `history`: SQLite detection log and notification suppression
//! - `report`: daily summary, temp cleanup, and the reboot sequence
//! - `config`: layered JSON configuration with env overrides

pub mod classify;
pub mod config;
pub mod error;
pub mod history;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod stats;
pub mod store;

pub use crate::classify::{Classification, Classifier};
pub use crate::config::PipelineConfig;
pub use crate::error::StageError;
pub use crate::pipeline::{Pipeline, PipelineOutcome, PipelinePolicy};
