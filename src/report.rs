//! Daily reporting and maintenance.
//!
//! Invoked from cron once a day: sends the summary notification first, then
//! prunes the two retention tiers (local temp captures, remote evidence),
//! then optionally reboots the device. The reboot never preempts the
//! summary.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

use crate::config::PipelineConfig;
use crate::notify::{error_message, startup_message, summary_message, NotificationRequest, Notifier};
use crate::pipeline::Pipeline;

/// System notification kinds selectable from the CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemNotice {
    Startup,
    Error,
    Summary,
}

/// Send a non-detection notification through the configured notifier.
pub fn send_system_notification(pipeline: &Pipeline, notice: SystemNotice) -> Result<()> {
    let notifier = pipeline
        .notifier()
        .context("notifications are disabled, cannot send system notice")?;
    let text = match notice {
        SystemNotice::Startup => startup_message(),
        SystemNotice::Error => error_message("manual error notification requested"),
        SystemNotice::Summary => {
            let daily = pipeline.history().daily_stats()?;
            summary_message(&daily, &pipeline.stats())
        }
    };
    notifier
        .send(&NotificationRequest::text_only(text))
        .context("system notification failed")?;
    Ok(())
}

/// Delete temp captures older than `retention_days`, matched by extension.
/// Files that cannot be inspected or removed are logged and skipped.
pub fn cleanup_temp_files(dir: &Path, extensions: &[String], retention_days: u32) -> Result<usize> {
    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(retention_days) * 86_400);
    let mut removed = 0;

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read capture directory {}", dir.display()))?;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if !matches_ext {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                log::warn!("cannot stat {}: {}", path.display(), e);
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("removed expired capture {}", path.display());
                removed += 1;
            }
            Err(e) => log::warn!("failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Run the daily maintenance sequence.
///
/// Order is fixed: summary, local cleanup, remote cleanup, reboot. Cleanup
/// failures are logged but do not block later steps; the reboot command runs
/// only after the summary attempt has completed.
pub fn run_maintenance(pipeline: &Pipeline, cfg: &PipelineConfig) -> Result<()> {
    if pipeline.notifier().is_some() {
        if let Err(e) = send_system_notification(pipeline, SystemNotice::Summary) {
            log::error!("daily summary failed: {:#}", e);
        }
    } else {
        log::info!("notifications disabled, skipping daily summary");
    }

    match cleanup_temp_files(
        &cfg.motion.capture_dir,
        &cfg.motion.extensions,
        cfg.motion.temp_retention_days,
    ) {
        Ok(removed) => log::info!(
            "temp cleanup removed {} file(s) older than {} day(s)",
            removed,
            cfg.motion.temp_retention_days
        ),
        Err(e) => log::error!("temp cleanup failed: {:#}", e),
    }

    match pipeline.store() {
        Some(store) => match store.cleanup(cfg.storage.retention_days) {
            Ok(removed) => log::info!(
                "remote cleanup removed {} object(s) older than {} day(s)",
                removed,
                cfg.storage.retention_days
            ),
            Err(e) => log::error!("remote cleanup failed: {}", e),
        },
        None => log::info!("storage disabled, skipping remote cleanup"),
    }

    if let Some(command) = &cfg.reboot_command {
        log::info!("maintenance complete, running reboot command: {}", command);
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .with_context(|| format!("failed to spawn reboot command {:?}", command))?;
        if !status.success() {
            anyhow::bail!("reboot command exited with {}", status);
        }
    }
    Ok(())
}
