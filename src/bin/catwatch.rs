//! catwatch - capture classification daemon entry point
//!
//! Normal operation is one-shot: the motion daemon hands us a freshly saved
//! capture path and we run it through the pipeline. `--watch` runs the same
//! pipeline as a polling loop for setups without a motion hook, and the
//! remaining flags cover cron maintenance and manual diagnostics.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use catwatch::classify::{Classifier, StubClassifier};
use catwatch::config::PipelineConfig;
use catwatch::history::DetectionHistory;
use catwatch::notify::{Notifier, PushNotifier};
use catwatch::pipeline::{Pipeline, PipelinePolicy};
use catwatch::report::{self, SystemNotice};
use catwatch::store::{ObjectStore, S3ObjectStore};

#[cfg(feature = "backend-tract")]
use catwatch::classify::TractClassifier;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const WATCH_HEALTH_INTERVAL: Duration = Duration::from_secs(300);
/// Leave freshly written files alone until the motion daemon has finished
/// writing them.
const WATCH_SETTLE_TIME: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NoticeKind {
    Startup,
    Error,
    Summary,
}

impl From<NoticeKind> for SystemNotice {
    fn from(kind: NoticeKind) -> Self {
        match kind {
            NoticeKind::Startup => SystemNotice::Startup,
            NoticeKind::Error => SystemNotice::Error,
            NoticeKind::Summary => SystemNotice::Summary,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "catwatch", version, about = "Camera capture classification and notification pipeline")]
struct Cli {
    /// Capture image to classify (omit when using a mode flag)
    image: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, env = "CATWATCH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Check configuration, model, and service connectivity, then exit
    #[arg(long)]
    test: bool,

    /// Print today's detection statistics and exit
    #[arg(long)]
    stats: bool,

    /// Send a system notification and exit
    #[arg(long, value_name = "KIND")]
    notify: Option<NoticeKind>,

    /// Run daily maintenance (summary, cleanup, optional reboot) and exit
    #[arg(long)]
    maintain: bool,

    /// Watch a directory and process new captures as they appear
    #[arg(long, value_name = "DIR")]
    watch: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = PipelineConfig::load(cli.config.as_deref())?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();

    if cli.test {
        return run_self_test(&cfg);
    }
    if cli.stats {
        return print_stats(&cfg);
    }

    let mut pipeline = build_pipeline(&cfg)?;

    if let Some(kind) = cli.notify {
        return report::send_system_notification(&pipeline, kind.into());
    }
    if cli.maintain {
        return report::run_maintenance(&pipeline, &cfg);
    }
    if let Some(dir) = cli.watch {
        return watch_loop(&mut pipeline, &dir, &cfg);
    }

    let image = cli
        .image
        .ok_or_else(|| anyhow!("no image path given (see --help for modes)"))?;
    let outcome = pipeline.process(&image)?;
    log::info!(
        "done: {} {:.1}% ({})",
        outcome.classification().label,
        outcome.classification().confidence * 100.0,
        if outcome.notified() { "notified" } else { "not notified" }
    );
    Ok(())
}

fn build_pipeline(cfg: &PipelineConfig) -> Result<Pipeline> {
    let classifier = build_classifier(cfg)?;
    let notifier = build_notifier(cfg)?;
    let store = build_store(cfg);
    let history = DetectionHistory::open(&cfg.db_path)
        .with_context(|| format!("failed to open detection database {}", cfg.db_path))?;
    Ok(Pipeline::new(
        PipelinePolicy::from_config(cfg),
        classifier,
        notifier,
        store,
        history,
    ))
}

fn build_classifier(cfg: &PipelineConfig) -> Result<Box<dyn Classifier>> {
    if cfg.model.path.starts_with("stub:") {
        let stub = StubClassifier::from_spec(&cfg.model.path)?;
        log::warn!("using stub classifier {:?}, no real inference", cfg.model.path);
        return Ok(Box::new(stub));
    }

    #[cfg(feature = "backend-tract")]
    {
        let classifier = TractClassifier::new(
            &cfg.model.path,
            cfg.model.class_names.clone(),
            cfg.model.input_width,
            cfg.model.input_height,
            cfg.model.timeout,
        )?;
        return Ok(Box::new(classifier));
    }

    #[cfg(not(feature = "backend-tract"))]
    bail!(
        "model path {:?} requires the backend-tract feature; rebuild with it or use a stub: model",
        cfg.model.path
    );
}

fn build_notifier(cfg: &PipelineConfig) -> Result<Option<Box<dyn Notifier>>> {
    if !cfg.notify.enabled {
        log::info!("notifications disabled in configuration");
        return Ok(None);
    }
    let credentials = cfg
        .load_notify_credentials()
        .context("notifications are enabled but credentials could not be loaded")?;
    Ok(Some(Box::new(PushNotifier::new(&cfg.notify, &credentials))))
}

/// Storage is best-effort: missing credentials degrade to text-only
/// notifications instead of blocking detections.
fn build_store(cfg: &PipelineConfig) -> Option<Box<dyn ObjectStore>> {
    if !cfg.storage.enabled {
        log::info!("evidence storage disabled in configuration");
        return None;
    }
    let credentials = match cfg.load_storage_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            log::warn!("storage credentials unavailable, running text-only: {:#}", e);
            return None;
        }
    };
    match S3ObjectStore::new(&cfg.storage, &credentials) {
        Ok(store) => Some(Box::new(store)),
        Err(e) => {
            log::warn!("storage client setup failed, running text-only: {}", e);
            None
        }
    }
}

/// Validate the deployment without sending any notification: model loads,
/// credentials parse, bucket answers.
fn run_self_test(cfg: &PipelineConfig) -> Result<()> {
    let mut failures = 0;

    match build_classifier(cfg) {
        Ok(classifier) => println!("model: ok ({})", classifier.name()),
        Err(e) => {
            println!("model: FAILED ({e:#})");
            failures += 1;
        }
    }

    if cfg.notify.enabled {
        match cfg.load_notify_credentials() {
            Ok(_) => println!("notify credentials: ok"),
            Err(e) => {
                println!("notify credentials: FAILED ({e:#})");
                failures += 1;
            }
        }
    } else {
        println!("notify: disabled");
    }

    if cfg.storage.enabled {
        let result = cfg
            .load_storage_credentials()
            .map_err(|e| anyhow!("{e:#}"))
            .and_then(|credentials| {
                let store = S3ObjectStore::new(&cfg.storage, &credentials)?;
                store.test_connection()?;
                Ok(())
            });
        match result {
            Ok(()) => println!("storage: ok (bucket {})", cfg.storage.bucket),
            Err(e) => {
                println!("storage: FAILED ({e:#})");
                failures += 1;
            }
        }
    } else {
        println!("storage: disabled");
    }

    match DetectionHistory::open(&cfg.db_path) {
        Ok(_) => println!("database: ok ({})", cfg.db_path),
        Err(e) => {
            println!("database: FAILED ({e:#})");
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} check(s) failed");
    }
    println!("all checks passed");
    Ok(())
}

fn print_stats(cfg: &PipelineConfig) -> Result<()> {
    let history = DetectionHistory::open(&cfg.db_path)?;
    let daily = history.daily_stats()?;
    println!("detections today: {}", daily.total);
    println!("notifications today: {}", daily.notified);
    for (label, count) in &daily.per_label {
        println!("  {label}: {count}");
    }
    Ok(())
}

fn watch_loop(pipeline: &mut Pipeline, dir: &Path, cfg: &PipelineConfig) -> Result<()> {
    if !dir.is_dir() {
        bail!("watch directory {} does not exist", dir.display());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }

    // Captures already on disk at startup belong to a previous run.
    let mut seen: HashSet<PathBuf> = list_captures(dir, &cfg.motion.extensions)?
        .into_iter()
        .map(|(path, _)| path)
        .collect();
    log::info!(
        "watching {} ({} existing capture(s) ignored)",
        dir.display(),
        seen.len()
    );

    let mut last_health = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        let captures = list_captures(dir, &cfg.motion.extensions)?;
        // Temp-file cleanup deletes old captures out from under us; drop
        // their entries so the set stays bounded on a long-running watch.
        prune_seen(&mut seen, &captures);
        for (path, modified) in captures {
            if seen.contains(&path) {
                continue;
            }
            let settled = SystemTime::now()
                .duration_since(modified)
                .map(|age| age >= WATCH_SETTLE_TIME)
                .unwrap_or(false);
            if !settled {
                continue;
            }
            seen.insert(path.clone());
            if let Err(e) = pipeline.process(&path) {
                log::error!("failed to process {}: {:#}", path.display(), e);
            }
        }

        if last_health.elapsed() >= WATCH_HEALTH_INTERVAL {
            let snapshot = pipeline.stats();
            log::info!(
                "watch alive: {} processed, {} detections, {} notified, {} errors over {:.1}h",
                snapshot.total_processed,
                snapshot.successful_detections,
                snapshot.notifications_sent,
                snapshot.errors,
                snapshot.uptime_hours()
            );
            last_health = Instant::now();
        }
        std::thread::sleep(WATCH_POLL_INTERVAL);
    }

    log::info!("shutdown requested, exiting watch loop");
    Ok(())
}

/// Drop seen entries whose files are gone from the directory.
fn prune_seen(seen: &mut HashSet<PathBuf>, current: &[(PathBuf, SystemTime)]) {
    let live: HashSet<&Path> = current.iter().map(|(path, _)| path.as_path()).collect();
    seen.retain(|path| live.contains(path.as_path()));
}

fn list_captures(dir: &Path, extensions: &[String]) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut captures = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read watch directory {}", dir.display()))?
    {
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
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                log::warn!("cannot stat {}: {}", path.display(), e);
                continue;
            }
        };
        captures.push((path, modified));
    }
    Ok(captures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_seen_drops_deleted_captures_only() {
        let kept = PathBuf::from("/captures/kept.jpg");
        let deleted = PathBuf::from("/captures/deleted.jpg");
        let mut seen: HashSet<PathBuf> = [kept.clone(), deleted].into_iter().collect();

        let current = vec![(kept.clone(), SystemTime::now())];
        prune_seen(&mut seen, &current);

        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&kept));
    }

    #[test]
    fn prune_seen_empties_when_directory_is_cleared() {
        let mut seen: HashSet<PathBuf> =
            [PathBuf::from("/captures/a.jpg"), PathBuf::from("/captures/b.jpg")]
                .into_iter()
                .collect();
        prune_seen(&mut seen, &[]);
        assert!(seen.is_empty());
    }
}
