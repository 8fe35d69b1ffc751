//! bucketctl - evidence bucket administration
//!
//! Small operator tool for the storage side of the pipeline: upload a file
//! by hand, list recent evidence, run retention cleanup outside the nightly
//! maintenance window, or just check that the bucket answers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use catwatch::config::PipelineConfig;
use catwatch::store::{key_from_reference, ObjectStore, S3ObjectStore};

#[derive(Parser, Debug)]
#[command(name = "bucketctl", version, about = "Evidence bucket administration")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CATWATCH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a single image to the bucket
    Upload {
        /// Image file to upload
        #[arg(long, value_name = "FILE")]
        image: PathBuf,
    },
    /// List recent evidence objects
    List {
        /// Maximum number of objects to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete one object by key or public URL
    Delete {
        /// Object key, or the public URL from a notification
        #[arg(value_name = "KEY_OR_URL")]
        object: String,
    },
    /// Delete evidence older than the retention window
    Cleanup {
        /// Override the configured retention in days
        #[arg(long, value_name = "DAYS")]
        days: Option<u32>,
    },
    /// Show object count and total size
    Stats,
    /// Check bucket connectivity
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = PipelineConfig::load(cli.config.as_deref())?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();

    let credentials = cfg
        .load_storage_credentials()
        .context("storage credentials are required for bucket administration")?;
    let store = S3ObjectStore::new(&cfg.storage, &credentials)?;

    match cli.command {
        Command::Upload { image } => {
            let result = store.upload(&image)?;
            println!("uploaded {}", result.object_key);
            println!("public url: {}", result.public_url);
        }
        Command::List { limit } => {
            let objects = store.list(limit)?;
            if objects.is_empty() {
                println!("no evidence objects found");
            }
            for object in objects {
                println!("{}  {}", object.uploaded_at.format("%Y-%m-%d %H:%M:%S"), object.object_key);
            }
        }
        Command::Delete { object } => {
            let key = key_from_reference(&object);
            store.delete_object(&key)?;
            println!("deleted {key}");
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(cfg.storage.retention_days);
            let removed = store.cleanup(days)?;
            println!("removed {removed} object(s) older than {days} day(s)");
        }
        Command::Stats => {
            let stats = store.bucket_stats()?;
            println!("objects: {}", stats.objects);
            println!("total size: {:.2} MiB", stats.total_bytes as f64 / (1024.0 * 1024.0));
        }
        Command::Test => {
            store.test_connection()?;
            println!("bucket {} is reachable", cfg.storage.bucket);
        }
    }
    Ok(())
}
