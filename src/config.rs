use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

const DEFAULT_MODEL_PATH: &str = "models/catwatch.onnx";
const DEFAULT_CLASS_NAMES: [&str; 3] = ["chige", "motsu", "other"];
const DEFAULT_BACKGROUND_LABEL: &str = "other";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.75;
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INPUT_SIZE: u32 = 224;
const DEFAULT_NOTIFY_API_URL: &str = "https://api.line.me/v2/bot/message/push";
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_NOTIFY_RETRY_COUNT: u32 = 3;
const DEFAULT_SUPPRESSION_MINUTES: u64 = 5;
const DEFAULT_STORAGE_RETENTION_DAYS: u32 = 7;
const DEFAULT_KEY_PREFIX: &str = "captures";
const DEFAULT_CAPTURE_DIR: &str = "captures";
const DEFAULT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const DEFAULT_TEMP_RETENTION_DAYS: u32 = 2;
const DEFAULT_MAX_FILE_SIZE_MB: u64 = 10;
const DEFAULT_DB_PATH: &str = "catwatch.db";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    model: Option<ModelConfigFile>,
    notify: Option<NotifyConfigFile>,
    storage: Option<StorageConfigFile>,
    motion: Option<MotionConfigFile>,
    db: Option<DbConfigFile>,
    log: Option<LogConfigFile>,
    maintenance: Option<MaintenanceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
    class_names: Option<Vec<String>>,
    background_label: Option<String>,
    confidence_threshold: Option<f32>,
    timeout_seconds: Option<u64>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    api_url: Option<String>,
    credentials_file: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    retry_count: Option<u32>,
    enabled: Option<bool>,
    suppression_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    credentials_file: Option<PathBuf>,
    bucket: Option<String>,
    endpoint_url: Option<String>,
    public_url_base: Option<String>,
    key_prefix: Option<String>,
    enabled: Option<bool>,
    retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    capture_dir: Option<PathBuf>,
    extensions: Option<Vec<String>>,
    temp_retention_days: Option<u32>,
    max_file_size_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DbConfigFile {
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LogConfigFile {
    level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MaintenanceConfigFile {
    reboot_command: Option<String>,
}

/// Process-wide configuration, loaded once at startup and immutable after.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory the config file was loaded from; relative credential paths
    /// resolve against it.
    pub config_dir: PathBuf,
    pub model: ModelSettings,
    pub notify: NotifySettings,
    pub storage: StorageSettings,
    pub motion: MotionSettings,
    pub db_path: String,
    pub log_level: String,
    pub reboot_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub path: String,
    pub class_names: Vec<String>,
    pub background_label: String,
    pub confidence_threshold: f32,
    pub timeout: Duration,
    pub input_width: u32,
    pub input_height: u32,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub api_url: String,
    pub credentials_file: PathBuf,
    pub timeout: Duration,
    pub retry_count: u32,
    pub enabled: bool,
    pub suppression_window: Duration,
}

impl NotifySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_secs(1))
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub credentials_file: PathBuf,
    pub bucket: String,
    /// Explicit S3-compatible endpoint. When absent it is derived from the
    /// credential file's account id (R2 layout).
    pub endpoint_url: Option<String>,
    pub public_url_base: Option<String>,
    pub key_prefix: String,
    pub enabled: bool,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub capture_dir: PathBuf,
    pub extensions: Vec<String>,
    pub temp_retention_days: u32,
    pub max_file_size: u64,
}

/// Push-API credentials, stored outside the main config file.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyCredentials {
    pub access_token: String,
    pub recipient: String,
}

/// Object-storage credentials, stored outside the main config file.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageCredentials {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl PipelineConfig {
    /// Load configuration from an explicit path, or from `CATWATCH_CONFIG`,
    /// falling back to built-in defaults when neither is set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("CATWATCH_CONFIG").ok().map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(env_path);
        let (file_cfg, config_dir) = match path {
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (read_config_file(&path)?, dir)
            }
            None => (PipelineConfigFile::default(), PathBuf::from(".")),
        };
        let mut cfg = Self::from_file(file_cfg, config_dir);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile, config_dir: PathBuf) -> Self {
        let model = file.model.unwrap_or_default();
        let notify = file.notify.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();

        Self {
            config_dir,
            model: ModelSettings {
                path: model.path.unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
                class_names: model.class_names.unwrap_or_else(|| {
                    DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect()
                }),
                background_label: model
                    .background_label
                    .unwrap_or_else(|| DEFAULT_BACKGROUND_LABEL.to_string()),
                confidence_threshold: model
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                timeout: Duration::from_secs(
                    model
                        .timeout_seconds
                        .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_SECS),
                ),
                input_width: model.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
                input_height: model.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
            },
            notify: NotifySettings {
                api_url: notify
                    .api_url
                    .unwrap_or_else(|| DEFAULT_NOTIFY_API_URL.to_string()),
                credentials_file: notify
                    .credentials_file
                    .unwrap_or_else(|| PathBuf::from("notify_credentials.json")),
                timeout: Duration::from_secs(
                    notify.timeout_seconds.unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS),
                ),
                retry_count: notify.retry_count.unwrap_or(DEFAULT_NOTIFY_RETRY_COUNT),
                enabled: notify.enabled.unwrap_or(true),
                suppression_window: Duration::from_secs(
                    notify
                        .suppression_minutes
                        .unwrap_or(DEFAULT_SUPPRESSION_MINUTES)
                        * 60,
                ),
            },
            storage: StorageSettings {
                credentials_file: storage
                    .credentials_file
                    .unwrap_or_else(|| PathBuf::from("storage_credentials.json")),
                bucket: storage.bucket.unwrap_or_default(),
                endpoint_url: storage.endpoint_url,
                public_url_base: storage.public_url_base,
                key_prefix: storage
                    .key_prefix
                    .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
                enabled: storage.enabled.unwrap_or(true),
                retention_days: storage
                    .retention_days
                    .unwrap_or(DEFAULT_STORAGE_RETENTION_DAYS),
            },
            motion: MotionSettings {
                capture_dir: motion
                    .capture_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_DIR)),
                extensions: motion.extensions.unwrap_or_else(|| {
                    DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
                }),
                temp_retention_days: motion
                    .temp_retention_days
                    .unwrap_or(DEFAULT_TEMP_RETENTION_DAYS),
                max_file_size: motion
                    .max_file_size_mb
                    .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB)
                    * 1024
                    * 1024,
            },
            db_path: file
                .db
                .and_then(|db| db.path)
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            log_level: file
                .log
                .and_then(|log| log.level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            reboot_command: file.maintenance.and_then(|m| m.reboot_command),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("CATWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model.path = path;
            }
        }
        if let Ok(dir) = std::env::var("CATWATCH_CAPTURE_DIR") {
            if !dir.trim().is_empty() {
                self.motion.capture_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("CATWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(level) = std::env::var("CATWATCH_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = level;
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.model.class_names.is_empty() {
            return Err(anyhow!("model.class_names must not be empty"));
        }
        if !self
            .model
            .class_names
            .contains(&self.model.background_label)
        {
            return Err(anyhow!(
                "model.background_label '{}' is not in model.class_names",
                self.model.background_label
            ));
        }
        if !(0.0..=1.0).contains(&self.model.confidence_threshold) {
            return Err(anyhow!(
                "model.confidence_threshold must be within [0, 1], got {}",
                self.model.confidence_threshold
            ));
        }
        if self.model.timeout.is_zero() {
            return Err(anyhow!("model.timeout_seconds must be greater than zero"));
        }
        if self.model.input_width == 0 || self.model.input_height == 0 {
            return Err(anyhow!("model input dimensions must be non-zero"));
        }
        url::Url::parse(&self.notify.api_url)
            .map_err(|e| anyhow!("notify.api_url is not a valid URL: {}", e))?;
        if let Some(base) = &self.storage.public_url_base {
            url::Url::parse(base)
                .map_err(|e| anyhow!("storage.public_url_base is not a valid URL: {}", e))?;
        }
        if let Some(endpoint) = &self.storage.endpoint_url {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow!("storage.endpoint_url is not a valid URL: {}", e))?;
        }
        if self.motion.extensions.is_empty() {
            return Err(anyhow!("motion.extensions must not be empty"));
        }
        self.motion.extensions = self
            .motion
            .extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        if self.motion.max_file_size == 0 {
            return Err(anyhow!("motion.max_file_size_mb must be greater than zero"));
        }
        Ok(())
    }

    /// Resolve a credentials path relative to the config file directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn load_notify_credentials(&self) -> Result<NotifyCredentials> {
        read_credentials(&self.resolve(&self.notify.credentials_file))
    }

    pub fn load_storage_credentials(&self) -> Result<StorageCredentials> {
        read_credentials(&self.resolve(&self.storage.credentials_file))
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
}

fn read_credentials<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read credentials file {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid credentials file {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_missing() {
        let cfg = PipelineConfig::from_file(PipelineConfigFile::default(), PathBuf::from("."));
        assert_eq!(cfg.model.class_names, vec!["chige", "motsu", "other"]);
        assert_eq!(cfg.model.background_label, "other");
        assert_eq!(cfg.model.confidence_threshold, 0.75);
        assert_eq!(cfg.notify.retry_count, 3);
        assert_eq!(cfg.notify.suppression_window.as_secs(), 300);
        assert_eq!(cfg.storage.retention_days, 7);
        assert_eq!(cfg.motion.temp_retention_days, 2);
        assert_eq!(cfg.motion.max_file_size, 10 * 1024 * 1024);
        assert_eq!(cfg.db_path, "catwatch.db");
    }

    #[test]
    fn validate_rejects_background_label_outside_class_list() {
        let mut cfg = PipelineConfig::from_file(PipelineConfigFile::default(), PathBuf::from("."));
        cfg.model.background_label = "raccoon".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut cfg = PipelineConfig::from_file(PipelineConfigFile::default(), PathBuf::from("."));
        cfg.model.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_normalizes_extensions() {
        let mut cfg = PipelineConfig::from_file(PipelineConfigFile::default(), PathBuf::from("."));
        cfg.motion.extensions = vec![".JPG".to_string(), "Png".to_string()];
        cfg.validate().unwrap();
        assert_eq!(cfg.motion.extensions, vec!["jpg", "png"]);
    }
}
