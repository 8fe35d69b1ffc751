//! Configuration loading against real files on disk: layered defaults, env
//! overrides, and credentials resolved relative to the config directory.

use std::path::Path;
use std::sync::Mutex;

use catwatch::config::PipelineConfig;

// Tests in this file mutate process environment variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

struct EnvGuard {
    key: &'static str,
}

impl EnvGuard {
    fn set(key: &'static str, value: &str) -> Self {
        std::env::set_var(key, value);
        Self { key }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        std::env::remove_var(self.key);
    }
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("config.json");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn partial_config_file_keeps_defaults_for_the_rest() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"{
            "model": { "confidence_threshold": 0.9 },
            "storage": { "bucket": "evidence" }
        }"#,
    );

    let cfg = PipelineConfig::load(Some(&path)).unwrap();
    assert_eq!(cfg.model.confidence_threshold, 0.9);
    assert_eq!(cfg.model.background_label, "other");
    assert_eq!(cfg.storage.bucket, "evidence");
    assert_eq!(cfg.storage.retention_days, 7);
    assert_eq!(cfg.motion.temp_retention_days, 2);
    assert!(cfg.notify.enabled);
    assert_eq!(cfg.db_path, "catwatch.db");
}

#[test]
fn env_variables_override_file_values() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"{ "model": { "path": "models/from-file.onnx" }, "db": { "path": "file.db" } }"#,
    );

    let _model = EnvGuard::set("CATWATCH_MODEL_PATH", "stub:chige:0.9");
    let _db = EnvGuard::set("CATWATCH_DB_PATH", "/tmp/override.db");
    let _level = EnvGuard::set("CATWATCH_LOG_LEVEL", "debug");

    let cfg = PipelineConfig::load(Some(&path)).unwrap();
    assert_eq!(cfg.model.path, "stub:chige:0.9");
    assert_eq!(cfg.db_path, "/tmp/override.db");
    assert_eq!(cfg.log_level, "debug");
}

#[test]
fn config_path_can_come_from_the_environment() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), r#"{ "log": { "level": "trace" } }"#);

    let _cfg_path = EnvGuard::set("CATWATCH_CONFIG", path.to_str().unwrap());
    let cfg = PipelineConfig::load(None).unwrap();
    assert_eq!(cfg.log_level, "trace");
}

#[test]
fn credentials_resolve_relative_to_the_config_directory() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"{
            "notify": { "credentials_file": "secrets/line.json" },
            "storage": { "credentials_file": "secrets/r2.json", "bucket": "evidence" }
        }"#,
    );
    std::fs::create_dir(dir.path().join("secrets")).unwrap();
    std::fs::write(
        dir.path().join("secrets/line.json"),
        r#"{ "access_token": "tok", "recipient": "U123" }"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("secrets/r2.json"),
        r#"{ "account_id": "acct", "access_key_id": "ak", "secret_access_key": "sk" }"#,
    )
    .unwrap();

    let cfg = PipelineConfig::load(Some(&path)).unwrap();
    let notify = cfg.load_notify_credentials().unwrap();
    assert_eq!(notify.access_token, "tok");
    assert_eq!(notify.recipient, "U123");
    let storage = cfg.load_storage_credentials().unwrap();
    assert_eq!(storage.account_id, "acct");
    assert_eq!(storage.access_key_id, "ak");
}

#[test]
fn missing_credentials_file_is_an_error() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), r#"{}"#);

    let cfg = PipelineConfig::load(Some(&path)).unwrap();
    assert!(cfg.load_notify_credentials().is_err());
}

#[test]
fn invalid_threshold_is_rejected() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), r#"{ "model": { "confidence_threshold": 1.5 } }"#);
    assert!(PipelineConfig::load(Some(&path)).is_err());
}

#[test]
fn malformed_json_is_rejected_with_the_path_in_the_error() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "{ not json");
    let err = PipelineConfig::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("config.json"));
}
