use anyhow::Result;
use chrono::Local;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Durable record of every classified image.
///
/// The per-image invocation mode restarts the process for every motion event,
/// so the in-memory counters reset constantly; this table is what the daily
/// summary and the notification-suppression check read.
pub struct DetectionHistory {
    conn: Connection,
}

/// Daily aggregate used by the summary notification.
#[derive(Clone, Debug, Default)]
pub struct DailyStats {
    pub per_label: BTreeMap<String, i64>,
    pub total: i64,
    pub notified: i64,
}

impl DetectionHistory {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let history = Self { conn };
        history.ensure_schema()?;
        Ok(history)
    }

    /// In-memory store, for tests and `--test` self-checks.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let history = Self { conn };
        history.ensure_schema()?;
        Ok(history)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              label TEXT NOT NULL,
              confidence REAL NOT NULL,
              image_path TEXT,
              notified INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_detections_label_notified_time
              ON detections(label, notified, created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_time_label
              ON detections(created_at, label);

            CREATE TABLE IF NOT EXISTS pipeline_state (
              key TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Bump the consecutive classify-failure counter and return the new
    /// count. Kept in the database because the per-image invocation mode
    /// runs one process per capture; an in-memory counter would reset on
    /// every motion event and a broken model would never cross the alert
    /// threshold.
    pub fn record_classify_failure(&self) -> Result<u32> {
        self.conn.execute(
            "INSERT INTO pipeline_state (key, value) VALUES ('classify_failures', 1)
             ON CONFLICT(key) DO UPDATE SET value = value + 1",
            [],
        )?;
        let count: u32 = self.conn.query_row(
            "SELECT value FROM pipeline_state WHERE key = 'classify_failures'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Clear the failure counter after a successful classification.
    pub fn reset_classify_failures(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM pipeline_state WHERE key = 'classify_failures'",
            [],
        )?;
        Ok(())
    }

    pub fn record(
        &self,
        label: &str,
        confidence: f32,
        image_path: Option<&str>,
        notified: bool,
    ) -> Result<()> {
        self.record_at(Local::now().timestamp(), label, confidence, image_path, notified)
    }

    fn record_at(
        &self,
        created_at: i64,
        label: &str,
        confidence: f32,
        image_path: Option<&str>,
        notified: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO detections (created_at, label, confidence, image_path, notified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![created_at, label, confidence as f64, image_path, notified],
        )?;
        Ok(())
    }

    /// True when the same label was already notified within the window.
    /// Used to keep a lingering cat from producing a notification per frame.
    pub fn recently_notified(&self, label: &str, window: Duration) -> Result<bool> {
        let cutoff = Local::now().timestamp() - window.as_secs() as i64;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections
             WHERE label = ?1 AND notified = 1 AND created_at > ?2",
            params![label, cutoff],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Aggregates for the current local day (00:00 onward).
    pub fn daily_stats(&self) -> Result<DailyStats> {
        let day_start = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| dt.and_local_timezone(Local).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);

        let mut stats = DailyStats::default();
        let mut stmt = self.conn.prepare(
            "SELECT label, COUNT(*) FROM detections
             WHERE created_at >= ?1 GROUP BY label",
        )?;
        let rows = stmt.query_map(params![day_start], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (label, count) = row?;
            stats.total += count;
            stats.per_label.insert(label, count);
        }

        stats.notified = self.conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE created_at >= ?1 AND notified = 1",
            params![day_start],
            |row| row.get(0),
        )?;
        Ok(stats)
    }
}
