use anyhow::{Context, Result};

use crate::metrics::AgentMetrics;
use crate::types::CycleRecord;

/// A persisted cycle as read back for reporting.
#[derive(Debug, Clone)]
pub struct StoredCycle {
    pub instance_id: String,
    pub cycle_number: i64,
    pub recorded_at: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub record: serde_json::Value,
}

/// Append-only cycle records plus a small key/value table for state that must
/// survive restarts.
#[derive(Clone)]
pub struct CycleLog {
    pub(crate) db_pool: sqlx::AnyPool,
}

impl CycleLog {
    pub fn new(db_pool: sqlx::AnyPool) -> Self {
        Self { db_pool }
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cycle_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                cycle_number INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                record_json TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cycle_records_instance
             ON cycle_records(instance_id, cycle_number)",
        )
        .execute(&self.db_pool)
        .await
        .ok();

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    pub async fn append(&self, record: &CycleRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize cycle record")?;
        sqlx::query(
            "INSERT INTO cycle_records
                (instance_id, cycle_number, recorded_at, success, error_message, record_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.instance_id)
        .bind(record.cycle_number as i64)
        .bind(record.timestamp.to_rfc3339())
        .bind(i64::from(record.success))
        .bind(record.error_message.as_deref())
        .bind(&json)
        .execute(&self.db_pool)
        .await
        .with_context(|| {
            format!(
                "Failed to persist cycle {} for {}",
                record.cycle_number, record.instance_id
            )
        })?;
        Ok(())
    }

    /// Most recent cycles for an instance, newest first.
    pub async fn recent(&self, instance_id: &str, limit: i64) -> Result<Vec<StoredCycle>> {
        let rows: Vec<(String, i64, String, i64, Option<String>, String)> = sqlx::query_as(
            "SELECT instance_id, cycle_number, recorded_at, success, error_message, record_json
             FROM cycle_records
             WHERE instance_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(instance_id)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(
                |(instance_id, cycle_number, recorded_at, success, error_message, json)| {
                    Ok(StoredCycle {
                        instance_id,
                        cycle_number,
                        recorded_at,
                        success: success != 0,
                        error_message,
                        record: serde_json::from_str(&json)
                            .context("Stored cycle record is not valid JSON")?,
                    })
                },
            )
            .collect()
    }

    /// Highest cycle number recorded for an instance, 0 when none.
    pub async fn last_cycle_number(&self, instance_id: &str) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT cycle_number FROM cycle_records
             WHERE instance_id = ?
             ORDER BY cycle_number DESC
             LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.db_pool)
        .await?;
        Ok(row.map_or(0, |(n,)| n.max(0) as u64))
    }

    pub async fn save_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn save_metrics(&self, instance_id: &str, metrics: &AgentMetrics) -> Result<()> {
        let json = metrics.to_json().to_string();
        self.save_state(&metrics_key(instance_id), &json).await
    }

    /// Restore persisted counters into `metrics`. Returns whether anything was found.
    pub async fn load_metrics(&self, instance_id: &str, metrics: &mut AgentMetrics) -> Result<bool> {
        let Some(raw) = self.load_state(&metrics_key(instance_id)).await? else {
            return Ok(false);
        };
        let json: serde_json::Value =
            serde_json::from_str(&raw).context("Persisted metrics are not valid JSON")?;
        metrics.restore_from_json(&json);
        Ok(true)
    }
}

fn metrics_key(instance_id: &str) -> String {
    format!("metrics:{}", instance_id)
}

#[cfg(test)]
pub(crate) async fn memory_log() -> CycleLog {
    sqlx::any::install_default_drivers();
    let pool = sqlx::any::AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let log = CycleLog::new(pool);
    log.init_tables().await.unwrap();
    log
}
