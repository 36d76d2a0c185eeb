//! Postgres-backed jobs store.
//!
//! One `jobs` table keyed by label: the full record lives in a JSONB
//! column, with the handful of fields the queries need promoted to
//! real columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;
use wharf_core::StoreError;
use wharf_core::config::DbConfig;
use wharf_core::run::JobRecord;
use wharf_core::store::JobsStore;

pub struct PostgresStore {
    pool: PgPool,
}

fn backend_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn record_times(record: &JobRecord) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    match record {
        JobRecord::Pipeline(run) => (Some(run.submit_time), run.completion_time),
        JobRecord::Task(task) => (task.submit_time, task.completion_time),
    }
}

impl PostgresStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.postgres_url())
            .await
            .map_err(backend_err)?;
        let store = PostgresStore { pool };
        store.migrate().await?;
        info!(host = %config.host, db = %config.db, "Connected to postgres jobs store");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                label TEXT PRIMARY KEY,
                parent TEXT,
                status TEXT NOT NULL,
                submit_time TIMESTAMPTZ,
                completion_time TIMESTAMPTZ,
                record JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_parent_idx ON jobs (parent)")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl JobsStore for PostgresStore {
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let json =
            serde_json::to_value(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let (submit_time, completion_time) = record_times(record);

        sqlx::query(
            r#"
            INSERT INTO jobs (label, parent, status, submit_time, completion_time, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (label) DO UPDATE SET
                parent = EXCLUDED.parent,
                status = EXCLUDED.status,
                submit_time = EXCLUDED.submit_time,
                completion_time = EXCLUDED.completion_time,
                record = EXCLUDED.record
            "#,
        )
        .bind(record.label())
        .bind(record.parent())
        .bind(record.status_str())
        .bind(submit_time)
        .bind(completion_time)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, label: &str) -> Result<JobRecord, StoreError> {
        let row = sqlx::query("SELECT record FROM jobs WHERE label = $1")
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound(label.to_string()))?;

        let json: serde_json::Value = row.get("record");
        serde_json::from_value(json).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn exists(&self, label: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM jobs WHERE label = $1")
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.is_some())
    }

    async fn remove(&self, label: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE label = $1")
            .bind(label)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn parents_like(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT label FROM jobs WHERE parent IS NULL AND label LIKE '%' || $1 || '%' ORDER BY label",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(rows.iter().map(|r| r.get("label")).collect())
    }

    async fn children_like(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT label FROM jobs WHERE parent IS NOT NULL AND label LIKE '%' || $1 || '%' ORDER BY label",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(rows.iter().map(|r| r.get("label")).collect())
    }

    async fn active_pipelines(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT label FROM jobs WHERE parent IS NULL AND status IN ('SUBMITTED', 'RUNNING') ORDER BY submit_time",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(rows.iter().map(|r| r.get("label")).collect())
    }
}
