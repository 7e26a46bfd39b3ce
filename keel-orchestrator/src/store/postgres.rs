//! PostgreSQL run store
//!
//! Stage results are stored as a JSONB column on the run row: a run owns
//! its stages exclusively and they are always read and written together.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::log::{LogEntry, LogLevel};
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::domain::run::{Run, RunId, RunStatus, StageResult};
use sqlx::types::Json;
use sqlx::{PgPool, postgres::PgPoolOptions};

use super::{RunStore, StoreError};

pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Connects to `database_url` and applies migrations
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_definitions (
            name VARCHAR(255) NOT NULL,
            version INTEGER NOT NULL,
            definition JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id BIGINT PRIMARY KEY,
            pipeline VARCHAR(255) NOT NULL,
            revision_id VARCHAR(255) NOT NULL,
            definition_version INTEGER NOT NULL,
            status VARCHAR(50) NOT NULL,
            requested_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            stages JSONB NOT NULL DEFAULT '[]',
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_logs (
            id BIGSERIAL PRIMARY KEY,
            run_id BIGINT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
            timestamp TIMESTAMPTZ NOT NULL,
            level VARCHAR(20) NOT NULL,
            message TEXT NOT NULL,
            stage VARCHAR(255),
            attempt INTEGER,
            duration_ms BIGINT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE SEQUENCE IF NOT EXISTS run_ids")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline, run_id DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_run_logs_run_id ON run_logs(run_id, id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn next_run_id(&self) -> Result<RunId, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT nextval('run_ids')")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as RunId)
    }

    async fn insert(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, pipeline, revision_id, definition_version, status,
                              requested_at, started_at, finished_at, stages, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id as i64)
        .bind(&run.pipeline)
        .bind(&run.revision_id)
        .bind(run.definition_version as i32)
        .bind(run.status.as_str())
        .bind(run.requested_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(Json(&run.stages))
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateRun(run.run_id));
        }
        Ok(())
    }

    async fn update(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, started_at = $3, finished_at = $4, stages = $5, error = $6
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id as i64)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(Json(&run.stages))
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run.run_id));
        }
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, pipeline, revision_id, definition_version, status,
                   requested_at, started_at, finished_at, stages, error
            FROM runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn list_by_pipeline(&self, pipeline: &str) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, pipeline, revision_id, definition_version, status,
                   requested_at, started_at, finished_at, stages, error
            FROM runs
            WHERE pipeline = $1
            ORDER BY run_id DESC
            "#,
        )
        .bind(pipeline)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn list_active(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, pipeline, revision_id, definition_version, status,
                   requested_at, started_at, finished_at, stages, error
            FROM runs
            WHERE status IN ($1, $2)
            ORDER BY run_id ASC
            "#,
        )
        .bind(RunStatus::Queued.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn append_logs(&self, run_id: RunId, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO run_logs (run_id, timestamp, level, message, stage, attempt, duration_ms)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(run_id as i64)
            .bind(entry.timestamp)
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(&entry.stage)
            .bind(entry.attempt.map(|a| a as i32))
            .bind(entry.duration_ms.map(|d| d as i64))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn logs(&self, run_id: RunId) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT timestamp, level, message, stage, attempt, duration_ms
            FROM run_logs
            WHERE run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(run_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LogEntry::from).collect())
    }

    async fn insert_definition(&self, definition: &PipelineDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_definitions (name, version, definition, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name, version) DO NOTHING
            "#,
        )
        .bind(&definition.name)
        .bind(definition.version as i32)
        .bind(Json(definition))
        .bind(definition.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn definitions(&self) -> Result<Vec<PipelineDefinition>, StoreError> {
        let rows: Vec<(Json<PipelineDefinition>,)> = sqlx::query_as(
            "SELECT definition FROM pipeline_definitions ORDER BY name, version",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(def),)| def).collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: i64,
    pipeline: String,
    revision_id: String,
    definition_version: i32,
    status: String,
    requested_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stages: Json<Vec<StageResult>>,
    error: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row.status.parse().map_err(StoreError::Corrupt)?;

        Ok(Run {
            run_id: row.run_id as RunId,
            pipeline: row.pipeline,
            revision_id: row.revision_id,
            definition_version: row.definition_version as u32,
            status,
            requested_at: row.requested_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            stages: row.stages.0,
            error: row.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: DateTime<Utc>,
    level: String,
    message: String,
    stage: Option<String>,
    attempt: Option<i32>,
    duration_ms: Option<i64>,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            timestamp: row.timestamp,
            level: row.level.parse().unwrap_or(LogLevel::Info),
            message: row.message,
            stage: row.stage,
            attempt: row.attempt.map(|a| a as u32),
            duration_ms: row.duration_ms.map(|d| d as u64),
        }
    }
}
