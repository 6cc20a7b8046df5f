//! Postgres-backed run state store.

use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use tracing::info;

use super::{
    run::{ConversionFlags, RunRecord, RunStatus},
    state_store::RunStateStore,
};
use crate::error::{PipelineError, Result};
use crate::types::ids::RunId;

const SELECT_COLUMNS: &str = r#"
    SELECT run_id, path, status, flags, retry_count, last_error,
           failed_from, next_attempt_at, created_at, updated_at
    FROM sequencing_runs
"#;

/// Durable run store backed by the `sequencing_runs` table.
#[derive(Clone)]
pub struct PostgresRunStateStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresRunStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresRunStateStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresRunStateStore {
    /// Connect, apply embedded migrations and verify the pool answers.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await.map_err(|e| {
            PipelineError::Store(format!("failed to connect to Postgres: {e}"))
        })?;
        Self::new(pool).await
    }

    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            PipelineError::Store(format!("run store migration failed: {e}"))
        })?;

        sqlx::query("SELECT 1").execute(&pool).await.map_err(|e| {
            PipelineError::Store(format!(
                "run store failed Postgres health check: {e}"
            ))
        })?;
        info!(target: "pipeline::store", "run store connected to Postgres");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_row(row: &PgRow) -> Result<RunRecord> {
        let run_id: String = row.try_get("run_id")?;
        let path: String = row.try_get("path")?;
        let status: String = row.try_get("status")?;
        let Json(flags): Json<ConversionFlags> = row.try_get("flags")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let failed_from: Option<String> = row.try_get("failed_from")?;

        Ok(RunRecord {
            run_id: RunId::new(run_id)?,
            path: PathBuf::from(path),
            status: status.parse()?,
            flags,
            retry_count: u16::try_from(retry_count).map_err(|_| {
                PipelineError::Store(format!(
                    "retry_count out of range: {retry_count}"
                ))
            })?,
            last_error: row.try_get("last_error")?,
            failed_from: failed_from
                .map(|value| value.parse::<RunStatus>())
                .transpose()?,
            next_attempt_at: row
                .try_get::<Option<DateTime<Utc>>, _>("next_attempt_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_rows(rows: Vec<PgRow>) -> Result<Vec<RunRecord>> {
        rows.iter().map(Self::parse_row).collect()
    }
}

#[async_trait]
impl RunStateStore for PostgresRunStateStore {
    async fn load(&self) -> Result<Vec<RunRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at, run_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Self::parse_rows(rows)
    }

    async fn upsert(&self, record: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sequencing_runs (
                run_id, path, status, flags, retry_count, last_error,
                failed_from, next_attempt_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id) DO UPDATE SET
                path = EXCLUDED.path,
                status = EXCLUDED.status,
                flags = EXCLUDED.flags,
                retry_count = EXCLUDED.retry_count,
                last_error = EXCLUDED.last_error,
                failed_from = EXCLUDED.failed_from,
                next_attempt_at = EXCLUDED.next_attempt_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.run_id.as_str())
        .bind(record.path.to_string_lossy().into_owned())
        .bind(record.status.as_str())
        .bind(Json(record.flags))
        .bind(i32::from(record.retry_count))
        .bind(record.last_error.as_deref())
        .bind(record.failed_from.map(|status| status.as_str()))
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE run_id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status NOT IN ($1, $2) ORDER BY created_at, run_id"
        );
        let rows = sqlx::query(&sql)
            .bind(RunStatus::Archived.as_str())
            .bind(RunStatus::Failed.as_str())
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(rows)
    }

    async fn list_by_status(
        &self,
        status: RunStatus,
    ) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at, run_id"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(rows)
    }
}
