//! Postgres-backed checkpoint store.
//!
//! Schema lives in `migrations/0001_backfill_jobs.sql`; [`PostgresCheckpointStore::migrate`]
//! applies it idempotently.
//!
//! ## Error Mapping
//!
//! | SQLx Error | CheckpointStoreError |
//! |------------|----------------------|
//! | Database (unique violation `23505`) on job insert | `AlreadyExists` |
//! | any other | `Storage` |
//!
//! A checkpoint document that no longer decodes is reported as `Corrupt`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use backfill_core::{Checkpoint, GenerationHandle, JobId, RuntimeStatus};

use super::{CheckpointStore, CheckpointStoreError, JobRecord, decode, encode};

const SCHEMA: &str = include_str!("../../migrations/0001_backfill_jobs.sql");

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), CheckpointStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self, record, initial), fields(job_id = %record.job_id), err)]
    async fn create_job(
        &self,
        record: JobRecord,
        initial: &Checkpoint,
    ) -> Result<GenerationHandle, CheckpointStoreError> {
        let handle = GenerationHandle::initial(record.job_id);
        let document = encode(handle, initial)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("create_job", e))?;

        sqlx::query(
            r#"
            INSERT INTO backfill_jobs (
                job_id, kind, params, runtime_status, failure,
                latest_generation, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
            "#,
        )
        .bind(record.job_id.as_uuid())
        .bind(&record.kind)
        .bind(&record.params)
        .bind(record.runtime_status.as_str())
        .bind(record.failure.as_deref())
        .bind(record.created_time)
        .bind(record.last_updated_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CheckpointStoreError::AlreadyExists(record.job_id)
            } else {
                map_sqlx_error("create_job", e)
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO backfill_checkpoints (job_id, generation, checkpoint)
            VALUES ($1, 0, $2)
            "#,
        )
        .bind(record.job_id.as_uuid())
        .bind(&document)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("create_job", e))?;
        Ok(handle)
    }

    #[instrument(skip(self, checkpoint), fields(job_id = %job_id), err)]
    async fn persist(
        &self,
        job_id: JobId,
        generation: u64,
        checkpoint: &Checkpoint,
    ) -> Result<GenerationHandle, CheckpointStoreError> {
        let handle = GenerationHandle { job_id, generation };
        let document = encode(handle, checkpoint)?;
        let generation = to_i64(generation)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("persist", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE backfill_jobs
            SET latest_generation = GREATEST(latest_generation, $2),
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(generation)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("persist", e))?;
        if updated.rows_affected() == 0 {
            return Err(CheckpointStoreError::NotFound(job_id));
        }

        sqlx::query(
            r#"
            INSERT INTO backfill_checkpoints (job_id, generation, checkpoint)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id, generation)
            DO UPDATE SET checkpoint = EXCLUDED.checkpoint, created_at = NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(generation)
        .bind(&document)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("persist", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("persist", e))?;
        Ok(handle)
    }

    async fn load_latest(
        &self,
        job_id: JobId,
    ) -> Result<(GenerationHandle, Checkpoint), CheckpointStoreError> {
        let row = sqlx::query(
            r#"
            SELECT generation, checkpoint
            FROM backfill_checkpoints
            WHERE job_id = $1
            ORDER BY generation DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_latest", e))?
        .ok_or(CheckpointStoreError::NotFound(job_id))?;

        let generation: i64 = row
            .try_get("generation")
            .map_err(|e| map_sqlx_error("load_latest", e))?;
        let document: serde_json::Value = row
            .try_get("checkpoint")
            .map_err(|e| map_sqlx_error("load_latest", e))?;

        let handle = GenerationHandle {
            job_id,
            generation: generation.max(0) as u64,
        };
        Ok((handle, decode(handle, document)?))
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: RuntimeStatus,
        failure: Option<String>,
    ) -> Result<(), CheckpointStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE backfill_jobs
            SET runtime_status = $2, failure = $3, updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(failure)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        if updated.rows_affected() == 0 {
            return Err(CheckpointStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, CheckpointStoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, kind, params, runtime_status, failure,
                   latest_generation, created_at, updated_at
            FROM backfill_jobs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            Some(row) => {
                let job = JobRow::from_row(&row).map_err(|e| map_sqlx_error("get_job", e))?;
                Ok(Some(job.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn list_jobs(
        &self,
        status: Option<RuntimeStatus>,
    ) -> Result<Vec<JobRecord>, CheckpointStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, kind, params, runtime_status, failure,
                   latest_generation, created_at, updated_at
            FROM backfill_jobs
            WHERE ($1::text IS NULL OR runtime_status = $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job = JobRow::from_row(&row).map_err(|e| map_sqlx_error("list_jobs", e))?;
            jobs.push(job.try_into()?);
        }
        Ok(jobs)
    }
}

fn to_i64(generation: u64) -> Result<i64, CheckpointStoreError> {
    i64::try_from(generation)
        .map_err(|_| CheckpointStoreError::Storage(format!("generation {generation} out of range")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CheckpointStoreError {
    match err {
        sqlx::Error::Database(db_err) => CheckpointStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            CheckpointStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => CheckpointStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    job_id: uuid::Uuid,
    kind: String,
    params: serde_json::Value,
    runtime_status: String,
    failure: Option<String>,
    latest_generation: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            job_id: row.try_get("job_id")?,
            kind: row.try_get("kind")?,
            params: row.try_get("params")?,
            runtime_status: row.try_get("runtime_status")?,
            failure: row.try_get("failure")?,
            latest_generation: row.try_get("latest_generation")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CheckpointStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let runtime_status = row
            .runtime_status
            .parse()
            .map_err(|e| CheckpointStoreError::Storage(format!("job {}: {e}", row.job_id)))?;
        Ok(JobRecord {
            job_id: JobId::from_uuid(row.job_id),
            kind: row.kind,
            params: row.params,
            runtime_status,
            failure: row.failure,
            latest_generation: row.latest_generation.max(0) as u64,
            created_time: row.created_at,
            last_updated_time: row.updated_at,
        })
    }
}
