//! Job Store — durable id -> Job mapping backed by an embedded SQLite
//! database opened in write-ahead-log mode. Readers and writers operate
//! concurrently; each operation here is self-contained (no long-held
//! transactions are required).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StoreError;

use super::job::{Job, JobStatus};

/// The abstract contract callers depend on. Tests substitute
/// [`InMemoryJobStore`]; production wires up [`SqliteJobStore`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Absent is not an error — callers must check for `None` explicitly.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// `limit` clamped to [1,100] default 20; `offset` clamped to [0,∞) default 0.
    async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Job>, i64), StoreError>;

    /// Reverts every `processing` record to `queued` and returns the affected ids.
    async fn reset_processing(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn delete_terminal_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Clamp `List` pagination inputs per the store contract.
pub fn clamp_list_args(limit: i64, offset: i64) -> (i64, i64) {
    let limit = if limit <= 0 { 20 } else { limit.min(100) };
    let offset = offset.max(0);
    (limit, offset)
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub async fn connect(database_path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Constraint(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;

        Ok(Job {
            id: Uuid::parse_str(&id)
                .map_err(|e| StoreError::Constraint(format!("invalid id in row: {e}")))?,
            prompt: row.try_get("prompt")?,
            system_prompt: row.try_get("system_prompt")?,
            model: row.try_get("model")?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| StoreError::Constraint(format!("invalid status in row: {status}")))?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            callback_url: row.try_get("callback_url")?,
            metadata: metadata
                .map(|m| serde_json::from_str(&m))
                .transpose()
                .map_err(|e| StoreError::Constraint(format!("invalid metadata json: {e}")))?,
            response_format: row.try_get("response_format")?,
            created_at: parse_rfc3339(&created_at)?,
            started_at: started_at.as_deref().map(parse_rfc3339).transpose()?,
            completed_at: completed_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Constraint(format!("invalid timestamp in row: {e}")))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let metadata = job
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Constraint(e.to_string()))?;

        sqlx::query(
            "INSERT INTO jobs (id, prompt, system_prompt, model, status, result, error, \
             callback_url, metadata, response_format, created_at, started_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.prompt)
        .bind(&job.system_prompt)
        .bind(&job.model)
        .bind(job.status.as_str())
        .bind(&job.result)
        .bind(&job.error)
        .bind(&job.callback_url)
        .bind(metadata)
        .bind(&job.response_format)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Constraint(format!("job {} already exists", job.id))
            }
            _ => StoreError::Io(e),
        })?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());

        sqlx::query(
            "UPDATE jobs SET status = ?, result = ?, error = ?, completed_at = \
             COALESCE(completed_at, ?) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = 'processing', started_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Job>, i64), StoreError> {
        let (limit, offset) = clamp_list_args(limit, offset);

        let total: i64 = sqlx::query("SELECT COUNT(*) AS c FROM jobs")
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;

        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let jobs = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((jobs, total))
    }

    async fn reset_processing(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE status = 'processing'")
            .fetch_all(&self.pool)
            .await?;

        let ids = rows
            .iter()
            .map(|r| {
                let id: String = r.try_get("id")?;
                Uuid::parse_str(&id)
                    .map_err(|e| StoreError::Constraint(format!("invalid id in row: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query("UPDATE jobs SET status = 'queued', started_at = NULL WHERE status = 'processing'")
            .execute(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn delete_terminal_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') \
             AND completed_at < ?",
        )
        .bind(before.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// In-memory store double sharing [`JobStore`]'s contract, used by unit
    /// and integration tests in place of a SQLite-backed instance.
    #[derive(Default)]
    pub struct InMemoryJobStore {
        jobs: RwLock<HashMap<Uuid, Job>>,
    }

    impl InMemoryJobStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn create(&self, job: &Job) -> Result<(), StoreError> {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.id) {
                return Err(StoreError::Constraint(format!(
                    "job {} already exists",
                    job.id
                )));
            }
            jobs.insert(job.id, job.clone());
            Ok(())
        }

        async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
            Ok(self.jobs.read().await.get(&id).cloned())
        }

        async fn update_status(
            &self,
            id: Uuid,
            status: JobStatus,
            result: Option<&str>,
            error: Option<&str>,
        ) -> Result<(), StoreError> {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.status = status;
                job.result = result.map(|s| s.to_string());
                job.error = error.map(|s| s.to_string());
                if status.is_terminal() && job.completed_at.is_none() {
                    job.completed_at = Some(Utc::now());
                }
            }
            Ok(())
        }

        async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError> {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
            Ok(self.jobs.write().await.remove(&id).is_some())
        }

        async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Job>, i64), StoreError> {
            let (limit, offset) = clamp_list_args(limit, offset);
            let jobs = self.jobs.read().await;
            let mut all: Vec<Job> = jobs.values().cloned().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let total = all.len() as i64;
            let page = all
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect();
            Ok((page, total))
        }

        async fn reset_processing(&self) -> Result<Vec<Uuid>, StoreError> {
            let mut jobs = self.jobs.write().await;
            let mut ids = Vec::new();
            for job in jobs.values_mut() {
                if job.status == JobStatus::Processing {
                    ids.push(job.id);
                    job.status = JobStatus::Queued;
                    job.started_at = None;
                }
            }
            Ok(ids)
        }

        async fn delete_terminal_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
            let mut jobs = self.jobs.write().await;
            let before_ids: Vec<Uuid> = jobs
                .values()
                .filter(|j| j.status.is_terminal() && j.completed_at.map(|c| c < before).unwrap_or(false))
                .map(|j| j.id)
                .collect();
            for id in &before_ids {
                jobs.remove(id);
            }
            Ok(before_ids.len() as u64)
        }
    }
}
